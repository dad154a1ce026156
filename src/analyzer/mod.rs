//! # Analyzer
//!
//! Rule batches run to fixed point over a freshly compiled IR graph:
//! source relation binding, expression typing, operator relation
//! propagation, compile-time range folding, filter verification, and the
//! metadata resolution pipeline.
//!
//! Every rule either strictly decreases the number of unresolved entities or
//! makes no change, so each batch terminates; the executor's iteration cap
//! backstops that argument.

use crate::compiler::error::{CompilerError, CompilerResult};
use crate::compiler::metadata::METADATA_COLUMN_PREFIX;
use crate::compiler::CompilerState;
use crate::ir::{
    ColumnExpr, ExpressionKind, IrGraph, IrNodeKind, NodeId, OperatorKind,
};
use crate::pattern::{self, matches};
use crate::rules::{Rule, RuleBatch, RuleExecutor};
use crate::types::{DataType, Relation};
use crate::udf::RegistryKey;
use regex::Regex;
use tracing::debug;

/// Run the full analyzer over a compiled graph with the default iteration
/// cap.
pub fn analyze(graph: &mut IrGraph, state: &CompilerState<'_>) -> CompilerResult<()> {
    analyze_with_cap(graph, state, crate::rules::DEFAULT_MAX_ITERATIONS)
}

/// Run the analyzer with a configured fixed-point iteration cap.
pub fn analyze_with_cap(
    graph: &mut IrGraph,
    state: &CompilerState<'_>,
    max_iterations: u64,
) -> CompilerResult<()> {
    let mut executor = RuleExecutor::with_max_iterations(max_iterations);

    executor.add_batch(
        RuleBatch::new("sources_and_ranges")
            .add_rule(Box::new(SourceRelationRule { state }))
            .add_rule(Box::new(RangeArgExpressionRule { state })),
    );
    executor.add_batch(
        RuleBatch::new("typing")
            .add_rule(Box::new(ResolveMetadataRule { state }))
            .add_rule(Box::new(DataTypeRule { state }))
            .add_rule(Box::new(OperatorRelationRule))
            .add_rule(Box::new(MetadataFunctionFormatRule { state })),
    );
    executor.add_batch(
        RuleBatch::new("verification")
            .add_rule(Box::new(VerifyFilterExpressionRule))
            .add_rule(Box::new(CheckMetadataColumnNamingRule)),
    );
    executor.add_batch(
        RuleBatch::new("convert_metadata")
            .add_rule(Box::new(MetadataResolverConversionRule { state })),
    );
    executor.add_batch(
        RuleBatch::new("post_convert_typing")
            .add_rule(Box::new(DataTypeRule { state }))
            .add_rule(Box::new(OperatorRelationRule)),
    );

    executor.execute(graph)?;
    validate(graph)?;
    debug!("analysis complete");
    Ok(())
}

/// Post-analysis validation: no unresolved expression or operator remains.
fn validate(graph: &IrGraph) -> CompilerResult<()> {
    for id in graph.node_ids() {
        if let Ok(op) = graph.operator(id) {
            if !op.is_relation_init() {
                return Err(CompilerError::TypeMismatch {
                    loc: graph.loc(id),
                    msg: format!(
                        "could not infer the output relation of {:?}",
                        op.kind.kind()
                    ),
                });
            }
        } else if let Ok(expr) = graph.expression(id) {
            if !expr.is_resolved() {
                return Err(CompilerError::TypeMismatch {
                    loc: graph.loc(id),
                    msg: format!("could not infer the type of {:?}", expr.kind.kind()),
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// SourceRelationRule
// ============================================================================

/// Binds the relations of memory and UDTF sources and materializes the
/// source's column nodes.
pub struct SourceRelationRule<'a, 'r> {
    pub state: &'a CompilerState<'r>,
}

impl Rule for SourceRelationRule<'_, '_> {
    fn name(&self) -> &'static str {
        "SourceRelationRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if !matches(graph, node, &pattern::unresolved_source()) {
            return Ok(false);
        }
        let loc = graph.loc(node);
        match graph.operator(node)?.kind.clone() {
            OperatorKind::MemorySource { table, select, .. } => {
                let table_relation = self
                    .state
                    .relation_map()
                    .get(&table)
                    .cloned()
                    .ok_or_else(|| CompilerError::InvalidArgument {
                        loc,
                        msg: format!("Table '{}' not found", table),
                    })?;

                let mut relation = Relation::new();
                let columns: Vec<String> = match &select {
                    None => table_relation.col_names().iter().map(|s| s.to_string()).collect(),
                    Some(names) => {
                        let missing: Vec<&String> = names
                            .iter()
                            .filter(|n| !table_relation.has_column(n))
                            .collect();
                        if !missing.is_empty() {
                            return Err(CompilerError::InvalidColumn {
                                loc,
                                msg: format!(
                                    "columns {:?} are missing in table '{}'",
                                    missing, table
                                ),
                            });
                        }
                        names.clone()
                    }
                };
                for name in &columns {
                    relation.add_column(name, table_relation.col_type(name).unwrap())?;
                }

                // Materialize resolved column nodes for the selection.
                let mut column_ids = Vec::with_capacity(columns.len());
                for name in &columns {
                    let idx = table_relation.col_index(name).unwrap();
                    let dtype = table_relation.col_type(name).unwrap();
                    let col = graph.create_column(name);
                    if let ExpressionKind::Column { parent_op, index, .. } =
                        &mut graph.expression_mut(col)?.kind
                    {
                        *parent_op = Some(node);
                        *index = Some(idx);
                    }
                    graph.expression_mut(col)?.dtype = dtype;
                    graph.connect_expression(node, col)?;
                    column_ids.push(col);
                }

                let op = graph.operator_mut(node)?;
                if let OperatorKind::MemorySource { column_ids: ids, .. } = &mut op.kind {
                    *ids = column_ids;
                }
                op.relation = Some(relation);
                Ok(true)
            }
            OperatorKind::UdtfSource { name, .. } => {
                let spec = self.state.registry().get_udtf(&name).ok_or_else(|| {
                    CompilerError::NoSuchFunction { loc, name: name.clone(), arg_types: vec![] }
                })?;
                graph.operator_mut(node)?.relation = Some(spec.relation.clone());
                Ok(true)
            }
            // GRPC sources get their relations from the distributed planner.
            _ => Ok(false),
        }
    }
}

// ============================================================================
// DataTypeRule
// ============================================================================

/// Resolves expression types bottom-up: functions against the registry
/// (UDA registry inside aggregates), columns and metadata against the parent
/// operator's relation.
pub struct DataTypeRule<'a, 'r> {
    pub state: &'a CompilerState<'r>,
}

impl DataTypeRule<'_, '_> {
    fn evaluate_func(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let loc = graph.loc(node);
        let (name, args) = match &graph.expression(node)?.kind {
            ExpressionKind::Func { name, args, .. } => (name.clone(), args.clone()),
            _ => return Ok(false),
        };
        let arg_types: Vec<DataType> = args
            .iter()
            .map(|&a| graph.expression(a).map(|e| e.dtype))
            .collect::<Result<_, _>>()?;

        let container = graph.containing_op(node);
        let in_agg = container
            .map(|op| graph.kind(op) == Ok(IrNodeKind::BlockingAgg))
            .unwrap_or(false);

        let (id, out_type) = if in_agg {
            let def = self
                .state
                .registry()
                .get_uda(&name, &arg_types)
                .ok_or_else(|| CompilerError::NoSuchFunction {
                    loc,
                    name: name.clone(),
                    arg_types: arg_types.clone(),
                })?;
            let id = self.state.uda_id(RegistryKey::new(&name, arg_types.clone()));
            (id, def.finalize_type)
        } else {
            let def = self
                .state
                .registry()
                .get_udf(&name, &arg_types)
                .ok_or_else(|| CompilerError::NoSuchFunction {
                    loc,
                    name: name.clone(),
                    arg_types: arg_types.clone(),
                })?;
            let id = self.state.udf_id(RegistryKey::new(&name, arg_types.clone()));
            (id, def.return_type)
        };

        let expr = graph.expression_mut(node)?;
        if let ExpressionKind::Func { udf_id, arg_types: stored, .. } = &mut expr.kind {
            *udf_id = Some(id);
            *stored = arg_types;
        }
        expr.dtype = out_type;
        Ok(true)
    }

    fn evaluate_column(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let loc = graph.loc(node);
        let lookup_names: Vec<String> = match &graph.expression(node)?.kind {
            ExpressionKind::Column { name, .. } => vec![name.clone()],
            ExpressionKind::Metadata { property, alias, .. } => {
                let mut names = Vec::new();
                if let Some(a) = alias {
                    names.push(a.clone());
                }
                names.push(format!("{}{}", METADATA_COLUMN_PREFIX, property));
                names
            }
            _ => return Ok(false),
        };

        let container = match graph.containing_op(node) {
            Some(op) => op,
            None => return Ok(false),
        };
        let parents = graph.operator(container)?.parents.clone();
        if parents.is_empty() {
            return Err(CompilerError::InvalidColumn {
                loc,
                msg: format!(
                    "operator {:?} has no parent; cannot resolve column '{}'",
                    graph.kind(container)?,
                    lookup_names[0]
                ),
            });
        }

        let mut all_initialized = true;
        for parent in &parents {
            let parent_op = graph.operator(*parent)?;
            let relation = match &parent_op.relation {
                Some(r) => r,
                None => {
                    all_initialized = false;
                    continue;
                }
            };
            for lookup in &lookup_names {
                if let Some(idx) = relation.col_index(lookup) {
                    let dtype = relation.col_type_at(idx).unwrap();
                    let parent = *parent;
                    let expr = graph.expression_mut(node)?;
                    match &mut expr.kind {
                        ExpressionKind::Column { parent_op, index, .. }
                        | ExpressionKind::Metadata { parent_op, index, .. } => {
                            *parent_op = Some(parent);
                            *index = Some(idx);
                        }
                        _ => unreachable!(),
                    }
                    expr.dtype = dtype;
                    return Ok(true);
                }
            }
        }

        if all_initialized {
            // Metadata columns may still be waiting on resolver insertion.
            if matches!(graph.expression(node)?.kind, ExpressionKind::Metadata { .. }) {
                return Ok(false);
            }
            return Err(CompilerError::InvalidColumn {
                loc,
                msg: format!(
                    "column '{}' not found in the relation of any parent of {:?}",
                    lookup_names[0],
                    graph.kind(container)?
                ),
            });
        }
        Ok(false)
    }
}

impl Rule for DataTypeRule<'_, '_> {
    fn name(&self) -> &'static str {
        "DataTypeRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if matches(
            graph,
            node,
            &pattern::and(
                pattern::and(pattern::kind(IrNodeKind::Func), pattern::unresolved_expr()),
                pattern::func_all_args(pattern::resolved_expr()),
            ),
        ) {
            return self.evaluate_func(graph, node);
        }
        if matches(
            graph,
            node,
            &pattern::and(pattern::kind(IrNodeKind::Column), pattern::unresolved_expr()),
        ) {
            return self.evaluate_column(graph, node);
        }
        // Metadata columns resolve once their resolver (or aliased parent
        // column) is in place.
        if matches(
            graph,
            node,
            &pattern::and(pattern::kind(IrNodeKind::Metadata), pattern::unresolved_expr()),
        ) {
            let attached = matches!(
                graph.expression(node)?.kind,
                ExpressionKind::Metadata { parent_op: Some(_), .. }
            );
            if attached || graph.containing_op(node).is_some() {
                return self.evaluate_column(graph, node);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// OperatorRelationRule
// ============================================================================

/// Sets operator relations once their expressions (and parents) are ready.
pub struct OperatorRelationRule;

impl OperatorRelationRule {
    fn set_blocking_agg(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let (groups, agg_exprs) = match &graph.operator(node)?.kind {
            OperatorKind::BlockingAgg { groups, agg_exprs, .. } => {
                (groups.clone(), agg_exprs.clone())
            }
            _ => return Ok(false),
        };
        let mut relation = Relation::new();
        for g in &groups {
            let expr = graph.expression(*g)?;
            if !expr.is_resolved() {
                return Ok(false);
            }
            let name = match &expr.kind {
                ExpressionKind::Column { name, .. } => name.clone(),
                ExpressionKind::Metadata { property, alias, .. } => alias
                    .clone()
                    .unwrap_or_else(|| format!("{}{}", METADATA_COLUMN_PREFIX, property)),
                _ => {
                    return Err(CompilerError::InvalidArgument {
                        loc: graph.loc(*g),
                        msg: "group keys must be columns".to_string(),
                    })
                }
            };
            relation.add_column(&name, expr.dtype)?;
        }
        for ce in &agg_exprs {
            let expr = graph.expression(ce.expr)?;
            if !expr.is_resolved() {
                return Ok(false);
            }
            relation.add_column(&ce.name, expr.dtype)?;
        }
        graph.operator_mut(node)?.relation = Some(relation);
        Ok(true)
    }

    /// Expand `keep_input_columns` / `exclude_columns` into explicit column
    /// expressions once the parent relation is known.
    fn expand_map(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let parent = graph.operator(node)?.parents[0];
        let parent_relation = match graph.operator(parent)?.relation.clone() {
            Some(r) => r,
            None => return Ok(false),
        };
        let (col_exprs, exclude) = match &graph.operator(node)?.kind {
            OperatorKind::Map { col_exprs, exclude_columns, .. } => {
                (col_exprs.clone(), exclude_columns.clone())
            }
            _ => return Ok(false),
        };

        let overridden: Vec<&str> = col_exprs.iter().map(|c| c.name.as_str()).collect();
        let mut expanded = Vec::new();
        for (name, dtype) in parent_relation.iter() {
            if overridden.contains(&name) || exclude.iter().any(|e| e == name) {
                continue;
            }
            let col = graph.create_column(name);
            let idx = parent_relation.col_index(name).unwrap();
            if let ExpressionKind::Column { parent_op, index, .. } =
                &mut graph.expression_mut(col)?.kind
            {
                *parent_op = Some(parent);
                *index = Some(idx);
            }
            graph.expression_mut(col)?.dtype = dtype;
            graph.connect_expression(node, col)?;
            expanded.push(ColumnExpr { name: name.to_string(), expr: col });
        }
        expanded.extend(col_exprs);

        if let OperatorKind::Map { col_exprs, keep_input_columns, exclude_columns } =
            &mut graph.operator_mut(node)?.kind
        {
            *col_exprs = expanded;
            *keep_input_columns = false;
            exclude_columns.clear();
        }
        Ok(true)
    }

    fn set_map(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let (col_exprs, keep) = match &graph.operator(node)?.kind {
            OperatorKind::Map { col_exprs, keep_input_columns, .. } => {
                (col_exprs.clone(), *keep_input_columns)
            }
            _ => return Ok(false),
        };
        if keep {
            return self.expand_map(graph, node);
        }
        let mut relation = Relation::new();
        for ce in &col_exprs {
            let expr = graph.expression(ce.expr)?;
            if !expr.is_resolved() {
                return Ok(false);
            }
            relation.add_column(&ce.name, expr.dtype)?;
        }
        graph.operator_mut(node)?.relation = Some(relation);
        Ok(true)
    }

    fn set_metadata_resolver(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let parent = graph.operator(node)?.parents[0];
        let parent_relation = match graph.operator(parent)?.relation.clone() {
            Some(r) => r,
            None => return Ok(false),
        };
        let properties = match &graph.operator(node)?.kind {
            OperatorKind::MetadataResolver { properties } => properties.clone(),
            _ => return Ok(false),
        };
        let mut relation = parent_relation;
        for p in &properties {
            let repr = format!("{}{}", METADATA_COLUMN_PREFIX, p);
            if relation.has_column(&repr) {
                continue;
            }
            relation.add_column(&repr, DataType::String)?;
        }
        graph.operator_mut(node)?.relation = Some(relation);
        Ok(true)
    }

    fn set_join(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let loc = graph.loc(node);
        let parents = graph.operator(node)?.parents.clone();
        let mut relations = Vec::with_capacity(parents.len());
        for p in &parents {
            match graph.operator(*p)?.relation.clone() {
                Some(r) => relations.push(r),
                None => return Ok(false),
            }
        }
        let (left_on, right_on, suffixes) = match &graph.operator(node)?.kind {
            OperatorKind::Join { left_on, right_on, suffixes, .. } => {
                (left_on.clone(), right_on.clone(), suffixes.clone())
            }
            _ => return Ok(false),
        };

        let mut equality = Vec::with_capacity(left_on.len());
        for (l, r) in left_on.iter().zip(right_on.iter()) {
            let li = relations[0].col_index(l).ok_or_else(|| CompilerError::InvalidColumn {
                loc,
                msg: format!("join key '{}' not found in the left relation", l),
            })?;
            let ri = relations[1].col_index(r).ok_or_else(|| CompilerError::InvalidColumn {
                loc,
                msg: format!("join key '{}' not found in the right relation", r),
            })?;
            equality.push((li, ri));
        }

        // Output: all left columns, then all right; duplicated names are
        // disambiguated by suffix.
        let mut relation = Relation::new();
        let mut output = Vec::new();
        let sides = [&relations[0], &relations[1]];
        let suffix = [&suffixes.0, &suffixes.1];
        for (side, rel) in sides.iter().enumerate() {
            for (idx, (name, dtype)) in rel.iter().enumerate() {
                let duplicated = sides[1 - side].has_column(name);
                let out_name = if duplicated {
                    format!("{}{}", name, suffix[side])
                } else {
                    name.to_string()
                };
                relation
                    .add_column(&out_name, dtype)
                    .map_err(|_| CompilerError::InvalidColumn {
                        loc,
                        msg: format!(
                            "join output column '{}' collides after suffixing",
                            out_name
                        ),
                    })?;
                output.push(crate::ir::JoinOutputColumn { side, index: idx, name: out_name });
            }
        }
        if relation.is_empty() {
            return Err(CompilerError::InvalidColumn {
                loc,
                msg: "join produces no output columns".to_string(),
            });
        }

        let op = graph.operator_mut(node)?;
        if let OperatorKind::Join { equality_conditions, output_columns, .. } = &mut op.kind {
            *equality_conditions = equality;
            *output_columns = output;
        }
        op.relation = Some(relation);
        Ok(true)
    }

    fn set_union(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let loc = graph.loc(node);
        let parents = graph.operator(node)?.parents.clone();
        let mut relations = Vec::with_capacity(parents.len());
        for p in &parents {
            match graph.operator(*p)?.relation.clone() {
                Some(r) => relations.push(r),
                None => return Ok(false),
            }
        }
        for r in &relations[1..] {
            if r != &relations[0] {
                return Err(CompilerError::TypeMismatch {
                    loc,
                    msg: format!(
                        "union inputs disagree: {} vs {}",
                        relations[0], r
                    ),
                });
            }
        }
        graph.operator_mut(node)?.relation = Some(relations[0].clone());
        Ok(true)
    }

    fn set_other(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let parent = graph.operator(node)?.parents[0];
        let relation = match graph.operator(parent)?.relation.clone() {
            Some(r) => r,
            None => return Ok(false),
        };
        graph.operator_mut(node)?.relation = Some(relation);
        Ok(true)
    }
}

impl Rule for OperatorRelationRule {
    fn name(&self) -> &'static str {
        "OperatorRelationRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if !graph.is_operator(node) || graph.operator(node)?.is_relation_init() {
            return Ok(false);
        }
        match graph.kind(node)? {
            IrNodeKind::BlockingAgg => self.set_blocking_agg(graph, node),
            IrNodeKind::Map => self.set_map(graph, node),
            IrNodeKind::MetadataResolver => self.set_metadata_resolver(graph, node),
            IrNodeKind::Join => self.set_join(graph, node),
            IrNodeKind::Union => self.set_union(graph, node),
            // GRPC sources and groups get relations from the planner.
            IrNodeKind::GrpcSource | IrNodeKind::GrpcSourceGroup => Ok(false),
            _ => {
                if matches(graph, node, &pattern::unresolved_ready_op()) {
                    self.set_other(graph, node)
                } else {
                    Ok(false)
                }
            }
        }
    }
}

// ============================================================================
// RangeArgExpressionRule
// ============================================================================

/// Folds `MemorySource` time-window arguments at compile time: integer
/// arithmetic, `now()`, the duration constructors, and `"-30s"`-style
/// strings evaluated against the compiler's `time_now`.
pub struct RangeArgExpressionRule<'a, 'r> {
    pub state: &'a CompilerState<'r>,
}

impl RangeArgExpressionRule<'_, '_> {
    fn eval(&self, graph: &IrGraph, node: NodeId) -> CompilerResult<i64> {
        let loc = graph.loc(node);
        match &graph.expression(node)?.kind {
            ExpressionKind::Int(v) => Ok(*v),
            ExpressionKind::Time(v) => Ok(*v),
            ExpressionKind::Str(s) => {
                let delta = parse_duration(s).ok_or_else(|| CompilerError::InvalidArgument {
                    loc,
                    msg: format!("'{}' is not a valid time expression", s),
                })?;
                Ok(self.state.time_now() + delta)
            }
            ExpressionKind::Func { name, args, .. } => {
                if !pattern::COMPILE_TIME_FUNCS.contains(&name.as_str()) {
                    return Err(CompilerError::InvalidArgument {
                        loc,
                        msg: format!("'{}' cannot be evaluated at compile time", name),
                    });
                }
                let values: Vec<i64> = args
                    .iter()
                    .map(|&a| self.eval(graph, a))
                    .collect::<CompilerResult<_>>()?;
                self.eval_func(name, &values, loc)
            }
            other => Err(CompilerError::InvalidArgument {
                loc,
                msg: format!(
                    "expected an integer, time expression, or time string, not {:?}",
                    other.kind()
                ),
            }),
        }
    }

    fn eval_func(
        &self,
        name: &str,
        args: &[i64],
        loc: crate::ast::SourceLocation,
    ) -> CompilerResult<i64> {
        let unary = |args: &[i64]| -> CompilerResult<i64> {
            if args.len() != 1 {
                return Err(CompilerError::InvalidArgument {
                    loc,
                    msg: format!("expected 1 argument to {} call, got {}", name, args.len()),
                });
            }
            Ok(args[0])
        };
        match name {
            "now" => Ok(self.state.time_now()),
            "seconds" => Ok(unary(args)? * 1_000_000_000),
            "minutes" => Ok(unary(args)? * 60 * 1_000_000_000),
            "hours" => Ok(unary(args)? * 3_600 * 1_000_000_000),
            "days" => Ok(unary(args)? * 86_400 * 1_000_000_000),
            "milliseconds" => Ok(unary(args)? * 1_000_000),
            "microseconds" => Ok(unary(args)? * 1_000),
            "add" | "subtract" | "multiply" => {
                if args.len() != 2 {
                    return Err(CompilerError::InvalidArgument {
                        loc,
                        msg: format!("expected 2 arguments to {} call, got {}", name, args.len()),
                    });
                }
                Ok(match name {
                    "add" => args[0] + args[1],
                    "subtract" => args[0] - args[1],
                    _ => args[0] * args[1],
                })
            }
            // Division stays out of the compile-time set on purpose.
            other => Err(CompilerError::InvalidArgument {
                loc,
                msg: format!("only [multiply, add, subtract] are allowed, not {}", other),
            }),
        }
    }

    fn fold_bound(
        &self,
        graph: &mut IrGraph,
        source: NodeId,
        bound: NodeId,
    ) -> CompilerResult<NodeId> {
        let value = self.eval(graph, bound)?;
        graph.delete_edge(source, bound)?;
        graph.delete_expression_subtree(bound)?;
        let folded = graph.create_int(value);
        graph.connect_expression(source, folded)?;
        Ok(folded)
    }
}

impl Rule for RangeArgExpressionRule<'_, '_> {
    fn name(&self) -> &'static str {
        "RangeArgExpressionRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let (start, stop) = match graph.operator(node) {
            Ok(op) => match &op.kind {
                OperatorKind::MemorySource {
                    start_time, stop_time, time_start_ns, time_stop_ns, ..
                } => (
                    (*start_time).filter(|_| time_start_ns.is_none()),
                    (*stop_time).filter(|_| time_stop_ns.is_none()),
                ),
                _ => return Ok(false),
            },
            Err(_) => return Ok(false),
        };
        if start.is_none() && stop.is_none() {
            return Ok(false);
        }

        let mut folded_start = None;
        let mut folded_stop = None;
        if let Some(b) = start {
            let id = self.fold_bound(graph, node, b)?;
            folded_start = Some((id, match graph.expression(id)?.kind {
                ExpressionKind::Int(v) => v,
                _ => unreachable!(),
            }));
        }
        if let Some(b) = stop {
            let id = self.fold_bound(graph, node, b)?;
            folded_stop = Some((id, match graph.expression(id)?.kind {
                ExpressionKind::Int(v) => v,
                _ => unreachable!(),
            }));
        }

        if let OperatorKind::MemorySource {
            start_time, stop_time, time_start_ns, time_stop_ns, ..
        } = &mut graph.operator_mut(node)?.kind
        {
            if let Some((id, v)) = folded_start {
                *start_time = Some(id);
                *time_start_ns = Some(v);
            }
            if let Some((id, v)) = folded_stop {
                *stop_time = Some(id);
                *time_stop_ns = Some(v);
            }
        }
        Ok(true)
    }
}

/// Parse duration strings like `"-30s"`, `"5m"`, `"-2h"` into nanoseconds.
fn parse_duration(s: &str) -> Option<i64> {
    let re = Regex::new(r"^(-?\d+)(ns|us|ms|s|m|h|d)$").expect("static regex");
    let caps = re.captures(s)?;
    let value: i64 = caps[1].parse().ok()?;
    let scale = match &caps[2] {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        _ => 86_400 * 1_000_000_000,
    };
    Some(value * scale)
}

// ============================================================================
// VerifyFilterExpressionRule
// ============================================================================

/// Filter predicates must resolve to BOOLEAN.
pub struct VerifyFilterExpressionRule;

impl Rule for VerifyFilterExpressionRule {
    fn name(&self) -> &'static str {
        "VerifyFilterExpressionRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if let Ok(OperatorKind::Filter { predicate }) = graph.operator(node).map(|o| &o.kind) {
            let dtype = graph.expression(*predicate)?.dtype;
            if dtype != DataType::Boolean {
                return Err(CompilerError::TypeMismatch {
                    loc: graph.loc(node),
                    msg: format!("expected BOOLEAN for filter expression, got {}", dtype),
                });
            }
        }
        Ok(false)
    }
}

// ============================================================================
// ResolveMetadataRule
// ============================================================================

/// Attaches metadata expressions to a `MetadataResolver`, inserting one
/// between the consumer and its parent when the parent cannot already
/// provide the column.
pub struct ResolveMetadataRule<'a, 'r> {
    pub state: &'a CompilerState<'r>,
}

impl Rule for ResolveMetadataRule<'_, '_> {
    fn name(&self) -> &'static str {
        "ResolveMetadataRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let loc = graph.loc(node);
        let (property, alias) = match graph.expression(node) {
            Ok(expr) => match &expr.kind {
                ExpressionKind::Metadata { parent_op: Some(_), .. } => return Ok(false),
                ExpressionKind::Metadata { property, alias, .. } => {
                    (property.clone(), alias.clone())
                }
                _ => return Ok(false),
            },
            Err(_) => return Ok(false),
        };

        if !self.state.metadata().has_property(&property) {
            return Err(CompilerError::InvalidArgument {
                loc,
                msg: format!("metadata property '{}' is not properly handled", property),
            });
        }

        let container = match graph.containing_op(node) {
            Some(op) => op,
            None => return Ok(false),
        };
        let parents = graph.operator(container)?.parents.clone();
        if parents.is_empty() {
            return Err(CompilerError::InvalidColumn {
                loc,
                msg: format!(
                    "operator {:?} has no parent; cannot resolve metadata '{}'",
                    graph.kind(container)?,
                    property
                ),
            });
        }
        let parent = parents[0];

        // An existing resolver parent absorbs the property.
        if graph.kind(parent)? == IrNodeKind::MetadataResolver {
            if let OperatorKind::MetadataResolver { properties } =
                &mut graph.operator_mut(parent)?.kind
            {
                if !properties.contains(&property) {
                    properties.push(property);
                }
            }
            self.attach(graph, node, parent)?;
            return Ok(true);
        }

        // If the parent already carries the column (via an alias map or an
        // earlier resolver), just attach to it.
        if let Some(relation) = &graph.operator(parent)?.relation {
            let repr = format!("{}{}", METADATA_COLUMN_PREFIX, property);
            let has = alias
                .as_ref()
                .map(|a| relation.has_column(a))
                .unwrap_or(false)
                || relation.has_column(&repr);
            if has {
                self.attach(graph, node, parent)?;
                return Ok(true);
            }
        } else {
            // Wait for the parent's relation before deciding.
            return Ok(false);
        }

        // Insert a resolver between the consumer and its parent.
        let resolver = graph.create_operator(OperatorKind::MetadataResolver {
            properties: vec![property],
        });
        graph.set_loc(resolver, loc);
        graph.add_parent(resolver, parent)?;
        graph.replace_parent(container, parent, resolver)?;
        self.attach(graph, node, resolver)?;
        Ok(true)
    }
}

impl ResolveMetadataRule<'_, '_> {
    fn attach(&self, graph: &mut IrGraph, node: NodeId, parent: NodeId) -> CompilerResult<()> {
        if let ExpressionKind::Metadata { parent_op, .. } = &mut graph.expression_mut(node)?.kind {
            *parent_op = Some(parent);
        }
        Ok(())
    }
}

// ============================================================================
// MetadataFunctionFormatRule
// ============================================================================

/// Rewrites `equals(metadata, literal)` so the literal is wrapped as a typed
/// `MetadataLiteral` matching the property's format.
pub struct MetadataFunctionFormatRule<'a, 'r> {
    pub state: &'a CompilerState<'r>,
}

impl Rule for MetadataFunctionFormatRule<'_, '_> {
    fn name(&self) -> &'static str {
        "MetadataFunctionFormatRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        use pattern::{equals, kind};
        let loc = graph.loc(node);

        // Already wrapped: nothing to do.
        if matches(
            graph,
            node,
            &equals(kind(IrNodeKind::Metadata), kind(IrNodeKind::MetadataLiteral)),
        ) {
            return Ok(false);
        }

        if matches(graph, node, &equals(kind(IrNodeKind::Metadata), kind(IrNodeKind::Str))) {
            let args = match &graph.expression(node)?.kind {
                ExpressionKind::Func { args, .. } => args.clone(),
                _ => return Ok(false),
            };
            let (update_idx, literal, metadata) =
                if graph.kind(args[1])? == IrNodeKind::Metadata {
                    (0usize, args[0], args[1])
                } else {
                    (1usize, args[1], args[0])
                };

            let property_name = match &graph.expression(metadata)?.kind {
                ExpressionKind::Metadata { property, .. } => property.clone(),
                _ => return Ok(false),
            };
            let property = self
                .state
                .metadata()
                .property(&property_name)
                .ok_or_else(|| CompilerError::InvalidArgument {
                    loc,
                    msg: format!("metadata property '{}' is not properly handled", property_name),
                })?;
            if !property.expr_fits_format(graph, literal) {
                return Err(CompilerError::FormatMismatch {
                    loc,
                    msg: format!(
                        "literal is not formatted properly for a metadata comparison; expected {}",
                        property.explain_format()
                    ),
                });
            }

            let dtype = graph.expression(literal)?.dtype;
            graph.delete_edge(node, literal)?;
            let wrapped = graph.create_metadata_literal(literal, dtype)?;
            graph.set_loc(wrapped, loc);
            graph.add_edge(node, wrapped)?;
            if let ExpressionKind::Func { args, .. } = &mut graph.expression_mut(node)?.kind {
                args[update_idx] = wrapped;
            }
            return Ok(true);
        }

        // Any other function over metadata is unsupported.
        if matches(graph, node, &pattern::func_any_arg(kind(IrNodeKind::Metadata))) {
            let (name, others) = match &graph.expression(node)?.kind {
                ExpressionKind::Func { name, args, .. } => {
                    let others: Vec<String> = args
                        .iter()
                        .filter(|&&a| graph.kind(a) != Ok(IrNodeKind::Metadata))
                        .map(|&a| format!("{:?}", graph.kind(a).unwrap_or(IrNodeKind::Func)))
                        .collect();
                    (name.clone(), others)
                }
                _ => return Ok(false),
            };
            return Err(CompilerError::UnsupportedOperator {
                loc,
                msg: format!(
                    "function '{}' with a metadata argument in conjunction with [{}] is not supported",
                    name,
                    others.join(",")
                ),
            });
        }
        Ok(false)
    }
}

// ============================================================================
// CheckMetadataColumnNamingRule
// ============================================================================

/// User-defined columns may not use the reserved metadata prefix.
pub struct CheckMetadataColumnNamingRule;

impl Rule for CheckMetadataColumnNamingRule {
    fn name(&self) -> &'static str {
        "CheckMetadataColumnNamingRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        let loc = graph.loc(node);
        let entries: Vec<ColumnExpr> = match graph.operator(node).map(|o| &o.kind) {
            Ok(OperatorKind::Map { col_exprs, .. }) => col_exprs.clone(),
            Ok(OperatorKind::BlockingAgg { agg_exprs, .. }) => agg_exprs.clone(),
            _ => return Ok(false),
        };
        for entry in entries {
            if !entry.name.starts_with(METADATA_COLUMN_PREFIX) {
                continue;
            }
            // A straight copy of an already-derived column keeps its name;
            // only user-authored columns are held to the naming rule.
            let is_propagated_copy = match graph.expression(entry.expr).map(|e| &e.kind) {
                Ok(ExpressionKind::Column { name, .. }) => *name == entry.name,
                Ok(ExpressionKind::Metadata { property, .. }) => {
                    format!("{}{}", METADATA_COLUMN_PREFIX, property) == entry.name
                }
                _ => false,
            };
            if !is_propagated_copy {
                return Err(CompilerError::InvalidColumn {
                    loc,
                    msg: format!(
                        "column name '{}' violates naming rules; the '{}' prefix is reserved for internal use",
                        entry.name, METADATA_COLUMN_PREFIX
                    ),
                });
            }
        }
        Ok(false)
    }
}

// ============================================================================
// MetadataResolverConversionRule
// ============================================================================

/// Replaces each `MetadataResolver` with a `Map` that copies the parent
/// columns and appends the conversion UDF calls. A map that would only copy
/// is elided together with the resolver.
pub struct MetadataResolverConversionRule<'a, 'r> {
    pub state: &'a CompilerState<'r>,
}

impl MetadataResolverConversionRule<'_, '_> {
    fn build_col_exprs(
        &self,
        graph: &mut IrGraph,
        resolver: NodeId,
        parent: NodeId,
    ) -> CompilerResult<(Vec<ColumnExpr>, bool)> {
        let loc = graph.loc(resolver);
        let parent_relation = graph.operator(parent)?.relation.clone().ok_or_else(|| {
            CompilerError::TypeMismatch {
                loc,
                msg: "metadata resolver parent has no relation".to_string(),
            }
        })?;
        let properties = match &graph.operator(resolver)?.kind {
            OperatorKind::MetadataResolver { properties } => properties.clone(),
            _ => unreachable!(),
        };

        let mut col_exprs = Vec::new();
        let mut only_copies = true;
        for (idx, (name, dtype)) in parent_relation.iter().enumerate() {
            let col = graph.create_column(name);
            if let ExpressionKind::Column { parent_op, index, .. } =
                &mut graph.expression_mut(col)?.kind
            {
                *parent_op = Some(parent);
                *index = Some(idx);
            }
            graph.expression_mut(col)?.dtype = dtype;
            col_exprs.push(ColumnExpr { name: name.to_string(), expr: col });
        }

        for prop_name in &properties {
            let property = self
                .state
                .metadata()
                .property(prop_name)
                .cloned()
                .ok_or_else(|| CompilerError::InvalidArgument {
                    loc,
                    msg: format!("metadata property '{}' is not properly handled", prop_name),
                })?;
            if parent_relation.has_column(&property.column_repr()) {
                continue;
            }
            let key_column = property
                .key_columns
                .iter()
                .find(|k| parent_relation.has_column(k))
                .cloned()
                .ok_or_else(|| CompilerError::InvalidColumn {
                    loc,
                    msg: format!(
                        "can't resolve metadata '{}': need one of [{}]; parent has [{}]",
                        prop_name,
                        property.key_columns.join(","),
                        parent_relation.col_names().join(",")
                    ),
                })?;

            let key_idx = parent_relation.col_index(&key_column).unwrap();
            let key_type = parent_relation.col_type_at(key_idx).unwrap();
            let key_col = graph.create_column(&key_column);
            if let ExpressionKind::Column { parent_op, index, .. } =
                &mut graph.expression_mut(key_col)?.kind
            {
                *parent_op = Some(parent);
                *index = Some(key_idx);
            }
            graph.expression_mut(key_col)?.dtype = key_type;

            let udf_name = property.udf_name(&key_column);
            let def = self
                .state
                .registry()
                .get_udf(&udf_name, &[key_type])
                .ok_or_else(|| CompilerError::NoSuchFunction {
                    loc,
                    name: udf_name.clone(),
                    arg_types: vec![key_type],
                })?;
            let func = graph.create_func(&udf_name, vec![key_col])?;
            graph.set_loc(func, loc);
            let udf_id = self.state.udf_id(RegistryKey::new(&udf_name, vec![key_type]));
            let expr = graph.expression_mut(func)?;
            if let ExpressionKind::Func { udf_id: stored, arg_types, .. } = &mut expr.kind {
                *stored = Some(udf_id);
                *arg_types = vec![key_type];
            }
            expr.dtype = def.return_type;
            col_exprs.push(ColumnExpr { name: property.column_repr(), expr: func });
            only_copies = false;
        }
        Ok((col_exprs, only_copies))
    }

    fn discard_exprs(&self, graph: &mut IrGraph, col_exprs: &[ColumnExpr]) -> CompilerResult<()> {
        for ce in col_exprs {
            graph.delete_expression_subtree(ce.expr)?;
        }
        Ok(())
    }

    /// Remove a resolver whose conversion map would only copy: connect its
    /// children straight to its parent.
    fn remove_resolver(&self, graph: &mut IrGraph, resolver: NodeId, parent: NodeId) -> CompilerResult<()> {
        let children: Vec<NodeId> = graph
            .dependencies_of(resolver)
            .into_iter()
            .filter(|&c| graph.is_operator(c))
            .collect();
        for child in children {
            graph.replace_parent(child, resolver, parent)?;
        }
        self.repoint_columns(graph, resolver, parent)?;
        graph.remove_parent(resolver, parent)?;
        graph.delete_node(resolver)?;
        Ok(())
    }

    /// Swap the resolver for the conversion map.
    fn swap_in_map(
        &self,
        graph: &mut IrGraph,
        resolver: NodeId,
        parent: NodeId,
        col_exprs: Vec<ColumnExpr>,
    ) -> CompilerResult<()> {
        let relation = graph.operator(resolver)?.relation.clone();

        // The transient lambda bundles the named expressions, exactly long
        // enough to hand them to the map.
        let lambda = graph.create_expression(
            ExpressionKind::Lambda { col_exprs: col_exprs.clone() },
            DataType::Unknown,
        );
        let map = graph.create_operator(OperatorKind::Map {
            col_exprs: match &graph.expression(lambda)?.kind {
                ExpressionKind::Lambda { col_exprs } => col_exprs.clone(),
                _ => unreachable!(),
            },
            keep_input_columns: false,
            exclude_columns: vec![],
        });
        graph.delete_node(lambda)?;
        graph.set_loc(map, graph.loc(resolver));
        graph.add_parent(map, parent)?;
        for ce in &col_exprs {
            graph.connect_expression(map, ce.expr)?;
        }
        graph.operator_mut(map)?.relation = relation;

        let children: Vec<NodeId> = graph
            .dependencies_of(resolver)
            .into_iter()
            .filter(|&c| graph.is_operator(c))
            .collect();
        for child in children {
            graph.replace_parent(child, resolver, map)?;
        }
        self.repoint_columns(graph, resolver, map)?;
        graph.remove_parent(resolver, parent)?;
        graph.delete_node(resolver)?;
        Ok(())
    }

    /// Columns resolved against the resolver now resolve against `target`.
    fn repoint_columns(&self, graph: &mut IrGraph, resolver: NodeId, target: NodeId) -> CompilerResult<()> {
        for id in graph.node_ids() {
            if let Ok(expr) = graph.expression_mut(id) {
                match &mut expr.kind {
                    ExpressionKind::Column { parent_op, .. }
                    | ExpressionKind::Metadata { parent_op, .. } => {
                        if *parent_op == Some(resolver) {
                            *parent_op = Some(target);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl Rule for MetadataResolverConversionRule<'_, '_> {
    fn name(&self) -> &'static str {
        "MetadataResolverConversionRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if graph.kind(node) != Ok(IrNodeKind::MetadataResolver) {
            return Ok(false);
        }
        let parent = graph.operator(node)?.parents[0];
        let (col_exprs, only_copies) = self.build_col_exprs(graph, node, parent)?;
        if only_copies {
            self.discard_exprs(graph, &col_exprs)?;
            self.remove_resolver(graph, node, parent)?;
        } else {
            self.swap_in_map(graph, node, parent, col_exprs)?;
        }
        Ok(true)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::*;
    use crate::compiler::compile_ast;
    use crate::udf::Registry;
    use std::collections::HashMap;

    fn relation_map() -> HashMap<String, Relation> {
        let mut map = HashMap::new();
        map.insert(
            "t".to_string(),
            Relation::from_columns(vec![
                ("time_", DataType::Time64Ns),
                ("cpu", DataType::Int64),
                ("upid", DataType::Uint128),
            ]),
        );
        map.insert(
            "http_events".to_string(),
            Relation::from_columns(vec![
                ("time_", DataType::Time64Ns),
                ("upid", DataType::Uint128),
                ("latency_ns", DataType::Int64),
            ]),
        );
        map
    }

    fn compile_and_analyze(module: &crate::ast::AstModule, time_now: i64) -> (IrGraph, CompilerResult<()>) {
        let registry = Registry::with_builtins();
        let state = CompilerState::new(&registry, relation_map(), time_now);
        let mut graph = IrGraph::new();
        compile_ast(module, &state, &mut graph).unwrap();
        let result = analyze(&mut graph, &state);
        (graph, result)
    }

    fn display_script(stmts: Vec<crate::ast::AstStmt>) -> crate::ast::AstModule {
        let mut body = stmts;
        body.push(expr_stmt(call(name("display"), vec![name("df")], vec![])));
        module(body)
    }

    #[test]
    fn test_source_relation_select_all() {
        let m = display_script(vec![assign(
            name("df"),
            call(name("DataFrame"), vec![str_lit("t")], vec![]),
        )]);
        let (graph, result) = compile_and_analyze(&m, 0);
        result.unwrap();

        let src = graph.find_nodes_of_kind(IrNodeKind::MemorySource)[0];
        let rel = graph.operator(src).unwrap().relation().clone();
        assert_eq!(rel.col_names(), vec!["time_", "cpu", "upid"]);

        // Sink inherits the relation.
        let sink = graph.find_nodes_of_kind(IrNodeKind::MemorySink)[0];
        assert_eq!(graph.operator(sink).unwrap().relation(), &rel);
    }

    #[test]
    fn test_source_relation_select_subset() {
        let m = display_script(vec![assign(
            name("df"),
            call(
                name("DataFrame"),
                vec![str_lit("t")],
                vec![("select", list(vec![str_lit("cpu")]))],
            ),
        )]);
        let (graph, result) = compile_and_analyze(&m, 0);
        result.unwrap();
        let src = graph.find_nodes_of_kind(IrNodeKind::MemorySource)[0];
        assert_eq!(graph.operator(src).unwrap().relation().col_names(), vec!["cpu"]);
    }

    #[test]
    fn test_missing_table_errors() {
        let m = display_script(vec![assign(
            name("df"),
            call(name("DataFrame"), vec![str_lit("nope")], vec![]),
        )]);
        let (_, result) = compile_and_analyze(&m, 0);
        assert!(matches!(result.unwrap_err(), CompilerError::InvalidArgument { .. }));
    }

    #[test]
    fn test_filter_predicate_types() {
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                subscript(name("df"), eq(subscript(name("df"), str_lit("cpu")), int_lit(10))),
            ),
        ]);
        let (graph, result) = compile_and_analyze(&m, 0);
        result.unwrap();

        let filter = graph.find_nodes_of_kind(IrNodeKind::Filter)[0];
        let pred = match &graph.operator(filter).unwrap().kind {
            OperatorKind::Filter { predicate } => *predicate,
            _ => unreachable!(),
        };
        assert_eq!(graph.expression(pred).unwrap().dtype, DataType::Boolean);
        // Func id assigned.
        match &graph.expression(pred).unwrap().kind {
            ExpressionKind::Func { udf_id, arg_types, .. } => {
                assert!(udf_id.is_some());
                assert_eq!(arg_types, &vec![DataType::Int64, DataType::Int64]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_non_boolean_filter_errors() {
        // df[df['cpu'] + 1]: the predicate is INT64, not BOOLEAN.
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                subscript(
                    name("df"),
                    binop(
                        crate::ast::BinOpKind::Add,
                        subscript(name("df"), str_lit("cpu")),
                        int_lit(1),
                    ),
                ),
            ),
        ]);
        let (_, result) = compile_and_analyze(&m, 0);
        assert!(matches!(result.unwrap_err(), CompilerError::TypeMismatch { .. }));
    }

    #[test]
    fn test_agg_resolves_uda() {
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                call(
                    attribute(
                        call(attribute(name("df"), "groupby"), vec![str_lit("upid")], vec![]),
                        "agg",
                    ),
                    vec![],
                    vec![("n", tuple(vec![str_lit("cpu"), name("count")]))],
                ),
            ),
        ]);
        let (graph, result) = compile_and_analyze(&m, 0);
        result.unwrap();

        let agg = graph.find_nodes_of_kind(IrNodeKind::BlockingAgg)[0];
        let rel = graph.operator(agg).unwrap().relation().clone();
        assert_eq!(rel.col_names(), vec!["upid", "n"]);
        assert_eq!(rel.col_type("n"), Some(DataType::Int64));
    }

    #[test]
    fn test_range_folding_string() {
        // Scenario: DataFrame('t', start_time='-30s') with
        // time_now = 1_000_000_000_000.
        let m = display_script(vec![assign(
            name("df"),
            call(name("DataFrame"), vec![str_lit("t")], vec![("start_time", str_lit("-30s"))]),
        )]);
        let (graph, result) = compile_and_analyze(&m, 1_000_000_000_000);
        result.unwrap();

        let src = graph.find_nodes_of_kind(IrNodeKind::MemorySource)[0];
        match &graph.operator(src).unwrap().kind {
            OperatorKind::MemorySource { time_start_ns, start_time, .. } => {
                assert_eq!(*time_start_ns, Some(1_000_000_000_000 - 30_000_000_000));
                // Folded into an Int IR node.
                let id = start_time.unwrap();
                assert_eq!(
                    graph.expression(id).unwrap().kind,
                    ExpressionKind::Int(970_000_000_000)
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_range_folding_now_minus_seconds() {
        // start_time = now() - seconds(30)
        let m = display_script(vec![assign(
            name("df"),
            call(
                name("DataFrame"),
                vec![str_lit("t")],
                vec![(
                    "start_time",
                    binop(
                        crate::ast::BinOpKind::Sub,
                        call(name("now"), vec![], vec![]),
                        call(name("seconds"), vec![int_lit(30)], vec![]),
                    ),
                )],
            ),
        )]);
        let (graph, result) = compile_and_analyze(&m, 1_000_000_000_000);
        result.unwrap();
        let src = graph.find_nodes_of_kind(IrNodeKind::MemorySource)[0];
        match &graph.operator(src).unwrap().kind {
            OperatorKind::MemorySource { time_start_ns, .. } => {
                assert_eq!(*time_start_ns, Some(970_000_000_000));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_metadata_pipeline() {
        // Scenario: df['svc'] = df.ctx['service']; df = df[df['svc']=='checkout']
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("http_events")], vec![])),
            assign(
                subscript(name("df"), str_lit("svc")),
                subscript(attribute(name("df"), "ctx"), str_lit("service")),
            ),
            assign(
                name("df"),
                subscript(name("df"), eq(subscript(name("df"), str_lit("svc")), str_lit("checkout"))),
            ),
        ]);
        let (graph, result) = compile_and_analyze(&m, 0);
        result.unwrap();

        // The resolver has been converted away.
        assert!(graph.find_nodes_of_kind(IrNodeKind::MetadataResolver).is_empty());

        // A conversion map sits between the source and the user map: it
        // carries the upid_to_service_name call.
        let mut conversion_found = false;
        for map in graph.find_nodes_of_kind(IrNodeKind::Map) {
            if let OperatorKind::Map { col_exprs, .. } = &graph.operator(map).unwrap().kind {
                for ce in col_exprs {
                    if let Ok(expr) = graph.expression(ce.expr) {
                        if let ExpressionKind::Func { name, .. } = &expr.kind {
                            if name == "upid_to_service_name" {
                                conversion_found = true;
                            }
                        }
                    }
                }
            }
        }
        assert!(conversion_found, "conversion UDF call not found in any map");

        // Filter predicate is boolean and its literal is wrapped.
        let filter = graph.find_nodes_of_kind(IrNodeKind::Filter)[0];
        let pred = match &graph.operator(filter).unwrap().kind {
            OperatorKind::Filter { predicate } => *predicate,
            _ => unreachable!(),
        };
        assert_eq!(graph.expression(pred).unwrap().dtype, DataType::Boolean);
        assert_eq!(graph.find_nodes_of_kind(IrNodeKind::MetadataLiteral).len(), 1);
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                subscript(name("df"), str_lit("_attr_sneaky")),
                subscript(name("df"), str_lit("cpu")),
            ),
        ]);
        let (_, result) = compile_and_analyze(&m, 0);
        assert!(matches!(result.unwrap_err(), CompilerError::InvalidColumn { .. }));
    }

    #[test]
    fn test_join_suffix_disambiguation() {
        let m = display_script(vec![
            assign(name("a"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(name("b"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                call(
                    attribute(name("a"), "merge"),
                    vec![name("b")],
                    vec![("left_on", str_lit("upid"))],
                ),
            ),
        ]);
        let (graph, result) = compile_and_analyze(&m, 0);
        result.unwrap();

        let join = graph.find_nodes_of_kind(IrNodeKind::Join)[0];
        let rel = graph.operator(join).unwrap().relation().clone();
        assert_eq!(
            rel.col_names(),
            vec!["time__x", "cpu_x", "upid_x", "time__y", "cpu_y", "upid_y"]
        );
        match &graph.operator(join).unwrap().kind {
            OperatorKind::Join { equality_conditions, .. } => {
                assert_eq!(equality_conditions, &vec![(2, 2)]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_analyzer_idempotent() {
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("http_events")], vec![])),
            assign(
                subscript(name("df"), str_lit("svc")),
                subscript(attribute(name("df"), "ctx"), str_lit("service")),
            ),
        ]);
        let registry = Registry::with_builtins();
        let state = CompilerState::new(&registry, relation_map(), 0);
        let mut graph = IrGraph::new();
        compile_ast(&m, &state, &mut graph).unwrap();
        analyze(&mut graph, &state).unwrap();
        let once = graph.clone();
        analyze(&mut graph, &state).unwrap();
        assert_eq!(once.debug_string(), graph.debug_string());
    }

    #[test]
    fn test_unknown_column_errors() {
        let m = display_script(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                subscript(name("df"), eq(subscript(name("df"), str_lit("nope")), int_lit(1))),
            ),
        ]);
        let (_, result) = compile_and_analyze(&m, 0);
        assert!(matches!(result.unwrap_err(), CompilerError::InvalidColumn { .. }));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("-30s"), Some(-30_000_000_000));
        assert_eq!(parse_duration("5m"), Some(300_000_000_000));
        assert_eq!(parse_duration("2h"), Some(7_200_000_000_000));
        assert_eq!(parse_duration("10ms"), Some(10_000_000));
        assert_eq!(parse_duration("bogus"), None);
    }
}
