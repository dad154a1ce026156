//! # Compiler Front End
//!
//! Walks the AST delivered by the external parser and materializes IR
//! operators and expressions, resolving names against a lexically scoped
//! variable table.
//!
//! ```text
//! AST (Module/Statements) -> [AstVisitor] -> IrGraph + VarTable -> Analyzer
//! ```
//!
//! The dataframe surface (`DataFrame`, subscripts, `groupby`/`agg`, `merge`,
//! `display`, ...) is implemented as builtin function objects dispatched by
//! the visitor; user-defined functions capture their defining scope and are
//! evaluated at call time.

pub mod error;
pub mod metadata;
pub mod objects;
pub mod state;
pub mod var_table;

pub use error::{CompilerError, CompilerResult};
pub use metadata::{MetadataHandler, MetadataProperty, METADATA_COLUMN_PREFIX};
pub use state::CompilerState;
pub use var_table::{VarTable, VarTableRef};

use crate::ast::{
    AstExpr, AstExprKind, AstModule, AstStmt, BinOpKind, BoolOpKind, CompareOpKind, SourceLocation,
    UnaryOpKind,
};
use crate::ir::{ColumnExpr, ExpressionKind, IrGraph, IrNodeKind, JoinType, NodeId, OperatorKind};
use objects::{Builtin, FuncKind, FuncObject, FuncParam, ModuleObject, ParamDefault, QLObject};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Compile a parsed module into IR rooted in `graph`. Returns the top-level
/// variable table.
pub fn compile_ast(
    module: &AstModule,
    state: &CompilerState<'_>,
    graph: &mut IrGraph,
) -> CompilerResult<VarTableRef> {
    let mut visitor = AstVisitor::new(graph, state);
    visitor.process_module(module)?;
    debug!(
        operators = visitor.graph.operators().len(),
        "compiled module into IR"
    );
    Ok(visitor.var_table)
}

struct BoundArgs {
    values: HashMap<String, QLObject>,
    /// Keyword arguments beyond the declared parameters, in call order.
    extra_kwargs: Vec<(String, QLObject)>,
}

pub struct AstVisitor<'g, 'r> {
    graph: &'g mut IrGraph,
    state: &'g CompilerState<'r>,
    var_table: VarTableRef,
    /// Per-operator record of columns assigned from metadata expressions, so
    /// that later subscripts through the alias still read as metadata.
    metadata_aliases: HashMap<NodeId, HashMap<String, String>>,
}

impl<'g, 'r> AstVisitor<'g, 'r> {
    pub fn new(graph: &'g mut IrGraph, state: &'g CompilerState<'r>) -> Self {
        let mut visitor = AstVisitor {
            graph,
            state,
            var_table: VarTable::create(),
            metadata_aliases: HashMap::new(),
        };
        visitor.init_globals();
        visitor
    }

    /// Install the builtin globals: dataframe constructors, display, the
    /// compile-time time functions, aggregate references, and registered
    /// UDTF constructors.
    fn init_globals(&mut self) {
        let mut globals: Vec<(String, QLObject)> = Vec::new();

        globals.push((
            "DataFrame".to_string(),
            QLObject::Func(FuncObject::builtin(
                "DataFrame",
                vec![
                    FuncParam::required("table"),
                    FuncParam::optional("select", QLObject::None),
                    FuncParam::optional("start_time", QLObject::None),
                    FuncParam::optional("end_time", QLObject::None),
                ],
                Builtin::DataFrame,
            )),
        ));
        globals.push((
            "display".to_string(),
            QLObject::Func(FuncObject::builtin(
                "display",
                vec![
                    FuncParam::required("df"),
                    FuncParam::optional("name", QLObject::None),
                ],
                Builtin::Display,
            )),
        ));
        globals.push((
            "now".to_string(),
            QLObject::Func(FuncObject::builtin("now", vec![], Builtin::CompileTimeFn("now"))),
        ));
        for unit in ["seconds", "minutes", "hours", "days", "milliseconds", "microseconds"] {
            globals.push((
                unit.to_string(),
                QLObject::Func(FuncObject::builtin(
                    unit,
                    vec![FuncParam::required("value")],
                    Builtin::CompileTimeFn(match unit {
                        "seconds" => "seconds",
                        "minutes" => "minutes",
                        "hours" => "hours",
                        "days" => "days",
                        "milliseconds" => "milliseconds",
                        _ => "microseconds",
                    }),
                )),
            ));
        }
        for agg in ["count", "sum", "mean", "min", "max"] {
            globals.push((
                agg.to_string(),
                QLObject::Func(FuncObject::builtin(agg, vec![], Builtin::UdaRef(agg.to_string()))),
            ));
        }
        for udtf_name in self.state.registry().udtf_names() {
            if let Some(spec) = self.state.registry().get_udtf(udtf_name) {
                let params = spec
                    .args
                    .iter()
                    .map(|a| {
                        if a.required {
                            FuncParam::required(&a.name)
                        } else {
                            FuncParam::kw_optional(&a.name, QLObject::None)
                        }
                    })
                    .collect();
                let udtf_name = spec.name.clone();
                globals.push((
                    udtf_name.clone(),
                    QLObject::Func(FuncObject::builtin(&udtf_name, params, Builtin::Udtf(spec))),
                ));
            }
        }

        // Everything is also reachable under the `plc` module namespace.
        let module = ModuleObject::new("plc", globals.iter().cloned().collect());
        let mut table = self.var_table.borrow_mut();
        for (name, obj) in globals.iter() {
            table.add(name, obj.clone());
        }
        table.add("plc", QLObject::Module(Rc::new(module)));
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn process_module(&mut self, module: &AstModule) -> CompilerResult<()> {
        for stmt in &module.body {
            self.process_stmt(stmt, false)?;
        }
        Ok(())
    }

    fn process_stmt(&mut self, stmt: &AstStmt, in_function: bool) -> CompilerResult<()> {
        match stmt {
            AstStmt::Expression { expr } => {
                // Evaluate for effect; the result is discarded.
                self.process(expr)?;
                Ok(())
            }
            AstStmt::Assign { target, value, loc } => self.process_assign(target, value, *loc),
            AstStmt::FunctionDef { name, params, body, .. } => {
                let func_params = params
                    .iter()
                    .map(|p| FuncParam {
                        name: p.name.clone(),
                        annotation: p.annotation.clone(),
                        default: p.default.clone().map(ParamDefault::Ast),
                        kwonly: p.kwonly,
                    })
                    .collect();
                let obj = QLObject::Func(Rc::new(FuncObject {
                    name: name.clone(),
                    params: func_params,
                    accepts_arbitrary_kwargs: false,
                    receiver: None,
                    kind: FuncKind::UserDefined {
                        body: body.clone(),
                        closure: Rc::clone(&self.var_table),
                    },
                }));
                self.var_table.borrow_mut().add(name, obj);
                Ok(())
            }
            AstStmt::Return { loc, .. } => {
                if in_function {
                    // Handled by the function-call evaluator; reaching here
                    // means a return nested where we do not support it.
                    return Err(CompilerError::ParseError {
                        loc: *loc,
                        msg: "'return' must be a top-level statement of a function body".to_string(),
                    });
                }
                Err(CompilerError::ParseError {
                    loc: *loc,
                    msg: "'return' outside of a function body".to_string(),
                })
            }
        }
    }

    fn process_assign(
        &mut self,
        target: &AstExpr,
        value: &AstExpr,
        loc: SourceLocation,
    ) -> CompilerResult<()> {
        match &target.kind {
            AstExprKind::Name(name) => {
                let obj = self.process(value)?;
                self.var_table.borrow_mut().add(name, obj);
                Ok(())
            }
            AstExprKind::Subscript { value: recv, index } => {
                let col_name = match &index.kind {
                    AstExprKind::Str(s) => s.clone(),
                    _ => {
                        return Err(CompilerError::InvalidArgument {
                            loc,
                            msg: "subscript assignment requires a string column name".to_string(),
                        })
                    }
                };
                self.process_map_assignment(recv, &col_name, value, loc)
            }
            AstExprKind::Attribute { value: recv, attr } => {
                self.process_map_assignment(recv, attr, value, loc)
            }
            _ => Err(CompilerError::InvalidArgument {
                loc,
                msg: "assignment target must be a name, subscript, or attribute".to_string(),
            }),
        }
    }

    /// `df['x'] = expr` / `df.x = expr`: append (or override) a column by
    /// inserting a Map that keeps the input columns, then rebind the name.
    fn process_map_assignment(
        &mut self,
        recv: &AstExpr,
        col_name: &str,
        value: &AstExpr,
        loc: SourceLocation,
    ) -> CompilerResult<()> {
        let df_name = match &recv.kind {
            AstExprKind::Name(n) => n.clone(),
            _ => {
                return Err(CompilerError::InvalidArgument {
                    loc,
                    msg: "column assignment target must be a named dataframe".to_string(),
                })
            }
        };
        let df_obj = self.lookup(&df_name, loc)?;
        let parent_op = self.expect_dataframe(&df_obj, loc)?;

        let value_obj = self.process(value)?;
        let expr_id = self.expect_expr(&value_obj, loc)?;

        let map = self.graph.create_operator(OperatorKind::Map {
            col_exprs: vec![ColumnExpr { name: col_name.to_string(), expr: expr_id }],
            keep_input_columns: true,
            exclude_columns: vec![],
        });
        self.graph.set_loc(map, loc);
        self.graph.add_parent(map, parent_op)?;
        self.graph.connect_expression(map, expr_id)?;

        // A column assigned from metadata keeps its metadata identity when
        // referenced through this name later.
        let metadata_property = match self.graph.expression(expr_id) {
            Ok(expr) => match &expr.kind {
                ExpressionKind::Metadata { property, .. } => Some(property.clone()),
                _ => None,
            },
            Err(_) => None,
        };
        match metadata_property {
            Some(property) => {
                let mut aliases = self
                    .metadata_aliases
                    .get(&parent_op)
                    .cloned()
                    .unwrap_or_default();
                aliases.insert(col_name.to_string(), property);
                self.metadata_aliases.insert(map, aliases);
            }
            None => self.propagate_aliases(parent_op, map),
        }

        self.var_table.borrow_mut().add(&df_name, QLObject::Dataframe(map));
        Ok(())
    }

    /// Carry metadata aliases forward to a derived operator.
    fn propagate_aliases(&mut self, from: NodeId, to: NodeId) {
        if let Some(aliases) = self.metadata_aliases.get(&from).cloned() {
            self.metadata_aliases.insert(to, aliases);
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str, loc: SourceLocation) -> CompilerResult<QLObject> {
        self.var_table
            .borrow()
            .lookup(name)
            .ok_or_else(|| CompilerError::UndefinedName { loc, name: name.to_string() })
    }

    pub fn process(&mut self, expr: &AstExpr) -> CompilerResult<QLObject> {
        let loc = expr.loc;
        match &expr.kind {
            AstExprKind::Name(name) => self.lookup(name, loc),
            AstExprKind::Str(s) => {
                let id = self.graph.create_string(s);
                self.graph.set_loc(id, loc);
                Ok(QLObject::Expr(id))
            }
            AstExprKind::Int(v) => {
                let id = self.graph.create_int(*v);
                self.graph.set_loc(id, loc);
                Ok(QLObject::Expr(id))
            }
            AstExprKind::Float(v) => {
                let id = self.graph.create_float(*v);
                self.graph.set_loc(id, loc);
                Ok(QLObject::Expr(id))
            }
            AstExprKind::Bool(v) => {
                let id = self.graph.create_bool(*v);
                self.graph.set_loc(id, loc);
                Ok(QLObject::Expr(id))
            }
            AstExprKind::NoneLit => Ok(QLObject::None),
            AstExprKind::List(elems) => {
                let objs = elems
                    .iter()
                    .map(|e| self.process(e))
                    .collect::<CompilerResult<Vec<_>>>()?;
                Ok(QLObject::List(objs))
            }
            AstExprKind::Tuple(elems) => {
                let objs = elems
                    .iter()
                    .map(|e| self.process(e))
                    .collect::<CompilerResult<Vec<_>>>()?;
                Ok(QLObject::TupleObj(objs))
            }
            AstExprKind::Call { func, args, kwargs } => self.process_call(func, args, kwargs, loc),
            AstExprKind::Attribute { value, attr } => self.process_attribute(value, attr, loc),
            AstExprKind::Subscript { value, index } => self.process_subscript(value, index, loc),
            AstExprKind::BinOp { op, left, right } => {
                let l = self.process(left)?;
                let r = self.process(right)?;
                let l = self.expect_expr(&l, loc)?;
                let r = self.expect_expr(&r, loc)?;
                self.make_func(binop_func_name(*op), vec![l, r], loc)
            }
            AstExprKind::UnaryOp { op, operand } => {
                // Fold negated integer literals immediately; they are common
                // in time-range arguments.
                if let (UnaryOpKind::Neg, AstExprKind::Int(v)) = (op, &operand.kind) {
                    let id = self.graph.create_int(-v);
                    self.graph.set_loc(id, loc);
                    return Ok(QLObject::Expr(id));
                }
                let o = self.process(operand)?;
                let o = self.expect_expr(&o, loc)?;
                let name = match op {
                    UnaryOpKind::Neg => "negate",
                    UnaryOpKind::Not => "lognot",
                };
                self.make_func(name, vec![o], loc)
            }
            AstExprKind::BoolOp { op, values } => {
                let name = match op {
                    BoolOpKind::And => "logand",
                    BoolOpKind::Or => "logor",
                };
                let mut ids = Vec::with_capacity(values.len());
                for v in values {
                    let o = self.process(v)?;
                    ids.push(self.expect_expr(&o, loc)?);
                }
                if ids.is_empty() {
                    return Err(CompilerError::ParseError {
                        loc,
                        msg: "boolean operation with no operands".to_string(),
                    });
                }
                let mut acc = ids[0];
                for &next in &ids[1..] {
                    acc = match self.make_func(name, vec![acc, next], loc)? {
                        QLObject::Expr(id) => id,
                        _ => unreachable!(),
                    };
                }
                Ok(QLObject::Expr(acc))
            }
            AstExprKind::Compare { left, ops, comparators } => {
                if ops.len() != comparators.len() || ops.is_empty() {
                    return Err(CompilerError::ParseError {
                        loc,
                        msg: "malformed comparison".to_string(),
                    });
                }
                // Chained comparisons expand to an `and` of pairwise funcs.
                let mut operands = Vec::with_capacity(comparators.len() + 1);
                let first = self.process(left)?;
                operands.push(self.expect_expr(&first, loc)?);
                for c in comparators {
                    let o = self.process(c)?;
                    operands.push(self.expect_expr(&o, loc)?);
                }
                let mut pairs = Vec::with_capacity(ops.len());
                for (i, op) in ops.iter().enumerate() {
                    let f = self.make_func(
                        compare_func_name(*op),
                        vec![operands[i], operands[i + 1]],
                        loc,
                    )?;
                    pairs.push(match f {
                        QLObject::Expr(id) => id,
                        _ => unreachable!(),
                    });
                }
                let mut acc = pairs[0];
                for &next in &pairs[1..] {
                    acc = match self.make_func("logand", vec![acc, next], loc)? {
                        QLObject::Expr(id) => id,
                        _ => unreachable!(),
                    };
                }
                Ok(QLObject::Expr(acc))
            }
        }
    }

    fn make_func(&mut self, name: &str, args: Vec<NodeId>, loc: SourceLocation) -> CompilerResult<QLObject> {
        let id = self.graph.create_func(name, args)?;
        self.graph.set_loc(id, loc);
        Ok(QLObject::Expr(id))
    }

    // ------------------------------------------------------------------
    // Attribute access & method dispatch
    // ------------------------------------------------------------------

    fn process_attribute(
        &mut self,
        value: &AstExpr,
        attr: &str,
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        let obj = self.process(value)?;
        match obj {
            QLObject::Module(module) => module.member(attr).ok_or_else(|| {
                CompilerError::UndefinedName {
                    loc,
                    name: format!("{}.{}", module.name, attr),
                }
            }),
            QLObject::Dataframe(op) => self.dataframe_attribute(op, attr, loc),
            other => Err(CompilerError::TypeMismatch {
                loc,
                msg: format!("cannot access attribute '{}' on {}", attr, other.type_name()),
            }),
        }
    }

    fn dataframe_attribute(
        &mut self,
        op: NodeId,
        attr: &str,
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        let method = |name: &str, params: Vec<FuncParam>, b: Builtin| {
            QLObject::Func(FuncObject::method(name, params, b, op))
        };
        let obj = match attr {
            "ctx" => QLObject::Ctx(op),
            "groupby" => method("groupby", vec![FuncParam::required("by")], Builtin::GroupBy),
            "agg" => method("agg", vec![], Builtin::Agg),
            "merge" => method(
                "merge",
                vec![
                    FuncParam::required("right"),
                    FuncParam::kw_optional("how", QLObject::None),
                    FuncParam::kw_optional("left_on", QLObject::None),
                    FuncParam::kw_optional("right_on", QLObject::None),
                    FuncParam::kw_optional("suffixes", QLObject::None),
                ],
                Builtin::Merge,
            ),
            "drop" => method("drop", vec![FuncParam::required("columns")], Builtin::Drop),
            "head" => method("head", vec![FuncParam::optional("n", QLObject::None)], Builtin::Head),
            "append" => method("append", vec![FuncParam::required("other")], Builtin::Append),
            "rolling" => method(
                "rolling",
                vec![
                    FuncParam::required("window"),
                    FuncParam::kw_optional("on", QLObject::None),
                ],
                Builtin::Rolling,
            ),
            // Any other attribute reads as a column reference.
            _ => {
                let id = self.graph.create_column(attr);
                self.graph.set_loc(id, loc);
                QLObject::Expr(id)
            }
        };
        Ok(obj)
    }

    // ------------------------------------------------------------------
    // Subscripts
    // ------------------------------------------------------------------

    fn process_subscript(
        &mut self,
        value: &AstExpr,
        index: &AstExpr,
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        let obj = self.process(value)?;
        match obj {
            QLObject::Dataframe(op) => match &index.kind {
                // df['col'] resolves to a column; through a metadata alias it
                // keeps its metadata identity.
                AstExprKind::Str(col) => {
                    let alias_property = self
                        .metadata_aliases
                        .get(&op)
                        .and_then(|m| m.get(col))
                        .cloned();
                    let id = match alias_property {
                        Some(property) => self.graph.create_metadata(&property, Some(col)),
                        None => self.graph.create_column(col),
                    };
                    self.graph.set_loc(id, loc);
                    Ok(QLObject::Expr(id))
                }
                // df[['a', 'b']] resolves to a projection.
                AstExprKind::List(elems) => {
                    let mut col_exprs = Vec::with_capacity(elems.len());
                    for e in elems {
                        match &e.kind {
                            AstExprKind::Str(name) => {
                                let col = self.graph.create_column(name);
                                self.graph.set_loc(col, e.loc);
                                col_exprs.push(ColumnExpr { name: name.clone(), expr: col });
                            }
                            _ => {
                                return Err(CompilerError::InvalidArgument {
                                    loc: e.loc,
                                    msg: "projection list elements must be strings".to_string(),
                                })
                            }
                        }
                    }
                    let map = self.graph.create_operator(OperatorKind::Map {
                        col_exprs: col_exprs.clone(),
                        keep_input_columns: false,
                        exclude_columns: vec![],
                    });
                    self.graph.set_loc(map, loc);
                    self.graph.add_parent(map, op)?;
                    for ce in &col_exprs {
                        self.graph.connect_expression(map, ce.expr)?;
                    }
                    Ok(QLObject::Dataframe(map))
                }
                // df[bool_expr] resolves to a filter.
                _ => {
                    let pred_obj = self.process(index)?;
                    let pred = self.expect_expr(&pred_obj, loc)?;
                    let filter = self.graph.create_operator(OperatorKind::Filter { predicate: pred });
                    self.graph.set_loc(filter, loc);
                    self.graph.add_parent(filter, op)?;
                    self.graph.connect_expression(filter, pred)?;
                    self.propagate_aliases(op, filter);
                    Ok(QLObject::Dataframe(filter))
                }
            },
            QLObject::Ctx(_) => match &index.kind {
                AstExprKind::Str(property) => {
                    let id = self.graph.create_metadata(property, None);
                    self.graph.set_loc(id, loc);
                    Ok(QLObject::Expr(id))
                }
                _ => Err(CompilerError::InvalidArgument {
                    loc,
                    msg: "ctx[] requires a string metadata property".to_string(),
                }),
            },
            other => Err(CompilerError::TypeMismatch {
                loc,
                msg: format!("cannot subscript {}", other.type_name()),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn process_call(
        &mut self,
        func: &AstExpr,
        args: &[AstExpr],
        kwargs: &[(String, AstExpr)],
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        let fobj = match self.process(func)? {
            QLObject::Func(f) => f,
            other => {
                return Err(CompilerError::TypeMismatch {
                    loc,
                    msg: format!("{} is not callable", other.type_name()),
                })
            }
        };

        let arg_objs = args
            .iter()
            .map(|a| self.process(a))
            .collect::<CompilerResult<Vec<_>>>()?;
        let kwarg_objs = kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.process(v)?)))
            .collect::<CompilerResult<Vec<_>>>()?;

        let bound = self.bind_args(&fobj, arg_objs, kwarg_objs, loc)?;
        match &fobj.kind {
            FuncKind::Builtin(b) => self.call_builtin(b, fobj.receiver, bound, loc),
            FuncKind::UserDefined { body, closure } => {
                self.call_user_function(&fobj, body, closure, bound, loc)
            }
        }
    }

    fn bind_args(
        &mut self,
        fobj: &FuncObject,
        args: Vec<QLObject>,
        kwargs: Vec<(String, QLObject)>,
        loc: SourceLocation,
    ) -> CompilerResult<BoundArgs> {
        if args.len() > fobj.params.len() {
            return Err(CompilerError::InvalidArgument {
                loc,
                msg: format!(
                    "'{}' takes at most {} positional arguments, got {}",
                    fobj.name,
                    fobj.params.len(),
                    args.len()
                ),
            });
        }
        let mut values: HashMap<String, QLObject> = HashMap::new();
        for (i, arg) in args.into_iter().enumerate() {
            let param = &fobj.params[i];
            if param.kwonly {
                return Err(CompilerError::InvalidArgument {
                    loc,
                    msg: format!("'{}' argument '{}' is keyword-only", fobj.name, param.name),
                });
            }
            values.insert(param.name.clone(), arg);
        }
        let mut extra_kwargs = Vec::new();
        for (name, value) in kwargs {
            if fobj.params.iter().any(|p| p.name == name) {
                if values.contains_key(&name) {
                    return Err(CompilerError::InvalidArgument {
                        loc,
                        msg: format!("'{}' got multiple values for argument '{}'", fobj.name, name),
                    });
                }
                values.insert(name, value);
            } else if fobj.accepts_arbitrary_kwargs {
                extra_kwargs.push((name, value));
            } else {
                return Err(CompilerError::InvalidArgument {
                    loc,
                    msg: format!("'{}' got an unexpected keyword argument '{}'", fobj.name, name),
                });
            }
        }
        for param in &fobj.params {
            if !values.contains_key(&param.name) {
                match &param.default {
                    Some(ParamDefault::Object(obj)) => {
                        values.insert(param.name.clone(), obj.clone());
                    }
                    Some(ParamDefault::Ast(expr)) => {
                        let obj = self.process(expr)?;
                        values.insert(param.name.clone(), obj);
                    }
                    None => {
                        return Err(CompilerError::InvalidArgument {
                            loc,
                            msg: format!("'{}' missing required argument '{}'", fobj.name, param.name),
                        })
                    }
                }
            }
            if let Some(annotation) = &param.annotation {
                self.check_annotation(annotation, &values[&param.name], &fobj.name, &param.name, loc)?;
            }
        }
        Ok(BoundArgs { values, extra_kwargs })
    }

    fn check_annotation(
        &self,
        annotation: &str,
        obj: &QLObject,
        func: &str,
        param: &str,
        loc: SourceLocation,
    ) -> CompilerResult<()> {
        let ok = match annotation {
            "str" => matches!(obj, QLObject::Expr(id)
                if matches!(self.graph.expression(*id).map(|e| &e.kind), Ok(ExpressionKind::Str(_)))),
            "int" => matches!(obj, QLObject::Expr(id)
                if matches!(self.graph.expression(*id).map(|e| &e.kind), Ok(ExpressionKind::Int(_)))),
            "DataFrame" => matches!(obj, QLObject::Dataframe(_)),
            _ => true,
        };
        if !ok {
            return Err(CompilerError::TypeMismatch {
                loc,
                msg: format!(
                    "'{}' argument '{}' expects {}, got {}",
                    func,
                    param,
                    annotation,
                    obj.type_name()
                ),
            });
        }
        Ok(())
    }

    fn call_user_function(
        &mut self,
        fobj: &FuncObject,
        body: &[AstStmt],
        closure: &VarTableRef,
        bound: BoundArgs,
        _loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        let child = VarTable::create_child(closure);
        for (name, value) in bound.values {
            child.borrow_mut().add(&name, value);
        }
        let saved = std::mem::replace(&mut self.var_table, child);

        let mut result = QLObject::None;
        let mut outcome = Ok(());
        for stmt in body {
            if let AstStmt::Return { value, .. } = stmt {
                match value {
                    Some(expr) => match self.process(expr) {
                        Ok(obj) => result = obj,
                        Err(e) => outcome = Err(e),
                    },
                    None => {}
                }
                break;
            }
            if let Err(e) = self.process_stmt(stmt, true) {
                outcome = Err(e);
                break;
            }
        }

        self.var_table = saved;
        outcome?;
        let _ = fobj;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Builtin implementations
    // ------------------------------------------------------------------

    fn call_builtin(
        &mut self,
        builtin: &Builtin,
        receiver: Option<NodeId>,
        bound: BoundArgs,
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        match builtin {
            Builtin::DataFrame => self.build_memory_source(bound, loc),
            Builtin::Display => {
                let df = self.expect_dataframe(&bound.values["df"], loc)?;
                let name = match &bound.values["name"] {
                    QLObject::None => "output".to_string(),
                    obj => self.take_string(obj, loc)?,
                };
                let sink = self.graph.create_operator(OperatorKind::MemorySink { name });
                self.graph.set_loc(sink, loc);
                self.graph.add_parent(sink, df)?;
                Ok(QLObject::None)
            }
            Builtin::GroupBy => {
                let parent = receiver.expect("groupby is a method");
                let names = self.take_string_list(&bound.values["by"], loc)?;
                let mut groups = Vec::with_capacity(names.len());
                for n in &names {
                    let col = self.graph.create_column(n);
                    self.graph.set_loc(col, loc);
                    groups.push(col);
                }
                let op = self.graph.create_operator(OperatorKind::GroupBy { groups: groups.clone() });
                self.graph.set_loc(op, loc);
                self.graph.add_parent(op, parent)?;
                for g in groups {
                    self.graph.connect_expression(op, g)?;
                }
                Ok(QLObject::Dataframe(op))
            }
            Builtin::Agg => self.build_blocking_agg(receiver.expect("agg is a method"), bound, loc),
            Builtin::Merge => self.build_join(receiver.expect("merge is a method"), bound, loc),
            Builtin::Drop => {
                let parent = receiver.expect("drop is a method");
                let columns = self.take_string_list(&bound.values["columns"], loc)?;
                let map = self.graph.create_operator(OperatorKind::Map {
                    col_exprs: vec![],
                    keep_input_columns: true,
                    exclude_columns: columns,
                });
                self.graph.set_loc(map, loc);
                self.graph.add_parent(map, parent)?;
                self.propagate_aliases(parent, map);
                Ok(QLObject::Dataframe(map))
            }
            Builtin::Head => {
                let parent = receiver.expect("head is a method");
                let n = match &bound.values["n"] {
                    QLObject::None => 5,
                    obj => self.take_int(obj, loc)?,
                };
                let limit = self.graph.create_operator(OperatorKind::Limit { limit: n });
                self.graph.set_loc(limit, loc);
                self.graph.add_parent(limit, parent)?;
                self.propagate_aliases(parent, limit);
                Ok(QLObject::Dataframe(limit))
            }
            Builtin::Append => {
                let parent = receiver.expect("append is a method");
                let other = self.expect_dataframe(&bound.values["other"], loc)?;
                let union = self.graph.create_operator(OperatorKind::Union {});
                self.graph.set_loc(union, loc);
                self.graph.add_parent(union, parent)?;
                self.graph.add_parent(union, other)?;
                Ok(QLObject::Dataframe(union))
            }
            Builtin::Rolling => {
                let parent = receiver.expect("rolling is a method");
                let window_ns = self.take_int(&bound.values["window"], loc)?;
                let window_col = match &bound.values["on"] {
                    QLObject::None => "time_".to_string(),
                    obj => self.take_string(obj, loc)?,
                };
                let op = self
                    .graph
                    .create_operator(OperatorKind::Rolling { window_col, window_ns });
                self.graph.set_loc(op, loc);
                self.graph.add_parent(op, parent)?;
                Ok(QLObject::Dataframe(op))
            }
            Builtin::CompileTimeFn(name) => {
                let mut args = Vec::new();
                if *name != "now" {
                    args.push(self.expect_expr(&bound.values["value"], loc)?);
                }
                self.make_func(name, args, loc)
            }
            Builtin::UdaRef(name) => Err(CompilerError::UnsupportedOperator {
                loc,
                msg: format!(
                    "aggregate '{}' can only be used inside agg(name=(column, fn))",
                    name
                ),
            }),
            Builtin::Udtf(spec) => {
                let mut arg_values = Vec::new();
                for arg in &spec.args {
                    match &bound.values[&arg.name] {
                        QLObject::None => {
                            if arg.required {
                                return Err(CompilerError::InvalidArgument {
                                    loc,
                                    msg: format!(
                                        "'{}' missing required argument '{}'",
                                        spec.name, arg.name
                                    ),
                                });
                            }
                        }
                        obj => {
                            let id = self.expect_expr(obj, loc)?;
                            let dtype = self.graph.expression(id)?.dtype;
                            if dtype != arg.data_type {
                                return Err(CompilerError::TypeMismatch {
                                    loc,
                                    msg: format!(
                                        "'{}' argument '{}' expects {}, got {}",
                                        spec.name, arg.name, arg.data_type, dtype
                                    ),
                                });
                            }
                            arg_values.push((arg.name.clone(), id));
                        }
                    }
                }
                let op = self.graph.create_operator(OperatorKind::UdtfSource {
                    name: spec.name.clone(),
                    arg_values: arg_values.clone(),
                });
                self.graph.set_loc(op, loc);
                for (_, id) in &arg_values {
                    self.graph.connect_expression(op, *id)?;
                }
                Ok(QLObject::Dataframe(op))
            }
        }
    }

    fn build_memory_source(&mut self, bound: BoundArgs, loc: SourceLocation) -> CompilerResult<QLObject> {
        let table = self.take_string(&bound.values["table"], loc)?;
        let select = match &bound.values["select"] {
            QLObject::None => None,
            obj => Some(self.take_string_list(obj, loc)?),
        };
        let start_time = match &bound.values["start_time"] {
            QLObject::None => None,
            obj => Some(self.expect_expr(obj, loc)?),
        };
        let stop_time = match &bound.values["end_time"] {
            QLObject::None => None,
            obj => Some(self.expect_expr(obj, loc)?),
        };
        let src = self.graph.create_operator(OperatorKind::MemorySource {
            table,
            tablet: String::new(),
            select,
            start_time,
            stop_time,
            time_start_ns: None,
            time_stop_ns: None,
            column_ids: vec![],
        });
        self.graph.set_loc(src, loc);
        if let Some(id) = start_time {
            self.graph.connect_expression(src, id)?;
        }
        if let Some(id) = stop_time {
            self.graph.connect_expression(src, id)?;
        }
        Ok(QLObject::Dataframe(src))
    }

    fn build_blocking_agg(
        &mut self,
        receiver: NodeId,
        bound: BoundArgs,
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        // agg on a groupby merges the GroupBy node away.
        let (parent, groups, groupby) = match &self.graph.operator(receiver)?.kind {
            OperatorKind::GroupBy { groups } => {
                let parent = self.graph.operator(receiver)?.parents[0];
                (parent, groups.clone(), Some(receiver))
            }
            _ => (receiver, vec![], None),
        };

        if bound.extra_kwargs.is_empty() {
            return Err(CompilerError::InvalidArgument {
                loc,
                msg: "agg() requires at least one name=(column, fn) argument".to_string(),
            });
        }

        let mut agg_exprs = Vec::with_capacity(bound.extra_kwargs.len());
        for (out_name, value) in &bound.extra_kwargs {
            let pair = match value {
                QLObject::TupleObj(elems) if elems.len() == 2 => elems,
                other => {
                    return Err(CompilerError::InvalidArgument {
                        loc,
                        msg: format!(
                            "agg argument '{}' must be a (column, fn) tuple, got {}",
                            out_name,
                            other.type_name()
                        ),
                    })
                }
            };
            let col_name = self.take_string(&pair[0], loc)?;
            let uda_name = match &pair[1] {
                QLObject::Func(f) => match &f.kind {
                    FuncKind::Builtin(Builtin::UdaRef(n)) => n.clone(),
                    _ => {
                        return Err(CompilerError::InvalidArgument {
                            loc,
                            msg: format!("agg argument '{}' must name an aggregate function", out_name),
                        })
                    }
                },
                other => {
                    return Err(CompilerError::InvalidArgument {
                        loc,
                        msg: format!(
                            "agg argument '{}' must name an aggregate function, got {}",
                            out_name,
                            other.type_name()
                        ),
                    })
                }
            };
            let col = self.graph.create_column(&col_name);
            self.graph.set_loc(col, loc);
            let func = self.graph.create_func(&uda_name, vec![col])?;
            self.graph.set_loc(func, loc);
            agg_exprs.push(ColumnExpr { name: out_name.clone(), expr: func });
        }

        let agg = self.graph.create_operator(OperatorKind::BlockingAgg {
            groups: groups.clone(),
            agg_exprs: agg_exprs.clone(),
            partial_agg: true,
            finalize_results: true,
        });
        self.graph.set_loc(agg, loc);
        self.graph.add_parent(agg, parent)?;
        for g in &groups {
            // Transfer group columns from the groupby to the agg.
            if let Some(gb) = groupby {
                self.graph.delete_edge(gb, *g)?;
            }
            self.graph.connect_expression(agg, *g)?;
        }
        for ce in &agg_exprs {
            self.graph.connect_expression(agg, ce.expr)?;
        }
        if let Some(gb) = groupby {
            self.graph.remove_parent(gb, parent)?;
            self.graph.delete_node(gb)?;
        }
        Ok(QLObject::Dataframe(agg))
    }

    fn build_join(
        &mut self,
        receiver: NodeId,
        bound: BoundArgs,
        loc: SourceLocation,
    ) -> CompilerResult<QLObject> {
        let right = self.expect_dataframe(&bound.values["right"], loc)?;
        let how = match &bound.values["how"] {
            QLObject::None => "inner".to_string(),
            obj => self.take_string(obj, loc)?,
        };
        let join_type = match how.as_str() {
            "inner" => JoinType::Inner,
            "left" => JoinType::LeftOuter,
            "right" => JoinType::RightOuter,
            "outer" => JoinType::FullOuter,
            other => {
                return Err(CompilerError::InvalidArgument {
                    loc,
                    msg: format!("unknown join type '{}'", other),
                })
            }
        };
        let left_on = match &bound.values["left_on"] {
            QLObject::None => {
                return Err(CompilerError::InvalidArgument {
                    loc,
                    msg: "merge() requires left_on".to_string(),
                })
            }
            obj => self.take_string_list(obj, loc)?,
        };
        let right_on = match &bound.values["right_on"] {
            QLObject::None => left_on.clone(),
            obj => self.take_string_list(obj, loc)?,
        };
        if left_on.len() != right_on.len() {
            return Err(CompilerError::InvalidArgument {
                loc,
                msg: "left_on and right_on must have the same length".to_string(),
            });
        }
        let suffixes = match &bound.values["suffixes"] {
            QLObject::None => ("_x".to_string(), "_y".to_string()),
            obj => {
                let v = self.take_string_list(obj, loc)?;
                if v.len() != 2 {
                    return Err(CompilerError::InvalidArgument {
                        loc,
                        msg: "suffixes must contain exactly two strings".to_string(),
                    });
                }
                (v[0].clone(), v[1].clone())
            }
        };
        let join = self.graph.create_operator(OperatorKind::Join {
            join_type,
            left_on,
            right_on,
            suffixes,
            equality_conditions: vec![],
            output_columns: vec![],
        });
        self.graph.set_loc(join, loc);
        self.graph.add_parent(join, receiver)?;
        self.graph.add_parent(join, right)?;
        Ok(QLObject::Dataframe(join))
    }

    // ------------------------------------------------------------------
    // Object extraction helpers
    // ------------------------------------------------------------------

    fn expect_expr(&self, obj: &QLObject, loc: SourceLocation) -> CompilerResult<NodeId> {
        match obj {
            QLObject::Expr(id) => Ok(*id),
            other => Err(CompilerError::TypeMismatch {
                loc,
                msg: format!("expected an expression, got {}", other.type_name()),
            }),
        }
    }

    fn expect_dataframe(&self, obj: &QLObject, loc: SourceLocation) -> CompilerResult<NodeId> {
        match obj {
            QLObject::Dataframe(id) => Ok(*id),
            other => Err(CompilerError::TypeMismatch {
                loc,
                msg: format!("expected a DataFrame, got {}", other.type_name()),
            }),
        }
    }

    /// Extract a string literal and release its consumed IR node.
    fn take_string(&mut self, obj: &QLObject, loc: SourceLocation) -> CompilerResult<String> {
        let id = self.expect_expr(obj, loc)?;
        match &self.graph.expression(id)?.kind {
            ExpressionKind::Str(s) => {
                let s = s.clone();
                if self.graph.parents_of(id).is_empty() && self.graph.dependencies_of(id).is_empty()
                {
                    self.graph.delete_node(id)?;
                }
                Ok(s)
            }
            _ => Err(CompilerError::TypeMismatch {
                loc,
                msg: "expected a string literal".to_string(),
            }),
        }
    }

    /// Extract an integer literal and release its consumed IR node.
    fn take_int(&mut self, obj: &QLObject, loc: SourceLocation) -> CompilerResult<i64> {
        let id = self.expect_expr(obj, loc)?;
        match self.graph.expression(id)?.kind {
            ExpressionKind::Int(v) => {
                if self.graph.parents_of(id).is_empty() && self.graph.dependencies_of(id).is_empty()
                {
                    self.graph.delete_node(id)?;
                }
                Ok(v)
            }
            _ => Err(CompilerError::TypeMismatch {
                loc,
                msg: "expected an integer literal".to_string(),
            }),
        }
    }

    /// A single string or a list of strings.
    fn take_string_list(&mut self, obj: &QLObject, loc: SourceLocation) -> CompilerResult<Vec<String>> {
        match obj {
            QLObject::List(elems) | QLObject::TupleObj(elems) => {
                let elems = elems.clone();
                elems.iter().map(|e| self.take_string(e, loc)).collect()
            }
            single => Ok(vec![self.take_string(single, loc)?]),
        }
    }
}

fn binop_func_name(op: BinOpKind) -> &'static str {
    match op {
        BinOpKind::Add => "add",
        BinOpKind::Sub => "subtract",
        BinOpKind::Mul => "multiply",
        BinOpKind::Div => "divide",
        BinOpKind::Mod => "modulo",
    }
}

fn compare_func_name(op: CompareOpKind) -> &'static str {
    match op {
        CompareOpKind::Eq => "equals",
        CompareOpKind::NotEq => "not_equals",
        CompareOpKind::Lt => "less_than",
        CompareOpKind::LtEq => "less_than_eq",
        CompareOpKind::Gt => "greater_than",
        CompareOpKind::GtEq => "greater_than_eq",
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::*;
    use crate::types::{DataType, Relation};
    use crate::udf::Registry;

    fn test_relation_map() -> HashMap<String, Relation> {
        let mut map = HashMap::new();
        map.insert(
            "t".to_string(),
            Relation::from_columns(vec![
                ("time_", DataType::Time64Ns),
                ("cpu", DataType::Int64),
                ("upid", DataType::Uint128),
            ]),
        );
        map
    }

    fn compile(module: &AstModule) -> (IrGraph, CompilerResult<VarTableRef>) {
        let registry = Registry::with_builtins();
        let state = CompilerState::new(&registry, test_relation_map(), 0);
        let mut graph = IrGraph::new();
        let result = compile_ast(module, &state, &mut graph);
        (graph, result)
    }

    #[test]
    fn test_select_all_display() {
        let m = module(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            expr_stmt(call(name("display"), vec![name("df"), str_lit("out")], vec![])),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();

        let sources = graph.find_nodes_of_kind(IrNodeKind::MemorySource);
        let sinks = graph.find_nodes_of_kind(IrNodeKind::MemorySink);
        assert_eq!(sources.len(), 1);
        assert_eq!(sinks.len(), 1);
        assert_eq!(graph.operator(sinks[0]).unwrap().parents, sources.clone());
        match &graph.operator(sinks[0]).unwrap().kind {
            OperatorKind::MemorySink { name } => assert_eq!(name, "out"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_filter_from_subscript() {
        // df = DataFrame('t'); df = df[df['cpu'] == 10]
        let m = module(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                subscript(name("df"), eq(subscript(name("df"), str_lit("cpu")), int_lit(10))),
            ),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();

        let filters = graph.find_nodes_of_kind(IrNodeKind::Filter);
        assert_eq!(filters.len(), 1);
        let pred = match &graph.operator(filters[0]).unwrap().kind {
            OperatorKind::Filter { predicate } => *predicate,
            _ => unreachable!(),
        };
        match &graph.expression(pred).unwrap().kind {
            ExpressionKind::Func { name, args, .. } => {
                assert_eq!(name, "equals");
                assert_eq!(args.len(), 2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_projection_from_list_subscript() {
        let m = module(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("df"),
                subscript(name("df"), list(vec![str_lit("cpu"), str_lit("time_")])),
            ),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();

        let maps = graph.find_nodes_of_kind(IrNodeKind::Map);
        assert_eq!(maps.len(), 1);
        match &graph.operator(maps[0]).unwrap().kind {
            OperatorKind::Map { col_exprs, keep_input_columns, .. } => {
                assert!(!keep_input_columns);
                let names: Vec<&str> = col_exprs.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, vec!["cpu", "time_"]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_map_assignment_rebinds_df() {
        // df['double'] = df['cpu'] * 2
        let m = module(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                subscript(name("df"), str_lit("double")),
                binop(
                    crate::ast::BinOpKind::Mul,
                    subscript(name("df"), str_lit("cpu")),
                    int_lit(2),
                ),
            ),
            expr_stmt(call(name("display"), vec![name("df")], vec![])),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();

        let maps = graph.find_nodes_of_kind(IrNodeKind::Map);
        assert_eq!(maps.len(), 1);
        match &graph.operator(maps[0]).unwrap().kind {
            OperatorKind::Map { col_exprs, keep_input_columns, .. } => {
                assert!(keep_input_columns);
                assert_eq!(col_exprs[0].name, "double");
            }
            _ => unreachable!(),
        }
        // The sink hangs off the map, not the source.
        let sinks = graph.find_nodes_of_kind(IrNodeKind::MemorySink);
        assert_eq!(graph.operator(sinks[0]).unwrap().parents, maps);
    }

    #[test]
    fn test_groupby_agg() {
        // df.groupby('upid').agg(n=('cpu', count))
        let m = module(vec![
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
        let (graph, result) = compile(&m);
        result.unwrap();

        // GroupBy is merged away.
        assert!(graph.find_nodes_of_kind(IrNodeKind::GroupBy).is_empty());
        let aggs = graph.find_nodes_of_kind(IrNodeKind::BlockingAgg);
        assert_eq!(aggs.len(), 1);
        match &graph.operator(aggs[0]).unwrap().kind {
            OperatorKind::BlockingAgg { groups, agg_exprs, .. } => {
                assert_eq!(groups.len(), 1);
                assert_eq!(agg_exprs.len(), 1);
                assert_eq!(agg_exprs[0].name, "n");
            }
            _ => unreachable!(),
        }
        // Parent is the memory source directly.
        let sources = graph.find_nodes_of_kind(IrNodeKind::MemorySource);
        assert_eq!(graph.operator(aggs[0]).unwrap().parents, sources);
    }

    #[test]
    fn test_merge_builds_join() {
        let m = module(vec![
            assign(name("a"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(name("b"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
            assign(
                name("j"),
                call(
                    attribute(name("a"), "merge"),
                    vec![name("b")],
                    vec![("how", str_lit("inner")), ("left_on", str_lit("upid"))],
                ),
            ),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();

        let joins = graph.find_nodes_of_kind(IrNodeKind::Join);
        assert_eq!(joins.len(), 1);
        match &graph.operator(joins[0]).unwrap().kind {
            OperatorKind::Join { join_type, left_on, right_on, .. } => {
                assert_eq!(*join_type, JoinType::Inner);
                assert_eq!(left_on, &vec!["upid".to_string()]);
                assert_eq!(right_on, &vec!["upid".to_string()]);
            }
            _ => unreachable!(),
        }
        assert_eq!(graph.operator(joins[0]).unwrap().parents.len(), 2);
    }

    #[test]
    fn test_chained_compare_expands_to_logand() {
        // 1 < 2 < 3 becomes logand(less_than(1,2), less_than(2,3))
        let m = module(vec![assign(
            name("x"),
            compare(
                int_lit(1),
                vec![CompareOpKind::Lt, CompareOpKind::Lt],
                vec![int_lit(2), int_lit(3)],
            ),
        )]);
        let (graph, result) = compile(&m);
        let table = result.unwrap();
        let x = table.borrow().lookup("x").unwrap();
        let id = match x {
            QLObject::Expr(id) => id,
            _ => panic!("expected expression"),
        };
        match &graph.expression(id).unwrap().kind {
            ExpressionKind::Func { name, args, .. } => {
                assert_eq!(name, "logand");
                assert_eq!(args.len(), 2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_metadata_subscript() {
        let m = module(vec![
            assign(name("df"), call(name("DataFrame"), vec![str_lit("http_events")], vec![])),
            assign(
                subscript(name("df"), str_lit("svc")),
                subscript(attribute(name("df"), "ctx"), str_lit("service")),
            ),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();
        assert_eq!(graph.find_nodes_of_kind(IrNodeKind::Metadata).len(), 1);
    }

    #[test]
    fn test_function_def_and_call() {
        // def make(): return DataFrame('t')
        // df = make()
        let m = module(vec![
            func_def(
                "make",
                vec![],
                vec![ret(Some(call(name("DataFrame"), vec![str_lit("t")], vec![])))],
            ),
            assign(name("df"), call(name("make"), vec![], vec![])),
            expr_stmt(call(name("display"), vec![name("df")], vec![])),
        ]);
        let (graph, result) = compile(&m);
        result.unwrap();
        assert_eq!(graph.find_nodes_of_kind(IrNodeKind::MemorySource).len(), 1);
        assert_eq!(graph.find_nodes_of_kind(IrNodeKind::MemorySink).len(), 1);
    }

    #[test]
    fn test_undefined_name_errors() {
        let m = module(vec![expr_stmt(call(name("display"), vec![name("nope")], vec![]))]);
        let (_, result) = compile(&m);
        assert!(matches!(
            result.unwrap_err(),
            CompilerError::UndefinedName { name, .. } if name == "nope"
        ));
    }

    #[test]
    fn test_return_outside_function_errors() {
        let m = module(vec![ret(None)]);
        let (_, result) = compile(&m);
        assert!(matches!(result.unwrap_err(), CompilerError::ParseError { .. }));
    }

    #[test]
    fn test_unknown_kwarg_errors() {
        let m = module(vec![assign(
            name("df"),
            call(name("DataFrame"), vec![str_lit("t")], vec![("bogus", int_lit(1))]),
        )]);
        let (_, result) = compile(&m);
        assert!(matches!(result.unwrap_err(), CompilerError::InvalidArgument { .. }));
    }

    #[test]
    fn test_udtf_call() {
        let m = module(vec![expr_stmt(call(
            name("display"),
            vec![call(name("ServiceUpTime"), vec![], vec![])],
            vec![],
        ))]);
        let (graph, result) = compile(&m);
        result.unwrap();
        assert_eq!(graph.find_nodes_of_kind(IrNodeKind::UdtfSource).len(), 1);
    }

    #[test]
    fn test_start_time_expression_connected() {
        // DataFrame('t', start_time='-30s')
        let m = module(vec![assign(
            name("df"),
            call(name("DataFrame"), vec![str_lit("t")], vec![("start_time", str_lit("-30s"))]),
        )]);
        let (graph, result) = compile(&m);
        result.unwrap();
        let src = graph.find_nodes_of_kind(IrNodeKind::MemorySource)[0];
        match &graph.operator(src).unwrap().kind {
            OperatorKind::MemorySource { start_time, .. } => assert!(start_time.is_some()),
            _ => unreachable!(),
        }
    }
}
