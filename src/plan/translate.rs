//! IR → Wire Plan Lowering
//!
//! Turns one fully analyzed IR graph into a single-fragment `PlanPb`.
//! Expressions lower to `ScalarExpressionPb` trees; every column reference
//! has been resolved to an index by the analyzer before lowering runs.

use super::proto::*;
use crate::compiler::error::{CompilerError, CompilerResult};
use crate::ir::{ExpressionKind, IrGraph, NodeId, OperatorKind};
use crate::types::{DataType, ScalarValue};
use crate::udf::Registry;

/// Lower an analyzed graph to the wire plan. The registry supplies UDA
/// partial types for the aggregate expressions.
pub fn plan_from_graph(graph: &IrGraph, registry: &Registry) -> CompilerResult<PlanPb> {
    let op_ids: Vec<NodeId> = graph
        .topological_sort()
        .into_iter()
        .filter(|&id| graph.is_operator(id))
        .collect();

    let mut nodes = Vec::with_capacity(op_ids.len());
    let mut dag_nodes = Vec::with_capacity(op_ids.len());
    for &id in &op_ids {
        let op_pb = lower_operator(graph, id, registry)?;
        nodes.push(PlanNodePb { id: id as i64, op: op_pb });

        let children: Vec<i64> = graph
            .dependencies_of(id)
            .into_iter()
            .filter(|&c| graph.is_operator(c))
            .map(|c| c as i64)
            .collect();
        let parents: Vec<i64> = graph
            .operator(id)?
            .parents
            .iter()
            .map(|&p| p as i64)
            .collect();
        dag_nodes.push(DagNodePb { id: id as i64, sorted_children: children, sorted_parents: parents });
    }

    Ok(PlanPb {
        dag: DagPb {
            nodes: vec![DagNodePb { id: 1, sorted_children: vec![], sorted_parents: vec![] }],
        },
        nodes: vec![PlanFragmentPb { id: 1, dag: DagPb { nodes: dag_nodes }, nodes }],
    })
}

fn lower_operator(graph: &IrGraph, id: NodeId, registry: &Registry) -> CompilerResult<OperatorPb> {
    let loc = graph.loc(id);
    let op = graph.operator(id)?;
    let relation = op.relation.clone().ok_or_else(|| CompilerError::TypeMismatch {
        loc,
        msg: "cannot lower an operator without a relation".to_string(),
    })?;
    let column_names: Vec<String> = relation.col_names().iter().map(|s| s.to_string()).collect();
    let column_types = relation.col_types();

    let pb = match &op.kind {
        OperatorKind::MemorySource {
            table, tablet, column_ids, time_start_ns, time_stop_ns, ..
        } => {
            let mut column_idxs = Vec::with_capacity(column_ids.len());
            for &col in column_ids {
                match &graph.expression(col)?.kind {
                    ExpressionKind::Column { index: Some(idx), .. } => column_idxs.push(*idx),
                    _ => {
                        return Err(CompilerError::InvalidColumn {
                            loc,
                            msg: "memory source column is unresolved".to_string(),
                        })
                    }
                }
            }
            OperatorPb::MemorySource {
                table: table.clone(),
                tablet: tablet.clone(),
                column_idxs,
                column_names,
                column_types,
                start_time: *time_start_ns,
                stop_time: *time_stop_ns,
            }
        }
        OperatorKind::MemorySink { name } => OperatorPb::MemorySink {
            name: name.clone(),
            column_names,
            column_types,
        },
        OperatorKind::Map { col_exprs, .. } => OperatorPb::Map {
            expressions: col_exprs
                .iter()
                .map(|ce| lower_expr(graph, ce.expr))
                .collect::<CompilerResult<_>>()?,
            column_names,
        },
        OperatorKind::Filter { predicate } => OperatorPb::Filter {
            expression: lower_expr(graph, *predicate)?,
        },
        OperatorKind::BlockingAgg { groups, agg_exprs, partial_agg, finalize_results } => {
            let mut groups_pb = Vec::with_capacity(groups.len());
            for (i, &g) in groups.iter().enumerate() {
                let expr = graph.expression(g)?;
                let index = match &expr.kind {
                    ExpressionKind::Column { index: Some(idx), .. }
                    | ExpressionKind::Metadata { index: Some(idx), .. } => *idx,
                    _ => {
                        return Err(CompilerError::InvalidColumn {
                            loc,
                            msg: "aggregate group key is unresolved".to_string(),
                        })
                    }
                };
                groups_pb.push(GroupPb {
                    index,
                    name: column_names[i].clone(),
                    data_type: expr.dtype,
                });
            }
            let mut values = Vec::with_capacity(agg_exprs.len());
            for ce in agg_exprs {
                let expr = graph.expression(ce.expr)?;
                let (uda_name, uda_id, args, arg_types) = match &expr.kind {
                    ExpressionKind::Func { name, udf_id, args, arg_types } => (
                        name.clone(),
                        udf_id.ok_or_else(|| CompilerError::NoSuchFunction {
                            loc,
                            name: name.clone(),
                            arg_types: arg_types.clone(),
                        })?,
                        args.clone(),
                        arg_types.clone(),
                    ),
                    _ => {
                        return Err(CompilerError::InvalidArgument {
                            loc,
                            msg: "aggregate expressions must be function calls".to_string(),
                        })
                    }
                };
                let def = registry.get_uda(&uda_name, &arg_types).ok_or_else(|| {
                    CompilerError::NoSuchFunction {
                        loc,
                        name: uda_name.clone(),
                        arg_types: arg_types.clone(),
                    }
                })?;
                values.push(AggregateExpressionPb {
                    name: ce.name.clone(),
                    uda_name,
                    uda_id,
                    args: args
                        .iter()
                        .map(|&a| lower_expr(graph, a))
                        .collect::<CompilerResult<_>>()?,
                    arg_types,
                    partial_type: def.partial_type,
                    finalize_type: def.finalize_type,
                });
            }
            OperatorPb::BlockingAgg {
                groups: groups_pb,
                values,
                partial_agg: *partial_agg,
                finalize_results: *finalize_results,
            }
        }
        OperatorKind::Union {} => {
            let time_column_index = relation.col_index("time_");
            OperatorPb::Union {
                column_names,
                column_types,
                ordered: time_column_index.is_some(),
                time_column_index,
            }
        }
        OperatorKind::Join { join_type, equality_conditions, output_columns, .. } => {
            OperatorPb::Join {
                join_type: *join_type,
                equality_conditions: equality_conditions.clone(),
                output_columns: output_columns
                    .iter()
                    .map(|c| JoinOutputPb { side: c.side, index: c.index })
                    .collect(),
                column_names,
                column_types,
            }
        }
        OperatorKind::Limit { limit } => OperatorPb::Limit { limit: *limit },
        OperatorKind::Rolling { window_col, window_ns } => {
            let window_col_index =
                relation.col_index(window_col).ok_or_else(|| CompilerError::InvalidColumn {
                    loc,
                    msg: format!("rolling window column '{}' not in relation", window_col),
                })?;
            OperatorPb::Rolling { window_col_index, window_ns: *window_ns }
        }
        OperatorKind::GrpcSource { source_id } => OperatorPb::GrpcSource {
            source_id: *source_id,
            column_names,
            column_types,
        },
        OperatorKind::GrpcSink { destination_id, destination_address } => OperatorPb::GrpcSink {
            address: destination_address.clone(),
            destination_id: *destination_id,
        },
        OperatorKind::UdtfSource { name, arg_values } => {
            let mut values = Vec::with_capacity(arg_values.len());
            for (arg_name, expr_id) in arg_values {
                let value = literal_value(graph, *expr_id).ok_or_else(|| {
                    CompilerError::InvalidArgument {
                        loc,
                        msg: format!("UDTF argument '{}' must be a literal", arg_name),
                    }
                })?;
                values.push((arg_name.clone(), value));
            }
            OperatorPb::UdtfSource {
                name: name.clone(),
                arg_values: values,
                column_names,
                column_types,
            }
        }
        other => {
            return Err(CompilerError::UnsupportedOperator {
                loc,
                msg: format!(
                    "operator {:?} must not appear in a finalized plan",
                    other.kind()
                ),
            })
        }
    };
    Ok(pb)
}

/// Lower one expression subtree.
pub fn lower_expr(graph: &IrGraph, id: NodeId) -> CompilerResult<ScalarExpressionPb> {
    let loc = graph.loc(id);
    let expr = graph.expression(id)?;
    let pb = match &expr.kind {
        ExpressionKind::Int(v) => ScalarExpressionPb::Constant(ScalarValue::Int64(*v)),
        ExpressionKind::Float(v) => ScalarExpressionPb::Constant(ScalarValue::Float64(*v)),
        ExpressionKind::Bool(v) => ScalarExpressionPb::Constant(ScalarValue::Boolean(*v)),
        ExpressionKind::Str(s) => ScalarExpressionPb::Constant(ScalarValue::String(s.clone())),
        ExpressionKind::Time(v) => ScalarExpressionPb::Constant(ScalarValue::Time64Ns(*v)),
        ExpressionKind::Uint128(v) => ScalarExpressionPb::Constant(ScalarValue::Uint128(*v)),
        ExpressionKind::Column { index: Some(idx), .. }
        | ExpressionKind::Metadata { index: Some(idx), .. } => {
            ScalarExpressionPb::Column { index: *idx }
        }
        ExpressionKind::Column { name, .. } => {
            return Err(CompilerError::InvalidColumn {
                loc,
                msg: format!("column '{}' is unresolved at lowering time", name),
            })
        }
        ExpressionKind::Metadata { property, .. } => {
            return Err(CompilerError::InvalidColumn {
                loc,
                msg: format!("metadata '{}' is unresolved at lowering time", property),
            })
        }
        ExpressionKind::MetadataLiteral { literal } => return lower_expr(graph, *literal),
        ExpressionKind::Func { name, args, udf_id, arg_types } => ScalarExpressionPb::Func {
            name: name.clone(),
            id: udf_id.ok_or_else(|| CompilerError::NoSuchFunction {
                loc,
                name: name.clone(),
                arg_types: arg_types.clone(),
            })?,
            args: args
                .iter()
                .map(|&a| lower_expr(graph, a))
                .collect::<CompilerResult<_>>()?,
            arg_types: arg_types.clone(),
            return_type: expr.dtype,
        },
        ExpressionKind::Lambda { .. } => {
            return Err(CompilerError::UnsupportedOperator {
                loc,
                msg: "lambda must not survive analysis".to_string(),
            })
        }
    };
    Ok(pb)
}

/// Extract a literal's scalar value.
fn literal_value(graph: &IrGraph, id: NodeId) -> Option<ScalarValue> {
    match &graph.expression(id).ok()?.kind {
        ExpressionKind::Int(v) => Some(ScalarValue::Int64(*v)),
        ExpressionKind::Float(v) => Some(ScalarValue::Float64(*v)),
        ExpressionKind::Bool(v) => Some(ScalarValue::Boolean(*v)),
        ExpressionKind::Str(s) => Some(ScalarValue::String(s.clone())),
        ExpressionKind::Time(v) => Some(ScalarValue::Time64Ns(*v)),
        ExpressionKind::Uint128(v) => Some(ScalarValue::Uint128(*v)),
        ExpressionKind::MetadataLiteral { literal } => literal_value(graph, *literal),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
