//! Executor Operator Nodes
//!
//! One exec node per plan operator kind, built from the wire plan. Shared
//! row/column helpers live here.

mod agg;
mod grpc;
mod join;
mod map_filter;
mod memory;
mod union;

pub use agg::BlockingAggNode;
pub use grpc::{GrpcSinkNode, GrpcSourceNode};
pub use join::HashJoinNode;
pub use map_filter::{FilterNode, LimitNode, MapNode, RollingNode};
pub use memory::{MemorySinkNode, MemorySourceNode, UdtfSourceNode};
pub use union::UnionNode;

use super::{ExecError, ExecNode, ExecResult, ExecState};
use crate::plan::{OperatorPb, ScalarExpressionPb};
use crate::table_store::RowBatch;
use crate::types::arrow_adapter::scalar_at;
use crate::types::ScalarValue;

/// Build the exec node for one plan operator. `num_parents` is the
/// operator's input count in the fragment DAG.
pub fn build(
    op: &OperatorPb,
    state: &ExecState,
    num_parents: usize,
) -> ExecResult<Box<dyn ExecNode>> {
    let node: Box<dyn ExecNode> = match op {
        OperatorPb::MemorySource { .. } => Box::new(MemorySourceNode::new(op)?),
        OperatorPb::MemorySink { .. } => Box::new(MemorySinkNode::new(op)?),
        OperatorPb::UdtfSource { .. } => Box::new(UdtfSourceNode::new(op)?),
        OperatorPb::Map { .. } => Box::new(MapNode::new(op, state)?),
        OperatorPb::Filter { .. } => Box::new(FilterNode::new(op, state)?),
        OperatorPb::Limit { .. } => Box::new(LimitNode::new(op)?),
        OperatorPb::Rolling { .. } => Box::new(RollingNode::new(op)?),
        OperatorPb::BlockingAgg { .. } => Box::new(BlockingAggNode::new(op)?),
        OperatorPb::Join { .. } => Box::new(HashJoinNode::new(op)?),
        OperatorPb::Union { .. } => Box::new(UnionNode::new(op, num_parents)?),
        OperatorPb::GrpcSink { .. } => Box::new(GrpcSinkNode::new(op)?),
        OperatorPb::GrpcSource { .. } => Box::new(GrpcSourceNode::new(op)?),
    };
    Ok(node)
}

/// Evaluate a lowered Column/Constant expression for a single row. The plan
/// guarantees aggregate arguments take only these two shapes.
pub(crate) fn scalar_expr_at(
    expr: &ScalarExpressionPb,
    rb: &RowBatch,
    row: usize,
) -> ExecResult<ScalarValue> {
    match expr {
        ScalarExpressionPb::Constant(v) => Ok(v.clone()),
        ScalarExpressionPb::Column { index } => {
            scalar_at(rb.column(*index), row).map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))
        }
        ScalarExpressionPb::Func { name, .. } => Err(ExecError::Internal(format!(
            "nested function '{}' where a column or constant was expected",
            name
        ))),
    }
}

/// A placeholder value for the missing side of an outer join row.
pub(crate) fn default_value(dtype: crate::types::DataType) -> ScalarValue {
    use crate::types::DataType;
    match dtype {
        DataType::Boolean => ScalarValue::Boolean(false),
        DataType::Int64 => ScalarValue::Int64(0),
        DataType::Uint128 => ScalarValue::Uint128(0),
        DataType::Float64 => ScalarValue::Float64(0.0),
        DataType::String => ScalarValue::String(String::new()),
        DataType::Time64Ns => ScalarValue::Time64Ns(0),
        DataType::Unknown => ScalarValue::Int64(0),
    }
}
