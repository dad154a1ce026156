//! # Plan Serialization
//!
//! Lowers an analyzed IR graph into the wire plan format consumed by
//! executors, and defines the serialized shapes themselves (`proto`).

pub mod proto;
pub mod translate;

pub use proto::{
    AggregateExpressionPb, DagNodePb, DagPb, DistributedPlanPb, GroupPb, JoinOutputPb, OperatorPb,
    PlanFragmentPb, PlanNodePb, PlanPb, RowBatchData, RowBatchRequest, RowBatchResponse,
    ScalarExpressionPb,
};
pub use translate::plan_from_graph;
