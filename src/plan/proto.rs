//! Wire Plan Format
//!
//! Serializable plan types shipped to executors, plus the row-batch frames
//! that cross sink/source bridges. Hand-written serde types; bincode on the
//! wire. Round-trip equality holds by value.

use crate::ir::JoinType;
use crate::table_store::{RowBatch, RowDescriptor, StoreError};
use crate::types::arrow_adapter::{column_wrapper_from_array, column_wrapper_to_array};
use crate::types::{ColumnWrapper, DataType, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// DAG shapes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DagPb {
    pub nodes: Vec<DagNodePb>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNodePb {
    pub id: i64,
    pub sorted_children: Vec<i64>,
    pub sorted_parents: Vec<i64>,
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpressionPb {
    Constant(ScalarValue),
    /// Column by index into the operator's input relation.
    Column { index: usize },
    Func {
        name: String,
        id: i64,
        args: Vec<ScalarExpressionPb>,
        arg_types: Vec<DataType>,
        return_type: DataType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpressionPb {
    /// Output column name.
    pub name: String,
    pub uda_name: String,
    pub uda_id: i64,
    pub args: Vec<ScalarExpressionPb>,
    pub arg_types: Vec<DataType>,
    pub partial_type: DataType,
    pub finalize_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPb {
    /// Index into the input relation.
    pub index: usize,
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOutputPb {
    /// 0 = left input, 1 = right input.
    pub side: usize,
    pub index: usize,
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorPb {
    MemorySource {
        table: String,
        tablet: String,
        /// Indices into the backing table's relation.
        column_idxs: Vec<usize>,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
        start_time: Option<i64>,
        stop_time: Option<i64>,
    },
    MemorySink {
        name: String,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
    },
    Map {
        expressions: Vec<ScalarExpressionPb>,
        column_names: Vec<String>,
    },
    Filter {
        expression: ScalarExpressionPb,
    },
    BlockingAgg {
        groups: Vec<GroupPb>,
        values: Vec<AggregateExpressionPb>,
        partial_agg: bool,
        finalize_results: bool,
    },
    Union {
        column_names: Vec<String>,
        column_types: Vec<DataType>,
        /// Merge by the time column when present; otherwise interleave.
        ordered: bool,
        time_column_index: Option<usize>,
    },
    Join {
        join_type: JoinType,
        equality_conditions: Vec<(usize, usize)>,
        output_columns: Vec<JoinOutputPb>,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
    },
    Limit {
        limit: i64,
    },
    Rolling {
        window_col_index: usize,
        window_ns: i64,
    },
    GrpcSource {
        source_id: i64,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
    },
    GrpcSink {
        address: String,
        destination_id: i64,
    },
    UdtfSource {
        name: String,
        arg_values: Vec<(String, ScalarValue)>,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
    },
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNodePb {
    pub id: i64,
    pub op: OperatorPb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFragmentPb {
    pub id: i64,
    pub dag: DagPb,
    pub nodes: Vec<PlanNodePb>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanPb {
    pub dag: DagPb,
    pub nodes: Vec<PlanFragmentPb>,
}

/// The distributed plan on the wire: per-instance plans keyed by query
/// broker address, plus the instance DAG (edges = stream connections).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DistributedPlanPb {
    pub qb_address_to_plan: BTreeMap<String, PlanPb>,
    pub qb_address_to_dag_id: BTreeMap<String, i64>,
    pub dag: DagPb,
}

// ============================================================================
// Row batch frames
// ============================================================================

/// The columnar payload of one row batch on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBatchData {
    pub columns: Vec<ColumnWrapper>,
    pub num_rows: usize,
    pub eow: bool,
    pub eos: bool,
}

impl RowBatchData {
    pub fn from_row_batch(rb: &RowBatch) -> Result<Self, StoreError> {
        let columns = rb
            .columns()
            .iter()
            .map(|c| {
                column_wrapper_from_array(c).map_err(|e| StoreError::SchemaMismatch(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RowBatchData { columns, num_rows: rb.num_rows(), eow: rb.eow(), eos: rb.eos() })
    }

    pub fn into_row_batch(self) -> Result<RowBatch, StoreError> {
        let desc = RowDescriptor::new(self.columns.iter().map(|c| c.data_type()).collect());
        let mut rb = RowBatch::new(desc, self.num_rows);
        for col in &self.columns {
            rb.add_column(column_wrapper_to_array(col))?;
        }
        rb.set_eow(self.eow);
        rb.set_eos(self.eos);
        Ok(rb)
    }
}

/// One message of the `TransferRowBatch` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBatchRequest {
    pub address: String,
    pub destination_id: i64,
    pub query_id: Uuid,
    pub row_batch: RowBatchData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBatchResponse {
    pub success: bool,
    pub message: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> PlanPb {
        PlanPb {
            dag: DagPb {
                nodes: vec![DagNodePb { id: 1, sorted_children: vec![], sorted_parents: vec![] }],
            },
            nodes: vec![PlanFragmentPb {
                id: 1,
                dag: DagPb {
                    nodes: vec![
                        DagNodePb { id: 1, sorted_children: vec![2], sorted_parents: vec![] },
                        DagNodePb { id: 2, sorted_children: vec![], sorted_parents: vec![1] },
                    ],
                },
                nodes: vec![
                    PlanNodePb {
                        id: 1,
                        op: OperatorPb::MemorySource {
                            table: "t".to_string(),
                            tablet: String::new(),
                            column_idxs: vec![0, 1],
                            column_names: vec!["time_".to_string(), "cpu".to_string()],
                            column_types: vec![DataType::Time64Ns, DataType::Int64],
                            start_time: Some(970_000_000_000),
                            stop_time: None,
                        },
                    },
                    PlanNodePb {
                        id: 2,
                        op: OperatorPb::MemorySink {
                            name: "out".to_string(),
                            column_names: vec!["time_".to_string(), "cpu".to_string()],
                            column_types: vec![DataType::Time64Ns, DataType::Int64],
                        },
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_plan_round_trip() {
        let plan = sample_plan();
        let bytes = bincode::serialize(&plan).unwrap();
        let back: PlanPb = bincode::deserialize(&bytes).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn test_distributed_plan_round_trip() {
        let mut dplan = DistributedPlanPb::default();
        dplan.qb_address_to_plan.insert("pem1".to_string(), sample_plan());
        dplan.qb_address_to_dag_id.insert("pem1".to_string(), 0);
        dplan.dag.nodes.push(DagNodePb { id: 0, sorted_children: vec![], sorted_parents: vec![] });

        let bytes = bincode::serialize(&dplan).unwrap();
        let back: DistributedPlanPb = bincode::deserialize(&bytes).unwrap();
        assert_eq!(dplan, back);
    }

    #[test]
    fn test_row_batch_request_round_trip() {
        let data = RowBatchData {
            columns: vec![ColumnWrapper::Int64(vec![1, 2, 3])],
            num_rows: 3,
            eow: false,
            eos: true,
        };
        let req = RowBatchRequest {
            address: "kelvin:59300".to_string(),
            destination_id: 10,
            query_id: Uuid::new_v4(),
            row_batch: data,
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: RowBatchRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn test_row_batch_data_conversion() {
        let data = RowBatchData {
            columns: vec![
                ColumnWrapper::Int64(vec![1, 2]),
                ColumnWrapper::String(vec!["a".to_string(), "b".to_string()]),
            ],
            num_rows: 2,
            eow: true,
            eos: false,
        };
        let rb = data.clone().into_row_batch().unwrap();
        assert_eq!(rb.num_rows(), 2);
        assert!(rb.eow());
        let back = RowBatchData::from_row_batch(&rb).unwrap();
        assert_eq!(data, back);
    }
}
