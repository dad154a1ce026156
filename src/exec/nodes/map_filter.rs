//! Streaming Operators: Map, Filter, Limit, Rolling
//!
//! Each emits one output batch per input batch.

use super::{ExecError, ExecNode, ExecResult, ExecState};
use crate::exec::evaluator::{create_evaluator, ScalarExpressionEvaluator};
use crate::plan::OperatorPb;
use crate::table_store::RowBatch;
use crate::types::arrow_adapter::{column_wrapper_from_array, column_wrapper_to_array};
use crate::types::ColumnWrapper;
use arrow::array::BooleanArray;
use arrow::compute::filter as arrow_filter;

// ============================================================================
// Map
// ============================================================================

/// Evaluates each projection expression over the input batch, producing a
/// batch with the same row count.
pub struct MapNode {
    evaluator: Box<dyn ScalarExpressionEvaluator>,
}

impl MapNode {
    pub fn new(op: &OperatorPb, state: &ExecState) -> ExecResult<Self> {
        let OperatorPb::Map { expressions, .. } = op else {
            return Err(ExecError::Internal("expected Map".to_string()));
        };
        Ok(MapNode {
            evaluator: create_evaluator(expressions.clone(), state.evaluator_kind),
        })
    }
}

impl ExecNode for MapNode {
    fn open(&mut self, state: &ExecState) -> ExecResult<()> {
        self.evaluator.open(state)
    }

    fn consume(&mut self, state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        let columns = self.evaluator.evaluate(state, &rb)?;
        let mut out = RowBatch::from_columns(columns)?;
        out.set_eow(rb.eow());
        out.set_eos(rb.eos());
        Ok(vec![out])
    }

    fn close(&mut self, state: &ExecState) -> ExecResult<()> {
        self.evaluator.close(state)
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Evaluates a boolean predicate and emits a compacted batch containing only
/// the rows where it held. A predicate that never holds still propagates the
/// stream flags.
pub struct FilterNode {
    evaluator: Box<dyn ScalarExpressionEvaluator>,
}

impl FilterNode {
    pub fn new(op: &OperatorPb, state: &ExecState) -> ExecResult<Self> {
        let OperatorPb::Filter { expression } = op else {
            return Err(ExecError::Internal("expected Filter".to_string()));
        };
        Ok(FilterNode {
            evaluator: create_evaluator(vec![expression.clone()], state.evaluator_kind),
        })
    }
}

impl ExecNode for FilterNode {
    fn open(&mut self, state: &ExecState) -> ExecResult<()> {
        self.evaluator.open(state)
    }

    fn consume(&mut self, state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        let selection = self.evaluator.evaluate(state, &rb)?.remove(0);
        let mask = selection
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| {
                ExecError::BatchSchemaMismatch("filter predicate did not yield booleans".to_string())
            })?
            .clone();
        let columns = rb
            .columns()
            .iter()
            .map(|c| {
                arrow_filter(c, &mask).map_err(|e| ExecError::Internal(e.to_string()))
            })
            .collect::<ExecResult<Vec<_>>>()?;
        let mut out = RowBatch::from_columns(columns)?;
        out.set_eow(rb.eow());
        out.set_eos(rb.eos());
        Ok(vec![out])
    }

    fn close(&mut self, state: &ExecState) -> ExecResult<()> {
        self.evaluator.close(state)
    }
}

// ============================================================================
// Limit
// ============================================================================

/// Emits rows until the configured count; on reaching it, signals
/// `stop_limit_reached` so upstream operators cease producing.
pub struct LimitNode {
    remaining: i64,
}

impl LimitNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::Limit { limit } = op else {
            return Err(ExecError::Internal("expected Limit".to_string()));
        };
        Ok(LimitNode { remaining: *limit })
    }
}

impl ExecNode for LimitNode {
    fn consume(&mut self, state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        if self.remaining <= 0 {
            // Already satisfied; swallow trailing batches.
            return Ok(vec![]);
        }
        let take = (rb.num_rows() as i64).min(self.remaining) as usize;
        let mut out = if take == rb.num_rows() {
            rb.clone()
        } else {
            rb.slice(0, take)
        };
        self.remaining -= take as i64;
        out.set_eow(rb.eow());
        out.set_eos(rb.eos());
        if self.remaining == 0 {
            out.set_eow(true);
            out.set_eos(true);
            state.signal_limit_reached();
        }
        Ok(vec![out])
    }
}

// ============================================================================
// Rolling
// ============================================================================

/// Buckets the window column into fixed windows: each value is floored to
/// the start of its window, ready for a downstream group-by.
pub struct RollingNode {
    window_col_index: usize,
    window_ns: i64,
}

impl RollingNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::Rolling { window_col_index, window_ns } = op else {
            return Err(ExecError::Internal("expected Rolling".to_string()));
        };
        if *window_ns <= 0 {
            return Err(ExecError::Internal("rolling window must be positive".to_string()));
        }
        Ok(RollingNode { window_col_index: *window_col_index, window_ns: *window_ns })
    }
}

impl ExecNode for RollingNode {
    fn consume(&mut self, _state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        let col = column_wrapper_from_array(rb.column(self.window_col_index))
            .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))?;
        let bucketed = match col {
            ColumnWrapper::Time64Ns(v) => ColumnWrapper::Time64Ns(
                v.into_iter().map(|t| t - t.rem_euclid(self.window_ns)).collect(),
            ),
            ColumnWrapper::Int64(v) => ColumnWrapper::Int64(
                v.into_iter().map(|t| t - t.rem_euclid(self.window_ns)).collect(),
            ),
            other => {
                return Err(ExecError::BatchSchemaMismatch(format!(
                    "rolling window column holds {}",
                    other.data_type()
                )))
            }
        };
        let mut columns = rb.columns().to_vec();
        columns[self.window_col_index] = column_wrapper_to_array(&bucketed);
        let mut out = RowBatch::from_columns(columns)?;
        out.set_eow(rb.eow());
        out.set_eos(rb.eos());
        Ok(vec![out])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{EvaluatorKind, GrpcRouter};
    use crate::plan::ScalarExpressionPb;
    use crate::table_store::TableStore;
    use crate::types::{DataType, ScalarValue};
    use crate::udf::Registry;
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_state() -> ExecState {
        ExecState::new(
            Uuid::new_v4(),
            Arc::new(TableStore::new()),
            Arc::new(Registry::with_builtins()),
            Arc::new(GrpcRouter::new()),
            EvaluatorKind::VectorNative,
            1024,
        )
    }

    fn int_batch(vals: Vec<i64>, eos: bool) -> RowBatch {
        let mut rb =
            RowBatch::from_columns(vec![column_wrapper_to_array(&ColumnWrapper::Int64(vals))])
                .unwrap();
        rb.set_eos(eos);
        rb
    }

    #[test]
    fn test_filter_compacts_and_keeps_eos() {
        let mut state = test_state();
        let def = state
            .registry
            .get_udf("greater_than", &[DataType::Int64, DataType::Int64])
            .unwrap();
        state.scalar_udfs.insert(0, def);

        let op = OperatorPb::Filter {
            expression: ScalarExpressionPb::Func {
                name: "greater_than".to_string(),
                id: 0,
                args: vec![
                    ScalarExpressionPb::Column { index: 0 },
                    ScalarExpressionPb::Constant(ScalarValue::Int64(2)),
                ],
                arg_types: vec![DataType::Int64, DataType::Int64],
                return_type: DataType::Boolean,
            },
        };
        let mut node = FilterNode::new(&op, &state).unwrap();
        node.open(&state).unwrap();

        let out = node.consume(&state, int_batch(vec![1, 3, 2, 5], true), 0).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].num_rows(), 2);
        assert!(out[0].eos());
        assert_eq!(
            column_wrapper_from_array(out[0].column(0)).unwrap(),
            ColumnWrapper::Int64(vec![3, 5])
        );
    }

    #[test]
    fn test_always_false_filter_propagates_eos() {
        let state = test_state();
        let op = OperatorPb::Filter {
            expression: ScalarExpressionPb::Constant(ScalarValue::Boolean(false)),
        };
        let mut node = FilterNode::new(&op, &state).unwrap();
        node.open(&state).unwrap();

        let out = node.consume(&state, int_batch(vec![1, 2], true), 0).unwrap();
        assert_eq!(out[0].num_rows(), 0);
        assert!(out[0].eos());
    }

    #[test]
    fn test_limit_truncates_and_signals() {
        let state = test_state();
        let mut node = LimitNode::new(&OperatorPb::Limit { limit: 3 }).unwrap();

        let out = node.consume(&state, int_batch(vec![1, 2], false), 0).unwrap();
        assert_eq!(out[0].num_rows(), 2);
        assert!(!out[0].eos());
        assert!(!state.limit_reached());

        let out = node.consume(&state, int_batch(vec![3, 4, 5], false), 0).unwrap();
        assert_eq!(out[0].num_rows(), 1);
        assert!(out[0].eos());
        assert!(state.limit_reached());
    }

    #[test]
    fn test_limit_underrun_forwards_eos() {
        let state = test_state();
        let mut node = LimitNode::new(&OperatorPb::Limit { limit: 10 }).unwrap();
        let out = node.consume(&state, int_batch(vec![1, 2], true), 0).unwrap();
        assert_eq!(out[0].num_rows(), 2);
        assert!(out[0].eos());
        assert!(!state.limit_reached());
    }

    #[test]
    fn test_rolling_buckets_time() {
        let state = test_state();
        let mut node = RollingNode::new(&OperatorPb::Rolling {
            window_col_index: 0,
            window_ns: 10,
        })
        .unwrap();
        let rb = RowBatch::from_columns(vec![column_wrapper_to_array(
            &ColumnWrapper::Time64Ns(vec![5, 14, 23, 30]),
        )])
        .unwrap();
        let out = node.consume(&state, rb, 0).unwrap();
        assert_eq!(
            column_wrapper_from_array(out[0].column(0)).unwrap(),
            ColumnWrapper::Time64Ns(vec![0, 10, 20, 30])
        );
    }

    #[test]
    fn test_map_projects() {
        let state = test_state();
        let op = OperatorPb::Map {
            expressions: vec![
                ScalarExpressionPb::Column { index: 0 },
                ScalarExpressionPb::Constant(ScalarValue::Int64(7)),
            ],
            column_names: vec!["cpu".to_string(), "seven".to_string()],
        };
        let mut node = MapNode::new(&op, &state).unwrap();
        node.open(&state).unwrap();

        let out = node.consume(&state, int_batch(vec![1, 2], true), 0).unwrap();
        assert_eq!(out[0].num_columns(), 2);
        assert_eq!(out[0].num_rows(), 2);
        assert_eq!(
            column_wrapper_from_array(out[0].column(1)).unwrap(),
            ColumnWrapper::Int64(vec![7, 7])
        );
        assert!(out[0].eos());
    }
}
