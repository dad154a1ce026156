//! Hash Join
//!
//! Builds a hash table over the left input, probes with the right, and
//! projects the configured output column subset. Inner, left, right, and
//! full outer variants share the implementation; unmatched rows on an outer
//! side are padded with type defaults.

use super::{default_value, ExecError, ExecNode, ExecResult, ExecState};
use crate::ir::JoinType;
use crate::plan::{JoinOutputPb, OperatorPb};
use crate::table_store::RowBatch;
use crate::types::arrow_adapter::{column_wrapper_to_array, scalar_at};
use crate::types::{ColumnWrapper, DataType, RowTuple, ScalarValue};
use std::collections::HashMap;

pub struct HashJoinNode {
    join_type: JoinType,
    equality: Vec<(usize, usize)>,
    output: Vec<JoinOutputPb>,
    column_types: Vec<DataType>,

    left_rows: Vec<Vec<ScalarValue>>,
    left_index: HashMap<RowTuple, Vec<usize>>,
    left_matched: Vec<bool>,
    left_done: bool,
    right_done: bool,
    /// Right batches arriving before the build side finishes.
    right_pending: Vec<RowBatch>,
    emitted_final: bool,
}

impl HashJoinNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::Join {
            join_type, equality_conditions, output_columns, column_types, ..
        } = op
        else {
            return Err(ExecError::Internal("expected Join".to_string()));
        };
        Ok(HashJoinNode {
            join_type: *join_type,
            equality: equality_conditions.clone(),
            output: output_columns.clone(),
            column_types: column_types.clone(),
            left_rows: Vec::new(),
            left_index: HashMap::new(),
            left_matched: Vec::new(),
            left_done: false,
            right_done: false,
            right_pending: Vec::new(),
            emitted_final: false,
        })
    }

    fn row_values(rb: &RowBatch, row: usize) -> ExecResult<Vec<ScalarValue>> {
        (0..rb.num_columns())
            .map(|c| {
                scalar_at(rb.column(c), row)
                    .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))
            })
            .collect()
    }

    fn left_key(&self, values: &[ScalarValue]) -> RowTuple {
        RowTuple(self.equality.iter().map(|(l, _)| values[*l].clone()).collect())
    }

    fn right_key(&self, values: &[ScalarValue]) -> RowTuple {
        RowTuple(self.equality.iter().map(|(_, r)| values[*r].clone()).collect())
    }

    fn project(&self, left: Option<&[ScalarValue]>, right: Option<&[ScalarValue]>) -> Vec<ScalarValue> {
        self.output
            .iter()
            .enumerate()
            .map(|(out_idx, col)| {
                let side = if col.side == 0 { left } else { right };
                side.map(|vals| vals[col.index].clone())
                    .unwrap_or_else(|| default_value(self.column_types[out_idx]))
            })
            .collect()
    }

    fn probe_batch(&mut self, rb: &RowBatch, out: &mut Vec<Vec<ScalarValue>>) -> ExecResult<()> {
        for row in 0..rb.num_rows() {
            let values = Self::row_values(rb, row)?;
            let key = self.right_key(&values);
            match self.left_index.get(&key).cloned() {
                Some(indices) => {
                    for i in indices {
                        self.left_matched[i] = true;
                        out.push(self.project(Some(&self.left_rows[i]), Some(&values)));
                    }
                }
                None => {
                    if matches!(self.join_type, JoinType::RightOuter | JoinType::FullOuter) {
                        out.push(self.project(None, Some(&values)));
                    }
                }
            }
        }
        Ok(())
    }

    fn rows_to_batch(&self, rows: Vec<Vec<ScalarValue>>, eos: bool) -> ExecResult<RowBatch> {
        let mut columns: Vec<ColumnWrapper> = self
            .column_types
            .iter()
            .map(|&t| ColumnWrapper::with_capacity(t, rows.len()))
            .collect();
        for row in rows {
            for (col, v) in columns.iter_mut().zip(row.into_iter()) {
                col.push(v);
            }
        }
        let mut rb =
            RowBatch::from_columns(columns.iter().map(column_wrapper_to_array).collect())?;
        rb.set_eow(eos);
        rb.set_eos(eos);
        Ok(rb)
    }

    /// Unmatched build-side rows for left/full outer joins.
    fn drain_unmatched_left(&self, out: &mut Vec<Vec<ScalarValue>>) {
        if matches!(self.join_type, JoinType::LeftOuter | JoinType::FullOuter) {
            for (i, matched) in self.left_matched.iter().enumerate() {
                if !matched {
                    out.push(self.project(Some(&self.left_rows[i]), None));
                }
            }
        }
    }
}

impl ExecNode for HashJoinNode {
    fn consume(&mut self, _state: &ExecState, rb: RowBatch, slot: usize) -> ExecResult<Vec<RowBatch>> {
        let mut out_rows: Vec<Vec<ScalarValue>> = Vec::new();

        if slot == 0 {
            // Build side.
            for row in 0..rb.num_rows() {
                let values = Self::row_values(&rb, row)?;
                let key = self.left_key(&values);
                self.left_index.entry(key).or_default().push(self.left_rows.len());
                self.left_rows.push(values);
                self.left_matched.push(false);
            }
            if rb.eos() {
                self.left_done = true;
                // Probe everything buffered while building.
                let pending = std::mem::take(&mut self.right_pending);
                for pending_rb in &pending {
                    self.probe_batch(pending_rb, &mut out_rows)?;
                }
            }
        } else {
            if !self.left_done {
                self.right_pending.push(rb.clone());
                if rb.eos() {
                    self.right_done = true;
                }
                return Ok(vec![]);
            }
            self.probe_batch(&rb, &mut out_rows)?;
            if rb.eos() {
                self.right_done = true;
            }
        }

        let finished = self.left_done && self.right_done && !self.emitted_final;
        if finished {
            self.emitted_final = true;
            self.drain_unmatched_left(&mut out_rows);
            return Ok(vec![self.rows_to_batch(out_rows, true)?]);
        }
        if out_rows.is_empty() {
            Ok(vec![])
        } else {
            Ok(vec![self.rows_to_batch(out_rows, false)?])
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{EvaluatorKind, GrpcRouter};
    use crate::table_store::TableStore;
    use crate::types::arrow_adapter::column_wrapper_from_array;
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

    fn join_op(join_type: JoinType) -> OperatorPb {
        // left: (id, a)  right: (id, b)  output: id(left), a, b
        OperatorPb::Join {
            join_type,
            equality_conditions: vec![(0, 0)],
            output_columns: vec![
                JoinOutputPb { side: 0, index: 0 },
                JoinOutputPb { side: 0, index: 1 },
                JoinOutputPb { side: 1, index: 1 },
            ],
            column_names: vec!["id".to_string(), "a".to_string(), "b".to_string()],
            column_types: vec![DataType::Int64, DataType::Int64, DataType::Int64],
        }
    }

    fn batch(ids: Vec<i64>, vals: Vec<i64>, eos: bool) -> RowBatch {
        let mut rb = RowBatch::from_columns(vec![
            column_wrapper_to_array(&ColumnWrapper::Int64(ids)),
            column_wrapper_to_array(&ColumnWrapper::Int64(vals)),
        ])
        .unwrap();
        rb.set_eos(eos);
        rb
    }

    fn collect_rows(batches: &[RowBatch]) -> Vec<(i64, i64, i64)> {
        let mut rows = Vec::new();
        for rb in batches {
            let c0 = match column_wrapper_from_array(rb.column(0)).unwrap() {
                ColumnWrapper::Int64(v) => v,
                _ => panic!(),
            };
            let c1 = match column_wrapper_from_array(rb.column(1)).unwrap() {
                ColumnWrapper::Int64(v) => v,
                _ => panic!(),
            };
            let c2 = match column_wrapper_from_array(rb.column(2)).unwrap() {
                ColumnWrapper::Int64(v) => v,
                _ => panic!(),
            };
            for i in 0..c0.len() {
                rows.push((c0[i], c1[i], c2[i]));
            }
        }
        rows.sort();
        rows
    }

    #[test]
    fn test_inner_join() {
        let state = test_state();
        let mut node = HashJoinNode::new(&join_op(JoinType::Inner)).unwrap();

        let mut out = Vec::new();
        out.extend(node.consume(&state, batch(vec![1, 2], vec![10, 20], true), 0).unwrap());
        out.extend(node.consume(&state, batch(vec![2, 3], vec![200, 300], true), 1).unwrap());

        assert_eq!(collect_rows(&out), vec![(2, 20, 200)]);
        assert!(out.last().unwrap().eos());
    }

    #[test]
    fn test_right_batches_before_left_finish_are_buffered() {
        let state = test_state();
        let mut node = HashJoinNode::new(&join_op(JoinType::Inner)).unwrap();

        // Right arrives first and must wait for the build side.
        assert!(node.consume(&state, batch(vec![2], vec![200], true), 1).unwrap().is_empty());
        let out = node.consume(&state, batch(vec![1, 2], vec![10, 20], true), 0).unwrap();
        assert_eq!(collect_rows(&out), vec![(2, 20, 200)]);
    }

    #[test]
    fn test_left_outer_pads_unmatched() {
        let state = test_state();
        let mut node = HashJoinNode::new(&join_op(JoinType::LeftOuter)).unwrap();

        let mut out = Vec::new();
        out.extend(node.consume(&state, batch(vec![1, 2], vec![10, 20], true), 0).unwrap());
        out.extend(node.consume(&state, batch(vec![2], vec![200], true), 1).unwrap());

        assert_eq!(collect_rows(&out), vec![(1, 10, 0), (2, 20, 200)]);
    }

    #[test]
    fn test_full_outer_pads_both_sides() {
        let state = test_state();
        let mut node = HashJoinNode::new(&join_op(JoinType::FullOuter)).unwrap();

        let mut out = Vec::new();
        out.extend(node.consume(&state, batch(vec![1], vec![10], true), 0).unwrap());
        out.extend(node.consume(&state, batch(vec![3], vec![300], true), 1).unwrap());

        assert_eq!(collect_rows(&out), vec![(0, 0, 300), (1, 10, 0)]);
    }

    #[test]
    fn test_duplicate_keys_produce_cross_rows() {
        let state = test_state();
        let mut node = HashJoinNode::new(&join_op(JoinType::Inner)).unwrap();

        let mut out = Vec::new();
        out.extend(node.consume(&state, batch(vec![1, 1], vec![10, 11], true), 0).unwrap());
        out.extend(node.consume(&state, batch(vec![1, 1], vec![100, 101], true), 1).unwrap());

        assert_eq!(
            collect_rows(&out),
            vec![(1, 10, 100), (1, 10, 101), (1, 11, 100), (1, 11, 101)]
        );
    }
}
