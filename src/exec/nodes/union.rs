//! Union
//!
//! Interleaves its inputs. Two modes: unordered (arbitrary arrival order,
//! preserving within-source order) and ordered (merge by a time column;
//! overlapping ranges tie-break stably by source index).

use super::{ExecError, ExecNode, ExecResult, ExecState};
use crate::plan::OperatorPb;
use crate::table_store::{RowBatch, RowDescriptor};
use crate::types::arrow_adapter::{column_wrapper_to_array, scalar_at};
use crate::types::{ColumnWrapper, DataType, ScalarValue};
use std::collections::VecDeque;

pub struct UnionNode {
    ordered: bool,
    time_column_index: usize,
    column_types: Vec<DataType>,
    open_slots: Vec<bool>,
    /// Ordered mode: buffered rows per input.
    buffers: Vec<VecDeque<Vec<ScalarValue>>>,
    emitted_final: bool,
}

impl UnionNode {
    pub fn new(op: &OperatorPb, num_parents: usize) -> ExecResult<Self> {
        let OperatorPb::Union { ordered, time_column_index, column_types, .. } = op else {
            return Err(ExecError::Internal("expected Union".to_string()));
        };
        let parents = num_parents.max(1);
        Ok(UnionNode {
            ordered: *ordered,
            time_column_index: time_column_index.unwrap_or(0),
            column_types: column_types.clone(),
            open_slots: vec![true; parents],
            buffers: vec![VecDeque::new(); parents],
            emitted_final: false,
        })
    }

    fn desc(&self) -> RowDescriptor {
        RowDescriptor::new(self.column_types.clone())
    }

    fn time_of(&self, row: &[ScalarValue]) -> i64 {
        row[self.time_column_index].as_i64().unwrap_or(0)
    }

    /// Merge rows while every open input has data buffered (or, on final
    /// flush, until everything drains). Ties go to the lowest source index.
    fn merge_ready(&mut self, flush: bool) -> Vec<Vec<ScalarValue>> {
        let mut out = Vec::new();
        loop {
            let ready = if flush {
                self.buffers.iter().any(|b| !b.is_empty())
            } else {
                self.buffers
                    .iter()
                    .zip(self.open_slots.iter())
                    .all(|(b, &open)| !open || !b.is_empty())
                    && self.buffers.iter().any(|b| !b.is_empty())
            };
            if !ready {
                break;
            }
            let mut best: Option<(i64, usize)> = None;
            for (slot, buffer) in self.buffers.iter().enumerate() {
                if let Some(front) = buffer.front() {
                    let t = self.time_of(front);
                    // Strictly-less keeps the stable slot-order tie-break.
                    if best.map(|(bt, _)| t < bt).unwrap_or(true) {
                        best = Some((t, slot));
                    }
                }
            }
            match best {
                Some((_, slot)) => out.push(self.buffers[slot].pop_front().unwrap()),
                None => break,
            }
        }
        out
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

    fn all_closed(&self) -> bool {
        self.open_slots.iter().all(|&open| !open)
    }
}

impl ExecNode for UnionNode {
    fn consume(&mut self, _state: &ExecState, rb: RowBatch, slot: usize) -> ExecResult<Vec<RowBatch>> {
        if slot >= self.open_slots.len() {
            return Err(ExecError::Internal(format!("union has no input slot {}", slot)));
        }
        let closing = rb.eos();

        if !self.ordered {
            if closing {
                self.open_slots[slot] = false;
            }
            let mut out = rb;
            if self.all_closed() && !self.emitted_final {
                self.emitted_final = true;
                out.set_eow(true);
                out.set_eos(true);
                return Ok(vec![out]);
            }
            // Strip stream flags until the last input closes.
            out.set_eow(false);
            out.set_eos(false);
            if out.num_rows() == 0 {
                return Ok(vec![]);
            }
            return Ok(vec![out]);
        }

        // Ordered mode: buffer, then merge what is safe to emit.
        for row in 0..rb.num_rows() {
            let values: Vec<ScalarValue> = (0..rb.num_columns())
                .map(|c| {
                    scalar_at(rb.column(c), row)
                        .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))
                })
                .collect::<ExecResult<_>>()?;
            self.buffers[slot].push_back(values);
        }
        if closing {
            self.open_slots[slot] = false;
        }

        let flush = self.all_closed();
        let rows = self.merge_ready(flush);
        if flush && !self.emitted_final {
            self.emitted_final = true;
            return Ok(vec![self.rows_to_batch(rows, true)?]);
        }
        if rows.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![self.rows_to_batch(rows, false)?])
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

    fn ordered_union(parents: usize) -> UnionNode {
        UnionNode::new(
            &OperatorPb::Union {
                column_names: vec!["time_".to_string(), "v".to_string()],
                column_types: vec![DataType::Time64Ns, DataType::Int64],
                ordered: true,
                time_column_index: Some(0),
            },
            parents,
        )
        .unwrap()
    }

    fn batch(times: Vec<i64>, vals: Vec<i64>, eos: bool) -> RowBatch {
        let mut rb = RowBatch::from_columns(vec![
            column_wrapper_to_array(&ColumnWrapper::Time64Ns(times)),
            column_wrapper_to_array(&ColumnWrapper::Int64(vals)),
        ])
        .unwrap();
        rb.set_eos(eos);
        rb
    }

    fn vals(batches: &[RowBatch]) -> Vec<i64> {
        let mut out = Vec::new();
        for rb in batches {
            match column_wrapper_from_array(rb.column(1)).unwrap() {
                ColumnWrapper::Int64(v) => out.extend(v),
                _ => panic!(),
            }
        }
        out
    }

    #[test]
    fn test_ordered_merge_by_time() {
        let state = test_state();
        let mut node = ordered_union(2);

        let mut out = Vec::new();
        out.extend(node.consume(&state, batch(vec![10, 30], vec![1, 3], true), 0).unwrap());
        out.extend(node.consume(&state, batch(vec![20, 40], vec![2, 4], true), 1).unwrap());

        assert_eq!(vals(&out), vec![1, 2, 3, 4]);
        assert!(out.last().unwrap().eos());
    }

    #[test]
    fn test_ordered_merge_tie_break_by_slot() {
        // Identical timestamps: input 0 rows come first, then input 1.
        let state = test_state();
        let mut node = ordered_union(2);

        let mut out = Vec::new();
        out.extend(node.consume(&state, batch(vec![10, 10], vec![1, 2], true), 0).unwrap());
        out.extend(node.consume(&state, batch(vec![10, 10], vec![3, 4], true), 1).unwrap());

        assert_eq!(vals(&out), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unordered_passthrough_holds_eos_until_all_close() {
        let state = test_state();
        let mut node = UnionNode::new(
            &OperatorPb::Union {
                column_names: vec!["time_".to_string(), "v".to_string()],
                column_types: vec![DataType::Time64Ns, DataType::Int64],
                ordered: false,
                time_column_index: None,
            },
            2,
        )
        .unwrap();

        let out = node.consume(&state, batch(vec![1], vec![10], true), 0).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].eos());

        let out = node.consume(&state, batch(vec![2], vec![20], true), 1).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].eos());
    }

    #[test]
    fn test_single_input_union() {
        let state = test_state();
        let mut node = ordered_union(1);
        let out = node.consume(&state, batch(vec![10, 20], vec![1, 2], true), 0).unwrap();
        assert_eq!(vals(&out), vec![1, 2]);
        assert!(out.last().unwrap().eos());
    }
}
