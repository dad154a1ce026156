//! Memory & UDTF Sources, Memory Sink

use super::{ExecError, ExecNode, ExecResult, ExecState};
use crate::plan::OperatorPb;
use crate::table_store::{BatchPosition, RowBatch, RowDescriptor, Table};
use crate::types::arrow_adapter::column_wrapper_to_array;
use crate::types::{ColumnWrapper, DataType, Relation, ScalarValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

// ============================================================================
// Memory source
// ============================================================================

/// Reads batches of configured size from a (tablet of a) named table; emits
/// EOS when exhausted. Time bounds restrict the scanned row range.
pub struct MemorySourceNode {
    table_name: String,
    tablet: String,
    column_idxs: Vec<usize>,
    desc: RowDescriptor,
    start_time: Option<i64>,
    stop_time: Option<i64>,

    table: Option<Arc<Table>>,
    position: BatchPosition,
    /// Exclusive scan end.
    end: Option<BatchPosition>,
    num_batches: usize,
    done: bool,
}

impl MemorySourceNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::MemorySource {
            table, tablet, column_idxs, column_types, start_time, stop_time, ..
        } = op
        else {
            return Err(ExecError::Internal("expected MemorySource".to_string()));
        };
        Ok(MemorySourceNode {
            table_name: table.clone(),
            tablet: tablet.clone(),
            column_idxs: column_idxs.clone(),
            desc: RowDescriptor::new(column_types.clone()),
            start_time: *start_time,
            stop_time: *stop_time,
            table: None,
            position: BatchPosition { batch_idx: 0, row_idx: 0 },
            end: None,
            num_batches: 0,
            done: false,
        })
    }

    fn time_col_idx(table: &Table) -> Option<usize> {
        table.relation().col_index("time_")
    }
}

impl ExecNode for MemorySourceNode {
    fn is_source(&self) -> bool {
        true
    }

    fn open(&mut self, state: &ExecState) -> ExecResult<()> {
        let table = state.table_store.get_tablet(&self.table_name, &self.tablet)?;
        self.num_batches = table.num_batches();

        if let Some(start) = self.start_time {
            if let Some(idx) = Self::time_col_idx(&table) {
                match table.find_batch_at_or_after(idx, start)? {
                    Some(pos) => self.position = pos,
                    // Nothing at or after the start bound: scan is empty.
                    None => {
                        self.position =
                            BatchPosition { batch_idx: self.num_batches, row_idx: 0 }
                    }
                }
            }
        }
        if let Some(stop) = self.stop_time {
            if let Some(idx) = Self::time_col_idx(&table) {
                self.end = table.find_batch_at_or_after(idx, stop)?;
            }
        }
        self.table = Some(table);
        Ok(())
    }

    fn generate_next(&mut self, state: &ExecState) -> ExecResult<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }
        let table = self.table.as_ref().expect("opened").clone();

        // Scan finished (or table empty): emit the trailing EOS batch.
        let at_end = self.position.batch_idx >= self.num_batches
            || self
                .end
                .map(|e| {
                    self.position.batch_idx > e.batch_idx
                        || (self.position.batch_idx == e.batch_idx
                            && self.position.row_idx >= e.row_idx)
                })
                .unwrap_or(false);
        if at_end {
            self.done = true;
            let mut rb = RowBatch::empty(self.desc.clone());
            rb.set_eow(true);
            rb.set_eos(true);
            return Ok(Some(rb));
        }

        let batch_idx = self.position.batch_idx;
        let offset = self.position.row_idx;
        let mut end_row = usize::MAX;
        if let Some(e) = self.end {
            if e.batch_idx == batch_idx {
                end_row = e.row_idx;
            }
        }
        let chunk_end = end_row.min(offset + state.batch_size);
        let mut rb = table.row_batch_slice(batch_idx, &self.column_idxs, offset, chunk_end)?;
        let taken = rb.num_rows();
        trace!(table = %self.table_name, batch_idx, rows = taken, "memory source emitting");

        // Advance; a short read means the batch (or bounded range) is done.
        let full_rows = table
            .row_batch(batch_idx, &self.column_idxs)
            .map(|b| b.num_rows())
            .unwrap_or(0);
        if offset + taken >= full_rows.min(end_row) {
            self.position = BatchPosition { batch_idx: batch_idx + 1, row_idx: 0 };
        } else {
            self.position.row_idx = offset + taken;
        }

        // Final chunk of the final batch closes the stream.
        let next_at_end = self.position.batch_idx >= self.num_batches
            || self
                .end
                .map(|e| {
                    self.position.batch_idx > e.batch_idx
                        || (self.position.batch_idx == e.batch_idx
                            && self.position.row_idx >= e.row_idx)
                })
                .unwrap_or(false);
        if next_at_end {
            self.done = true;
            rb.set_eow(true);
            rb.set_eos(true);
        }
        Ok(Some(rb))
    }
}

// ============================================================================
// Memory sink
// ============================================================================

/// Appends result batches into an output table.
pub struct MemorySinkNode {
    name: String,
    relation: Relation,
    table: Option<Arc<Table>>,
}

impl MemorySinkNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::MemorySink { name, column_names, column_types } = op else {
            return Err(ExecError::Internal("expected MemorySink".to_string()));
        };
        let mut relation = Relation::new();
        for (n, t) in column_names.iter().zip(column_types.iter()) {
            relation
                .add_column(n, *t)
                .map_err(|e| ExecError::Internal(e.to_string()))?;
        }
        Ok(MemorySinkNode { name: name.clone(), relation, table: None })
    }
}

impl ExecNode for MemorySinkNode {
    fn prepare(&mut self, state: &ExecState) -> ExecResult<()> {
        let table = Arc::new(Table::new(self.relation.clone()));
        state.table_store.add_table(&self.name, Arc::clone(&table));
        self.table = Some(table);
        Ok(())
    }

    fn consume(&mut self, _state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        if rb.num_rows() > 0 {
            self.table
                .as_ref()
                .expect("prepared")
                .append_record_batch(rb.columns().to_vec())?;
        }
        Ok(vec![])
    }
}

// ============================================================================
// UDTF source
// ============================================================================

/// Runs a registered table function once and emits its rows as one batch.
pub struct UdtfSourceNode {
    name: String,
    args: HashMap<String, ScalarValue>,
    column_types: Vec<DataType>,
    done: bool,
}

impl UdtfSourceNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::UdtfSource { name, arg_values, column_types, .. } = op else {
            return Err(ExecError::Internal("expected UdtfSource".to_string()));
        };
        Ok(UdtfSourceNode {
            name: name.clone(),
            args: arg_values.iter().cloned().collect(),
            column_types: column_types.clone(),
            done: false,
        })
    }
}

impl ExecNode for UdtfSourceNode {
    fn is_source(&self) -> bool {
        true
    }

    fn generate_next(&mut self, state: &ExecState) -> ExecResult<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let spec = state
            .registry
            .get_udtf(&self.name)
            .ok_or_else(|| ExecError::SourceNotFound(self.name.clone()))?;
        let rows = (spec.generator)(&state.function_ctx, &self.args);

        let mut columns: Vec<ColumnWrapper> = self
            .column_types
            .iter()
            .map(|&t| ColumnWrapper::with_capacity(t, rows.len()))
            .collect();
        for row in rows {
            for (col, value) in columns.iter_mut().zip(row.into_iter()) {
                col.push(value);
            }
        }
        let mut rb = RowBatch::from_columns(
            columns.iter().map(column_wrapper_to_array).collect(),
        )?;
        rb.set_eow(true);
        rb.set_eos(true);
        Ok(Some(rb))
    }
}

// ============================================================================
// Tests
// ============================================================================
