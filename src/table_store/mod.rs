//! # Table Store
//!
//! Append-only columnar tables with per-tablet sharding. The store is
//! process-wide; writers append whole record batches, readers slice by
//! batch index, which stays stable under concurrent appends because
//! existing batches are immutable.

pub mod row_batch;

pub use row_batch::{RowBatch, RowDescriptor};

use crate::types::arrow_adapter::{array_data_type, scalar_at};
use crate::types::{Relation, ScalarValue};
use arrow::array::ArrayRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// The tablet id used when a table is not tabletized.
pub const DEFAULT_TABLET: &str = "";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Tablet '{1}' of table '{0}' not found")]
    TabletNotFound(String, String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Batch index {0} out of range ({1} batches)")]
    OutOfRangeBatch(usize, usize),
}

/// Position of a row inside a table: batch number plus row within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPosition {
    pub batch_idx: usize,
    pub row_idx: usize,
}

// ============================================================================
// Table
// ============================================================================

/// One (tablet of a) table: a relation plus an ordered sequence of column
/// batches. Each batch is a fixed set of equal-length arrays, one per
/// column.
#[derive(Debug)]
pub struct Table {
    relation: Relation,
    batches: RwLock<Vec<Vec<ArrayRef>>>,
}

impl Table {
    pub fn new(relation: Relation) -> Self {
        Table { relation, batches: RwLock::new(Vec::new()) }
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    pub fn num_batches(&self) -> usize {
        self.batches.read().len()
    }

    pub fn num_rows(&self) -> usize {
        self.batches
            .read()
            .iter()
            .map(|b| b.first().map(|c| c.len()).unwrap_or(0))
            .sum()
    }

    /// Atomically append one record batch. The column schema must exactly
    /// match the table's relation.
    pub fn append_record_batch(&self, columns: Vec<ArrayRef>) -> Result<(), StoreError> {
        if columns.len() != self.relation.num_columns() {
            return Err(StoreError::SchemaMismatch(format!(
                "batch has {} columns, table expects {}",
                columns.len(),
                self.relation.num_columns()
            )));
        }
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for (i, col) in columns.iter().enumerate() {
            let dt = array_data_type(col)
                .map_err(|e| StoreError::SchemaMismatch(e.to_string()))?;
            let expected = self.relation.col_type_at(i).unwrap();
            if dt != expected {
                return Err(StoreError::SchemaMismatch(format!(
                    "column {} ('{}') expected {}, got {}",
                    i,
                    self.relation.col_name_at(i).unwrap(),
                    expected,
                    dt
                )));
            }
            if col.len() != num_rows {
                return Err(StoreError::SchemaMismatch(
                    "batch columns have unequal lengths".to_string(),
                ));
            }
        }
        self.batches.write().push(columns);
        Ok(())
    }

    /// A zero-copy slice of the batch at `batch_idx`, restricted to
    /// `col_idxs` (in the given order).
    pub fn row_batch(&self, batch_idx: usize, col_idxs: &[usize]) -> Result<RowBatch, StoreError> {
        self.row_batch_slice(batch_idx, col_idxs, 0, usize::MAX)
    }

    /// Like `row_batch`, restricted to rows `[offset, end)`.
    pub fn row_batch_slice(
        &self,
        batch_idx: usize,
        col_idxs: &[usize],
        offset: usize,
        end: usize,
    ) -> Result<RowBatch, StoreError> {
        let batches = self.batches.read();
        let batch = batches
            .get(batch_idx)
            .ok_or(StoreError::OutOfRangeBatch(batch_idx, batches.len()))?;
        let num_rows = batch.first().map(|c| c.len()).unwrap_or(0);
        let end = end.min(num_rows);
        let offset = offset.min(end);
        let columns: Vec<ArrayRef> = col_idxs
            .iter()
            .map(|&i| batch[i].slice(offset, end - offset))
            .collect();
        RowBatch::from_columns(columns)
    }

    /// Binary-search the per-batch time ranges for the first row whose time
    /// column value is >= `t`, then scan linearly within the batch. The time
    /// column is assumed ascending across and within batches.
    pub fn find_batch_at_or_after(
        &self,
        time_col_idx: usize,
        t: i64,
    ) -> Result<Option<BatchPosition>, StoreError> {
        let batches = self.batches.read();
        let time_of = |col: &ArrayRef, row: usize| -> Result<i64, StoreError> {
            match scalar_at(col, row).map_err(|e| StoreError::SchemaMismatch(e.to_string()))? {
                ScalarValue::Time64Ns(v) | ScalarValue::Int64(v) => Ok(v),
                other => Err(StoreError::SchemaMismatch(format!(
                    "time column holds {}",
                    other.data_type()
                ))),
            }
        };

        // Binary search over batches by their last timestamp.
        let mut lo = 0usize;
        let mut hi = batches.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let batch = &batches[mid];
            let rows = batch.first().map(|c| c.len()).unwrap_or(0);
            if rows == 0 || time_of(&batch[time_col_idx], rows - 1)? < t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= batches.len() {
            return Ok(None);
        }
        let batch = &batches[lo];
        let rows = batch.first().map(|c| c.len()).unwrap_or(0);
        for row in 0..rows {
            if time_of(&batch[time_col_idx], row)? >= t {
                return Ok(Some(BatchPosition { batch_idx: lo, row_idx: row }));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// TableStore
// ============================================================================

/// The process-wide mapping `(table_name, tablet_id) -> Table`.
#[derive(Default)]
pub struct TableStore {
    tables: RwLock<HashMap<(String, String), Arc<Table>>>,
    relations: RwLock<HashMap<String, Relation>>,
}

impl TableStore {
    pub fn new() -> Self {
        TableStore::default()
    }

    /// Add a table under the default tablet.
    pub fn add_table(&self, name: &str, table: Arc<Table>) {
        self.add_tablet(name, DEFAULT_TABLET, table);
    }

    pub fn add_tablet(&self, name: &str, tablet_id: &str, table: Arc<Table>) {
        self.relations
            .write()
            .insert(name.to_string(), table.relation().clone());
        self.tables
            .write()
            .insert((name.to_string(), tablet_id.to_string()), table);
        trace!(table = name, tablet = tablet_id, "registered table");
    }

    /// Get the default tablet of a table.
    pub fn get_table(&self, name: &str) -> Result<Arc<Table>, StoreError> {
        self.get_tablet(name, DEFAULT_TABLET)
    }

    pub fn get_tablet(&self, name: &str, tablet_id: &str) -> Result<Arc<Table>, StoreError> {
        if let Some(t) = self
            .tables
            .read()
            .get(&(name.to_string(), tablet_id.to_string()))
        {
            return Ok(Arc::clone(t));
        }
        if self.relations.read().contains_key(name) {
            return Err(StoreError::TabletNotFound(name.to_string(), tablet_id.to_string()));
        }
        Err(StoreError::TableNotFound(name.to_string()))
    }

    /// Create a tablet for a known table, inheriting the table's relation.
    pub fn create_tablet(&self, name: &str, tablet_id: &str) -> Result<Arc<Table>, StoreError> {
        let relation = self
            .relations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        let table = Arc::new(Table::new(relation));
        self.add_tablet(name, tablet_id, Arc::clone(&table));
        Ok(table)
    }

    /// Append a record batch, creating the tablet when the table exists but
    /// the tablet does not.
    pub fn append(
        &self,
        name: &str,
        tablet_id: &str,
        columns: Vec<ArrayRef>,
    ) -> Result<(), StoreError> {
        let table = match self.get_tablet(name, tablet_id) {
            Ok(t) => t,
            Err(StoreError::TabletNotFound(_, _)) => self.create_tablet(name, tablet_id)?,
            Err(e) => return Err(e),
        };
        table.append_record_batch(columns)
    }

    /// The schema of every registered table, as consumed by the compiler.
    pub fn relation_map(&self) -> HashMap<String, Relation> {
        self.relations.read().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::arrow_adapter::column_wrapper_to_array;
    use crate::types::{ColumnWrapper, DataType};

    fn test_relation() -> Relation {
        Relation::from_columns(vec![("time_", DataType::Time64Ns), ("cpu", DataType::Int64)])
    }

    fn batch(times: Vec<i64>, cpus: Vec<i64>) -> Vec<ArrayRef> {
        vec![
            column_wrapper_to_array(&ColumnWrapper::Time64Ns(times)),
            column_wrapper_to_array(&ColumnWrapper::Int64(cpus)),
        ]
    }

    #[test]
    fn test_append_and_read() {
        let table = Table::new(test_relation());
        table.append_record_batch(batch(vec![1, 2], vec![10, 20])).unwrap();
        table.append_record_batch(batch(vec![3], vec![30])).unwrap();

        assert_eq!(table.num_batches(), 2);
        assert_eq!(table.num_rows(), 3);

        let rb = table.row_batch(0, &[1]).unwrap();
        assert_eq!(rb.num_rows(), 2);
        assert_eq!(rb.num_columns(), 1);
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let table = Table::new(test_relation());
        // Swapped column types.
        let cols = vec![
            column_wrapper_to_array(&ColumnWrapper::Int64(vec![1])),
            column_wrapper_to_array(&ColumnWrapper::Time64Ns(vec![2])),
        ];
        assert!(matches!(
            table.append_record_batch(cols),
            Err(StoreError::SchemaMismatch(_))
        ));
        // Wrong column count.
        let cols = vec![column_wrapper_to_array(&ColumnWrapper::Time64Ns(vec![1]))];
        assert!(matches!(
            table.append_record_batch(cols),
            Err(StoreError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_out_of_range_batch() {
        let table = Table::new(test_relation());
        assert!(matches!(
            table.row_batch(0, &[0]),
            Err(StoreError::OutOfRangeBatch(0, 0))
        ));
    }

    #[test]
    fn test_row_batch_slice() {
        let table = Table::new(test_relation());
        table
            .append_record_batch(batch(vec![1, 2, 3, 4], vec![10, 20, 30, 40]))
            .unwrap();
        let rb = table.row_batch_slice(0, &[1, 0], 1, 3).unwrap();
        assert_eq!(rb.num_rows(), 2);
        // Columns come back in the requested order.
        assert_eq!(rb.desc().types(), &[DataType::Int64, DataType::Time64Ns]);
    }

    #[test]
    fn test_find_batch_at_or_after() {
        let table = Table::new(test_relation());
        table.append_record_batch(batch(vec![10, 20], vec![0, 0])).unwrap();
        table.append_record_batch(batch(vec![30, 40], vec![0, 0])).unwrap();
        table.append_record_batch(batch(vec![50, 60], vec![0, 0])).unwrap();

        assert_eq!(
            table.find_batch_at_or_after(0, 35).unwrap(),
            Some(BatchPosition { batch_idx: 1, row_idx: 1 })
        );
        assert_eq!(
            table.find_batch_at_or_after(0, 10).unwrap(),
            Some(BatchPosition { batch_idx: 0, row_idx: 0 })
        );
        assert_eq!(table.find_batch_at_or_after(0, 100).unwrap(), None);
    }

    #[test]
    fn test_store_tablets() {
        let store = TableStore::new();
        store.add_table("t", Arc::new(Table::new(test_relation())));

        assert!(store.get_table("t").is_ok());
        assert!(matches!(
            store.get_tablet("t", "tablet1"),
            Err(StoreError::TabletNotFound(_, _))
        ));
        assert!(matches!(
            store.get_table("missing"),
            Err(StoreError::TableNotFound(_))
        ));

        store.create_tablet("t", "tablet1").unwrap();
        assert!(store.get_tablet("t", "tablet1").is_ok());
    }

    #[test]
    fn test_append_auto_creates_tablet() {
        let store = TableStore::new();
        store.add_table("t", Arc::new(Table::new(test_relation())));
        store
            .append("t", "tab2", batch(vec![1], vec![2]))
            .unwrap();
        assert_eq!(store.get_tablet("t", "tab2").unwrap().num_rows(), 1);
    }

    #[test]
    fn test_relation_map() {
        let store = TableStore::new();
        store.add_table("t", Arc::new(Table::new(test_relation())));
        let map = store.relation_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["t"], test_relation());
    }
}
