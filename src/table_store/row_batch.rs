//! Row Batches
//!
//! A `RowBatch` is a table-like structure of equal-length arrow arrays
//! matching the schema described by its `RowDescriptor`. Batches flow
//! between executor operators; slicing is zero-copy.

use super::StoreError;
use crate::types::arrow_adapter::array_data_type;
use crate::types::DataType;
use arrow::array::ArrayRef;

/// The column types of a row batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptor {
    types: Vec<DataType>,
}

impl RowDescriptor {
    pub fn new(types: Vec<DataType>) -> Self {
        RowDescriptor { types }
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn type_at(&self, i: usize) -> DataType {
        self.types[i]
    }

    pub fn size(&self) -> usize {
        self.types.len()
    }
}

#[derive(Debug, Clone)]
pub struct RowBatch {
    desc: RowDescriptor,
    columns: Vec<ArrayRef>,
    num_rows: usize,
    /// End of window: last batch of the current window.
    eow: bool,
    /// End of stream: no further batches will follow.
    eos: bool,
}

impl RowBatch {
    pub fn new(desc: RowDescriptor, num_rows: usize) -> Self {
        let capacity = desc.size();
        RowBatch { desc, columns: Vec::with_capacity(capacity), num_rows, eow: false, eos: false }
    }

    /// Build a batch directly from columns, inferring the descriptor.
    pub fn from_columns(columns: Vec<ArrayRef>) -> Result<Self, StoreError> {
        let mut types = Vec::with_capacity(columns.len());
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for col in &columns {
            if col.len() != num_rows {
                return Err(StoreError::SchemaMismatch(format!(
                    "column length {} does not match batch row count {}",
                    col.len(),
                    num_rows
                )));
            }
            types.push(
                array_data_type(col)
                    .map_err(|e| StoreError::SchemaMismatch(e.to_string()))?,
            );
        }
        Ok(RowBatch {
            desc: RowDescriptor::new(types),
            columns,
            num_rows,
            eow: false,
            eos: false,
        })
    }

    /// An empty batch carrying only stream flags.
    pub fn empty(desc: RowDescriptor) -> Self {
        let columns = desc
            .types()
            .iter()
            .map(|&t| crate::types::arrow_adapter::empty_array(t))
            .collect();
        RowBatch { desc, columns, num_rows: 0, eow: false, eos: false }
    }

    /// Add the next column; it must fit the descriptor slot and row count.
    pub fn add_column(&mut self, col: ArrayRef) -> Result<(), StoreError> {
        let slot = self.columns.len();
        if slot >= self.desc.size() {
            return Err(StoreError::SchemaMismatch(format!(
                "batch already has all {} columns",
                self.desc.size()
            )));
        }
        let dt = array_data_type(&col).map_err(|e| StoreError::SchemaMismatch(e.to_string()))?;
        if dt != self.desc.type_at(slot) {
            return Err(StoreError::SchemaMismatch(format!(
                "column {} expected {}, got {}",
                slot,
                self.desc.type_at(slot),
                dt
            )));
        }
        if col.len() != self.num_rows {
            return Err(StoreError::SchemaMismatch(format!(
                "column {} has {} rows, batch expects {}",
                slot,
                col.len(),
                self.num_rows
            )));
        }
        self.columns.push(col);
        Ok(())
    }

    pub fn column(&self, i: usize) -> &ArrayRef {
        &self.columns[i]
    }

    pub fn columns(&self) -> &[ArrayRef] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.desc.size()
    }

    pub fn desc(&self) -> &RowDescriptor {
        &self.desc
    }

    pub fn eow(&self) -> bool {
        self.eow
    }

    pub fn set_eow(&mut self, v: bool) {
        self.eow = v;
    }

    pub fn eos(&self) -> bool {
        self.eos
    }

    pub fn set_eos(&mut self, v: bool) {
        self.eos = v;
    }

    /// Zero-copy row-range slice (flags are not carried over).
    pub fn slice(&self, offset: usize, length: usize) -> RowBatch {
        let columns: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|c| c.slice(offset, length))
            .collect();
        RowBatch {
            desc: self.desc.clone(),
            columns,
            num_rows: length,
            eow: false,
            eos: false,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.get_array_memory_size())
            .sum()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "RowBatch(rows={}, cols={}, eow={}, eos={})",
            self.num_rows,
            self.num_columns(),
            self.eow,
            self.eos
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::arrow_adapter::column_wrapper_to_array;
    use crate::types::ColumnWrapper;

    fn int_col(vals: Vec<i64>) -> ArrayRef {
        column_wrapper_to_array(&ColumnWrapper::Int64(vals))
    }

    #[test]
    fn test_add_column_checks_schema() {
        let desc = RowDescriptor::new(vec![DataType::Int64, DataType::String]);
        let mut rb = RowBatch::new(desc, 2);
        rb.add_column(int_col(vec![1, 2])).unwrap();

        // Wrong type for slot 1.
        let err = rb.add_column(int_col(vec![3, 4])).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)));

        let strings =
            column_wrapper_to_array(&ColumnWrapper::String(vec!["a".into(), "b".into()]));
        rb.add_column(strings).unwrap();
        assert_eq!(rb.num_columns(), 2);
    }

    #[test]
    fn test_row_count_mismatch() {
        let desc = RowDescriptor::new(vec![DataType::Int64]);
        let mut rb = RowBatch::new(desc, 3);
        let err = rb.add_column(int_col(vec![1])).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)));
    }

    #[test]
    fn test_slice_is_zero_copy_view() {
        let rb = RowBatch::from_columns(vec![int_col(vec![10, 20, 30, 40])]).unwrap();
        let s = rb.slice(1, 2);
        assert_eq!(s.num_rows(), 2);
        let col = crate::types::arrow_adapter::column_wrapper_from_array(s.column(0)).unwrap();
        assert_eq!(col, ColumnWrapper::Int64(vec![20, 30]));
    }

    #[test]
    fn test_eos_flags() {
        let mut rb = RowBatch::from_columns(vec![int_col(vec![])]).unwrap();
        assert!(!rb.eos());
        rb.set_eos(true);
        rb.set_eow(true);
        assert!(rb.eos());
        assert!(rb.eow());
    }
}
