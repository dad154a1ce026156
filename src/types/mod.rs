//! # Type & Relation Model
//!
//! Core data types shared by every stage of the query pipeline: the primitive
//! `DataType` enum, single `ScalarValue`s, and the `Relation` (ordered, named,
//! typed column list) that the analyzer attaches to every operator.
//!
//! ```text
//! DataType ──┬── ScalarValue (one tagged value)
//!            ├── Relation    (ordered (name, type) pairs)
//!            └── ColumnWrapper / arrow adapter (columnar batches)
//! ```

pub mod arrow_adapter;
pub mod column_wrapper;

pub use arrow_adapter::{
    array_data_type, column_wrapper_to_array, column_wrapper_from_array, make_array_from_scalar,
    ArrowAdapterError,
};
pub use column_wrapper::ColumnWrapper;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Data types
// ============================================================================

/// Primitive data types carried by every column, literal, and expression.
///
/// `Unknown` is permitted only transiently, before analysis succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Uint128,
    Float64,
    String,
    Time64Ns,
    Unknown,
}

impl DataType {
    /// Whether this type has been resolved by analysis.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DataType::Unknown)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int64 => "INT64",
            DataType::Uint128 => "UINT128",
            DataType::Float64 => "FLOAT64",
            DataType::String => "STRING",
            DataType::Time64Ns => "TIME64NS",
            DataType::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Scalar values
// ============================================================================

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Boolean(bool),
    Int64(i64),
    Uint128(u128),
    Float64(f64),
    String(String),
    Time64Ns(i64),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Uint128(_) => DataType::Uint128,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::String(_) => DataType::String,
            ScalarValue::Time64Ns(_) => DataType::Time64Ns,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int64(v) | ScalarValue::Time64Ns(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u128(&self) -> Option<u128> {
        match self {
            ScalarValue::Uint128(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Uint128(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::String(v) => write!(f, "{}", v),
            ScalarValue::Time64Ns(v) => write!(f, "{}", v),
        }
    }
}

// ============================================================================
// Row tuples (hashable group keys)
// ============================================================================

/// A row of scalar values usable as a hash-map key.
///
/// Floats are compared and hashed by their bit pattern so that a tuple can
/// serve as a group key without violating `Eq`.
#[derive(Debug, Clone)]
pub struct RowTuple(pub Vec<ScalarValue>);

impl PartialEq for RowTuple {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        self.0.iter().zip(other.0.iter()).all(|(a, b)| match (a, b) {
            (ScalarValue::Float64(x), ScalarValue::Float64(y)) => x.to_bits() == y.to_bits(),
            _ => a == b,
        })
    }
}

impl Eq for RowTuple {}

impl std::hash::Hash for RowTuple {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for v in &self.0 {
            match v {
                ScalarValue::Boolean(b) => b.hash(state),
                ScalarValue::Int64(i) => i.hash(state),
                ScalarValue::Uint128(u) => u.hash(state),
                ScalarValue::Float64(f) => f.to_bits().hash(state),
                ScalarValue::String(s) => s.hash(state),
                ScalarValue::Time64Ns(t) => t.hash(state),
            }
        }
    }
}

// ============================================================================
// Relations
// ============================================================================

/// Relation manipulation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelationError {
    #[error("Column '{0}' already exists in relation")]
    DuplicateColumn(String),

    #[error("Column '{0}' not found in relation")]
    ColumnNotFound(String),
}

/// An ordered sequence of `(column_name, type)` pairs with unique names.
///
/// Relations are attached to operators once the analyzer has proven them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    columns: Vec<(String, DataType)>,
}

impl Relation {
    pub fn new() -> Self {
        Relation { columns: Vec::new() }
    }

    /// Build a relation from `(name, type)` pairs. Panics on duplicate names,
    /// so this is intended for statically known schemas (table registration,
    /// tests).
    pub fn from_columns(cols: Vec<(&str, DataType)>) -> Self {
        let mut rel = Relation::new();
        for (name, dt) in cols {
            rel.add_column(name, dt).expect("duplicate column in static relation");
        }
        rel
    }

    /// Append a column. Names must be unique.
    pub fn add_column(&mut self, name: &str, data_type: DataType) -> Result<(), RelationError> {
        if self.has_column(name) {
            return Err(RelationError::DuplicateColumn(name.to_string()));
        }
        self.columns.push((name.to_string(), data_type));
        Ok(())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(n, _)| n == name)
    }

    pub fn col_type(&self, name: &str) -> Option<DataType> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, t)| *t)
    }

    pub fn col_type_at(&self, idx: usize) -> Option<DataType> {
        self.columns.get(idx).map(|(_, t)| *t)
    }

    pub fn col_name_at(&self, idx: usize) -> Option<&str> {
        self.columns.get(idx).map(|(n, _)| n.as_str())
    }

    pub fn col_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn col_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|(_, t)| *t).collect()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DataType)> {
        self.columns.iter().map(|(n, t)| (n.as_str(), *t))
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|(n, t)| format!("{}:{}", n, t))
            .collect();
        write!(f, "[{}]", cols.join(", "))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_value_data_type() {
        assert_eq!(ScalarValue::Boolean(true).data_type(), DataType::Boolean);
        assert_eq!(ScalarValue::Int64(1).data_type(), DataType::Int64);
        assert_eq!(ScalarValue::Uint128(1).data_type(), DataType::Uint128);
        assert_eq!(ScalarValue::Float64(1.0).data_type(), DataType::Float64);
        assert_eq!(
            ScalarValue::String("a".to_string()).data_type(),
            DataType::String
        );
        assert_eq!(ScalarValue::Time64Ns(10).data_type(), DataType::Time64Ns);
    }

    #[test]
    fn test_relation_add_and_lookup() {
        let mut rel = Relation::new();
        rel.add_column("time_", DataType::Time64Ns).unwrap();
        rel.add_column("cpu", DataType::Int64).unwrap();

        assert_eq!(rel.num_columns(), 2);
        assert!(rel.has_column("cpu"));
        assert_eq!(rel.col_index("cpu"), Some(1));
        assert_eq!(rel.col_type("cpu"), Some(DataType::Int64));
        assert_eq!(rel.col_name_at(0), Some("time_"));
        assert_eq!(rel.col_names(), vec!["time_", "cpu"]);
    }

    #[test]
    fn test_relation_rejects_duplicates() {
        let mut rel = Relation::new();
        rel.add_column("cpu", DataType::Int64).unwrap();
        let err = rel.add_column("cpu", DataType::Float64).unwrap_err();
        assert_eq!(err, RelationError::DuplicateColumn("cpu".to_string()));
        // Relation unchanged after the failed insert.
        assert_eq!(rel.num_columns(), 1);
        assert_eq!(rel.col_type("cpu"), Some(DataType::Int64));
    }

    #[test]
    fn test_relation_equality_is_ordered() {
        let a = Relation::from_columns(vec![("x", DataType::Int64), ("y", DataType::String)]);
        let b = Relation::from_columns(vec![("y", DataType::String), ("x", DataType::Int64)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_row_tuple_float_key() {
        use std::collections::HashMap;
        let mut map: HashMap<RowTuple, i64> = HashMap::new();
        map.insert(RowTuple(vec![ScalarValue::Float64(1.5)]), 1);
        assert_eq!(map.get(&RowTuple(vec![ScalarValue::Float64(1.5)])), Some(&1));
        assert_eq!(map.get(&RowTuple(vec![ScalarValue::Float64(2.5)])), None);
    }

    #[test]
    fn test_row_tuple_nan_groups_together() {
        let a = RowTuple(vec![ScalarValue::Float64(f64::NAN)]);
        let b = RowTuple(vec![ScalarValue::Float64(f64::NAN)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_type_is_unresolved() {
        assert!(!DataType::Unknown.is_resolved());
        assert!(DataType::Int64.is_resolved());
    }
}
