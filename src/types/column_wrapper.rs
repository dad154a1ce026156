//! Type-Erased Column Wrappers
//!
//! A `ColumnWrapper` is the vector-native counterpart to an arrow array: a
//! tightly packed `Vec<T>` per primitive type. The vector-native expression
//! evaluator works entirely in wrappers and converts back to arrow at the
//! batch boundary.

use super::{DataType, ScalarValue};
use serde::{Deserialize, Serialize};

/// A column of values of a single primitive type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnWrapper {
    Boolean(Vec<bool>),
    Int64(Vec<i64>),
    Uint128(Vec<u128>),
    Float64(Vec<f64>),
    String(Vec<String>),
    Time64Ns(Vec<i64>),
}

impl ColumnWrapper {
    /// An empty wrapper of the given type with reserved capacity.
    pub fn with_capacity(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Boolean => ColumnWrapper::Boolean(Vec::with_capacity(capacity)),
            DataType::Int64 => ColumnWrapper::Int64(Vec::with_capacity(capacity)),
            DataType::Uint128 => ColumnWrapper::Uint128(Vec::with_capacity(capacity)),
            DataType::Float64 => ColumnWrapper::Float64(Vec::with_capacity(capacity)),
            DataType::String => ColumnWrapper::String(Vec::with_capacity(capacity)),
            DataType::Time64Ns => ColumnWrapper::Time64Ns(Vec::with_capacity(capacity)),
            DataType::Unknown => panic!("cannot build a column of UNKNOWN type"),
        }
    }

    /// A wrapper holding `count` copies of `value`.
    pub fn from_scalar(value: &ScalarValue, count: usize) -> Self {
        match value {
            ScalarValue::Boolean(v) => ColumnWrapper::Boolean(vec![*v; count]),
            ScalarValue::Int64(v) => ColumnWrapper::Int64(vec![*v; count]),
            ScalarValue::Uint128(v) => ColumnWrapper::Uint128(vec![*v; count]),
            ScalarValue::Float64(v) => ColumnWrapper::Float64(vec![*v; count]),
            ScalarValue::String(v) => ColumnWrapper::String(vec![v.clone(); count]),
            ScalarValue::Time64Ns(v) => ColumnWrapper::Time64Ns(vec![*v; count]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ColumnWrapper::Boolean(_) => DataType::Boolean,
            ColumnWrapper::Int64(_) => DataType::Int64,
            ColumnWrapper::Uint128(_) => DataType::Uint128,
            ColumnWrapper::Float64(_) => DataType::Float64,
            ColumnWrapper::String(_) => DataType::String,
            ColumnWrapper::Time64Ns(_) => DataType::Time64Ns,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnWrapper::Boolean(v) => v.len(),
            ColumnWrapper::Int64(v) => v.len(),
            ColumnWrapper::Uint128(v) => v.len(),
            ColumnWrapper::Float64(v) => v.len(),
            ColumnWrapper::String(v) => v.len(),
            ColumnWrapper::Time64Ns(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value at row `i` as a `ScalarValue`.
    pub fn get(&self, i: usize) -> ScalarValue {
        match self {
            ColumnWrapper::Boolean(v) => ScalarValue::Boolean(v[i]),
            ColumnWrapper::Int64(v) => ScalarValue::Int64(v[i]),
            ColumnWrapper::Uint128(v) => ScalarValue::Uint128(v[i]),
            ColumnWrapper::Float64(v) => ScalarValue::Float64(v[i]),
            ColumnWrapper::String(v) => ScalarValue::String(v[i].clone()),
            ColumnWrapper::Time64Ns(v) => ScalarValue::Time64Ns(v[i]),
        }
    }

    /// Append a scalar. The scalar's type must match the wrapper's type.
    pub fn push(&mut self, value: ScalarValue) {
        match (self, value) {
            (ColumnWrapper::Boolean(v), ScalarValue::Boolean(x)) => v.push(x),
            (ColumnWrapper::Int64(v), ScalarValue::Int64(x)) => v.push(x),
            (ColumnWrapper::Uint128(v), ScalarValue::Uint128(x)) => v.push(x),
            (ColumnWrapper::Float64(v), ScalarValue::Float64(x)) => v.push(x),
            (ColumnWrapper::String(v), ScalarValue::String(x)) => v.push(x),
            (ColumnWrapper::Time64Ns(v), ScalarValue::Time64Ns(x)) => v.push(x),
            (col, value) => panic!(
                "pushed {} value into {} column",
                value.data_type(),
                col.data_type()
            ),
        }
    }

    /// Booleans as a slice, for filter predicates.
    pub fn as_bool_slice(&self) -> Option<&[bool]> {
        match self {
            ColumnWrapper::Boolean(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_round_trip_scalars() {
        let mut col = ColumnWrapper::with_capacity(DataType::Int64, 4);
        for i in 0..4 {
            col.push(ScalarValue::Int64(i));
        }
        assert_eq!(col.len(), 4);
        assert_eq!(col.get(2), ScalarValue::Int64(2));
        assert_eq!(col.data_type(), DataType::Int64);
    }

    #[test]
    fn test_from_scalar_splat() {
        let col = ColumnWrapper::from_scalar(&ScalarValue::String("svc".to_string()), 3);
        assert_eq!(col.len(), 3);
        assert_eq!(col.get(0), ScalarValue::String("svc".to_string()));
        assert_eq!(col.get(2), ScalarValue::String("svc".to_string()));
    }

    #[test]
    #[should_panic(expected = "pushed")]
    fn test_push_type_mismatch_panics() {
        let mut col = ColumnWrapper::with_capacity(DataType::Int64, 1);
        col.push(ScalarValue::Float64(1.0));
    }

    #[test]
    fn test_bool_slice() {
        let col = ColumnWrapper::Boolean(vec![true, false, true]);
        assert_eq!(col.as_bool_slice(), Some(&[true, false, true][..]));
        let col = ColumnWrapper::Int64(vec![1]);
        assert!(col.as_bool_slice().is_none());
    }
}
