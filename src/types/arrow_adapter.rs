//! Arrow Adapter
//!
//! Conversion between the engine's primitive types and arrow's columnar
//! arrays. Each `DataType` maps to exactly one physical arrow layout:
//!
//! | engine     | arrow                          |
//! |------------|--------------------------------|
//! | BOOLEAN    | BooleanArray                   |
//! | INT64      | Int64Array                     |
//! | UINT128    | Decimal128Array (bit-cast)     |
//! | FLOAT64    | Float64Array                   |
//! | STRING     | StringArray                    |
//! | TIME64NS   | TimestampNanosecondArray       |

use super::{ColumnWrapper, DataType, ScalarValue};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Decimal128Array, Float64Array, Int64Array, StringArray,
    TimestampNanosecondArray,
};
use arrow::datatypes::{DataType as ArrowDataType, TimeUnit};
use std::sync::Arc;
use thiserror::Error;

/// Errors converting between engine columns and arrow arrays.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArrowAdapterError {
    #[error("Unsupported arrow type: {0}")]
    UnsupportedType(String),

    #[error("Row index {0} out of range for array of length {1}")]
    RowOutOfRange(usize, usize),
}

/// The arrow type used to store the given engine type.
pub fn arrow_type(data_type: DataType) -> ArrowDataType {
    match data_type {
        DataType::Boolean => ArrowDataType::Boolean,
        DataType::Int64 => ArrowDataType::Int64,
        DataType::Uint128 => ArrowDataType::Decimal128(38, 0),
        DataType::Float64 => ArrowDataType::Float64,
        DataType::String => ArrowDataType::Utf8,
        DataType::Time64Ns => ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
        DataType::Unknown => panic!("no arrow representation for UNKNOWN"),
    }
}

/// The engine type of an arrow array.
pub fn array_data_type(array: &ArrayRef) -> Result<DataType, ArrowAdapterError> {
    match array.data_type() {
        ArrowDataType::Boolean => Ok(DataType::Boolean),
        ArrowDataType::Int64 => Ok(DataType::Int64),
        ArrowDataType::Decimal128(_, _) => Ok(DataType::Uint128),
        ArrowDataType::Float64 => Ok(DataType::Float64),
        ArrowDataType::Utf8 => Ok(DataType::String),
        ArrowDataType::Timestamp(TimeUnit::Nanosecond, _) => Ok(DataType::Time64Ns),
        other => Err(ArrowAdapterError::UnsupportedType(format!("{:?}", other))),
    }
}

/// Pack a type-erased column wrapper into an arrow array.
pub fn column_wrapper_to_array(col: &ColumnWrapper) -> ArrayRef {
    match col {
        ColumnWrapper::Boolean(v) => Arc::new(BooleanArray::from(v.clone())),
        ColumnWrapper::Int64(v) => Arc::new(Int64Array::from(v.clone())),
        ColumnWrapper::Uint128(v) => {
            let decimals = Decimal128Array::from_iter_values(v.iter().map(|x| *x as i128))
                .with_precision_and_scale(38, 0)
                .expect("uint128 precision is statically valid");
            Arc::new(decimals)
        }
        ColumnWrapper::Float64(v) => Arc::new(Float64Array::from(v.clone())),
        ColumnWrapper::String(v) => Arc::new(StringArray::from_iter_values(v.iter())),
        ColumnWrapper::Time64Ns(v) => Arc::new(TimestampNanosecondArray::from(v.clone())),
    }
}

/// Unpack an arrow array into a type-erased column wrapper.
pub fn column_wrapper_from_array(array: &ArrayRef) -> Result<ColumnWrapper, ArrowAdapterError> {
    let dt = array_data_type(array)?;
    let n = array.len();
    let col = match dt {
        DataType::Boolean => {
            let arr = array.as_any().downcast_ref::<BooleanArray>().unwrap();
            ColumnWrapper::Boolean((0..n).map(|i| arr.value(i)).collect())
        }
        DataType::Int64 => {
            let arr = array.as_any().downcast_ref::<Int64Array>().unwrap();
            ColumnWrapper::Int64(arr.values().to_vec())
        }
        DataType::Uint128 => {
            let arr = array.as_any().downcast_ref::<Decimal128Array>().unwrap();
            ColumnWrapper::Uint128((0..n).map(|i| arr.value(i) as u128).collect())
        }
        DataType::Float64 => {
            let arr = array.as_any().downcast_ref::<Float64Array>().unwrap();
            ColumnWrapper::Float64(arr.values().to_vec())
        }
        DataType::String => {
            let arr = array.as_any().downcast_ref::<StringArray>().unwrap();
            ColumnWrapper::String((0..n).map(|i| arr.value(i).to_string()).collect())
        }
        DataType::Time64Ns => {
            let arr = array
                .as_any()
                .downcast_ref::<TimestampNanosecondArray>()
                .unwrap();
            ColumnWrapper::Time64Ns(arr.values().to_vec())
        }
        DataType::Unknown => unreachable!(),
    };
    Ok(col)
}

/// An arrow array holding `count` copies of the given scalar.
pub fn make_array_from_scalar(value: &ScalarValue, count: usize) -> ArrayRef {
    column_wrapper_to_array(&ColumnWrapper::from_scalar(value, count))
}

/// The value at row `i` of an arrow array as a `ScalarValue`.
pub fn scalar_at(array: &ArrayRef, i: usize) -> Result<ScalarValue, ArrowAdapterError> {
    if i >= array.len() {
        return Err(ArrowAdapterError::RowOutOfRange(i, array.len()));
    }
    let dt = array_data_type(array)?;
    let v = match dt {
        DataType::Boolean => {
            ScalarValue::Boolean(array.as_any().downcast_ref::<BooleanArray>().unwrap().value(i))
        }
        DataType::Int64 => {
            ScalarValue::Int64(array.as_any().downcast_ref::<Int64Array>().unwrap().value(i))
        }
        DataType::Uint128 => ScalarValue::Uint128(
            array.as_any().downcast_ref::<Decimal128Array>().unwrap().value(i) as u128,
        ),
        DataType::Float64 => {
            ScalarValue::Float64(array.as_any().downcast_ref::<Float64Array>().unwrap().value(i))
        }
        DataType::String => ScalarValue::String(
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(i)
                .to_string(),
        ),
        DataType::Time64Ns => ScalarValue::Time64Ns(
            array
                .as_any()
                .downcast_ref::<TimestampNanosecondArray>()
                .unwrap()
                .value(i),
        ),
        DataType::Unknown => unreachable!(),
    };
    Ok(v)
}

/// An empty arrow array of the given engine type.
pub fn empty_array(data_type: DataType) -> ArrayRef {
    column_wrapper_to_array(&ColumnWrapper::with_capacity(data_type, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_types() {
        let cols = vec![
            ColumnWrapper::Boolean(vec![true, false]),
            ColumnWrapper::Int64(vec![1, -2]),
            ColumnWrapper::Uint128(vec![0, u128::MAX]),
            ColumnWrapper::Float64(vec![1.5, -0.25]),
            ColumnWrapper::String(vec!["a".to_string(), "b".to_string()]),
            ColumnWrapper::Time64Ns(vec![10, 20]),
        ];
        for col in cols {
            let arr = column_wrapper_to_array(&col);
            assert_eq!(array_data_type(&arr).unwrap(), col.data_type());
            let back = column_wrapper_from_array(&arr).unwrap();
            assert_eq!(back, col);
        }
    }

    #[test]
    fn test_scalar_at() {
        let arr = column_wrapper_to_array(&ColumnWrapper::Int64(vec![7, 8, 9]));
        assert_eq!(scalar_at(&arr, 1).unwrap(), ScalarValue::Int64(8));
        assert!(matches!(
            scalar_at(&arr, 3),
            Err(ArrowAdapterError::RowOutOfRange(3, 3))
        ));
    }

    #[test]
    fn test_uint128_bit_cast_preserves_value() {
        let big = (1u128 << 100) | 12345;
        let arr = column_wrapper_to_array(&ColumnWrapper::Uint128(vec![big]));
        assert_eq!(scalar_at(&arr, 0).unwrap(), ScalarValue::Uint128(big));
    }

    #[test]
    fn test_empty_array() {
        let arr = empty_array(DataType::String);
        assert_eq!(arr.len(), 0);
        assert_eq!(array_data_type(&arr).unwrap(), DataType::String);
    }
}
