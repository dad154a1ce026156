//! Compile-Time Error Types
//!
//! Every compile-time failure carries the source location of the AST node it
//! was triggered by. Compilation aborts on the first error; no partial IR is
//! ever returned.

use crate::ast::SourceLocation;
use crate::ir::IrError;
use crate::types::{DataType, RelationError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilerError {
    #[error("{loc}: parse error: {msg}")]
    ParseError { loc: SourceLocation, msg: String },

    #[error("{loc}: name '{name}' is not defined")]
    UndefinedName { loc: SourceLocation, name: String },

    #[error("{loc}: type mismatch: {msg}")]
    TypeMismatch { loc: SourceLocation, msg: String },

    #[error("{loc}: could not find function '{name}' with argument types [{}]", format_types(.arg_types))]
    NoSuchFunction {
        loc: SourceLocation,
        name: String,
        arg_types: Vec<DataType>,
    },

    #[error("{loc}: invalid column: {msg}")]
    InvalidColumn { loc: SourceLocation, msg: String },

    #[error("{loc}: invalid argument: {msg}")]
    InvalidArgument { loc: SourceLocation, msg: String },

    #[error("{loc}: {msg}")]
    FormatMismatch { loc: SourceLocation, msg: String },

    #[error("{loc}: unsupported operator: {msg}")]
    UnsupportedOperator { loc: SourceLocation, msg: String },

    #[error("Rule batch '{batch}' failed to reach a fixed point after {iterations} iterations")]
    FixedPointExceeded { batch: String, iterations: u64 },

    #[error("IR graph error: {0}")]
    Ir(#[from] IrError),

    #[error("Relation error: {0}")]
    Relation(#[from] RelationError),
}

fn format_types(types: &[DataType]) -> String {
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub type CompilerResult<T> = Result<T, CompilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_function_lists_arg_types() {
        let err = CompilerError::NoSuchFunction {
            loc: SourceLocation::new(3, 7),
            name: "add".to_string(),
            arg_types: vec![DataType::Int64, DataType::String],
        };
        let msg = err.to_string();
        assert!(msg.contains("3:7"));
        assert!(msg.contains("add"));
        assert!(msg.contains("INT64,STRING"));
    }

    #[test]
    fn test_ir_error_conversion() {
        let err: CompilerError = IrError::UnknownNode(4).into();
        assert!(matches!(err, CompilerError::Ir(IrError::UnknownNode(4))));
    }
}
