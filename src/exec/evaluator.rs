//! Scalar Expression Evaluators
//!
//! Two interchangeable evaluators share one interface and must produce
//! identical results:
//!
//! - `VectorNative` converts inputs into type-erased column wrappers,
//!   evaluates the tree recursively, and calls each UDF's per-row `exec`
//!   over a column of values. Preferred for non-trivial trees because
//!   intermediates stay tightly packed.
//! - `ArrowNative` evaluates directly against arrow arrays with the UDFs'
//!   batch kernels. Preferred for simple column references and constants.

use super::{ExecError, ExecResult, ExecState};
use crate::plan::ScalarExpressionPb;
use crate::table_store::RowBatch;
use crate::types::arrow_adapter::{
    column_wrapper_from_array, column_wrapper_to_array, make_array_from_scalar,
};
use crate::types::{ColumnWrapper, ScalarValue};
use crate::udf::ScalarUdf;
use arrow::array::ArrayRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which evaluator the executor uses; a config knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    VectorNative,
    ArrowNative,
}

impl Default for EvaluatorKind {
    fn default() -> Self {
        EvaluatorKind::VectorNative
    }
}

/// Evaluates a fixed set of expressions over row batches.
pub trait ScalarExpressionEvaluator: Send {
    fn open(&mut self, state: &ExecState) -> ExecResult<()>;

    /// One output column per expression, each with the input's row count.
    fn evaluate(&mut self, state: &ExecState, input: &RowBatch) -> ExecResult<Vec<ArrayRef>>;

    fn close(&mut self, state: &ExecState) -> ExecResult<()>;
}

pub fn create_evaluator(
    expressions: Vec<ScalarExpressionPb>,
    kind: EvaluatorKind,
) -> Box<dyn ScalarExpressionEvaluator> {
    match kind {
        EvaluatorKind::VectorNative => Box::new(VectorNativeEvaluator::new(expressions)),
        EvaluatorKind::ArrowNative => Box::new(ArrowNativeEvaluator::new(expressions)),
    }
}

/// Collect every function id referenced by an expression tree.
fn collect_udf_ids(expr: &ScalarExpressionPb, out: &mut Vec<i64>) {
    if let ScalarExpressionPb::Func { id, args, .. } = expr {
        out.push(*id);
        for a in args {
            collect_udf_ids(a, out);
        }
    }
}

/// Instantiate one UDF instance per referenced id.
fn make_instances(
    expressions: &[ScalarExpressionPb],
    state: &ExecState,
) -> ExecResult<HashMap<i64, Box<dyn ScalarUdf>>> {
    let mut ids = Vec::new();
    for e in expressions {
        collect_udf_ids(e, &mut ids);
    }
    let mut instances = HashMap::new();
    for id in ids {
        if !instances.contains_key(&id) {
            let def = state.scalar_udf(id)?;
            let mut udf = def.make();
            udf.init(&state.function_ctx, &[])?;
            instances.insert(id, udf);
        }
    }
    Ok(instances)
}

// ============================================================================
// Vector-native
// ============================================================================

pub struct VectorNativeEvaluator {
    expressions: Vec<ScalarExpressionPb>,
    instances: HashMap<i64, Box<dyn ScalarUdf>>,
}

impl VectorNativeEvaluator {
    pub fn new(expressions: Vec<ScalarExpressionPb>) -> Self {
        VectorNativeEvaluator { expressions, instances: HashMap::new() }
    }

    fn eval_wrapper(
        &self,
        state: &ExecState,
        expr: &ScalarExpressionPb,
        input: &RowBatch,
    ) -> ExecResult<ColumnWrapper> {
        let num_rows = input.num_rows();
        match expr {
            ScalarExpressionPb::Constant(v) => Ok(ColumnWrapper::from_scalar(v, num_rows)),
            ScalarExpressionPb::Column { index } => {
                column_wrapper_from_array(input.column(*index))
                    .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))
            }
            ScalarExpressionPb::Func { id, args, return_type, .. } => {
                let arg_cols: Vec<ColumnWrapper> = args
                    .iter()
                    .map(|a| self.eval_wrapper(state, a, input))
                    .collect::<ExecResult<_>>()?;
                let udf = self
                    .instances
                    .get(id)
                    .ok_or_else(|| ExecError::Internal(format!("udf {} not instantiated", id)))?;
                let mut out = ColumnWrapper::with_capacity(*return_type, num_rows);
                let mut row: Vec<ScalarValue> = Vec::with_capacity(arg_cols.len());
                for i in 0..num_rows {
                    row.clear();
                    for col in &arg_cols {
                        row.push(col.get(i));
                    }
                    out.push(udf.exec(&state.function_ctx, &row)?);
                }
                Ok(out)
            }
        }
    }
}

impl ScalarExpressionEvaluator for VectorNativeEvaluator {
    fn open(&mut self, state: &ExecState) -> ExecResult<()> {
        self.instances = make_instances(&self.expressions, state)?;
        Ok(())
    }

    fn evaluate(&mut self, state: &ExecState, input: &RowBatch) -> ExecResult<Vec<ArrayRef>> {
        let expressions = self.expressions.clone();
        expressions
            .iter()
            .map(|e| self.eval_wrapper(state, e, input).map(|w| column_wrapper_to_array(&w)))
            .collect()
    }

    fn close(&mut self, _state: &ExecState) -> ExecResult<()> {
        self.instances.clear();
        Ok(())
    }
}

// ============================================================================
// Arrow-native
// ============================================================================

pub struct ArrowNativeEvaluator {
    expressions: Vec<ScalarExpressionPb>,
    instances: HashMap<i64, Box<dyn ScalarUdf>>,
}

impl ArrowNativeEvaluator {
    pub fn new(expressions: Vec<ScalarExpressionPb>) -> Self {
        ArrowNativeEvaluator { expressions, instances: HashMap::new() }
    }

    fn eval_array(
        &self,
        state: &ExecState,
        expr: &ScalarExpressionPb,
        input: &RowBatch,
    ) -> ExecResult<ArrayRef> {
        let num_rows = input.num_rows();
        match expr {
            ScalarExpressionPb::Constant(v) => Ok(make_array_from_scalar(v, num_rows)),
            ScalarExpressionPb::Column { index } => Ok(input.column(*index).clone()),
            ScalarExpressionPb::Func { id, args, .. } => {
                let arg_arrays: Vec<ArrayRef> = args
                    .iter()
                    .map(|a| self.eval_array(state, a, input))
                    .collect::<ExecResult<_>>()?;
                let udf = self
                    .instances
                    .get(id)
                    .ok_or_else(|| ExecError::Internal(format!("udf {} not instantiated", id)))?;
                Ok(udf.exec_batch(&state.function_ctx, &arg_arrays, num_rows)?)
            }
        }
    }
}

impl ScalarExpressionEvaluator for ArrowNativeEvaluator {
    fn open(&mut self, state: &ExecState) -> ExecResult<()> {
        self.instances = make_instances(&self.expressions, state)?;
        Ok(())
    }

    fn evaluate(&mut self, state: &ExecState, input: &RowBatch) -> ExecResult<Vec<ArrayRef>> {
        let expressions = self.expressions.clone();
        expressions
            .iter()
            .map(|e| self.eval_array(state, e, input))
            .collect()
    }

    fn close(&mut self, _state: &ExecState) -> ExecResult<()> {
        self.instances.clear();
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_store::TableStore;
    use crate::types::DataType;
    use crate::udf::Registry;
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_state() -> ExecState {
        ExecState::new(
            Uuid::new_v4(),
            Arc::new(TableStore::new()),
            Arc::new(Registry::with_builtins()),
            Arc::new(crate::exec::GrpcRouter::new()),
            EvaluatorKind::VectorNative,
            1024,
        )
    }

    fn register_add(state: &mut ExecState) -> i64 {
        let def = state
            .registry
            .get_udf("add", &[DataType::Int64, DataType::Int64])
            .unwrap();
        state.scalar_udfs.insert(0, def);
        0
    }

    fn input_batch() -> RowBatch {
        RowBatch::from_columns(vec![column_wrapper_to_array(&ColumnWrapper::Int64(vec![
            1, 2, 3,
        ]))])
        .unwrap()
    }

    fn add_expr(id: i64) -> ScalarExpressionPb {
        ScalarExpressionPb::Func {
            name: "add".to_string(),
            id,
            args: vec![
                ScalarExpressionPb::Column { index: 0 },
                ScalarExpressionPb::Constant(ScalarValue::Int64(10)),
            ],
            arg_types: vec![DataType::Int64, DataType::Int64],
            return_type: DataType::Int64,
        }
    }

    #[test]
    fn test_evaluators_agree() {
        let mut state = test_state();
        let id = register_add(&mut state);
        let input = input_batch();

        let mut results = Vec::new();
        for kind in [EvaluatorKind::VectorNative, EvaluatorKind::ArrowNative] {
            let mut evaluator = create_evaluator(vec![add_expr(id)], kind);
            evaluator.open(&state).unwrap();
            let out = evaluator.evaluate(&state, &input).unwrap();
            evaluator.close(&state).unwrap();
            results.push(column_wrapper_from_array(&out[0]).unwrap());
        }
        assert_eq!(results[0], ColumnWrapper::Int64(vec![11, 12, 13]));
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_column_and_constant_only() {
        let state = test_state();
        let input = input_batch();
        let exprs = vec![
            ScalarExpressionPb::Column { index: 0 },
            ScalarExpressionPb::Constant(ScalarValue::Boolean(true)),
        ];
        for kind in [EvaluatorKind::VectorNative, EvaluatorKind::ArrowNative] {
            let mut evaluator = create_evaluator(exprs.clone(), kind);
            evaluator.open(&state).unwrap();
            let out = evaluator.evaluate(&state, &input).unwrap();
            assert_eq!(out.len(), 2);
            assert_eq!(out[0].len(), 3);
            assert_eq!(
                column_wrapper_from_array(&out[1]).unwrap(),
                ColumnWrapper::Boolean(vec![true, true, true])
            );
        }
    }

    #[test]
    fn test_nested_function_tree() {
        let mut state = test_state();
        let id = register_add(&mut state);
        // add(add(col, 10), 100)
        let expr = ScalarExpressionPb::Func {
            name: "add".to_string(),
            id,
            args: vec![
                add_expr(id),
                ScalarExpressionPb::Constant(ScalarValue::Int64(100)),
            ],
            arg_types: vec![DataType::Int64, DataType::Int64],
            return_type: DataType::Int64,
        };
        let input = input_batch();
        for kind in [EvaluatorKind::VectorNative, EvaluatorKind::ArrowNative] {
            let mut evaluator = create_evaluator(vec![expr.clone()], kind);
            evaluator.open(&state).unwrap();
            let out = evaluator.evaluate(&state, &input).unwrap();
            assert_eq!(
                column_wrapper_from_array(&out[0]).unwrap(),
                ColumnWrapper::Int64(vec![111, 112, 113])
            );
        }
    }
}
