//! Builtin Functions
//!
//! The scalar, aggregate, and table functions registered at process start.
//! Scalar builtins provide both execution shapes: a per-row `exec` over
//! `ScalarValue`s and an arrow-native `exec_batch` built on typed builders.

use super::{
    FunctionContext, Registry, ScalarUdf, ScalarUdfDef, Uda, UdaDef, UdfError, UdtfArg,
    UdtfExecutor, UdtfSpec,
};
use crate::types::arrow_adapter::{column_wrapper_from_array, column_wrapper_to_array};
use crate::types::{ColumnWrapper, DataType, Relation, ScalarValue};
use arrow::array::ArrayRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Scalar UDF plumbing
// ============================================================================

type RowFn = Arc<dyn Fn(&FunctionContext, &[ScalarValue]) -> Result<ScalarValue, UdfError> + Send + Sync>;

/// A stateless scalar UDF built from a per-row closure. The batch shape
/// unpacks the arrays into column wrappers, applies the row function, and
/// repacks with the typed builders of the adapter.
struct ClosureUdf {
    row: RowFn,
    return_type: DataType,
}

impl ScalarUdf for ClosureUdf {
    fn exec(&self, ctx: &FunctionContext, args: &[ScalarValue]) -> Result<ScalarValue, UdfError> {
        (self.row)(ctx, args)
    }

    fn exec_batch(
        &self,
        ctx: &FunctionContext,
        args: &[ArrayRef],
        num_rows: usize,
    ) -> Result<ArrayRef, UdfError> {
        let wrappers: Vec<ColumnWrapper> = args
            .iter()
            .map(|a| {
                column_wrapper_from_array(a)
                    .map_err(|e| UdfError::ExecutionFailed(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        let mut out = ColumnWrapper::with_capacity(self.return_type, num_rows);
        let mut row: Vec<ScalarValue> = Vec::with_capacity(wrappers.len());
        for i in 0..num_rows {
            row.clear();
            for w in &wrappers {
                row.push(w.get(i));
            }
            out.push((self.row)(ctx, &row)?);
        }
        Ok(column_wrapper_to_array(&out))
    }
}

fn register_row_udf(
    registry: &mut Registry,
    name: &str,
    arg_types: Vec<DataType>,
    return_type: DataType,
    row: RowFn,
) {
    registry.register_udf(ScalarUdfDef {
        name: name.to_string(),
        arg_types,
        return_type,
        init_arg_types: vec![],
        factory: Arc::new(move || {
            Box::new(ClosureUdf { row: row.clone(), return_type }) as Box<dyn ScalarUdf>
        }),
    });
}

fn bad_args(name: &str, args: &[ScalarValue]) -> UdfError {
    let types: Vec<String> = args.iter().map(|a| a.data_type().to_string()).collect();
    UdfError::ArgTypeMismatch(name.to_string(), types.join(","))
}

// ============================================================================
// Scalar builtins
// ============================================================================

fn register_int_arith(registry: &mut Registry, name: &'static str, f: fn(i64, i64) -> Result<i64, UdfError>) {
    register_row_udf(
        registry,
        name,
        vec![DataType::Int64, DataType::Int64],
        DataType::Int64,
        Arc::new(move |_ctx, args| match args {
            [ScalarValue::Int64(a), ScalarValue::Int64(b)] => Ok(ScalarValue::Int64(f(*a, *b)?)),
            _ => Err(bad_args(name, args)),
        }),
    );
}

fn register_float_arith(registry: &mut Registry, name: &'static str, f: fn(f64, f64) -> f64) {
    register_row_udf(
        registry,
        name,
        vec![DataType::Float64, DataType::Float64],
        DataType::Float64,
        Arc::new(move |_ctx, args| match args {
            [ScalarValue::Float64(a), ScalarValue::Float64(b)] => {
                Ok(ScalarValue::Float64(f(*a, *b)))
            }
            _ => Err(bad_args(name, args)),
        }),
    );
}

/// `equals` / `not_equals` over every primitive type.
fn register_equality(registry: &mut Registry, name: &'static str, negate: bool) {
    for dt in [
        DataType::Boolean,
        DataType::Int64,
        DataType::Uint128,
        DataType::Float64,
        DataType::String,
        DataType::Time64Ns,
    ] {
        register_row_udf(
            registry,
            name,
            vec![dt, dt],
            DataType::Boolean,
            Arc::new(move |_ctx, args| {
                if args.len() != 2 {
                    return Err(UdfError::WrongArity(name.to_string(), 2, args.len()));
                }
                let eq = args[0] == args[1];
                Ok(ScalarValue::Boolean(if negate { !eq } else { eq }))
            }),
        );
    }
}

/// Ordering comparisons over the orderable types.
fn register_ordering(
    registry: &mut Registry,
    name: &'static str,
    accept: fn(std::cmp::Ordering) -> bool,
) {
    for dt in [DataType::Int64, DataType::Float64, DataType::Time64Ns, DataType::String] {
        register_row_udf(
            registry,
            name,
            vec![dt, dt],
            DataType::Boolean,
            Arc::new(move |_ctx, args| {
                let ord = match args {
                    [ScalarValue::Int64(a), ScalarValue::Int64(b)] => a.cmp(b),
                    [ScalarValue::Time64Ns(a), ScalarValue::Time64Ns(b)] => a.cmp(b),
                    [ScalarValue::String(a), ScalarValue::String(b)] => a.cmp(b),
                    [ScalarValue::Float64(a), ScalarValue::Float64(b)] => a
                        .partial_cmp(b)
                        .unwrap_or(std::cmp::Ordering::Greater),
                    _ => return Err(bad_args(name, args)),
                };
                Ok(ScalarValue::Boolean(accept(ord)))
            }),
        );
    }
}

pub fn register_scalar_builtins(registry: &mut Registry) {
    use std::cmp::Ordering;

    register_int_arith(registry, "add", |a, b| Ok(a.wrapping_add(b)));
    register_int_arith(registry, "subtract", |a, b| Ok(a.wrapping_sub(b)));
    register_int_arith(registry, "multiply", |a, b| Ok(a.wrapping_mul(b)));
    register_int_arith(registry, "divide", |a, b| {
        a.checked_div(b)
            .ok_or_else(|| UdfError::ExecutionFailed("integer division by zero".to_string()))
    });
    register_int_arith(registry, "modulo", |a, b| {
        a.checked_rem(b)
            .ok_or_else(|| UdfError::ExecutionFailed("integer modulo by zero".to_string()))
    });

    register_float_arith(registry, "add", |a, b| a + b);
    register_float_arith(registry, "subtract", |a, b| a - b);
    register_float_arith(registry, "multiply", |a, b| a * b);
    register_float_arith(registry, "divide", |a, b| a / b);

    register_equality(registry, "equals", false);
    register_equality(registry, "not_equals", true);

    register_ordering(registry, "less_than", |o| o == Ordering::Less);
    register_ordering(registry, "less_than_eq", |o| o != Ordering::Greater);
    register_ordering(registry, "greater_than", |o| o == Ordering::Greater);
    register_ordering(registry, "greater_than_eq", |o| o != Ordering::Less);

    // Boolean connectives.
    register_row_udf(
        registry,
        "logand",
        vec![DataType::Boolean, DataType::Boolean],
        DataType::Boolean,
        Arc::new(|_ctx, args| match args {
            [ScalarValue::Boolean(a), ScalarValue::Boolean(b)] => {
                Ok(ScalarValue::Boolean(*a && *b))
            }
            _ => Err(bad_args("logand", args)),
        }),
    );
    register_row_udf(
        registry,
        "logor",
        vec![DataType::Boolean, DataType::Boolean],
        DataType::Boolean,
        Arc::new(|_ctx, args| match args {
            [ScalarValue::Boolean(a), ScalarValue::Boolean(b)] => {
                Ok(ScalarValue::Boolean(*a || *b))
            }
            _ => Err(bad_args("logor", args)),
        }),
    );
    register_row_udf(
        registry,
        "lognot",
        vec![DataType::Boolean],
        DataType::Boolean,
        Arc::new(|_ctx, args| match args {
            [ScalarValue::Boolean(a)] => Ok(ScalarValue::Boolean(!*a)),
            _ => Err(bad_args("lognot", args)),
        }),
    );
    register_row_udf(
        registry,
        "negate",
        vec![DataType::Int64],
        DataType::Int64,
        Arc::new(|_ctx, args| match args {
            [ScalarValue::Int64(a)] => Ok(ScalarValue::Int64(-*a)),
            _ => Err(bad_args("negate", args)),
        }),
    );
    register_row_udf(
        registry,
        "negate",
        vec![DataType::Float64],
        DataType::Float64,
        Arc::new(|_ctx, args| match args {
            [ScalarValue::Float64(a)] => Ok(ScalarValue::Float64(-*a)),
            _ => Err(bad_args("negate", args)),
        }),
    );

    // Metadata conversion functions, backed by the cluster metadata state.
    register_row_udf(
        registry,
        "upid_to_service_name",
        vec![DataType::Uint128],
        DataType::String,
        Arc::new(|ctx, args| match args {
            [ScalarValue::Uint128(upid)] => Ok(ScalarValue::String(
                ctx.metadata
                    .upid_to_service
                    .get(upid)
                    .cloned()
                    .unwrap_or_default(),
            )),
            _ => Err(bad_args("upid_to_service_name", args)),
        }),
    );
    register_row_udf(
        registry,
        "upid_to_pod_name",
        vec![DataType::Uint128],
        DataType::String,
        Arc::new(|ctx, args| match args {
            [ScalarValue::Uint128(upid)] => Ok(ScalarValue::String(
                ctx.metadata
                    .upid_to_pod
                    .get(upid)
                    .cloned()
                    .unwrap_or_default(),
            )),
            _ => Err(bad_args("upid_to_pod_name", args)),
        }),
    );
}

// ============================================================================
// Aggregate builtins
// ============================================================================

#[derive(Default)]
struct CountUda {
    count: i64,
}

impl Uda for CountUda {
    fn update(&mut self, _ctx: &FunctionContext, _args: &[ScalarValue]) -> Result<(), UdfError> {
        self.count += 1;
        Ok(())
    }

    fn merge_partial(&mut self, partial: &ScalarValue) -> Result<(), UdfError> {
        match partial {
            ScalarValue::Int64(n) => {
                self.count += n;
                Ok(())
            }
            other => Err(UdfError::BadPartialState(format!(
                "count expected INT64 partial, got {}",
                other.data_type()
            ))),
        }
    }

    fn partial(&self) -> Result<ScalarValue, UdfError> {
        Ok(ScalarValue::Int64(self.count))
    }

    fn finalize(&self) -> Result<ScalarValue, UdfError> {
        Ok(ScalarValue::Int64(self.count))
    }
}

#[derive(Default)]
struct SumIntUda {
    sum: i64,
}

impl Uda for SumIntUda {
    fn update(&mut self, _ctx: &FunctionContext, args: &[ScalarValue]) -> Result<(), UdfError> {
        match args {
            [ScalarValue::Int64(v)] => {
                self.sum = self.sum.wrapping_add(*v);
                Ok(())
            }
            _ => Err(bad_args("sum", args)),
        }
    }

    fn merge_partial(&mut self, partial: &ScalarValue) -> Result<(), UdfError> {
        match partial {
            ScalarValue::Int64(v) => {
                self.sum = self.sum.wrapping_add(*v);
                Ok(())
            }
            other => Err(UdfError::BadPartialState(format!(
                "sum expected INT64 partial, got {}",
                other.data_type()
            ))),
        }
    }

    fn partial(&self) -> Result<ScalarValue, UdfError> {
        Ok(ScalarValue::Int64(self.sum))
    }

    fn finalize(&self) -> Result<ScalarValue, UdfError> {
        Ok(ScalarValue::Int64(self.sum))
    }
}

#[derive(Default)]
struct SumFloatUda {
    sum: f64,
}

impl Uda for SumFloatUda {
    fn update(&mut self, _ctx: &FunctionContext, args: &[ScalarValue]) -> Result<(), UdfError> {
        match args {
            [ScalarValue::Float64(v)] => {
                self.sum += *v;
                Ok(())
            }
            _ => Err(bad_args("sum", args)),
        }
    }

    fn merge_partial(&mut self, partial: &ScalarValue) -> Result<(), UdfError> {
        match partial {
            ScalarValue::Float64(v) => {
                self.sum += *v;
                Ok(())
            }
            other => Err(UdfError::BadPartialState(format!(
                "sum expected FLOAT64 partial, got {}",
                other.data_type()
            ))),
        }
    }

    fn partial(&self) -> Result<ScalarValue, UdfError> {
        Ok(ScalarValue::Float64(self.sum))
    }

    fn finalize(&self) -> Result<ScalarValue, UdfError> {
        Ok(ScalarValue::Float64(self.sum))
    }
}

/// Mean keeps sum and count; its partial is a JSON string so it survives the
/// wire between partial and finalizing aggregates.
#[derive(Default, Serialize, Deserialize)]
struct MeanUda {
    sum: f64,
    count: i64,
}

impl Uda for MeanUda {
    fn update(&mut self, _ctx: &FunctionContext, args: &[ScalarValue]) -> Result<(), UdfError> {
        let v = match args {
            [ScalarValue::Int64(v)] => *v as f64,
            [ScalarValue::Float64(v)] => *v,
            _ => return Err(bad_args("mean", args)),
        };
        self.sum += v;
        self.count += 1;
        Ok(())
    }

    fn merge_partial(&mut self, partial: &ScalarValue) -> Result<(), UdfError> {
        let s = partial
            .as_str()
            .ok_or_else(|| UdfError::BadPartialState("mean expected STRING partial".to_string()))?;
        let other: MeanUda =
            serde_json::from_str(s).map_err(|e| UdfError::BadPartialState(e.to_string()))?;
        self.sum += other.sum;
        self.count += other.count;
        Ok(())
    }

    fn partial(&self) -> Result<ScalarValue, UdfError> {
        serde_json::to_string(self)
            .map(ScalarValue::String)
            .map_err(|e| UdfError::BadPartialState(e.to_string()))
    }

    fn finalize(&self) -> Result<ScalarValue, UdfError> {
        if self.count == 0 {
            return Ok(ScalarValue::Float64(0.0));
        }
        Ok(ScalarValue::Float64(self.sum / self.count as f64))
    }
}

/// Min / max share one implementation parameterized by the comparison.
struct ExtremumUda {
    keep_greater: bool,
    current: Option<ScalarValue>,
}

impl ExtremumUda {
    fn better(&self, candidate: &ScalarValue, current: &ScalarValue) -> bool {
        let ord = match (candidate, current) {
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.cmp(b),
            (ScalarValue::Time64Ns(a), ScalarValue::Time64Ns(b)) => a.cmp(b),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => {
                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
            }
            _ => std::cmp::Ordering::Equal,
        };
        if self.keep_greater {
            ord == std::cmp::Ordering::Greater
        } else {
            ord == std::cmp::Ordering::Less
        }
    }

    fn absorb(&mut self, v: ScalarValue) {
        match &self.current {
            None => self.current = Some(v),
            Some(cur) => {
                if self.better(&v, cur) {
                    self.current = Some(v);
                }
            }
        }
    }
}

impl Uda for ExtremumUda {
    fn update(&mut self, _ctx: &FunctionContext, args: &[ScalarValue]) -> Result<(), UdfError> {
        if args.len() != 1 {
            return Err(UdfError::WrongArity("min/max".to_string(), 1, args.len()));
        }
        self.absorb(args[0].clone());
        Ok(())
    }

    fn merge_partial(&mut self, partial: &ScalarValue) -> Result<(), UdfError> {
        self.absorb(partial.clone());
        Ok(())
    }

    fn partial(&self) -> Result<ScalarValue, UdfError> {
        self.finalize()
    }

    fn finalize(&self) -> Result<ScalarValue, UdfError> {
        self.current
            .clone()
            .ok_or_else(|| UdfError::ExecutionFailed("min/max over zero rows".to_string()))
    }
}

pub fn register_uda_builtins(registry: &mut Registry) {
    // count over every primitive type.
    for dt in [
        DataType::Boolean,
        DataType::Int64,
        DataType::Uint128,
        DataType::Float64,
        DataType::String,
        DataType::Time64Ns,
    ] {
        registry.register_uda(UdaDef {
            name: "count".to_string(),
            update_arg_types: vec![dt],
            partial_type: DataType::Int64,
            finalize_type: DataType::Int64,
            init_arg_types: vec![],
            factory: Arc::new(|| Box::new(CountUda::default()) as Box<dyn Uda>),
        });
    }

    registry.register_uda(UdaDef {
        name: "sum".to_string(),
        update_arg_types: vec![DataType::Int64],
        partial_type: DataType::Int64,
        finalize_type: DataType::Int64,
        init_arg_types: vec![],
        factory: Arc::new(|| Box::new(SumIntUda::default()) as Box<dyn Uda>),
    });
    registry.register_uda(UdaDef {
        name: "sum".to_string(),
        update_arg_types: vec![DataType::Float64],
        partial_type: DataType::Float64,
        finalize_type: DataType::Float64,
        init_arg_types: vec![],
        factory: Arc::new(|| Box::new(SumFloatUda::default()) as Box<dyn Uda>),
    });

    for dt in [DataType::Int64, DataType::Float64] {
        registry.register_uda(UdaDef {
            name: "mean".to_string(),
            update_arg_types: vec![dt],
            partial_type: DataType::String,
            finalize_type: DataType::Float64,
            init_arg_types: vec![],
            factory: Arc::new(|| Box::new(MeanUda::default()) as Box<dyn Uda>),
        });
    }

    for dt in [DataType::Int64, DataType::Float64, DataType::Time64Ns] {
        registry.register_uda(UdaDef {
            name: "min".to_string(),
            update_arg_types: vec![dt],
            partial_type: dt,
            finalize_type: dt,
            init_arg_types: vec![],
            factory: Arc::new(|| {
                Box::new(ExtremumUda { keep_greater: false, current: None }) as Box<dyn Uda>
            }),
        });
        registry.register_uda(UdaDef {
            name: "max".to_string(),
            update_arg_types: vec![dt],
            partial_type: dt,
            finalize_type: dt,
            init_arg_types: vec![],
            factory: Arc::new(|| {
                Box::new(ExtremumUda { keep_greater: true, current: None }) as Box<dyn Uda>
            }),
        });
    }
}

// ============================================================================
// UDTF builtins
// ============================================================================

pub fn register_udtf_builtins(registry: &mut Registry) {
    registry.register_udtf(UdtfSpec {
        name: "ServiceUpTime".to_string(),
        args: vec![],
        relation: Relation::from_columns(vec![
            ("service", DataType::String),
            ("up_time_ns", DataType::Time64Ns),
        ]),
        executor: UdtfExecutor::OneKelvin,
        generator: Arc::new(|ctx: &FunctionContext, _args| {
            ctx.metadata
                .upid_to_service
                .values()
                .map(|svc| {
                    vec![ScalarValue::String(svc.clone()), ScalarValue::Time64Ns(0)]
                })
                .collect()
        }),
    });

    registry.register_udtf(UdtfSpec {
        name: "AgentStatus".to_string(),
        args: vec![UdtfArg {
            name: "agent_uid".to_string(),
            data_type: DataType::String,
            required: false,
        }],
        relation: Relation::from_columns(vec![
            ("agent", DataType::String),
            ("status", DataType::String),
        ]),
        executor: UdtfExecutor::AllAgents,
        generator: Arc::new(|_ctx, args: &HashMap<String, ScalarValue>| {
            let agent = args
                .get("agent_uid")
                .and_then(|v| v.as_str())
                .unwrap_or("self")
                .to_string();
            vec![vec![
                ScalarValue::String(agent),
                ScalarValue::String("healthy".to_string()),
            ]]
        }),
    });

    registry.register_udtf(UdtfSpec {
        name: "OpenNetworkConnections".to_string(),
        args: vec![UdtfArg {
            name: "upid".to_string(),
            data_type: DataType::Uint128,
            required: true,
        }],
        relation: Relation::from_columns(vec![
            ("time_", DataType::Time64Ns),
            ("fd", DataType::Int64),
            ("name", DataType::String),
        ]),
        executor: UdtfExecutor::SubsetPem,
        generator: Arc::new(|_ctx, _args| Vec::new()),
    });
}

// ============================================================================
// Tests
// ============================================================================
