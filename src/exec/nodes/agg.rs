//! Blocking Aggregate
//!
//! Accumulates the whole input before emitting: one UDA instance per
//! aggregate per group, keyed by the group tuple in a concurrent hash map
//! (single-threaded access today; the map allows a parallel variant without
//! changing the contract). No output ordering is guaranteed.

use super::{scalar_expr_at, ExecError, ExecNode, ExecResult, ExecState};
use crate::plan::{AggregateExpressionPb, GroupPb, OperatorPb};
use crate::table_store::RowBatch;
use crate::types::arrow_adapter::{column_wrapper_to_array, scalar_at};
use crate::types::{ColumnWrapper, DataType, RowTuple, ScalarValue};
use crate::udf::Uda;
use dashmap::DashMap;

pub struct BlockingAggNode {
    groups: Vec<GroupPb>,
    values: Vec<AggregateExpressionPb>,
    partial_agg: bool,
    finalize_results: bool,

    grouped: DashMap<RowTuple, Vec<Box<dyn Uda>>>,
    /// The zero-group case keeps a single UDA vector instead of map entries.
    no_group_udas: Option<Vec<Box<dyn Uda>>>,
    saw_rows: bool,
    emitted: bool,
}

impl BlockingAggNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::BlockingAgg { groups, values, partial_agg, finalize_results } = op else {
            return Err(ExecError::Internal("expected BlockingAgg".to_string()));
        };
        Ok(BlockingAggNode {
            groups: groups.clone(),
            values: values.clone(),
            partial_agg: *partial_agg,
            finalize_results: *finalize_results,
            grouped: DashMap::new(),
            no_group_udas: None,
            saw_rows: false,
            emitted: false,
        })
    }

    /// Merge-only mode: inputs are serialized partials from upstream
    /// partial aggregates.
    fn merge_mode(&self) -> bool {
        self.finalize_results && !self.partial_agg
    }

    fn make_udas(&self, state: &ExecState) -> ExecResult<Vec<Box<dyn Uda>>> {
        self.values
            .iter()
            .map(|v| {
                let def = state.uda(v.uda_id)?;
                let mut uda = def.make();
                uda.init(&state.function_ctx, &[])?;
                Ok(uda)
            })
            .collect()
    }

    fn feed_row(
        &self,
        state: &ExecState,
        udas: &mut [Box<dyn Uda>],
        rb: &RowBatch,
        row: usize,
    ) -> ExecResult<()> {
        for (j, (uda, value)) in udas.iter_mut().zip(self.values.iter()).enumerate() {
            if self.merge_mode() {
                let partial = scalar_at(rb.column(self.groups.len() + j), row)
                    .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))?;
                uda.merge_partial(&partial)?;
            } else {
                let args: Vec<ScalarValue> = value
                    .args
                    .iter()
                    .map(|a| scalar_expr_at(a, rb, row))
                    .collect::<ExecResult<_>>()?;
                uda.update(&state.function_ctx, &args)?;
            }
        }
        Ok(())
    }

    fn output_value(&self, uda: &dyn Uda) -> ExecResult<ScalarValue> {
        if self.partial_agg && !self.finalize_results {
            Ok(uda.partial()?)
        } else {
            Ok(uda.finalize()?)
        }
    }

    fn output_types(&self) -> Vec<DataType> {
        let mut types: Vec<DataType> = self.groups.iter().map(|g| g.data_type).collect();
        for v in &self.values {
            types.push(if self.partial_agg && !self.finalize_results {
                v.partial_type
            } else {
                v.finalize_type
            });
        }
        types
    }

    fn emit(&mut self, state: &ExecState) -> ExecResult<RowBatch> {
        let types = self.output_types();
        let mut columns: Vec<ColumnWrapper> = types
            .iter()
            .map(|&t| ColumnWrapper::with_capacity(t, self.grouped.len()))
            .collect();

        if self.groups.is_empty() {
            // Zero groups with zero rows emits zero output rows.
            if self.saw_rows {
                let made = self.make_udas(state)?;
                self.no_group_udas.get_or_insert(made);
                let udas = self.no_group_udas.as_ref().unwrap();
                for (j, uda) in udas.iter().enumerate() {
                    columns[j].push(self.output_value(uda.as_ref())?);
                }
            }
        } else {
            for entry in self.grouped.iter() {
                let (key, udas) = entry.pair();
                for (i, v) in key.0.iter().enumerate() {
                    columns[i].push(v.clone());
                }
                for (j, uda) in udas.iter().enumerate() {
                    columns[self.groups.len() + j].push(self.output_value(uda.as_ref())?);
                }
            }
        }

        let mut rb =
            RowBatch::from_columns(columns.iter().map(column_wrapper_to_array).collect())?;
        rb.set_eow(true);
        rb.set_eos(true);
        Ok(rb)
    }
}

impl ExecNode for BlockingAggNode {
    fn consume(&mut self, state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        for row in 0..rb.num_rows() {
            self.saw_rows = true;
            if self.groups.is_empty() {
                if self.no_group_udas.is_none() {
                    self.no_group_udas = Some(self.make_udas(state)?);
                }
                let mut udas = self.no_group_udas.take().expect("just initialized");
                let fed = self.feed_row(state, &mut udas, &rb, row);
                self.no_group_udas = Some(udas);
                fed?;
            } else {
                let mut key = Vec::with_capacity(self.groups.len());
                for g in &self.groups {
                    key.push(
                        scalar_at(rb.column(g.index), row)
                            .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))?,
                    );
                }
                let key = RowTuple(key);
                if !self.grouped.contains_key(&key) {
                    self.grouped.insert(key.clone(), self.make_udas(state)?);
                }
                let mut entry = self.grouped.get_mut(&key).expect("just inserted");
                self.feed_row(state, entry.value_mut(), &rb, row)?;
            }
        }

        if rb.eos() && !self.emitted {
            self.emitted = true;
            return Ok(vec![self.emit(state)?]);
        }
        Ok(vec![])
    }
}

// ============================================================================
// Tests
// ============================================================================
