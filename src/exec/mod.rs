//! # Execution Engine
//!
//! One thread per query drives the local operator DAG in topological order,
//! pulling row batches from sources and pushing them through processing
//! nodes into sinks. Network sinks/sources stream frames through the GRPC
//! router; blocking aggregates accumulate fully before emitting.
//!
//! ```text
//! PlanFragment -> [build exec nodes] -> round-robin source drive
//!     MemorySource ──▶ Map ──▶ Filter ──▶ GRPCSink ──(bridge)──▶ router
//! ```

pub mod evaluator;
pub mod nodes;
pub mod router;

pub use evaluator::{create_evaluator, EvaluatorKind, ScalarExpressionEvaluator};
pub use router::{GrpcBridge, GrpcRouter, LocalBridge};

use crate::plan::{OperatorPb, PlanFragmentPb, PlanPb, ScalarExpressionPb};
use crate::table_store::{RowBatch, StoreError, TableStore};
use crate::udf::{FunctionContext, Registry, ScalarUdfDef, UdaDef, UdfError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Source table not found: {0}")]
    SourceNotFound(String),

    #[error("Batch schema mismatch: {0}")]
    BatchSchemaMismatch(String),

    #[error("UDF execution failed: {0}")]
    UdfExecutionFailed(String),

    #[error("Remote sink failed: {0}")]
    RemoteSinkFailed(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Query timed out")]
    QueryTimeout,

    #[error("Table store error: {0}")]
    Store(String),

    #[error("Internal executor error: {0}")]
    Internal(String),
}

impl From<UdfError> for ExecError {
    fn from(e: UdfError) -> Self {
        ExecError::UdfExecutionFailed(e.to_string())
    }
}

impl From<StoreError> for ExecError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TableNotFound(t) => ExecError::SourceNotFound(t),
            StoreError::TabletNotFound(t, tablet) => {
                ExecError::SourceNotFound(format!("{}/{}", t, tablet))
            }
            other => ExecError::Store(other.to_string()),
        }
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

// ============================================================================
// Exec state
// ============================================================================

/// Per-query execution state shared by every node of one executor.
pub struct ExecState {
    pub query_id: Uuid,
    pub table_store: Arc<TableStore>,
    pub registry: Arc<Registry>,
    pub function_ctx: FunctionContext,
    pub router: Arc<GrpcRouter>,
    /// Remote peers addressable by GRPC address.
    pub bridges: HashMap<String, Arc<dyn GrpcBridge>>,
    pub evaluator_kind: EvaluatorKind,
    /// Rows per emitted batch for sources and network sinks.
    pub batch_size: usize,
    /// Wall-clock deadline for the whole query, when configured.
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    stop_limit_reached: AtomicBool,
    scalar_udfs: HashMap<i64, Arc<ScalarUdfDef>>,
    udas: HashMap<i64, Arc<UdaDef>>,
}

impl ExecState {
    pub fn new(
        query_id: Uuid,
        table_store: Arc<TableStore>,
        registry: Arc<Registry>,
        router: Arc<GrpcRouter>,
        evaluator_kind: EvaluatorKind,
        batch_size: usize,
    ) -> Self {
        ExecState {
            query_id,
            table_store,
            registry,
            function_ctx: FunctionContext::default(),
            router,
            bridges: HashMap::new(),
            evaluator_kind,
            batch_size,
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            stop_limit_reached: AtomicBool::new(false),
            scalar_udfs: HashMap::new(),
            udas: HashMap::new(),
        }
    }

    /// Install the query's execution deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Whether the configured deadline has passed.
    pub fn timed_out(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// A handle the coordinator can use to cancel this query.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn signal_limit_reached(&self) {
        self.stop_limit_reached.store(true, Ordering::Relaxed);
    }

    pub fn limit_reached(&self) -> bool {
        self.stop_limit_reached.load(Ordering::Relaxed)
    }

    pub fn scalar_udf(&self, id: i64) -> ExecResult<Arc<ScalarUdfDef>> {
        self.scalar_udfs
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecError::Internal(format!("no scalar UDF registered under id {}", id)))
    }

    pub fn uda(&self, id: i64) -> ExecResult<Arc<UdaDef>> {
        self.udas
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecError::Internal(format!("no UDA registered under id {}", id)))
    }

    /// Populate the id → definition maps from a plan's function references.
    pub fn register_plan_functions(&mut self, plan: &PlanPb) -> ExecResult<()> {
        for fragment in &plan.nodes {
            for node in &fragment.nodes {
                match &node.op {
                    OperatorPb::Map { expressions, .. } => {
                        for e in expressions {
                            self.register_expr_functions(e)?;
                        }
                    }
                    OperatorPb::Filter { expression } => {
                        self.register_expr_functions(expression)?;
                    }
                    OperatorPb::BlockingAgg { values, .. } => {
                        for v in values {
                            let def = self
                                .registry
                                .get_uda(&v.uda_name, &v.arg_types)
                                .ok_or_else(|| {
                                    ExecError::Internal(format!(
                                        "plan references unknown UDA '{}'",
                                        v.uda_name
                                    ))
                                })?;
                            self.udas.insert(v.uda_id, def);
                            for a in &v.args {
                                self.register_expr_functions(a)?;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn register_expr_functions(&mut self, expr: &ScalarExpressionPb) -> ExecResult<()> {
        if let ScalarExpressionPb::Func { name, id, args, arg_types, .. } = expr {
            let def = self.registry.get_udf(name, arg_types).ok_or_else(|| {
                ExecError::Internal(format!("plan references unknown UDF '{}'", name))
            })?;
            self.scalar_udfs.insert(*id, def);
            for a in args {
                self.register_expr_functions(a)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Exec node contract
// ============================================================================

/// Lifecycle: `prepare → open → (generate | consume)* → close`.
pub trait ExecNode: Send {
    fn prepare(&mut self, _state: &ExecState) -> ExecResult<()> {
        Ok(())
    }

    fn open(&mut self, _state: &ExecState) -> ExecResult<()> {
        Ok(())
    }

    /// Sources produce their next batch; the batch's `eos` flag marks the
    /// end of the stream. `None` means the source is exhausted without a
    /// trailing batch.
    fn generate_next(&mut self, _state: &ExecState) -> ExecResult<Option<RowBatch>> {
        Ok(None)
    }

    /// Processing and sink nodes fold one input batch from parent `slot`
    /// and return the batches to forward downstream.
    fn consume(&mut self, _state: &ExecState, _rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        Ok(vec![])
    }

    fn close(&mut self, _state: &ExecState) -> ExecResult<()> {
        Ok(())
    }

    fn is_source(&self) -> bool {
        false
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Drives one plan fragment to completion.
pub struct Executor {
    state: ExecState,
    nodes: Vec<Box<dyn ExecNode>>,
    /// Per node: `(child index, child input slot)` pairs.
    children: Vec<Vec<(usize, usize)>>,
    sources: Vec<usize>,
}

impl Executor {
    /// Build exec nodes from the fragment, wiring parent/child slots.
    pub fn new(mut state: ExecState, plan: &PlanPb) -> ExecResult<Self> {
        state.register_plan_functions(plan)?;
        let fragment = plan
            .nodes
            .first()
            .ok_or_else(|| ExecError::Internal("plan has no fragments".to_string()))?;
        Self::from_fragment(state, fragment)
    }

    fn from_fragment(state: ExecState, fragment: &PlanFragmentPb) -> ExecResult<Self> {
        let mut index_of: HashMap<i64, usize> = HashMap::new();
        let mut nodes: Vec<Box<dyn ExecNode>> = Vec::with_capacity(fragment.nodes.len());
        let mut sources = Vec::new();
        for (i, node) in fragment.nodes.iter().enumerate() {
            index_of.insert(node.id, i);
            let num_parents = fragment
                .dag
                .nodes
                .iter()
                .find(|n| n.id == node.id)
                .map(|n| n.sorted_parents.len())
                .unwrap_or(0);
            let exec_node = nodes::build(&node.op, &state, num_parents)?;
            if exec_node.is_source() {
                sources.push(i);
            }
            nodes.push(exec_node);
        }

        let mut children: Vec<Vec<(usize, usize)>> = vec![Vec::new(); nodes.len()];
        for dag_node in &fragment.dag.nodes {
            let parent_idx = *index_of
                .get(&dag_node.id)
                .ok_or_else(|| ExecError::Internal("dag references unknown node".to_string()))?;
            for child_id in &dag_node.sorted_children {
                let child_idx = *index_of.get(child_id).ok_or_else(|| {
                    ExecError::Internal("dag references unknown child".to_string())
                })?;
                // The input slot is this parent's position among the child's
                // parents.
                let slot = fragment
                    .dag
                    .nodes
                    .iter()
                    .find(|n| n.id == *child_id)
                    .map(|n| {
                        n.sorted_parents
                            .iter()
                            .position(|p| *p == dag_node.id)
                            .unwrap_or(0)
                    })
                    .unwrap_or(0);
                children[parent_idx].push((child_idx, slot));
            }
        }
        Ok(Executor { state, nodes, children, sources })
    }

    pub fn state(&self) -> &ExecState {
        &self.state
    }

    /// Run to completion. Returns the number of source batches processed.
    pub fn run(&mut self) -> ExecResult<u64> {
        for node in self.nodes.iter_mut() {
            node.prepare(&self.state)?;
        }
        for node in self.nodes.iter_mut() {
            node.open(&self.state)?;
        }

        let sources = self.sources.clone();
        let mut active: Vec<bool> = vec![true; sources.len()];
        let mut batches: u64 = 0;
        while active.iter().any(|&a| a) {
            if self.state.is_cancelled() {
                self.close_all();
                return Err(ExecError::Cancelled);
            }
            if self.state.timed_out() {
                self.close_all();
                return Err(ExecError::QueryTimeout);
            }
            for (slot_idx, &source_idx) in sources.iter().enumerate() {
                if !active[slot_idx] {
                    continue;
                }
                match self.nodes[source_idx].generate_next(&self.state)? {
                    Some(batch) => {
                        batches += 1;
                        let eos = batch.eos();
                        self.route(source_idx, batch)?;
                        if eos {
                            active[slot_idx] = false;
                        }
                    }
                    None => active[slot_idx] = false,
                }
            }
            if self.state.limit_reached() {
                // The limit emitted its final batch downstream already;
                // upstream production stops here.
                trace!("limit reached; stopping sources");
                break;
            }
        }

        self.close_all();
        debug!(batches, "executor drained");
        Ok(batches)
    }

    /// Forward a batch from `from` through the graph.
    fn route(&mut self, from: usize, batch: RowBatch) -> ExecResult<()> {
        let mut queue: Vec<(usize, usize, RowBatch)> = Vec::new();
        for &(child, slot) in &self.children[from] {
            queue.push((child, slot, batch.clone()));
        }
        while let Some((node_idx, slot, rb)) = queue.pop() {
            let outputs = self.nodes[node_idx].consume(&self.state, rb, slot)?;
            for out in outputs {
                for &(child, child_slot) in &self.children[node_idx] {
                    queue.push((child, child_slot, out.clone()));
                }
            }
        }
        Ok(())
    }

    fn close_all(&mut self) {
        for node in self.nodes.iter_mut() {
            if let Err(e) = node.close(&self.state) {
                debug!(error = %e, "node close failed");
            }
        }
        self.state.router.release_query(self.state.query_id);
    }
}
