//! Query Engine
//!
//! Ties the pipeline together: compile (front end + analyzer), plan
//! (distributed coordinator), and execute (one executor task per instance,
//! bridged in-process). Compilation is single-threaded per query; execution
//! is per-query parallel across instances.

use crate::analyzer::analyze_with_cap;
use crate::ast::AstModule;
use crate::compiler::{compile_ast, CompilerError, CompilerState};
use crate::config::Config;
use crate::exec::{ExecError, ExecState, Executor, GrpcBridge, GrpcRouter, LocalBridge};
use crate::ir::IrGraph;
use crate::plan::{DistributedPlanPb, OperatorPb};
use crate::planner::{CarnotInfo, Coordinator, DistributedPlan, PlanError};
use crate::table_store::{StoreError, Table, TableStore};
use crate::udf::{FunctionContext, MetadataState, Registry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Any failure in the compile → plan → execute pipeline.
#[derive(Error, Debug)]
pub enum CarnotError {
    #[error(transparent)]
    Compiler(#[from] CompilerError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The result of one executed query.
#[derive(Debug)]
pub struct QueryResult {
    /// Output tables by sink name, in sink declaration order.
    pub output_tables: Vec<(String, Arc<Table>)>,
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub compile_time_ns: u64,
    pub exec_time_ns: u64,
}

/// The engine: registry, local table store, and configuration.
pub struct Carnot {
    config: Config,
    table_store: Arc<TableStore>,
    registry: Arc<Registry>,
    metadata: Arc<MetadataState>,
}

impl Carnot {
    pub fn new(config: Config, table_store: Arc<TableStore>, registry: Arc<Registry>) -> Self {
        Carnot { config, table_store, registry, metadata: Arc::new(MetadataState::default()) }
    }

    /// Supply the cluster metadata backing the conversion UDFs.
    pub fn set_metadata_state(&mut self, metadata: Arc<MetadataState>) {
        self.metadata = metadata;
    }

    pub fn table_store(&self) -> &Arc<TableStore> {
        &self.table_store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// DSL AST → analyzed logical IR.
    pub fn compile(&self, ast: &AstModule, time_now: i64) -> Result<IrGraph, CarnotError> {
        let state = CompilerState::new(&self.registry, self.table_store.relation_map(), time_now);
        let mut graph = IrGraph::new();
        compile_ast(ast, &state, &mut graph)?;
        analyze_with_cap(&mut graph, &state, self.config.execution.max_rule_iterations)?;
        Ok(graph)
    }

    /// Analyzed logical IR → per-instance wire plans.
    pub fn plan(
        &self,
        graph: &IrGraph,
        infos: &[CarnotInfo],
    ) -> Result<(DistributedPlan, DistributedPlanPb), CarnotError> {
        let coordinator = Coordinator::new(&self.registry);
        let dplan = coordinator.plan(graph, infos)?;
        let pb = dplan.to_proto(&self.registry)?;
        Ok((dplan, pb))
    }

    /// Execute a distributed plan with one executor task per instance.
    ///
    /// `stores` maps query-broker addresses to the table store backing that
    /// instance; addresses without an entry get an empty store. Output
    /// tables are gathered from every instance's memory sinks.
    pub fn execute_distributed(
        &self,
        plan: &DistributedPlanPb,
        stores: &HashMap<String, Arc<TableStore>>,
    ) -> Result<QueryResult, CarnotError> {
        let exec_started = Instant::now();
        let query_id = Uuid::new_v4();
        // One wall-clock deadline governs every executor of the query.
        let deadline = match self.config.execution.query_timeout_ms {
            0 => None,
            ms => Some(exec_started + Duration::from_millis(ms)),
        };

        // One router per instance; bridges route by GRPC address.
        let mut routers: HashMap<String, Arc<GrpcRouter>> = HashMap::new();
        let mut bridges: HashMap<String, Arc<dyn GrpcBridge>> = HashMap::new();
        let mut instance_stores: HashMap<String, Arc<TableStore>> = HashMap::new();
        for address in plan.qb_address_to_plan.keys() {
            let router = Arc::new(GrpcRouter::new());
            routers.insert(address.clone(), Arc::clone(&router));
            instance_stores.insert(
                address.clone(),
                stores
                    .get(address)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(TableStore::new())),
            );
        }
        // Destination id → the instance hosting that GRPC source, so each
        // sink's target address routes to the right router.
        let mut source_host: HashMap<i64, String> = HashMap::new();
        for (address, instance_plan) in &plan.qb_address_to_plan {
            for fragment in &instance_plan.nodes {
                for node in &fragment.nodes {
                    if let OperatorPb::GrpcSource { source_id, .. } = &node.op {
                        source_host.insert(*source_id, address.clone());
                    }
                }
            }
        }
        for instance_plan in plan.qb_address_to_plan.values() {
            for fragment in &instance_plan.nodes {
                for node in &fragment.nodes {
                    if let OperatorPb::GrpcSink { address: target, destination_id } = &node.op {
                        if let Some(host) = source_host.get(destination_id) {
                            bridges.entry(target.clone()).or_insert_with(|| {
                                Arc::new(LocalBridge::new(Arc::clone(
                                    routers.get(host).expect("router exists"),
                                )))
                                    as Arc<dyn GrpcBridge>
                            });
                        }
                    }
                }
            }
        }

        // Spawn one executor per instance.
        let (tx, rx) = std::sync::mpsc::channel::<Result<(String, u64), ExecError>>();
        let mut cancel_flags: Vec<Arc<AtomicBool>> = Vec::new();
        std::thread::scope(|scope| {
            for (address, instance_plan) in &plan.qb_address_to_plan {
                let mut state = ExecState::new(
                    query_id,
                    Arc::clone(instance_stores.get(address).expect("store exists")),
                    Arc::clone(&self.registry),
                    Arc::clone(routers.get(address).expect("router exists")),
                    self.config.execution.evaluator,
                    self.config.execution.batch_size,
                );
                state.bridges = bridges.clone();
                state.function_ctx = FunctionContext::new(Arc::clone(&self.metadata));
                state.set_deadline(deadline);
                cancel_flags.push(state.cancel_flag());
                let tx = tx.clone();
                let address = address.clone();
                scope.spawn(move || {
                    let result = Executor::new(state, instance_plan)
                        .and_then(|mut executor| executor.run())
                        .map(|batches| (address.clone(), batches));
                    let _ = tx.send(result);
                });
            }
            drop(tx);

            // First failure cancels the peers; they drain and stop.
            let mut first_error: Option<ExecError> = None;
            for result in rx.iter() {
                match result {
                    Ok((address, batches)) => {
                        debug!(instance = %address, batches, "executor finished")
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            warn!(error = %e, "executor failed; cancelling peers");
                            for flag in &cancel_flags {
                                flag.store(true, Ordering::Relaxed);
                            }
                            first_error = Some(e);
                        }
                    }
                }
            }
            match first_error {
                Some(e) => Err(CarnotError::Exec(e)),
                None => Ok(()),
            }
        })?;

        // Gather output tables from the sinks of every instance.
        let mut output_tables = Vec::new();
        let mut rows: u64 = 0;
        let mut bytes: u64 = 0;
        for (address, instance_plan) in &plan.qb_address_to_plan {
            let store = instance_stores.get(address).expect("store exists");
            for fragment in &instance_plan.nodes {
                for node in &fragment.nodes {
                    if let OperatorPb::MemorySink { name, .. } = &node.op {
                        let table = store.get_table(name)?;
                        rows += table.num_rows() as u64;
                        for batch_idx in 0..table.num_batches() {
                            let all: Vec<usize> =
                                (0..table.relation().num_columns()).collect();
                            if let Ok(rb) = table.row_batch(batch_idx, &all) {
                                bytes += rb.num_bytes() as u64;
                            }
                        }
                        output_tables.push((name.clone(), table));
                    }
                }
            }
        }

        Ok(QueryResult {
            output_tables,
            rows_processed: rows,
            bytes_processed: bytes,
            compile_time_ns: 0,
            exec_time_ns: exec_started.elapsed().as_nanos() as u64,
        })
    }

    /// Compile, plan, and execute in one call against the engine's local
    /// store (used for single-instance queries and tests).
    pub fn query(
        &self,
        ast: &AstModule,
        time_now: i64,
        infos: &[CarnotInfo],
    ) -> Result<QueryResult, CarnotError> {
        let compile_started = Instant::now();
        let graph = self.compile(ast, time_now)?;
        let (_, plan_pb) = self.plan(&graph, infos)?;
        let compile_time_ns = compile_started.elapsed().as_nanos() as u64;

        let mut stores = HashMap::new();
        for address in plan_pb.qb_address_to_plan.keys() {
            stores.insert(address.clone(), Arc::clone(&self.table_store));
        }
        let mut result = self.execute_distributed(&plan_pb, &stores)?;
        result.compile_time_ns = compile_time_ns;
        Ok(result)
    }
}
