//! # Distributed Planner
//!
//! Splits one analyzed logical IR into per-instance physical IRs stitched by
//! network sinks and sources.
//!
//! ```text
//! logical IR + CarnotInfo fleet
//!     ↓ split at blocking boundaries (partial agg → GRPCSink / GRPCSourceGroup → final agg)
//!     ↓ per-PEM tablet expansion
//!     ↓ UDTF source pruning per executor constraint
//!     ↓ address stamping + sink/source-group stitching
//!     ↓ source-group expansion (one GRPCSource per connected sink)
//! DistributedPlan (instance DAG + per-instance IR)
//! ```

pub mod distributed_rules;
pub mod tablet_rules;

use crate::compiler::error::CompilerError;
use crate::ir::{IrGraph, IrNodeKind, NodeId, OperatorKind};
use crate::plan::{DagNodePb, DistributedPlanPb};
use crate::rules::Rule;
use crate::types::Relation;
use crate::udf::Registry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("No agent is eligible to run this query")]
    NoEligibleAgent,

    #[error("Instance '{address}' is missing a capability: {msg}")]
    MissingCapability { address: String, msg: String },

    #[error("Planning failed on instance '{address}': {source}")]
    Instance {
        address: String,
        #[source]
        source: CompilerError,
    },

    #[error("On instance '{address}': a pruned source feeds a join whose other side survives; this plan shape is not yet defined")]
    UnresolvedJoinAfterPrune { address: String },

    #[error("Planning failed: {0}")]
    General(String),
}

pub type PlanResult<T> = Result<T, PlanError>;

// ============================================================================
// Instance descriptors
// ============================================================================

/// Per-table tabletization info carried by an agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableInfo {
    pub table: String,
    pub tabletization_key: Option<String>,
    pub tablets: Vec<String>,
}

/// Capability descriptor of one execution agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CarnotInfo {
    pub query_broker_address: String,
    /// Present iff `has_grpc_server`.
    pub grpc_address: String,
    pub has_grpc_server: bool,
    pub has_data_store: bool,
    pub processes_data: bool,
    pub accepts_remote_sources: bool,
    /// Agent short id.
    pub asid: u32,
    pub table_info: Vec<TableInfo>,
}

impl CarnotInfo {
    /// An edge agent owning local tables.
    pub fn pem(address: &str, asid: u32) -> Self {
        CarnotInfo {
            query_broker_address: address.to_string(),
            grpc_address: String::new(),
            has_grpc_server: false,
            has_data_store: true,
            processes_data: true,
            accepts_remote_sources: false,
            asid,
            table_info: vec![],
        }
    }

    /// A central aggregator accepting remote sources.
    pub fn kelvin(address: &str, grpc_address: &str, asid: u32) -> Self {
        CarnotInfo {
            query_broker_address: address.to_string(),
            grpc_address: grpc_address.to_string(),
            has_grpc_server: true,
            has_data_store: false,
            processes_data: true,
            accepts_remote_sources: true,
            asid,
            table_info: vec![],
        }
    }

    pub fn is_kelvin(&self) -> bool {
        self.has_grpc_server && self.accepts_remote_sources
    }

    pub fn is_pem(&self) -> bool {
        self.has_data_store && self.processes_data && !self.accepts_remote_sources
    }
}

// ============================================================================
// Distributed plan
// ============================================================================

/// One node of the distributed plan: an agent plus its physical IR.
#[derive(Debug, Clone)]
pub struct CarnotInstance {
    pub id: i64,
    pub info: CarnotInfo,
    pub plan: IrGraph,
}

impl CarnotInstance {
    pub fn address(&self) -> &str {
        &self.info.query_broker_address
    }
}

/// A DAG of instances; edges denote that one instance streams data to
/// another.
#[derive(Debug, Clone, Default)]
pub struct DistributedPlan {
    pub instances: BTreeMap<i64, CarnotInstance>,
    pub edges: Vec<(i64, i64)>,
}

impl DistributedPlan {
    pub fn add_instance(&mut self, instance: CarnotInstance) {
        self.instances.insert(instance.id, instance);
    }

    pub fn add_edge(&mut self, from: i64, to: i64) {
        if !self.edges.contains(&(from, to)) {
            self.edges.push((from, to));
        }
    }

    /// Instances `from` streams data to.
    pub fn dependencies_of(&self, from: i64) -> Vec<i64> {
        self.edges
            .iter()
            .filter(|(f, _)| *f == from)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn instance(&self, id: i64) -> Option<&CarnotInstance> {
        self.instances.get(&id)
    }

    pub fn instance_by_address(&self, address: &str) -> Option<&CarnotInstance> {
        self.instances.values().find(|i| i.address() == address)
    }

    pub fn remove_instance(&mut self, id: i64) {
        self.instances.remove(&id);
        self.edges.retain(|(f, t)| *f != id && *t != id);
    }

    /// Serialize each per-instance IR to the wire plan format.
    pub fn to_proto(&self, registry: &Registry) -> PlanResult<DistributedPlanPb> {
        let mut pb = DistributedPlanPb::default();
        for instance in self.instances.values() {
            let plan = crate::plan::plan_from_graph(&instance.plan, registry).map_err(|e| {
                PlanError::Instance { address: instance.address().to_string(), source: e }
            })?;
            pb.qb_address_to_plan.insert(instance.address().to_string(), plan);
            pb.qb_address_to_dag_id.insert(instance.address().to_string(), instance.id);
        }
        for (&id, _) in &self.instances {
            pb.dag.nodes.push(DagNodePb {
                id,
                sorted_children: self.dependencies_of(id),
                sorted_parents: self
                    .edges
                    .iter()
                    .filter(|(_, t)| *t == id)
                    .map(|(f, _)| *f)
                    .collect(),
            });
        }
        Ok(pb)
    }
}

/// Cross-instance rule: the distributed counterpart of `rules::Rule`.
pub trait DistributedRule {
    fn name(&self) -> &'static str;

    fn apply(&self, instance: &mut CarnotInstance) -> PlanResult<bool>;

    fn execute(&self, plan: &mut DistributedPlan) -> PlanResult<bool> {
        let mut changed = false;
        for instance in plan.instances.values_mut() {
            changed = self.apply(instance)? || changed;
        }
        Ok(changed)
    }
}

/// Lifts a scalar IR rule over every instance's graph, tagging failures with
/// the instance address.
pub struct LiftedRule<R: Rule> {
    pub rule: R,
}

impl<R: Rule> DistributedRule for LiftedRule<R> {
    fn name(&self) -> &'static str {
        self.rule.name()
    }

    fn apply(&self, instance: &mut CarnotInstance) -> PlanResult<bool> {
        let address = instance.address().to_string();
        self.rule
            .execute(&mut instance.plan)
            .map_err(|e| PlanError::Instance { address, source: e })
    }
}

// ============================================================================
// Graph surgery helpers
// ============================================================================

/// Remove an operator together with its owned expression subtrees and every
/// incident edge.
pub(crate) fn remove_operator(graph: &mut IrGraph, op: NodeId) -> Result<(), CompilerError> {
    for child in graph.dependencies_of(op) {
        if graph.is_operator(child) {
            graph.remove_parent(child, op)?;
        } else {
            graph.delete_edge(op, child)?;
            graph.delete_expression_subtree(child)?;
        }
    }
    for parent in graph.parents_of(op) {
        graph.remove_parent(op, parent)?;
    }
    graph.delete_node(op)?;
    Ok(())
}

/// Delete `root` and its downstream consumers. A union whose other inputs
/// survive merely loses the pruned edge; a join in the same position is a
/// planning error (`UnresolvedJoinAfterPrune`).
pub(crate) fn prune_subgraph(
    graph: &mut IrGraph,
    root: NodeId,
    address: &str,
) -> PlanResult<()> {
    // Grow the delete set: an op joins once all of its parents are in it.
    let mut set: BTreeSet<NodeId> = BTreeSet::new();
    set.insert(root);
    loop {
        let mut grew = false;
        for &member in set.clone().iter() {
            for child in graph.dependencies_of(member) {
                if !graph.is_operator(child) || set.contains(&child) {
                    continue;
                }
                let parents = graph.operator(child).map_err(|e| PlanError::Instance {
                    address: address.to_string(),
                    source: e.into(),
                })?;
                let all_in = parents.parents.iter().all(|p| set.contains(p));
                if all_in {
                    set.insert(child);
                    grew = true;
                } else {
                    match graph.kind(child) {
                        Ok(IrNodeKind::Union) => {
                            // Keep the union; it loses this input below.
                        }
                        _ => {
                            return Err(PlanError::UnresolvedJoinAfterPrune {
                                address: address.to_string(),
                            })
                        }
                    }
                }
            }
        }
        if !grew {
            break;
        }
    }

    // Detach surviving unions from deleted parents, then drop the set.
    let members: Vec<NodeId> = set.iter().copied().collect();
    for &member in &members {
        for child in graph.dependencies_of(member) {
            if graph.is_operator(child) && !set.contains(&child) {
                graph
                    .remove_parent(child, member)
                    .map_err(|e| PlanError::Instance {
                        address: address.to_string(),
                        source: e.into(),
                    })?;
            }
        }
    }
    for &member in members.iter().rev() {
        remove_operator(graph, member).map_err(|e| PlanError::Instance {
            address: address.to_string(),
            source: e,
        })?;
    }
    Ok(())
}

/// All operators strictly upstream of `op` (ancestors through parent edges).
pub(crate) fn upstream_ops(graph: &IrGraph, op: NodeId) -> BTreeSet<NodeId> {
    let mut set = BTreeSet::new();
    let mut stack: Vec<NodeId> = graph
        .operator(op)
        .map(|o| o.parents.clone())
        .unwrap_or_default();
    while let Some(cur) = stack.pop() {
        if set.insert(cur) {
            if let Ok(o) = graph.operator(cur) {
                stack.extend(o.parents.iter().copied());
            }
        }
    }
    set
}

/// Whether any ancestor of `op` is a `MemorySource` (i.e. this boundary
/// spans data held on edge agents).
pub(crate) fn upstream_has_memory_source(graph: &IrGraph, op: NodeId) -> bool {
    upstream_ops(graph, op)
        .iter()
        .any(|&a| graph.kind(a) == Ok(IrNodeKind::MemorySource))
}

// ============================================================================
// Coordinator
// ============================================================================

/// Builds the distributed plan for one analyzed logical IR.
pub struct Coordinator<'r> {
    registry: &'r Registry,
}

impl<'r> Coordinator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Coordinator { registry }
    }

    pub fn plan(&self, logical: &IrGraph, infos: &[CarnotInfo]) -> PlanResult<DistributedPlan> {
        if infos.is_empty() {
            return Err(PlanError::NoEligibleAgent);
        }

        let kelvins: Vec<&CarnotInfo> = infos.iter().filter(|i| i.is_kelvin()).collect();
        let pems: Vec<&CarnotInfo> = infos.iter().filter(|i| i.is_pem()).collect();
        if kelvins.is_empty() && pems.is_empty() {
            return Err(PlanError::NoEligibleAgent);
        }

        let mut dplan = DistributedPlan::default();
        let single_instance = infos.len() == 1;
        let needs_split = !single_instance && !pems.is_empty() && has_distributed_boundary(logical);
        if !single_instance && pems.len() > 1 && kelvins.is_empty() && has_distributed_boundary(logical)
        {
            // Data on many edges with nobody to merge it.
            return Err(PlanError::NoEligibleAgent);
        }

        // Primary kelvin: lowest query broker address.
        let primary_kelvin = kelvins
            .iter()
            .map(|k| k.query_broker_address.clone())
            .min();

        let (producer_plan, consumer_plan) = if needs_split {
            let split = splitter::split(logical, self.registry)?;
            (split.producer, split.consumer)
        } else {
            (logical.clone(), logical.clone())
        };

        let mut next_id: i64 = 0;
        for info in infos {
            let plan = if info.is_kelvin() || !needs_split {
                consumer_plan.clone()
            } else {
                producer_plan.clone()
            };
            dplan.add_instance(CarnotInstance { id: next_id, info: info.clone(), plan });
            next_id += 1;
        }

        // Stream edges: every producer feeds the primary kelvin.
        if needs_split {
            if let Some(primary) = &primary_kelvin {
                let primary_id = dplan
                    .instance_by_address(primary)
                    .map(|i| i.id)
                    .expect("primary kelvin instantiated");
                let producer_ids: Vec<i64> = dplan
                    .instances
                    .values()
                    .filter(|i| !i.info.is_kelvin())
                    .map(|i| i.id)
                    .collect();
                for id in producer_ids {
                    dplan.add_edge(id, primary_id);
                }
            } else {
                return Err(PlanError::NoEligibleAgent);
            }
        }

        // Per-PEM tablet expansion.
        tablet_rules::Tabletizer::execute(&mut dplan)?;

        // UDTF source pruning, then drop instances left without sources.
        distributed_rules::PruneUnavailableSourcesRule::new(
            self.registry,
            primary_kelvin.clone(),
        )
        .execute(&mut dplan)?;
        self.drop_sourceless_instances(&mut dplan);

        // Address stamping, stitching, and source-group expansion.
        distributed_rules::SetSourceGroupGRPCAddressRule.execute(&mut dplan)?;
        distributed_rules::associate_edges(&mut dplan)?;
        distributed_rules::expand_source_groups(&mut dplan)?;
        self.drop_sourceless_instances(&mut dplan);

        // Re-run relation propagation across the stitched edges so any
        // operator introduced by the expansion carries its schema.
        LiftedRule { rule: crate::analyzer::OperatorRelationRule }.execute(&mut dplan)?;

        if dplan.instances.is_empty() {
            return Err(PlanError::NoEligibleAgent);
        }
        debug!(instances = dplan.instances.len(), "distributed plan built");
        Ok(dplan)
    }

    /// An instance whose plan lost all of its sources is dropped, which is
    /// not an error.
    fn drop_sourceless_instances(&self, dplan: &mut DistributedPlan) {
        let empty: Vec<i64> = dplan
            .instances
            .values()
            .filter(|inst| {
                !inst.plan.operators().iter().any(|&op| {
                    inst.plan
                        .kind(op)
                        .map(|k| k.is_source())
                        .unwrap_or(false)
                })
            })
            .map(|inst| inst.id)
            .collect();
        for id in empty {
            debug!(instance = id, "dropping instance with no sources");
            dplan.remove_instance(id);
        }
    }
}

/// Whether the logical plan reads data held on edge agents at all.
fn has_distributed_boundary(graph: &IrGraph) -> bool {
    !graph.find_nodes_of_kind(IrNodeKind::MemorySource).is_empty()
}

// ============================================================================
// Splitter
// ============================================================================

pub(crate) mod splitter {
    use super::*;

    pub struct SplitPlans {
        /// The PEM half: pre-boundary subgraph feeding GRPC sinks.
        pub producer: IrGraph,
        /// The Kelvin half: GRPC source groups feeding the rest.
        pub consumer: IrGraph,
    }

    /// Boundary operators: blocking aggregations whose input spans
    /// instances; when none exist, the memory sinks themselves.
    fn boundaries(graph: &IrGraph) -> Vec<NodeId> {
        let blocking: Vec<NodeId> = graph
            .find_nodes_of_kind(IrNodeKind::BlockingAgg)
            .into_iter()
            .filter(|&b| upstream_has_memory_source(graph, b))
            .collect();
        if !blocking.is_empty() {
            return blocking;
        }
        graph
            .find_nodes_of_kind(IrNodeKind::MemorySink)
            .into_iter()
            .filter(|&s| upstream_has_memory_source(graph, s))
            .collect()
    }

    /// The relation crossing the bridge at a boundary: for a blocking agg,
    /// groups plus serialized partial columns; for a sink, its input
    /// relation.
    fn bridge_relation(
        graph: &IrGraph,
        boundary: NodeId,
        registry: &Registry,
    ) -> PlanResult<Relation> {
        let op = graph
            .operator(boundary)
            .map_err(|e| PlanError::General(e.to_string()))?;
        match &op.kind {
            OperatorKind::BlockingAgg { agg_exprs, groups, .. } => {
                let final_rel = op.relation.clone().ok_or_else(|| {
                    PlanError::General("splitting an unanalyzed aggregate".to_string())
                })?;
                let mut rel = Relation::new();
                for (i, _) in groups.iter().enumerate() {
                    rel.add_column(
                        final_rel.col_name_at(i).unwrap(),
                        final_rel.col_type_at(i).unwrap(),
                    )
                    .map_err(|e| PlanError::General(e.to_string()))?;
                }
                for ce in agg_exprs {
                    let (uda_name, arg_types) = match &graph
                        .expression(ce.expr)
                        .map_err(|e| PlanError::General(e.to_string()))?
                        .kind
                    {
                        crate::ir::ExpressionKind::Func { name, arg_types, .. } => {
                            (name.clone(), arg_types.clone())
                        }
                        _ => {
                            return Err(PlanError::General(
                                "aggregate expression is not a function".to_string(),
                            ))
                        }
                    };
                    let def = registry.get_uda(&uda_name, &arg_types).ok_or_else(|| {
                        PlanError::General(format!("unknown aggregate '{}'", uda_name))
                    })?;
                    rel.add_column(&ce.name, def.partial_type)
                        .map_err(|e| PlanError::General(e.to_string()))?;
                }
                Ok(rel)
            }
            _ => op
                .relation
                .clone()
                .ok_or_else(|| PlanError::General("splitting an unanalyzed sink".to_string())),
        }
    }

    pub fn split(logical: &IrGraph, registry: &Registry) -> PlanResult<SplitPlans> {
        let boundary_ids = boundaries(logical);
        if boundary_ids.is_empty() {
            return Ok(SplitPlans { producer: logical.clone(), consumer: logical.clone() });
        }

        let mut producer = logical.clone();
        let mut consumer = logical.clone();

        for (bridge_id, &boundary) in boundary_ids.iter().enumerate() {
            let bridge_id = bridge_id as i64;
            let bridge_rel = bridge_relation(logical, boundary, registry)?;
            let is_agg = logical.kind(boundary) == Ok(IrNodeKind::BlockingAgg);

            // ---- Producer half -------------------------------------------
            if is_agg {
                // Keep the agg as a partial aggregate; everything after it
                // goes through a GRPC sink.
                let downstream: Vec<NodeId> = producer
                    .downstream_ops(boundary)
                    .into_iter()
                    .filter(|&o| o != boundary)
                    .collect();
                for &op in downstream.iter().rev() {
                    remove_operator(&mut producer, op)
                        .map_err(|e| PlanError::General(e.to_string()))?;
                }
                if let OperatorKind::BlockingAgg { partial_agg, finalize_results, .. } =
                    &mut producer
                        .operator_mut(boundary)
                        .map_err(|e| PlanError::General(e.to_string()))?
                        .kind
                {
                    *partial_agg = true;
                    *finalize_results = false;
                }
                producer
                    .operator_mut(boundary)
                    .map_err(|e| PlanError::General(e.to_string()))?
                    .relation = Some(bridge_rel.clone());

                let sink = producer.create_operator(OperatorKind::GrpcSink {
                    destination_id: bridge_id,
                    destination_address: String::new(),
                });
                producer
                    .add_parent(sink, boundary)
                    .map_err(|e| PlanError::General(e.to_string()))?;
                producer
                    .operator_mut(sink)
                    .map_err(|e| PlanError::General(e.to_string()))?
                    .relation = Some(bridge_rel.clone());
            } else {
                // Sink boundary: swap the memory sink for a GRPC sink.
                let parent = producer
                    .operator(boundary)
                    .map_err(|e| PlanError::General(e.to_string()))?
                    .parents[0];
                remove_operator(&mut producer, boundary)
                    .map_err(|e| PlanError::General(e.to_string()))?;
                let sink = producer.create_operator(OperatorKind::GrpcSink {
                    destination_id: bridge_id,
                    destination_address: String::new(),
                });
                producer
                    .add_parent(sink, parent)
                    .map_err(|e| PlanError::General(e.to_string()))?;
                producer
                    .operator_mut(sink)
                    .map_err(|e| PlanError::General(e.to_string()))?
                    .relation = Some(bridge_rel.clone());
            }

            // ---- Consumer half -------------------------------------------
            let upstream = upstream_ops(&consumer, boundary);
            for parent in consumer
                .operator(boundary)
                .map_err(|e| PlanError::General(e.to_string()))?
                .parents
                .clone()
            {
                consumer
                    .remove_parent(boundary, parent)
                    .map_err(|e| PlanError::General(e.to_string()))?;
            }
            // Detach and delete the whole upstream closure.
            for &op in upstream.iter() {
                for child in consumer.dependencies_of(op) {
                    if consumer.is_operator(child) && !upstream.contains(&child) && child != boundary
                    {
                        consumer
                            .remove_parent(child, op)
                            .map_err(|e| PlanError::General(e.to_string()))?;
                    }
                }
            }
            let mut ordered: Vec<NodeId> = upstream.iter().copied().collect();
            ordered.sort_unstable();
            for &op in ordered.iter().rev() {
                remove_operator(&mut consumer, op)
                    .map_err(|e| PlanError::General(e.to_string()))?;
            }

            let group = consumer.create_operator(OperatorKind::GrpcSourceGroup {
                source_id: bridge_id,
                grpc_address: String::new(),
                connected_sinks: vec![],
            });
            consumer
                .operator_mut(group)
                .map_err(|e| PlanError::General(e.to_string()))?
                .relation = Some(bridge_rel.clone());
            consumer
                .add_parent(boundary, group)
                .map_err(|e| PlanError::General(e.to_string()))?;

            if is_agg {
                // The finalizing aggregate merges serialized partials: its
                // inputs are the bridge columns, in bridge order.
                let (groups, agg_exprs) = match &consumer
                    .operator(boundary)
                    .map_err(|e| PlanError::General(e.to_string()))?
                    .kind
                {
                    OperatorKind::BlockingAgg { groups, agg_exprs, .. } => {
                        (groups.clone(), agg_exprs.clone())
                    }
                    _ => unreachable!(),
                };
                for (i, g) in groups.iter().enumerate() {
                    if let Ok(expr) = consumer.expression_mut(*g) {
                        match &mut expr.kind {
                            crate::ir::ExpressionKind::Column { parent_op, index, .. }
                            | crate::ir::ExpressionKind::Metadata { parent_op, index, .. } => {
                                *parent_op = Some(group);
                                *index = Some(i);
                            }
                            _ => {}
                        }
                    }
                }
                for (j, ce) in agg_exprs.iter().enumerate() {
                    let args = match &consumer
                        .expression(ce.expr)
                        .map_err(|e| PlanError::General(e.to_string()))?
                        .kind
                    {
                        crate::ir::ExpressionKind::Func { args, .. } => args.clone(),
                        _ => vec![],
                    };
                    for arg in args {
                        if let Ok(expr) = consumer.expression_mut(arg) {
                            if let crate::ir::ExpressionKind::Column { parent_op, index, .. } =
                                &mut expr.kind
                            {
                                *parent_op = Some(group);
                                *index = Some(groups.len() + j);
                            }
                        }
                    }
                }
                if let OperatorKind::BlockingAgg { partial_agg, finalize_results, .. } =
                    &mut consumer
                        .operator_mut(boundary)
                        .map_err(|e| PlanError::General(e.to_string()))?
                        .kind
                {
                    *partial_agg = false;
                    *finalize_results = true;
                }
            }
        }

        Ok(SplitPlans { producer, consumer })
    }
}

// Tests live with the rules and in the integration suite.
