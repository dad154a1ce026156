//! Distributed Rules
//!
//! Per-instance and cross-instance planning rules: UDTF source pruning by
//! executor constraint, GRPC address stamping, sink/source-group stitching,
//! and the expansion of source groups into concrete per-sink sources.

use super::{
    prune_subgraph, remove_operator, CarnotInstance, DistributedPlan, DistributedRule, PlanError,
    PlanResult,
};
use crate::ir::{ExpressionKind, IrNodeKind, NodeId, OperatorKind};
use crate::types::ScalarValue;
use crate::udf::{Registry, UdtfExecutor};
use tracing::debug;

/// The agent short id embedded in the high bits of a 128-bit process id.
fn asid_from_upid(upid: u128) -> u32 {
    (upid >> 96) as u32
}

// ============================================================================
// PruneUnavailableSourcesRule
// ============================================================================

/// Deletes UDTF sources from instances that must not run them, per the
/// UDTF's executor constraint.
pub struct PruneUnavailableSourcesRule<'r> {
    registry: &'r Registry,
    /// Lowest Kelvin address, the designated `ONE_KELVIN` host.
    primary_kelvin: Option<String>,
}

impl<'r> PruneUnavailableSourcesRule<'r> {
    pub fn new(registry: &'r Registry, primary_kelvin: Option<String>) -> Self {
        PruneUnavailableSourcesRule { registry, primary_kelvin }
    }

    fn keep_udtf(&self, instance: &CarnotInstance, udtf: NodeId) -> PlanResult<bool> {
        let graph = &instance.plan;
        let (name, arg_values) = match &graph
            .operator(udtf)
            .map_err(|e| PlanError::Instance {
                address: instance.address().to_string(),
                source: e.into(),
            })?
            .kind
        {
            OperatorKind::UdtfSource { name, arg_values } => (name.clone(), arg_values.clone()),
            _ => return Ok(true),
        };
        let spec = self.registry.get_udtf(&name).ok_or_else(|| {
            PlanError::General(format!("UDTF '{}' disappeared from the registry", name))
        })?;

        let literal = |arg: &str| -> Option<ScalarValue> {
            let (_, expr) = arg_values.iter().find(|(n, _)| n == arg)?;
            match &graph.expression(*expr).ok()?.kind {
                ExpressionKind::Str(s) => Some(ScalarValue::String(s.clone())),
                ExpressionKind::Uint128(v) => Some(ScalarValue::Uint128(*v)),
                ExpressionKind::Int(v) => Some(ScalarValue::Int64(*v)),
                _ => None,
            }
        };

        let keep = match spec.executor {
            UdtfExecutor::OneKelvin => {
                instance.info.is_kelvin()
                    && Some(instance.address().to_string()) == self.primary_kelvin
            }
            UdtfExecutor::SubsetPem => {
                instance.info.is_pem()
                    && literal("upid")
                        .and_then(|v| v.as_u128())
                        .map(|u| asid_from_upid(u) == instance.info.asid)
                        .unwrap_or(false)
            }
            UdtfExecutor::AllAgents => match literal("agent_uid") {
                Some(ScalarValue::String(uid)) => uid == instance.address(),
                _ => true,
            },
        };
        Ok(keep)
    }
}

impl DistributedRule for PruneUnavailableSourcesRule<'_> {
    fn name(&self) -> &'static str {
        "PruneUnavailableSourcesRule"
    }

    fn apply(&self, instance: &mut CarnotInstance) -> PlanResult<bool> {
        let mut changed = false;
        for udtf in instance.plan.find_nodes_of_kind(IrNodeKind::UdtfSource) {
            if !instance.plan.contains(udtf) {
                continue;
            }
            if !self.keep_udtf(instance, udtf)? {
                let address = instance.address().to_string();
                debug!(instance = %address, node = udtf, "pruning UDTF source");
                prune_subgraph(&mut instance.plan, udtf, &address)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ============================================================================
// SetSourceGroupGRPCAddressRule
// ============================================================================

/// Stamps every `GRPCSourceGroup` with its owning instance's GRPC address,
/// so that upstream sinks can target it.
pub struct SetSourceGroupGRPCAddressRule;

impl DistributedRule for SetSourceGroupGRPCAddressRule {
    fn name(&self) -> &'static str {
        "SetSourceGroupGRPCAddressRule"
    }

    fn apply(&self, instance: &mut CarnotInstance) -> PlanResult<bool> {
        let address = instance.info.grpc_address.clone();
        let mut changed = false;
        for group in instance.plan.find_nodes_of_kind(IrNodeKind::GrpcSourceGroup) {
            let qb = instance.address().to_string();
            let op = instance
                .plan
                .operator_mut(group)
                .map_err(|e| PlanError::Instance { address: qb, source: e.into() })?;
            if let OperatorKind::GrpcSourceGroup { grpc_address, .. } = &mut op.kind {
                if *grpc_address != address {
                    *grpc_address = address.clone();
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

// ============================================================================
// AssociateDistributedPlanEdgesRule
// ============================================================================

/// For every `(from, to)` pair of instances (self-edges included), connects
/// `from`'s GRPC sinks to `to`'s matching source groups by bridge id.
pub fn associate_edges(dplan: &mut DistributedPlan) -> PlanResult<bool> {
    let mut pairs: Vec<(i64, i64)> = dplan.edges.clone();
    for &id in dplan.instances.keys() {
        pairs.push((id, id));
    }

    // Collect (to_instance, group_node, from_instance, sink_node) first; the
    // mutation below needs disjoint borrows.
    let mut connections: Vec<(i64, NodeId, i64, NodeId)> = Vec::new();
    for (from_id, to_id) in pairs {
        let (Some(from), Some(to)) = (dplan.instances.get(&from_id), dplan.instances.get(&to_id))
        else {
            continue;
        };
        let mut sink_by_bridge = std::collections::BTreeMap::new();
        for sink in from.plan.find_nodes_of_kind(IrNodeKind::GrpcSink) {
            if let Ok(op) = from.plan.operator(sink) {
                if let OperatorKind::GrpcSink { destination_id, .. } = &op.kind {
                    sink_by_bridge.insert(*destination_id, sink);
                }
            }
        }
        for group in to.plan.find_nodes_of_kind(IrNodeKind::GrpcSourceGroup) {
            if let Ok(op) = to.plan.operator(group) {
                if let OperatorKind::GrpcSourceGroup { source_id, .. } = &op.kind {
                    // Bridges for other plans have no matching sink here.
                    if let Some(&sink) = sink_by_bridge.get(source_id) {
                        connections.push((to_id, group, from_id, sink));
                    }
                }
            }
        }
    }

    let mut changed = false;
    for (to_id, group, from_id, sink) in connections {
        let to = dplan.instances.get_mut(&to_id).expect("instance exists");
        let qb = to.address().to_string();
        let op = to
            .plan
            .operator_mut(group)
            .map_err(|e| PlanError::Instance { address: qb, source: e.into() })?;
        if let OperatorKind::GrpcSourceGroup { connected_sinks, .. } = &mut op.kind {
            if !connected_sinks.contains(&(from_id, sink)) {
                connected_sinks.push((from_id, sink));
                changed = true;
            }
        }
    }
    Ok(changed)
}

// ============================================================================
// Source group expansion
// ============================================================================

/// Expands every connected `GRPCSourceGroup` into one `GRPCSource` per
/// connected sink (union-ed when several), assigning plan-unique destination
/// ids and back-patching each sink's destination id and address. Groups with
/// no connected sinks are pruned together with their consumers.
pub fn expand_source_groups(dplan: &mut DistributedPlan) -> PlanResult<()> {
    // Destination ids continue after the highest bridge id in use.
    let mut next_destination: i64 = dplan
        .instances
        .values()
        .flat_map(|inst| {
            inst.plan
                .find_nodes_of_kind(IrNodeKind::GrpcSink)
                .into_iter()
                .filter_map(|s| match inst.plan.operator(s).ok()?.kind {
                    OperatorKind::GrpcSink { destination_id, .. } => Some(destination_id),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .max()
        .unwrap_or(-1)
        + 1;

    let instance_ids: Vec<i64> = dplan.instances.keys().copied().collect();
    // Sink patches applied after the group-side surgery: (instance, sink,
    // destination id, address).
    let mut sink_patches: Vec<(i64, NodeId, i64, String)> = Vec::new();

    for to_id in instance_ids {
        let groups = {
            let inst = dplan.instances.get(&to_id).expect("instance exists");
            inst.plan.find_nodes_of_kind(IrNodeKind::GrpcSourceGroup)
        };
        for group in groups {
            let inst = dplan.instances.get(&to_id).expect("instance exists");
            let address = inst.address().to_string();
            if !inst.plan.contains(group) {
                continue;
            }
            let (connected, grpc_address, relation) = match inst.plan.operator(group) {
                Ok(op) => match &op.kind {
                    OperatorKind::GrpcSourceGroup { connected_sinks, grpc_address, .. } => (
                        connected_sinks.clone(),
                        grpc_address.clone(),
                        op.relation.clone(),
                    ),
                    _ => continue,
                },
                Err(e) => {
                    return Err(PlanError::Instance { address, source: e.into() })
                }
            };

            if connected.is_empty() {
                // Nobody produces into this bridge on this instance.
                let inst = dplan.instances.get_mut(&to_id).expect("instance exists");
                prune_subgraph(&mut inst.plan, group, &address)?;
                continue;
            }

            let wrap = |e: crate::ir::IrError| PlanError::Instance {
                address: address.clone(),
                source: e.into(),
            };

            let inst = dplan.instances.get_mut(&to_id).expect("instance exists");
            let mut sources = Vec::with_capacity(connected.len());
            for (from_id, sink) in &connected {
                let destination = next_destination;
                next_destination += 1;
                let source = inst
                    .plan
                    .create_operator(OperatorKind::GrpcSource { source_id: destination });
                inst.plan.operator_mut(source).map_err(wrap)?.relation = relation.clone();
                sources.push(source);
                sink_patches.push((*from_id, *sink, destination, grpc_address.clone()));
            }

            let replacement = if sources.len() == 1 {
                sources[0]
            } else {
                let union = inst.plan.create_operator(OperatorKind::Union {});
                inst.plan.operator_mut(union).map_err(wrap)?.relation = relation.clone();
                for &s in &sources {
                    inst.plan.add_parent(union, s).map_err(wrap)?;
                }
                union
            };
            for child in inst.plan.dependencies_of(group) {
                if inst.plan.is_operator(child) {
                    inst.plan.replace_parent(child, group, replacement).map_err(wrap)?;
                }
            }
            remove_operator(&mut inst.plan, group).map_err(|e| PlanError::Instance {
                address: address.clone(),
                source: e,
            })?;
            debug!(instance = to_id, sources = sources.len(), "expanded source group");
        }
    }

    for (from_id, sink, destination, address) in sink_patches {
        let Some(inst) = dplan.instances.get_mut(&from_id) else {
            continue;
        };
        let qb = inst.address().to_string();
        let op = inst
            .plan
            .operator_mut(sink)
            .map_err(|e| PlanError::Instance { address: qb, source: e.into() })?;
        if let OperatorKind::GrpcSink { destination_id, destination_address } = &mut op.kind {
            *destination_id = destination;
            *destination_address = address;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
