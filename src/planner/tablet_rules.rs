//! Tablet Expansion
//!
//! On agents that shard tables by a tabletization key, each `MemorySource`
//! is wrapped into a `TabletSourceGroup` and then expanded into one
//! `MemorySource` per tablet joined by a `Union`. A downstream filter with
//! an equality on the tabletization key restricts the expansion to matching
//! tablets.

use super::{CarnotInfo, DistributedPlan, PlanError, PlanResult, TableInfo};
use crate::compiler::error::{CompilerError, CompilerResult};
use crate::ir::{ExpressionKind, IrGraph, IrNodeKind, NodeId, OperatorKind};
use crate::rules::Rule;
use std::collections::BTreeSet;
use tracing::debug;

/// Runs both tablet rules over every instance that owns tablets.
pub struct Tabletizer;

impl Tabletizer {
    pub fn execute(dplan: &mut DistributedPlan) -> PlanResult<()> {
        for instance in dplan.instances.values_mut() {
            if instance.info.table_info.is_empty() {
                continue;
            }
            let address = instance.address().to_string();
            let info = instance.info.clone();
            let wrap = |e: CompilerError| PlanError::Instance {
                address: address.clone(),
                source: e,
            };
            TabletSourceConversionRule { info: &info }
                .execute(&mut instance.plan)
                .map_err(wrap)?;
            MemorySourceTabletRule
                .execute(&mut instance.plan)
                .map_err(wrap)?;
        }
        Ok(())
    }
}

// ============================================================================
// TabletSourceConversionRule
// ============================================================================

/// Wraps memory sources over tabletized tables into `TabletSourceGroup`s.
pub struct TabletSourceConversionRule<'a> {
    pub info: &'a CarnotInfo,
}

impl TabletSourceConversionRule<'_> {
    fn table_info(&self, table: &str) -> Option<&TableInfo> {
        self.info
            .table_info
            .iter()
            .find(|t| t.table == table && t.tabletization_key.is_some() && !t.tablets.is_empty())
    }
}

impl Rule for TabletSourceConversionRule<'_> {
    fn name(&self) -> &'static str {
        "TabletSourceConversionRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if graph.kind(node) != Ok(IrNodeKind::MemorySource) {
            return Ok(false);
        }
        // Already wrapped sources sit behind a group.
        for group in graph.find_nodes_of_kind(IrNodeKind::TabletSourceGroup) {
            if let OperatorKind::TabletSourceGroup { source, .. } = &graph.operator(group)?.kind {
                if *source == node {
                    return Ok(false);
                }
            }
        }
        let table = match &graph.operator(node)?.kind {
            OperatorKind::MemorySource { table, .. } => table.clone(),
            _ => return Ok(false),
        };
        let Some(table_info) = self.table_info(&table) else {
            return Ok(false);
        };

        let group = graph.create_operator(OperatorKind::TabletSourceGroup {
            source: node,
            tablets: table_info.tablets.clone(),
            tabletization_key: table_info.tabletization_key.clone().unwrap(),
        });
        graph.operator_mut(group)?.relation = graph.operator(node)?.relation.clone();

        // The group takes over the source's consumers.
        for child in graph.dependencies_of(node) {
            if graph.is_operator(child) {
                graph.replace_parent(child, node, group)?;
            }
        }
        debug!(table = %table, tablets = table_info.tablets.len(), "wrapped source into tablet group");
        Ok(true)
    }
}

// ============================================================================
// MemorySourceTabletRule
// ============================================================================

/// Expands `TabletSourceGroup`s into per-tablet memory sources under a
/// union, pruned by tablet-key equality filters.
pub struct MemorySourceTabletRule;

impl MemorySourceTabletRule {
    /// Tablet values named by `equals(key_column, literal)`.
    fn equality_tablet_values(
        graph: &IrGraph,
        expr: NodeId,
        key: &str,
        out: &mut BTreeSet<String>,
    ) -> CompilerResult<bool> {
        let (name, args) = match &graph.expression(expr)?.kind {
            ExpressionKind::Func { name, args, .. } => (name.clone(), args.clone()),
            _ => return Ok(false),
        };
        match name.as_str() {
            "equals" if args.len() == 2 => {
                let mut key_seen = false;
                let mut value = None;
                for &arg in &args {
                    match &graph.expression(arg)?.kind {
                        ExpressionKind::Column { name, .. } if name == key => key_seen = true,
                        ExpressionKind::Uint128(v) => value = Some(v.to_string()),
                        ExpressionKind::Str(s) => value = Some(s.clone()),
                        _ => {}
                    }
                }
                if key_seen {
                    if let Some(v) = value {
                        out.insert(v);
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "logand" => {
                let mut any = false;
                for &arg in &args {
                    any = Self::equality_tablet_values(graph, arg, key, out)? || any;
                }
                Ok(any)
            }
            _ => Ok(false),
        }
    }

    fn make_tablet_source(
        &self,
        graph: &mut IrGraph,
        original: NodeId,
        tablet: &str,
    ) -> CompilerResult<NodeId> {
        let (kind, relation) = {
            let op = graph.operator(original)?;
            (op.kind.clone(), op.relation.clone())
        };
        let (table, select, time_start_ns, time_stop_ns, column_ids) = match kind {
            OperatorKind::MemorySource {
                table, select, time_start_ns, time_stop_ns, column_ids, ..
            } => (table, select, time_start_ns, time_stop_ns, column_ids),
            _ => unreachable!("tablet group wraps a memory source"),
        };

        let source = graph.create_operator(OperatorKind::MemorySource {
            table,
            tablet: tablet.to_string(),
            select,
            start_time: None,
            stop_time: None,
            time_start_ns,
            time_stop_ns,
            column_ids: vec![],
        });
        graph.operator_mut(source)?.relation = relation;

        // Fresh resolved column nodes owned by the new source.
        let mut new_cols = Vec::with_capacity(column_ids.len());
        for col in column_ids {
            let (name, index, dtype) = {
                let e = graph.expression(col)?;
                match &e.kind {
                    ExpressionKind::Column { name, index, .. } => (name.clone(), *index, e.dtype),
                    _ => continue,
                }
            };
            let fresh = graph.create_column(&name);
            if let ExpressionKind::Column { parent_op, index: idx, .. } =
                &mut graph.expression_mut(fresh)?.kind
            {
                *parent_op = Some(source);
                *idx = index;
            }
            graph.expression_mut(fresh)?.dtype = dtype;
            graph.connect_expression(source, fresh)?;
            new_cols.push(fresh);
        }
        if let OperatorKind::MemorySource { column_ids, .. } =
            &mut graph.operator_mut(source)?.kind
        {
            *column_ids = new_cols;
        }
        Ok(source)
    }
}

impl Rule for MemorySourceTabletRule {
    fn name(&self) -> &'static str {
        "MemorySourceTabletRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
        if graph.kind(node) != Ok(IrNodeKind::TabletSourceGroup) {
            return Ok(false);
        }
        let (original, tablets, key) = match &graph.operator(node)?.kind {
            OperatorKind::TabletSourceGroup { source, tablets, tabletization_key } => {
                (*source, tablets.clone(), tabletization_key.clone())
            }
            _ => return Ok(false),
        };
        let relation = graph.operator(node)?.relation.clone();

        // Tablet selection from a directly attached equality filter.
        let children: Vec<NodeId> = graph
            .dependencies_of(node)
            .into_iter()
            .filter(|&c| graph.is_operator(c))
            .collect();
        let mut selected = tablets.clone();
        let mut consumed_filter = None;
        if children.len() == 1 && graph.kind(children[0]) == Ok(IrNodeKind::Filter) {
            let filter = children[0];
            let predicate = match &graph.operator(filter)?.kind {
                OperatorKind::Filter { predicate } => *predicate,
                _ => unreachable!(),
            };
            let mut values = BTreeSet::new();
            if Self::equality_tablet_values(graph, predicate, &key, &mut values)? {
                let matching: Vec<String> = tablets
                    .iter()
                    .filter(|t| values.contains(*t))
                    .cloned()
                    .collect();
                if !matching.is_empty() {
                    selected = matching;
                    consumed_filter = Some(filter);
                }
            }
        }

        // Per-tablet sources, unioned when there is more than one.
        let sources: Vec<NodeId> = selected
            .iter()
            .map(|t| self.make_tablet_source(graph, original, t))
            .collect::<CompilerResult<_>>()?;
        let replacement = if sources.len() == 1 {
            sources[0]
        } else {
            let union = graph.create_operator(OperatorKind::Union {});
            graph.operator_mut(union)?.relation = relation;
            for &s in &sources {
                graph.add_parent(union, s)?;
            }
            union
        };

        // Rewire consumers: the filter (when subsumed by tablet selection)
        // disappears together with the group.
        match consumed_filter {
            Some(filter) => {
                for grandchild in graph.dependencies_of(filter) {
                    if graph.is_operator(grandchild) {
                        graph.replace_parent(grandchild, filter, replacement)?;
                    }
                }
                super::remove_operator(graph, filter)?;
            }
            None => {
                for child in children {
                    graph.replace_parent(child, node, replacement)?;
                }
            }
        }

        // Drop the group and the wrapped original source.
        super::remove_operator(graph, node)?;
        super::remove_operator(graph, original)?;
        debug!(tablets = selected.len(), "expanded tablet source group");
        Ok(true)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Relation};

    fn tabletized_info() -> CarnotInfo {
        let mut info = CarnotInfo::pem("pem1", 1);
        info.table_info.push(TableInfo {
            table: "t".to_string(),
            tabletization_key: Some("upid".to_string()),
            tablets: vec!["1".to_string(), "2".to_string()],
        });
        info
    }

    fn source_sink_graph() -> (IrGraph, NodeId, NodeId) {
        let mut g = IrGraph::new();
        let src = g.create_operator(OperatorKind::MemorySource {
            table: "t".to_string(),
            tablet: String::new(),
            select: None,
            start_time: None,
            stop_time: None,
            time_start_ns: None,
            time_stop_ns: None,
            column_ids: vec![],
        });
        g.operator_mut(src).unwrap().relation = Some(Relation::from_columns(vec![
            ("upid", DataType::Uint128),
            ("cpu", DataType::Int64),
        ]));
        let sink = g.create_operator(OperatorKind::MemorySink { name: "out".to_string() });
        g.add_parent(sink, src).unwrap();
        g.operator_mut(sink).unwrap().relation =
            g.operator(src).unwrap().relation.clone();
        (g, src, sink)
    }

    #[test]
    fn test_conversion_then_expansion() {
        let (mut g, _src, sink) = source_sink_graph();
        let info = tabletized_info();

        TabletSourceConversionRule { info: &info }.execute(&mut g).unwrap();
        assert_eq!(g.find_nodes_of_kind(IrNodeKind::TabletSourceGroup).len(), 1);

        MemorySourceTabletRule.execute(&mut g).unwrap();
        assert!(g.find_nodes_of_kind(IrNodeKind::TabletSourceGroup).is_empty());

        // One source per tablet, joined by a union feeding the sink.
        let sources = g.find_nodes_of_kind(IrNodeKind::MemorySource);
        assert_eq!(sources.len(), 2);
        let unions = g.find_nodes_of_kind(IrNodeKind::Union);
        assert_eq!(unions.len(), 1);
        assert_eq!(g.operator(sink).unwrap().parents, unions);

        let mut tablets: Vec<String> = sources
            .iter()
            .map(|&s| match &g.operator(s).unwrap().kind {
                OperatorKind::MemorySource { tablet, .. } => tablet.clone(),
                _ => unreachable!(),
            })
            .collect();
        tablets.sort();
        assert_eq!(tablets, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_filter_restricts_tablets() {
        let (mut g, src, sink) = source_sink_graph();
        // Insert filter upid == 2 between source and sink.
        let col = g.create_column("upid");
        let lit = g.create_uint128(2);
        let pred = g.create_func("equals", vec![col, lit]).unwrap();
        let filter = g.create_operator(OperatorKind::Filter { predicate: pred });
        g.add_parent(filter, src).unwrap();
        g.connect_expression(filter, pred).unwrap();
        g.replace_parent(sink, src, filter).unwrap();
        g.operator_mut(filter).unwrap().relation = g.operator(src).unwrap().relation.clone();

        let info = tabletized_info();
        TabletSourceConversionRule { info: &info }.execute(&mut g).unwrap();
        MemorySourceTabletRule.execute(&mut g).unwrap();

        // Only the matching tablet survives, and the filter is subsumed.
        let sources = g.find_nodes_of_kind(IrNodeKind::MemorySource);
        assert_eq!(sources.len(), 1);
        match &g.operator(sources[0]).unwrap().kind {
            OperatorKind::MemorySource { tablet, .. } => assert_eq!(tablet, "2"),
            _ => unreachable!(),
        }
        assert!(g.find_nodes_of_kind(IrNodeKind::Filter).is_empty());
        assert_eq!(g.operator(sink).unwrap().parents, sources);
    }

    #[test]
    fn test_non_tabletized_table_untouched() {
        let (mut g, src, _sink) = source_sink_graph();
        let info = CarnotInfo::pem("pem1", 1);
        let changed = TabletSourceConversionRule { info: &info }.execute(&mut g).unwrap();
        assert!(!changed);
        assert!(g.contains(src));
    }
}
