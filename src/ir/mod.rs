//! # IR Graph
//!
//! The typed dataflow intermediate representation. A single `IrGraph` owns
//! every node (arena ownership, `u32` ids); edges live in an auxiliary DAG.
//! Operators form the dataflow; expressions form subtrees rooted in the
//! operators that own them.
//!
//! ```text
//! MemorySource ──▶ Filter ──▶ MemorySink        (operator edges)
//!                    │
//!                    └──▶ Func(equals) ──▶ Column, Str   (expression edges)
//! ```
//!
//! Handles are ids, never pointers: rules re-acquire nodes by id after any
//! mutation pass, and `Column` back-references survive node replacement.

use crate::ast::SourceLocation;
use crate::types::{DataType, Relation};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;

pub type NodeId = u32;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("Duplicate edge {0} -> {1}")]
    DuplicateEdge(NodeId, NodeId),

    #[error("Edge {0} -> {1} would introduce a cycle")]
    CycleIntroduced(NodeId, NodeId),

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Node {0} is still referenced by edges")]
    NodeStillReferenced(NodeId),

    #[error("Node {0} is not an operator")]
    NotAnOperator(NodeId),

    #[error("Node {0} is not an expression")]
    NotAnExpression(NodeId),
}

// ============================================================================
// Node kinds
// ============================================================================

/// Flat discriminant over every node kind, used by the pattern matcher and
/// `find_nodes_of_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrNodeKind {
    // Operators
    MemorySource,
    MemorySink,
    Map,
    Filter,
    BlockingAgg,
    GroupBy,
    Join,
    Union,
    Limit,
    Rolling,
    GrpcSource,
    GrpcSink,
    GrpcSourceGroup,
    UdtfSource,
    TabletSourceGroup,
    MetadataResolver,
    // Expressions
    Int,
    Float,
    Bool,
    Str,
    Time,
    Uint128,
    Column,
    Func,
    Metadata,
    MetadataLiteral,
    Lambda,
}

impl IrNodeKind {
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            IrNodeKind::MemorySource
                | IrNodeKind::MemorySink
                | IrNodeKind::Map
                | IrNodeKind::Filter
                | IrNodeKind::BlockingAgg
                | IrNodeKind::GroupBy
                | IrNodeKind::Join
                | IrNodeKind::Union
                | IrNodeKind::Limit
                | IrNodeKind::Rolling
                | IrNodeKind::GrpcSource
                | IrNodeKind::GrpcSink
                | IrNodeKind::GrpcSourceGroup
                | IrNodeKind::UdtfSource
                | IrNodeKind::TabletSourceGroup
                | IrNodeKind::MetadataResolver
        )
    }

    /// Blocking operators accumulate fully before emitting.
    pub fn is_blocking(&self) -> bool {
        matches!(self, IrNodeKind::BlockingAgg)
    }

    /// Source operators have zero parents.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            IrNodeKind::MemorySource
                | IrNodeKind::GrpcSource
                | IrNodeKind::GrpcSourceGroup
                | IrNodeKind::UdtfSource
                | IrNodeKind::TabletSourceGroup
        )
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, IrNodeKind::MemorySink | IrNodeKind::GrpcSink)
    }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

/// A named column expression, e.g. one Map projection or one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExpr {
    pub name: String,
    pub expr: NodeId,
}

/// A resolved join output column: which side, which index there, final name.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutputColumn {
    pub side: usize,
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorKind {
    MemorySource {
        table: String,
        /// Tablet to read; empty string selects the default tablet.
        tablet: String,
        /// Column subset; `None` selects the table's full relation.
        select: Option<Vec<String>>,
        /// Unfolded time-window argument expressions.
        start_time: Option<NodeId>,
        stop_time: Option<NodeId>,
        /// Folded window bounds (set by the range rule).
        time_start_ns: Option<i64>,
        time_stop_ns: Option<i64>,
        /// Column nodes materialized by the source-relation rule.
        column_ids: Vec<NodeId>,
    },
    MemorySink {
        name: String,
    },
    Map {
        col_exprs: Vec<ColumnExpr>,
        /// Copy parent columns not overridden by an explicit expression.
        keep_input_columns: bool,
        /// Parent columns to leave out when copying (the `drop` surface).
        exclude_columns: Vec<String>,
    },
    Filter {
        predicate: NodeId,
    },
    BlockingAgg {
        groups: Vec<NodeId>,
        agg_exprs: Vec<ColumnExpr>,
        /// Emit serialized partials instead of finalized values.
        partial_agg: bool,
        /// Inputs are serialized partials to merge before finalizing.
        finalize_results: bool,
    },
    /// Intermediate node produced by `groupby`; merged into the following
    /// `agg` call and deleted by the compiler.
    GroupBy {
        groups: Vec<NodeId>,
    },
    Join {
        join_type: JoinType,
        left_on: Vec<String>,
        right_on: Vec<String>,
        suffixes: (String, String),
        /// Resolved by the analyzer: per-side key column indices.
        equality_conditions: Vec<(usize, usize)>,
        /// Resolved by the analyzer: the output column set.
        output_columns: Vec<JoinOutputColumn>,
    },
    Union {},
    Limit {
        limit: i64,
    },
    Rolling {
        window_col: String,
        window_ns: i64,
    },
    GrpcSource {
        source_id: i64,
    },
    GrpcSink {
        destination_id: i64,
        destination_address: String,
    },
    /// Placeholder created by the distributed splitter; expanded into
    /// concrete `GrpcSource`s once sinks are stitched to it.
    GrpcSourceGroup {
        source_id: i64,
        grpc_address: String,
        /// `(instance id, sink node id)` pairs connected by the stitcher.
        connected_sinks: Vec<(i64, NodeId)>,
    },
    UdtfSource {
        name: String,
        arg_values: Vec<(String, NodeId)>,
    },
    TabletSourceGroup {
        source: NodeId,
        tablets: Vec<String>,
        tabletization_key: String,
    },
    MetadataResolver {
        properties: Vec<String>,
    },
}

impl OperatorKind {
    pub fn kind(&self) -> IrNodeKind {
        match self {
            OperatorKind::MemorySource { .. } => IrNodeKind::MemorySource,
            OperatorKind::MemorySink { .. } => IrNodeKind::MemorySink,
            OperatorKind::Map { .. } => IrNodeKind::Map,
            OperatorKind::Filter { .. } => IrNodeKind::Filter,
            OperatorKind::BlockingAgg { .. } => IrNodeKind::BlockingAgg,
            OperatorKind::GroupBy { .. } => IrNodeKind::GroupBy,
            OperatorKind::Join { .. } => IrNodeKind::Join,
            OperatorKind::Union {} => IrNodeKind::Union,
            OperatorKind::Limit { .. } => IrNodeKind::Limit,
            OperatorKind::Rolling { .. } => IrNodeKind::Rolling,
            OperatorKind::GrpcSource { .. } => IrNodeKind::GrpcSource,
            OperatorKind::GrpcSink { .. } => IrNodeKind::GrpcSink,
            OperatorKind::GrpcSourceGroup { .. } => IrNodeKind::GrpcSourceGroup,
            OperatorKind::UdtfSource { .. } => IrNodeKind::UdtfSource,
            OperatorKind::TabletSourceGroup { .. } => IrNodeKind::TabletSourceGroup,
            OperatorKind::MetadataResolver { .. } => IrNodeKind::MetadataResolver,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub kind: OperatorKind,
    /// Parent operators, in argument order (order matters for Join/Union).
    pub parents: Vec<NodeId>,
    /// Set exactly once, by the analyzer.
    pub relation: Option<Relation>,
}

impl Operator {
    pub fn is_relation_init(&self) -> bool {
        self.relation.is_some()
    }

    pub fn relation(&self) -> &Relation {
        self.relation.as_ref().expect("relation not initialized")
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Time(i64),
    Uint128(u128),
    Column {
        name: String,
        /// The operator whose relation defines this column, once resolved.
        parent_op: Option<NodeId>,
        index: Option<usize>,
    },
    Func {
        name: String,
        args: Vec<NodeId>,
        /// UDF (or UDA, in aggregate context) id, assigned during analysis.
        udf_id: Option<i64>,
        arg_types: Vec<DataType>,
    },
    Metadata {
        property: String,
        /// The user-visible column name this metadata was bound to, when it
        /// is referenced through an assignment alias.
        alias: Option<String>,
        parent_op: Option<NodeId>,
        index: Option<usize>,
    },
    MetadataLiteral {
        literal: NodeId,
    },
    /// A transient bundle of named column expressions, produced while
    /// rewriting a `MetadataResolver` into a `Map` and consumed immediately.
    Lambda {
        col_exprs: Vec<ColumnExpr>,
    },
}

impl ExpressionKind {
    pub fn kind(&self) -> IrNodeKind {
        match self {
            ExpressionKind::Int(_) => IrNodeKind::Int,
            ExpressionKind::Float(_) => IrNodeKind::Float,
            ExpressionKind::Bool(_) => IrNodeKind::Bool,
            ExpressionKind::Str(_) => IrNodeKind::Str,
            ExpressionKind::Time(_) => IrNodeKind::Time,
            ExpressionKind::Uint128(_) => IrNodeKind::Uint128,
            ExpressionKind::Column { .. } => IrNodeKind::Column,
            ExpressionKind::Func { .. } => IrNodeKind::Func,
            ExpressionKind::Metadata { .. } => IrNodeKind::Metadata,
            ExpressionKind::MetadataLiteral { .. } => IrNodeKind::MetadataLiteral,
            ExpressionKind::Lambda { .. } => IrNodeKind::Lambda,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExpressionKind,
    /// `Unknown` until the analyzer resolves it.
    pub dtype: DataType,
}

impl Expression {
    pub fn is_resolved(&self) -> bool {
        self.dtype.is_resolved()
    }
}

// ============================================================================
// Nodes and the graph
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Op(Operator),
    Expr(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrNode {
    pub id: NodeId,
    pub data: NodeData,
    /// Query source position, for error reporting.
    pub loc: SourceLocation,
}

impl IrNode {
    pub fn kind(&self) -> IrNodeKind {
        match &self.data {
            NodeData::Op(op) => op.kind.kind(),
            NodeData::Expr(e) => e.kind.kind(),
        }
    }
}

/// The IR graph: an arena of nodes plus the edge DAG.
#[derive(Debug, Clone, Default)]
pub struct IrGraph {
    nodes: BTreeMap<NodeId, IrNode>,
    edges: BTreeMap<NodeId, Vec<NodeId>>,
    reverse_edges: BTreeMap<NodeId, Vec<NodeId>>,
    next_id: NodeId,
}

impl IrGraph {
    pub fn new() -> Self {
        IrGraph::default()
    }

    // ------------------------------------------------------------------
    // Node factories
    // ------------------------------------------------------------------

    fn alloc(&mut self, data: NodeData) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes
            .insert(id, IrNode { id, data, loc: SourceLocation::default() });
        self.edges.insert(id, Vec::new());
        self.reverse_edges.insert(id, Vec::new());
        id
    }

    /// Record the source position a node was compiled from.
    pub fn set_loc(&mut self, id: NodeId, loc: SourceLocation) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.loc = loc;
        }
    }

    pub fn loc(&self, id: NodeId) -> SourceLocation {
        self.nodes.get(&id).map(|n| n.loc).unwrap_or_default()
    }

    pub fn create_operator(&mut self, kind: OperatorKind) -> NodeId {
        self.alloc(NodeData::Op(Operator { kind, parents: Vec::new(), relation: None }))
    }

    pub fn create_expression(&mut self, kind: ExpressionKind, dtype: DataType) -> NodeId {
        self.alloc(NodeData::Expr(Expression { kind, dtype }))
    }

    pub fn create_int(&mut self, v: i64) -> NodeId {
        self.create_expression(ExpressionKind::Int(v), DataType::Int64)
    }

    pub fn create_float(&mut self, v: f64) -> NodeId {
        self.create_expression(ExpressionKind::Float(v), DataType::Float64)
    }

    pub fn create_bool(&mut self, v: bool) -> NodeId {
        self.create_expression(ExpressionKind::Bool(v), DataType::Boolean)
    }

    pub fn create_string(&mut self, v: &str) -> NodeId {
        self.create_expression(ExpressionKind::Str(v.to_string()), DataType::String)
    }

    pub fn create_time(&mut self, ns: i64) -> NodeId {
        self.create_expression(ExpressionKind::Time(ns), DataType::Time64Ns)
    }

    pub fn create_uint128(&mut self, v: u128) -> NodeId {
        self.create_expression(ExpressionKind::Uint128(v), DataType::Uint128)
    }

    pub fn create_column(&mut self, name: &str) -> NodeId {
        self.create_expression(
            ExpressionKind::Column { name: name.to_string(), parent_op: None, index: None },
            DataType::Unknown,
        )
    }

    /// Create a `Func` node and the ownership edges to its arguments.
    pub fn create_func(&mut self, name: &str, args: Vec<NodeId>) -> Result<NodeId, IrError> {
        let id = self.create_expression(
            ExpressionKind::Func {
                name: name.to_string(),
                args: args.clone(),
                udf_id: None,
                arg_types: Vec::new(),
            },
            DataType::Unknown,
        );
        for arg in args {
            self.add_edge(id, arg)?;
        }
        Ok(id)
    }

    pub fn create_metadata(&mut self, property: &str, alias: Option<&str>) -> NodeId {
        self.create_expression(
            ExpressionKind::Metadata {
                property: property.to_string(),
                alias: alias.map(|s| s.to_string()),
                parent_op: None,
                index: None,
            },
            DataType::Unknown,
        )
    }

    pub fn create_metadata_literal(&mut self, literal: NodeId, dtype: DataType) -> Result<NodeId, IrError> {
        let id = self.create_expression(ExpressionKind::MetadataLiteral { literal }, dtype);
        self.add_edge(id, literal)?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&IrNode, IrError> {
        self.nodes.get(&id).ok_or(IrError::UnknownNode(id))
    }

    pub fn kind(&self, id: NodeId) -> Result<IrNodeKind, IrError> {
        self.node(id).map(|n| n.kind())
    }

    pub fn is_operator(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(&id), Some(IrNode { data: NodeData::Op(_), .. }))
    }

    pub fn operator(&self, id: NodeId) -> Result<&Operator, IrError> {
        match &self.node(id)?.data {
            NodeData::Op(op) => Ok(op),
            NodeData::Expr(_) => Err(IrError::NotAnOperator(id)),
        }
    }

    pub fn operator_mut(&mut self, id: NodeId) -> Result<&mut Operator, IrError> {
        match self.nodes.get_mut(&id) {
            Some(IrNode { data: NodeData::Op(op), .. }) => Ok(op),
            Some(_) => Err(IrError::NotAnOperator(id)),
            None => Err(IrError::UnknownNode(id)),
        }
    }

    pub fn expression(&self, id: NodeId) -> Result<&Expression, IrError> {
        match &self.node(id)?.data {
            NodeData::Expr(e) => Ok(e),
            NodeData::Op(_) => Err(IrError::NotAnExpression(id)),
        }
    }

    pub fn expression_mut(&mut self, id: NodeId) -> Result<&mut Expression, IrError> {
        match self.nodes.get_mut(&id) {
            Some(IrNode { data: NodeData::Expr(e), .. }) => Ok(e),
            Some(_) => Err(IrError::NotAnExpression(id)),
            None => Err(IrError::UnknownNode(id)),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn operators(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| matches!(n.data, NodeData::Op(_)))
            .map(|n| n.id)
            .collect()
    }

    pub fn find_nodes_of_kind(&self, kind: IrNodeKind) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.kind() == kind)
            .map(|n| n.id)
            .collect()
    }

    /// Outgoing edges: consumers of an operator, owned expressions, func args.
    pub fn dependencies_of(&self, id: NodeId) -> Vec<NodeId> {
        self.edges.get(&id).cloned().unwrap_or_default()
    }

    /// Incoming edges.
    pub fn parents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.reverse_edges.get(&id).cloned().unwrap_or_default()
    }

    /// Walk incoming edges until an operator node is found: the operator in
    /// which this expression is rooted.
    pub fn containing_op(&self, expr_id: NodeId) -> Option<NodeId> {
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        queue.push_back(expr_id);
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for parent in self.parents_of(id) {
                if self.is_operator(parent) {
                    return Some(parent);
                }
                queue.push_back(parent);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.get(&from).map(|v| v.contains(&to)).unwrap_or(false)
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), IrError> {
        if !self.contains(from) {
            return Err(IrError::UnknownNode(from));
        }
        if !self.contains(to) {
            return Err(IrError::UnknownNode(to));
        }
        if self.has_edge(from, to) {
            return Err(IrError::DuplicateEdge(from, to));
        }
        if from == to || self.reachable(to, from) {
            return Err(IrError::CycleIntroduced(from, to));
        }
        self.edges.get_mut(&from).unwrap().push(to);
        self.reverse_edges.get_mut(&to).unwrap().push(from);
        Ok(())
    }

    fn reachable(&self, from: NodeId, target: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(children) = self.edges.get(&id) {
                stack.extend(children.iter().copied());
            }
        }
        false
    }

    pub fn delete_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), IrError> {
        if !self.has_edge(from, to) {
            return Err(IrError::UnknownNode(to));
        }
        self.edges.get_mut(&from).unwrap().retain(|&c| c != to);
        self.reverse_edges.get_mut(&to).unwrap().retain(|&p| p != from);
        Ok(())
    }

    /// Delete a node. Fails while any edge still references it.
    pub fn delete_node(&mut self, id: NodeId) -> Result<(), IrError> {
        if !self.contains(id) {
            return Err(IrError::UnknownNode(id));
        }
        let out = self.edges.get(&id).map(|v| v.len()).unwrap_or(0);
        let inc = self.reverse_edges.get(&id).map(|v| v.len()).unwrap_or(0);
        if out + inc > 0 {
            return Err(IrError::NodeStillReferenced(id));
        }
        self.nodes.remove(&id);
        self.edges.remove(&id);
        self.reverse_edges.remove(&id);
        Ok(())
    }

    /// Delete an expression subtree rooted at `root`, removing edges first.
    /// Shared sub-expressions (referenced from outside the subtree) survive.
    pub fn delete_expression_subtree(&mut self, root: NodeId) -> Result<(), IrError> {
        let children = self.dependencies_of(root);
        for child in children {
            self.delete_edge(root, child)?;
            if self.parents_of(child).is_empty() && !self.is_operator(child) {
                self.delete_expression_subtree(child)?;
            }
        }
        if self.parents_of(root).is_empty() && !self.is_operator(root) {
            self.delete_node(root)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator parent management
    // ------------------------------------------------------------------

    pub fn add_parent(&mut self, op: NodeId, parent: NodeId) -> Result<(), IrError> {
        self.add_edge(parent, op)?;
        self.operator_mut(op)?.parents.push(parent);
        Ok(())
    }

    pub fn remove_parent(&mut self, op: NodeId, parent: NodeId) -> Result<(), IrError> {
        self.delete_edge(parent, op)?;
        self.operator_mut(op)?.parents.retain(|&p| p != parent);
        Ok(())
    }

    /// Rewire `op` from `old_parent` to `new_parent`, keeping position.
    pub fn replace_parent(
        &mut self,
        op: NodeId,
        old_parent: NodeId,
        new_parent: NodeId,
    ) -> Result<(), IrError> {
        self.delete_edge(old_parent, op)?;
        self.add_edge(new_parent, op)?;
        let operator = self.operator_mut(op)?;
        for p in operator.parents.iter_mut() {
            if *p == old_parent {
                *p = new_parent;
            }
        }
        Ok(())
    }

    /// Attach an expression root to its owning operator.
    pub fn connect_expression(&mut self, op: NodeId, expr_root: NodeId) -> Result<(), IrError> {
        if self.has_edge(op, expr_root) {
            return Ok(());
        }
        self.add_edge(op, expr_root)
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Kahn's algorithm over the whole DAG; ties broken by node id, which is
    /// insertion order.
    pub fn topological_sort(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeId, usize> = self
            .nodes
            .keys()
            .map(|&id| (id, self.reverse_edges.get(&id).map(|v| v.len()).unwrap_or(0)))
            .collect();

        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(&id);
            order.push(id);
            for &child in self.edges.get(&id).into_iter().flatten() {
                let d = in_degree.get_mut(&child).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.insert(child);
                }
            }
        }
        debug_assert_eq!(order.len(), self.nodes.len(), "edge DAG contains a cycle");
        order
    }

    /// Operator ids reachable downstream of `id` (inclusive), dataflow only.
    pub fn downstream_ops(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        let mut seen = BTreeSet::new();
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            if self.is_operator(cur) {
                out.push(cur);
                for child in self.dependencies_of(cur) {
                    if self.is_operator(child) {
                        stack.push(child);
                    }
                }
            }
        }
        out
    }

    /// Debug rendering of the operator dataflow.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for id in self.topological_sort() {
            if let Ok(op) = self.operator(id) {
                let rel = op
                    .relation
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "<uninit>".to_string());
                out.push_str(&format!(
                    "{}: {:?} parents={:?} relation={}\n",
                    id,
                    op.kind.kind(),
                    op.parents,
                    rel
                ));
            }
        }
        out
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn source(g: &mut IrGraph, table: &str) -> NodeId {
        g.create_operator(OperatorKind::MemorySource {
            table: table.to_string(),
            tablet: String::new(),
            select: None,
            start_time: None,
            stop_time: None,
            time_start_ns: None,
            time_stop_ns: None,
            column_ids: vec![],
        })
    }

    fn sink(g: &mut IrGraph, name: &str) -> NodeId {
        g.create_operator(OperatorKind::MemorySink { name: name.to_string() })
    }

    #[test]
    fn test_create_and_edge() {
        let mut g = IrGraph::new();
        let src = source(&mut g, "t");
        let snk = sink(&mut g, "out");
        g.add_parent(snk, src).unwrap();

        assert_eq!(g.dependencies_of(src), vec![snk]);
        assert_eq!(g.parents_of(snk), vec![src]);
        assert_eq!(g.operator(snk).unwrap().parents, vec![src]);
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let mut g = IrGraph::new();
        let a = source(&mut g, "t");
        let b = sink(&mut g, "out");
        g.add_edge(a, b).unwrap();
        assert_eq!(g.add_edge(a, b), Err(IrError::DuplicateEdge(a, b)));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = IrGraph::new();
        let a = source(&mut g, "t");
        let b = g.create_operator(OperatorKind::Limit { limit: 5 });
        let c = sink(&mut g, "out");
        g.add_edge(a, b).unwrap();
        g.add_edge(b, c).unwrap();
        assert_eq!(g.add_edge(c, a), Err(IrError::CycleIntroduced(c, a)));
        assert_eq!(g.add_edge(a, a), Err(IrError::CycleIntroduced(a, a)));
    }

    #[test]
    fn test_delete_node_requires_no_edges() {
        let mut g = IrGraph::new();
        let a = source(&mut g, "t");
        let b = sink(&mut g, "out");
        g.add_edge(a, b).unwrap();
        assert_eq!(g.delete_node(a), Err(IrError::NodeStillReferenced(a)));
        g.delete_edge(a, b).unwrap();
        g.delete_node(a).unwrap();
        assert!(!g.contains(a));
    }

    #[test]
    fn test_topological_sort_stable() {
        let mut g = IrGraph::new();
        let s1 = source(&mut g, "a");
        let s2 = source(&mut g, "b");
        let u = g.create_operator(OperatorKind::Union {});
        let k = sink(&mut g, "out");
        g.add_parent(u, s1).unwrap();
        g.add_parent(u, s2).unwrap();
        g.add_parent(k, u).unwrap();

        let order = g.topological_sort();
        // Sources come first, by id; union before sink.
        assert_eq!(order, vec![s1, s2, u, k]);
    }

    #[test]
    fn test_func_owns_args() {
        let mut g = IrGraph::new();
        let col = g.create_column("cpu");
        let ten = g.create_int(10);
        let f = g.create_func("equals", vec![col, ten]).unwrap();

        assert_eq!(g.dependencies_of(f), vec![col, ten]);
        assert_eq!(g.kind(f).unwrap(), IrNodeKind::Func);
        assert_eq!(g.expression(ten).unwrap().dtype, DataType::Int64);
    }

    #[test]
    fn test_containing_op() {
        let mut g = IrGraph::new();
        let src = source(&mut g, "t");
        let col = g.create_column("cpu");
        let ten = g.create_int(10);
        let pred = g.create_func("equals", vec![col, ten]).unwrap();
        let filter = g.create_operator(OperatorKind::Filter { predicate: pred });
        g.add_parent(filter, src).unwrap();
        g.connect_expression(filter, pred).unwrap();

        assert_eq!(g.containing_op(pred), Some(filter));
        assert_eq!(g.containing_op(col), Some(filter));
        assert_eq!(g.containing_op(ten), Some(filter));
    }

    #[test]
    fn test_delete_expression_subtree() {
        let mut g = IrGraph::new();
        let col = g.create_column("cpu");
        let ten = g.create_int(10);
        let f = g.create_func("equals", vec![col, ten]).unwrap();

        g.delete_expression_subtree(f).unwrap();
        assert!(!g.contains(f));
        assert!(!g.contains(col));
        assert!(!g.contains(ten));
    }

    #[test]
    fn test_replace_parent() {
        let mut g = IrGraph::new();
        let src = source(&mut g, "t");
        let resolver =
            g.create_operator(OperatorKind::MetadataResolver { properties: vec![] });
        let snk = sink(&mut g, "out");
        g.add_parent(snk, src).unwrap();
        g.add_parent(resolver, src).unwrap();
        g.replace_parent(snk, src, resolver).unwrap();

        assert_eq!(g.operator(snk).unwrap().parents, vec![resolver]);
        assert!(g.has_edge(resolver, snk));
        assert!(!g.has_edge(src, snk));
    }

    #[test]
    fn test_find_nodes_of_kind() {
        let mut g = IrGraph::new();
        let s1 = source(&mut g, "a");
        let s2 = source(&mut g, "b");
        let _k = sink(&mut g, "out");
        assert_eq!(g.find_nodes_of_kind(IrNodeKind::MemorySource), vec![s1, s2]);
        assert_eq!(g.find_nodes_of_kind(IrNodeKind::Filter), Vec::<NodeId>::new());
    }
}
