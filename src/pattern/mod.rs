//! # Pattern Matching
//!
//! Compositional predicates over IR nodes for rule authoring, modeled on
//! LLVM-style matcher combinators. A `Matcher` is a first-class predicate
//! `(graph, node) -> bool`; combinators compose lexically and evaluate
//! short-circuit, left-to-right. Commutative matchers try the written order
//! first, then the swap.
//!
//! ```ignore
//! if matches(graph, node, &equals(metadata(), string())) {
//!     // rewrite `md == "literal"` comparisons
//! }
//! ```

use crate::ir::{ExpressionKind, IrGraph, IrNodeKind, NodeId, OperatorKind};
use std::rc::Rc;

/// Function names the range-argument folder evaluates at compile time.
pub const COMPILE_TIME_FUNCS: &[&str] = &[
    "add",
    "subtract",
    "multiply",
    "now",
    "seconds",
    "minutes",
    "hours",
    "days",
    "milliseconds",
    "microseconds",
];

/// A first-class node predicate.
#[derive(Clone)]
pub struct Matcher(Rc<dyn Fn(&IrGraph, NodeId) -> bool>);

impl Matcher {
    fn new(f: impl Fn(&IrGraph, NodeId) -> bool + 'static) -> Self {
        Matcher(Rc::new(f))
    }

    pub fn matches(&self, graph: &IrGraph, node: NodeId) -> bool {
        (self.0)(graph, node)
    }
}

/// Alias mirroring the original `Match(node, pattern)` call shape.
pub fn matches(graph: &IrGraph, node: NodeId, pattern: &Matcher) -> bool {
    pattern.matches(graph, node)
}

// ============================================================================
// Atoms
// ============================================================================

/// Matches any node.
pub fn any() -> Matcher {
    Matcher::new(|_, _| true)
}

/// Matches nodes of the exact kind.
pub fn kind(k: IrNodeKind) -> Matcher {
    Matcher::new(move |g, id| g.kind(id) == Ok(k))
}

/// Matches an `Int` node with the given value.
pub fn int_eq(v: i64) -> Matcher {
    Matcher::new(move |g, id| {
        matches!(
            g.expression(id).map(|e| &e.kind),
            Ok(ExpressionKind::Int(x)) if *x == v
        )
    })
}

/// Matches a `Column` with the given name.
pub fn column_named(name: &str) -> Matcher {
    let name = name.to_string();
    Matcher::new(move |g, id| {
        matches!(
            g.expression(id).map(|e| &e.kind),
            Ok(ExpressionKind::Column { name: n, .. }) if *n == name
        )
    })
}

/// Matches a `Func` with the given registered name.
pub fn func_named(name: &str) -> Matcher {
    let name = name.to_string();
    Matcher::new(move |g, id| {
        matches!(
            g.expression(id).map(|e| &e.kind),
            Ok(ExpressionKind::Func { name: n, .. }) if *n == name
        )
    })
}

/// Matches any blocking operator.
pub fn blocking_op() -> Matcher {
    Matcher::new(|g, id| g.kind(id).map(|k| k.is_blocking()).unwrap_or(false))
}

/// Matches any source operator.
pub fn source_op() -> Matcher {
    Matcher::new(|g, id| g.kind(id).map(|k| k.is_source()).unwrap_or(false))
}

/// Matches any sink operator.
pub fn sink_op() -> Matcher {
    Matcher::new(|g, id| g.kind(id).map(|k| k.is_sink()).unwrap_or(false))
}

/// Matches an expression whose data type has been resolved.
pub fn resolved_expr() -> Matcher {
    Matcher::new(|g, id| g.expression(id).map(|e| e.is_resolved()).unwrap_or(false))
}

/// Matches an expression whose data type is still unknown.
pub fn unresolved_expr() -> Matcher {
    Matcher::new(|g, id| g.expression(id).map(|e| !e.is_resolved()).unwrap_or(false))
}

/// Matches a source operator whose relation is not yet initialized.
pub fn unresolved_source() -> Matcher {
    Matcher::new(|g, id| match g.operator(id) {
        Ok(op) => op.kind.kind().is_source() && !op.is_relation_init(),
        Err(_) => false,
    })
}

/// Matches an operator whose relation is uninitialized but whose parents all
/// have initialized relations (it is ready for relation propagation).
pub fn unresolved_ready_op() -> Matcher {
    Matcher::new(|g, id| match g.operator(id) {
        Ok(op) => {
            !op.is_relation_init()
                && !op.parents.is_empty()
                && op
                    .parents
                    .iter()
                    .all(|&p| g.operator(p).map(|o| o.is_relation_init()).unwrap_or(false))
        }
        Err(_) => false,
    })
}

/// Matches a `Func` evaluable at compile time (range-argument folding).
pub fn compile_time_func() -> Matcher {
    Matcher::new(|g, id| {
        matches!(
            g.expression(id).map(|e| &e.kind),
            Ok(ExpressionKind::Func { name, .. }) if COMPILE_TIME_FUNCS.contains(&name.as_str())
        )
    })
}

/// Matches a `GRPCSink` with the given destination id.
pub fn grpc_sink_with_destination(destination_id: i64) -> Matcher {
    Matcher::new(move |g, id| {
        matches!(
            g.operator(id).map(|o| &o.kind),
            Ok(OperatorKind::GrpcSink { destination_id: d, .. }) if *d == destination_id
        )
    })
}

// ============================================================================
// Combinators
// ============================================================================

/// Both match, left first.
pub fn and(l: Matcher, r: Matcher) -> Matcher {
    Matcher::new(move |g, id| l.matches(g, id) && r.matches(g, id))
}

/// Either matches, left first.
pub fn or(l: Matcher, r: Matcher) -> Matcher {
    Matcher::new(move |g, id| l.matches(g, id) || r.matches(g, id))
}

/// Matches a `Func` with at least one argument matching `inner`.
pub fn func_any_arg(inner: Matcher) -> Matcher {
    Matcher::new(move |g, id| match g.expression(id).map(|e| &e.kind) {
        Ok(ExpressionKind::Func { args, .. }) => {
            args.iter().any(|&a| inner.matches(g, a))
        }
        _ => false,
    })
}

/// Matches a `Func` whose arguments all match `inner`.
pub fn func_all_args(inner: Matcher) -> Matcher {
    Matcher::new(move |g, id| match g.expression(id).map(|e| &e.kind) {
        Ok(ExpressionKind::Func { args, .. }) => {
            args.iter().all(|&a| inner.matches(g, a))
        }
        _ => false,
    })
}

/// Matches a binary `Func` by name, arguments in the written order.
pub fn binop(name: &str, l: Matcher, r: Matcher) -> Matcher {
    let name = name.to_string();
    Matcher::new(move |g, id| match g.expression(id).map(|e| &e.kind) {
        Ok(ExpressionKind::Func { name: n, args, .. }) if *n == name && args.len() == 2 => {
            l.matches(g, args[0]) && r.matches(g, args[1])
        }
        _ => false,
    })
}

/// Matches `equals(l, r)` commutatively: left order first, then the swap.
pub fn equals(l: Matcher, r: Matcher) -> Matcher {
    Matcher::new(move |g, id| match g.expression(id).map(|e| &e.kind) {
        Ok(ExpressionKind::Func { name, args, .. }) if name == "equals" && args.len() == 2 => {
            (l.matches(g, args[0]) && r.matches(g, args[1]))
                || (l.matches(g, args[1]) && r.matches(g, args[0]))
        }
        _ => false,
    })
}

/// Matches an operator matching `op_matcher` with any parent operator
/// matching `parent_matcher`.
pub fn op_with_parent(op_matcher: Matcher, parent_matcher: Matcher) -> Matcher {
    Matcher::new(move |g, id| {
        if !op_matcher.matches(g, id) {
            return false;
        }
        match g.operator(id) {
            Ok(op) => op.parents.iter().any(|&p| parent_matcher.matches(g, p)),
            Err(_) => false,
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OperatorKind;

    fn mem_source(g: &mut IrGraph) -> NodeId {
        g.create_operator(OperatorKind::MemorySource {
            table: "t".to_string(),
            tablet: String::new(),
            select: None,
            start_time: None,
            stop_time: None,
            time_start_ns: None,
            time_stop_ns: None,
            column_ids: vec![],
        })
    }

    #[test]
    fn test_kind_and_any() {
        let mut g = IrGraph::new();
        let src = mem_source(&mut g);
        assert!(matches(&g, src, &any()));
        assert!(matches(&g, src, &kind(IrNodeKind::MemorySource)));
        assert!(!matches(&g, src, &kind(IrNodeKind::Filter)));
    }

    #[test]
    fn test_int_eq() {
        let mut g = IrGraph::new();
        let ten = g.create_int(10);
        assert!(matches(&g, ten, &int_eq(10)));
        assert!(!matches(&g, ten, &int_eq(11)));
    }

    #[test]
    fn test_equals_commutes() {
        let mut g = IrGraph::new();
        let col = g.create_column("svc");
        let lit = g.create_string("checkout");
        let f = g.create_func("equals", vec![lit, col]).unwrap();

        // Written order is (Str, Column); the matcher commutes.
        assert!(matches(&g, f, &equals(column_named("svc"), kind(IrNodeKind::Str))));
        assert!(matches(&g, f, &equals(kind(IrNodeKind::Str), column_named("svc"))));
        assert!(!matches(&g, f, &equals(int_eq(1), kind(IrNodeKind::Str))));
    }

    #[test]
    fn test_binop_does_not_commute() {
        let mut g = IrGraph::new();
        let a = g.create_int(1);
        let b = g.create_string("x");
        let f = g.create_func("subtract", vec![a, b]).unwrap();

        assert!(matches(&g, f, &binop("subtract", kind(IrNodeKind::Int), kind(IrNodeKind::Str))));
        assert!(!matches(&g, f, &binop("subtract", kind(IrNodeKind::Str), kind(IrNodeKind::Int))));
    }

    #[test]
    fn test_func_any_arg() {
        let mut g = IrGraph::new();
        let md = g.create_metadata("service", None);
        let lit = g.create_string("checkout");
        let f = g.create_func("equals", vec![md, lit]).unwrap();
        assert!(matches(&g, f, &func_any_arg(kind(IrNodeKind::Metadata))));
        assert!(!matches(&g, f, &func_any_arg(kind(IrNodeKind::Int))));
    }

    #[test]
    fn test_unresolved_source() {
        let mut g = IrGraph::new();
        let src = mem_source(&mut g);
        assert!(matches(&g, src, &unresolved_source()));
        g.operator_mut(src).unwrap().relation = Some(crate::types::Relation::new());
        assert!(!matches(&g, src, &unresolved_source()));
    }

    #[test]
    fn test_unresolved_ready_op() {
        let mut g = IrGraph::new();
        let src = mem_source(&mut g);
        let limit = g.create_operator(OperatorKind::Limit { limit: 1 });
        g.add_parent(limit, src).unwrap();

        // Parent relation not yet set: not ready.
        assert!(!matches(&g, limit, &unresolved_ready_op()));
        g.operator_mut(src).unwrap().relation = Some(crate::types::Relation::new());
        assert!(matches(&g, limit, &unresolved_ready_op()));
    }

    #[test]
    fn test_op_with_parent() {
        let mut g = IrGraph::new();
        let src = mem_source(&mut g);
        let limit = g.create_operator(OperatorKind::Limit { limit: 1 });
        g.add_parent(limit, src).unwrap();

        let m = op_with_parent(kind(IrNodeKind::Limit), kind(IrNodeKind::MemorySource));
        assert!(matches(&g, limit, &m));
        assert!(!matches(&g, src, &m));
    }

    #[test]
    fn test_compile_time_func() {
        let mut g = IrGraph::new();
        let f = g.create_func("seconds", vec![]).unwrap();
        assert!(matches(&g, f, &compile_time_func()));
        let f2 = g.create_func("upid_to_service_name", vec![]).unwrap();
        assert!(!matches(&g, f2, &compile_time_func()));
    }
}
