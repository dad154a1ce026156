//! # Rule Engine
//!
//! Fixed-point application of transformation rules over an IR graph. A rule
//! is applied to every node in topological order; a batch of rules repeats
//! until no rule reports a change, bounded by an iteration cap.
//!
//! Execution is serial, deterministic, and single-threaded. Rules operate on
//! node ids and re-acquire nodes through the graph after every mutation, so
//! deletions mid-pass are safe (deleted ids are skipped).

use crate::compiler::error::{CompilerError, CompilerResult};
use crate::ir::{IrGraph, NodeId};
use tracing::{debug, trace};

/// Iteration cap for rule batches. Exceeding it is a hard error: a batch
/// that keeps reporting changes is cycling, not converging.
pub const DEFAULT_MAX_ITERATIONS: u64 = 1024;

/// A graph transformation applied node-by-node.
pub trait Rule {
    fn name(&self) -> &'static str;

    /// Apply to a single node. Returns whether the graph changed.
    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool>;

    /// Apply to every node in topological order, skipping nodes deleted by
    /// earlier applications in the same pass.
    fn execute(&self, graph: &mut IrGraph) -> CompilerResult<bool> {
        let ids = graph.topological_sort();
        let mut any_changed = false;
        for id in ids {
            if !graph.contains(id) {
                continue;
            }
            let changed = self.apply(graph, id)?;
            if changed {
                trace!(rule = self.name(), node = id, "rule changed node");
            }
            any_changed = any_changed || changed;
        }
        Ok(any_changed)
    }
}

/// A named group of rules run together to a fixed point.
pub struct RuleBatch<'a> {
    pub name: String,
    pub rules: Vec<Box<dyn Rule + 'a>>,
}

impl<'a> RuleBatch<'a> {
    pub fn new(name: &str) -> Self {
        RuleBatch { name: name.to_string(), rules: Vec::new() }
    }

    pub fn add_rule(mut self, rule: Box<dyn Rule + 'a>) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Runs batches in order, each to its own fixed point.
pub struct RuleExecutor<'a> {
    batches: Vec<RuleBatch<'a>>,
    max_iterations: u64,
}

impl<'a> RuleExecutor<'a> {
    pub fn new() -> Self {
        RuleExecutor { batches: Vec::new(), max_iterations: DEFAULT_MAX_ITERATIONS }
    }

    pub fn with_max_iterations(max_iterations: u64) -> Self {
        RuleExecutor { batches: Vec::new(), max_iterations }
    }

    pub fn add_batch(&mut self, batch: RuleBatch<'a>) {
        self.batches.push(batch);
    }

    pub fn execute(&self, graph: &mut IrGraph) -> CompilerResult<()> {
        for batch in &self.batches {
            let mut iterations: u64 = 0;
            loop {
                let mut changed = false;
                for rule in &batch.rules {
                    changed = rule.execute(graph)? || changed;
                }
                if !changed {
                    break;
                }
                iterations += 1;
                if iterations >= self.max_iterations {
                    return Err(CompilerError::FixedPointExceeded {
                        batch: batch.name.clone(),
                        iterations,
                    });
                }
            }
            debug!(batch = %batch.name, iterations, "rule batch reached fixed point");
        }
        Ok(())
    }
}

impl<'a> Default for RuleExecutor<'a> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ExpressionKind;

    /// Bumps every Int below `target` by one. Converges in `target` passes.
    struct RaiseToTarget {
        target: i64,
    }

    impl Rule for RaiseToTarget {
        fn name(&self) -> &'static str {
            "RaiseToTarget"
        }

        fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
            if let Ok(expr) = graph.expression_mut(node) {
                if let ExpressionKind::Int(v) = &mut expr.kind {
                    if *v < self.target {
                        *v += 1;
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
    }

    /// Always claims a change without making one.
    struct NeverConverges;

    impl Rule for NeverConverges {
        fn name(&self) -> &'static str {
            "NeverConverges"
        }

        fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> CompilerResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_batch_runs_to_fixed_point() {
        let mut graph = IrGraph::new();
        let a = graph.create_int(0);
        let b = graph.create_int(2);

        let mut executor = RuleExecutor::new();
        executor.add_batch(
            RuleBatch::new("raise").add_rule(Box::new(RaiseToTarget { target: 3 })),
        );
        executor.execute(&mut graph).unwrap();

        assert_eq!(graph.expression(a).unwrap().kind, ExpressionKind::Int(3));
        assert_eq!(graph.expression(b).unwrap().kind, ExpressionKind::Int(3));
    }

    #[test]
    fn test_iteration_cap_errors() {
        let mut graph = IrGraph::new();
        graph.create_int(0);

        let mut executor = RuleExecutor::with_max_iterations(4);
        executor.add_batch(RuleBatch::new("diverge").add_rule(Box::new(NeverConverges)));
        let err = executor.execute(&mut graph).unwrap_err();
        assert!(matches!(
            err,
            CompilerError::FixedPointExceeded { iterations: 4, .. }
        ));
    }

    #[test]
    fn test_execute_skips_deleted_nodes() {
        /// Deletes the partner node of any Int it visits.
        struct DeletePartner {
            partner: NodeId,
        }

        impl Rule for DeletePartner {
            fn name(&self) -> &'static str {
                "DeletePartner"
            }

            fn apply(&self, graph: &mut IrGraph, node: NodeId) -> CompilerResult<bool> {
                if node != self.partner && graph.contains(self.partner) {
                    graph.delete_node(self.partner)?;
                    return Ok(true);
                }
                Ok(false)
            }
        }

        let mut graph = IrGraph::new();
        let _a = graph.create_int(1);
        let b = graph.create_int(2);

        let rule = DeletePartner { partner: b };
        // One pass visits a (deletes b), then skips the deleted b.
        assert!(rule.execute(&mut graph).unwrap());
        assert!(!graph.contains(b));
    }
}
