//! Structural graph rewrites run by the pipeline's rewrite stages.

mod cast_pair;
mod conv_bias;
mod identity;
mod quant;
mod trans_pair;

pub use cast_pair::CastPairElimination;
pub use conv_bias::ConvBiasAddFusion;
pub use identity::IdentityElimination;
pub use quant::QuantDequantCancel;
pub use trans_pair::TransPairElimination;

use auto_impl::auto_impl;
use parking_lot::Mutex;

use std::sync::Arc;

use crate::graph::{Graph, GraphError, NodeId};
use crate::pipeline::Stage;

/// Upper bound on rewrite sweeps of a single pass.
const MAX_ITERATIONS: usize = 16;

/// Result returned by a [GraphPass] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    pub changed: bool,
    /// Number of sweeps over the graph.
    pub iterations: usize,
    pub rewrites_applied: usize,
    /// Nodes removed from the graph.
    pub erased_nodes: usize,
}

#[auto_impl(&, Box, Arc)]
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn stage(&self) -> Stage;
    /// Passes of one stage run in ascending priority, then by name.
    fn priority(&self) -> i32 {
        0
    }
    fn run(&self, graph: &mut Graph) -> Result<PassResult, GraphError>;
}

/// The passes available to the pipeline. Shared between concurrent compilations.
#[derive(Default)]
pub struct PassRegistry {
    passes: Mutex<Vec<Arc<dyn GraphPass>>>,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_passes() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(QuantDequantCancel));
        registry.register(Arc::new(IdentityElimination));
        registry.register(Arc::new(ConvBiasAddFusion));
        registry.register(Arc::new(TransPairElimination));
        registry.register(Arc::new(CastPairElimination));
        registry
    }

    pub fn register(&self, pass: Arc<dyn GraphPass>) {
        self.passes.lock().push(pass);
    }

    /// Sorts the registered passes by `(stage, priority, name)` and returns them.
    pub fn snapshot(&self) -> Vec<Arc<dyn GraphPass>> {
        let mut passes = self.passes.lock();
        passes.sort_by(|a, b| {
            (a.stage(), a.priority(), a.name()).cmp(&(b.stage(), b.priority(), b.name()))
        });
        passes.clone()
    }

    pub fn len(&self) -> usize {
        self.passes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Repeats `sweep` until it applies no rewrite. `sweep` returns `(rewrites, erased)`.
fn fixed_point(
    graph: &mut Graph,
    mut sweep: impl FnMut(&mut Graph) -> Result<(usize, usize), GraphError>,
) -> Result<PassResult, GraphError> {
    let mut result = PassResult::default();
    while result.iterations < MAX_ITERATIONS {
        let (rewrites, erased) = sweep(graph)?;
        result = result.merge(PassResult {
            changed: rewrites > 0,
            iterations: 1,
            rewrites_applied: rewrites,
            erased_nodes: erased,
        });
        if rewrites == 0 {
            break;
        }
    }
    Ok(result)
}

fn has_control_edges(graph: &Graph, id: NodeId) -> bool {
    graph.control_edges().any(|(a, b)| a == id || b == id)
}

/// The single node consuming `id`'s only output, if there is exactly one.
fn sole_consumer(graph: &Graph, id: NodeId) -> Option<NodeId> {
    let mut consumers = graph.consumers(id.out(0));
    let first = consumers.next()?;
    consumers.next().is_none().then_some(first.node)
}

/// Removes the chain `first ..= last` (each a single-input, single-output node) and connects
/// `first`'s producer straight to `last`'s consumers.
///
/// Returns `false` (leaving the graph untouched) if `first` has no producer.
fn bypass(graph: &mut Graph, chain: &[NodeId]) -> Result<bool, GraphError> {
    let (Some(&first), Some(&last)) = (chain.first(), chain.last()) else {
        return Ok(false);
    };
    let Some(src) = graph.producer(first.input(0)) else {
        return Ok(false);
    };
    let dsts: Vec<_> = graph.consumers(last.out(0)).collect();
    for &id in chain {
        graph.remove_node(id)?;
    }
    for dst in dsts {
        graph.add_data_edge(src, dst)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, Stage, i32);

    impl GraphPass for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn stage(&self) -> Stage {
            self.1
        }

        fn priority(&self) -> i32 {
            self.2
        }

        fn run(&self, _graph: &mut Graph) -> Result<PassResult, GraphError> {
            Ok(PassResult::default())
        }
    }

    #[test]
    fn test_snapshot_orders_by_stage_priority_name() {
        let registry = PassRegistry::new();
        registry.register(Arc::new(Named("b", Stage::GraphFusion, 0)));
        registry.register(Arc::new(Named("late", Stage::SecondRoundFusion, -5)));
        registry.register(Arc::new(Named("a", Stage::GraphFusion, 0)));
        registry.register(Arc::new(Named("first", Stage::GraphFusion, -1)));
        registry.register(Arc::new(Named("quant", Stage::PreQuantRewrite, 10)));
        let names: Vec<_> = registry.snapshot().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["quant", "first", "a", "b", "late"]);
    }

    #[test]
    fn test_builtin_passes_cover_every_rewrite_stage() {
        let registry = PassRegistry::with_builtin_passes();
        let staged: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|p| (p.stage(), p.name()))
            .collect();
        assert_eq!(
            staged,
            [
                (Stage::PreQuantRewrite, "QuantDequantCancel"),
                (Stage::GraphFusion, "ConvBiasAddFusion"),
                (Stage::GraphFusion, "IdentityElimination"),
                (Stage::SecondRoundFusion, "CastPairElimination"),
                (Stage::SecondRoundFusion, "TransPairElimination"),
            ]
        );
    }

    #[test]
    fn test_results_merge() {
        let a = PassResult {
            changed: false,
            iterations: 1,
            rewrites_applied: 0,
            erased_nodes: 0,
        };
        let b = PassResult {
            changed: true,
            iterations: 2,
            rewrites_applied: 3,
            erased_nodes: 4,
        };
        assert_eq!(
            a.merge(b),
            PassResult {
                changed: true,
                iterations: 3,
                rewrites_applied: 3,
                erased_nodes: 4,
            }
        );
    }
}
