use crate::graph::{op_types, Graph, GraphError, Node, NodeId};
use crate::passes::{bypass, fixed_point, has_control_edges, sole_consumer, GraphPass, PassResult};
use crate::pipeline::Stage;

/// Removes back-to-back `TransData` nodes whose second conversion undoes the first.
#[derive(Default)]
pub struct TransPairElimination;

impl TransPairElimination {
    const NAME: &'static str = "TransPairElimination";
}

impl GraphPass for TransPairElimination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn stage(&self) -> Stage {
        Stage::SecondRoundFusion
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, GraphError> {
        fixed_point(graph, |graph| {
            let pairs = inverse_pairs(graph, op_types::TRANS_DATA, |first, second| {
                let (before, after) = (&first.op.inputs[0].desc, &second.op.outputs[0].desc);
                !before.layout_differs(after) && !before.dtype_differs(after)
            })?;
            remove_pairs(graph, pairs)
        })
    }
}

/// Finds `(first, second)` pairs of single-input, single-output `op_type` nodes where
/// `second` is the only consumer of `first` and `undoes(first, second)` holds.
pub(super) fn inverse_pairs(
    graph: &Graph,
    op_type: &str,
    undoes: impl Fn(&Node, &Node) -> bool,
) -> Result<Vec<[NodeId; 2]>, GraphError> {
    let unary = |n: &Node| {
        n.op.op_type == op_type && n.op.inputs.len() == 1 && n.op.outputs.len() == 1
    };
    let mut pairs = vec![];
    for first in graph.nodes().filter(|n| unary(n)) {
        let Some(second) = sole_consumer(graph, first.id) else {
            continue;
        };
        let second = graph.node(second)?;
        if unary(second)
            && undoes(first, second)
            && !has_control_edges(graph, first.id)
            && !has_control_edges(graph, second.id)
        {
            pairs.push([first.id, second.id]);
        }
    }
    Ok(pairs)
}

/// Bypasses each pair still fully present, returning `(rewrites, erased)`.
pub(super) fn remove_pairs(
    graph: &mut Graph,
    pairs: Vec<[NodeId; 2]>,
) -> Result<(usize, usize), GraphError> {
    let mut rewrites = 0;
    for pair in pairs {
        if pair.iter().all(|&id| graph.contains(id)) && bypass(graph, &pair)? {
            rewrites += 1;
        }
    }
    Ok((rewrites, rewrites * 2))
}
