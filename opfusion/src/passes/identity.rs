use crate::graph::{op_types, Graph, GraphError, NodeId};
use crate::passes::{bypass, fixed_point, has_control_edges, GraphPass, PassResult};
use crate::pipeline::Stage;

/// Removes `Identity` nodes that neither convert their tensor nor order anything.
#[derive(Default)]
pub struct IdentityElimination;

impl IdentityElimination {
    const NAME: &'static str = "IdentityElimination";
}

impl GraphPass for IdentityElimination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn stage(&self) -> Stage {
        Stage::GraphFusion
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, GraphError> {
        fixed_point(graph, |graph| {
            let targets: Vec<NodeId> = graph
                .nodes()
                .filter(|n| n.op.op_type == op_types::IDENTITY)
                .filter(|n| n.op.inputs.len() == 1 && n.op.outputs.len() == 1)
                .filter(|n| {
                    let (i, o) = (&n.op.inputs[0].desc, &n.op.outputs[0].desc);
                    !i.layout_differs(o) && !i.dtype_differs(o)
                })
                .map(|n| n.id)
                .filter(|&id| !has_control_edges(graph, id))
                .collect();
            let mut removed = 0;
            for id in targets {
                if bypass(graph, &[id])? {
                    removed += 1;
                }
            }
            Ok((removed, removed))
        })
    }
}
