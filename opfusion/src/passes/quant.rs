use crate::graph::{Graph, GraphError, Node};
use crate::passes::{bypass, fixed_point, has_control_edges, sole_consumer, GraphPass, PassResult};
use crate::pipeline::Stage;

pub const QUANTIZE: &str = "Quantize";
pub const DEQUANTIZE: &str = "Dequantize";

/// Removes `Quantize -> Dequantize` round trips that restore the original tensor with the
/// same scale and offset.
#[derive(Default)]
pub struct QuantDequantCancel;

impl QuantDequantCancel {
    const NAME: &'static str = "QuantDequantCancel";
}

impl GraphPass for QuantDequantCancel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn stage(&self) -> Stage {
        Stage::PreQuantRewrite
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, GraphError> {
        fixed_point(graph, |graph| {
            let mut pairs = vec![];
            for quant in graph.nodes().filter(|n| n.op.op_type == QUANTIZE) {
                let Some(dequant) = sole_consumer(graph, quant.id) else {
                    continue;
                };
                let dequant = graph.node(dequant)?;
                if dequant.op.op_type == DEQUANTIZE
                    && cancels(quant, dequant)
                    && !has_control_edges(graph, quant.id)
                    && !has_control_edges(graph, dequant.id)
                {
                    pairs.push([quant.id, dequant.id]);
                }
            }
            let mut rewrites = 0;
            for pair in pairs {
                if pair.iter().all(|&id| graph.contains(id)) && bypass(graph, &pair)? {
                    log::debug!("Cancelled quantization round trip {} -> {}", pair[0], pair[1]);
                    rewrites += 1;
                }
            }
            Ok((rewrites, rewrites * 2))
        })
    }
}

fn cancels(quant: &Node, dequant: &Node) -> bool {
    let same = |key: &str| quant.op.attr(key) == dequant.op.attr(key);
    let (Some(before), Some(after)) = (quant.op.inputs.first(), dequant.op.outputs.first()) else {
        return false;
    };
    quant.op.outputs.len() == 1
        && dequant.op.inputs.len() == 1
        && same("scale")
        && same("offset")
        && !before.desc.layout_differs(&after.desc)
        && !before.desc.dtype_differs(&after.desc)
}
