use crate::graph::{Graph, GraphError, NodeId, TensorSlot};
use crate::passes::{fixed_point, has_control_edges, sole_consumer, GraphPass, PassResult};
use crate::pipeline::Stage;

pub const CONV2D: &str = "Conv2D";
pub const BIAS_ADD: &str = "BiasAdd";

/// Folds a `BiasAdd` that is the only consumer of a bias-less `Conv2D` into the convolution's
/// optional `bias` input.
#[derive(Default)]
pub struct ConvBiasAddFusion;

impl ConvBiasAddFusion {
    const NAME: &'static str = "ConvBiasAddFusion";
}

impl GraphPass for ConvBiasAddFusion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn stage(&self) -> Stage {
        Stage::GraphFusion
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, GraphError> {
        fixed_point(graph, |graph| {
            let mut pairs = vec![];
            for conv in graph.nodes() {
                if conv.op.op_type != CONV2D || conv.op.inputs.len() != 2 {
                    continue;
                }
                let Some(bias_add) = sole_consumer(graph, conv.id) else {
                    continue;
                };
                let node = graph.node(bias_add)?;
                if node.op.op_type == BIAS_ADD
                    && node.op.inputs.len() == 2
                    && graph.producer(bias_add.input(0)) == Some(conv.id.out(0))
                    && graph.producer(bias_add.input(1)).is_some()
                    && !has_control_edges(graph, bias_add)
                {
                    pairs.push((conv.id, bias_add));
                }
            }
            let mut rewrites = 0;
            for (conv, bias_add) in pairs {
                fold(graph, conv, bias_add)?;
                rewrites += 1;
            }
            Ok((rewrites, rewrites))
        })
    }
}

fn fold(graph: &mut Graph, conv: NodeId, bias_add: NodeId) -> Result<(), GraphError> {
    let Some(bias) = graph.producer(bias_add.input(1)) else {
        return Ok(());
    };
    let dsts: Vec<_> = graph.consumers(bias_add.out(0)).collect();
    let removed = graph.remove_node(bias_add)?;
    let mut slots = removed.op.inputs.into_iter().skip(1);
    let mut outputs = removed.op.outputs.into_iter();

    let node = graph.node_mut(conv)?;
    if let Some(slot) = slots.next() {
        node.op.inputs.push(TensorSlot::new("bias", slot.desc));
    }
    if let (Some(out), Some(first)) = (outputs.next(), node.op.outputs.first_mut()) {
        first.desc = out.desc;
    }
    log::debug!("Folded {} into {}", removed.name, node.name);

    graph.add_data_edge(bias, conv.input(2))?;
    for dst in dsts {
        graph.add_data_edge(conv.out(0), dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::testing::f16;

    #[test]
    fn test_bias_add_is_folded_into_conv() {
        let mut gb = GraphBuilder::new("g");
        let x = gb.data("x", f16(&[1, 16, 8, 8]));
        let w = gb.data("w", f16(&[16, 16, 3, 3]));
        let b = gb.data("b", f16(&[16]));
        let conv = gb.op("conv", CONV2D, &[x.out(0), w.out(0)], vec![f16(&[1, 16, 6, 6])]);
        let add = gb.op("add", BIAS_ADD, &[conv.out(0), b.out(0)], vec![f16(&[1, 16, 6, 6])]);
        let relu = gb.op("relu", "Relu", &[add.out(0)], vec![f16(&[1, 16, 6, 6])]);
        gb.output("out", &[relu.out(0)]);
        let mut g = gb.build().unwrap();

        let result = ConvBiasAddFusion.run(&mut g).unwrap();
        assert_eq!(result.rewrites_applied, 1);
        assert!(!g.contains(add));
        let conv_node = g.node(conv).unwrap();
        assert_eq!(conv_node.op.inputs.len(), 3);
        assert_eq!(conv_node.op.inputs[2].name, "bias");
        assert_eq!(g.producer(conv.input(2)), Some(b.out(0)));
        assert_eq!(g.producer(relu.input(0)), Some(conv.out(0)));
        g.validate().unwrap();
    }

    #[test]
    fn test_shared_conv_output_is_not_folded() {
        let mut gb = GraphBuilder::new("g");
        let x = gb.data("x", f16(&[1, 16, 8, 8]));
        let w = gb.data("w", f16(&[16, 16, 3, 3]));
        let b = gb.data("b", f16(&[16]));
        let conv = gb.op("conv", CONV2D, &[x.out(0), w.out(0)], vec![f16(&[1, 16, 6, 6])]);
        let add = gb.op("add", BIAS_ADD, &[conv.out(0), b.out(0)], vec![f16(&[1, 16, 6, 6])]);
        gb.output("out", &[add.out(0), conv.out(0)]);
        let mut g = gb.build().unwrap();

        assert!(!ConvBiasAddFusion.run(&mut g).unwrap().changed);
        assert!(g.contains(add));
    }
}
