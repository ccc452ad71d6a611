use crate::graph::{op_types, Graph, GraphError};
use crate::passes::trans_pair::{inverse_pairs, remove_pairs};
use crate::passes::{fixed_point, GraphPass, PassResult};
use crate::pipeline::Stage;

/// Removes `Cast` round trips through a wider type of the same family, such as
/// float16 -> float32 -> float16. Narrowing round trips lose information and are kept.
#[derive(Default)]
pub struct CastPairElimination;

impl CastPairElimination {
    const NAME: &'static str = "CastPairElimination";
}

impl GraphPass for CastPairElimination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn stage(&self) -> Stage {
        Stage::SecondRoundFusion
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, GraphError> {
        fixed_point(graph, |graph| {
            let pairs = inverse_pairs(graph, op_types::CAST, |first, second| {
                let before = &first.op.inputs[0].desc;
                let middle = first.op.outputs[0].desc.dtype;
                let after = &second.op.outputs[0].desc;
                before.dtype == after.dtype
                    && !before.layout_differs(after)
                    && middle.size() > before.dtype.size()
                    && middle.is_float() == before.dtype.is_float()
            })?;
            remove_pairs(graph, pairs)
        })
    }
}
