use crate::catalog::Catalog;
use crate::common::Format;
use crate::graph::{Graph, GraphError, SlotDir};
use crate::propagate::reflection::{ReflectionRelations, SlotRef};
use crate::propagate::PropagateError;
use crate::tensor::{Provenance, TensorDesc, TensorMark};

/// Forces every reflection class onto one layout, returning the number of slots rewritten.
///
/// The representative is the first member (in slot order) holding a heavy format, or the first
/// member if none does. Its `(format, sub_format, shape)` is copied onto every other member.
pub fn propagate_heavy(
    graph: &mut Graph,
    catalog: &Catalog,
    relations: &ReflectionRelations,
) -> Result<usize, PropagateError> {
    let mut rewritten = 0;
    for class in relations.classes() {
        let descs = class
            .iter()
            .map(|s| desc_of(graph, *s).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let rep = descs
            .iter()
            .position(|d| d.format.is_heavy())
            .unwrap_or(0);
        let (rep_slot, rep_desc) = (class[rep], &descs[rep]);

        if let Some((slot, other)) = class
            .iter()
            .zip(&descs)
            .find(|(_, d)| d.format.is_heavy() && d.format != rep_desc.format)
        {
            return Err(conflict(
                graph,
                *slot,
                format!(
                    "shares memory with {rep_slot} but holds {} instead of {}",
                    other.format, rep_desc.format
                ),
            ));
        }

        let source_name = graph.node(rep_slot.node)?.name.clone();
        for (slot, desc) in class.iter().zip(&descs) {
            if *slot == rep_slot {
                continue;
            }
            if let Some(declared) = declared_format(graph, catalog, *slot)? {
                let allowed = declared == rep_desc.format
                    || (declared == Format::Nd && !rep_desc.format.is_heavy());
                if !allowed {
                    return Err(conflict(
                        graph,
                        *slot,
                        format!(
                            "kernel requires {declared} but {rep_slot} forces {}",
                            rep_desc.format
                        ),
                    ));
                }
            }
            if desc.format == rep_desc.format
                && desc.sub_format == rep_desc.sub_format
                && desc.shape == rep_desc.shape
            {
                continue;
            }
            let target = slot
                .desc_mut(graph)
                .ok_or(GraphError::NodeNotFound(slot.node))?;
            target.format = rep_desc.format;
            target.sub_format = rep_desc.sub_format;
            target.shape = rep_desc.shape.clone();
            target.mark(TensorMark::HeavyFormatPropagated);
            target.provenance = Some(Provenance {
                source_node: rep_slot.node,
                source_name: source_name.clone(),
                source_output: rep_slot.dir == SlotDir::Output,
                source_index: rep_slot.index,
            });
            rewritten += 1;
        }
    }
    if rewritten > 0 {
        log::debug!("Propagated shared layouts onto {rewritten} slot(s)");
    }
    Ok(rewritten)
}

fn desc_of(graph: &Graph, slot: SlotRef) -> Result<&TensorDesc, GraphError> {
    slot.desc(graph).ok_or(GraphError::SlotOutOfRange {
        node: slot.node,
        index: slot.index,
        dir: slot.dir,
    })
}

/// The format the slot's bound kernel column pins it to, if any.
fn declared_format(
    graph: &Graph,
    catalog: &Catalog,
    slot: SlotRef,
) -> Result<Option<Format>, GraphError> {
    let node = graph.node(slot.node)?;
    let Some(binding) = &node.op.kernel else {
        return Ok(None);
    };
    let Some(candidate) = catalog.candidate(&node.op.op_type, &binding.candidate) else {
        return Ok(None);
    };
    let (slots, decls) = match slot.dir {
        SlotDir::Input => (&node.op.inputs, &candidate.inputs),
        SlotDir::Output => (&node.op.outputs, &candidate.outputs),
    };
    let Some(name) = slots.get(slot.index).map(|s| &s.name) else {
        return Ok(None);
    };
    Ok(decls
        .iter()
        .find(|d| d.binds(name))
        .and_then(|d| d.format_at(binding.column)))
}

fn conflict(graph: &Graph, slot: SlotRef, detail: String) -> PropagateError {
    PropagateError::FormatConflict {
        node: graph
            .node(slot.node)
            .map_or_else(|_| slot.node.to_string(), |n| n.name.clone()),
        slot: format!("{} {}", slot.dir, slot.index),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendKind, KernelCandidate, SlotDecl};
    use crate::common::{static_shape, Dtype};
    use crate::graph::{GraphBuilder, KernelBinding, NodeId};

    fn nchw() -> TensorDesc {
        TensorDesc::new(static_shape(&[1, 16, 4, 4]), Dtype::Float16, Format::Nchw)
    }

    fn catalog(apply_out: Option<Format>) -> Catalog {
        let f16 = || vec![Dtype::Float16];
        let out = match apply_out {
            Some(f) => SlotDecl::required("y", f16()).with_formats(vec![f]),
            None => SlotDecl::required("y", f16()),
        };
        let mut b = Catalog::builder();
        b.add(
            KernelCandidate::new("conv", "Conv2D", BackendKind::Cube)
                .input(SlotDecl::required("x1", f16()))
                .input(SlotDecl::required("x2", f16()))
                .output(SlotDecl::required("y", f16()).with_formats(vec![Format::Nc1hwc0])),
        )
        .add(
            KernelCandidate::new("apply", "ApplyInplace", BackendKind::Vector)
                .input(SlotDecl::required("x", f16()))
                .output(out)
                .ref_pair(0, 0),
        );
        b.build().unwrap()
    }

    /// x, w -> conv -> apply (in place) -> out, with conv's output already judged as NC1HWC0.
    fn graph(apply_out: Option<Format>) -> (Graph, NodeId, NodeId) {
        let mut gb = GraphBuilder::new("g");
        let x = gb.data("x", nchw());
        let w = gb.data("w", nchw());
        let conv = gb.op("conv", "Conv2D", &[x.out(0), w.out(0)], vec![nchw()]);
        let apply = gb.op("apply", "ApplyInplace", &[conv.out(0)], vec![nchw()]);
        gb.output("out", &[apply.out(0)]);
        let mut g = gb.build().unwrap();
        let bindings = [
            (conv, "conv", BackendKind::Cube),
            (apply, "apply", BackendKind::Vector),
        ];
        for (id, name, backend) in bindings {
            g.node_mut(id).unwrap().op.kernel = Some(KernelBinding {
                candidate: name.to_owned(),
                column: 0,
                backend,
                compiled: None,
            });
        }
        assert!(g.node_mut(conv).unwrap().op.outputs[0]
            .desc
            .set_format(Format::Nc1hwc0));
        if let Some(f) = apply_out {
            assert!(g.node_mut(apply).unwrap().op.outputs[0].desc.set_format(f));
        }
        (g, conv, apply)
    }

    #[test]
    fn test_heavy_format_flows_through_in_place_op() {
        let catalog = catalog(None);
        let (mut g, conv, apply) = graph(None);
        let relations = ReflectionRelations::build(&g, &catalog);
        assert_eq!(propagate_heavy(&mut g, &catalog, &relations).unwrap(), 2);

        let apply = &g.node(apply).unwrap().op;
        for desc in [&apply.inputs[0].desc, &apply.outputs[0].desc] {
            assert_eq!(desc.format, Format::Nc1hwc0);
            assert_eq!(desc.shape, static_shape(&[1, 1, 4, 4, 16]));
            assert!(desc.has_mark(TensorMark::HeavyFormatPropagated));
            assert_eq!(desc.provenance.as_ref().unwrap().source_node, conv);
        }

        // Already consistent: nothing to do.
        assert_eq!(propagate_heavy(&mut g, &catalog, &relations).unwrap(), 0);
    }

    #[test]
    fn test_two_heavy_formats_in_one_class_conflict() {
        let catalog = catalog(Some(Format::FractalZ));
        let (mut g, _, _) = graph(Some(Format::FractalZ));
        let relations = ReflectionRelations::build(&g, &catalog);
        assert!(matches!(
            propagate_heavy(&mut g, &catalog, &relations),
            Err(PropagateError::FormatConflict { node, .. }) if node == "apply"
        ));
    }

    #[test]
    fn test_column_constraint_conflicts_with_forced_format() {
        let catalog = catalog(Some(Format::Nchw));
        let (mut g, _, _) = graph(None);
        let relations = ReflectionRelations::build(&g, &catalog);
        assert!(matches!(
            propagate_heavy(&mut g, &catalog, &relations),
            Err(PropagateError::FormatConflict { .. })
        ));
    }
}
