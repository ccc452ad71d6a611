use std::collections::BTreeMap;

use crate::attr::AttrValue;
use crate::catalog::BackendKind;
use crate::common::{Dtype, Format};
use crate::graph::{
    attr_keys, op_types, Graph, GraphError, InAnchor, KernelBinding, NodeId, OpDesc, OutAnchor,
};
use crate::propagate::PropagateError;

pub const TRANS_DATA_KERNEL: &str = "builtin_trans_data";
pub const CAST_KERNEL: &str = "builtin_cast";

/// The layout and type a group of consumers expects.
type Target = (Format, u32, Dtype);

/// Inserts `TransData` and `Cast` nodes on every data edge whose ends disagree, returning the
/// number of nodes inserted.
///
/// Consumers of one output that expect the same layout and type share one conversion chain.
/// A chain converts layout first, then dtype. Control edges are left alone.
pub fn insert_trans_nodes(graph: &mut Graph) -> Result<usize, PropagateError> {
    let mut groups: BTreeMap<(OutAnchor, Target), Vec<InAnchor>> = BTreeMap::new();
    for (src, dst) in graph.data_edges() {
        let from = graph.output_desc(src)?;
        let to = graph.input_desc(dst)?;
        if from.layout_differs(to) || from.dtype_differs(to) {
            groups
                .entry((src, (to.format, to.sub_format, to.dtype)))
                .or_default()
                .push(dst);
        }
    }

    let mut inserted = 0;
    for ((src, _), dsts) in groups {
        let target = graph.input_desc(dsts[0])?.clone();
        let mut desc = graph.output_desc(src)?.clone();
        let producer = graph.node(src.node)?.name.clone();
        for &dst in &dsts {
            graph.remove_data_edge(dst);
        }

        let mut tail = src;
        if desc.layout_differs(&target) {
            let mut out = desc.clone();
            out.format = target.format;
            out.sub_format = target.sub_format;
            out.shape = target.shape.clone();
            out.origin_format = target.origin_format;
            let op = OpDesc::new(op_types::TRANS_DATA)
                .with_input("src", desc.clone())
                .with_output("dst", out.clone())
                .with_attr("src_format", AttrValue::Str(desc.format.to_string()))
                .with_attr("dst_format", AttrValue::Str(target.format.to_string()));
            tail = add_trans_node(graph, &producer, op, TRANS_DATA_KERNEL, tail)?;
            desc = out;
            inserted += 1;
        }
        if desc.dtype_differs(&target) {
            let mut out = desc.clone();
            out.set_dtype(target.dtype);
            let op = OpDesc::new(op_types::CAST)
                .with_input("x", desc.clone())
                .with_output("y", out.clone())
                .with_attr("dst_type", AttrValue::Dtype(target.dtype));
            tail = add_trans_node(graph, &producer, op, CAST_KERNEL, tail)?;
            desc = out;
            inserted += 1;
        }
        debug_assert!(!desc.layout_differs(&target) && !desc.dtype_differs(&target));

        for dst in dsts {
            graph.add_data_edge(tail, dst)?;
        }
    }

    if let Err(e) = graph.validate() {
        return Err(PropagateError::FormatConflict {
            node: graph.name.clone(),
            slot: "-".to_owned(),
            detail: format!("conversion nodes break the graph: {e}"),
        });
    }
    if inserted > 0 {
        log::debug!("Inserted {inserted} conversion node(s) into {}", graph.name);
    }
    Ok(inserted)
}

fn add_trans_node(
    graph: &mut Graph,
    producer: &str,
    mut op: OpDesc,
    kernel: &str,
    input: OutAnchor,
) -> Result<OutAnchor, GraphError> {
    op.attrs
        .insert(attr_keys::TRANS_NODE.to_owned(), AttrValue::Bool(true));
    op.kernel = Some(KernelBinding {
        candidate: kernel.to_owned(),
        column: 0,
        backend: BackendKind::Builtin,
        compiled: None,
    });
    let name = unique_name(graph, &format!("{producer}_{}", op.op_type));
    let id: NodeId = graph.add_node(name, op);
    graph.add_data_edge(input, id.input(0))?;
    Ok(id.out(0))
}

fn unique_name(graph: &Graph, base: &str) -> String {
    if graph.find_by_name(base).is_none() {
        return base.to_owned();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|name| graph.find_by_name(name).is_none())
        .unwrap_or_else(|| base.to_owned())
}

/// The number of conversion nodes in `graph`.
pub fn count_trans_nodes(graph: &Graph) -> usize {
    graph.nodes().filter(|n| n.op.is_trans()).count()
}
