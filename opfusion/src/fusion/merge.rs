use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet};

use crate::attr::AttrValue;
use crate::backend::MemoryClass;
use crate::catalog::BackendKind;
use crate::fusion::{FusedBody, FusionScope};
use crate::graph::{
    attr_keys, op_types, Graph, GraphError, InAnchor, KernelBinding, Node, NodeId, OpDesc,
    OutAnchor, TensorSlot,
};

/// Member names of every fused node, grouped by the memory level the fusion targets.
///
/// Threaded through all merges of a compilation and returned with the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MergeAccumulator {
    levels: BTreeMap<MemoryClass, IndexMap<String, Vec<String>>>,
}

/// Attributes copied from the first member onto the fused node.
const FIRST_MEMBER_ATTRS: [&str; 3] = [
    attr_keys::MEM_TYPE,
    attr_keys::ATOMIC_OUTPUT_INDEX,
    attr_keys::ATOMIC_CLEAN_POLICY,
];

impl MergeAccumulator {
    pub fn record(&mut self, level: MemoryClass, fused: &str, members: Vec<String>) {
        self.levels
            .entry(level)
            .or_default()
            .insert(fused.to_owned(), members);
    }

    /// Drops a fused node that was dissolved. Returns `false` if it was never recorded.
    pub fn forget(&mut self, fused: &str) -> bool {
        self.levels
            .values_mut()
            .any(|names| names.shift_remove(fused).is_some())
    }

    pub fn members_of(&self, fused: &str) -> Option<&[String]> {
        self.levels
            .values()
            .find_map(|names| names.get(fused))
            .map(Vec::as_slice)
    }

    pub fn fused_names(&self, level: MemoryClass) -> impl Iterator<Item = &str> + '_ {
        self.levels
            .get(&level)
            .into_iter()
            .flat_map(|names| names.keys().map(String::as_str))
    }

    pub fn fused_count(&self) -> usize {
        self.levels.values().map(IndexMap::len).sum()
    }

    pub fn absorb(&mut self, other: MergeAccumulator) {
        for (level, names) in other.levels {
            self.levels.entry(level).or_default().extend(names);
        }
    }
}

/// Replaces the members of `scope` by a single fused node and returns its id.
///
/// Fused inputs are the distinct external producers in first-seen order (members in scope
/// order, slots ascending). Fused outputs are the member outputs with at least one external
/// consumer, in the same order. Control edges are moved to the fused node. The removed members
/// and every original edge are kept in the node's [FusedBody], so [unmerge] can undo this.
pub fn merge_scope(
    graph: &mut Graph,
    scope: &FusionScope,
    accumulator: &mut MergeAccumulator,
) -> Result<NodeId, GraphError> {
    let mut members: BTreeSet<NodeId> = BTreeSet::new();
    for &id in &scope.members {
        if !members.insert(id) {
            return Err(GraphError::DuplicateScopeMember {
                scope: scope.id,
                node: id,
            });
        }
    }

    let mut internal_edges = vec![];
    let mut external_inputs = vec![];
    let mut external_outputs = vec![];
    let mut input_index: IndexMap<OutAnchor, Vec<InAnchor>> = IndexMap::new();
    let mut input_slots: Vec<TensorSlot> = vec![];
    let mut output_map: Vec<OutAnchor> = vec![];
    let mut output_slots: Vec<TensorSlot> = vec![];
    let mut out_edges: Vec<(usize, InAnchor)> = vec![];

    for &id in &scope.members {
        let op = &graph.node(id)?.op;
        for (i, slot) in op.inputs.iter().enumerate() {
            let dst = id.input(i);
            let Some(src) = graph.producer(dst) else {
                continue;
            };
            if members.contains(&src.node) {
                internal_edges.push((src, dst));
                continue;
            }
            external_inputs.push((src, dst));
            if !input_index.contains_key(&src) {
                input_slots.push(TensorSlot::new(
                    format!("x{}", input_slots.len()),
                    slot.desc.clone(),
                ));
            }
            input_index.entry(src).or_default().push(dst);
        }
        for (i, slot) in op.outputs.iter().enumerate() {
            let src = id.out(i);
            let external: Vec<InAnchor> = graph
                .consumers(src)
                .filter(|dst| !members.contains(&dst.node))
                .collect();
            if external.is_empty() {
                continue;
            }
            out_edges.extend(external.iter().map(|dst| (output_map.len(), *dst)));
            external_outputs.extend(external.into_iter().map(|dst| (src, dst)));
            output_slots.push(TensorSlot::new(
                format!("y{}", output_slots.len()),
                slot.desc.clone(),
            ));
            output_map.push(src);
        }
    }
    let control_edges: Vec<(NodeId, NodeId)> = graph
        .control_edges()
        .filter(|(a, b)| members.contains(a) || members.contains(b))
        .collect();
    let input_producers: Vec<OutAnchor> = input_index.keys().copied().collect();
    let input_map: Vec<Vec<InAnchor>> = input_index.into_values().collect();

    let Some(&head) = scope.members.first() else {
        return Err(GraphError::EmptyScope(scope.id));
    };
    let first = graph.node(head)?;
    let name = scope
        .members
        .iter()
        .map(|id| graph.node(*id).map(|n| n.name.as_str()))
        .collect::<Result<Vec<_>, _>>()?
        .join("_");
    let mut op = OpDesc::new(op_types::FUSED);
    op.inputs = input_slots;
    op.outputs = output_slots;
    op.scope_id = Some(scope.id);
    op.kernel = Some(KernelBinding {
        candidate: scope.pattern.to_string(),
        column: 0,
        backend: first
            .op
            .kernel
            .as_ref()
            .map_or(BackendKind::Vector, |k| k.backend),
        compiled: None,
    });
    for key in FIRST_MEMBER_ATTRS {
        if let Some(v) = first.op.attr(key) {
            op.attrs.insert(key.to_owned(), v.clone());
        }
    }
    let input_anchors: Vec<(NodeId, usize)> = input_map
        .iter()
        .map(|dsts| (dsts[0].node, dsts[0].index))
        .collect();
    let output_anchors: Vec<(NodeId, usize)> =
        output_map.iter().map(|src| (src.node, src.index)).collect();
    if let Some(v) = slot_offsets(graph, first, &input_anchors, attr_keys::INPUT_OFFSETS)? {
        op.attrs.insert(attr_keys::INPUT_OFFSETS.to_owned(), v);
    }
    if let Some(v) = slot_offsets(graph, first, &output_anchors, attr_keys::OUTPUT_OFFSETS)? {
        op.attrs.insert(attr_keys::OUTPUT_OFFSETS.to_owned(), v);
    }

    let lifted: BTreeSet<(Option<NodeId>, Option<NodeId>)> = control_edges
        .iter()
        .filter_map(|&(a, b)| match (members.contains(&a), members.contains(&b)) {
            (true, false) => Some((None, Some(b))),
            (false, true) => Some((Some(a), None)),
            _ => None,
        })
        .collect();
    let mut removed = Vec::with_capacity(scope.members.len());
    for &id in &scope.members {
        removed.push(graph.remove_node(id)?);
    }
    let body = FusedBody {
        scope: scope.id,
        pattern: scope.pattern,
        members: removed,
        internal_edges,
        input_map,
        output_map,
        external_inputs,
        external_outputs,
        control_edges,
    };
    let member_names = body.member_names();
    op.fused = Some(Box::new(body));
    let fused = graph.add_node(name.as_str(), op);

    if let Err(e) = connect_fused(graph, fused, input_producers, out_edges, lifted) {
        log::warn!("Undoing merge of {}: {e}", scope.id);
        unmerge(graph, fused, accumulator)?;
        return Err(e);
    }
    accumulator.record(scope.pattern.memory(), &name, member_names);
    log::debug!(
        "Merged {} into {fused} ({} in, {} out)",
        scope.id,
        graph.node(fused)?.op.inputs.len(),
        graph.node(fused)?.op.outputs.len()
    );
    Ok(fused)
}

fn connect_fused(
    graph: &mut Graph,
    fused: NodeId,
    input_producers: Vec<OutAnchor>,
    out_edges: Vec<(usize, InAnchor)>,
    lifted: BTreeSet<(Option<NodeId>, Option<NodeId>)>,
) -> Result<(), GraphError> {
    for (i, src) in input_producers.into_iter().enumerate() {
        graph.add_data_edge(src, fused.input(i))?;
    }
    for (j, dst) in out_edges {
        graph.add_data_edge(fused.out(j), dst)?;
    }
    for (a, b) in lifted {
        graph.add_control_edge(a.unwrap_or(fused), b.unwrap_or(fused))?;
    }
    Ok(())
}

/// Dissolves a fused node, restoring its members under their original ids and every edge the
/// merge replaced. Returns the member ids, or an empty list if `fused` is not a fused node.
pub fn unmerge(
    graph: &mut Graph,
    fused: NodeId,
    accumulator: &mut MergeAccumulator,
) -> Result<Vec<NodeId>, GraphError> {
    let node = graph.node(fused)?;
    if node.op.fused.is_none() {
        return Ok(vec![]);
    }
    accumulator.forget(&node.name);
    let node = graph.remove_node(fused)?;
    let Some(body) = node.op.fused else {
        return Ok(vec![]);
    };
    let body = *body;

    let mut ids = Vec::with_capacity(body.members.len());
    for mut member in body.members {
        member.op.scope_id = None;
        ids.push(graph.restore_node(member)?);
    }
    let data_edges = body
        .internal_edges
        .iter()
        .chain(&body.external_inputs)
        .chain(&body.external_outputs);
    for &(src, dst) in data_edges {
        graph.add_data_edge(src, dst)?;
    }
    for &(a, b) in &body.control_edges {
        graph.add_control_edge(a, b)?;
    }
    log::debug!("Dissolved {} back into {} node(s)", body.scope, ids.len());
    Ok(ids)
}

/// Per-slot offsets for the fused node: the mapped member's value, else the first member's
/// value at the same position. `None` if no member carries the attribute.
fn slot_offsets(
    graph: &Graph,
    first: &Node,
    anchors: &[(NodeId, usize)],
    key: &str,
) -> Result<Option<AttrValue>, GraphError> {
    let fallback = first.op.attr(key).and_then(AttrValue::as_ints);
    let mut any = false;
    let mut offsets = Vec::with_capacity(anchors.len());
    for (position, &(member, index)) in anchors.iter().enumerate() {
        let own = graph
            .node(member)?
            .op
            .attr(key)
            .and_then(AttrValue::as_ints)
            .and_then(|v| v.get(index).copied());
        let value = own.or_else(|| fallback.and_then(|v| v.get(position).copied()));
        any |= value.is_some();
        offsets.push(value.unwrap_or(0));
    }
    Ok(any.then_some(AttrValue::Ints(offsets)))
}
