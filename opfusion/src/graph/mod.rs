//! An arena-backed operator graph.
//!
//! Nodes live in a `Vec<Option<Node>>` indexed by [NodeId]. Removing a node leaves a tombstone, so
//! ids are never reused and a removed node can later be restored into its own slot. Data edges
//! are kept in two indices keyed by anchor; nothing holds a reference into another node.

mod builder;
pub mod cycle;

pub use builder::GraphBuilder;

use serde::{Deserialize, Serialize};

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::{self, Display};

use crate::attr::AttrValue;
use crate::backend::CompiledKernel;
use crate::catalog::BackendKind;
use crate::fusion::FusedBody;
use crate::tensor::TensorDesc;

pub mod op_types {
    pub const DATA: &str = "Data";
    pub const CONST: &str = "Const";
    pub const NET_OUTPUT: &str = "NetOutput";
    pub const TRANS_DATA: &str = "TransData";
    pub const CAST: &str = "Cast";
    pub const IDENTITY: &str = "Identity";
    pub const FUSED: &str = "FusedOp";
}

/// Attribute keys with a fixed meaning across passes.
pub mod attr_keys {
    pub const TRANS_NODE: &str = "_trans_node";
    pub const STATIC_SHAPE: &str = "_static_shape";
    pub const MEM_TYPE: &str = "_mem_type";
    pub const INPUT_OFFSETS: &str = "_input_offsets";
    pub const OUTPUT_OFFSETS: &str = "_output_offsets";
    pub const ATOMIC_OUTPUT_INDEX: &str = "_atomic_output_index";
    pub const ATOMIC_CLEAN_POLICY: &str = "_atomic_clean_policy";
    pub const KERNEL_NAME: &str = "_kernel_name";
    pub const FUSION_OP_NAMES: &str = "_fusion_op_names";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct ScopeId(pub u32);

/// An output slot of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct OutAnchor {
    pub node: NodeId,
    pub index: usize,
}

/// An input slot of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct InAnchor {
    pub node: NodeId,
    pub index: usize,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum SlotDir {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TensorSlot {
    pub name: String,
    pub desc: TensorDesc,
}

/// The backend implementation chosen for a node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct KernelBinding {
    pub candidate: String,
    /// The column of the candidate's support table the node was judged against.
    pub column: usize,
    pub backend: BackendKind,
    pub compiled: Option<CompiledKernel>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OpDesc {
    pub op_type: String,
    pub inputs: Vec<TensorSlot>,
    pub outputs: Vec<TensorSlot>,
    pub attrs: BTreeMap<String, AttrValue>,
    pub scope_id: Option<ScopeId>,
    pub kernel: Option<KernelBinding>,
    pub fused: Option<Box<FusedBody>>,
    /// Indices into the owning graph's subgraphs (control-flow bodies).
    pub subgraphs: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpDesc,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Graph {
    pub name: String,
    /// Whether some input shapes are only known by range.
    pub dynamic_shape: bool,
    nodes: Vec<Option<Node>>,
    producers: BTreeMap<InAnchor, OutAnchor>,
    consumers: BTreeMap<OutAnchor, BTreeSet<InAnchor>>,
    control: BTreeSet<(NodeId, NodeId)>,
    subgraphs: Vec<Graph>,
    version: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node {0} does not exist")]
    NodeNotFound(NodeId),
    #[error("Node {node} has no {dir} slot {index}")]
    SlotOutOfRange {
        node: NodeId,
        index: usize,
        dir: SlotDir,
    },
    #[error("Input {0} already has a producer")]
    InputAlreadyConnected(InAnchor),
    #[error("Cannot restore node {0}: slot is occupied")]
    SlotOccupied(NodeId),
    #[error("Node {node} refers to missing subgraph {index}")]
    MissingSubgraph { node: NodeId, index: usize },
    #[error("Graph contains a cycle through {0} node(s)")]
    Cycle(usize),
    #[error("Fusion scope {0} has no members")]
    EmptyScope(ScopeId),
    #[error("Fusion scope {scope} lists {node} more than once")]
    DuplicateScopeMember { scope: ScopeId, node: NodeId },
}

impl NodeId {
    pub fn out(self, index: usize) -> OutAnchor {
        OutAnchor { node: self, index }
    }

    pub fn input(self, index: usize) -> InAnchor {
        InAnchor { node: self, index }
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope{}", self.0)
    }
}

impl Display for InAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:in{}", self.node, self.index)
    }
}

impl Display for OutAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:out{}", self.node, self.index)
    }
}

impl TensorSlot {
    pub fn new(name: impl Into<String>, desc: TensorDesc) -> Self {
        TensorSlot {
            name: name.into(),
            desc,
        }
    }
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        OpDesc {
            op_type: op_type.into(),
            inputs: vec![],
            outputs: vec![],
            attrs: BTreeMap::new(),
            scope_id: None,
            kernel: None,
            fused: None,
            subgraphs: vec![],
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, desc: TensorDesc) -> Self {
        self.inputs.push(TensorSlot::new(name, desc));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, desc: TensorDesc) -> Self {
        self.outputs.push(TensorSlot::new(name, desc));
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// Graph-boundary and constant ops, which never need a kernel.
    pub fn is_framework(&self) -> bool {
        matches!(
            self.op_type.as_str(),
            op_types::DATA | op_types::CONST | op_types::NET_OUTPUT
        )
    }

    /// Whether the op is compiled to a device kernel: not a framework op and not a
    /// control-flow op owning subgraphs.
    pub fn needs_kernel(&self) -> bool {
        !self.is_framework() && self.subgraphs.is_empty()
    }

    pub fn is_trans(&self) -> bool {
        self.attr(attr_keys::TRANS_NODE)
            .and_then(AttrValue::as_bool)
            .unwrap_or(false)
    }

    pub fn is_compiled(&self) -> bool {
        self.kernel.as_ref().is_some_and(|k| k.compiled.is_some())
    }
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A counter bumped by every change to nodes or edges (not by changes to a node's
    /// [OpDesc]).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn add_node(&mut self, name: impl Into<String>, op: OpDesc) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("node count fits in u32"));
        self.nodes.push(Some(Node {
            id,
            name: name.into(),
            op,
        }));
        self.version += 1;
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(GraphError::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Live node ids, ascending.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes().map(|n| n.id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().flatten()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> + '_ {
        self.nodes.iter_mut().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|n| n.name == name).map(|n| n.id)
    }

    /// Removes a node together with every data and control edge touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        self.node(id)?;
        let inputs: Vec<InAnchor> = self
            .producers
            .keys()
            .filter(|a| a.node == id)
            .copied()
            .collect();
        for dst in inputs {
            self.remove_data_edge(dst);
        }
        let outputs: Vec<OutAnchor> = self
            .consumers
            .keys()
            .filter(|a| a.node == id)
            .copied()
            .collect();
        for src in outputs {
            for dst in self.consumers.remove(&src).unwrap_or_default() {
                self.producers.remove(&dst);
            }
        }
        self.control.retain(|(a, b)| *a != id && *b != id);
        self.version += 1;
        self.nodes[id.0 as usize]
            .take()
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Puts a previously removed node back into its own slot. Edges are not restored.
    pub fn restore_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let id = node.id;
        let slot = self
            .nodes
            .get_mut(id.0 as usize)
            .ok_or(GraphError::NodeNotFound(id))?;
        if slot.is_some() {
            return Err(GraphError::SlotOccupied(id));
        }
        *slot = Some(node);
        self.version += 1;
        Ok(id)
    }

    fn check_slot(&self, node: NodeId, index: usize, dir: SlotDir) -> Result<(), GraphError> {
        let op = &self.node(node)?.op;
        let count = match dir {
            SlotDir::Input => op.inputs.len(),
            SlotDir::Output => op.outputs.len(),
        };
        if index >= count {
            return Err(GraphError::SlotOutOfRange { node, index, dir });
        }
        Ok(())
    }

    pub fn add_data_edge(&mut self, src: OutAnchor, dst: InAnchor) -> Result<(), GraphError> {
        self.check_slot(src.node, src.index, SlotDir::Output)?;
        self.check_slot(dst.node, dst.index, SlotDir::Input)?;
        if self.producers.contains_key(&dst) {
            return Err(GraphError::InputAlreadyConnected(dst));
        }
        self.producers.insert(dst, src);
        self.consumers.entry(src).or_default().insert(dst);
        self.version += 1;
        Ok(())
    }

    /// Disconnects an input, returning its former producer.
    pub fn remove_data_edge(&mut self, dst: InAnchor) -> Option<OutAnchor> {
        let src = self.producers.remove(&dst)?;
        if let Some(set) = self.consumers.get_mut(&src) {
            set.remove(&dst);
            if set.is_empty() {
                self.consumers.remove(&src);
            }
        }
        self.version += 1;
        Some(src)
    }

    pub fn producer(&self, dst: InAnchor) -> Option<OutAnchor> {
        self.producers.get(&dst).copied()
    }

    pub fn consumers(&self, src: OutAnchor) -> impl Iterator<Item = InAnchor> + '_ {
        self.consumers.get(&src).into_iter().flatten().copied()
    }

    pub fn consumer_count(&self, src: OutAnchor) -> usize {
        self.consumers.get(&src).map_or(0, BTreeSet::len)
    }

    /// All data edges, ordered by consumer anchor.
    pub fn data_edges(&self) -> impl Iterator<Item = (OutAnchor, InAnchor)> + '_ {
        self.producers.iter().map(|(dst, src)| (*src, *dst))
    }

    pub fn add_control_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.node(from)?;
        self.node(to)?;
        if self.control.insert((from, to)) {
            self.version += 1;
        }
        Ok(())
    }

    pub fn remove_control_edge(&mut self, from: NodeId, to: NodeId) -> bool {
        let removed = self.control.remove(&(from, to));
        if removed {
            self.version += 1;
        }
        removed
    }

    pub fn control_edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.control.iter().copied()
    }

    /// Data and control successors of a node, ascending and deduplicated.
    pub fn successors(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut out: BTreeSet<NodeId> = self
            .consumers
            .range(id.out(0)..=id.out(usize::MAX))
            .flat_map(|(_, dsts)| dsts.iter().map(|d| d.node))
            .collect();
        out.extend(
            self.control
                .range((id, NodeId(0))..=(id, NodeId(u32::MAX)))
                .map(|(_, b)| *b),
        );
        out
    }

    /// Data and control predecessors of a node, ascending and deduplicated.
    pub fn predecessors(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut out: BTreeSet<NodeId> = self
            .producers
            .range(id.input(0)..=id.input(usize::MAX))
            .map(|(_, src)| src.node)
            .collect();
        out.extend(self.control.iter().filter(|(_, b)| *b == id).map(|(a, _)| *a));
        out
    }

    /// Returns live node ids in a topological order (data and control edges). Ties are broken
    /// by ascending id, so the order is deterministic.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut indegree: BTreeMap<NodeId, usize> = self.node_ids().map(|id| (id, 0)).collect();
        let mut succs: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let edges = self
            .data_edges()
            .map(|(src, dst)| (src.node, dst.node))
            .chain(self.control_edges());
        for (a, b) in edges {
            *indegree.entry(b).or_default() += 1;
            succs.entry(a).or_default().push(b);
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for s in succs.get(&id).into_iter().flatten() {
                let d = indegree.get_mut(s).expect("successor is a live node");
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(*s));
                }
            }
        }
        if order.len() != indegree.len() {
            return Err(GraphError::Cycle(indegree.len() - order.len()));
        }
        Ok(order)
    }

    pub fn is_acyclic(&self) -> bool {
        self.topo_order().is_ok()
    }

    /// Checks the structural invariants: every edge joins live nodes at in-range slots, every
    /// subgraph reference resolves, and the graph (and each subgraph) is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (src, dst) in self.data_edges() {
            self.check_slot(src.node, src.index, SlotDir::Output)?;
            self.check_slot(dst.node, dst.index, SlotDir::Input)?;
        }
        for (a, b) in self.control_edges() {
            self.node(a)?;
            self.node(b)?;
        }
        for node in self.nodes() {
            for &index in &node.op.subgraphs {
                if index >= self.subgraphs.len() {
                    return Err(GraphError::MissingSubgraph {
                        node: node.id,
                        index,
                    });
                }
            }
        }
        self.topo_order()?;
        for sub in &self.subgraphs {
            sub.validate()?;
        }
        Ok(())
    }

    pub fn add_subgraph(&mut self, graph: Graph) -> usize {
        self.subgraphs.push(graph);
        self.version += 1;
        self.subgraphs.len() - 1
    }

    pub fn subgraphs(&self) -> &[Graph] {
        &self.subgraphs
    }

    pub fn subgraphs_mut(&mut self) -> &mut [Graph] {
        &mut self.subgraphs
    }

    /// The descriptor of the tensor produced at `src`.
    pub fn output_desc(&self, src: OutAnchor) -> Result<&TensorDesc, GraphError> {
        self.check_slot(src.node, src.index, SlotDir::Output)?;
        Ok(&self.node(src.node)?.op.outputs[src.index].desc)
    }

    /// The descriptor of the tensor consumed at `dst`.
    pub fn input_desc(&self, dst: InAnchor) -> Result<&TensorDesc, GraphError> {
        self.check_slot(dst.node, dst.index, SlotDir::Input)?;
        Ok(&self.node(dst.node)?.op.inputs[dst.index].desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{static_shape, Dtype, Format};

    fn desc() -> TensorDesc {
        TensorDesc::new(static_shape(&[4]), Dtype::Float16, Format::Nd)
    }

    fn unary(g: &mut Graph, name: &str) -> NodeId {
        g.add_node(
            name,
            OpDesc::new("Relu")
                .with_input("x", desc())
                .with_output("y", desc()),
        )
    }

    #[test]
    fn test_topo_order_is_deterministic_and_respects_edges() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let b = unary(&mut g, "b");
        let c = unary(&mut g, "c");
        g.add_data_edge(c.out(0), a.input(0)).unwrap();
        g.add_control_edge(a, b).unwrap();
        assert_eq!(g.topo_order().unwrap(), vec![c, a, b]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let b = unary(&mut g, "b");
        g.add_data_edge(a.out(0), b.input(0)).unwrap();
        g.add_control_edge(b, a).unwrap();
        assert_eq!(g.topo_order(), Err(GraphError::Cycle(2)));
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_input_accepts_one_producer() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let b = unary(&mut g, "b");
        let c = unary(&mut g, "c");
        g.add_data_edge(a.out(0), c.input(0)).unwrap();
        assert_eq!(
            g.add_data_edge(b.out(0), c.input(0)),
            Err(GraphError::InputAlreadyConnected(c.input(0)))
        );
    }

    #[test]
    fn test_out_of_range_slot_is_rejected() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let b = unary(&mut g, "b");
        assert!(matches!(
            g.add_data_edge(a.out(1), b.input(0)),
            Err(GraphError::SlotOutOfRange {
                dir: SlotDir::Output,
                ..
            })
        ));
    }

    #[test]
    fn test_remove_and_restore_keeps_ids_stable() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let b = unary(&mut g, "b");
        g.add_data_edge(a.out(0), b.input(0)).unwrap();
        g.add_control_edge(a, b).unwrap();
        let removed = g.remove_node(a).unwrap();
        assert!(!g.contains(a));
        assert_eq!(g.producer(b.input(0)), None);
        assert_eq!(g.control_edges().count(), 0);

        let c = unary(&mut g, "c");
        assert_ne!(c, a);
        assert_eq!(g.restore_node(removed).unwrap(), a);
        assert!(matches!(
            g.restore_node(g.node(a).unwrap().clone()),
            Err(GraphError::SlotOccupied(_))
        ));
    }

    #[test]
    fn test_version_tracks_topology_only() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let v = g.version();
        g.node_mut(a).unwrap().op.attrs.clear();
        assert_eq!(g.version(), v);
        unary(&mut g, "b");
        assert!(g.version() > v);
    }

    #[test]
    fn test_successors_and_predecessors() {
        let mut g = Graph::new("g");
        let a = unary(&mut g, "a");
        let b = unary(&mut g, "b");
        let c = unary(&mut g, "c");
        g.add_data_edge(a.out(0), b.input(0)).unwrap();
        g.add_control_edge(a, c).unwrap();
        assert_eq!(g.successors(a), BTreeSet::from([b, c]));
        assert_eq!(g.predecessors(c), BTreeSet::from([a]));
        assert_eq!(g.predecessors(b), BTreeSet::from([a]));
    }

    #[test]
    fn test_missing_subgraph_is_invalid() {
        let mut g = Graph::new("g");
        let mut op = OpDesc::new("If");
        op.subgraphs.push(0);
        let n = g.add_node("if", op);
        assert_eq!(
            g.validate(),
            Err(GraphError::MissingSubgraph { node: n, index: 0 })
        );
        g.add_subgraph(Graph::new("then"));
        assert_eq!(g.validate(), Ok(()));
    }
}
