use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::Catalog;
use crate::graph::{Graph, NodeId, SlotDir};
use crate::tensor::TensorDesc;

/// One tensor slot of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRef {
    pub node: NodeId,
    pub dir: SlotDir,
    pub index: usize,
}

/// Equivalence classes of tensor slots that must share a layout.
///
/// Built from the `ref_pairs` of each node's bound candidate (an input aliased by an output)
/// and from the producer of every aliased input. Only valid for the graph version it was built
/// for.
#[derive(Debug, Clone)]
pub struct ReflectionRelations {
    version: u64,
    parent: BTreeMap<SlotRef, SlotRef>,
}

impl SlotRef {
    pub fn input(node: NodeId, index: usize) -> Self {
        SlotRef {
            node,
            dir: SlotDir::Input,
            index,
        }
    }

    pub fn output(node: NodeId, index: usize) -> Self {
        SlotRef {
            node,
            dir: SlotDir::Output,
            index,
        }
    }

    pub fn desc<'a>(&self, graph: &'a Graph) -> Option<&'a TensorDesc> {
        let op = &graph.node(self.node).ok()?.op;
        let slots = match self.dir {
            SlotDir::Input => &op.inputs,
            SlotDir::Output => &op.outputs,
        };
        slots.get(self.index).map(|s| &s.desc)
    }

    pub fn desc_mut<'a>(&self, graph: &'a mut Graph) -> Option<&'a mut TensorDesc> {
        let op = &mut graph.node_mut(self.node).ok()?.op;
        let slots = match self.dir {
            SlotDir::Input => &mut op.inputs,
            SlotDir::Output => &mut op.outputs,
        };
        slots.get_mut(self.index).map(|s| &mut s.desc)
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.node, self.dir, self.index)
    }
}

impl ReflectionRelations {
    pub fn build(graph: &Graph, catalog: &Catalog) -> Self {
        let mut relations = ReflectionRelations {
            version: graph.version(),
            parent: BTreeMap::new(),
        };
        for node in graph.nodes() {
            let Some(binding) = &node.op.kernel else {
                continue;
            };
            let Some(candidate) = catalog.candidate(&node.op.op_type, &binding.candidate) else {
                continue;
            };
            for &(input_decl, output_decl) in &candidate.ref_pairs {
                let inputs: Vec<usize> = node
                    .op
                    .inputs
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| candidate.inputs[input_decl].binds(&s.name))
                    .map(|(i, _)| i)
                    .collect();
                let outputs: Vec<usize> = node
                    .op
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| candidate.outputs[output_decl].binds(&s.name))
                    .map(|(i, _)| i)
                    .collect();
                for &i in &inputs {
                    let input = SlotRef::input(node.id, i);
                    for &o in &outputs {
                        relations.union(input, SlotRef::output(node.id, o));
                    }
                    if let Some(src) = graph.producer(node.id.input(i)) {
                        relations.union(input, SlotRef::output(src.node, src.index));
                    }
                }
            }
        }
        relations
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_current(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    pub fn same_class(&self, a: SlotRef, b: SlotRef) -> bool {
        self.find(a) == self.find(b)
    }

    /// Classes with at least two members. Members and classes are sorted.
    pub fn classes(&self) -> Vec<Vec<SlotRef>> {
        let mut by_root: BTreeMap<SlotRef, Vec<SlotRef>> = BTreeMap::new();
        for &slot in self.parent.keys() {
            by_root.entry(self.find(slot)).or_default().push(slot);
        }
        let mut classes: Vec<Vec<SlotRef>> =
            by_root.into_values().filter(|c| c.len() >= 2).collect();
        classes.sort();
        classes
    }

    fn find(&self, mut slot: SlotRef) -> SlotRef {
        while let Some(&p) = self.parent.get(&slot) {
            if p == slot {
                break;
            }
            slot = p;
        }
        slot
    }

    fn union(&mut self, a: SlotRef, b: SlotRef) {
        self.parent.entry(a).or_insert(a);
        self.parent.entry(b).or_insert(b);
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(child, root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendKind, KernelCandidate, SlotDecl};
    use crate::common::Dtype;
    use crate::graph::GraphBuilder;
    use crate::testing::{bind_all, f16};

    fn catalog() -> Catalog {
        let mut b = Catalog::builder();
        b.add(
            KernelCandidate::new("assign_add", "AssignAdd", BackendKind::Vector)
                .input(SlotDecl::required("x1", vec![Dtype::Float16]))
                .input(SlotDecl::required("x2", vec![Dtype::Float16]))
                .output(SlotDecl::required("y", vec![Dtype::Float16]))
                .ref_pair(0, 0),
        )
        .add(
            KernelCandidate::new("relu", "Relu", BackendKind::Vector)
                .input(SlotDecl::required("x", vec![Dtype::Float16]))
                .output(SlotDecl::required("y", vec![Dtype::Float16])),
        );
        b.build().unwrap()
    }

    #[test]
    fn test_ref_pairs_link_input_output_and_producer() {
        let mut gb = GraphBuilder::new("g");
        let x = gb.data("x", f16(&[4]));
        let relu = gb.op("relu", "Relu", &[x.out(0)], vec![f16(&[4])]);
        let acc = gb.op("acc", "AssignAdd", &[relu.out(0), x.out(0)], vec![f16(&[4])]);
        gb.output("out", &[acc.out(0)]);
        let mut g = gb.build().unwrap();
        let catalog = catalog();
        bind_all(&mut g, &catalog);

        let r = ReflectionRelations::build(&g, &catalog);
        assert!(r.is_current(&g));
        assert_eq!(
            r.classes(),
            vec![vec![
                SlotRef::output(relu, 0),
                SlotRef::input(acc, 0),
                SlotRef::output(acc, 0),
            ]]
        );
        assert!(!r.same_class(SlotRef::input(acc, 1), SlotRef::output(acc, 0)));
        assert_eq!(SlotRef::output(acc, 0).to_string(), format!("{acc}:output0"));
    }

    #[test]
    fn test_relations_go_stale_on_topology_change() {
        let mut gb = GraphBuilder::new("g");
        let x = gb.data("x", f16(&[4]));
        gb.output("out", &[x.out(0)]);
        let mut g = gb.build().unwrap();
        let r = ReflectionRelations::build(&g, &catalog());
        assert!(r.classes().is_empty());
        touch_topology(&mut g);
        assert!(!r.is_current(&g));
    }

    fn touch_topology(g: &mut Graph) {
        let x = g.find_by_name("x").unwrap();
        let out = g.find_by_name("out").unwrap();
        g.add_control_edge(x, out).unwrap();
    }
}
