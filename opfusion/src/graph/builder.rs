use crate::attr::{AttrValue, ConstTensor};
use crate::common::{static_shape, Dtype, Format};
use crate::graph::{op_types, Graph, GraphError, NodeId, OpDesc, OutAnchor};
use crate::tensor::TensorDesc;

/// Incrementally builds a [Graph].
///
/// Input slot descriptors are copied from the producing output. Slots are named `x` / `y` for
/// single-input / single-output ops and `x1, x2, ...` / `y1, y2, ...` otherwise. The first
/// error encountered is returned from [GraphBuilder::build].
pub struct GraphBuilder {
    graph: Graph,
    error: Option<GraphError>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        GraphBuilder {
            graph: Graph::new(name),
            error: None,
        }
    }

    pub fn dynamic_shape(mut self, dynamic: bool) -> Self {
        self.graph.dynamic_shape = dynamic;
        self
    }

    pub fn data(&mut self, name: impl Into<String>, desc: TensorDesc) -> NodeId {
        self.graph
            .add_node(name, OpDesc::new(op_types::DATA).with_output("y", desc))
    }

    pub fn constant(&mut self, name: impl Into<String>, value: ConstTensor) -> NodeId {
        let desc = TensorDesc::new(static_shape(&value.shape), value.dtype, Format::Nd);
        self.graph.add_node(
            name,
            OpDesc::new(op_types::CONST)
                .with_output("y", desc)
                .with_attr("value", AttrValue::Tensor(value)),
        )
    }

    pub fn op(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: &[OutAnchor],
        outputs: Vec<TensorDesc>,
    ) -> NodeId {
        let mut op = OpDesc::new(op_type);
        for (i, src) in inputs.iter().enumerate() {
            let desc = self.producer_desc(*src);
            op = op.with_input(slot_name("x", i, inputs.len()), desc);
        }
        let output_count = outputs.len();
        for (i, desc) in outputs.into_iter().enumerate() {
            op = op.with_output(slot_name("y", i, output_count), desc);
        }
        let id = self.graph.add_node(name, op);
        self.connect_inputs(id, inputs);
        id
    }

    /// Adds a node with explicit slot names and descriptors, connecting its inputs in order.
    pub fn op_desc(&mut self, name: impl Into<String>, op: OpDesc, inputs: &[OutAnchor]) -> NodeId {
        let id = self.graph.add_node(name, op);
        self.connect_inputs(id, inputs);
        id
    }

    pub fn output(&mut self, name: impl Into<String>, inputs: &[OutAnchor]) -> NodeId {
        let mut op = OpDesc::new(op_types::NET_OUTPUT);
        for (i, src) in inputs.iter().enumerate() {
            let desc = self.producer_desc(*src);
            op = op.with_input(format!("x{i}"), desc);
        }
        let id = self.graph.add_node(name, op);
        self.connect_inputs(id, inputs);
        id
    }

    pub fn attr(&mut self, node: NodeId, key: impl Into<String>, value: AttrValue) {
        match self.graph.node_mut(node) {
            Ok(n) => {
                n.op.attrs.insert(key.into(), value);
            }
            Err(e) => self.record(e),
        }
    }

    pub fn control(&mut self, from: NodeId, to: NodeId) {
        if let Err(e) = self.graph.add_control_edge(from, to) {
            self.record(e);
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.graph.validate()?;
        Ok(self.graph)
    }

    fn producer_desc(&mut self, src: OutAnchor) -> TensorDesc {
        match self.graph.output_desc(src) {
            Ok(d) => d.clone(),
            Err(e) => {
                self.record(e);
                TensorDesc::new(static_shape(&[1]), Dtype::Undefined, Format::Reserved)
            }
        }
    }

    fn connect_inputs(&mut self, id: NodeId, inputs: &[OutAnchor]) {
        for (i, src) in inputs.iter().enumerate() {
            if let Err(e) = self.graph.add_data_edge(*src, id.input(i)) {
                self.record(e);
            }
        }
    }

    fn record(&mut self, error: GraphError) {
        self.error.get_or_insert(error);
    }
}

fn slot_name(prefix: &str, index: usize, count: usize) -> String {
    if count == 1 {
        prefix.to_owned()
    } else {
        format!("{prefix}{}", index + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_copies_producer_descs_and_names_slots() {
        let desc = TensorDesc::new(static_shape(&[2, 3]), Dtype::Float16, Format::Nd);
        let mut b = GraphBuilder::new("g");
        let x = b.data("x", desc.clone());
        let y = b.data("y", desc.clone());
        let add = b.op("add", "Add", &[x.out(0), y.out(0)], vec![desc.clone()]);
        b.output("out", &[add.out(0)]);
        let g = b.build().unwrap();

        let add = g.node(add).unwrap();
        assert_eq!(add.op.inputs[0].name, "x1");
        assert_eq!(add.op.inputs[1].name, "x2");
        assert_eq!(add.op.outputs[0].name, "y");
        assert_eq!(add.op.inputs[1].desc, desc);
    }

    #[test]
    fn test_builder_reports_first_error() {
        let desc = TensorDesc::new(static_shape(&[2]), Dtype::Float16, Format::Nd);
        let mut b = GraphBuilder::new("g");
        let x = b.data("x", desc.clone());
        b.op("relu", "Relu", &[x.out(3)], vec![desc]);
        assert!(matches!(b.build(), Err(GraphError::SlotOutOfRange { .. })));
    }
}
