//! Fixtures shared by unit tests.

use crate::catalog::{BackendKind, Catalog, FusionKind, KernelCandidate, SlotDecl};
use crate::common::{static_shape, Dtype, Format};
use crate::graph::{Graph, KernelBinding};
use crate::tensor::TensorDesc;

pub fn f16(dims: &[u64]) -> TensorDesc {
    TensorDesc::new(static_shape(dims), Dtype::Float16, Format::Nd)
}

fn kernel(op_type: &str, inputs: &[&str], kind: FusionKind, backend: BackendKind) -> KernelCandidate {
    let dtypes = || vec![Dtype::Float16, Dtype::Float32];
    let mut c = KernelCandidate::new(op_type.to_lowercase(), op_type, backend).with_fusion_kind(kind);
    for name in inputs {
        c = c.input(SlotDecl::required(*name, dtypes()));
    }
    c.output(SlotDecl::required("y", dtypes()))
}

/// Unconstrained float kernels for a handful of common op types.
pub fn catalog() -> Catalog {
    let mut b = Catalog::builder();
    for op in ["Relu", "Sqrt", "Exp", "Cast"] {
        b.add(kernel(op, &["x"], FusionKind::Elemwise, BackendKind::Vector));
    }
    for op in ["Add", "Mul", "Sub"] {
        b.add(kernel(op, &["x1", "x2"], FusionKind::Elemwise, BackendKind::Vector));
    }
    b.add(kernel("ReduceSumD", &["x"], FusionKind::Reduce, BackendKind::Vector))
        .add(kernel("Conv2D", &["x1", "x2"], FusionKind::Convolution, BackendKind::Cube))
        .add(kernel("MatMul", &["x1", "x2"], FusionKind::Matmul, BackendKind::Cube))
        .add(kernel("TopK", &["x"], FusionKind::Opaque, BackendKind::Aicpu));
    b.build().unwrap()
}

/// Binds every kernel node to the first candidate of its op type, without any checks.
pub fn bind_all(graph: &mut Graph, catalog: &Catalog) {
    for node in graph.nodes_mut() {
        if node.op.is_framework() {
            continue;
        }
        if let Some(c) = catalog.candidates(&node.op.op_type).first() {
            node.op.kernel = Some(KernelBinding {
                candidate: c.name.clone(),
                column: 0,
                backend: c.backend,
                compiled: None,
            });
        }
    }
}
