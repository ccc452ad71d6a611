use std::sync::Arc;

use opfusion::backend::{DeviceProfile, LoopbackCompiler, MemoryClass};
use opfusion::catalog::{BackendKind, Catalog, FusionKind, KernelCandidate, RangeLimit, SlotDecl};
use opfusion::common::{static_shape, Dim, DimRange, Dtype, Format, Shape};
use opfusion::config::PipelineConfig;
use opfusion::fusion::PatternKind;
use opfusion::generalize::GeneralizeOutcome;
use opfusion::graph::{attr_keys, op_types, Graph, GraphBuilder};
use opfusion::pipeline::{CompileReport, Pipeline, Warning};
use opfusion::propagate::FormatJudge;
use opfusion::tensor::TensorDesc;

fn elemwise(
    name: &str,
    op_type: &str,
    inputs: &[&str],
    dtypes: Vec<Dtype>,
    formats: Option<Vec<Format>>,
) -> KernelCandidate {
    let slot = |slot_name: &str| {
        let decl = SlotDecl::required(slot_name, dtypes.clone());
        match &formats {
            Some(f) => decl.with_formats(f.clone()),
            None => decl,
        }
    };
    let mut c = KernelCandidate::new(name, op_type, BackendKind::Vector)
        .with_fusion_kind(FusionKind::Elemwise);
    for input in inputs {
        c = c.input(slot(input));
    }
    c.output(slot("y"))
}

fn desc(dims: &[u64], dtype: Dtype, format: Format) -> TensorDesc {
    TensorDesc::new(static_shape(dims), dtype, format)
}

fn compile(
    graph: &mut Graph,
    catalog: Catalog,
    compiler: Arc<LoopbackCompiler>,
    config: &PipelineConfig,
) -> CompileReport {
    let pipeline = Pipeline::new(
        Arc::new(catalog),
        DeviceProfile::new("test", [MemoryClass::Ub]),
        compiler,
    );
    pipeline.compile(graph, config).unwrap()
}

fn nhwc_catalog() -> Catalog {
    let nhwc = || Some(vec![Format::Nhwc]);
    let mut b = Catalog::builder();
    b.add(elemwise("add", "Add", &["x1", "x2"], vec![Dtype::Float16], nhwc()))
        .add(elemwise("relu", "Relu", &["x"], vec![Dtype::Float16], nhwc()));
    b.build().unwrap()
}

fn add_relu() -> Graph {
    let t = || desc(&[1, 4, 4, 16], Dtype::Float16, Format::Nhwc);
    let mut gb = GraphBuilder::new("add_relu");
    let x = gb.data("x", t());
    let y = gb.data("y", t());
    let add = gb.op("add", "Add", &[x.out(0), y.out(0)], vec![t()]);
    let relu = gb.op("relu", "Relu", &[add.out(0)], vec![t()]);
    gb.output("out", &[relu.out(0)]);
    gb.build().unwrap()
}

fn fp32_then_fp16() -> (Graph, Catalog) {
    let mut b = Catalog::builder();
    b.add(elemwise("exp_fp32", "Exp", &["x"], vec![Dtype::Float32], None))
        .add(elemwise("relu_fp16", "Relu", &["x"], vec![Dtype::Float16], None));
    let catalog = b.build().unwrap();

    let mut gb = GraphBuilder::new("mixed");
    let x = gb.data("x", desc(&[64], Dtype::Float32, Format::Nd));
    let exp = gb.op("exp", "Exp", &[x.out(0)], vec![desc(&[64], Dtype::Float32, Format::Nd)]);
    let relu = gb.op(
        "relu",
        "Relu",
        &[exp.out(0)],
        vec![desc(&[64], Dtype::Float16, Format::Nd)],
    );
    gb.output("out", &[relu.out(0)]);
    (gb.build().unwrap(), catalog)
}

#[test]
fn test_matching_layouts_need_no_conversion() {
    let mut g = add_relu();
    let report = compile(
        &mut g,
        nhwc_catalog(),
        Arc::new(LoopbackCompiler::new()),
        &PipelineConfig::default(),
    );

    assert_eq!(report.judge.trans_inserted, 0);
    assert_eq!(report.trans_nodes, 0);
    for node in g.nodes().filter(|n| n.op.kernel.is_some()) {
        for slot in node.op.inputs.iter().chain(&node.op.outputs) {
            assert_eq!(slot.desc.dtype, Dtype::Float16);
            assert_eq!(slot.desc.format, Format::Nhwc);
        }
    }
}

#[test]
fn test_dtype_boundary_gets_one_cast() {
    let (mut g, catalog) = fp32_then_fp16();
    let report = compile(
        &mut g,
        catalog,
        Arc::new(LoopbackCompiler::new()),
        &PipelineConfig::default(),
    );

    assert_eq!(report.judge.trans_inserted, 1);
    let casts: Vec<_> = g
        .nodes()
        .filter(|n| n.op.op_type == op_types::CAST)
        .collect();
    assert_eq!(casts.len(), 1);
    let exp = g.find_by_name("exp").unwrap();
    let relu = g.find_by_name("relu").unwrap();
    assert_eq!(g.producer(casts[0].id.input(0)), Some(exp.out(0)));
    assert_eq!(g.producer(relu.input(0)), Some(casts[0].id.out(0)));
    assert_eq!(casts[0].op.outputs[0].desc.dtype, Dtype::Float16);
}

#[test]
fn test_judging_twice_changes_nothing() {
    let (mut g, catalog) = fp32_then_fp16();
    FormatJudge::new(&catalog, Default::default())
        .run(&mut g)
        .unwrap();
    let edges: Vec<_> = g.data_edges().collect();
    let descs: Vec<_> = g
        .nodes()
        .flat_map(|n| n.op.inputs.iter().chain(&n.op.outputs))
        .map(|s| (s.desc.dtype, s.desc.format))
        .collect();

    let summary = FormatJudge::new(&catalog, Default::default())
        .run(&mut g)
        .unwrap();
    assert_eq!(summary.trans_inserted, 0);
    assert_eq!(g.data_edges().collect::<Vec<_>>(), edges);
    let after: Vec<_> = g
        .nodes()
        .flat_map(|n| n.op.inputs.iter().chain(&n.op.outputs))
        .map(|s| (s.desc.dtype, s.desc.format))
        .collect();
    assert_eq!(after, descs);
}

#[test]
fn test_judged_kernels_come_from_the_catalog() {
    let mut g = add_relu();
    let catalog = nhwc_catalog();
    FormatJudge::new(&catalog, Default::default())
        .run(&mut g)
        .unwrap();
    for node in g.nodes().filter(|n| n.op.needs_kernel() && !n.op.is_trans()) {
        let kernel = node.op.kernel.as_ref().unwrap();
        assert!(catalog
            .candidate(&node.op.op_type, &kernel.candidate)
            .is_some());
    }
}

#[test]
fn test_rejected_fusion_falls_back_to_single_kernels() {
    let t = || desc(&[32], Dtype::Float16, Format::Nd);
    let mut gb = GraphBuilder::new("chain");
    let x = gb.data("x", t());
    let y = gb.data("y", t());
    let a = gb.op("a", "Add", &[x.out(0), y.out(0)], vec![t()]);
    let b = gb.op("b", "Relu", &[a.out(0)], vec![t()]);
    let c = gb.op("c", "Mul", &[b.out(0), y.out(0)], vec![t()]);
    gb.output("out", &[c.out(0)]);
    let mut g = gb.build().unwrap();
    let edges_before: Vec<_> = g.data_edges().collect();

    let mut cb = Catalog::builder();
    for (name, op_type, inputs) in [
        ("add", "Add", &["x1", "x2"][..]),
        ("relu", "Relu", &["x"][..]),
        ("mul", "Mul", &["x1", "x2"][..]),
    ] {
        cb.add(elemwise(name, op_type, inputs, vec![Dtype::Float16], None));
    }
    let compiler = Arc::new(LoopbackCompiler::new().fail_fused_containing("Mul"));
    let report = compile(
        &mut g,
        cb.build().unwrap(),
        compiler.clone(),
        &PipelineConfig::default(),
    );

    assert_eq!(g.data_edges().collect::<Vec<_>>(), edges_before);
    for id in [a, b, c] {
        let node = g.node(id).unwrap();
        assert!(node.op.fused.is_none());
        assert!(node.op.is_compiled());
        assert!(node.op.attr(attr_keys::KERNEL_NAME).is_some());
    }
    assert!(g.nodes().all(|n| n.op.op_type != op_types::FUSED));
    assert!(matches!(
        &report.warnings[..],
        [Warning::FusionCompileFailure {
            pattern: PatternKind::ElemwiseChain,
            ..
        }]
    ));
    assert_eq!(compiler.requests(), ["a_b_c", "a", "b", "c"]);
}

fn dynamic_relu(limit: RangeLimit, static_dim: Option<i64>) -> (Graph, Catalog) {
    let mut b = Catalog::builder();
    b.add(
        elemwise("relu", "Relu", &["x"], vec![Dtype::Float16], None).with_range_limit(limit),
    );
    let catalog = b.build().unwrap();

    let t = || {
        let shape: Shape = [Dim::Unknown].into_iter().collect();
        TensorDesc::new(shape, Dtype::Float16, Format::Nd).with_range(vec![DimRange::unbounded(1)])
    };
    let mut gb = GraphBuilder::new("dynamic").dynamic_shape(true);
    let x = gb.data("x", t());
    if let Some(dim) = static_dim {
        gb.attr(x, attr_keys::STATIC_SHAPE, opfusion::attr::AttrValue::Ints(vec![dim]));
    }
    let relu = gb.op("relu", "Relu", &[x.out(0)], vec![t()]);
    gb.output("out", &[relu.out(0)]);
    (gb.build().unwrap(), catalog)
}

#[test]
fn test_unbounded_range_is_narrowed_to_the_kernel_limit() {
    let (mut g, catalog) = dynamic_relu(RangeLimit::new(128), None);
    let config = PipelineConfig::default();
    let report = compile(&mut g, catalog, Arc::new(LoopbackCompiler::new()), &config);

    let GeneralizeOutcome::Generalized { attempts, narrowed } = &report.generalization else {
        panic!("expected a generalized graph, got {:?}", report.generalization);
    };
    assert!(*attempts <= config.max_decent_attempts);
    let (_, _, range) = &narrowed[0];
    assert!(range.upper.is_some_and(|u| u <= 128));

    let relu = g.find_by_name("relu").unwrap();
    let input = &g.node(relu).unwrap().op.inputs[0].desc;
    assert!(input.shape_range[0].upper.is_some_and(|u| u <= 128));
    assert!(input.size_bytes.is_some());
    assert!(report.warnings.is_empty());
}

#[test]
fn test_static_shape_above_the_limit_falls_back() {
    let (mut g, catalog) = dynamic_relu(RangeLimit::new(128), Some(200));
    let report = compile(
        &mut g,
        catalog,
        Arc::new(LoopbackCompiler::new()),
        &PipelineConfig::default(),
    );

    assert!(matches!(
        report.generalization,
        GeneralizeOutcome::Pinned { axis: 0, .. }
    ));
    assert!(matches!(
        &report.warnings[..],
        [Warning::ShapeRangeExhausted { input, .. }] if input == "x"
    ));
    assert!(!g.dynamic_shape);
    let relu = g.find_by_name("relu").unwrap();
    assert_eq!(
        g.node(relu).unwrap().op.inputs[0].desc.shape_range,
        vec![DimRange::fixed(200)]
    );
}

#[test]
fn test_static_shape_of_wrong_rank_does_not_abort_compilation() {
    let mut b = Catalog::builder();
    b.add(
        elemwise("relu", "Relu", &["x"], vec![Dtype::Float16], None)
            .with_range_limit(RangeLimit::new(128)),
    );
    let t = || {
        let shape: Shape = [Dim::Known(4), Dim::Unknown].into_iter().collect();
        TensorDesc::new(shape, Dtype::Float16, Format::Nd)
            .with_range(vec![DimRange::fixed(4), DimRange::unbounded(1)])
    };
    let mut gb = GraphBuilder::new("short_static").dynamic_shape(true);
    let x = gb.data("x", t());
    gb.attr(x, attr_keys::STATIC_SHAPE, opfusion::attr::AttrValue::Ints(vec![4]));
    let relu = gb.op("relu", "Relu", &[x.out(0)], vec![t()]);
    gb.output("out", &[relu.out(0)]);
    let mut g = gb.build().unwrap();

    let report = compile(
        &mut g,
        b.build().unwrap(),
        Arc::new(LoopbackCompiler::new()),
        &PipelineConfig::default(),
    );
    assert!(matches!(
        report.generalization,
        GeneralizeOutcome::Generalized { .. }
    ));
    let input = &g.node(relu).unwrap().op.inputs[0].desc;
    assert_eq!(input.shape_range[1], DimRange::new(1, Some(128)));
}

#[test]
fn test_independent_graphs_compile_in_parallel() {
    let mut graphs: Vec<_> = (0..4).map(|_| add_relu()).collect();
    let pipeline = Pipeline::new(
        Arc::new(nhwc_catalog()),
        DeviceProfile::new("test", [MemoryClass::Ub]),
        Arc::new(LoopbackCompiler::new()),
    );
    let results = pipeline.compile_graphs(&mut graphs, &PipelineConfig::default());
    assert_eq!(results.len(), 4);
    for (graph, result) in graphs.iter().zip(results) {
        let report = result.unwrap();
        assert_eq!(report.stats.get("ElemwiseChain").applied, 1);
        assert!(graph
            .nodes()
            .filter(|n| n.op.needs_kernel())
            .all(|n| n.op.is_compiled()));
    }
}
