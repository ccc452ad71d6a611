#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use std::path;
use std::sync::Arc;

use opfusion::backend::{DeviceProfile, LoopbackCompiler, MemoryClass};
use opfusion::catalog::{BackendKind, Catalog, FusionKind, KernelCandidate, RangeLimit, SlotDecl};
use opfusion::common::{static_shape, Dim, DimRange, Dtype, Format, Shape};
use opfusion::config::{BufferOptimize, BuildMode, BuildStep, PipelineConfig, PrecisionMode};
use opfusion::graph::{Graph, GraphBuilder};
use opfusion::pipeline::Pipeline;
use opfusion::pprint::{pprint_graph, pprint_report};
use opfusion::tensor::TensorDesc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value_t = PrecisionMode::default())]
    precision_mode: PrecisionMode,

    #[arg(long, value_enum, default_value_t = BuildMode::default())]
    build_mode: BuildMode,

    #[arg(long, value_enum)]
    build_step: Option<BuildStep>,

    #[arg(long, value_enum, default_value_t = BufferOptimize::default())]
    buffer_optimize: BufferOptimize,

    #[arg(long, default_value_t = false)]
    enable_l1_fusion: bool,

    #[arg(long, default_value_t = false)]
    enable_l2_fusion: bool,

    /// Shape generalization attempts before falling back to static shapes
    #[arg(long, default_value_t = opfusion::config::DEFAULT_MAX_DECENT_ATTEMPTS)]
    max_decent_attempts: u32,

    /// Write a table of the graph after every stage to this directory
    #[arg(long)]
    dump_dir: Option<path::PathBuf>,

    /// Make the backend reject fused kernels containing this op type
    #[arg(long)]
    fail_fused: Vec<String>,

    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    #[command(about = "Compile a chain of elementwise ops")]
    Chain {
        #[arg(long, default_value = "3")]
        len: usize,
        size: u64,
    },
    #[command(about = "Compile a float32 op feeding a float16-only op")]
    Mixed { size: u64 },
    #[command(about = "Compile a dynamically-shaped op against a range-limited kernel")]
    Dynamic {
        #[arg(long, default_value = "128")]
        cap: u64,
        /// The static shape recorded for the input, if any
        #[arg(long)]
        static_dim: Option<i64>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.max_decent_attempts == 0 {
        bail!("--max-decent-attempts must be at least 1");
    }
    let config = PipelineConfig {
        precision_mode: args.precision_mode,
        build_mode: args.build_mode,
        build_step: args.build_step,
        enable_l1_fusion: args.enable_l1_fusion,
        enable_l2_fusion: args.enable_l2_fusion,
        buffer_optimize: args.buffer_optimize,
        max_decent_attempts: args.max_decent_attempts,
        dump_dir: args.dump_dir.clone(),
    };

    let cap = match &args.subcmd {
        Subcommand::Dynamic { cap, .. } => Some(*cap),
        _ => None,
    };
    let mut graph = match &args.subcmd {
        Subcommand::Chain { len, size } => chain(*len, *size)?,
        Subcommand::Mixed { size } => mixed(*size)?,
        Subcommand::Dynamic { static_dim, .. } => dynamic(*static_dim)?,
    };

    let compiler = args
        .fail_fused
        .iter()
        .fold(LoopbackCompiler::new(), |c, op| c.fail_fused_containing(op));
    let pipeline = Pipeline::new(
        Arc::new(catalog(cap)?),
        DeviceProfile::new("demo", [MemoryClass::Ub, MemoryClass::L1, MemoryClass::L2]),
        Arc::new(compiler),
    );

    let start_time = std::time::Instant::now();
    let report = pipeline.compile(&mut graph, &config)?;
    info!("compile took {:?}", start_time.elapsed());

    pprint_graph(&graph);
    println!();
    pprint_report(&report);
    println!(
        "\nstrategy: {}\njudged: {} (relaxed {})\nconversion nodes: {}\ngeneralization: {:?}",
        report.strategy,
        report.judge.judged,
        report.judge.relaxed,
        report.trans_nodes,
        report.generalization
    );
    Ok(())
}

fn catalog(range_cap: Option<u64>) -> Result<Catalog> {
    let kernel = |op_type: &str, inputs: &[&str], dtypes: Vec<Dtype>| {
        let mut c = KernelCandidate::new(op_type.to_lowercase(), op_type, BackendKind::Vector)
            .with_fusion_kind(FusionKind::Elemwise);
        for name in inputs {
            c = c.input(SlotDecl::required(*name, dtypes.clone()));
        }
        c.output(SlotDecl::required("y", dtypes))
    };
    let both = || vec![Dtype::Float16, Dtype::Float32];

    let mut relu = kernel("Relu", &["x"], both());
    if let Some(cap) = range_cap {
        relu = relu.with_range_limit(RangeLimit::new(cap));
    }
    let mut b = Catalog::builder();
    b.add(kernel("Add", &["x1", "x2"], both()))
        .add(kernel("Mul", &["x1", "x2"], both()))
        .add(kernel("Exp", &["x"], vec![Dtype::Float32]))
        .add(kernel("Sqrt", &["x"], vec![Dtype::Float16]))
        .add(relu);
    Ok(b.build()?)
}

fn chain(len: usize, size: u64) -> Result<Graph> {
    let t = || TensorDesc::new(static_shape(&[size]), Dtype::Float16, Format::Nd);
    let mut gb = GraphBuilder::new("chain");
    let x = gb.data("x", t());
    let y = gb.data("y", t());
    let mut tail = x.out(0);
    for i in 0..len {
        tail = match i % 3 {
            0 => gb.op(format!("add{i}"), "Add", &[tail, y.out(0)], vec![t()]),
            1 => gb.op(format!("relu{i}"), "Relu", &[tail], vec![t()]),
            _ => gb.op(format!("mul{i}"), "Mul", &[tail, y.out(0)], vec![t()]),
        }
        .out(0);
    }
    gb.output("out", &[tail]);
    Ok(gb.build()?)
}

fn mixed(size: u64) -> Result<Graph> {
    let t = |dtype| TensorDesc::new(static_shape(&[size]), dtype, Format::Nd);
    let mut gb = GraphBuilder::new("mixed");
    let x = gb.data("x", t(Dtype::Float32));
    let exp = gb.op("exp", "Exp", &[x.out(0)], vec![t(Dtype::Float32)]);
    let sqrt = gb.op("sqrt", "Sqrt", &[exp.out(0)], vec![t(Dtype::Float16)]);
    gb.output("out", &[sqrt.out(0)]);
    Ok(gb.build()?)
}

fn dynamic(static_dim: Option<i64>) -> Result<Graph> {
    let t = || {
        let shape: Shape = [Dim::Unknown].into_iter().collect();
        TensorDesc::new(shape, Dtype::Float16, Format::Nd).with_range(vec![DimRange::unbounded(1)])
    };
    let mut gb = GraphBuilder::new("dynamic").dynamic_shape(true);
    let x = gb.data("x", t());
    if let Some(dim) = static_dim {
        gb.attr(
            x,
            opfusion::graph::attr_keys::STATIC_SHAPE,
            opfusion::attr::AttrValue::Ints(vec![dim]),
        );
    }
    let relu = gb.op("relu", "Relu", &[x.out(0)], vec![t()]);
    gb.output("out", &[relu.out(0)]);
    Ok(gb.build()?)
}
