//! The compilation pipeline: every stage from a freshly built graph to compiled kernels.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::attr::AttrValue;
use crate::backend::{CompileService, DeviceProfile};
use crate::catalog::Catalog;
use crate::common::{DimRange, Dtype, Format};
use crate::config::PipelineConfig;
use crate::descriptor::{CompileOptions, MissingConstant};
use crate::fusion::{FusionContext, FusionStats, MergeAccumulator, PatternKind};
use crate::generalize::{generalize, GeneralizeOutcome};
use crate::graph::{attr_keys, Graph, GraphError, ScopeId};
use crate::passes::{GraphPass, PassRegistry};
use crate::pprint::dump_graph;
use crate::propagate::trans::count_trans_nodes;
use crate::propagate::{FormatJudge, JudgeSummary, PropagateError, UnsupportedNode};
use crate::strategy::{CompileStrategy, CompileStrategyT};
use crate::tensor::TensorDesc;
use crate::utils::{align_up, join_into_string};

/// Tensor sizes are padded to this many bytes, plus one extra block.
const MEMORY_ALIGN: u64 = 32;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Prepare,
    PreQuantRewrite,
    GraphFusion,
    /// Also propagates heavy formats, inserts conversion nodes and generalizes shapes.
    FormatDtypeJudge,
    SecondRoundFusion,
    SpaceSizeCalculation,
    BufferFusion,
    PostCompileBookkeeping,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Unsupported operator(s): {}", join_into_string(.0.iter().map(|n| &n.name), ", "))]
    UnsupportedOperator(Vec<UnsupportedNode>),
    #[error("Format conflict at {node} ({slot}): {detail}")]
    FormatConflict {
        node: String,
        slot: String,
        detail: String,
    },
    #[error("Missing constant input(s): {}", join_into_string(.0, ", "))]
    MissingConstant(Vec<MissingConstant>),
    #[error("Internal invariant violated: {0}")]
    InternalInvariantViolation(String),
    #[error("Backend internal error while compiling {node}: {reason}")]
    BackendInternal { node: String, reason: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A recoverable problem. The pipeline continues after recording it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Warning {
    /// Shape generalization gave up and pinned the graph to static shapes.
    ShapeRangeExhausted {
        input: String,
        axis: usize,
        attempts: u32,
    },
    /// A fused kernel was rejected and its scope dissolved.
    FusionCompileFailure {
        scope: ScopeId,
        pattern: PatternKind,
        fused: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompileReport {
    pub graph: String,
    pub strategy: String,
    /// Per fusion pattern and per structural pass.
    pub stats: FusionStats,
    pub warnings: Vec<Warning>,
    pub judge: JudgeSummary,
    pub generalization: GeneralizeOutcome,
    /// Conversion nodes left in the graph after the second rewrite round.
    pub trans_nodes: usize,
    pub accumulator: MergeAccumulator,
}

/// Shared, read-only inputs of every compilation.
pub struct Pipeline {
    catalog: Arc<Catalog>,
    device: Arc<DeviceProfile>,
    compiler: Arc<dyn CompileService>,
    passes: Arc<PassRegistry>,
}

/// The state of one graph's trip through the stages.
struct GraphRun<'a> {
    pipeline: &'a Pipeline,
    config: &'a PipelineConfig,
    passes: &'a [Arc<dyn GraphPass>],
    strategy: CompileStrategy,
    report: CompileReport,
}

impl From<PropagateError> for CompileError {
    fn from(e: PropagateError) -> Self {
        match e {
            PropagateError::Unsupported(nodes) => CompileError::UnsupportedOperator(nodes),
            PropagateError::FormatConflict { node, slot, detail } => {
                CompileError::FormatConflict { node, slot, detail }
            }
            PropagateError::Graph(e) => CompileError::Graph(e),
            e @ (PropagateError::OutOfOrder { .. } | PropagateError::StaleGraph) => {
                CompileError::InternalInvariantViolation(e.to_string())
            }
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ShapeRangeExhausted {
                input,
                axis,
                attempts,
            } => write!(
                f,
                "no acceptable shape range for {input} axis {axis} after {attempts} attempt(s); \
                 compiled with static shapes"
            ),
            Warning::FusionCompileFailure {
                scope,
                pattern,
                fused,
                reason,
            } => write!(
                f,
                "{pattern} scope {} ({fused}) was rejected and compiled unfused: {reason}",
                scope.0
            ),
        }
    }
}

impl CompileReport {
    fn new(graph: &str, strategy: &CompileStrategy) -> Self {
        CompileReport {
            graph: graph.to_owned(),
            strategy: strategy.name().to_owned(),
            stats: FusionStats::default(),
            warnings: vec![],
            judge: JudgeSummary::default(),
            generalization: GeneralizeOutcome::Inactive,
            trans_nodes: 0,
            accumulator: MergeAccumulator::default(),
        }
    }

    /// Folds a subgraph's report into this one.
    fn absorb(&mut self, sub: CompileReport) {
        self.stats.absorb(&sub.stats);
        self.warnings.extend(sub.warnings);
        self.judge.judged += sub.judge.judged;
        self.judge.relaxed += sub.judge.relaxed;
        self.judge.heavy_propagated += sub.judge.heavy_propagated;
        self.judge.trans_inserted += sub.judge.trans_inserted;
        self.trans_nodes += sub.trans_nodes;
        self.accumulator.absorb(sub.accumulator);
    }
}

impl Pipeline {
    /// A pipeline running the built-in structural passes.
    pub fn new(
        catalog: Arc<Catalog>,
        device: DeviceProfile,
        compiler: Arc<dyn CompileService>,
    ) -> Self {
        Pipeline {
            catalog,
            device: Arc::new(device),
            compiler,
            passes: Arc::new(PassRegistry::with_builtin_passes()),
        }
    }

    pub fn with_passes(mut self, passes: Arc<PassRegistry>) -> Self {
        self.passes = passes;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn passes(&self) -> &PassRegistry {
        &self.passes
    }

    /// Runs every stage on `graph` and, first, on each of its subgraphs.
    pub fn compile(
        &self,
        graph: &mut Graph,
        config: &PipelineConfig,
    ) -> Result<CompileReport, CompileError> {
        let passes = self.passes.snapshot();
        let strategy = CompileStrategy::select(config);
        log::info!(
            "Compiling {} with the {} strategy and {} pass(es)",
            graph.name,
            strategy.name(),
            passes.len()
        );
        self.compile_graph(graph, config, &passes, strategy)
    }

    /// Compiles independent graphs in parallel.
    pub fn compile_graphs(
        &self,
        graphs: &mut [Graph],
        config: &PipelineConfig,
    ) -> Vec<Result<CompileReport, CompileError>> {
        graphs
            .par_iter_mut()
            .map(|graph| self.compile(graph, config))
            .collect()
    }

    fn compile_graph(
        &self,
        graph: &mut Graph,
        config: &PipelineConfig,
        passes: &[Arc<dyn GraphPass>],
        strategy: CompileStrategy,
    ) -> Result<CompileReport, CompileError> {
        let mut subreports = vec![];
        for sub in graph.subgraphs_mut() {
            subreports.push(self.compile_graph(sub, config, passes, strategy)?);
        }

        let mut run = GraphRun {
            pipeline: self,
            config,
            passes,
            strategy,
            report: CompileReport::new(&graph.name, &strategy),
        };
        for sub in subreports {
            run.report.absorb(sub);
        }
        for (i, stage) in Stage::iter().enumerate() {
            run.stage(stage, graph)?;
            graph.validate()?;
            if let Some(dir) = &config.dump_dir {
                let path = dump_path(dir, &graph.name, i, stage);
                if let Err(e) = dump_graph(graph, &path) {
                    log::warn!("Could not write {}: {e}", path.display());
                }
            }
            log::debug!("{}: finished {stage}", graph.name);
        }
        Ok(run.report)
    }
}

impl GraphRun<'_> {
    fn stage(&mut self, stage: Stage, graph: &mut Graph) -> Result<(), CompileError> {
        match stage {
            Stage::Prepare => {
                graph.validate()?;
                prepare(graph);
            }
            Stage::PreQuantRewrite | Stage::GraphFusion => self.rewrite(stage, graph)?,
            Stage::FormatDtypeJudge => self.judge(graph)?,
            Stage::SecondRoundFusion => {
                self.rewrite(stage, graph)?;
                self.report.trans_nodes = count_trans_nodes(graph);
            }
            Stage::SpaceSizeCalculation => calculate_space_sizes(graph),
            Stage::BufferFusion => self.buffer_fusion(graph)?,
            Stage::PostCompileBookkeeping => self.bookkeeping(graph)?,
        }
        Ok(())
    }

    fn rewrite(&mut self, stage: Stage, graph: &mut Graph) -> Result<(), CompileError> {
        let passes = self.passes;
        for pass in passes.iter().filter(|p| p.stage() == stage) {
            let result = pass.run(graph)?;
            if result.changed {
                log::debug!(
                    "{} rewrote {} site(s) of {} in {} sweep(s)",
                    pass.name(),
                    result.rewrites_applied,
                    graph.name,
                    result.iterations
                );
            }
            self.report.stats.record(
                pass.name(),
                result.rewrites_applied,
                result.rewrites_applied,
            );
        }
        Ok(())
    }

    fn judge(&mut self, graph: &mut Graph) -> Result<(), CompileError> {
        let catalog = &self.pipeline.catalog;
        self.report.judge = FormatJudge::new(catalog, self.config.precision_mode).run(graph)?;
        let outcome = generalize(graph, catalog, self.config.max_decent_attempts)?;
        if let GeneralizeOutcome::Pinned {
            input,
            axis,
            attempts,
        } = &outcome
        {
            self.report.warnings.push(Warning::ShapeRangeExhausted {
                input: input.clone(),
                axis: *axis,
                attempts: *attempts,
            });
        }
        self.report.generalization = outcome;
        Ok(())
    }

    fn buffer_fusion(&mut self, graph: &mut Graph) -> Result<(), CompileError> {
        let pipeline = self.pipeline;
        let options = CompileOptions {
            chip: pipeline.device.chip.clone(),
            precision_mode: self.config.precision_mode,
            tuning: self.strategy.tuning(),
        };
        let ctx = FusionContext {
            catalog: &pipeline.catalog,
            config: self.config,
            device: &pipeline.device,
            compiler: pipeline.compiler.as_ref(),
            options: &options,
        };
        let outcome = self.strategy.buffer_fusion(graph, &ctx)?;
        self.report.stats.absorb(&outcome.stats);
        self.report.warnings.extend(outcome.warnings);
        self.report.accumulator.absorb(outcome.accumulator);
        Ok(())
    }

    fn bookkeeping(&self, graph: &mut Graph) -> Result<(), CompileError> {
        for node in graph.nodes_mut() {
            if !node.op.needs_kernel() {
                continue;
            }
            let Some(kernel) = node.op.kernel.as_ref().and_then(|k| k.compiled.as_ref()) else {
                return Err(CompileError::InternalInvariantViolation(format!(
                    "node {} reached bookkeeping without a compiled kernel",
                    node.name
                )));
            };
            let kernel_name = AttrValue::Str(kernel.kernel_name.clone());
            let members = node.op.fused.as_ref().map(|body| {
                self.report
                    .accumulator
                    .members_of(&node.name)
                    .map_or_else(|| body.member_names(), <[String]>::to_vec)
            });
            node.op
                .attrs
                .insert(attr_keys::KERNEL_NAME.to_owned(), kernel_name);
            if let Some(members) = members {
                node.op
                    .attrs
                    .insert(attr_keys::FUSION_OP_NAMES.to_owned(), AttrValue::Strs(members));
            }
        }
        Ok(())
    }
}

fn dump_path(dir: &Path, graph: &str, index: usize, stage: Stage) -> PathBuf {
    dir.join(graph).join(format!("{index:02}_{stage}.txt"))
}

/// Fills in origin fields and shape ranges left unset by the graph's builder.
fn prepare(graph: &mut Graph) {
    for node in graph.nodes_mut() {
        for slot in node.op.inputs.iter_mut().chain(node.op.outputs.iter_mut()) {
            let desc = &mut slot.desc;
            if desc.origin_format == Format::Reserved {
                desc.origin_format = desc.format;
            }
            if desc.origin_shape.is_empty() && !desc.shape.is_empty() {
                desc.origin_shape = desc.shape.clone();
            }
            if desc.origin_dtype == Dtype::Undefined {
                desc.origin_dtype = desc.dtype;
            }
            if desc.shape_range.len() != desc.origin_shape.len() {
                desc.shape_range =
                    desc.origin_shape.iter().map(|d| DimRange::for_dim(*d)).collect();
            }
        }
    }
}

/// The bytes reserved for a tensor, or `None` if its size is unbounded.
pub fn space_size(desc: &TensorDesc) -> Option<u64> {
    let bytes = desc
        .max_volume()?
        .saturating_mul(u64::from(desc.dtype.size()));
    Some(align_up(bytes, MEMORY_ALIGN) + MEMORY_ALIGN)
}

fn calculate_space_sizes(graph: &mut Graph) {
    for node in graph.nodes_mut() {
        for slot in node.op.inputs.iter_mut().chain(node.op.outputs.iter_mut()) {
            slot.desc.size_bytes = space_size(&slot.desc);
        }
    }
}
