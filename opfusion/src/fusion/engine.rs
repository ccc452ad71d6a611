use crate::backend::{BackendError, CompileService, CompiledKernel, DeviceProfile};
use crate::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::descriptor::{assemble, BackendDescriptor, CompileOptions, DescriptorError};
use crate::fusion::patterns::enabled_patterns;
use crate::fusion::{match_scopes, merge_scope, unmerge, FusionStats, MergeAccumulator};
use crate::graph::{Graph, NodeId};
use crate::pipeline::{CompileError, Warning};

/// The read-only inputs of a buffer fusion run.
#[derive(Clone, Copy)]
pub struct FusionContext<'a> {
    pub catalog: &'a Catalog,
    pub config: &'a PipelineConfig,
    pub device: &'a DeviceProfile,
    pub compiler: &'a dyn CompileService,
    pub options: &'a CompileOptions,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionOutcome {
    pub stats: FusionStats,
    pub accumulator: MergeAccumulator,
    pub warnings: Vec<Warning>,
}

/// Fuses (if `fuse`) and compiles every kernel node of `graph`.
///
/// Scopes are merged and compiled one at a time in ascending scope id. A scope the backend
/// rejects is dissolved before the next one is merged, and its members are compiled alone.
/// Any node still uncompiled afterwards is compiled alone, in topological order.
pub fn run_buffer_fusion(
    graph: &mut Graph,
    ctx: &FusionContext,
    fuse: bool,
) -> Result<FusionOutcome, CompileError> {
    check_constants(graph, ctx)?;
    let mut outcome = FusionOutcome::default();

    if fuse {
        let patterns = enabled_patterns(ctx.config, ctx.device);
        let scopes = match_scopes(graph, ctx.catalog, &patterns)?;
        for scope in &scopes {
            for &id in &scope.members {
                graph.node_mut(id)?.op.scope_id = Some(scope.id);
            }
        }
        for scope in scopes {
            let pattern = scope.pattern.to_string();
            let fused = merge_scope(graph, &scope, &mut outcome.accumulator)?;
            let descriptor = describe(graph, ctx, fused)?;
            match ctx.compiler.compile(&descriptor) {
                Ok(kernel) => {
                    store(graph, fused, kernel)?;
                    outcome.stats.record(&pattern, 1, 1);
                }
                Err(BackendError::Failure(reason)) => {
                    log::warn!(
                        "Fused node {} was rejected ({reason}); compiling its members alone",
                        descriptor.node_name
                    );
                    outcome.stats.record(&pattern, 1, 0);
                    outcome.warnings.push(Warning::FusionCompileFailure {
                        scope: scope.id,
                        pattern: scope.pattern,
                        fused: descriptor.node_name,
                        reason,
                    });
                    for member in unmerge(graph, fused, &mut outcome.accumulator)? {
                        compile_alone(graph, ctx, member)?;
                    }
                }
                Err(BackendError::Internal(reason)) => {
                    return Err(CompileError::BackendInternal {
                        node: descriptor.node_name,
                        reason,
                    })
                }
            }
        }
    }

    for id in graph.topo_order()? {
        let op = &graph.node(id)?.op;
        if op.needs_kernel() && !op.is_compiled() {
            compile_alone(graph, ctx, id)?;
        }
    }
    Ok(outcome)
}

/// Assembles a descriptor for every kernel node, failing with all unresolvable required
/// constants at once.
fn check_constants(graph: &Graph, ctx: &FusionContext) -> Result<(), CompileError> {
    let mut missing = vec![];
    for node in graph.nodes() {
        if !node.op.needs_kernel() || node.op.is_compiled() {
            continue;
        }
        match assemble(graph, ctx.catalog, node.id, ctx.options) {
            Ok(_) => {}
            Err(DescriptorError::MissingConstant(m)) => missing.push(m),
            Err(DescriptorError::Graph(e)) => return Err(e.into()),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CompileError::MissingConstant(missing))
    }
}

fn describe(
    graph: &Graph,
    ctx: &FusionContext,
    id: NodeId,
) -> Result<BackendDescriptor, CompileError> {
    assemble(graph, ctx.catalog, id, ctx.options).map_err(|e| match e {
        DescriptorError::MissingConstant(m) => CompileError::MissingConstant(vec![m]),
        DescriptorError::Graph(e) => e.into(),
    })
}

/// Compiles a single unfused node. A judged node the backend cannot compile breaks the
/// contract between the catalog and the backend, so any failure is fatal here.
fn compile_alone(graph: &mut Graph, ctx: &FusionContext, id: NodeId) -> Result<(), CompileError> {
    let descriptor = describe(graph, ctx, id)?;
    match ctx.compiler.compile(&descriptor) {
        Ok(kernel) => store(graph, id, kernel),
        Err(BackendError::Failure(reason)) => Err(CompileError::InternalInvariantViolation(
            format!("backend rejected supported node {}: {reason}", descriptor.node_name),
        )),
        Err(BackendError::Internal(reason)) => Err(CompileError::BackendInternal {
            node: descriptor.node_name,
            reason,
        }),
    }
}

fn store(graph: &mut Graph, id: NodeId, kernel: CompiledKernel) -> Result<(), CompileError> {
    let node = graph.node_mut(id)?;
    match node.op.kernel.as_mut() {
        Some(binding) => {
            binding.compiled = Some(kernel);
            Ok(())
        }
        None => Err(CompileError::InternalInvariantViolation(format!(
            "node {} was compiled without a kernel binding",
            node.name
        ))),
    }
}
