use enum_dispatch::enum_dispatch;

use crate::config::{BuildMode, BuildStep, PipelineConfig};
use crate::fusion::{run_buffer_fusion, FusionContext, FusionOutcome};
use crate::graph::Graph;
use crate::pipeline::CompileError;

/// How the buffer fusion stage treats a graph.
#[enum_dispatch]
pub trait CompileStrategyT {
    fn name(&self) -> &'static str;

    /// Whether fusion scopes are matched and merged before compiling.
    fn fuses(&self) -> bool;

    /// Whether kernels are compiled with the backend's tuning flag.
    fn tuning(&self) -> bool;

    fn buffer_fusion(
        &self,
        graph: &mut Graph,
        ctx: &FusionContext,
    ) -> Result<FusionOutcome, CompileError> {
        run_buffer_fusion(graph, ctx, self.fuses())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[enum_dispatch(CompileStrategyT)]
pub enum CompileStrategy {
    Baseline(Baseline),
    /// Every kernel compiled alone, for per-op tuning.
    OpTuning(OpTuning),
    /// Fused kernels compiled for tuning.
    UbTuning(UbTuning),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Baseline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpTuning;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UbTuning;

const STRATEGY_TABLE: &[(BuildMode, Option<BuildStep>, CompileStrategy)] = &[
    (BuildMode::Normal, None, CompileStrategy::Baseline(Baseline)),
    (BuildMode::Tuning, None, CompileStrategy::UbTuning(UbTuning)),
    (
        BuildMode::Tuning,
        Some(BuildStep::BeforeUbMatch),
        CompileStrategy::OpTuning(OpTuning),
    ),
    (
        BuildMode::Tuning,
        Some(BuildStep::AfterUbMatch),
        CompileStrategy::UbTuning(UbTuning),
    ),
];

impl CompileStrategy {
    /// Looks up the strategy for the configured build mode and step. A build step outside a
    /// tuning build is ignored.
    pub fn select(config: &PipelineConfig) -> Self {
        let step = match config.build_mode {
            BuildMode::Normal => None,
            BuildMode::Tuning => config.build_step,
        };
        STRATEGY_TABLE
            .iter()
            .find(|(mode, s, _)| *mode == config.build_mode && *s == step)
            .map_or(CompileStrategy::Baseline(Baseline), |(_, _, strategy)| *strategy)
    }
}

impl CompileStrategyT for Baseline {
    fn name(&self) -> &'static str {
        "baseline"
    }

    fn fuses(&self) -> bool {
        true
    }

    fn tuning(&self) -> bool {
        false
    }
}

impl CompileStrategyT for OpTuning {
    fn name(&self) -> &'static str {
        "op_tuning"
    }

    fn fuses(&self) -> bool {
        false
    }

    fn tuning(&self) -> bool {
        true
    }
}

impl CompileStrategyT for UbTuning {
    fn name(&self) -> &'static str {
        "ub_tuning"
    }

    fn fuses(&self) -> bool {
        true
    }

    fn tuning(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(build_mode: BuildMode, build_step: Option<BuildStep>) -> PipelineConfig {
        PipelineConfig {
            build_mode,
            build_step,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_strategy_lookup() {
        let cases = [
            (BuildMode::Normal, None, "baseline"),
            (BuildMode::Normal, Some(BuildStep::BeforeUbMatch), "baseline"),
            (BuildMode::Tuning, None, "ub_tuning"),
            (BuildMode::Tuning, Some(BuildStep::BeforeUbMatch), "op_tuning"),
            (BuildMode::Tuning, Some(BuildStep::AfterUbMatch), "ub_tuning"),
        ];
        for (mode, step, expected) in cases {
            let strategy = CompileStrategy::select(&config(mode, step));
            assert_eq!(strategy.name(), expected, "{mode} {step:?}");
        }
    }

    #[test]
    fn test_op_tuning_compiles_unfused_with_tuning_flag() {
        let s = CompileStrategy::select(&config(BuildMode::Tuning, Some(BuildStep::BeforeUbMatch)));
        assert!(!s.fuses());
        assert!(s.tuning());
        let s = CompileStrategy::select(&PipelineConfig::default());
        assert!(s.fuses());
        assert!(!s.tuning());
    }
}
