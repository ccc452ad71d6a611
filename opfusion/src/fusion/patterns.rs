use serde::{Deserialize, Serialize};

use crate::backend::{DeviceProfile, MemoryClass};
use crate::catalog::FusionKind;
use crate::config::PipelineConfig;

/// The fixed library of fusable chain shapes.
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
pub enum PatternKind {
    /// A convolution followed by elementwise ops.
    ConvElemwise,
    /// A matrix multiplication followed by elementwise ops.
    MatmulElemwise,
    /// One or more elementwise ops feeding a reduction.
    ElemwiseReduce,
    /// Two or more elementwise ops.
    ElemwiseChain,
}

/// The shape of a chain: one head, a run of body ops, and an optional mandatory tail.
#[derive(Debug, Clone, Copy)]
pub struct PatternDef {
    pub kind: PatternKind,
    pub head: &'static [FusionKind],
    pub body: &'static [FusionKind],
    pub tail: Option<FusionKind>,
    pub min_body: usize,
}

const ELEMWISE: &[FusionKind] = &[FusionKind::Elemwise, FusionKind::Broadcast];

/// Patterns in the order they are matched. Earlier patterns claim nodes first.
pub static PATTERNS: [PatternDef; 4] = [
    PatternDef {
        kind: PatternKind::ConvElemwise,
        head: &[FusionKind::Convolution],
        body: ELEMWISE,
        tail: None,
        min_body: 1,
    },
    PatternDef {
        kind: PatternKind::MatmulElemwise,
        head: &[FusionKind::Matmul],
        body: ELEMWISE,
        tail: None,
        min_body: 1,
    },
    PatternDef {
        kind: PatternKind::ElemwiseReduce,
        head: ELEMWISE,
        body: ELEMWISE,
        tail: Some(FusionKind::Reduce),
        min_body: 0,
    },
    PatternDef {
        kind: PatternKind::ElemwiseChain,
        head: ELEMWISE,
        body: ELEMWISE,
        tail: None,
        min_body: 1,
    },
];

impl PatternKind {
    /// The on-chip memory a fused kernel of this pattern keeps its intermediates in.
    pub fn memory(&self) -> MemoryClass {
        match self {
            PatternKind::ElemwiseChain | PatternKind::ElemwiseReduce => MemoryClass::Ub,
            PatternKind::ConvElemwise => MemoryClass::L1,
            PatternKind::MatmulElemwise => MemoryClass::L2,
        }
    }

    /// Unified-buffer patterns are always on. L1 and L2 patterns need both the configuration
    /// switch and the memory on the device.
    pub fn enabled(&self, config: &PipelineConfig, device: &DeviceProfile) -> bool {
        let switched_on = match self.memory() {
            MemoryClass::Ub => return true,
            MemoryClass::L1 => config.l1_fusion_enabled(),
            MemoryClass::L2 => config.l2_fusion_enabled(),
            MemoryClass::Hbm => false,
        };
        switched_on && device.has(self.memory())
    }
}

pub fn enabled_patterns(config: &PipelineConfig, device: &DeviceProfile) -> Vec<&'static PatternDef> {
    PATTERNS
        .iter()
        .filter(|p| p.kind.enabled(config, device))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferOptimize;

    #[test]
    fn test_ub_patterns_are_always_enabled() {
        let config = PipelineConfig {
            buffer_optimize: BufferOptimize::OffOptimize,
            ..PipelineConfig::default()
        };
        let device = DeviceProfile::new("mini", [MemoryClass::Ub]);
        let kinds: Vec<_> = enabled_patterns(&config, &device)
            .iter()
            .map(|p| p.kind)
            .collect();
        assert_eq!(kinds, [PatternKind::ElemwiseReduce, PatternKind::ElemwiseChain]);
    }

    #[test]
    fn test_l1_needs_switch_and_memory() {
        let on = PipelineConfig {
            enable_l1_fusion: true,
            buffer_optimize: BufferOptimize::OffOptimize,
            ..PipelineConfig::default()
        };
        let with_l1 = DeviceProfile::new("a", [MemoryClass::Ub, MemoryClass::L1]);
        let without_l1 = DeviceProfile::new("b", [MemoryClass::Ub]);
        assert!(PatternKind::ConvElemwise.enabled(&on, &with_l1));
        assert!(!PatternKind::ConvElemwise.enabled(&on, &without_l1));
        let off = PipelineConfig {
            buffer_optimize: BufferOptimize::OffOptimize,
            ..PipelineConfig::default()
        };
        assert!(!PatternKind::ConvElemwise.enabled(&off, &with_l1));
    }

    #[test]
    fn test_buffer_optimize_enables_l2() {
        let config = PipelineConfig {
            buffer_optimize: BufferOptimize::L2Optimize,
            ..PipelineConfig::default()
        };
        let device = DeviceProfile::new("c", [MemoryClass::Ub, MemoryClass::L2]);
        assert!(PatternKind::MatmulElemwise.enabled(&config, &device));
        assert!(!PatternKind::ConvElemwise.enabled(&config, &device));
    }
}
