//! Collaborators outside the middle-end: the device profile and the kernel compile service.

use auto_impl::auto_impl;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;

use crate::descriptor::BackendDescriptor;

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
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum MemoryClass {
    /// The vector unit's unified buffer.
    Ub,
    L1,
    L2,
    Hbm,
}

/// Read-only facts about the target device, queried once per process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceProfile {
    pub chip: String,
    pub memory_classes: BTreeSet<MemoryClass>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompiledKernel {
    pub kernel_name: String,
    pub binary: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request cannot be compiled. Recoverable for fused nodes.
    #[error("Compilation failed: {0}")]
    Failure(String),
    #[error("Backend internal error: {0}")]
    Internal(String),
}

/// Compiles one node's descriptor into a device binary.
///
/// Calls block until the backend answers. Timeouts and retries are the backend's concern.
#[auto_impl(&, Box, Arc)]
pub trait CompileService: Send + Sync {
    fn compile(&self, descriptor: &BackendDescriptor) -> Result<CompiledKernel, BackendError>;
}

/// A [CompileService] whose "binary" is the serialized descriptor.
///
/// Failures can be injected per op type, for fused nodes containing an op type, or as internal
/// errors. Every request is recorded.
#[derive(Debug, Default)]
pub struct LoopbackCompiler {
    fail_op_types: BTreeSet<String>,
    fail_fused_containing: BTreeSet<String>,
    internal_op_types: BTreeSet<String>,
    requests: Mutex<Vec<String>>,
}

impl DeviceProfile {
    pub fn new(chip: impl Into<String>, memory_classes: impl IntoIterator<Item = MemoryClass>) -> Self {
        DeviceProfile {
            chip: chip.into(),
            memory_classes: memory_classes.into_iter().collect(),
        }
    }

    pub fn has(&self, class: MemoryClass) -> bool {
        self.memory_classes.contains(&class)
    }
}

impl LoopbackCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_op_type(mut self, op_type: impl Into<String>) -> Self {
        self.fail_op_types.insert(op_type.into());
        self
    }

    pub fn fail_fused_containing(mut self, op_type: impl Into<String>) -> Self {
        self.fail_fused_containing.insert(op_type.into());
        self
    }

    pub fn internal_error_on(mut self, op_type: impl Into<String>) -> Self {
        self.internal_op_types.insert(op_type.into());
        self
    }

    /// Names of the nodes compiled so far, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl CompileService for LoopbackCompiler {
    fn compile(&self, descriptor: &BackendDescriptor) -> Result<CompiledKernel, BackendError> {
        self.requests.lock().push(descriptor.node_name.clone());
        let op_types: Vec<&str> = std::iter::once(descriptor.op_type.as_str())
            .chain(descriptor.fused_members.iter().map(|m| m.op_type.as_str()))
            .collect();

        if let Some(t) = op_types.iter().find(|t| self.internal_op_types.contains(**t)) {
            return Err(BackendError::Internal(format!("injected internal error on {t}")));
        }
        if descriptor.is_fused() {
            if let Some(t) = op_types[1..]
                .iter()
                .find(|t| self.fail_fused_containing.contains(**t))
            {
                return Err(BackendError::Failure(format!(
                    "cannot fuse {t} in {}",
                    descriptor.node_name
                )));
            }
        } else if self.fail_op_types.contains(&descriptor.op_type) {
            return Err(BackendError::Failure(format!(
                "no implementation for {}",
                descriptor.op_type
            )));
        }

        let binary = descriptor
            .to_bytes()
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        Ok(CompiledKernel {
            kernel_name: kernel_name(descriptor),
            binary,
        })
    }
}

fn kernel_name(descriptor: &BackendDescriptor) -> String {
    let sanitized: String = descriptor
        .node_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("te_{}_{sanitized}", descriptor.op_type.to_ascii_lowercase())
}
