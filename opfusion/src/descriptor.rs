//! Self-contained compile requests handed to the backend.
//!
//! A [BackendDescriptor] holds copies of everything the backend needs to compile one node (or
//! one fused node). Nothing in it refers back into the live [Graph].

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;

use crate::attr::{AttrValue, ConstTensor};
use crate::catalog::{BackendKind, Catalog, ConstRequirement};
use crate::common::{DimRange, Dtype, Format, Shape};
use crate::config::PrecisionMode;
use crate::graph::{attr_keys, op_types, Graph, GraphError, InAnchor, Node, NodeId, TensorSlot};

/// The longest chain of shape-only ops followed when resolving a constant input.
pub const MAX_CONST_DEPTH: usize = 8;

/// Ops that forward their first input's data unchanged.
const DATA_PRESERVING_OPS: [&str; 5] = ["Identity", "Reshape", "Squeeze", "Unsqueeze", "ExpandDims"];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Shape,
    pub origin_shape: Shape,
    pub shape_range: Vec<DimRange>,
    pub format: Format,
    pub sub_format: u32,
    pub origin_format: Format,
    pub dtype: Dtype,
    pub size_bytes: Option<u64>,
    pub offset: Option<i64>,
    pub mem_type: Option<i64>,
    pub const_value: Option<ConstTensor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FusedMember {
    pub name: String,
    pub op_type: String,
    pub kernel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompileOptions {
    pub chip: String,
    pub precision_mode: PrecisionMode,
    pub tuning: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendDescriptor {
    pub node_name: String,
    pub op_type: String,
    pub kernel: Option<String>,
    pub backend: Option<BackendKind>,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub attrs: BTreeMap<String, AttrValue>,
    /// Empty unless the node is a fused node.
    pub fused_members: Vec<FusedMember>,
    pub options: CompileOptions,
}

/// A required constant input that could not be traced back to a `Const` node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MissingConstant {
    pub node: String,
    pub op_type: String,
    pub slot: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("Missing constant input {}", .0)]
    MissingConstant(MissingConstant),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl BackendDescriptor {
    pub fn is_fused(&self) -> bool {
        !self.fused_members.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl fmt::Display for MissingConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} ({})", self.slot, self.node, self.op_type)
    }
}

/// Builds the compile request for `id`.
pub fn assemble(
    graph: &Graph,
    catalog: &Catalog,
    id: NodeId,
    options: &CompileOptions,
) -> Result<BackendDescriptor, DescriptorError> {
    let node = graph.node(id)?;
    let op = &node.op;
    let mem_type = op.attr(attr_keys::MEM_TYPE).and_then(AttrValue::as_int);
    let input_offsets = op.attr(attr_keys::INPUT_OFFSETS).and_then(AttrValue::as_ints);
    let output_offsets = op.attr(attr_keys::OUTPUT_OFFSETS).and_then(AttrValue::as_ints);

    let mut inputs = Vec::with_capacity(op.inputs.len());
    for (index, slot) in op.inputs.iter().enumerate() {
        let dst = id.input(index);
        let const_value = match const_requirement(node, catalog, index) {
            ConstRequirement::None => None,
            requirement => {
                let value = resolve_const(graph, dst).cloned();
                if value.is_none() && requirement == ConstRequirement::Required {
                    return Err(DescriptorError::MissingConstant(MissingConstant {
                        node: node.name.clone(),
                        op_type: op.op_type.clone(),
                        slot: slot.name.clone(),
                    }));
                }
                value
            }
        };
        inputs.push(tensor_info(
            slot,
            offset_at(input_offsets, index),
            mem_type,
            const_value,
        ));
    }
    let outputs = op
        .outputs
        .iter()
        .enumerate()
        .map(|(index, slot)| tensor_info(slot, offset_at(output_offsets, index), mem_type, None))
        .collect();

    let fused_members = op
        .fused
        .as_ref()
        .map(|body| {
            body.members
                .iter()
                .map(|m| FusedMember {
                    name: m.name.clone(),
                    op_type: m.op.op_type.clone(),
                    kernel: m.op.kernel.as_ref().map(|k| k.candidate.clone()),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(BackendDescriptor {
        node_name: node.name.clone(),
        op_type: op.op_type.clone(),
        kernel: op.kernel.as_ref().map(|k| k.candidate.clone()),
        backend: op.kernel.as_ref().map(|k| k.backend),
        inputs,
        outputs,
        attrs: op.attrs.clone(),
        fused_members,
        options: options.clone(),
    })
}

/// Follows producers of `dst` through data-preserving ops to a `Const` node's value.
pub fn resolve_const(graph: &Graph, dst: InAnchor) -> Option<&ConstTensor> {
    let mut src = graph.producer(dst)?;
    for _ in 0..=MAX_CONST_DEPTH {
        let node = graph.node(src.node).ok()?;
        if node.op.op_type == op_types::CONST {
            return node.op.attr("value").and_then(AttrValue::as_tensor);
        }
        if !DATA_PRESERVING_OPS.contains(&node.op.op_type.as_str()) {
            return None;
        }
        src = graph.producer(node.id.input(0))?;
    }
    None
}

/// How strongly the kernel bound to `node` needs input `index` to be constant.
///
/// For a fused node this is the strongest requirement among the member inputs it feeds.
fn const_requirement(node: &Node, catalog: &Catalog, index: usize) -> ConstRequirement {
    match &node.op.fused {
        Some(body) => body.input_map[index]
            .iter()
            .filter_map(|dst| {
                let member = body.members.iter().find(|m| m.id == dst.node)?;
                Some(const_requirement(member, catalog, dst.index))
            })
            .max_by_key(|r| match r {
                ConstRequirement::None => 0,
                ConstRequirement::Optional => 1,
                ConstRequirement::Required => 2,
            })
            .unwrap_or(ConstRequirement::None),
        None => {
            let Some(binding) = &node.op.kernel else {
                return ConstRequirement::None;
            };
            let Some(candidate) = catalog.candidate(&node.op.op_type, &binding.candidate) else {
                return ConstRequirement::None;
            };
            let name = &node.op.inputs[index].name;
            candidate
                .inputs
                .iter()
                .find(|d| d.binds(name))
                .map_or(ConstRequirement::None, |d| d.const_value)
        }
    }
}

fn offset_at(offsets: Option<&[i64]>, index: usize) -> Option<i64> {
    offsets.and_then(|o| o.get(index)).copied()
}

fn tensor_info(
    slot: &TensorSlot,
    offset: Option<i64>,
    mem_type: Option<i64>,
    const_value: Option<ConstTensor>,
) -> TensorInfo {
    let d = &slot.desc;
    TensorInfo {
        name: slot.name.clone(),
        shape: d.shape.clone(),
        origin_shape: d.origin_shape.clone(),
        shape_range: d.shape_range.clone(),
        format: d.format,
        sub_format: d.sub_format,
        origin_format: d.origin_format,
        dtype: d.dtype,
        size_bytes: d.size_bytes,
        offset,
        mem_type,
        const_value,
    }
}
