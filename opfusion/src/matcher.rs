//! Decides whether a [KernelCandidate] can implement a node.

use std::fmt;

use itertools::Itertools;

use crate::catalog::{Catalog, KernelCandidate, PrecisionClass, SlotDecl, SlotParam};
use crate::common::{Dtype, Format};
use crate::config::PrecisionMode;
use crate::graph::{Node, SlotDir, TensorSlot};
use crate::tensor::TensorDesc;

/// The precision context a node is matched under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    pub mode: PrecisionMode,
    pub class: PrecisionClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MismatchKind {
    Dtype,
    Format,
    Attribute,
    Cardinality,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFailure {
    pub kind: MismatchKind,
    pub detail: String,
    /// Slots for which a refused float32 -> float16 relaxation would have helped.
    pub observed_relaxations: Vec<(SlotDir, usize)>,
}

/// A node slot and the declaration it binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBinding {
    pub dir: SlotDir,
    pub slot: usize,
    pub decl: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    /// The support-table column the node matched.
    pub column: usize,
    /// Whether the column needs a float32 -> float16 relaxation.
    pub relaxed: bool,
    pub bindings: Vec<SlotBinding>,
    pub observed_relaxations: Vec<(SlotDir, usize)>,
}

enum ColumnFit {
    Exact,
    Relaxed(Vec<(SlotDir, usize)>),
    Rejected,
}

impl MatchPolicy {
    pub fn for_op(catalog: &Catalog, mode: PrecisionMode, op_type: &str) -> Self {
        MatchPolicy {
            mode,
            class: catalog.precision_class(op_type),
        }
    }

    pub fn allows_relaxation(&self) -> bool {
        match self.mode {
            PrecisionMode::ForceFp32 | PrecisionMode::MustKeepOriginDtype => false,
            PrecisionMode::AllowFp32ToFp16 => self.class != PrecisionClass::Deny,
            PrecisionMode::ForceFp16 => true,
            PrecisionMode::AllowMixPrecision => self.class == PrecisionClass::Allow,
        }
    }
}

impl MatchFailure {
    fn new(kind: MismatchKind, detail: impl Into<String>) -> Self {
        MatchFailure {
            kind,
            detail: detail.into(),
            observed_relaxations: vec![],
        }
    }
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Checks `node` against `candidate`.
///
/// Checks run in order (dtype, format, attributes, cardinality, custom predicate) and stop at
/// the first failure. Columns that need no dtype relaxation are preferred over ones that do.
pub fn supported(
    node: &Node,
    candidate: &KernelCandidate,
    policy: &MatchPolicy,
) -> Result<MatchOutcome, MatchFailure> {
    let (bindings, unbound) = bind(node, candidate);

    // dtype
    let mut exact = vec![];
    let mut relaxed = vec![];
    let mut refused = vec![];
    for column in 0..candidate.column_count() {
        match column_dtype_fit(node, candidate, &bindings, column) {
            ColumnFit::Exact => exact.push(column),
            ColumnFit::Relaxed(_) if policy.allows_relaxation() => relaxed.push(column),
            ColumnFit::Relaxed(slots) => refused.extend(slots),
            ColumnFit::Rejected => {}
        }
    }
    let observed_relaxations: Vec<(SlotDir, usize)> = refused.into_iter().unique().collect();
    let columns: Vec<(usize, bool)> = exact
        .iter()
        .map(|c| (*c, false))
        .chain(relaxed.iter().map(|c| (*c, true)))
        .collect();
    let fail = |kind, detail: String| MatchFailure {
        observed_relaxations: observed_relaxations.clone(),
        ..MatchFailure::new(kind, detail)
    };
    if columns.is_empty() && candidate.column_count() > 0 {
        let found = bindings
            .iter()
            .map(|b| slot(node, b.dir, b.slot).desc.dtype)
            .join(", ");
        return Err(fail(
            MismatchKind::Dtype,
            format!("no column accepts dtypes [{found}]"),
        ));
    }

    // format
    let chosen = if candidate.column_count() == 0 {
        Some((0, false))
    } else {
        columns
            .iter()
            .copied()
            .find(|(column, _)| column_formats_fit(node, candidate, &bindings, *column))
    };
    let Some((column, relaxed)) = chosen else {
        let found = bindings
            .iter()
            .map(|b| slot(node, b.dir, b.slot).desc.format)
            .join(", ");
        return Err(fail(
            MismatchKind::Format,
            format!("no dtype-compatible column accepts formats [{found}]"),
        ));
    };

    // attributes
    for decl in &candidate.attrs {
        match node.op.attr(&decl.name) {
            None if decl.required => {
                return Err(fail(
                    MismatchKind::Attribute,
                    format!("missing required attribute {}", decl.name),
                ));
            }
            None => {}
            Some(value) if value.kind() != decl.kind => {
                return Err(fail(
                    MismatchKind::Attribute,
                    format!(
                        "attribute {} is {} but must be {}",
                        decl.name,
                        value.kind(),
                        decl.kind
                    ),
                ));
            }
            Some(value) if !decl.accepts(value) => {
                return Err(fail(
                    MismatchKind::Attribute,
                    format!("attribute {} has unsupported value {value}", decl.name),
                ));
            }
            Some(_) => {}
        }
    }

    // cardinality
    if let Some((dir, index)) = unbound.first() {
        return Err(fail(
            MismatchKind::Cardinality,
            format!(
                "{dir} slot {} matches no declaration",
                slot(node, *dir, *index).name
            ),
        ));
    }
    for (dir, decls) in [
        (SlotDir::Input, &candidate.inputs),
        (SlotDir::Output, &candidate.outputs),
    ] {
        for (i, decl) in decls.iter().enumerate() {
            let count = bindings
                .iter()
                .filter(|b| b.dir == dir && b.decl == i)
                .count();
            let ok = match decl.param {
                SlotParam::Required => count == 1,
                SlotParam::Optional => count <= 1,
                SlotParam::Dynamic => count >= 1,
            };
            if !ok {
                return Err(fail(
                    MismatchKind::Cardinality,
                    format!(
                        "{} {dir} {} binds {count} tensor(s)",
                        decl.param, decl.name
                    ),
                ));
            }
        }
    }

    // custom predicate
    if let Some(check) = &candidate.custom_check {
        if let Err(reason) = check.check(node) {
            return Err(fail(MismatchKind::Custom, reason));
        }
    }

    Ok(MatchOutcome {
        column,
        relaxed,
        bindings,
        observed_relaxations,
    })
}

/// Returns `true` if a tensor in `actual` may be handed to a slot declared with `declared`.
///
/// Unconstrained declarations and unset tensors always pass. `ND` accepts every plain format. A
/// heavy format accepts itself or any plain format it can be derived from. Other plain formats
/// accept themselves or `ND`.
pub fn format_accepts(declared: Option<Format>, actual: &TensorDesc) -> bool {
    let Some(declared) = declared else {
        return true;
    };
    if actual.format.is_reserved() || actual.format == declared {
        return true;
    }
    if declared == Format::Nd {
        return !actual.format.is_heavy();
    }
    if declared.is_heavy() {
        return !actual.format.is_heavy()
            && declared.derivable_from(actual.format, actual.origin_shape.len());
    }
    actual.format == Format::Nd
}

/// Binds node slots to declarations by name, returning the bindings and any unbound slots.
fn bind(node: &Node, candidate: &KernelCandidate) -> (Vec<SlotBinding>, Vec<(SlotDir, usize)>) {
    let mut bindings = vec![];
    let mut unbound = vec![];
    for (dir, slots, decls) in [
        (SlotDir::Input, &node.op.inputs, &candidate.inputs),
        (SlotDir::Output, &node.op.outputs, &candidate.outputs),
    ] {
        for (index, s) in slots.iter().enumerate() {
            match decls.iter().position(|d| d.binds(&s.name)) {
                Some(decl) => bindings.push(SlotBinding {
                    dir,
                    slot: index,
                    decl,
                }),
                None => unbound.push((dir, index)),
            }
        }
    }
    (bindings, unbound)
}

fn column_dtype_fit(
    node: &Node,
    candidate: &KernelCandidate,
    bindings: &[SlotBinding],
    column: usize,
) -> ColumnFit {
    let mut relaxations = vec![];
    for b in bindings {
        let actual = slot(node, b.dir, b.slot).desc.dtype;
        let declared = decl(candidate, b).dtypes[column];
        if actual == declared || actual == Dtype::Undefined {
            continue;
        }
        if actual.may_reduce_to(declared) {
            relaxations.push((b.dir, b.slot));
        } else {
            return ColumnFit::Rejected;
        }
    }
    if relaxations.is_empty() {
        ColumnFit::Exact
    } else {
        ColumnFit::Relaxed(relaxations)
    }
}

fn column_formats_fit(
    node: &Node,
    candidate: &KernelCandidate,
    bindings: &[SlotBinding],
    column: usize,
) -> bool {
    bindings.iter().all(|b| {
        format_accepts(
            decl(candidate, b).format_at(column),
            &slot(node, b.dir, b.slot).desc,
        )
    })
}

pub(crate) fn slot(node: &Node, dir: SlotDir, index: usize) -> &TensorSlot {
    match dir {
        SlotDir::Input => &node.op.inputs[index],
        SlotDir::Output => &node.op.outputs[index],
    }
}

pub(crate) fn decl<'a>(candidate: &'a KernelCandidate, binding: &SlotBinding) -> &'a SlotDecl {
    match binding.dir {
        SlotDir::Input => &candidate.inputs[binding.decl],
        SlotDir::Output => &candidate.outputs[binding.decl],
    }
}
