//! Backend kernel declarations.
//!
//! Every backend declares, per op type, a list of [KernelCandidate]s. A candidate's support
//! table is column-major: `inputs[s].dtypes[i]` and `inputs[s].formats[i]` (and likewise for
//! outputs) together form column `i`, one legal combination of slot types.

use serde::{Deserialize, Serialize};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::attr::{AttrKind, AttrValue};
use crate::common::{DimRange, Dtype, Format};
use crate::graph::Node;

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
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum BackendKind {
    /// Vector-unit kernels, fusable in the unified buffer.
    Vector,
    /// Matrix-unit kernels.
    Cube,
    /// Scalar fallback kernels.
    Aicpu,
    /// Kernels the compiler synthesizes itself (layout and dtype conversions).
    Builtin,
}

/// How an op participates in buffer-fusion patterns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum FusionKind {
    Elemwise,
    Broadcast,
    Reduce,
    Convolution,
    Matmul,
    Opaque,
}

/// Whether an op type may run in reduced precision under a mixed-precision policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum PrecisionClass {
    Allow,
    Deny,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SlotParam {
    /// Binds exactly one tensor.
    Required,
    /// Binds zero or one tensor.
    Optional,
    /// Binds one or more tensors, named `x`, `x0`, `x1`, ... for a declaration named `x`.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConstRequirement {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SlotDecl {
    pub name: String,
    pub param: SlotParam,
    pub dtypes: Vec<Dtype>,
    /// `None` accepts any format.
    pub formats: Option<Vec<Format>>,
    pub const_value: ConstRequirement,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AttrDomain {
    Any,
    Values(Vec<AttrValue>),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AttrDecl {
    pub name: String,
    pub kind: AttrKind,
    pub required: bool,
    pub domain: AttrDomain,
}

/// Shape bounds outside of which a candidate cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct RangeLimit {
    /// Largest accepted upper bound of any single dimension.
    pub max_dim: u64,
    /// Largest accepted product of dimension upper bounds.
    pub max_volume: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeViolation {
    /// Dimension `axis` is unbounded (`upper` is `None`) or above `max_dim`.
    Dim { axis: usize, upper: Option<u64> },
    /// The product of upper bounds is unbounded or above `max_volume`.
    Volume { volume: Option<u64> },
}

pub type CustomCheckFn = dyn Fn(&Node) -> Result<(), String> + Send + Sync;

/// An opaque backend predicate run after every declarative check has passed.
#[derive(Clone)]
pub struct CustomCheck(Arc<CustomCheckFn>);

#[derive(Debug, Clone)]
pub struct KernelCandidate {
    pub name: String,
    pub op_type: String,
    pub backend: BackendKind,
    /// Lower values are tried first.
    pub priority: i32,
    pub inputs: Vec<SlotDecl>,
    pub outputs: Vec<SlotDecl>,
    pub attrs: Vec<AttrDecl>,
    pub range_limit: Option<RangeLimit>,
    /// `(input, output)` declaration indices that alias the same buffer.
    pub ref_pairs: Vec<(usize, usize)>,
    pub fusion_kind: FusionKind,
    pub custom_check: Option<CustomCheck>,
}

/// A frozen, validated set of candidates. Shared read-only between compilations.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    candidates: HashMap<String, Vec<KernelCandidate>>,
    precision: HashMap<String, PrecisionClass>,
}

#[derive(Default)]
pub struct CatalogBuilder {
    candidates: Vec<KernelCandidate>,
    precision: HashMap<String, PrecisionClass>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Candidate {candidate} declares no supported column")]
    EmptySupportTable { candidate: String },
    #[error("Candidate {candidate}: slot {slot} declares {found} column(s); expected {expected}")]
    ColumnMismatch {
        candidate: String,
        slot: String,
        expected: usize,
        found: usize,
    },
    #[error("Candidate {candidate} declares slot {slot} twice")]
    DuplicateSlot { candidate: String, slot: String },
    #[error("Op type {op_type} has two candidates named {candidate}")]
    DuplicateCandidate { op_type: String, candidate: String },
    #[error("Candidate {candidate}: attribute {attr} is {expected} but lists a {found} value")]
    AttrDomainKind {
        candidate: String,
        attr: String,
        expected: AttrKind,
        found: AttrKind,
    },
    #[error("Candidate {candidate}: ref pair ({input}, {output}) is out of range")]
    RefPairOutOfRange {
        candidate: String,
        input: usize,
        output: usize,
    },
}

impl SlotDecl {
    pub fn new(name: impl Into<String>, param: SlotParam, dtypes: Vec<Dtype>) -> Self {
        SlotDecl {
            name: name.into(),
            param,
            dtypes,
            formats: None,
            const_value: ConstRequirement::None,
        }
    }

    pub fn required(name: impl Into<String>, dtypes: Vec<Dtype>) -> Self {
        Self::new(name, SlotParam::Required, dtypes)
    }

    pub fn optional(name: impl Into<String>, dtypes: Vec<Dtype>) -> Self {
        Self::new(name, SlotParam::Optional, dtypes)
    }

    pub fn dynamic(name: impl Into<String>, dtypes: Vec<Dtype>) -> Self {
        Self::new(name, SlotParam::Dynamic, dtypes)
    }

    pub fn with_formats(mut self, formats: Vec<Format>) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn with_const(mut self, requirement: ConstRequirement) -> Self {
        self.const_value = requirement;
        self
    }

    /// Returns `true` if a node slot named `slot_name` binds to this declaration.
    pub fn binds(&self, slot_name: &str) -> bool {
        if slot_name == self.name {
            return true;
        }
        self.param == SlotParam::Dynamic
            && slot_name
                .strip_prefix(self.name.as_str())
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn format_at(&self, column: usize) -> Option<Format> {
        self.formats.as_ref().map(|f| f[column])
    }
}

impl AttrDecl {
    pub fn required(name: impl Into<String>, kind: AttrKind) -> Self {
        AttrDecl {
            name: name.into(),
            kind,
            required: true,
            domain: AttrDomain::Any,
        }
    }

    pub fn optional(name: impl Into<String>, kind: AttrKind) -> Self {
        AttrDecl {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn with_values(mut self, values: Vec<AttrValue>) -> Self {
        self.domain = AttrDomain::Values(values);
        self
    }

    pub fn accepts(&self, value: &AttrValue) -> bool {
        match &self.domain {
            AttrDomain::Any => true,
            AttrDomain::Values(values) => values.contains(value),
        }
    }
}

impl RangeLimit {
    pub fn new(max_dim: u64) -> Self {
        RangeLimit {
            max_dim,
            max_volume: None,
        }
    }

    pub fn with_max_volume(mut self, max_volume: u64) -> Self {
        self.max_volume = Some(max_volume);
        self
    }

    /// Checks per-dimension ranges, reporting the first offending axis.
    pub fn check(&self, ranges: &[DimRange]) -> Result<(), RangeViolation> {
        for (axis, r) in ranges.iter().enumerate() {
            match r.upper {
                Some(u) if u <= self.max_dim => {}
                upper => return Err(RangeViolation::Dim { axis, upper }),
            }
        }
        if let Some(max_volume) = self.max_volume {
            let volume = ranges
                .iter()
                .try_fold(1u64, |acc, r| r.upper.map(|u| acc.saturating_mul(u)));
            if volume.map_or(true, |v| v > max_volume) {
                return Err(RangeViolation::Volume { volume });
            }
        }
        Ok(())
    }
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeViolation::Dim { axis, upper: None } => write!(f, "axis {axis} is unbounded"),
            RangeViolation::Dim {
                axis,
                upper: Some(u),
            } => write!(f, "axis {axis} may reach {u}"),
            RangeViolation::Volume { volume: None } => write!(f, "volume is unbounded"),
            RangeViolation::Volume { volume: Some(v) } => write!(f, "volume may reach {v}"),
        }
    }
}

impl CustomCheck {
    pub fn new(f: impl Fn(&Node) -> Result<(), String> + Send + Sync + 'static) -> Self {
        CustomCheck(Arc::new(f))
    }

    pub fn check(&self, node: &Node) -> Result<(), String> {
        (self.0)(node)
    }
}

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomCheck(..)")
    }
}

impl KernelCandidate {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>, backend: BackendKind) -> Self {
        KernelCandidate {
            name: name.into(),
            op_type: op_type.into(),
            backend,
            priority: 0,
            inputs: vec![],
            outputs: vec![],
            attrs: vec![],
            range_limit: None,
            ref_pairs: vec![],
            fusion_kind: FusionKind::Opaque,
            custom_check: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn input(mut self, decl: SlotDecl) -> Self {
        self.inputs.push(decl);
        self
    }

    pub fn output(mut self, decl: SlotDecl) -> Self {
        self.outputs.push(decl);
        self
    }

    pub fn attr(mut self, decl: AttrDecl) -> Self {
        self.attrs.push(decl);
        self
    }

    pub fn with_range_limit(mut self, limit: RangeLimit) -> Self {
        self.range_limit = Some(limit);
        self
    }

    pub fn ref_pair(mut self, input: usize, output: usize) -> Self {
        self.ref_pairs.push((input, output));
        self
    }

    pub fn with_fusion_kind(mut self, kind: FusionKind) -> Self {
        self.fusion_kind = kind;
        self
    }

    pub fn with_custom_check(mut self, check: CustomCheck) -> Self {
        self.custom_check = Some(check);
        self
    }

    /// The number of columns in the support table.
    pub fn column_count(&self) -> usize {
        self.slots().next().map_or(0, |s| s.dtypes.len())
    }

    fn slots(&self) -> impl Iterator<Item = &SlotDecl> + '_ {
        self.inputs.iter().chain(&self.outputs)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let columns = self.column_count();
        if columns == 0 && self.slots().next().is_some() {
            return Err(CatalogError::EmptySupportTable {
                candidate: self.name.clone(),
            });
        }
        for decls in [&self.inputs, &self.outputs] {
            let mut seen = BTreeSet::new();
            for slot in decls {
                if !seen.insert(slot.name.as_str()) {
                    return Err(CatalogError::DuplicateSlot {
                        candidate: self.name.clone(),
                        slot: slot.name.clone(),
                    });
                }
                let widths = [Some(slot.dtypes.len()), slot.formats.as_ref().map(Vec::len)];
                if let Some(found) = widths.into_iter().flatten().find(|w| *w != columns) {
                    return Err(CatalogError::ColumnMismatch {
                        candidate: self.name.clone(),
                        slot: slot.name.clone(),
                        expected: columns,
                        found,
                    });
                }
            }
        }
        for attr in &self.attrs {
            if let AttrDomain::Values(values) = &attr.domain {
                if let Some(bad) = values.iter().find(|v| v.kind() != attr.kind) {
                    return Err(CatalogError::AttrDomainKind {
                        candidate: self.name.clone(),
                        attr: attr.name.clone(),
                        expected: attr.kind,
                        found: bad.kind(),
                    });
                }
            }
        }
        for &(input, output) in &self.ref_pairs {
            if input >= self.inputs.len() || output >= self.outputs.len() {
                return Err(CatalogError::RefPairOutOfRange {
                    candidate: self.name.clone(),
                    input,
                    output,
                });
            }
        }
        Ok(())
    }
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Candidates for an op type in the order they should be tried.
    pub fn candidates(&self, op_type: &str) -> &[KernelCandidate] {
        self.candidates.get(op_type).map_or(&[], Vec::as_slice)
    }

    pub fn candidate(&self, op_type: &str, name: &str) -> Option<&KernelCandidate> {
        self.candidates(op_type).iter().find(|c| c.name == name)
    }

    pub fn precision_class(&self, op_type: &str) -> PrecisionClass {
        self.precision
            .get(op_type)
            .copied()
            .unwrap_or(PrecisionClass::Neutral)
    }

    pub fn op_types(&self) -> impl Iterator<Item = &str> + '_ {
        self.candidates.keys().map(String::as_str)
    }
}

impl CatalogBuilder {
    pub fn add(&mut self, candidate: KernelCandidate) -> &mut Self {
        self.candidates.push(candidate);
        self
    }

    pub fn precision(&mut self, op_type: impl Into<String>, class: PrecisionClass) -> &mut Self {
        self.precision.insert(op_type.into(), class);
        self
    }

    /// Validates every candidate and freezes the catalog.
    ///
    /// Candidates of one op type are ordered by priority; equal priorities keep registration
    /// order.
    pub fn build(self) -> Result<Catalog, CatalogError> {
        let mut candidates: HashMap<String, Vec<KernelCandidate>> = HashMap::new();
        for candidate in self.candidates {
            candidate.validate()?;
            let list = candidates.entry(candidate.op_type.clone()).or_default();
            if list.iter().any(|c| c.name == candidate.name) {
                return Err(CatalogError::DuplicateCandidate {
                    op_type: candidate.op_type,
                    candidate: candidate.name,
                });
            }
            list.push(candidate);
        }
        for list in candidates.values_mut() {
            list.sort_by_key(|c| c.priority);
        }
        log::debug!(
            "Catalog built with {} candidate(s) over {} op type(s)",
            candidates.values().map(Vec::len).sum::<usize>(),
            candidates.len()
        );
        Ok(Catalog {
            candidates,
            precision: self.precision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unary(name: &str, priority: i32) -> KernelCandidate {
        KernelCandidate::new(name, "Relu", BackendKind::Vector)
            .with_priority(priority)
            .input(SlotDecl::required("x", vec![Dtype::Float16, Dtype::Float32]))
            .output(SlotDecl::required("y", vec![Dtype::Float16, Dtype::Float32]))
    }

    #[test]
    fn test_candidates_sort_by_priority_then_registration() {
        let mut b = Catalog::builder();
        b.add(unary("late", 2))
            .add(unary("first", 1))
            .add(unary("second", 1));
        let catalog = b.build().unwrap();
        let names: Vec<_> = catalog
            .candidates("Relu")
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, ["first", "second", "late"]);
        assert!(catalog.candidates("Conv2D").is_empty());
    }

    #[test]
    fn test_column_mismatch_is_rejected() {
        let mut b = Catalog::builder();
        b.add(
            KernelCandidate::new("bad", "Relu", BackendKind::Vector)
                .input(SlotDecl::required("x", vec![Dtype::Float16]))
                .output(
                    SlotDecl::required("y", vec![Dtype::Float16])
                        .with_formats(vec![Format::Nd, Format::Nchw]),
                ),
        );
        assert!(matches!(
            b.build(),
            Err(CatalogError::ColumnMismatch { found: 2, .. })
        ));
    }

    #[test]
    fn test_attr_domain_must_match_kind() {
        let mut b = Catalog::builder();
        b.add(unary("relu", 0).attr(
            AttrDecl::required("mode", AttrKind::Int).with_values(vec![AttrValue::Bool(true)]),
        ));
        assert!(matches!(
            b.build(),
            Err(CatalogError::AttrDomainKind { .. })
        ));
    }

    #[test]
    fn test_duplicate_candidate_is_rejected() {
        let mut b = Catalog::builder();
        b.add(unary("relu", 0)).add(unary("relu", 1));
        assert!(matches!(
            b.build(),
            Err(CatalogError::DuplicateCandidate { .. })
        ));
    }

    #[test]
    fn test_dynamic_slot_binding() {
        let decl = SlotDecl::dynamic("x", vec![Dtype::Float16]);
        assert!(decl.binds("x"));
        assert!(decl.binds("x0"));
        assert!(decl.binds("x12"));
        assert!(!decl.binds("xy"));
        assert!(!SlotDecl::required("x", vec![Dtype::Float16]).binds("x0"));
    }

    #[test]
    fn test_range_limit_check() {
        let limit = RangeLimit::new(128).with_max_volume(1000);
        assert_eq!(
            limit.check(&[DimRange::fixed(4), DimRange::new(1, Some(100))]),
            Ok(())
        );
        assert_eq!(
            limit.check(&[DimRange::fixed(4), DimRange::unbounded(1)]),
            Err(RangeViolation::Dim {
                axis: 1,
                upper: None
            })
        );
        assert_eq!(
            limit.check(&[DimRange::fixed(20), DimRange::new(1, Some(100))]),
            Err(RangeViolation::Volume {
                volume: Some(2000)
            })
        );
    }
}
