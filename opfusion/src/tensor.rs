use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::fmt::Display;

use crate::common::{Dim, DimRange, Dtype, Format, Shape};
use crate::graph::NodeId;
use crate::utils::join_into_string;

#[derive(Clone, PartialEq, Eq, Debug, Hash, Deserialize, Serialize)]
pub struct TensorDesc {
    pub shape: Shape,
    pub origin_shape: Shape,
    /// Per-dimension bounds, indexed like `origin_shape`.
    pub shape_range: Vec<DimRange>,
    pub format: Format,
    pub sub_format: u32,
    pub origin_format: Format,
    pub dtype: Dtype,
    pub origin_dtype: Dtype,
    marks: BTreeSet<TensorMark>,
    pub provenance: Option<Provenance>,
    pub size_bytes: Option<u64>,
}

/// Derived facts recorded on a [TensorDesc] so later passes can skip redundant work.
///
/// Marks are only ever added.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Deserialize, Serialize)]
pub enum TensorMark {
    FormatUpdated,
    DtypeUpdated,
    /// A float32 -> float16 relaxation would have been accepted by a candidate, but the
    /// precision policy refused it.
    RelaxationObserved,
    HeavyFormatPropagated,
    RangeGeneralized,
}

/// Why a tensor carries its (heavy) format: the slot its format was copied from.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Deserialize, Serialize)]
pub struct Provenance {
    pub source_node: NodeId,
    pub source_name: String,
    pub source_output: bool,
    pub source_index: usize,
}

impl TensorDesc {
    pub fn new(shape: Shape, dtype: Dtype, format: Format) -> Self {
        let shape_range = shape.iter().map(|d| DimRange::for_dim(*d)).collect();
        TensorDesc {
            origin_shape: shape.clone(),
            shape,
            shape_range,
            format,
            sub_format: 0,
            origin_format: format,
            dtype,
            origin_dtype: dtype,
            marks: BTreeSet::new(),
            provenance: None,
            size_bytes: None,
        }
    }

    pub fn with_range(mut self, ranges: Vec<DimRange>) -> Self {
        assert_eq!(
            ranges.len(),
            self.origin_shape.len(),
            "range rank must match shape rank"
        );
        self.shape_range = ranges;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|d| !d.is_known())
    }

    /// The element count, if every dimension is known.
    pub fn volume(&self) -> Option<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, d| d.known().map(|v| acc.saturating_mul(v)))
    }

    /// The element count with unknown dimensions replaced by their range upper bounds.
    pub fn max_volume(&self) -> Option<u64> {
        self.max_shape()?
            .iter()
            .try_fold(1u64, |acc, d| d.known().map(|v| acc.saturating_mul(v)))
    }

    /// The physical shape with unknown origin dimensions replaced by their range upper
    /// bounds, or `None` if some unknown dimension is unbounded.
    pub fn max_shape(&self) -> Option<Shape> {
        if !self.is_dynamic() {
            return Some(self.shape.clone());
        }
        let bounded = self
            .origin_shape
            .iter()
            .enumerate()
            .map(|(i, d)| match d {
                Dim::Known(v) => Some(Dim::Known(*v)),
                Dim::Unknown => self.shape_range.get(i)?.upper.map(Dim::Known),
            })
            .collect::<Option<Shape>>()?;
        self.format
            .derive_shape(self.origin_format, &bounded, self.dtype)
    }

    pub fn marks(&self) -> &BTreeSet<TensorMark> {
        &self.marks
    }

    pub fn has_mark(&self, mark: TensorMark) -> bool {
        self.marks.contains(&mark)
    }

    pub fn mark(&mut self, mark: TensorMark) {
        self.marks.insert(mark);
    }

    /// Returns `true` if two descriptors need a layout conversion node between them.
    ///
    /// `ND` and `RESERVED` relabel freely to any plain format.
    pub fn layout_differs(&self, other: &TensorDesc) -> bool {
        if self.format == other.format {
            return self.sub_format != other.sub_format;
        }
        if self.format.is_heavy() || other.format.is_heavy() {
            return true;
        }
        !(self.format.is_flexible() || other.format.is_flexible())
    }

    pub fn dtype_differs(&self, other: &TensorDesc) -> bool {
        self.dtype != other.dtype
    }

    /// Sets the format. Heavy formats derive the physical shape from the origin shape; plain
    /// formats relabel a flexible (`ND` / `RESERVED`) tensor in place.
    ///
    /// Returns `false` (leaving `self` unchanged) if the conversion is not possible.
    pub fn set_format(&mut self, format: Format) -> bool {
        if format == self.format {
            return true;
        }
        let origin = if self.origin_format.is_reserved() {
            Format::Nd
        } else {
            self.origin_format
        };
        if format.is_heavy() {
            let Some(shape) = format.derive_shape(origin, &self.origin_shape, self.dtype) else {
                return false;
            };
            self.shape = shape;
            self.origin_format = origin;
        } else if self.format.is_flexible() || origin.is_flexible() || format == origin {
            self.shape = self.origin_shape.clone();
            if origin.is_flexible() {
                self.origin_format = format;
            }
        } else {
            return false;
        }
        self.format = format;
        self.mark(TensorMark::FormatUpdated);
        true
    }

    pub fn set_dtype(&mut self, dtype: Dtype) {
        if dtype != self.dtype {
            self.dtype = dtype;
            self.mark(TensorMark::DtypeUpdated);
        }
    }
}

impl Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, [{}])",
            self.dtype,
            self.format,
            join_into_string(&self.shape, ", ")
        )
    }
}
