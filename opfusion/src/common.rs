use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

pub type Shape = SmallVec<[Dim; 6]>;

/// A single dimension of a tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dim {
    Known(u64),
    Unknown,
}

/// Inclusive bounds of a dimension. An `upper` of `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DimRange {
    pub lower: u64,
    pub upper: Option<u64>,
}

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
#[strum(serialize_all = "lowercase")]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Float32,
    Float16,
    Bfloat16,
    Int8,
    Uint8,
    Int16,
    Int32,
    Int64,
    Bool,
    Undefined,
}

/// Tensor memory layout.
///
/// Heavy formats (see [Format::is_heavy]) are blocked layouts whose physical shape differs from
/// the logical shape. They are derived from a plain origin format by
/// [Format::derive_shape].
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
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Format {
    #[strum(serialize = "ND")]
    Nd,
    #[strum(serialize = "NCHW")]
    Nchw,
    #[strum(serialize = "NHWC")]
    Nhwc,
    #[strum(serialize = "HWCN")]
    Hwcn,
    #[strum(serialize = "NCDHW")]
    Ncdhw,
    #[strum(serialize = "NC1HWC0")]
    Nc1hwc0,
    #[strum(serialize = "FRACTAL_Z")]
    FractalZ,
    #[strum(serialize = "FRACTAL_NZ")]
    FractalNz,
    #[strum(serialize = "NDC1HWC0")]
    Ndc1hwc0,
    #[strum(serialize = "RESERVED")]
    Reserved,
}

const CUBE_BLOCK: u64 = 16;

impl Dim {
    pub fn known(&self) -> Option<u64> {
        match self {
            Dim::Known(v) => Some(*v),
            Dim::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Dim::Known(_))
    }

    fn map(self, f: impl FnOnce(u64) -> u64) -> Dim {
        match self {
            Dim::Known(v) => Dim::Known(f(v)),
            Dim::Unknown => Dim::Unknown,
        }
    }
}

impl From<u64> for Dim {
    fn from(value: u64) -> Self {
        Dim::Known(value)
    }
}

impl Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Known(v) => write!(f, "{v}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

impl DimRange {
    pub fn fixed(value: u64) -> Self {
        DimRange {
            lower: value,
            upper: Some(value),
        }
    }

    pub fn unbounded(lower: u64) -> Self {
        DimRange { lower, upper: None }
    }

    pub fn new(lower: u64, upper: Option<u64>) -> Self {
        debug_assert!(upper.map_or(true, |u| u >= lower));
        DimRange { lower, upper }
    }

    /// The range implied by a dimension with no declared range.
    pub fn for_dim(dim: Dim) -> Self {
        match dim {
            Dim::Known(v) => DimRange::fixed(v),
            Dim::Unknown => DimRange::unbounded(1),
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.upper == Some(self.lower)
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.lower && self.upper.map_or(true, |u| value <= u)
    }

    /// The smallest range covering both `self` and `other`.
    pub fn union(&self, other: &DimRange) -> DimRange {
        DimRange {
            lower: self.lower.min(other.lower),
            upper: match (self.upper, other.upper) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }
}

impl Display for DimRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upper {
            Some(u) => write!(f, "[{}, {}]", self.lower, u),
            None => write!(f, "[{}, -)", self.lower),
        }
    }
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Int8 | Dtype::Uint8 | Dtype::Bool => 1,
            Dtype::Float16 | Dtype::Bfloat16 | Dtype::Int16 => 2,
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Int64 => 8,
            Dtype::Undefined => 0,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float16 | Dtype::Bfloat16)
    }

    /// Whether a value of this type may be carried in `narrower` under a precision-reducing
    /// policy.
    pub fn may_reduce_to(&self, narrower: Dtype) -> bool {
        matches!((self, narrower), (Dtype::Float32, Dtype::Float16))
    }

    /// Size of the innermost block of a heavy format holding this type.
    pub fn cube_c0(&self) -> u64 {
        if self.size() == 1 {
            32
        } else {
            CUBE_BLOCK
        }
    }
}

impl Format {
    pub fn is_heavy(&self) -> bool {
        matches!(
            self,
            Format::Nc1hwc0 | Format::FractalZ | Format::FractalNz | Format::Ndc1hwc0
        )
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, Format::Reserved)
    }

    /// Formats that impose no particular plain layout.
    pub fn is_flexible(&self) -> bool {
        matches!(self, Format::Nd | Format::Reserved)
    }

    /// Returns `true` if tensors laid out in `origin` can be converted into `self`.
    ///
    /// Plain formats are convertible only to themselves.
    pub fn derivable_from(&self, origin: Format, rank: usize) -> bool {
        if *self == origin {
            return true;
        }
        match self {
            Format::Nc1hwc0 => match origin {
                Format::Nchw | Format::Nhwc | Format::Hwcn => rank == 4,
                Format::Nd => rank == 4,
                _ => false,
            },
            Format::FractalZ => {
                matches!(origin, Format::Nchw | Format::Nhwc | Format::Hwcn) && rank == 4
            }
            Format::Ndc1hwc0 => origin == Format::Ncdhw && rank == 5,
            Format::FractalNz => origin == Format::Nd && rank >= 2,
            _ => false,
        }
    }

    /// Computes the physical shape of a tensor stored in `self` given its logical shape in
    /// `origin`.
    ///
    /// Returns `None` if `self` cannot be derived from `origin` for a shape of this rank. A
    /// shape already in `self` is returned unchanged.
    pub fn derive_shape(&self, origin: Format, origin_shape: &[Dim], dtype: Dtype) -> Option<Shape> {
        if !self.derivable_from(origin, origin_shape.len()) {
            return None;
        }
        if *self == origin || !self.is_heavy() {
            return Some(origin_shape.iter().copied().collect());
        }
        let c0 = dtype.cube_c0();
        let blocks = |d: Dim, b: u64| d.map(|v| v.div_ceil(b));
        match self {
            Format::Nc1hwc0 => {
                let [n, c, h, w] = nchw_axes(origin, origin_shape)?;
                Some(Shape::from_slice(&[n, blocks(c, c0), h, w, Dim::Known(c0)]))
            }
            Format::Ndc1hwc0 => {
                let &[n, c, d, h, w] = origin_shape else {
                    return None;
                };
                Some(Shape::from_slice(&[n, d, blocks(c, c0), h, w, Dim::Known(c0)]))
            }
            Format::FractalZ => {
                let [n, c, h, w] = nchw_axes(origin, origin_shape)?;
                let c1hw = match (blocks(c, c0), h, w) {
                    (Dim::Known(c1), Dim::Known(h), Dim::Known(w)) => {
                        Dim::Known(c1.saturating_mul(h).saturating_mul(w))
                    }
                    _ => Dim::Unknown,
                };
                Some(Shape::from_slice(&[
                    c1hw,
                    blocks(n, CUBE_BLOCK),
                    Dim::Known(CUBE_BLOCK),
                    Dim::Known(c0),
                ]))
            }
            Format::FractalNz => {
                let [batch @ .., m, n] = origin_shape else {
                    return None;
                };
                let mut shape: Shape = batch.iter().copied().collect();
                shape.extend([
                    blocks(*n, c0),
                    blocks(*m, CUBE_BLOCK),
                    Dim::Known(CUBE_BLOCK),
                    Dim::Known(c0),
                ]);
                Some(shape)
            }
            _ => unreachable!(),
        }
    }
}

/// Reorders a rank-4 shape into (N, C, H, W) order.
fn nchw_axes(origin: Format, shape: &[Dim]) -> Option<[Dim; 4]> {
    let &[a, b, c, d] = shape else {
        return None;
    };
    match origin {
        Format::Nchw | Format::Nd => Some([a, b, c, d]),
        Format::Nhwc => Some([a, d, b, c]),
        Format::Hwcn => Some([d, c, a, b]),
        _ => None,
    }
}

/// Builds a [Shape] of known dimensions.
pub fn static_shape(dims: &[u64]) -> Shape {
    dims.iter().map(|&d| Dim::Known(d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    #[test]
    fn test_format_names_roundtrip_through_strum() {
        assert_eq!(Format::from_str("FRACTAL_Z").unwrap(), Format::FractalZ);
        assert_eq!(Format::Nc1hwc0.to_string(), "NC1HWC0");
        assert_eq!(Dtype::from_str("float16").unwrap(), Dtype::Float16);
        assert_eq!(Dtype::Bfloat16.to_string(), "bfloat16");
    }

    #[test]
    fn test_nc1hwc0_from_nhwc() {
        let shape = Format::Nc1hwc0
            .derive_shape(Format::Nhwc, &static_shape(&[2, 7, 7, 33]), Dtype::Float16)
            .unwrap();
        assert_eq!(shape, static_shape(&[2, 3, 7, 7, 16]));
    }

    #[test]
    fn test_nc1hwc0_uses_wider_block_for_int8() {
        let shape = Format::Nc1hwc0
            .derive_shape(Format::Nchw, &static_shape(&[1, 64, 4, 4]), Dtype::Int8)
            .unwrap();
        assert_eq!(shape, static_shape(&[1, 2, 4, 4, 32]));
    }

    #[test]
    fn test_fractal_nz_keeps_batch_dims() {
        let shape = Format::FractalNz
            .derive_shape(Format::Nd, &static_shape(&[8, 30, 40]), Dtype::Float16)
            .unwrap();
        assert_eq!(shape, static_shape(&[8, 3, 2, 16, 16]));
    }

    #[test]
    fn test_unknown_dims_stay_unknown() {
        let origin = [Dim::Unknown, Dim::Known(32), Dim::Known(5), Dim::Known(5)];
        let shape = Format::Nc1hwc0
            .derive_shape(Format::Nchw, &origin, Dtype::Float16)
            .unwrap();
        assert_eq!(shape[0], Dim::Unknown);
        assert_eq!(shape[1], Dim::Known(2));
    }

    #[test]
    fn test_heavy_format_rejects_wrong_rank() {
        assert!(Format::Nc1hwc0
            .derive_shape(Format::Nchw, &static_shape(&[4, 4]), Dtype::Float16)
            .is_none());
    }

    #[test]
    fn test_shape_already_in_format_is_unchanged() {
        let physical = static_shape(&[2, 2, 16, 16]);
        let shape = Format::FractalNz
            .derive_shape(Format::FractalNz, &physical, Dtype::Float16)
            .unwrap();
        assert_eq!(shape, physical);
        let short = [Dim::Unknown];
        assert_eq!(
            Format::FractalNz
                .derive_shape(Format::FractalNz, &short, Dtype::Float16)
                .unwrap()
                .as_slice(),
            &short
        );
    }

    #[test]
    fn test_fractal_nz_needs_two_axes() {
        assert!(Format::FractalNz
            .derive_shape(Format::Nd, &static_shape(&[8]), Dtype::Float16)
            .is_none());
    }

    #[test]
    fn test_fractal_z_block_count_saturates() {
        let shape = Format::FractalZ
            .derive_shape(Format::Nchw, &static_shape(&[16, 16, u64::MAX, 2]), Dtype::Float16)
            .unwrap();
        assert_eq!(shape[0], Dim::Known(u64::MAX));
        assert_eq!(shape[1], Dim::Known(1));
    }

    proptest! {
        #[test]
        fn test_plain_formats_derive_only_themselves(a in any::<Format>(), b in any::<Format>()) {
            prop_assume!(!a.is_heavy() && a != b);
            prop_assert!(!a.derivable_from(b, 4));
        }

        #[test]
        fn test_union_contains_both(l1 in 1..50u64, w1 in 0..50u64, l2 in 1..50u64, w2 in 0..50u64) {
            let a = DimRange::new(l1, Some(l1 + w1));
            let b = DimRange::new(l2, Some(l2 + w2));
            let u = a.union(&b);
            prop_assert!(u.contains(l1) && u.contains(l1 + w1));
            prop_assert!(u.contains(l2) && u.contains(l2 + w2));
        }
    }
}
