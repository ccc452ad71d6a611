use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::common::Dtype;
use crate::utils::join_into_string;

/// A typed operator attribute value.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strs(Vec<String>),
    Dtype(Dtype),
    Tensor(ConstTensor),
}

/// The kind of an [AttrValue], as declared by a kernel candidate's attribute schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AttrKind {
    Bool,
    Int,
    Float,
    Str,
    Ints,
    Floats,
    Strs,
    Dtype,
    Tensor,
}

/// Raw constant data, as held by `Const` nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ConstTensor {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Bool(_) => AttrKind::Bool,
            AttrValue::Int(_) => AttrKind::Int,
            AttrValue::Float(_) => AttrKind::Float,
            AttrValue::Str(_) => AttrKind::Str,
            AttrValue::Ints(_) => AttrKind::Ints,
            AttrValue::Floats(_) => AttrKind::Floats,
            AttrValue::Strs(_) => AttrKind::Strs,
            AttrValue::Dtype(_) => AttrKind::Dtype,
            AttrValue::Tensor(_) => AttrKind::Tensor,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&ConstTensor> {
        match self {
            AttrValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl ConstTensor {
    pub fn from_i64s(values: &[i64]) -> Self {
        ConstTensor {
            dtype: Dtype::Int64,
            shape: vec![values.len() as u64],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_f32s(shape: &[u64], values: &[f32]) -> Self {
        debug_assert_eq!(shape.iter().product::<u64>(), values.len() as u64);
        ConstTensor {
            dtype: Dtype::Float32,
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Decodes integer data, or returns `None` for non-integer dtypes.
    pub fn to_i64s(&self) -> Option<Vec<i64>> {
        match self.dtype {
            Dtype::Int64 => Some(
                self.data
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            ),
            Dtype::Int32 => Some(
                self.data
                    .chunks_exact(4)
                    .map(|c| i64::from(i32::from_le_bytes(c.try_into().unwrap())))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(x) => write!(f, "{x}"),
            AttrValue::Str(s) => write!(f, "{s:?}"),
            AttrValue::Ints(v) => write!(f, "[{}]", join_into_string(v, ", ")),
            AttrValue::Floats(v) => write!(f, "[{}]", join_into_string(v, ", ")),
            AttrValue::Strs(v) => write!(f, "[{}]", join_into_string(v, ", ")),
            AttrValue::Dtype(d) => write!(f, "{d}"),
            AttrValue::Tensor(t) => write!(
                f,
                "const<{}, [{}]>",
                t.dtype,
                join_into_string(&t.shape, ", ")
            ),
        }
    }
}
