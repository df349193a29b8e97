//! Core identifier and value types shared across the engine

use serde::{Deserialize, Serialize};

/// Stable positive 32-bit identifier assigned by a key map.
/// Zero is reserved as "absent".
pub type Index = u32;

/// Document number
pub type DocNo = Index;

/// Term type number (e.g. "stem", "word")
pub type TypeNo = Index;

/// Term value number
pub type TermNo = Index;

/// Access control principal number
pub type UserNo = Index;

/// Attribute name number
pub type AttrNo = Index;

/// Token position inside a document (strictly positive, at most 65535 in blocks)
pub type Position = Index;

/// Collection-wide counter (documents inserted, aggregated df); at most 62 bits.
pub type GlobalCounter = u64;

/// Position type as stored in posinfo and structure blocks.
pub type BlockPos = u16;

/// A position range `[start, end]` inside a document. `(0, 0)` means undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRange {
    pub start: Index,
    pub end: Index,
}

impl IndexRange {
    pub fn new(start: Index, end: Index) -> Self {
        Self { start, end }
    }

    pub fn defined(&self) -> bool {
        self.end != 0
    }
}

/// Typed scalar stored in a metadata column.
///
/// The runtime conversions mirror what the on-disk column types need:
/// every variant converts to every other with ordinary numeric casts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl ScalarValue {
    pub fn defined(&self) -> bool {
        !matches!(self, ScalarValue::Null)
    }

    pub fn to_int(&self) -> i64 {
        match *self {
            ScalarValue::Null => 0,
            ScalarValue::Int(v) => v,
            ScalarValue::UInt(v) => v as i64,
            ScalarValue::Float(v) => v as i64,
        }
    }

    pub fn to_uint(&self) -> u64 {
        match *self {
            ScalarValue::Null => 0,
            ScalarValue::Int(v) => {
                if v < 0 {
                    0
                } else {
                    v as u64
                }
            }
            ScalarValue::UInt(v) => v,
            ScalarValue::Float(v) => {
                if v < 0.0 {
                    0
                } else {
                    v as u64
                }
            }
        }
    }

    pub fn to_float(&self) -> f64 {
        match *self {
            ScalarValue::Null => 0.0,
            ScalarValue::Int(v) => v as f64,
            ScalarValue::UInt(v) => v as f64,
            ScalarValue::Float(v) => v,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<u64> for ScalarValue {
    fn from(v: u64) -> Self {
        ScalarValue::UInt(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}
