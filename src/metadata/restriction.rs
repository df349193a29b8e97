//! Metadata restrictions: conjunctive normal form of typed comparators
//!
//! Conditions added with `new_group = true` start a new conjunction group;
//! conditions with `new_group = false` join the previous group as
//! alternatives. A document matches when every group has at least one
//! matching condition (AND across groups, OR within a group).
//!
//! Comparisons are typed: integer columns compare exactly, float32 columns
//! within machine epsilon, float16 columns within a fixed epsilon of
//! 4.887581e-4.

use super::description::MetaDataType;
use super::reader::MetaDataReader;
use crate::error::Result;
use crate::types::{Index, ScalarValue};

const EPSILON_FLOAT32: f64 = f32::EPSILON as f64;
const EPSILON_FLOAT16: f64 = 4.887581e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOperator {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
}

type CompareFunction = fn(&ScalarValue, &ScalarValue) -> bool;

fn cmp_eq_eps(eps: f64) -> impl Fn(f64, f64) -> bool {
    move |a, b| a + eps >= b && a <= b + eps
}

fn compare_float(op: CompareOperator, eps: f64, a: f64, b: f64) -> bool {
    let eq = cmp_eq_eps(eps);
    match op {
        CompareOperator::Less => a + eps < b,
        CompareOperator::LessEqual => a <= b + eps,
        CompareOperator::Equal => eq(a, b),
        CompareOperator::NotEqual => !eq(a, b),
        CompareOperator::Greater => a > b + eps,
        CompareOperator::GreaterEqual => a + eps >= b,
    }
}

fn compare_fn_float32(op: CompareOperator) -> CompareFunction {
    match op {
        CompareOperator::Less => |a, b| compare_float(CompareOperator::Less, EPSILON_FLOAT32, a.to_float(), b.to_float()),
        CompareOperator::LessEqual => |a, b| compare_float(CompareOperator::LessEqual, EPSILON_FLOAT32, a.to_float(), b.to_float()),
        CompareOperator::Equal => |a, b| compare_float(CompareOperator::Equal, EPSILON_FLOAT32, a.to_float(), b.to_float()),
        CompareOperator::NotEqual => |a, b| compare_float(CompareOperator::NotEqual, EPSILON_FLOAT32, a.to_float(), b.to_float()),
        CompareOperator::Greater => |a, b| compare_float(CompareOperator::Greater, EPSILON_FLOAT32, a.to_float(), b.to_float()),
        CompareOperator::GreaterEqual => |a, b| compare_float(CompareOperator::GreaterEqual, EPSILON_FLOAT32, a.to_float(), b.to_float()),
    }
}

fn compare_fn_float16(op: CompareOperator) -> CompareFunction {
    match op {
        CompareOperator::Less => |a, b| compare_float(CompareOperator::Less, EPSILON_FLOAT16, a.to_float(), b.to_float()),
        CompareOperator::LessEqual => |a, b| compare_float(CompareOperator::LessEqual, EPSILON_FLOAT16, a.to_float(), b.to_float()),
        CompareOperator::Equal => |a, b| compare_float(CompareOperator::Equal, EPSILON_FLOAT16, a.to_float(), b.to_float()),
        CompareOperator::NotEqual => |a, b| compare_float(CompareOperator::NotEqual, EPSILON_FLOAT16, a.to_float(), b.to_float()),
        CompareOperator::Greater => |a, b| compare_float(CompareOperator::Greater, EPSILON_FLOAT16, a.to_float(), b.to_float()),
        CompareOperator::GreaterEqual => |a, b| compare_float(CompareOperator::GreaterEqual, EPSILON_FLOAT16, a.to_float(), b.to_float()),
    }
}

fn compare_fn_int(op: CompareOperator) -> CompareFunction {
    match op {
        CompareOperator::Less => |a, b| a.to_int() < b.to_int(),
        CompareOperator::LessEqual => |a, b| a.to_int() <= b.to_int(),
        CompareOperator::Equal => |a, b| a.to_int() == b.to_int(),
        CompareOperator::NotEqual => |a, b| a.to_int() != b.to_int(),
        CompareOperator::Greater => |a, b| a.to_int() > b.to_int(),
        CompareOperator::GreaterEqual => |a, b| a.to_int() >= b.to_int(),
    }
}

fn compare_fn_uint(op: CompareOperator) -> CompareFunction {
    match op {
        CompareOperator::Less => |a, b| a.to_uint() < b.to_uint(),
        CompareOperator::LessEqual => |a, b| a.to_uint() <= b.to_uint(),
        CompareOperator::Equal => |a, b| a.to_uint() == b.to_uint(),
        CompareOperator::NotEqual => |a, b| a.to_uint() != b.to_uint(),
        CompareOperator::Greater => |a, b| a.to_uint() > b.to_uint(),
        CompareOperator::GreaterEqual => |a, b| a.to_uint() >= b.to_uint(),
    }
}

fn compare_function(mtype: MetaDataType, op: CompareOperator) -> CompareFunction {
    match mtype {
        MetaDataType::Float16 => compare_fn_float16(op),
        MetaDataType::Float32 => compare_fn_float32(op),
        t if t.is_signed() => compare_fn_int(op),
        _ => compare_fn_uint(op),
    }
}

/// One compiled comparator.
#[derive(Clone)]
pub struct RestrictionCondition {
    func: CompareFunction,
    handle: Index,
    operand: ScalarValue,
    new_group: bool,
}

/// Compiled restriction: a CNF over metadata columns.
#[derive(Clone, Default)]
pub struct MetaDataRestriction {
    conditions: Vec<RestrictionCondition>,
}

impl MetaDataRestriction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one comparator. `new_group` opens a new AND group; otherwise the
    /// condition is an OR alternative of the previous one.
    pub fn add_condition(
        &mut self,
        reader: &MetaDataReader,
        op: CompareOperator,
        name: &str,
        operand: ScalarValue,
        new_group: bool,
    ) -> Result<()> {
        let handle = reader.element_handle(name)?;
        let mtype_name = reader.element_type(handle)?;
        let mtype = MetaDataType::parse(mtype_name)?;
        self.conditions.push(RestrictionCondition {
            func: compare_function(mtype, op),
            handle,
            operand,
            new_group,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Match the restriction against the document the reader is positioned
    /// on. AND across groups short-circuits on the first failing group.
    pub fn matches(&self, reader: &MetaDataReader) -> Result<bool> {
        let mut ci = self.conditions.iter().peekable();
        while let Some(first) = ci.next() {
            let mut group_match = (first.func)(&reader.get_value(first.handle)?, &first.operand);
            while let Some(next) = ci.peek() {
                if next.new_group {
                    break;
                }
                let next = ci.next().unwrap();
                if !group_match {
                    group_match = (next.func)(&reader.get_value(next.handle)?, &next.operand);
                }
            }
            if !group_match {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
