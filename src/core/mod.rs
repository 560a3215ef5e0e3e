//! Core data structures and types for the Tempora archive

use bigdecimal::{BigDecimal, ToPrimitive};
use num_bigint::BigInt;

/// Context used when a tuple does not belong to a named context.
pub const DEFAULT_CONTEXT: &str = "kvin:nil";

/// User-facing tuple with URI strings, as accepted by `put` and produced by `fetch`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub item: String,
    pub property: String,
    pub context: String,
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// Disambiguates tuples sharing the same time.
    pub seq_nr: i32,
    pub value: Value,
}

impl Tuple {
    pub fn new(
        item: &str,
        property: &str,
        context: &str,
        time: i64,
        seq_nr: i32,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            item: item.to_string(),
            property: property.to_string(),
            context: context.to_string(),
            time,
            seq_nr,
            value: value.into(),
        }
    }
}

/// A value stored against a tuple.
///
/// `Int`, `Long`, `Float`, `Double`, `Str` and `Bool` are stored in native row
/// columns. Everything else goes through the tagged value codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bool(bool),
    Record(Record),
    Uri(String),
    Short(i16),
    BigInt(BigInt),
    BigDecimal(BigDecimal),
}

impl Value {
    /// Numeric view used by aggregation; `None` for non-numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::Short(v) => Some(f64::from(*v)),
            Value::BigInt(v) => v.to_f64(),
            Value::BigDecimal(v) => v.to_f64(),
            _ => None,
        }
    }

    /// Whether the value is an integral number that fits into an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Short(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

/// One link of a nested value: a property and the value it points to.
///
/// A chain is strictly linear: `value` may itself be a `Record`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub property: String,
    pub value: Box<Value>,
}

impl Record {
    pub fn new(property: &str, value: impl Into<Value>) -> Self {
        Self { property: property.to_string(), value: Box::new(value.into()) }
    }

    /// Number of records in this chain, counting `self`.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = self.value.as_ref();
        while let Value::Record(next) = current {
            depth += 1;
            current = next.value.as_ref();
        }
        depth
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Short(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::BigInt(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Value::BigDecimal(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(v)
    }
}

pub mod encoding;
pub mod json;
pub mod values;
pub use encoding::*;
