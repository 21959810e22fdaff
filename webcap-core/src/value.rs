//! The runtime value domain.
//!
//! `Value` is what user code hands to and receives from the runtime: JSON
//! plus the typed primitives the wire dialect carries (bytes, dates, bigints,
//! undefined, non-finite floats) plus capabilities. Integers and floats are
//! separate variants so the wire-level class distinction survives in memory,
//! and so NaN and the infinities are representable at all.

use crate::error::RpcError;
use crate::stub::Stub;
use crate::RpcTarget;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An arbitrary-precision integer, held as its validated decimal spelling.
///
/// The wire form is exact by construction; no arithmetic is provided.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigInt(String);

impl BigInt {
    /// Accepts an optional leading `-` followed by digits with no leading
    /// zeros (except `"0"` itself).
    pub fn new(digits: impl Into<String>) -> Result<Self, RpcError> {
        let digits = digits.into();
        let body = digits.strip_prefix('-').unwrap_or(&digits);
        let valid = !body.is_empty()
            && body.bytes().all(|b| b.is_ascii_digit())
            && (body == "0" || !body.starts_with('0'));
        if valid {
            Ok(BigInt(digits))
        } else {
            Err(RpcError::bad_request(format!(
                "not a decimal integer: {:?}",
                digits
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for BigInt {
    fn from(n: i64) -> Self {
        BigInt(n.to_string())
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transported value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// Distinct absent value (vs null).
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    /// UTC timestamp, milliseconds since the epoch.
    Date(f64),
    BigInt(BigInt),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    /// An in-band failure value.
    Error(RpcError),
    /// A capability hosted by the remote peer (or a pipelined path into an
    /// unresolved result).
    Stub(Stub),
    /// A capability hosted locally; interned into the exports table when it
    /// crosses the wire.
    Target(Arc<dyn RpcTarget>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_stub(&self) -> Option<&Stub> {
        match self {
            Value::Stub(stub) => Some(stub),
            _ => None,
        }
    }

    /// A short name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::BigInt(_) => "bigint",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Error(_) => "error",
            Value::Stub(_) => "stub",
            Value::Target(_) => "capability",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) | (Undefined, Undefined) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            // Bitwise so NaN compares equal to itself under the structural
            // round-trip law.
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Date(a), Date(b)) => a.to_bits() == b.to_bits(),
            (BigInt(a), BigInt(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            (Stub(a), Stub(b)) => a.import() == b.import() && a.path() == b.path(),
            (Target(a), Target(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<RpcError> for Value {
    fn from(err: RpcError) -> Self {
        Value::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_accepts_canonical_decimals() {
        assert!(BigInt::new("0").is_ok());
        assert!(BigInt::new("-12345678901234567890123").is_ok());
        assert!(BigInt::new("007").is_err());
        assert!(BigInt::new("").is_err());
        assert!(BigInt::new("-").is_err());
        assert!(BigInt::new("1e3").is_err());
    }

    #[test]
    fn int_and_float_are_distinct() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn nan_is_structurally_equal_to_itself() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(f64::NAN), Value::Float(0.0));
    }

    #[test]
    fn null_and_undefined_are_distinct() {
        assert_ne!(Value::Null, Value::Undefined);
    }
}
