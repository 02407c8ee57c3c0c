//! Host value model for the codec and the dispatch surface.
//!
//! `Value` is the owned, in-memory form of anything the runtime can carry:
//! primitives, dates, byte buffers, errors, nested objects/arrays, and
//! capability references (`Stub`/`Promise` hook handles). `BTreeMap` keeps
//! object iteration deterministic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::hook::HookId;
use crate::session::PullId;

// ---------------------------------------------------------------------------
// ErrorKind / ErrorValue
// ---------------------------------------------------------------------------

/// Error classification carried on the wire.
///
/// Unknown kinds decode to `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Generic,
    Eval,
    Range,
    Reference,
    Syntax,
    Type,
    Uri,
    Aggregate,
}

impl ErrorKind {
    /// Wire tag for this kind.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Eval => "eval",
            Self::Range => "range",
            Self::Reference => "reference",
            Self::Syntax => "syntax",
            Self::Type => "type",
            Self::Uri => "uri",
            Self::Aggregate => "aggregate",
        }
    }

    /// Parse a wire tag; anything unrecognized maps to `Generic`.
    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "eval" => Self::Eval,
            "range" => Self::Range,
            "reference" => Self::Reference,
            "syntax" => Self::Syntax,
            "type" => Self::Type,
            "uri" => Self::Uri,
            "aggregate" => Self::Aggregate,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A value-level error: the result of a failed target call or a decoded
/// `["error", …]` expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    /// Shorthand for a `Type`-kinded error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    /// Shorthand for a `Generic`-kinded error.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorValue {}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// An owned host value.
///
/// `Stub`/`Promise` carry hook handles; cloning a `Value` clones the handle
/// without adding a reference — use `Payload::deep_copy` for an owning copy.
/// `Pending` marks a payload pull that has not completed; it is only legal
/// transiently and is how an "asynchronous map callback" is detected.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    /// Any double, including the non-finite values (encoded with dedicated
    /// tags on the wire).
    Number(f64),
    /// Arbitrary-width integer as decimal digits with optional leading `-`.
    BigInt(String),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Bytes(Vec<u8>),
    Error(ErrorValue),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// A settled capability reference.
    Stub(HookId),
    /// An unsettled capability reference (pipelined result).
    Promise(HookId),
    /// A payload pull still in flight.
    Pending(PullId),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Bytes(_) => "bytes",
            Self::Error(_) => "error",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Stub(_) => "stub",
            Self::Promise(_) => "promise",
            Self::Pending(_) => "pending",
        }
    }

    /// Does this value (at any depth) contain a hook handle?
    pub fn contains_hooks(&self) -> bool {
        match self {
            Self::Stub(_) | Self::Promise(_) => true,
            Self::Array(items) => items.iter().any(Value::contains_hooks),
            Self::Object(map) => map.values().any(Value::contains_hooks),
            _ => false,
        }
    }

    /// Collect every hook handle in the value, in deterministic order.
    pub fn collect_hooks(&self, out: &mut Vec<HookId>) {
        match self {
            Self::Stub(h) | Self::Promise(h) => out.push(*h),
            Self::Array(items) => {
                for item in items {
                    item.collect_hooks(out);
                }
            }
            Self::Object(map) => {
                for item in map.values() {
                    item.collect_hooks(out);
                }
            }
            _ => {}
        }
    }

    /// Structural equality that treats `NaN == NaN` as true, for tests and
    /// round-trip assertions.
    pub fn same_shape(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a.is_nan() && b.is_nan()) || a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_shape(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_shape(vb))
            }
            _ => self == other,
        }
    }

    /// A `Date` from a chrono timestamp.
    pub fn from_datetime(dt: DateTime<Utc>) -> Value {
        Value::Date(dt.timestamp_millis() as f64)
    }

    /// The chrono timestamp of a `Date` value, when representable.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(ms) if ms.is_finite() => Utc.timestamp_millis_opt(*ms as i64).single(),
            _ => None,
        }
    }

    /// Validate a decimal big-integer literal (optional sign, digits only).
    pub fn is_valid_bigint_literal(digits: &str) -> bool {
        let body = digits.strip_prefix('-').unwrap_or(digits);
        !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::BigInt(d) => write!(f, "{d}n"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Date(ms) => write!(f, "[date {ms}ms]"),
            Self::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            Self::Error(e) => write!(f, "[{e}]"),
            Self::Array(items) => write!(f, "[array x{}]", items.len()),
            Self::Object(map) => write!(f, "[object x{}]", map.len()),
            Self::Stub(h) => write!(f, "[stub {h}]"),
            Self::Promise(h) => write!(f, "[promise {h}]"),
            Self::Pending(p) => write!(f, "[pending pull {p}]"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_wire_names_round_trip() {
        let kinds = [
            ErrorKind::Generic,
            ErrorKind::Eval,
            ErrorKind::Range,
            ErrorKind::Reference,
            ErrorKind::Syntax,
            ErrorKind::Type,
            ErrorKind::Uri,
            ErrorKind::Aggregate,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from_wire_name(kind.wire_name()), kind);
        }
    }

    #[test]
    fn unknown_error_kind_maps_to_generic() {
        assert_eq!(ErrorKind::from_wire_name("weird"), ErrorKind::Generic);
        assert_eq!(ErrorKind::from_wire_name(""), ErrorKind::Generic);
    }

    #[test]
    fn contains_hooks_sees_nested_stubs() {
        let mut map = BTreeMap::new();
        map.insert("inner".to_string(), Value::Stub(HookId(7)));
        let value = Value::Array(vec![Value::Null, Value::Object(map)]);
        assert!(value.contains_hooks());

        let mut hooks = Vec::new();
        value.collect_hooks(&mut hooks);
        assert_eq!(hooks, vec![HookId(7)]);
    }

    #[test]
    fn plain_values_have_no_hooks() {
        let value = Value::Array(vec![
            Value::Number(1.0),
            Value::String("x".to_string()),
            Value::Bytes(vec![1, 2, 3]),
        ]);
        assert!(!value.contains_hooks());
    }

    #[test]
    fn same_shape_treats_nan_as_equal() {
        assert!(Value::Number(f64::NAN).same_shape(&Value::Number(f64::NAN)));
        assert!(!Value::Number(f64::NAN).same_shape(&Value::Number(1.0)));
    }

    #[test]
    fn datetime_round_trip_at_millisecond_precision() {
        let dt = Utc.timestamp_millis_opt(1_700_000_123_456).single().expect("dt");
        let value = Value::from_datetime(dt);
        assert_eq!(value.as_datetime(), Some(dt));
    }

    #[test]
    fn bigint_literal_validation() {
        assert!(Value::is_valid_bigint_literal("0"));
        assert!(Value::is_valid_bigint_literal("-12345678901234567890"));
        assert!(!Value::is_valid_bigint_literal(""));
        assert!(!Value::is_valid_bigint_literal("-"));
        assert!(!Value::is_valid_bigint_literal("12x"));
        assert!(!Value::is_valid_bigint_literal("1.5"));
    }
}
