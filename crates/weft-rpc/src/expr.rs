//! Typed instruction tree and its textual wire form.
//!
//! Every value crossing the wire is an `Expr`: a literal, a structured
//! recursive value, or one of the capability/pipelining instructions. The
//! wire form is JSON; instructions are arrays with a leading string tag.
//! Literal arrays that would otherwise parse as instructions are wrapped in
//! one extra array level on encode and unwrapped on decode.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Number, Value as Json};

use crate::path::{PathViolation, PropertyPath};
use crate::value::ErrorKind;

/// Default cap on decoded expression nesting.
pub const DEFAULT_MAX_EXPR_DEPTH: u32 = 64;

/// Instruction tags recognized on the wire.
const TAGS: &[&str] = &[
    "undefined", "inf", "-inf", "nan", "bigint", "date", "bytes", "error", "export", "import",
    "pipeline", "remap",
];

fn is_tag(s: &str) -> bool {
    TAGS.contains(&s)
}

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// Wire decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Structurally invalid wire data. Protocol-fatal.
    Malformed { detail: String },
    /// Nesting beyond the configured limit. Protocol-fatal.
    DepthExceeded { max: u32 },
    /// Forbidden or invalid path element. Rejects the single call.
    Path(PathViolation),
}

impl DecodeError {
    fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { detail } => write!(f, "malformed expression: {detail}"),
            Self::DepthExceeded { max } => {
                write!(f, "expression nesting exceeds maximum depth {max}")
            }
            Self::Path(v) => write!(f, "{v}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<PathViolation> for DecodeError {
    fn from(v: PathViolation) -> Self {
        Self::Path(v)
    }
}

// ---------------------------------------------------------------------------
// Expr
// ---------------------------------------------------------------------------

/// One wire expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    /// A finite double.
    Number(f64),
    String(String),
    Undefined,
    Inf,
    NegInf,
    Nan,
    /// Decimal digits with optional leading `-`.
    BigInt(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Bytes(Vec<u8>),
    Error {
        kind: ErrorKind,
        message: String,
        stack: Option<String>,
    },
    Array(Vec<Expr>),
    /// Key order is preserved as received.
    Object(Vec<(String, Expr)>),
    /// A capability exported by the sender, keyed in the sender's namespace.
    Export(i64),
    /// A reference to a capability the sender holds, keyed as the sender
    /// holds it (or a map variable/capture index inside a recording).
    Import(i64),
    /// Property access or method call on a pending or settled subject.
    Pipeline {
        subject: i64,
        path: PropertyPath,
        args: Option<Vec<Expr>>,
    },
    /// A recorded transform applied to the subject.
    Remap {
        subject: i64,
        path: PropertyPath,
        captures: Vec<Expr>,
        body: Vec<Expr>,
    },
}

fn num(n: f64) -> Json {
    Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
}

impl Expr {
    /// Tag name for instruction variants, `None` for literals/structures.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Self::Undefined => Some("undefined"),
            Self::Inf => Some("inf"),
            Self::NegInf => Some("-inf"),
            Self::Nan => Some("nan"),
            Self::BigInt(_) => Some("bigint"),
            Self::Date(_) => Some("date"),
            Self::Bytes(_) => Some("bytes"),
            Self::Error { .. } => Some("error"),
            Self::Export(_) => Some("export"),
            Self::Import(_) => Some("import"),
            Self::Pipeline { .. } => Some("pipeline"),
            Self::Remap { .. } => Some("remap"),
            _ => None,
        }
    }

    /// Encode to the JSON wire form.
    pub fn to_wire(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => {
                // Non-finite doubles are routed through their tags so the
                // wire never carries an unrepresentable JSON number.
                if n.is_nan() {
                    Json::Array(vec![Json::String("nan".to_string())])
                } else if n.is_infinite() {
                    let tag = if *n > 0.0 { "inf" } else { "-inf" };
                    Json::Array(vec![Json::String(tag.to_string())])
                } else {
                    num(*n)
                }
            }
            Self::String(s) => Json::String(s.clone()),
            Self::Undefined => Json::Array(vec![Json::String("undefined".to_string())]),
            Self::Inf => Json::Array(vec![Json::String("inf".to_string())]),
            Self::NegInf => Json::Array(vec![Json::String("-inf".to_string())]),
            Self::Nan => Json::Array(vec![Json::String("nan".to_string())]),
            Self::BigInt(digits) => Json::Array(vec![
                Json::String("bigint".to_string()),
                Json::String(digits.clone()),
            ]),
            Self::Date(ms) => Json::Array(vec![Json::String("date".to_string()), num(*ms)]),
            Self::Bytes(bytes) => Json::Array(vec![
                Json::String("bytes".to_string()),
                Json::String(BASE64.encode(bytes)),
            ]),
            Self::Error {
                kind,
                message,
                stack,
            } => {
                let mut parts = vec![
                    Json::String("error".to_string()),
                    Json::String(kind.wire_name().to_string()),
                    Json::String(message.clone()),
                ];
                if let Some(stack) = stack {
                    parts.push(Json::String(stack.clone()));
                }
                Json::Array(parts)
            }
            Self::Array(items) => {
                let encoded: Vec<Json> = items.iter().map(Expr::to_wire).collect();
                let needs_escape = match encoded.first() {
                    Some(Json::Array(_)) => encoded.len() == 1,
                    Some(Json::String(s)) => is_tag(s),
                    _ => false,
                };
                if needs_escape {
                    Json::Array(vec![Json::Array(encoded)])
                } else {
                    Json::Array(encoded)
                }
            }
            Self::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_wire());
                }
                Json::Object(map)
            }
            Self::Export(id) => Json::Array(vec![
                Json::String("export".to_string()),
                Json::Number((*id).into()),
            ]),
            Self::Import(id) => Json::Array(vec![
                Json::String("import".to_string()),
                Json::Number((*id).into()),
            ]),
            Self::Pipeline {
                subject,
                path,
                args,
            } => {
                let mut parts = vec![
                    Json::String("pipeline".to_string()),
                    Json::Number((*subject).into()),
                    path.to_wire(),
                ];
                if let Some(args) = args {
                    parts.push(Json::Array(args.iter().map(Expr::to_wire).collect()));
                }
                Json::Array(parts)
            }
            Self::Remap {
                subject,
                path,
                captures,
                body,
            } => Json::Array(vec![
                Json::String("remap".to_string()),
                Json::Number((*subject).into()),
                path.to_wire(),
                Json::Array(captures.iter().map(Expr::to_wire).collect()),
                Json::Array(body.iter().map(Expr::to_wire).collect()),
            ]),
        }
    }

    /// Decode from the JSON wire form, enforcing `max_depth`.
    pub fn from_wire(value: &Json, max_depth: u32) -> Result<Expr, DecodeError> {
        if max_depth == 0 {
            return Err(DecodeError::DepthExceeded { max: 0 });
        }
        Self::decode(value, max_depth, max_depth)
    }

    fn decode(value: &Json, depth: u32, max: u32) -> Result<Expr, DecodeError> {
        if depth == 0 {
            return Err(DecodeError::DepthExceeded { max });
        }
        match value {
            Json::Null => Ok(Expr::Null),
            Json::Bool(b) => Ok(Expr::Bool(*b)),
            Json::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| DecodeError::malformed(format!("unrepresentable number {n}")))?;
                Ok(Expr::Number(n))
            }
            Json::String(s) => Ok(Expr::String(s.clone())),
            Json::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    entries.push((key.clone(), Self::decode(value, depth - 1, max)?));
                }
                Ok(Expr::Object(entries))
            }
            Json::Array(items) => Self::decode_array(items, depth, max),
        }
    }

    fn decode_array(items: &[Json], depth: u32, max: u32) -> Result<Expr, DecodeError> {
        // Escaped literal: a length-1 array holding the element list.
        if items.len() == 1 {
            if let Json::Array(inner) = &items[0] {
                let elements = inner
                    .iter()
                    .map(|item| Self::decode(item, depth - 1, max))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Expr::Array(elements));
            }
        }
        match items.first() {
            Some(Json::String(tag)) if is_tag(tag) => {
                Self::decode_instruction(tag, items, depth, max)
            }
            _ => {
                let elements = items
                    .iter()
                    .map(|item| Self::decode(item, depth - 1, max))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::Array(elements))
            }
        }
    }

    fn decode_instruction(
        tag: &str,
        items: &[Json],
        depth: u32,
        max: u32,
    ) -> Result<Expr, DecodeError> {
        let arity = |want: &[usize]| -> Result<(), DecodeError> {
            if want.contains(&items.len()) {
                Ok(())
            } else {
                Err(DecodeError::malformed(format!(
                    "'{tag}' instruction with {} elements",
                    items.len()
                )))
            }
        };
        let as_str = |item: &Json, what: &str| -> Result<String, DecodeError> {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| DecodeError::malformed(format!("'{tag}' {what} must be a string")))
        };
        let as_id = |item: &Json, what: &str| -> Result<i64, DecodeError> {
            item.as_i64()
                .ok_or_else(|| DecodeError::malformed(format!("'{tag}' {what} must be an integer")))
        };

        match tag {
            "undefined" => {
                arity(&[1])?;
                Ok(Expr::Undefined)
            }
            "inf" => {
                arity(&[1])?;
                Ok(Expr::Inf)
            }
            "-inf" => {
                arity(&[1])?;
                Ok(Expr::NegInf)
            }
            "nan" => {
                arity(&[1])?;
                Ok(Expr::Nan)
            }
            "bigint" => {
                arity(&[2])?;
                let digits = as_str(&items[1], "literal")?;
                if !crate::value::Value::is_valid_bigint_literal(&digits) {
                    return Err(DecodeError::malformed(format!(
                        "invalid bigint literal '{digits}'"
                    )));
                }
                Ok(Expr::BigInt(digits))
            }
            "date" => {
                arity(&[2])?;
                let ms = items[1]
                    .as_f64()
                    .ok_or_else(|| DecodeError::malformed("'date' timestamp must be a number"))?;
                Ok(Expr::Date(ms))
            }
            "bytes" => {
                arity(&[2])?;
                let encoded = as_str(&items[1], "payload")?;
                let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                    DecodeError::malformed(format!("invalid base64 byte payload: {e}"))
                })?;
                Ok(Expr::Bytes(bytes))
            }
            "error" => {
                arity(&[3, 4])?;
                let kind = ErrorKind::from_wire_name(&as_str(&items[1], "kind")?);
                let message = as_str(&items[2], "message")?;
                let stack = match items.get(3) {
                    Some(item) => Some(as_str(item, "stack")?),
                    None => None,
                };
                Ok(Expr::Error {
                    kind,
                    message,
                    stack,
                })
            }
            "export" => {
                arity(&[2])?;
                Ok(Expr::Export(as_id(&items[1], "id")?))
            }
            "import" => {
                arity(&[2])?;
                Ok(Expr::Import(as_id(&items[1], "id")?))
            }
            "pipeline" => {
                arity(&[3, 4])?;
                let subject = as_id(&items[1], "subject")?;
                let path = PropertyPath::from_wire(&items[2])?;
                let args = match items.get(3) {
                    Some(Json::Array(raw)) => Some(
                        raw.iter()
                            .map(|item| Self::decode(item, depth - 1, max))
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    Some(other) => {
                        return Err(DecodeError::malformed(format!(
                            "'pipeline' arguments must be an array, got {other}"
                        )));
                    }
                    None => None,
                };
                Ok(Expr::Pipeline {
                    subject,
                    path,
                    args,
                })
            }
            "remap" => {
                arity(&[5])?;
                let subject = as_id(&items[1], "subject")?;
                let path = PropertyPath::from_wire(&items[2])?;
                let captures = match &items[3] {
                    Json::Array(raw) => raw
                        .iter()
                        .map(|item| Self::decode(item, depth - 1, max))
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(DecodeError::malformed(format!(
                            "'remap' captures must be an array, got {other}"
                        )));
                    }
                };
                let body = match &items[4] {
                    Json::Array(raw) => raw
                        .iter()
                        .map(|item| Self::decode(item, depth - 1, max))
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(DecodeError::malformed(format!(
                            "'remap' body must be an array, got {other}"
                        )));
                    }
                };
                Ok(Expr::Remap {
                    subject,
                    path,
                    captures,
                    body,
                })
            }
            other => Err(DecodeError::malformed(format!("unknown tag '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(expr: Expr) -> Expr {
        let wire = expr.to_wire();
        Expr::from_wire(&wire, DEFAULT_MAX_EXPR_DEPTH).expect("decode")
    }

    #[test]
    fn literal_passthrough() {
        assert_eq!(Expr::Null.to_wire(), json!(null));
        assert_eq!(Expr::Bool(true).to_wire(), json!(true));
        assert_eq!(Expr::String("hi".to_string()).to_wire(), json!("hi"));
        assert_eq!(round_trip(Expr::Number(3.5)), Expr::Number(3.5));
    }

    #[test]
    fn tagged_specials_round_trip() {
        assert_eq!(Expr::Undefined.to_wire(), json!(["undefined"]));
        assert_eq!(round_trip(Expr::Undefined), Expr::Undefined);
        assert_eq!(round_trip(Expr::Inf), Expr::Inf);
        assert_eq!(round_trip(Expr::NegInf), Expr::NegInf);
        assert_eq!(round_trip(Expr::Nan), Expr::Nan);
    }

    #[test]
    fn non_finite_numbers_become_tags() {
        assert_eq!(Expr::Number(f64::INFINITY).to_wire(), json!(["inf"]));
        assert_eq!(Expr::Number(f64::NEG_INFINITY).to_wire(), json!(["-inf"]));
        assert_eq!(Expr::Number(f64::NAN).to_wire(), json!(["nan"]));
    }

    #[test]
    fn bigint_round_trip_and_validation() {
        let expr = Expr::BigInt("-123456789012345678901234567890".to_string());
        assert_eq!(round_trip(expr.clone()), expr);

        let err = Expr::from_wire(&json!(["bigint", "12x"]), 8).expect_err("invalid");
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn date_round_trip() {
        let expr = Expr::Date(1_700_000_123_456.0);
        assert_eq!(expr.to_wire(), json!(["date", 1_700_000_123_456.0]));
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn bytes_round_trip_via_base64() {
        let expr = Expr::Bytes(vec![0, 1, 2, 250, 251, 252]);
        let wire = expr.to_wire();
        assert_eq!(wire[0], json!("bytes"));
        assert_eq!(round_trip(expr.clone()), expr);

        let err = Expr::from_wire(&json!(["bytes", "!!!"]), 8).expect_err("bad base64");
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn error_round_trip_with_and_without_stack() {
        let bare = Expr::Error {
            kind: ErrorKind::Range,
            message: "out of range".to_string(),
            stack: None,
        };
        assert_eq!(bare.to_wire(), json!(["error", "range", "out of range"]));
        assert_eq!(round_trip(bare.clone()), bare);

        let with_stack = Expr::Error {
            kind: ErrorKind::Type,
            message: "boom".to_string(),
            stack: Some("at foo".to_string()),
        };
        assert_eq!(round_trip(with_stack.clone()), with_stack);
    }

    #[test]
    fn unknown_error_kind_decodes_to_generic() {
        let expr = Expr::from_wire(&json!(["error", "exotic", "m"]), 8).expect("decode");
        assert_eq!(
            expr,
            Expr::Error {
                kind: ErrorKind::Generic,
                message: "m".to_string(),
                stack: None,
            }
        );
    }

    #[test]
    fn plain_array_passthrough() {
        let expr = Expr::Array(vec![Expr::Number(1.0), Expr::Number(2.0)]);
        assert_eq!(expr.to_wire(), json!([1.0, 2.0]));
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn single_nested_array_is_escaped() {
        let expr = Expr::Array(vec![Expr::Array(vec![Expr::Number(1.0)])]);
        // [[1]] would decode as an escaped literal of [1], so one more wrap.
        assert_eq!(expr.to_wire(), json!([[[1.0]]]));
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn array_with_leading_tag_string_is_escaped() {
        let expr = Expr::Array(vec![Expr::String("date".to_string()), Expr::Number(5.0)]);
        assert_eq!(expr.to_wire(), json!([["date", 5.0]]));
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn array_with_non_tag_string_is_not_escaped() {
        let expr = Expr::Array(vec![Expr::String("hello".to_string()), Expr::Number(5.0)]);
        assert_eq!(expr.to_wire(), json!(["hello", 5.0]));
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn empty_array_round_trips() {
        let expr = Expr::Array(Vec::new());
        assert_eq!(expr.to_wire(), json!([]));
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn object_preserves_entries() {
        let expr = Expr::Object(vec![
            ("a".to_string(), Expr::Number(1.0)),
            ("b".to_string(), Expr::Array(vec![Expr::Null])),
        ]);
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn capability_references_round_trip() {
        assert_eq!(Expr::Export(3).to_wire(), json!(["export", 3]));
        assert_eq!(round_trip(Expr::Export(3)), Expr::Export(3));
        assert_eq!(round_trip(Expr::Import(-4)), Expr::Import(-4));
    }

    #[test]
    fn pipeline_round_trip() {
        let get = Expr::Pipeline {
            subject: 0,
            path: PropertyPath::keys(&["foo"]),
            args: None,
        };
        assert_eq!(get.to_wire(), json!(["pipeline", 0, ["foo"]]));
        assert_eq!(round_trip(get.clone()), get);

        let call = Expr::Pipeline {
            subject: 1,
            path: PropertyPath::keys(&["increment"]),
            args: Some(vec![Expr::Number(3.0)]),
        };
        assert_eq!(call.to_wire(), json!(["pipeline", 1, ["increment"], [3.0]]));
        assert_eq!(round_trip(call.clone()), call);
    }

    #[test]
    fn remap_round_trip() {
        let expr = Expr::Remap {
            subject: 2,
            path: PropertyPath::root(),
            captures: vec![Expr::Import(-1)],
            body: vec![
                Expr::Pipeline {
                    subject: -1,
                    path: PropertyPath::keys(&["add1"]),
                    args: Some(vec![Expr::Import(0)]),
                },
                Expr::Import(1),
            ],
        };
        assert_eq!(round_trip(expr.clone()), expr);
    }

    #[test]
    fn forbidden_path_element_is_a_path_error() {
        let err = Expr::from_wire(&json!(["pipeline", 0, ["__proto__"]]), 8).expect_err("reject");
        assert!(matches!(err, DecodeError::Path(_)));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut wire = json!(1);
        for _ in 0..10 {
            wire = json!([wire, 1]);
        }
        let err = Expr::from_wire(&wire, 4).expect_err("too deep");
        assert!(matches!(err, DecodeError::DepthExceeded { .. }));
    }

    #[test]
    fn malformed_instructions_are_rejected() {
        for wire in [
            json!(["undefined", 1]),
            json!(["bigint"]),
            json!(["date", "x"]),
            json!(["export", "x"]),
            json!(["pipeline", 0]),
            json!(["remap", 0, []]),
        ] {
            let err = Expr::from_wire(&wire, 8).expect_err("reject");
            assert!(matches!(err, DecodeError::Malformed { .. }), "{wire}");
        }
    }
}
