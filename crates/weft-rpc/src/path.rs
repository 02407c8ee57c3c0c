//! Property paths addressing sub-values of a capability.
//!
//! A path is an ordered sequence of string keys and non-negative integer
//! indices; the empty path denotes the root. Path elements that collide
//! with root-object prototype member names are rejected at deserialization
//! so a peer can never address `__proto__`-style keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

// ---------------------------------------------------------------------------
// Forbidden keys
// ---------------------------------------------------------------------------

/// Property names that collide with root-object prototype members, plus
/// `toJSON`. These are rejected as path elements and dropped as object keys.
pub const FORBIDDEN_KEYS: &[&str] = &[
    "__proto__",
    "constructor",
    "hasOwnProperty",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toLocaleString",
    "toString",
    "valueOf",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
    "toJSON",
];

/// Is `key` one of the forbidden root-prototype member names?
pub fn is_forbidden_key(key: &str) -> bool {
    FORBIDDEN_KEYS.contains(&key)
}

// ---------------------------------------------------------------------------
// PathPart
// ---------------------------------------------------------------------------

/// One element of a property path: a string key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathPart {
    /// String key into an object.
    Key(String),
    /// Non-negative index into an array.
    Index(u64),
}

impl fmt::Display for PathPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "{k}"),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PathPart {
    fn from(s: &str) -> Self {
        Self::Key(s.to_string())
    }
}

impl From<String> for PathPart {
    fn from(s: String) -> Self {
        Self::Key(s)
    }
}

impl From<u64> for PathPart {
    fn from(i: u64) -> Self {
        Self::Index(i)
    }
}

// ---------------------------------------------------------------------------
// PropertyPath
// ---------------------------------------------------------------------------

/// Error raised when a wire path is structurally invalid or contains a
/// forbidden element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathViolation {
    /// Path element collides with a root-prototype member name.
    ForbiddenKey { key: String },
    /// Path element is neither a string nor a non-negative integer.
    InvalidElement { detail: String },
}

impl fmt::Display for PathViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForbiddenKey { key } => {
                write!(f, "forbidden path element '{key}'")
            }
            Self::InvalidElement { detail } => {
                write!(f, "invalid path element: {detail}")
            }
        }
    }
}

impl std::error::Error for PathViolation {}

/// An ordered sequence of path parts. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyPath(pub Vec<PathPart>);

impl PropertyPath {
    /// The root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from string keys.
    pub fn keys(keys: &[&str]) -> Self {
        Self(keys.iter().map(|k| PathPart::Key((*k).to_string())).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Concatenate `self` with `tail`, yielding an owned path.
    pub fn join(&self, tail: &PropertyPath) -> PropertyPath {
        let mut parts = self.0.clone();
        parts.extend(tail.0.iter().cloned());
        PropertyPath(parts)
    }

    /// Append a single part.
    pub fn push(&mut self, part: PathPart) {
        self.0.push(part);
    }

    /// Wire form: a JSON array of strings and non-negative integers.
    pub fn to_wire(&self) -> Json {
        Json::Array(
            self.0
                .iter()
                .map(|p| match p {
                    PathPart::Key(k) => Json::String(k.clone()),
                    PathPart::Index(i) => Json::Number((*i).into()),
                })
                .collect(),
        )
    }

    /// Parse a wire path, rejecting forbidden and malformed elements.
    pub fn from_wire(value: &Json) -> Result<Self, PathViolation> {
        let items = value.as_array().ok_or_else(|| PathViolation::InvalidElement {
            detail: format!("path must be an array, got {value}"),
        })?;
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Json::String(s) => {
                    if is_forbidden_key(s) {
                        return Err(PathViolation::ForbiddenKey { key: s.clone() });
                    }
                    parts.push(PathPart::Key(s.clone()));
                }
                Json::Number(n) => {
                    let idx = n.as_u64().ok_or_else(|| PathViolation::InvalidElement {
                        detail: format!("path index must be a non-negative integer, got {n}"),
                    })?;
                    parts.push(PathPart::Index(idx));
                }
                other => {
                    return Err(PathViolation::InvalidElement {
                        detail: format!("path element must be string or integer, got {other}"),
                    });
                }
            }
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(root)");
        }
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<Vec<PathPart>> for PropertyPath {
    fn from(parts: Vec<PathPart>) -> Self {
        Self(parts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
