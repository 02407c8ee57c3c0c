//! Top-level error taxonomy.
//!
//! Protocol violations abort the session; everything else is scoped to one
//! call, one recording, or one hook. `RpcError` is the umbrella returned by
//! the public session surface.

use std::fmt;

use crate::hook::HookError;
use crate::map_builder::MapMisuse;
use crate::path::PathViolation;
use crate::session::ProtocolError;
use crate::value::ErrorValue;

/// Umbrella error for the public API.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// Fatal, session-ending violation.
    Protocol(ProtocolError),
    /// Misuse of the map recording surface.
    MapMisuse(MapMisuse),
    /// Forbidden or invalid property path.
    Path(PathViolation),
    /// An error raised by user target code.
    Target(ErrorValue),
    /// The underlying capability is known dead.
    Broken(ErrorValue),
    /// Hook handle contract violation.
    Hook(HookError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{e}"),
            Self::MapMisuse(e) => write!(f, "{e}"),
            Self::Path(e) => write!(f, "{e}"),
            Self::Target(e) => write!(f, "{e}"),
            Self::Broken(e) => write!(f, "broken capability: {e}"),
            Self::Hook(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<MapMisuse> for RpcError {
    fn from(e: MapMisuse) -> Self {
        Self::MapMisuse(e)
    }
}

impl From<PathViolation> for RpcError {
    fn from(e: PathViolation) -> Self {
        Self::Path(e)
    }
}

impl From<HookError> for RpcError {
    fn from(e: HookError) -> Self {
        Self::Hook(e)
    }
}
