#![forbid(unsafe_code)]

//! Capability-based RPC runtime with promise pipelining and a record/replay
//! transform protocol.
//!
//! A [`session::Session`] is one end of a point-to-point peer: it owns the
//! refcounted capability tables, the value codec, and the map machinery, and
//! speaks a textual framed protocol over an external transport. Hooks
//! ([`hook::HookId`]) are the sole vehicle for capability references;
//! payloads own the hooks found inside their values.

pub mod codec;
pub mod error;
pub mod expr;
pub mod hook;
pub mod map_apply;
pub mod map_builder;
pub mod path;
pub mod payload;
pub mod session;
pub mod tables;
pub mod target;
pub mod value;

pub use error::RpcError;
pub use expr::Expr;
pub use hook::{HookId, HookKind, HookTable};
pub use map_builder::{MapMisuse, MapRecorder};
pub use path::{PathPart, PropertyPath};
pub use payload::Payload;
pub use session::{
    Frame, ProtocolError, PullId, Session, SessionConfig, SessionEvent, SessionState,
};
pub use target::{Target, TargetCtx};
pub use value::{ErrorKind, ErrorValue, Value};
