//! Devaluation (value → expression) and evaluation (expression → payload).
//!
//! Both directions are pure over their inputs plus an ambient party: an
//! `Exporter` allocates ids for local hooks met during devaluation, an
//! `Importer` turns capability references back into live hooks during
//! evaluation. The session implements both; the map builder and the map
//! applicator are the alternate implementers used while recording/replaying.

use std::collections::BTreeMap;
use std::fmt;

use crate::expr::{DecodeError, Expr};
use crate::hook::{HookError, HookId, HookKind, HookTable, ReleaseSink};
use crate::map_apply;
use crate::path::is_forbidden_key;
use crate::payload::Payload;
use crate::target::{invoke_call, invoke_get};
use crate::value::{ErrorValue, Value};

// ---------------------------------------------------------------------------
// CodecError / EvalError
// ---------------------------------------------------------------------------

/// Codec contract failures.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Wire decode failure (carried through for context).
    Decode(DecodeError),
    /// A capability reference addressed a table entry that does not exist.
    UnknownKey { id: i64 },
    /// A local capability was exported while recording a map callback.
    LocalCapabilityInMap,
    /// A recording placeholder escaped its builder.
    PlaceholderOutsideMap,
    /// An import reference occurred during map replay.
    ImportInReplay { id: i64 },
    /// The value cannot be expressed on the wire.
    Unrepresentable { detail: String },
    /// Hook table contract violation.
    Hook(HookError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{e}"),
            Self::UnknownKey { id } => write!(f, "unknown capability id {id}"),
            Self::LocalCapabilityInMap => {
                write!(f, "cannot construct a local target inside a mapper")
            }
            Self::PlaceholderOutsideMap => write!(f, "abstract placeholder used outside map"),
            Self::ImportInReplay { id } => {
                write!(f, "import {id} is not valid during map replay")
            }
            Self::Unrepresentable { detail } => write!(f, "unrepresentable value: {detail}"),
            Self::Hook(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<DecodeError> for CodecError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<HookError> for CodecError {
    fn from(e: HookError) -> Self {
        Self::Hook(e)
    }
}

/// Evaluation failure: either a codec contract violation (protocol-fatal at
/// the session layer) or an error raised by the evaluated operations
/// (rejects only the affected slot).
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    Codec(CodecError),
    Target(ErrorValue),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "{e}"),
            Self::Target(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<CodecError> for EvalError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<HookError> for EvalError {
    fn from(e: HookError) -> Self {
        Self::Codec(CodecError::Hook(e))
    }
}

// ---------------------------------------------------------------------------
// Exporter / Importer
// ---------------------------------------------------------------------------

/// Party consulted when devaluation meets a hook.
pub trait Exporter {
    /// Allocate an id for a settled local capability.
    fn export_stub(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError>;

    /// Allocate an id for an unsettled local capability.
    fn export_promise(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError>;

    /// Translate a held capability (import hook or recording placeholder)
    /// to the id the receiver will understand.
    fn get_import(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError>;
}

/// Outcome of resolving a subject/held-capability reference.
#[derive(Debug, Clone)]
pub enum ExportLookup {
    Hook(HookId),
    /// The referenced slot is already rejected.
    Failed(ErrorValue),
}

/// Party consulted when evaluation meets a capability reference.
pub trait Importer {
    /// Mint a live hook for a capability the sender exported. The returned
    /// hook is owned by the caller.
    fn import_stub(&mut self, hooks: &mut HookTable, id: i64) -> Result<HookId, CodecError>;

    /// Promise flavor of `import_stub`.
    fn import_promise(&mut self, hooks: &mut HookTable, id: i64) -> Result<HookId, CodecError>;

    /// Resolve a reference to a capability this side already holds
    /// (export-table entry, replay variable, or capture). The returned hook
    /// is borrowed; callers embedding it must `dup`.
    fn get_export(&mut self, id: i64) -> Result<ExportLookup, CodecError>;
}

// ---------------------------------------------------------------------------
// Devaluation
// ---------------------------------------------------------------------------

/// Encode a value as a wire expression. Hooks are routed through `exporter`;
/// object keys in the forbidden set are dropped without allocating exports.
pub fn devaluate(
    value: &Value,
    hooks: &mut HookTable,
    exporter: &mut dyn Exporter,
) -> Result<Expr, CodecError> {
    match value {
        Value::Undefined => Ok(Expr::Undefined),
        Value::Null => Ok(Expr::Null),
        Value::Bool(b) => Ok(Expr::Bool(*b)),
        Value::Number(n) => {
            if n.is_nan() {
                Ok(Expr::Nan)
            } else if n.is_infinite() {
                Ok(if *n > 0.0 { Expr::Inf } else { Expr::NegInf })
            } else {
                Ok(Expr::Number(*n))
            }
        }
        Value::BigInt(digits) => {
            if !Value::is_valid_bigint_literal(digits) {
                return Err(CodecError::Unrepresentable {
                    detail: format!("invalid bigint literal '{digits}'"),
                });
            }
            Ok(Expr::BigInt(digits.clone()))
        }
        Value::String(s) => Ok(Expr::String(s.clone())),
        Value::Date(ms) => Ok(Expr::Date(*ms)),
        Value::Bytes(bytes) => Ok(Expr::Bytes(bytes.clone())),
        Value::Error(e) => Ok(Expr::Error {
            kind: e.kind,
            message: e.message.clone(),
            stack: e.stack.clone(),
        }),
        Value::Array(items) => {
            let mut encoded = Vec::with_capacity(items.len());
            for item in items {
                encoded.push(devaluate(item, hooks, exporter)?);
            }
            Ok(Expr::Array(encoded))
        }
        Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, item) in map {
                if is_forbidden_key(key) {
                    continue;
                }
                entries.push((key.clone(), devaluate(item, hooks, exporter)?));
            }
            Ok(Expr::Object(entries))
        }
        Value::Stub(h) => devaluate_hook(*h, false, hooks, exporter),
        Value::Promise(h) => devaluate_hook(*h, true, hooks, exporter),
        Value::Pending(p) => Err(CodecError::Unrepresentable {
            detail: format!("payload pull {p} is still in flight"),
        }),
    }
}

/// Encode a single hook reference.
pub fn devaluate_hook(
    hook: HookId,
    promise: bool,
    hooks: &mut HookTable,
    exporter: &mut dyn Exporter,
) -> Result<Expr, CodecError> {
    let (is_import, path_empty, error) = match hooks.kind(hook)? {
        HookKind::Import { path, .. } => (true, path.is_empty(), None),
        HookKind::MapVariable { .. } => (true, true, None),
        HookKind::Error(e) | HookKind::Broken(e) => (false, true, Some(e.clone())),
        HookKind::LocalTarget { .. } | HookKind::PayloadStub { .. } => (false, true, None),
    };

    if let Some(e) = error {
        return Ok(Expr::Error {
            kind: e.kind,
            message: e.message.clone(),
            stack: e.stack.clone(),
        });
    }

    if is_import {
        let id = exporter.get_import(hooks, hook)?;
        if path_empty {
            Ok(Expr::Import(id))
        } else {
            let path = match hooks.kind(hook)? {
                HookKind::Import { path, .. } => path.clone(),
                _ => unreachable!("kind checked above"),
            };
            Ok(Expr::Pipeline {
                subject: id,
                path,
                args: None,
            })
        }
    } else if promise {
        Ok(Expr::Export(exporter.export_promise(hooks, hook)?))
    } else {
        Ok(Expr::Export(exporter.export_stub(hooks, hook)?))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Wrap an evaluated payload as a hook: a bare single stub unwraps to its
/// hook, anything else becomes a payload stub.
pub fn payload_to_hook(hooks: &mut HookTable, payload: Payload) -> HookId {
    if let Some(h) = payload.as_single_stub() {
        let _ = payload.into_hooks();
        return h;
    }
    hooks.insert(HookKind::PayloadStub { payload })
}

fn dispose_all(hooks: &mut HookTable, ids: Vec<HookId>, sink: &mut dyn ReleaseSink) {
    for id in ids {
        let _ = hooks.dispose_with(id, sink);
    }
}

/// Decode an expression into an owned payload. Capability references are
/// routed through `importer`; forbidden object keys are dropped after their
/// contents have been evaluated and released. Disposal side effects (import
/// entries losing their last hook) are reported through `sink`.
pub fn evaluate(
    expr: &Expr,
    hooks: &mut HookTable,
    importer: &mut dyn Importer,
    sink: &mut dyn ReleaseSink,
) -> Result<Payload, EvalError> {
    match expr {
        Expr::Null => Ok(Payload::plain(Value::Null)),
        Expr::Bool(b) => Ok(Payload::plain(Value::Bool(*b))),
        Expr::Number(n) => Ok(Payload::plain(Value::Number(*n))),
        Expr::String(s) => Ok(Payload::plain(Value::String(s.clone()))),
        Expr::Undefined => Ok(Payload::plain(Value::Undefined)),
        Expr::Inf => Ok(Payload::plain(Value::Number(f64::INFINITY))),
        Expr::NegInf => Ok(Payload::plain(Value::Number(f64::NEG_INFINITY))),
        Expr::Nan => Ok(Payload::plain(Value::Number(f64::NAN))),
        Expr::BigInt(digits) => Ok(Payload::plain(Value::BigInt(digits.clone()))),
        Expr::Date(ms) => Ok(Payload::plain(Value::Date(*ms))),
        Expr::Bytes(bytes) => Ok(Payload::plain(Value::Bytes(bytes.clone()))),
        Expr::Error {
            kind,
            message,
            stack,
        } => Ok(Payload::plain(Value::Error(ErrorValue {
            kind: *kind,
            message: message.clone(),
            stack: stack.clone(),
        }))),
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            let mut owned = Vec::new();
            for item in items {
                match evaluate(item, hooks, importer, sink) {
                    Ok(payload) => {
                        let (value, mut item_hooks) = payload.into_parts();
                        values.push(value);
                        owned.append(&mut item_hooks);
                    }
                    Err(e) => {
                        dispose_all(hooks, owned, sink);
                        return Err(e);
                    }
                }
            }
            Ok(Payload::new(Value::Array(values), owned))
        }
        Expr::Object(entries) => {
            let mut map = BTreeMap::new();
            let mut owned = Vec::new();
            for (key, item) in entries {
                match evaluate(item, hooks, importer, sink) {
                    Ok(payload) => {
                        if is_forbidden_key(key) {
                            // Contents were evaluated; release them so every
                            // minted hook is disposed exactly once.
                            if let Err(e) = payload.dispose(hooks, sink) {
                                dispose_all(hooks, owned, sink);
                                return Err(EvalError::from(e));
                            }
                            continue;
                        }
                        let (value, mut item_hooks) = payload.into_parts();
                        map.insert(key.clone(), value);
                        owned.append(&mut item_hooks);
                    }
                    Err(e) => {
                        dispose_all(hooks, owned, sink);
                        return Err(e);
                    }
                }
            }
            Ok(Payload::new(Value::Object(map), owned))
        }
        Expr::Export(id) => {
            let hook = importer.import_stub(hooks, *id)?;
            Ok(Payload::new(Value::Stub(hook), vec![hook]))
        }
        Expr::Import(id) => match importer.get_export(*id)? {
            ExportLookup::Hook(h) => {
                hooks.dup(h).map_err(CodecError::from)?;
                Ok(Payload::new(Value::Stub(h), vec![h]))
            }
            ExportLookup::Failed(e) => {
                let hook = hooks.insert(HookKind::Error(e));
                Ok(Payload::new(Value::Stub(hook), vec![hook]))
            }
        },
        Expr::Pipeline {
            subject,
            path,
            args,
        } => {
            let subject_hook = match importer.get_export(*subject)? {
                ExportLookup::Hook(h) => h,
                ExportLookup::Failed(e) => return Err(EvalError::Target(e)),
            };
            let result = match args {
                None => invoke_get(hooks, subject_hook, path),
                Some(arg_exprs) => {
                    let mut arg_values = Vec::with_capacity(arg_exprs.len());
                    let mut arg_hooks = Vec::new();
                    for arg in arg_exprs {
                        let payload = match evaluate(arg, hooks, importer, sink) {
                            Ok(payload) => payload,
                            Err(e) => {
                                dispose_all(hooks, arg_hooks, sink);
                                return Err(e);
                            }
                        };
                        let (value, mut item_hooks) = payload.into_parts();
                        arg_hooks.append(&mut item_hooks);
                        // Targets receive concrete data: payload-stub
                        // references (replay variables, settled results)
                        // are flattened to their cargo.
                        let flat = match map_apply::reify_value(hooks, &value) {
                            Ok(flat) => flat,
                            Err(e) => {
                                dispose_all(hooks, arg_hooks, sink);
                                return Err(EvalError::Target(e));
                            }
                        };
                        flat.collect_hooks(&mut arg_hooks);
                        arg_values.push(flat);
                    }
                    let outcome = invoke_call(hooks, subject_hook, path, arg_values);
                    // Arguments are callee-borrowed: targets that keep a
                    // capability must dup it.
                    dispose_all(hooks, arg_hooks, sink);
                    outcome
                }
            };
            match result {
                Ok(hook) => Ok(Payload::new(Value::Stub(hook), vec![hook])),
                Err(e) => Err(EvalError::Target(e)),
            }
        }
        Expr::Remap {
            subject,
            path,
            captures,
            body,
        } => {
            let subject_hook = match importer.get_export(*subject)? {
                ExportLookup::Hook(h) => h,
                ExportLookup::Failed(e) => return Err(EvalError::Target(e)),
            };

            let mut capture_hooks = Vec::with_capacity(captures.len());
            for capture in captures {
                match evaluate(capture, hooks, importer, sink) {
                    Ok(payload) => capture_hooks.push(payload_to_hook(hooks, payload)),
                    Err(e) => {
                        dispose_all(hooks, capture_hooks, sink);
                        return Err(e);
                    }
                }
            }

            // Materialize the mapped input from the subject.
            let input_hook = match invoke_get(hooks, subject_hook, path) {
                Ok(h) => h,
                Err(e) => {
                    dispose_all(hooks, capture_hooks, sink);
                    return Err(EvalError::Target(e));
                }
            };
            let input = match map_apply::hook_input_value(hooks, input_hook) {
                Ok(v) => v,
                Err(e) => {
                    dispose_all(hooks, vec![input_hook], sink);
                    dispose_all(hooks, capture_hooks, sink);
                    return Err(EvalError::Target(e));
                }
            };
            dispose_all(hooks, vec![input_hook], sink);

            map_apply::apply_map(hooks, input, capture_hooks, body, sink)
                .map_err(EvalError::Target)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
