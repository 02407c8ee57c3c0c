//! The session: a sans-IO message loop over framed messages.
//!
//! The transport is external; the embedder feeds whole inbound messages to
//! `handle_message` and drains whole outbound messages from `outgoing`.
//! All table state is owned here and mutated only on this loop. Protocol
//! violations are fatal: the session queues an `abort` frame, breaks every
//! import, and refuses further frames. Target errors and path errors are
//! per-call; the session continues.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::codec::{
    devaluate, devaluate_hook, evaluate, payload_to_hook, CodecError, EvalError, Exporter,
    ExportLookup, Importer,
};
use crate::error::RpcError;
use crate::expr::{DecodeError, Expr, DEFAULT_MAX_EXPR_DEPTH};
use crate::hook::{CollectSink, HookError, HookId, HookKind, HookTable};
use crate::map_apply;
use crate::map_builder::{BuilderStack, CaptureRef, MapMisuse, MapRecorder, RecordedMap};
use crate::path::PropertyPath;
use crate::payload::Payload;
use crate::tables::{ExportTable, ImportState, ImportTable, PromiseState, TableError};
use crate::target::{invoke_call, invoke_get, Target};
use crate::value::{ErrorValue, Value};

// ---------------------------------------------------------------------------
// Ids and configuration
// ---------------------------------------------------------------------------

/// Handle for an outstanding payload pull.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PullId(pub u64);

impl fmt::Display for PullId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pull#{}", self.0)
    }
}

/// Session behavior limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_bytes: usize,
    /// Maximum decoded expression nesting.
    pub max_expr_depth: u32,
    /// Maximum instructions in one recorded map.
    pub max_map_instructions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1 << 20,
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
            max_map_instructions: 1_024,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Aborted,
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

pub const ERROR_MALFORMED: &str = "WR-SESS-1001";
pub const ERROR_UNKNOWN_TAG: &str = "WR-SESS-1002";
pub const ERROR_ID_IN_USE: &str = "WR-SESS-1003";
pub const ERROR_UNKNOWN_ID: &str = "WR-SESS-1004";
pub const ERROR_UNDERFLOW: &str = "WR-SESS-1005";
pub const ERROR_BOOTSTRAP_RELEASE: &str = "WR-SESS-1006";
pub const ERROR_OVERSIZED: &str = "WR-SESS-1007";
pub const ERROR_ABORTED: &str = "WR-SESS-1008";
pub const ERROR_INTERNAL: &str = "WR-SESS-1009";

/// Fatal, session-ending protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {detail}")]
    Malformed { detail: String },
    #[error("unknown frame tag '{tag}'")]
    UnknownTag { tag: String },
    #[error("push id {id} already in use")]
    IdInUse { id: i64 },
    #[error("no table entry for id {id}")]
    UnknownId { id: i64 },
    #[error("refcount underflow on id {id}: held {held}, released {released}")]
    RefcountUnderflow { id: i64, held: u32, released: u32 },
    #[error("bootstrap id 0 cannot be released")]
    BootstrapRelease,
    #[error("frame of {size} bytes exceeds limit {max}")]
    Oversized { size: usize, max: usize },
    #[error("session already aborted")]
    SessionAborted,
    #[error("internal session invariant violated: {detail}")]
    Internal { detail: String },
}

impl ProtocolError {
    /// Stable error code for audit events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => ERROR_MALFORMED,
            Self::UnknownTag { .. } => ERROR_UNKNOWN_TAG,
            Self::IdInUse { .. } => ERROR_ID_IN_USE,
            Self::UnknownId { .. } => ERROR_UNKNOWN_ID,
            Self::RefcountUnderflow { .. } => ERROR_UNDERFLOW,
            Self::BootstrapRelease => ERROR_BOOTSTRAP_RELEASE,
            Self::Oversized { .. } => ERROR_OVERSIZED,
            Self::SessionAborted => ERROR_ABORTED,
            Self::Internal { .. } => ERROR_INTERNAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Push { id: i64, expr: Expr },
    Pull { id: i64 },
    Resolve { id: i64, expr: Expr },
    Reject { id: i64, expr: Expr },
    Release { id: i64, count: u32 },
    Abort,
}

impl Frame {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Pull { .. } => "pull",
            Self::Resolve { .. } => "resolve",
            Self::Reject { .. } => "reject",
            Self::Release { .. } => "release",
            Self::Abort => "abort",
        }
    }

    pub fn to_wire(&self) -> Json {
        let tag = Json::String(self.tag().to_string());
        match self {
            Self::Push { id, expr } | Self::Resolve { id, expr } | Self::Reject { id, expr } => {
                Json::Array(vec![tag, Json::Number((*id).into()), expr.to_wire()])
            }
            Self::Pull { id } => Json::Array(vec![tag, Json::Number((*id).into())]),
            Self::Release { id, count } => Json::Array(vec![
                tag,
                Json::Number((*id).into()),
                Json::Number((*count).into()),
            ]),
            Self::Abort => Json::Array(vec![tag]),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Wire values are always representable JSON.
        serde_json::to_vec(&self.to_wire()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Structured audit event, drained by the embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    FrameReceived { tag: String },
    FrameSent { tag: String },
    PushEvaluated { id: i64, rejected: bool },
    PullServed { id: i64 },
    ResolveDelivered { id: i64 },
    RejectDelivered { id: i64 },
    ReleaseApplied { id: i64, count: u32 },
    ImportReleased { key: i64, count: u32 },
    Aborted { code: String, detail: String },
}

// ---------------------------------------------------------------------------
// Codec parties
// ---------------------------------------------------------------------------

struct SessionExporter<'a> {
    exports: &'a mut ExportTable,
}

impl Exporter for SessionExporter<'_> {
    fn export_stub(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError> {
        self.exports.export(hooks, hook).map_err(CodecError::from)
    }

    fn export_promise(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError> {
        self.exports.export(hooks, hook).map_err(CodecError::from)
    }

    fn get_import(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError> {
        match hooks.kind(hook)? {
            HookKind::Import { key, .. } => Ok(*key),
            HookKind::MapVariable { .. } => Err(CodecError::PlaceholderOutsideMap),
            other => Err(CodecError::Unrepresentable {
                detail: format!("{} hook is not a held capability", other.name()),
            }),
        }
    }
}

struct SessionImporter<'a> {
    exports: &'a mut ExportTable,
    imports: &'a mut ImportTable,
}

impl Importer for SessionImporter<'_> {
    fn import_stub(&mut self, hooks: &mut HookTable, id: i64) -> Result<HookId, CodecError> {
        // Wire ids are in the sender's namespace; negate on receipt.
        let key = -id;
        self.imports.import(key);
        let hook = hooks.insert(HookKind::Import {
            key,
            path: PropertyPath::root(),
        });
        self.imports
            .attach_hook(key)
            .map_err(|_| CodecError::UnknownKey { id })?;
        Ok(hook)
    }

    fn import_promise(&mut self, hooks: &mut HookTable, id: i64) -> Result<HookId, CodecError> {
        self.import_stub(hooks, id)
    }

    fn get_export(&mut self, id: i64) -> Result<ExportLookup, CodecError> {
        let key = -id;
        match self.exports.subject_hook(key) {
            Ok(Ok(hook)) => Ok(ExportLookup::Hook(hook)),
            Ok(Err(e)) => Ok(ExportLookup::Failed(e)),
            Err(_) => Err(CodecError::UnknownKey { id }),
        }
    }
}

fn error_expr(e: &ErrorValue) -> Expr {
    Expr::Error {
        kind: e.kind,
        message: e.message.clone(),
        stack: e.stack.clone(),
    }
}

/// What an operation subject actually addresses once settled imports are
/// followed through their resolutions.
enum SubjectRoute {
    /// A live slot or capability at the peer.
    RemoteSlot(i64, PropertyPath),
    /// A local capability (target or payload) with the remaining path.
    LocalHook(HookId, PropertyPath),
    /// Plain data (cloned; interior hooks not yet duplicated).
    LocalValue(Value),
    Failed(ErrorValue),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A single point-to-point peer.
pub struct Session {
    config: SessionConfig,
    hooks: HookTable,
    exports: ExportTable,
    imports: ImportTable,
    builders: BuilderStack,
    state: SessionState,
    outgoing: VecDeque<Vec<u8>>,
    events: Vec<SessionEvent>,
    ready: Vec<(PullId, Result<Payload, ErrorValue>)>,
    silenced: BTreeSet<PullId>,
    /// Push keys released while still pending: late resolutions for these
    /// are evaluated and discarded as garbage instead of being fatal.
    released_pushes: BTreeSet<i64>,
    next_pull: u64,
    frames_received: u64,
    frames_sent: u64,
}

impl Session {
    /// Create a session. `bootstrap` is exported at id 0 when present.
    pub fn new(bootstrap: Option<Rc<dyn Target>>, config: SessionConfig) -> Self {
        let mut hooks = HookTable::new();
        let mut exports = ExportTable::new();
        let mut imports = ImportTable::new();
        if let Some(target) = bootstrap {
            let hook = hooks.insert(HookKind::LocalTarget {
                target,
                path: PropertyPath::root(),
            });
            exports.install_bootstrap(hook);
        }
        imports.install_bootstrap();
        Self {
            config,
            hooks,
            exports,
            imports,
            builders: BuilderStack::new(),
            state: SessionState::Active,
            outgoing: VecDeque::new(),
            events: Vec::new(),
            ready: Vec::new(),
            silenced: BTreeSet::new(),
            released_pushes: BTreeSet::new(),
            next_pull: 1,
            frames_received: 0,
            frames_sent: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Live-hook observability for refcount-balance checks.
    pub fn live_hooks(&self) -> usize {
        self.hooks.live_count()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Drain accumulated audit events.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drain queued outbound messages.
    pub fn outgoing(&mut self) -> Vec<Vec<u8>> {
        self.outgoing.drain(..).collect()
    }

    fn queue_frame(&mut self, frame: Frame) {
        self.events.push(SessionEvent::FrameSent {
            tag: frame.tag().to_string(),
        });
        self.frames_sent += 1;
        self.outgoing.push_back(frame.to_bytes());
    }

    fn next_pull_id(&mut self) -> PullId {
        let pid = PullId(self.next_pull);
        self.next_pull += 1;
        pid
    }

    // -- hook surface -------------------------------------------------------

    /// The peer's bootstrap capability.
    pub fn bootstrap(&mut self) -> Result<HookId, RpcError> {
        self.import_hook(0, PropertyPath::root())
    }

    /// Wrap a local application target as a capability owned by the caller.
    /// Passing it in call arguments exports it to the peer.
    pub fn adopt(&mut self, target: Rc<dyn Target>) -> HookId {
        self.hooks.insert(HookKind::LocalTarget {
            target,
            path: PropertyPath::root(),
        })
    }

    fn import_hook(&mut self, key: i64, path: PropertyPath) -> Result<HookId, RpcError> {
        let hook = self.hooks.insert(HookKind::Import { key, path });
        self.imports
            .attach_hook(key)
            .map_err(|e| RpcError::Protocol(ProtocolError::Internal { detail: e.to_string() }))?;
        Ok(hook)
    }

    /// Add one reference to a hook.
    pub fn dup(&mut self, hook: HookId) -> Result<HookId, RpcError> {
        Ok(self.hooks.dup(hook)?)
    }

    /// Release one reference, sending `release` frames for imports whose
    /// last hook went away.
    pub fn dispose(&mut self, hook: HookId) -> Result<(), RpcError> {
        let mut sink = CollectSink::default();
        self.hooks.dispose_with(hook, &mut sink)?;
        self.process_import_releases(sink.0);
        Ok(())
    }

    /// One-shot notification when the capability behind `hook` dies.
    pub fn on_broken(
        &mut self,
        hook: HookId,
        watcher: Box<dyn FnOnce(&ErrorValue)>,
    ) -> Result<(), RpcError> {
        if let HookKind::MapVariable { .. } = self.hooks.kind(hook)? {
            return Err(MapMisuse::PlaceholderOperation { op: "on_broken" }.into());
        }
        Ok(self.hooks.on_broken(hook, watcher)?)
    }

    /// Address a sub-path of a capability. Never performs I/O.
    pub fn get(&mut self, hook: HookId, path: PropertyPath) -> Result<HookId, RpcError> {
        enum Plan {
            Derive(i64, PropertyPath),
            Record,
            Local,
        }
        let plan = match self.hooks.kind(hook)? {
            HookKind::Import { key, path: base } => Plan::Derive(*key, base.join(&path)),
            HookKind::MapVariable { .. } => Plan::Record,
            _ => Plan::Local,
        };
        match plan {
            Plan::Derive(key, full) => self.import_hook(key, full),
            Plan::Record => {
                if !self.builders.is_recording() {
                    return Err(MapMisuse::PlaceholderOutsideMap.into());
                }
                Ok(self.builders.push_get(
                    &mut self.hooks,
                    hook,
                    path,
                    self.config.max_map_instructions,
                )?)
            }
            Plan::Local => match invoke_get(&mut self.hooks, hook, &path) {
                Ok(h) => Ok(h),
                Err(e) => Ok(self.hooks.insert(HookKind::Error(e))),
            },
        }
    }

    /// Invoke the method at `path`, returning a hook for the eventual
    /// result. Remote calls emit a `push` frame; callers keep ownership of
    /// hooks inside `args`.
    pub fn call(
        &mut self,
        hook: HookId,
        path: PropertyPath,
        args: &[Value],
    ) -> Result<HookId, RpcError> {
        if let HookKind::MapVariable { .. } = self.hooks.kind(hook)? {
            if !self.builders.is_recording() {
                return Err(MapMisuse::PlaceholderOutsideMap.into());
            }
            return Ok(self.builders.push_call(
                &mut self.hooks,
                hook,
                path,
                args,
                self.config.max_map_instructions,
            )?);
        }
        match self.route_subject(hook, &path) {
            SubjectRoute::RemoteSlot(key, full) => {
                let encoded = {
                    let mut exporter = SessionExporter {
                        exports: &mut self.exports,
                    };
                    devaluate(&Value::Array(args.to_vec()), &mut self.hooks, &mut exporter)
                        .map_err(encode_error)?
                };
                let items = match encoded {
                    Expr::Array(items) => items,
                    other => vec![other],
                };
                let push_id = self.imports.allocate_push();
                self.queue_frame(Frame::Push {
                    id: push_id,
                    expr: Expr::Pipeline {
                        subject: key,
                        path: full,
                        args: Some(items),
                    },
                });
                self.import_hook(push_id, PropertyPath::root())
            }
            SubjectRoute::LocalHook(subject, tail) => {
                match invoke_call(&mut self.hooks, subject, &tail, args.to_vec()) {
                    Ok(h) => Ok(h),
                    Err(e) => Ok(self.hooks.insert(HookKind::Error(e))),
                }
            }
            SubjectRoute::LocalValue(value) => {
                let e = ErrorValue::type_error(format!("{} is not callable", value.type_name()));
                Ok(self.hooks.insert(HookKind::Error(e)))
            }
            SubjectRoute::Failed(e) => Ok(self.hooks.insert(HookKind::Error(e))),
        }
    }

    /// Resolve what an operation on `hook` + `extra` actually addresses,
    /// following settled imports through their locally-held resolutions.
    /// A push slot is released once it settles, so operations on a resolved
    /// import must never reference the dead slot over the wire.
    fn route_subject(&self, hook: HookId, extra: &PropertyPath) -> SubjectRoute {
        let mut current = hook;
        let mut tail = extra.clone();
        loop {
            let (key, full) = match self.hooks.kind(current) {
                Ok(HookKind::Import { key, path: base }) => (*key, base.join(&tail)),
                Ok(HookKind::Error(e)) | Ok(HookKind::Broken(e)) => {
                    return SubjectRoute::Failed(e.clone());
                }
                Ok(_) => return SubjectRoute::LocalHook(current, tail),
                Err(e) => return SubjectRoute::Failed(ErrorValue::generic(e.to_string())),
            };
            let descent = match self.imports.entry(key) {
                Ok(entry) => match &entry.state {
                    ImportState::Resolved { payload } => {
                        crate::target::descend_value(&self.hooks, &payload.value, &full)
                    }
                    ImportState::Rejected { error } => {
                        return SubjectRoute::Failed(error.clone());
                    }
                    ImportState::Pending { .. } | ImportState::Capability => {
                        return SubjectRoute::RemoteSlot(key, full);
                    }
                },
                Err(_) => {
                    return SubjectRoute::Failed(ErrorValue::generic(format!(
                        "import entry {key} is gone"
                    )));
                }
            };
            match descent {
                Ok(crate::target::Descent::Value(value)) => {
                    return SubjectRoute::LocalValue(value);
                }
                Ok(crate::target::Descent::Capability(h, rest)) => {
                    current = h;
                    tail = rest;
                }
                Err(e) => return SubjectRoute::Failed(e),
            }
        }
    }

    // -- pulls --------------------------------------------------------------

    /// Request the payload behind `hook`. Completion is reported through
    /// `take_ready` once the value is available.
    pub fn pull(&mut self, hook: HookId) -> Result<PullId, RpcError> {
        if let HookKind::MapVariable { .. } = self.hooks.kind(hook)? {
            return Err(MapMisuse::PlaceholderOperation { op: "pull" }.into());
        }
        let pid = self.next_pull_id();
        match self.route_subject(hook, &PropertyPath::root()) {
            SubjectRoute::RemoteSlot(key, full) => self.pull_remote_slot(pid, key, full),
            SubjectRoute::LocalHook(subject, tail) => {
                let result = self.materialize_local(subject, &tail);
                self.ready.push((pid, result));
            }
            SubjectRoute::LocalValue(value) => {
                let mut interior = Vec::new();
                value.collect_hooks(&mut interior);
                let mut ok = true;
                for h in &interior {
                    if self.hooks.dup(*h).is_err() {
                        ok = false;
                    }
                }
                let result = if ok {
                    Ok(Payload::capture(value))
                } else {
                    Err(ErrorValue::generic("resolved payload is no longer live"))
                };
                self.ready.push((pid, result));
            }
            SubjectRoute::Failed(e) => self.ready.push((pid, Err(e))),
        }
        Ok(pid)
    }

    fn pull_remote_slot(&mut self, pid: PullId, key: i64, path: PropertyPath) {
        let direct = path.is_empty()
            && key > 0
            && matches!(
                self.imports.entry(key).map(|e| &e.state),
                Ok(ImportState::Pending { .. })
            );
        if direct {
            self.register_pull(pid, key);
            return;
        }
        let push_id = self.imports.allocate_push();
        self.queue_frame(Frame::Push {
            id: push_id,
            expr: Expr::Pipeline {
                subject: key,
                path,
                args: None,
            },
        });
        self.register_pull(pid, push_id);
    }

    /// Materialize a payload from a local capability at `path`.
    fn materialize_local(
        &mut self,
        subject: HookId,
        path: &PropertyPath,
    ) -> Result<Payload, ErrorValue> {
        let result = invoke_get(&mut self.hooks, subject, path)?;
        let value = map_apply::hook_input_value(&mut self.hooks, result);
        let mut sink = CollectSink::default();
        let _ = self.hooks.dispose_with(result, &mut sink);
        self.process_import_releases(sink.0);
        value.map(Payload::capture)
    }

    fn register_pull(&mut self, pid: PullId, key: i64) {
        let mut send = false;
        if let Ok(entry) = self.imports.entry_mut(key) {
            if let ImportState::Pending { pulls, pull_sent } = &mut entry.state {
                pulls.push(pid);
                if !*pull_sent {
                    *pull_sent = true;
                    send = true;
                }
            }
        }
        if send {
            self.queue_frame(Frame::Pull { id: key });
        }
    }

    /// Materialize a pull against an already-resolved import.
    fn resolved_pull(&mut self, key: i64, path: &PropertyPath) -> Result<Payload, ErrorValue> {
        let (value, interior) = {
            let entry = self
                .imports
                .entry(key)
                .map_err(|e| ErrorValue::generic(e.to_string()))?;
            match &entry.state {
                ImportState::Resolved { payload } => {
                    (payload.value.clone(), payload.hooks().to_vec())
                }
                _ => return Err(ErrorValue::generic("import is not resolved")),
            }
        };
        for h in &interior {
            self.hooks
                .dup(*h)
                .map_err(|e| ErrorValue::generic(e.to_string()))?;
        }
        let temp = self.hooks.insert(HookKind::PayloadStub {
            payload: Payload::new(value, interior),
        });
        let outcome = invoke_get(&mut self.hooks, temp, path).and_then(|result| {
            let value = map_apply::hook_input_value(&mut self.hooks, result);
            let mut sink = CollectSink::default();
            let _ = self.hooks.dispose_with(result, &mut sink);
            self.process_import_releases(sink.0);
            value.map(Payload::capture)
        });
        let mut sink = CollectSink::default();
        let _ = self.hooks.dispose_with(temp, &mut sink);
        self.process_import_releases(sink.0);
        outcome
    }

    /// Completed pulls, in completion order. Silenced pulls are dropped and
    /// their payloads released.
    pub fn take_ready(&mut self) -> Vec<(PullId, Result<Payload, ErrorValue>)> {
        let drained = std::mem::take(&mut self.ready);
        let mut out = Vec::new();
        for (pid, result) in drained {
            if self.silenced.remove(&pid) {
                if let Ok(payload) = result {
                    let mut sink = CollectSink::default();
                    let _ = payload.dispose(&mut self.hooks, &mut sink);
                    self.process_import_releases(sink.0);
                }
                continue;
            }
            out.push((pid, result));
        }
        out
    }

    // -- map ----------------------------------------------------------------

    /// Record `f` against a placeholder and install the recording on the
    /// capability behind `subject`: shipped as one `remap` push for remote
    /// subjects, replayed immediately for local ones.
    pub fn send_map<F>(
        &mut self,
        subject: HookId,
        path: PropertyPath,
        f: F,
    ) -> Result<HookId, RpcError>
    where
        F: FnOnce(&mut MapRecorder<'_>, HookId) -> Result<Value, MapMisuse>,
    {
        if let HookKind::MapVariable { .. } = self.hooks.kind(subject)? {
            return Err(MapMisuse::PlaceholderOperation { op: "map" }.into());
        }
        if self.builders.is_recording() {
            return Err(MapMisuse::Recording {
                detail: "a map is already being recorded on this session".to_string(),
            }
            .into());
        }
        let route = self.route_subject(subject, &path);
        if let SubjectRoute::Failed(e) = route {
            return Ok(self.hooks.insert(HookKind::Error(e)));
        }

        self.builders.push_frame();
        let recorded = self.record_map(f);
        let recording = match recorded {
            Ok(recording) => recording,
            Err(e) => {
                if self.builders.depth() > 0 {
                    let leftovers = self.builders.abandon_frame(&mut self.hooks);
                    BuilderStack::dispose_recording(&mut self.hooks, leftovers);
                }
                return Err(e);
            }
        };

        match route {
            SubjectRoute::RemoteSlot(key, full) => self.ship_map(key, full, recording),
            SubjectRoute::LocalHook(hook, tail) => self.apply_local_map(hook, &tail, recording),
            SubjectRoute::LocalValue(value) => {
                // The descent clone does not own its interior hooks yet.
                let mut interior = Vec::new();
                value.collect_hooks(&mut interior);
                for h in interior {
                    self.hooks.dup(h)?;
                }
                self.apply_value_map(value, recording)
            }
            SubjectRoute::Failed(_) => unreachable!("failed routes return before recording"),
        }
    }

    fn record_map<F>(&mut self, f: F) -> Result<RecordedMap, RpcError>
    where
        F: FnOnce(&mut MapRecorder<'_>, HookId) -> Result<Value, MapMisuse>,
    {
        let input = self.builders.make_input(&mut self.hooks).map_err(RpcError::from)?;
        let value = {
            let mut recorder = MapRecorder {
                hooks: &mut self.hooks,
                builders: &mut self.builders,
                max_instructions: self.config.max_map_instructions,
            };
            f(&mut recorder, input).map_err(RpcError::from)?
        };
        if let Value::Pending(pid) = value {
            // The eventual rejection of the pending pull is consumed quietly
            // so the misuse produces a single diagnostic.
            self.silenced.insert(pid);
            return Err(MapMisuse::AsyncCallback.into());
        }
        let terminator = devaluate(&value, &mut self.hooks, &mut self.builders)
            .map_err(|c| RpcError::from(MapMisuse::from(c)))?;
        self.builders
            .finish_frame(&mut self.hooks, terminator, self.config.max_map_instructions)
            .map_err(RpcError::from)
    }

    fn ship_map(
        &mut self,
        key: i64,
        path: PropertyPath,
        recording: RecordedMap,
    ) -> Result<HookId, RpcError> {
        let mut capture_exprs = Vec::with_capacity(recording.captures.len());
        for capture in &recording.captures {
            let hook = match capture {
                CaptureRef::Hook(h) => *h,
                CaptureRef::Parent(_) => {
                    return Err(RpcError::Protocol(ProtocolError::Internal {
                        detail: "top-level recording captured by parent index".to_string(),
                    }));
                }
            };
            let expr = {
                let mut exporter = SessionExporter {
                    exports: &mut self.exports,
                };
                devaluate_hook(hook, false, &mut self.hooks, &mut exporter)
                    .map_err(encode_error)?
            };
            capture_exprs.push(expr);
        }
        // The wire now carries the capture references; drop the recording's
        // own hook references (frame ordering keeps the entries alive at the
        // peer until the remap is processed).
        for capture in recording.captures {
            if let CaptureRef::Hook(h) = capture {
                let mut sink = CollectSink::default();
                let _ = self.hooks.dispose_with(h, &mut sink);
                self.process_import_releases(sink.0);
            }
        }

        let push_id = self.imports.allocate_push();
        self.queue_frame(Frame::Push {
            id: push_id,
            expr: Expr::Remap {
                subject: key,
                path,
                captures: capture_exprs,
                body: recording.instructions,
            },
        });
        self.import_hook(push_id, PropertyPath::root())
    }

    fn apply_local_map(
        &mut self,
        subject: HookId,
        path: &PropertyPath,
        recording: RecordedMap,
    ) -> Result<HookId, RpcError> {
        let captures: Vec<HookId> = recording
            .captures
            .iter()
            .filter_map(|c| match c {
                CaptureRef::Hook(h) => Some(*h),
                CaptureRef::Parent(_) => None,
            })
            .collect();

        let input_hook = match invoke_get(&mut self.hooks, subject, path) {
            Ok(h) => h,
            Err(e) => {
                for h in captures {
                    let mut sink = CollectSink::default();
                    let _ = self.hooks.dispose_with(h, &mut sink);
                    self.process_import_releases(sink.0);
                }
                return Ok(self.hooks.insert(HookKind::Error(e)));
            }
        };
        let input = map_apply::hook_input_value(&mut self.hooks, input_hook);
        {
            let mut sink = CollectSink::default();
            let _ = self.hooks.dispose_with(input_hook, &mut sink);
            self.process_import_releases(sink.0);
        }
        let input = match input {
            Ok(v) => v,
            Err(e) => {
                for h in captures {
                    let mut sink = CollectSink::default();
                    let _ = self.hooks.dispose_with(h, &mut sink);
                    self.process_import_releases(sink.0);
                }
                return Ok(self.hooks.insert(HookKind::Error(e)));
            }
        };

        let mut sink = CollectSink::default();
        let outcome = map_apply::apply_map(
            &mut self.hooks,
            input,
            captures,
            &recording.instructions,
            &mut sink,
        );
        self.process_import_releases(sink.0);
        match outcome {
            Ok(payload) => Ok(payload_to_hook(&mut self.hooks, payload)),
            Err(e) => Ok(self.hooks.insert(HookKind::Error(e))),
        }
    }

    /// Replay a recording against an already-materialized input value.
    fn apply_value_map(&mut self, input: Value, recording: RecordedMap) -> Result<HookId, RpcError> {
        let captures: Vec<HookId> = recording
            .captures
            .iter()
            .filter_map(|c| match c {
                CaptureRef::Hook(h) => Some(*h),
                CaptureRef::Parent(_) => None,
            })
            .collect();
        let mut sink = CollectSink::default();
        let outcome = map_apply::apply_map(
            &mut self.hooks,
            input,
            captures,
            &recording.instructions,
            &mut sink,
        );
        self.process_import_releases(sink.0);
        match outcome {
            Ok(payload) => Ok(payload_to_hook(&mut self.hooks, payload)),
            Err(e) => Ok(self.hooks.insert(HookKind::Error(e))),
        }
    }

    // -- message loop -------------------------------------------------------

    /// Dispatch one whole inbound message.
    pub fn handle_message(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if matches!(self.state, SessionState::Aborted) {
            return Err(ProtocolError::SessionAborted);
        }
        if bytes.len() > self.config.max_message_bytes {
            return Err(self.fail(ProtocolError::Oversized {
                size: bytes.len(),
                max: self.config.max_message_bytes,
            }));
        }
        let json: Json = match serde_json::from_slice(bytes) {
            Ok(json) => json,
            Err(e) => {
                return Err(self.fail(ProtocolError::Malformed {
                    detail: e.to_string(),
                }));
            }
        };
        let items = match json.as_array() {
            Some(items) => items.clone(),
            None => {
                return Err(self.fail(ProtocolError::Malformed {
                    detail: format!("frame must be an array, got {json}"),
                }));
            }
        };
        let tag = match items.first().and_then(Json::as_str) {
            Some(tag) => tag.to_string(),
            None => {
                return Err(self.fail(ProtocolError::Malformed {
                    detail: "frame is missing its tag".to_string(),
                }));
            }
        };
        self.frames_received += 1;
        self.events.push(SessionEvent::FrameReceived { tag: tag.clone() });

        let result = match tag.as_str() {
            "push" => self.on_push(&items),
            "pull" => self.on_pull(&items),
            "resolve" => self.on_settle(&items, true),
            "reject" => self.on_settle(&items, false),
            "release" => self.on_release(&items),
            "abort" => {
                self.teardown("peer aborted the session");
                Ok(())
            }
            _ => Err(ProtocolError::UnknownTag { tag }),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Abort locally, notifying the peer.
    pub fn abort_session(&mut self, reason: &str) {
        if matches!(self.state, SessionState::Aborted) {
            return;
        }
        self.queue_frame(Frame::Abort);
        self.teardown(reason);
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        if matches!(self.state, SessionState::Active) {
            self.queue_frame(Frame::Abort);
            self.events.push(SessionEvent::Aborted {
                code: err.code().to_string(),
                detail: err.to_string(),
            });
            self.teardown(&err.to_string());
        }
        err
    }

    fn teardown(&mut self, reason: &str) {
        self.state = SessionState::Aborted;
        let err = ErrorValue::generic(reason.to_string());
        self.hooks.break_all_imports(&err);
        for pid in self.imports.take_all_pending_pulls() {
            self.ready.push((pid, Err(err.clone())));
        }
    }

    fn frame_id(items: &[Json], index: usize, what: &str) -> Result<i64, ProtocolError> {
        items
            .get(index)
            .and_then(Json::as_i64)
            .ok_or_else(|| ProtocolError::Malformed {
                detail: format!("{what} id must be an integer"),
            })
    }

    fn positive_id(items: &[Json], what: &str) -> Result<i64, ProtocolError> {
        let id = Self::frame_id(items, 1, what)?;
        if id <= 0 {
            return Err(ProtocolError::Malformed {
                detail: format!("{what} id must be positive, got {id}"),
            });
        }
        Ok(id)
    }

    fn on_push(&mut self, items: &[Json]) -> Result<(), ProtocolError> {
        if items.len() != 3 {
            return Err(ProtocolError::Malformed {
                detail: format!("push frame with {} elements", items.len()),
            });
        }
        let id = Self::positive_id(items, "push")?;
        let key = -id;
        if self.exports.contains(key) {
            return Err(ProtocolError::IdInUse { id });
        }
        let expr = match Expr::from_wire(&items[2], self.config.max_expr_depth) {
            Ok(expr) => expr,
            Err(DecodeError::Path(v)) => {
                // Per-call: the slot is born rejected, the session survives.
                let e = ErrorValue::type_error(v.to_string());
                self.exports
                    .insert_promise(key, PromiseState::Rejected(e))
                    .map_err(internal)?;
                self.events.push(SessionEvent::PushEvaluated { id, rejected: true });
                return Ok(());
            }
            Err(e) => {
                return Err(ProtocolError::Malformed {
                    detail: e.to_string(),
                });
            }
        };
        let mut sink = CollectSink::default();
        let outcome = {
            let mut importer = SessionImporter {
                exports: &mut self.exports,
                imports: &mut self.imports,
            };
            evaluate(&expr, &mut self.hooks, &mut importer, &mut sink)
        };
        self.process_import_releases(sink.0);
        let rejected = match outcome {
            Ok(payload) => {
                let hook = payload_to_hook(&mut self.hooks, payload);
                self.exports
                    .insert_promise(key, PromiseState::Resolved(hook))
                    .map_err(internal)?;
                false
            }
            Err(EvalError::Target(e)) => {
                self.exports
                    .insert_promise(key, PromiseState::Rejected(e))
                    .map_err(internal)?;
                true
            }
            Err(EvalError::Codec(c)) => return Err(codec_fatal(c)),
        };
        self.events.push(SessionEvent::PushEvaluated { id, rejected });
        Ok(())
    }

    fn on_pull(&mut self, items: &[Json]) -> Result<(), ProtocolError> {
        if items.len() != 2 {
            return Err(ProtocolError::Malformed {
                detail: format!("pull frame with {} elements", items.len()),
            });
        }
        let id = Self::positive_id(items, "pull")?;
        let key = -id;

        enum Plan {
            Value(Value),
            Reject(ErrorValue),
        }
        let plan = match self.exports.promise_result(key) {
            Err(_) => return Err(ProtocolError::UnknownId { id }),
            Ok(PromiseState::Rejected(e)) => Plan::Reject(e.clone()),
            Ok(PromiseState::Resolved(hook)) => {
                let hook = *hook;
                match self.hooks.kind(hook).map_err(hook_internal)? {
                    HookKind::PayloadStub { payload } => Plan::Value(payload.value.clone()),
                    HookKind::LocalTarget { .. } | HookKind::Import { .. } => {
                        Plan::Value(Value::Stub(hook))
                    }
                    HookKind::Error(e) | HookKind::Broken(e) => Plan::Reject(e.clone()),
                    HookKind::MapVariable { .. } => {
                        return Err(ProtocolError::Internal {
                            detail: "placeholder stored in export table".to_string(),
                        });
                    }
                }
            }
        };
        match plan {
            Plan::Value(value) => {
                let encoded = {
                    let mut exporter = SessionExporter {
                        exports: &mut self.exports,
                    };
                    devaluate(&value, &mut self.hooks, &mut exporter)
                };
                match encoded {
                    Ok(expr) => self.queue_frame(Frame::Resolve { id, expr }),
                    Err(c) => {
                        let e = ErrorValue::generic(c.to_string());
                        self.queue_frame(Frame::Reject {
                            id,
                            expr: error_expr(&e),
                        });
                    }
                }
            }
            Plan::Reject(e) => self.queue_frame(Frame::Reject {
                id,
                expr: error_expr(&e),
            }),
        }
        self.events.push(SessionEvent::PullServed { id });
        Ok(())
    }

    fn on_settle(&mut self, items: &[Json], is_resolve: bool) -> Result<(), ProtocolError> {
        let what = if is_resolve { "resolve" } else { "reject" };
        if items.len() != 3 {
            return Err(ProtocolError::Malformed {
                detail: format!("{what} frame with {} elements", items.len()),
            });
        }
        let id = Self::positive_id(items, what)?;
        let key = id;

        if !self.imports.contains(key) {
            if self.released_pushes.remove(&key) {
                return self.settle_garbage(&items[2]);
            }
            return Err(ProtocolError::UnknownId { id });
        }

        let expr = match Expr::from_wire(&items[2], self.config.max_expr_depth) {
            Ok(expr) => expr,
            Err(DecodeError::Path(v)) => {
                let e = ErrorValue::type_error(v.to_string());
                self.settle_rejection(key, e);
                return Ok(());
            }
            Err(e) => {
                return Err(ProtocolError::Malformed {
                    detail: e.to_string(),
                });
            }
        };

        if is_resolve {
            let mut sink = CollectSink::default();
            let outcome = {
                let mut importer = SessionImporter {
                    exports: &mut self.exports,
                    imports: &mut self.imports,
                };
                evaluate(&expr, &mut self.hooks, &mut importer, &mut sink)
            };
            self.process_import_releases(sink.0);
            match outcome {
                Ok(payload) => {
                    let pulls = self.imports.resolve(key, payload).map_err(internal)?;
                    self.consume_promise_ref(key);
                    for pid in pulls {
                        let result = self.resolved_pull(key, &PropertyPath::root());
                        self.ready.push((pid, result));
                    }
                    self.events.push(SessionEvent::ResolveDelivered { id });
                }
                Err(EvalError::Target(e)) => self.settle_rejection(key, e),
                Err(EvalError::Codec(c)) => return Err(codec_fatal(c)),
            }
        } else {
            let mut sink = CollectSink::default();
            let outcome = {
                let mut importer = SessionImporter {
                    exports: &mut self.exports,
                    imports: &mut self.imports,
                };
                evaluate(&expr, &mut self.hooks, &mut importer, &mut sink)
            };
            self.process_import_releases(sink.0);
            let error = match outcome {
                Ok(payload) => {
                    let error = match &payload.value {
                        Value::Error(e) => e.clone(),
                        other => ErrorValue::generic(format!(
                            "rejected with a non-error {}",
                            other.type_name()
                        )),
                    };
                    let mut sink = CollectSink::default();
                    let _ = payload.dispose(&mut self.hooks, &mut sink);
                    self.process_import_releases(sink.0);
                    error
                }
                Err(EvalError::Target(e)) => e,
                Err(EvalError::Codec(c)) => return Err(codec_fatal(c)),
            };
            self.settle_rejection(key, error);
            self.events.push(SessionEvent::RejectDelivered { id });
        }
        Ok(())
    }

    /// A settlement for a slot we already released: evaluate so contained
    /// capabilities get imported, then release them straight back.
    fn settle_garbage(&mut self, raw: &Json) -> Result<(), ProtocolError> {
        let expr = match Expr::from_wire(raw, self.config.max_expr_depth) {
            Ok(expr) => expr,
            Err(DecodeError::Path(_)) => return Ok(()),
            Err(e) => {
                return Err(ProtocolError::Malformed {
                    detail: e.to_string(),
                });
            }
        };
        let mut sink = CollectSink::default();
        let outcome = {
            let mut importer = SessionImporter {
                exports: &mut self.exports,
                imports: &mut self.imports,
            };
            evaluate(&expr, &mut self.hooks, &mut importer, &mut sink)
        };
        self.process_import_releases(sink.0);
        match outcome {
            Ok(payload) => {
                let mut sink = CollectSink::default();
                let _ = payload.dispose(&mut self.hooks, &mut sink);
                self.process_import_releases(sink.0);
                Ok(())
            }
            Err(EvalError::Target(_)) => Ok(()),
            Err(EvalError::Codec(c)) => Err(codec_fatal(c)),
        }
    }

    fn settle_rejection(&mut self, key: i64, error: ErrorValue) {
        if let Ok(pulls) = self.imports.reject(key, error.clone()) {
            self.consume_promise_ref(key);
            for pid in pulls {
                self.ready.push((pid, Err(error.clone())));
            }
        }
        self.hooks.break_imports(key, &error);
    }

    /// Settlement consumes the pending slot's wire reference (release with
    /// count 1).
    fn consume_promise_ref(&mut self, key: i64) {
        let mut release = false;
        if let Ok(entry) = self.imports.entry_mut(key) {
            if entry.remote_refs > 0 {
                entry.remote_refs -= 1;
                release = true;
            }
        }
        if release {
            self.queue_frame(Frame::Release { id: key, count: 1 });
        }
    }

    fn on_release(&mut self, items: &[Json]) -> Result<(), ProtocolError> {
        if items.len() != 3 {
            return Err(ProtocolError::Malformed {
                detail: format!("release frame with {} elements", items.len()),
            });
        }
        let id = Self::frame_id(items, 1, "release")?;
        if id == 0 {
            return Err(ProtocolError::BootstrapRelease);
        }
        let count = items
            .get(2)
            .and_then(Json::as_u64)
            .filter(|n| *n > 0 && *n <= u64::from(u32::MAX))
            .ok_or_else(|| ProtocolError::Malformed {
                detail: "release count must be a positive integer".to_string(),
            })? as u32;
        let key = -id;
        let mut sink = CollectSink::default();
        self.exports
            .release(key, count, &mut self.hooks, &mut sink)
            .map_err(|e| match e {
                TableError::UnknownKey(_) => ProtocolError::UnknownId { id },
                TableError::BootstrapRelease => ProtocolError::BootstrapRelease,
                TableError::RefcountUnderflow { held, released, .. } => {
                    ProtocolError::RefcountUnderflow { id, held, released }
                }
                TableError::KeyInUse(_) => ProtocolError::Internal {
                    detail: "release hit an occupied allocation".to_string(),
                },
            })?;
        self.process_import_releases(sink.0);
        self.events.push(SessionEvent::ReleaseApplied { id, count });
        Ok(())
    }

    /// Handle import-table fallout of freed hooks: remove entries whose last
    /// hook is gone and return their outstanding wire references to the peer.
    fn process_import_releases(&mut self, keys: Vec<i64>) {
        let mut work = keys;
        while let Some(key) = work.pop() {
            let Some(entry) = self.imports.detach_hook(key) else {
                continue;
            };
            if entry.remote_refs > 0 && matches!(self.state, SessionState::Active) {
                self.queue_frame(Frame::Release {
                    id: key,
                    count: entry.remote_refs,
                });
                self.events.push(SessionEvent::ImportReleased {
                    key,
                    count: entry.remote_refs,
                });
            }
            match entry.state {
                ImportState::Resolved { payload } => {
                    let mut sink = CollectSink::default();
                    let _ = payload.dispose(&mut self.hooks, &mut sink);
                    work.extend(sink.0);
                }
                ImportState::Pending { pulls, .. } => {
                    if key > 0 {
                        self.released_pushes.insert(key);
                    }
                    let err = ErrorValue::generic("capability disposed before resolution");
                    for pid in pulls {
                        self.ready.push((pid, Err(err.clone())));
                    }
                }
                ImportState::Capability | ImportState::Rejected { .. } => {}
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("exports", &self.exports.keys())
            .field("imports", &self.imports.keys())
            .field("live_hooks", &self.hooks.live_count())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

fn internal(e: TableError) -> ProtocolError {
    ProtocolError::Internal {
        detail: e.to_string(),
    }
}

fn hook_internal(e: HookError) -> ProtocolError {
    ProtocolError::Internal {
        detail: e.to_string(),
    }
}

fn codec_fatal(c: CodecError) -> ProtocolError {
    match c {
        CodecError::UnknownKey { id } => ProtocolError::UnknownId { id },
        CodecError::Decode(d) => ProtocolError::Malformed {
            detail: d.to_string(),
        },
        other => ProtocolError::Internal {
            detail: other.to_string(),
        },
    }
}

fn encode_error(c: CodecError) -> RpcError {
    match c {
        CodecError::LocalCapabilityInMap => RpcError::MapMisuse(MapMisuse::LocalCapability),
        CodecError::PlaceholderOutsideMap => {
            RpcError::MapMisuse(MapMisuse::PlaceholderOutsideMap)
        }
        other => RpcError::Target(ErrorValue::generic(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
