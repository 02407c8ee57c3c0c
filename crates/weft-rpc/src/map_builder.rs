//! Recording of map callbacks.
//!
//! A map callback never runs remotely: it runs locally, once, against an
//! abstract placeholder, and every property access or call it performs is
//! appended to an instruction list. Builders form a strict stack so nested
//! maps record into their own frame and splice a `remap` instruction into
//! the parent on completion. Construction pushes a frame; finishing pops it;
//! the stack depth observable before and after a recording is identical.

use std::collections::BTreeMap;
use std::fmt;

use crate::codec::{devaluate, CodecError, Exporter};
use crate::expr::Expr;
use crate::hook::{HookError, HookId, HookKind, HookTable, NullSink};
use crate::path::PropertyPath;
use crate::value::Value;

// ---------------------------------------------------------------------------
// MapMisuse
// ---------------------------------------------------------------------------

/// Misuse of the map recording surface, surfaced synchronously to the
/// caller of `map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapMisuse {
    /// The callback returned a pending value.
    AsyncCallback,
    /// A local capability was exported from inside the callback.
    LocalCapability,
    /// A placeholder was used outside its builder.
    PlaceholderOutsideMap,
    /// An operation that placeholders do not support (`pull`, `map`,
    /// `on_broken`).
    PlaceholderOperation { op: &'static str },
    /// The recorded instruction list exceeded the configured limit.
    TooManyInstructions { max: usize },
    /// Recording failed for a codec or hook-table reason.
    Recording { detail: String },
}

impl fmt::Display for MapMisuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsyncCallback => write!(f, "map callbacks cannot be asynchronous"),
            Self::LocalCapability => {
                write!(f, "cannot construct a local target inside a mapper")
            }
            Self::PlaceholderOutsideMap => write!(f, "abstract placeholder used outside map"),
            Self::PlaceholderOperation { op } => {
                write!(f, "a map placeholder does not support '{op}'")
            }
            Self::TooManyInstructions { max } => {
                write!(f, "recorded map exceeds {max} instructions")
            }
            Self::Recording { detail } => write!(f, "map recording failed: {detail}"),
        }
    }
}

impl std::error::Error for MapMisuse {}

impl From<CodecError> for MapMisuse {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::LocalCapabilityInMap => Self::LocalCapability,
            CodecError::PlaceholderOutsideMap => Self::PlaceholderOutsideMap,
            other => Self::Recording {
                detail: other.to_string(),
            },
        }
    }
}

impl From<HookError> for MapMisuse {
    fn from(e: HookError) -> Self {
        Self::Recording {
            detail: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder frames
// ---------------------------------------------------------------------------

/// One captured reference of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRef {
    /// Top-level frame: the hook itself (one owned reference).
    Hook(HookId),
    /// Nested frame: an index in the parent frame's namespace.
    Parent(i64),
}

#[derive(Debug, Default)]
struct BuilderFrame {
    captures: Vec<CaptureRef>,
    /// Dedup of captures within this frame only, by handle identity.
    capture_map: BTreeMap<HookId, i64>,
    instructions: Vec<Expr>,
    /// Placeholders minted for this frame; disposed when the frame pops.
    placeholders: Vec<HookId>,
}

/// A finished recording: captures plus the instruction list whose final
/// entry is the terminator.
#[derive(Debug)]
pub struct RecordedMap {
    pub captures: Vec<CaptureRef>,
    pub instructions: Vec<Expr>,
}

/// The builder stack. At most one recording is active per slot; nesting
/// pushes and popping restores the previous depth.
#[derive(Debug, Default)]
pub struct BuilderStack {
    frames: Vec<BuilderFrame>,
}

impl BuilderStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current nesting depth (0 when no recording is active).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_recording(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Begin a frame. Returns the frame level.
    pub fn push_frame(&mut self) -> usize {
        self.frames.push(BuilderFrame::default());
        self.frames.len() - 1
    }

    /// Mint the input placeholder (index 0) for the current frame.
    pub fn make_input(&mut self, hooks: &mut HookTable) -> Result<HookId, MapMisuse> {
        self.placeholder(hooks, 0)
    }

    fn top_level(&self) -> Result<usize, MapMisuse> {
        if self.frames.is_empty() {
            return Err(MapMisuse::PlaceholderOutsideMap);
        }
        Ok(self.frames.len() - 1)
    }

    fn placeholder(&mut self, hooks: &mut HookTable, index: i64) -> Result<HookId, MapMisuse> {
        let level = self.top_level()?;
        let hook = hooks.insert(HookKind::MapVariable {
            frame: level,
            index,
        });
        self.frames[level].placeholders.push(hook);
        Ok(hook)
    }

    /// Resolve `hook` to an index in the current frame's namespace,
    /// capturing through enclosing frames as needed.
    pub fn capture(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError> {
        let level = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or(CodecError::PlaceholderOutsideMap)?;
        capture_at(&mut self.frames, hooks, level, hook)
    }

    fn append_instruction(&mut self, instr: Expr, max: usize) -> Result<i64, MapMisuse> {
        let level = self.top_level()?;
        let frame = &mut self.frames[level];
        if frame.instructions.len() >= max {
            return Err(MapMisuse::TooManyInstructions { max });
        }
        frame.instructions.push(instr);
        // Index 0 is the input; instruction i produces variable i + 1.
        Ok(frame.instructions.len() as i64)
    }

    /// Record a property access; returns the placeholder for its result.
    pub fn push_get(
        &mut self,
        hooks: &mut HookTable,
        subject: HookId,
        path: PropertyPath,
        max: usize,
    ) -> Result<HookId, MapMisuse> {
        if path.is_empty() {
            // get(root) is the subject itself; nothing to record.
            return Ok(subject);
        }
        let subject_idx = self.capture(hooks, subject)?;
        let idx = self.append_instruction(
            Expr::Pipeline {
                subject: subject_idx,
                path,
                args: None,
            },
            max,
        )?;
        self.placeholder(hooks, idx)
    }

    /// Record a method call; returns the placeholder for its result.
    pub fn push_call(
        &mut self,
        hooks: &mut HookTable,
        subject: HookId,
        path: PropertyPath,
        args: &[Value],
        max: usize,
    ) -> Result<HookId, MapMisuse> {
        // Arguments are encoded first, with this builder as the exporter,
        // then unwrapped from the encoder's array form.
        let encoded = devaluate(&Value::Array(args.to_vec()), hooks, self)?;
        let args = match encoded {
            Expr::Array(items) => items,
            other => vec![other],
        };
        let subject_idx = self.capture(hooks, subject)?;
        let idx = self.append_instruction(
            Expr::Pipeline {
                subject: subject_idx,
                path,
                args: Some(args),
            },
            max,
        )?;
        self.placeholder(hooks, idx)
    }

    /// Append the terminator and pop the current frame, disposing its
    /// placeholders. The caller ships (top level) or splices (nested) the
    /// returned recording.
    pub fn finish_frame(
        &mut self,
        hooks: &mut HookTable,
        terminator: Expr,
        max: usize,
    ) -> Result<RecordedMap, MapMisuse> {
        self.append_instruction(terminator, max)?;
        Ok(self.abandon_frame(hooks))
    }

    /// Pop the current frame without a terminator (error cleanup). Captured
    /// top-level hooks are returned still owned by the recording.
    pub fn abandon_frame(&mut self, hooks: &mut HookTable) -> RecordedMap {
        let frame = self.frames.pop().expect("finish without active frame");
        for placeholder in frame.placeholders {
            let _ = hooks.dispose_with(placeholder, &mut NullSink);
        }
        RecordedMap {
            captures: frame.captures,
            instructions: frame.instructions,
        }
    }

    /// Dispose the owned capture references of an abandoned recording.
    pub fn dispose_recording(hooks: &mut HookTable, recording: RecordedMap) {
        for capture in recording.captures {
            if let CaptureRef::Hook(h) = capture {
                let _ = hooks.dispose_with(h, &mut NullSink);
            }
        }
    }
}

fn capture_at(
    frames: &mut Vec<BuilderFrame>,
    hooks: &mut HookTable,
    level: usize,
    hook: HookId,
) -> Result<i64, CodecError> {
    if let HookKind::MapVariable { frame, index } = hooks.kind(hook)? {
        let (frame, index) = (*frame, *index);
        if frame == level {
            return Ok(index);
        }
        if frame > level {
            // A placeholder from a finished inner frame escaped.
            return Err(CodecError::PlaceholderOutsideMap);
        }
    }
    if let Some(&idx) = frames[level].capture_map.get(&hook) {
        return Ok(idx);
    }
    let capture = if level == 0 {
        match hooks.kind(hook)? {
            HookKind::Import { .. } => {}
            HookKind::MapVariable { .. } => return Err(CodecError::PlaceholderOutsideMap),
            _ => return Err(CodecError::LocalCapabilityInMap),
        }
        hooks.dup(hook)?;
        CaptureRef::Hook(hook)
    } else {
        let parent_idx = capture_at(frames, hooks, level - 1, hook)?;
        CaptureRef::Parent(parent_idx)
    };
    let frame = &mut frames[level];
    frame.captures.push(capture);
    let idx = -(frame.captures.len() as i64);
    frame.capture_map.insert(hook, idx);
    Ok(idx)
}

// ---------------------------------------------------------------------------
// Exporter contract during recording
// ---------------------------------------------------------------------------

impl Exporter for BuilderStack {
    fn export_stub(&mut self, _hooks: &mut HookTable, _hook: HookId) -> Result<i64, CodecError> {
        Err(CodecError::LocalCapabilityInMap)
    }

    fn export_promise(&mut self, _hooks: &mut HookTable, _hook: HookId) -> Result<i64, CodecError> {
        Err(CodecError::LocalCapabilityInMap)
    }

    fn get_import(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, CodecError> {
        self.capture(hooks, hook)
    }
}

// ---------------------------------------------------------------------------
// MapRecorder — the callback-facing surface
// ---------------------------------------------------------------------------

/// Context handed to a map callback. The placeholder surface exposes only
/// `get`, `call`, and nested `map`; everything else a hook can do is
/// unavailable by construction while recording.
pub struct MapRecorder<'a> {
    pub(crate) hooks: &'a mut HookTable,
    pub(crate) builders: &'a mut BuilderStack,
    pub(crate) max_instructions: usize,
}

impl MapRecorder<'_> {
    /// Record a property access on `subject`.
    pub fn get(&mut self, subject: HookId, path: PropertyPath) -> Result<HookId, MapMisuse> {
        self.builders
            .push_get(self.hooks, subject, path, self.max_instructions)
    }

    /// Record a method call on `subject`. The caller keeps ownership of any
    /// hooks inside `args`.
    pub fn call(
        &mut self,
        subject: HookId,
        path: PropertyPath,
        args: &[Value],
    ) -> Result<HookId, MapMisuse> {
        self.builders
            .push_call(self.hooks, subject, path, args, self.max_instructions)
    }

    /// Record a nested map over `subject`. The nested callback records into
    /// its own frame; its recording is spliced into this frame as a single
    /// `remap` instruction.
    pub fn map<F>(
        &mut self,
        subject: HookId,
        path: PropertyPath,
        f: F,
    ) -> Result<HookId, MapMisuse>
    where
        F: FnOnce(&mut MapRecorder<'_>, HookId) -> Result<Value, MapMisuse>,
    {
        let subject_idx = self.builders.capture(self.hooks, subject)?;
        self.builders.push_frame();

        let result = (|| {
            let input = self.builders.make_input(self.hooks)?;
            let output = {
                let mut nested = MapRecorder {
                    hooks: &mut *self.hooks,
                    builders: &mut *self.builders,
                    max_instructions: self.max_instructions,
                };
                f(&mut nested, input)?
            };
            if matches!(output, Value::Pending(_)) {
                return Err(MapMisuse::AsyncCallback);
            }
            devaluate(&output, self.hooks, self.builders).map_err(MapMisuse::from)
        })();

        let terminator = match result {
            Ok(t) => t,
            Err(e) => {
                let recording = self.builders.abandon_frame(self.hooks);
                BuilderStack::dispose_recording(self.hooks, recording);
                return Err(e);
            }
        };

        let recording =
            self.builders
                .finish_frame(self.hooks, terminator, self.max_instructions)?;
        let captures = recording
            .captures
            .iter()
            .map(|c| match c {
                CaptureRef::Parent(idx) => Expr::Import(*idx),
                CaptureRef::Hook(_) => unreachable!("nested frames capture by parent index"),
            })
            .collect();

        let idx = self.builders.append_instruction(
            Expr::Remap {
                subject: subject_idx,
                path,
                captures,
                body: recording.instructions,
            },
            self.max_instructions,
        )?;
        self.builders.placeholder(self.hooks, idx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
