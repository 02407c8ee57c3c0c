//! Hook handles and the table that owns them.
//!
//! A hook is the sole vehicle for capability references. Handles are u32
//! indices into an append-only slot table; slots are never reused, so a
//! stale handle is always detectable. `dup` is the only way to mint a second
//! owner and every `dup`/construction must be paired with exactly one
//! `dispose`.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::path::PropertyPath;
use crate::payload::Payload;
use crate::target::Target;
use crate::value::ErrorValue;

// ---------------------------------------------------------------------------
// HookId
// ---------------------------------------------------------------------------

/// Opaque handle referencing a hook slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HookId(pub u32);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// HookKind
// ---------------------------------------------------------------------------

/// What a hook refers to.
pub enum HookKind {
    /// A local application target, addressed through `path`.
    LocalTarget {
        target: Rc<dyn Target>,
        path: PropertyPath,
    },
    /// An owned payload acting as a capability (resolved results).
    PayloadStub { payload: Payload },
    /// An entry in the import table, addressed through `path`.
    Import { key: i64, path: PropertyPath },
    /// A recording placeholder: `index` into the builder frame at `frame`.
    MapVariable { frame: usize, index: i64 },
    /// A capability that was born failed.
    Error(ErrorValue),
    /// A capability that is known dead.
    Broken(ErrorValue),
}

impl HookKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalTarget { .. } => "local-target",
            Self::PayloadStub { .. } => "payload-stub",
            Self::Import { .. } => "import",
            Self::MapVariable { .. } => "map-variable",
            Self::Error(_) => "error",
            Self::Broken(_) => "broken",
        }
    }
}

impl fmt::Debug for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalTarget { path, .. } => write!(f, "LocalTarget({path})"),
            Self::PayloadStub { payload } => write!(f, "PayloadStub({})", payload.value),
            Self::Import { key, path } => write!(f, "Import({key}, {path})"),
            Self::MapVariable { frame, index } => write!(f, "MapVariable({frame}, {index})"),
            Self::Error(e) => write!(f, "Error({e})"),
            Self::Broken(e) => write!(f, "Broken({e})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Hook-table contract violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The handle addresses a slot that was already freed (or never existed).
    StaleHandle(HookId),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleHandle(id) => write!(f, "stale hook handle {id}"),
        }
    }
}

impl std::error::Error for HookError {}

// ---------------------------------------------------------------------------
// ReleaseSink
// ---------------------------------------------------------------------------

/// Receiver for table-level side effects of hook disposal.
///
/// Disposing the last reference to an import hook must decrement the import
/// table entry; the hook table itself does not know about sessions, so the
/// caller supplies the sink.
pub trait ReleaseSink {
    fn import_released(&mut self, key: i64);
}

/// Sink that ignores all effects (standalone table use in tests).
#[derive(Debug, Default)]
pub struct NullSink;

impl ReleaseSink for NullSink {
    fn import_released(&mut self, _key: i64) {}
}

/// Sink collecting released import keys in order.
#[derive(Debug, Default)]
pub struct CollectSink(pub Vec<i64>);

impl ReleaseSink for CollectSink {
    fn import_released(&mut self, key: i64) {
        self.0.push(key);
    }
}

// ---------------------------------------------------------------------------
// HookTable
// ---------------------------------------------------------------------------

/// One-shot callback invoked when a hook's capability is known dead.
pub type BrokenWatcher = Box<dyn FnOnce(&ErrorValue)>;

struct HookSlot {
    refs: u32,
    kind: HookKind,
    watchers: Vec<BrokenWatcher>,
}

impl fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HookSlot {{ refs: {}, kind: {:?}, watchers: {} }}",
            self.refs,
            self.kind,
            self.watchers.len()
        )
    }
}

/// Append-only slot table owning every live hook.
#[derive(Debug, Default)]
pub struct HookTable {
    slots: Vec<Option<HookSlot>>,
    live: usize,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live hooks (the refcount-balance observable).
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Mint a new hook with one reference.
    pub fn insert(&mut self, kind: HookKind) -> HookId {
        let id = HookId(self.slots.len() as u32);
        self.slots.push(Some(HookSlot {
            refs: 1,
            kind,
            watchers: Vec::new(),
        }));
        self.live += 1;
        id
    }

    fn slot(&self, id: HookId) -> Result<&HookSlot, HookError> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(HookError::StaleHandle(id))
    }

    fn slot_mut(&mut self, id: HookId) -> Result<&mut HookSlot, HookError> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(HookError::StaleHandle(id))
    }

    /// The kind of a live hook.
    pub fn kind(&self, id: HookId) -> Result<&HookKind, HookError> {
        Ok(&self.slot(id)?.kind)
    }

    /// Current reference count of a live hook.
    pub fn refs(&self, id: HookId) -> Result<u32, HookError> {
        Ok(self.slot(id)?.refs)
    }

    /// Is the handle live?
    pub fn is_live(&self, id: HookId) -> bool {
        self.slot(id).is_ok()
    }

    /// Add one reference; the only way to create a second owner.
    pub fn dup(&mut self, id: HookId) -> Result<HookId, HookError> {
        let slot = self.slot_mut(id)?;
        slot.refs += 1;
        Ok(id)
    }

    /// Release one reference, freeing the slot at zero. Interior hooks of a
    /// freed payload are released transitively; freed import hooks are
    /// reported to `sink`.
    pub fn dispose_with(&mut self, id: HookId, sink: &mut dyn ReleaseSink) -> Result<(), HookError> {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let slot = self.slot_mut(id)?;
            if slot.refs > 1 {
                slot.refs -= 1;
                continue;
            }
            let slot = self.slots[id.0 as usize].take().expect("slot checked live");
            self.live -= 1;
            match slot.kind {
                HookKind::PayloadStub { payload } => {
                    work.extend(payload.into_hooks());
                }
                HookKind::Import { key, .. } => {
                    sink.import_released(key);
                }
                HookKind::LocalTarget { .. }
                | HookKind::MapVariable { .. }
                | HookKind::Error(_)
                | HookKind::Broken(_) => {}
            }
        }
        Ok(())
    }

    /// One-shot broken notification. Fires immediately when the hook is
    /// already failed.
    pub fn on_broken(
        &mut self,
        id: HookId,
        watcher: BrokenWatcher,
    ) -> Result<(), HookError> {
        let slot = self.slot_mut(id)?;
        match &slot.kind {
            HookKind::Broken(err) | HookKind::Error(err) => {
                let err = err.clone();
                watcher(&err);
            }
            _ => slot.watchers.push(watcher),
        }
        Ok(())
    }

    /// Mark a hook dead and drain its watchers. Idempotent on an already
    /// broken hook.
    pub fn break_hook(&mut self, id: HookId, err: &ErrorValue) -> Result<(), HookError> {
        let slot = self.slot_mut(id)?;
        if matches!(slot.kind, HookKind::Broken(_)) {
            return Ok(());
        }
        slot.kind = HookKind::Broken(err.clone());
        let watchers = std::mem::take(&mut slot.watchers);
        for watcher in watchers {
            watcher(err);
        }
        Ok(())
    }

    /// Break every import hook bound to `key`. Returns the handles broken.
    pub fn break_imports(&mut self, key: i64, err: &ErrorValue) -> Vec<HookId> {
        let ids: Vec<HookId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(s) => match &s.kind {
                    HookKind::Import { key: k, .. } if *k == key => Some(HookId(i as u32)),
                    _ => None,
                },
                None => None,
            })
            .collect();
        for id in &ids {
            let _ = self.break_hook(*id, err);
        }
        ids
    }

    /// Break every import hook in the table (session teardown).
    pub fn break_all_imports(&mut self, err: &ErrorValue) -> Vec<HookId> {
        let ids: Vec<HookId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(s) => match &s.kind {
                    HookKind::Import { .. } => Some(HookId(i as u32)),
                    _ => None,
                },
                None => None,
            })
            .collect();
        for id in &ids {
            let _ = self.break_hook(*id, err);
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorKind;
    use std::cell::Cell;

    fn error_kind_hook(table: &mut HookTable, msg: &str) -> HookId {
        table.insert(HookKind::Error(ErrorValue::new(ErrorKind::Generic, msg)))
    }

    #[test]
    fn insert_then_dispose_balances() {
        let mut table = HookTable::new();
        let id = error_kind_hook(&mut table, "x");
        assert_eq!(table.live_count(), 1);
        table.dispose_with(id, &mut NullSink).expect("dispose");
        assert_eq!(table.live_count(), 0);
        assert!(!table.is_live(id));
    }

    #[test]
    fn dup_requires_matching_dispose() {
        let mut table = HookTable::new();
        let id = error_kind_hook(&mut table, "x");
        table.dup(id).expect("dup");
        assert_eq!(table.refs(id).expect("refs"), 2);

        table.dispose_with(id, &mut NullSink).expect("first");
        assert!(table.is_live(id));
        table.dispose_with(id, &mut NullSink).expect("second");
        assert!(!table.is_live(id));
    }

    #[test]
    fn dispose_after_free_is_a_stale_handle() {
        let mut table = HookTable::new();
        let id = error_kind_hook(&mut table, "x");
        table.dispose_with(id, &mut NullSink).expect("dispose");
        let err = table.dispose_with(id, &mut NullSink).expect_err("stale");
        assert_eq!(err, HookError::StaleHandle(id));
    }

    #[test]
    fn handles_are_never_reused() {
        let mut table = HookTable::new();
        let a = error_kind_hook(&mut table, "a");
        table.dispose_with(a, &mut NullSink).expect("dispose");
        let b = error_kind_hook(&mut table, "b");
        assert_ne!(a, b);
    }

    #[test]
    fn disposing_import_reports_key_to_sink() {
        let mut table = HookTable::new();
        let id = table.insert(HookKind::Import {
            key: 7,
            path: PropertyPath::root(),
        });
        let mut sink = CollectSink::default();
        table.dispose_with(id, &mut sink).expect("dispose");
        assert_eq!(sink.0, vec![7]);
    }

    #[test]
    fn disposing_payload_stub_releases_interior_hooks() {
        let mut table = HookTable::new();
        let inner = table.insert(HookKind::Import {
            key: 3,
            path: PropertyPath::root(),
        });
        let payload = Payload::new(crate::value::Value::Stub(inner), vec![inner]);
        let outer = table.insert(HookKind::PayloadStub { payload });

        let mut sink = CollectSink::default();
        table.dispose_with(outer, &mut sink).expect("dispose");
        assert_eq!(sink.0, vec![3]);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn on_broken_fires_once_on_break() {
        let mut table = HookTable::new();
        let id = table.insert(HookKind::Import {
            key: 1,
            path: PropertyPath::root(),
        });

        let fired = Rc::new(Cell::new(0u32));
        let fired_in = Rc::clone(&fired);
        table
            .on_broken(id, Box::new(move |_| fired_in.set(fired_in.get() + 1)))
            .expect("watch");

        let err = ErrorValue::generic("gone");
        table.break_hook(id, &err).expect("break");
        table.break_hook(id, &err).expect("idempotent");
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn on_broken_fires_immediately_when_already_broken() {
        let mut table = HookTable::new();
        let id = error_kind_hook(&mut table, "dead");
        let fired = Rc::new(Cell::new(false));
        let fired_in = Rc::clone(&fired);
        table
            .on_broken(id, Box::new(move |_| fired_in.set(true)))
            .expect("watch");
        assert!(fired.get());
    }

    #[test]
    fn break_imports_targets_only_matching_key() {
        let mut table = HookTable::new();
        let a = table.insert(HookKind::Import {
            key: 1,
            path: PropertyPath::root(),
        });
        let b = table.insert(HookKind::Import {
            key: 2,
            path: PropertyPath::root(),
        });

        let broken = table.break_imports(1, &ErrorValue::generic("gone"));
        assert_eq!(broken, vec![a]);
        assert!(matches!(table.kind(a).expect("a"), HookKind::Broken(_)));
        assert!(matches!(table.kind(b).expect("b"), HookKind::Import { .. }));
    }
}
