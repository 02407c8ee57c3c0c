//! Capability tables: exports (what we gave the peer) and imports (what we
//! hold from the peer), both refcounted.
//!
//! Keys are signed: positive keys were allocated locally, negative keys by
//! the peer, 0 is the bootstrap. Keys are allocated monotonically and never
//! reused while live. Refcount underflow and bootstrap release are protocol
//! violations.

use std::collections::BTreeMap;
use std::fmt;

use crate::hook::{HookError, HookId, HookTable, ReleaseSink};
use crate::payload::Payload;
use crate::session::PullId;
use crate::value::ErrorValue;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Table contract violations. All of these are protocol-fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    UnknownKey(i64),
    KeyInUse(i64),
    BootstrapRelease,
    RefcountUnderflow { key: i64, held: u32, released: u32 },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "unknown table key {key}"),
            Self::KeyInUse(key) => write!(f, "table key {key} already in use"),
            Self::BootstrapRelease => write!(f, "bootstrap entry cannot be released"),
            Self::RefcountUnderflow {
                key,
                held,
                released,
            } => write!(
                f,
                "refcount underflow on key {key}: held {held}, released {released}"
            ),
        }
    }
}

impl std::error::Error for TableError {}

// ---------------------------------------------------------------------------
// ExportTable
// ---------------------------------------------------------------------------

/// Resolution state of a promise export (a peer push we evaluated).
#[derive(Debug)]
pub enum PromiseState {
    Resolved(HookId),
    Rejected(ErrorValue),
}

/// One export table entry.
#[derive(Debug)]
pub enum ExportEntry {
    /// A capability we handed out; `refs` counts wire references.
    Capability { hook: HookId, refs: u32 },
    /// The evaluated result of a peer push, awaiting pull/release.
    Promise { state: PromiseState, refs: u32 },
}

/// Capabilities we have given the peer.
#[derive(Debug, Default)]
pub struct ExportTable {
    entries: BTreeMap<i64, ExportEntry>,
    by_hook: BTreeMap<HookId, i64>,
    next_key: i64,
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_hook: BTreeMap::new(),
            next_key: 1,
        }
    }

    /// Install the bootstrap capability at key 0.
    pub fn install_bootstrap(&mut self, hook: HookId) {
        self.entries
            .insert(0, ExportEntry::Capability { hook, refs: 1 });
        self.by_hook.insert(hook, 0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: i64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn entry(&self, key: i64) -> Result<&ExportEntry, TableError> {
        self.entries.get(&key).ok_or(TableError::UnknownKey(key))
    }

    /// Export a hook, reusing the existing entry when the same handle was
    /// already exported. The caller keeps its own reference; the table holds
    /// one of its own for new entries.
    pub fn export(&mut self, hooks: &mut HookTable, hook: HookId) -> Result<i64, HookError> {
        if let Some(&key) = self.by_hook.get(&hook) {
            if let Some(ExportEntry::Capability { refs, .. }) = self.entries.get_mut(&key) {
                *refs += 1;
                return Ok(key);
            }
        }
        let key = self.next_key;
        self.next_key += 1;
        hooks.dup(hook)?;
        self.entries
            .insert(key, ExportEntry::Capability { hook, refs: 1 });
        self.by_hook.insert(hook, key);
        Ok(key)
    }

    /// Record the evaluated result of a peer push under `key` (negative).
    pub fn insert_promise(&mut self, key: i64, state: PromiseState) -> Result<(), TableError> {
        if self.entries.contains_key(&key) {
            return Err(TableError::KeyInUse(key));
        }
        self.entries
            .insert(key, ExportEntry::Promise { state, refs: 1 });
        Ok(())
    }

    /// The result hook of a promise entry, or the rejection.
    pub fn promise_result(&self, key: i64) -> Result<&PromiseState, TableError> {
        match self.entry(key)? {
            ExportEntry::Promise { state, .. } => Ok(state),
            ExportEntry::Capability { .. } => Err(TableError::UnknownKey(key)),
        }
    }

    /// The subject hook a pipeline expression addresses: a capability's hook
    /// or a resolved promise's hook; a rejected promise yields its error.
    pub fn subject_hook(&self, key: i64) -> Result<Result<HookId, ErrorValue>, TableError> {
        match self.entry(key)? {
            ExportEntry::Capability { hook, .. } => Ok(Ok(*hook)),
            ExportEntry::Promise { state, .. } => match state {
                PromiseState::Resolved(hook) => Ok(Ok(*hook)),
                PromiseState::Rejected(err) => Ok(Err(err.clone())),
            },
        }
    }

    /// Decrement `key` by `count`, removing the entry (and disposing its
    /// hook) at zero.
    pub fn release(
        &mut self,
        key: i64,
        count: u32,
        hooks: &mut HookTable,
        sink: &mut dyn ReleaseSink,
    ) -> Result<(), TableError> {
        if key == 0 {
            return Err(TableError::BootstrapRelease);
        }
        let entry = self.entries.get_mut(&key).ok_or(TableError::UnknownKey(key))?;
        let refs = match entry {
            ExportEntry::Capability { refs, .. } | ExportEntry::Promise { refs, .. } => refs,
        };
        if *refs < count {
            return Err(TableError::RefcountUnderflow {
                key,
                held: *refs,
                released: count,
            });
        }
        *refs -= count;
        if *refs > 0 {
            return Ok(());
        }
        let entry = self.entries.remove(&key).expect("entry checked present");
        match entry {
            ExportEntry::Capability { hook, .. } => {
                self.by_hook.remove(&hook);
                // Table errors here would mean the hook was already freed,
                // which release semantics forbid.
                hooks
                    .dispose_with(hook, sink)
                    .map_err(|_| TableError::UnknownKey(key))?;
            }
            ExportEntry::Promise { state, .. } => {
                if let PromiseState::Resolved(hook) = state {
                    hooks
                        .dispose_with(hook, sink)
                        .map_err(|_| TableError::UnknownKey(key))?;
                }
            }
        }
        Ok(())
    }

    /// Keys currently live, for audit snapshots.
    pub fn keys(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// ImportTable
// ---------------------------------------------------------------------------

/// Resolution state of an import entry.
#[derive(Debug)]
pub enum ImportState {
    /// A settled remote capability (codec-imported stub or bootstrap).
    Capability,
    /// A push result awaiting resolution.
    Pending { pulls: Vec<PullId>, pull_sent: bool },
    /// Resolved with an owned payload.
    Resolved { payload: Payload },
    /// Rejected by the peer.
    Rejected { error: ErrorValue },
}

/// One import table entry.
#[derive(Debug)]
pub struct ImportEntry {
    /// Live `Import`-kind hook slots bound to this key.
    pub local_hooks: u32,
    /// Wire references the peer holds on our behalf (occurrences received
    /// minus releases already sent).
    pub remote_refs: u32,
    pub state: ImportState,
}

/// Capabilities we hold from the peer.
#[derive(Debug, Default)]
pub struct ImportTable {
    entries: BTreeMap<i64, ImportEntry>,
    next_key: i64,
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_key: 1,
        }
    }

    /// Install the bootstrap import at key 0.
    pub fn install_bootstrap(&mut self) {
        self.entries.insert(
            0,
            ImportEntry {
                local_hooks: 0,
                remote_refs: 1,
                state: ImportState::Capability,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: i64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn entry(&self, key: i64) -> Result<&ImportEntry, TableError> {
        self.entries.get(&key).ok_or(TableError::UnknownKey(key))
    }

    pub fn entry_mut(&mut self, key: i64) -> Result<&mut ImportEntry, TableError> {
        self.entries.get_mut(&key).ok_or(TableError::UnknownKey(key))
    }

    /// Allocate a fresh key for an outgoing push.
    pub fn allocate_push(&mut self) -> i64 {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.insert(
            key,
            ImportEntry {
                local_hooks: 0,
                remote_refs: 1,
                state: ImportState::Pending {
                    pulls: Vec::new(),
                    pull_sent: false,
                },
            },
        );
        key
    }

    /// Record one received occurrence of a peer-exported capability,
    /// creating the pending-value slot if absent.
    pub fn import(&mut self, key: i64) -> &mut ImportEntry {
        let entry = self.entries.entry(key).or_insert(ImportEntry {
            local_hooks: 0,
            remote_refs: 0,
            state: ImportState::Capability,
        });
        entry.remote_refs += 1;
        entry
    }

    /// A new `Import`-kind hook slot was minted for `key`.
    pub fn attach_hook(&mut self, key: i64) -> Result<(), TableError> {
        self.entry_mut(key)?.local_hooks += 1;
        Ok(())
    }

    /// An `Import`-kind hook slot bound to `key` was freed. Returns the
    /// entry when this was the last local hook: the caller removes it and
    /// sends any outstanding wire release. Key 0 is never removed.
    pub fn detach_hook(&mut self, key: i64) -> Option<ImportEntry> {
        let entry = self.entries.get_mut(&key)?;
        entry.local_hooks = entry.local_hooks.saturating_sub(1);
        if entry.local_hooks == 0 && key != 0 {
            return self.entries.remove(&key);
        }
        None
    }

    /// Fulfill a pending slot. Returns the registered pulls.
    pub fn resolve(&mut self, key: i64, payload: Payload) -> Result<Vec<PullId>, TableError> {
        let entry = self.entry_mut(key)?;
        let pulls = match &mut entry.state {
            ImportState::Pending { pulls, .. } => std::mem::take(pulls),
            _ => Vec::new(),
        };
        entry.state = ImportState::Resolved { payload };
        Ok(pulls)
    }

    /// Reject a pending slot. Returns the registered pulls.
    pub fn reject(&mut self, key: i64, error: ErrorValue) -> Result<Vec<PullId>, TableError> {
        let entry = self.entry_mut(key)?;
        let pulls = match &mut entry.state {
            ImportState::Pending { pulls, .. } => std::mem::take(pulls),
            _ => Vec::new(),
        };
        entry.state = ImportState::Rejected { error };
        Ok(pulls)
    }

    /// Keys currently live, for audit snapshots.
    pub fn keys(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }

    /// Drain the registered pulls of every pending entry (session teardown).
    pub fn take_all_pending_pulls(&mut self) -> Vec<PullId> {
        let mut out = Vec::new();
        for entry in self.entries.values_mut() {
            if let ImportState::Pending { pulls, .. } = &mut entry.state {
                out.append(pulls);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
