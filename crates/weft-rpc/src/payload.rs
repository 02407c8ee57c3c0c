//! Owned value cargo.
//!
//! A payload couples a value with the hooks discovered inside it and owns
//! those hooks: disposing the payload disposes them all. Payloads move by
//! default; `deep_copy` is the explicit owning copy and duplicates every
//! interior hook.

use std::fmt;

use crate::hook::{HookError, HookTable, ReleaseSink};
use crate::value::Value;

use crate::hook::HookId;

/// An owned value plus the hooks it contains.
#[derive(Debug)]
pub struct Payload {
    pub value: Value,
    hooks: Vec<HookId>,
}

impl Payload {
    /// Assemble from a value and an explicit hook list.
    pub fn new(value: Value, hooks: Vec<HookId>) -> Self {
        Self { value, hooks }
    }

    /// Assemble by scanning `value` for the hooks it contains. Each
    /// occurrence is treated as one owned reference.
    pub fn capture(value: Value) -> Self {
        let mut hooks = Vec::new();
        value.collect_hooks(&mut hooks);
        Self { value, hooks }
    }

    /// A payload with no hooks.
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            hooks: Vec::new(),
        }
    }

    pub fn hooks(&self) -> &[HookId] {
        &self.hooks
    }

    /// Is the whole payload a single bare stub (no surrounding structure)?
    pub fn as_single_stub(&self) -> Option<HookId> {
        match self.value {
            Value::Stub(h) | Value::Promise(h) if self.hooks.len() == 1 && self.hooks[0] == h => {
                Some(h)
            }
            _ => None,
        }
    }

    /// Release every owned hook. The value itself is dropped with `self`.
    pub fn dispose(self, table: &mut HookTable, sink: &mut dyn ReleaseSink) -> Result<(), HookError> {
        for hook in self.hooks {
            table.dispose_with(hook, sink)?;
        }
        Ok(())
    }

    /// Surrender the hook list without disposing (ownership transfer).
    pub fn into_hooks(self) -> Vec<HookId> {
        self.hooks
    }

    /// Split into the value and the owned hook list (ownership transfer).
    pub fn into_parts(self) -> (Value, Vec<HookId>) {
        (self.value, self.hooks)
    }

    /// Explicit owning copy: clones the value and duplicates every interior
    /// hook so both payloads hold one reference each.
    pub fn deep_copy(&self, table: &mut HookTable) -> Result<Payload, HookError> {
        for hook in &self.hooks {
            table.dup(*hook)?;
        }
        Ok(Payload {
            value: self.value.clone(),
            hooks: self.hooks.clone(),
        })
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload({}, {} hooks)", self.value, self.hooks.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
