//! The user-facing dispatch seam and local invocation plumbing.
//!
//! Applications implement `Target` for the objects they expose. The runtime
//! never inspects a target beyond these two methods; results become payload
//! stubs, and a returned `Err` rejects the corresponding slot while the
//! session continues.

use std::rc::Rc;

use crate::hook::{HookId, HookKind, HookTable};
use crate::path::{PathPart, PropertyPath};
use crate::payload::Payload;
use crate::value::{ErrorValue, Value};

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// A locally implemented capability.
pub trait Target {
    /// Invoke the method at `path` with `args`.
    fn call(
        &self,
        path: &PropertyPath,
        args: Vec<Value>,
        ctx: &mut TargetCtx<'_>,
    ) -> Result<Value, ErrorValue>;

    /// Read the property at `path`.
    fn get(&self, path: &PropertyPath, ctx: &mut TargetCtx<'_>) -> Result<Value, ErrorValue>;
}

/// Context handed to target methods so results can carry new capabilities.
pub struct TargetCtx<'a> {
    hooks: &'a mut HookTable,
}

impl<'a> TargetCtx<'a> {
    pub fn new(hooks: &'a mut HookTable) -> Self {
        Self { hooks }
    }

    /// Wrap a new local target as a stub value owned by the result.
    pub fn export(&mut self, target: Rc<dyn Target>) -> Value {
        let hook = self.hooks.insert(HookKind::LocalTarget {
            target,
            path: PropertyPath::root(),
        });
        Value::Stub(hook)
    }

    /// Add one reference to every capability inside `value`. Arguments are
    /// callee-borrowed; a target that keeps or returns an argument
    /// capability must retain it first.
    pub fn retain(&mut self, value: &Value) -> Result<(), ErrorValue> {
        let mut found = Vec::new();
        value.collect_hooks(&mut found);
        for hook in found {
            self.hooks
                .dup(hook)
                .map_err(|e| ErrorValue::generic(e.to_string()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

/// Owned outcome of walking a path through a payload value.
enum NavOutcome {
    /// Walk ended on a concrete value (cloned out of the payload).
    Hit(Value),
    /// Walk reached a hook with path elements remaining.
    IntoHook(HookId, PropertyPath),
}

/// Walk `path` through `value` with property-access semantics: a missing
/// final element yields `Undefined`; navigating through a missing element
/// or a scalar is a type error.
fn navigate(value: &Value, path: &PropertyPath) -> Result<NavOutcome, ErrorValue> {
    let mut current = value;
    for (depth, part) in path.0.iter().enumerate() {
        match current {
            Value::Stub(h) | Value::Promise(h) => {
                return Ok(NavOutcome::IntoHook(
                    *h,
                    PropertyPath(path.0[depth..].to_vec()),
                ));
            }
            Value::Object(map) => {
                let key = match part {
                    PathPart::Key(k) => k.clone(),
                    PathPart::Index(i) => i.to_string(),
                };
                match map.get(&key) {
                    Some(next) => current = next,
                    None => return missing_element(path, depth),
                }
            }
            Value::Array(items) => match part {
                PathPart::Index(i) => match items.get(*i as usize) {
                    Some(next) => current = next,
                    None => return missing_element(path, depth),
                },
                PathPart::Key(_) => return missing_element(path, depth),
            },
            other => {
                return Err(ErrorValue::type_error(format!(
                    "cannot read property '{part}' of {}",
                    other.type_name()
                )));
            }
        }
    }
    match current {
        Value::Stub(h) | Value::Promise(h) => Ok(NavOutcome::IntoHook(*h, PropertyPath::root())),
        other => Ok(NavOutcome::Hit(other.clone())),
    }
}

fn missing_element(path: &PropertyPath, depth: usize) -> Result<NavOutcome, ErrorValue> {
    if depth + 1 == path.len() {
        Ok(NavOutcome::Hit(Value::Undefined))
    } else {
        Err(ErrorValue::type_error(format!(
            "cannot read property '{}' of undefined",
            path.0[depth + 1]
        )))
    }
}

// ---------------------------------------------------------------------------
// Descent
// ---------------------------------------------------------------------------

/// Where a read-only walk through payload structure ends up.
pub(crate) enum Descent {
    /// A concrete value (cloned; interior hooks are NOT duplicated).
    Value(Value),
    /// A capability boundary with the path remaining past it.
    Capability(HookId, PropertyPath),
}

/// Walk `path` through `value`, descending through payload-stub hooks,
/// stopping at the first non-payload capability.
pub(crate) fn descend_value(
    hooks: &HookTable,
    value: &Value,
    path: &PropertyPath,
) -> Result<Descent, ErrorValue> {
    match navigate(value, path)? {
        NavOutcome::Hit(v) => Ok(Descent::Value(v)),
        NavOutcome::IntoHook(h, rest) => descend(hooks, h, &rest),
    }
}

fn descend(hooks: &HookTable, subject: HookId, path: &PropertyPath) -> Result<Descent, ErrorValue> {
    match hooks
        .kind(subject)
        .map_err(|e| ErrorValue::generic(e.to_string()))?
    {
        HookKind::PayloadStub { payload } => descend_value(hooks, &payload.value, path),
        _ => Ok(Descent::Capability(subject, path.clone())),
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Wrap a produced value as an owned result hook. A bare stub result is
/// returned as the stub itself (one extra reference); anything else becomes
/// a payload stub owning its interior hooks.
pub(crate) fn wrap_result(hooks: &mut HookTable, value: Value) -> Result<HookId, ErrorValue> {
    let payload = Payload::capture(value);
    if let Some(h) = payload.as_single_stub() {
        // Transfer the payload's single reference directly.
        let _ = payload.into_hooks();
        return Ok(h);
    }
    Ok(hooks.insert(HookKind::PayloadStub { payload }))
}

fn dup_value_hooks(hooks: &mut HookTable, value: &Value) -> Result<(), ErrorValue> {
    let mut found = Vec::new();
    value.collect_hooks(&mut found);
    for h in found {
        hooks
            .dup(h)
            .map_err(|e| ErrorValue::generic(e.to_string()))?;
    }
    Ok(())
}

/// Owned dispatch plan extracted from a subject's kind, so the table borrow
/// ends before invocation mutates the table.
enum SubjectPlan {
    Target(Rc<dyn Target>, PropertyPath),
    Nav(NavOutcome),
}

fn subject_plan(
    hooks: &HookTable,
    subject: HookId,
    path: &PropertyPath,
) -> Result<SubjectPlan, ErrorValue> {
    match hooks
        .kind(subject)
        .map_err(|e| ErrorValue::generic(e.to_string()))?
    {
        HookKind::LocalTarget { target, path: base } => {
            Ok(SubjectPlan::Target(Rc::clone(target), base.join(path)))
        }
        HookKind::PayloadStub { payload } => Ok(SubjectPlan::Nav(navigate(&payload.value, path)?)),
        HookKind::Error(e) | HookKind::Broken(e) => Err(e.clone()),
        HookKind::MapVariable { .. } => Err(ErrorValue::generic(
            "abstract placeholder used outside map",
        )),
        HookKind::Import { .. } => Err(ErrorValue::type_error(
            "cannot pipeline through a remote capability here",
        )),
    }
}

/// Read `path` on `subject`, producing an owned result hook. `subject` is
/// borrowed, never consumed. Local kinds only; remote subjects are resolved
/// by the session before invocation.
pub(crate) fn invoke_get(
    hooks: &mut HookTable,
    subject: HookId,
    path: &PropertyPath,
) -> Result<HookId, ErrorValue> {
    if path.is_empty() {
        // get(root) addresses the capability itself.
        return hooks
            .dup(subject)
            .map_err(|e| ErrorValue::generic(e.to_string()));
    }
    match subject_plan(hooks, subject, path)? {
        SubjectPlan::Target(target, full) => {
            let value = target.get(&full, &mut TargetCtx::new(hooks))?;
            wrap_result(hooks, value)
        }
        SubjectPlan::Nav(NavOutcome::Hit(value)) => {
            dup_value_hooks(hooks, &value)?;
            wrap_result(hooks, value)
        }
        SubjectPlan::Nav(NavOutcome::IntoHook(h, rest)) => invoke_get(hooks, h, &rest),
    }
}

/// Invoke the method at `path` on `subject` with `args`, producing an owned
/// result hook. `subject` is borrowed, never consumed.
pub(crate) fn invoke_call(
    hooks: &mut HookTable,
    subject: HookId,
    path: &PropertyPath,
    args: Vec<Value>,
) -> Result<HookId, ErrorValue> {
    match subject_plan(hooks, subject, path)? {
        SubjectPlan::Target(target, full) => {
            let value = target.call(&full, args, &mut TargetCtx::new(hooks))?;
            wrap_result(hooks, value)
        }
        SubjectPlan::Nav(NavOutcome::Hit(Value::Stub(h)))
        | SubjectPlan::Nav(NavOutcome::Hit(Value::Promise(h))) => {
            invoke_call(hooks, h, &PropertyPath::root(), args)
        }
        SubjectPlan::Nav(NavOutcome::Hit(other)) => Err(ErrorValue::type_error(format!(
            "{} is not callable",
            other.type_name()
        ))),
        SubjectPlan::Nav(NavOutcome::IntoHook(h, rest)) => invoke_call(hooks, h, &rest, args),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
