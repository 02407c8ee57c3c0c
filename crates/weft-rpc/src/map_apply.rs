//! Replay of recorded maps against concrete data.
//!
//! The applicator owns a variable list: slot 0 is the concrete input, each
//! further slot the result of one instruction. Positive indices address
//! variables, negative indices the captured hooks. Intermediate variables
//! are not disposed until the apply completes, because pipelined results in
//! the final payload may depend on them.

use crate::codec::{evaluate, payload_to_hook, CodecError, EvalError, ExportLookup, Importer};
use crate::expr::Expr;
use crate::hook::{HookId, HookKind, HookTable, ReleaseSink};
use crate::payload::Payload;
use crate::value::{ErrorValue, Value};

// ---------------------------------------------------------------------------
// Importer contract during replay
// ---------------------------------------------------------------------------

struct Replay {
    variables: Vec<HookId>,
    captures: Vec<HookId>,
}

impl Importer for Replay {
    fn import_stub(&mut self, _hooks: &mut HookTable, id: i64) -> Result<HookId, CodecError> {
        // A recorded callback never legitimately references new exports;
        // builders reject local capabilities while recording.
        Err(CodecError::ImportInReplay { id })
    }

    fn import_promise(&mut self, _hooks: &mut HookTable, id: i64) -> Result<HookId, CodecError> {
        Err(CodecError::ImportInReplay { id })
    }

    fn get_export(&mut self, id: i64) -> Result<ExportLookup, CodecError> {
        let hook = if id >= 0 {
            self.variables.get(id as usize)
        } else {
            self.captures.get((-id - 1) as usize)
        };
        hook.copied()
            .map(ExportLookup::Hook)
            .ok_or(CodecError::UnknownKey { id })
    }
}

// ---------------------------------------------------------------------------
// Input materialization
// ---------------------------------------------------------------------------

/// Materialize a hook into an owned input value for replay: payload stubs
/// yield a deep copy of their cargo, capabilities yield one new reference.
pub(crate) fn hook_input_value(hooks: &mut HookTable, hook: HookId) -> Result<Value, ErrorValue> {
    enum Plan {
        Deep(Value, Vec<HookId>),
        Capability,
    }
    let plan = match hooks
        .kind(hook)
        .map_err(|e| ErrorValue::generic(e.to_string()))?
    {
        HookKind::PayloadStub { payload } => {
            Plan::Deep(payload.value.clone(), payload.hooks().to_vec())
        }
        HookKind::Error(e) | HookKind::Broken(e) => return Err(e.clone()),
        HookKind::LocalTarget { .. } | HookKind::Import { .. } => Plan::Capability,
        HookKind::MapVariable { .. } => {
            return Err(ErrorValue::generic("abstract placeholder used outside map"));
        }
    };
    match plan {
        Plan::Deep(value, interior) => {
            for h in interior {
                hooks
                    .dup(h)
                    .map_err(|e| ErrorValue::generic(e.to_string()))?;
            }
            Ok(value)
        }
        Plan::Capability => {
            hooks
                .dup(hook)
                .map_err(|e| ErrorValue::generic(e.to_string()))?;
            Ok(Value::Stub(hook))
        }
    }
}

// ---------------------------------------------------------------------------
// Reification
// ---------------------------------------------------------------------------

/// Rewrite payload-stub references into their cargo values, duplicating
/// every surviving hook so the result owns its references.
pub(crate) fn reify_value(hooks: &mut HookTable, value: &Value) -> Result<Value, ErrorValue> {
    match value {
        Value::Stub(h) | Value::Promise(h) => {
            let inner = match hooks
                .kind(*h)
                .map_err(|e| ErrorValue::generic(e.to_string()))?
            {
                HookKind::PayloadStub { payload } => Some(payload.value.clone()),
                HookKind::Error(e) | HookKind::Broken(e) => return Err(e.clone()),
                _ => None,
            };
            match inner {
                Some(cargo) => reify_value(hooks, &cargo),
                None => {
                    hooks
                        .dup(*h)
                        .map_err(|e| ErrorValue::generic(e.to_string()))?;
                    Ok(value.clone())
                }
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(reify_value(hooks, item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = std::collections::BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), reify_value(hooks, item)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn reify_payload(
    hooks: &mut HookTable,
    payload: Payload,
    sink: &mut dyn ReleaseSink,
) -> Result<Payload, ErrorValue> {
    let (value, owned) = payload.into_parts();
    let result = reify_value(hooks, &value);
    for hook in owned {
        let _ = hooks.dispose_with(hook, sink);
    }
    result.map(Payload::capture)
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

fn replay_error(e: EvalError) -> ErrorValue {
    match e {
        EvalError::Target(e) => e,
        EvalError::Codec(c) => ErrorValue::generic(c.to_string()),
    }
}

/// Replay a recording against one concrete input.
fn apply_one(
    hooks: &mut HookTable,
    input: Value,
    captures: &[HookId],
    body: &[Expr],
    sink: &mut dyn ReleaseSink,
) -> Result<Payload, ErrorValue> {
    let (last, steps) = match body.split_last() {
        Some(split) => split,
        None => return Err(ErrorValue::generic("empty map recording")),
    };

    let mut replay = Replay {
        variables: vec![payload_to_hook(hooks, Payload::capture(input))],
        captures: captures.to_vec(),
    };

    let mut run = || {
        for instr in steps {
            let payload = evaluate(instr, hooks, &mut replay, sink).map_err(replay_error)?;
            let var = payload_to_hook(hooks, payload);
            replay.variables.push(var);
        }
        let payload = evaluate(last, hooks, &mut replay, sink).map_err(replay_error)?;
        reify_payload(hooks, payload, sink)
    };
    let outcome = run();

    // Deferred disposal: pipelined results may have depended on the
    // intermediates right up to reification.
    for var in replay.variables {
        let _ = hooks.dispose_with(var, sink);
    }
    outcome
}

/// Apply a recorded map to `input`. Arrays are mapped element-wise and
/// reassembled in order; null and undefined pass through unchanged; a
/// pending input is an error. The capture hooks are disposed exactly once
/// when the call completes, success or failure.
pub fn apply_map(
    hooks: &mut HookTable,
    input: Value,
    captures: Vec<HookId>,
    body: &[Expr],
    sink: &mut dyn ReleaseSink,
) -> Result<Payload, ErrorValue> {
    let outcome = match input {
        Value::Pending(p) => Err(ErrorValue::type_error(format!(
            "cannot map over an unresolved payload (pull {p})"
        ))),
        Value::Null => Ok(Payload::plain(Value::Null)),
        Value::Undefined => Ok(Payload::plain(Value::Undefined)),
        Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            let mut owned = Vec::new();
            let mut failure = None;
            for item in items {
                match apply_one(hooks, item, &captures, body, sink) {
                    Ok(payload) => {
                        let (value, mut hooks_of) = payload.into_parts();
                        values.push(value);
                        owned.append(&mut hooks_of);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => {
                    for h in owned {
                        let _ = hooks.dispose_with(h, sink);
                    }
                    Err(e)
                }
                None => Ok(Payload::new(Value::Array(values), owned)),
            }
        }
        other => apply_one(hooks, other, &captures, body, sink),
    };
    for capture in captures {
        let _ = hooks.dispose_with(capture, sink);
    }
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::NullSink;
    use crate::path::{PathPart, PropertyPath};
    use crate::target::{Target, TargetCtx};
    use std::collections::BTreeMap;
    use std::rc::Rc;

    struct Adder;

    impl Target for Adder {
        fn call(
            &self,
            path: &PropertyPath,
            args: Vec<Value>,
            _ctx: &mut TargetCtx<'_>,
        ) -> Result<Value, ErrorValue> {
            match path.0.as_slice() {
                [PathPart::Key(k)] if k == "add1" => match args.as_slice() {
                    [Value::Number(n)] => Ok(Value::Number(n + 1.0)),
                    _ => Err(ErrorValue::type_error("add1 expects one number")),
                },
                _ => Err(ErrorValue::type_error(format!("no method at {path}"))),
            }
        }

        fn get(&self, _path: &PropertyPath, _ctx: &mut TargetCtx<'_>) -> Result<Value, ErrorValue> {
            Ok(Value::Undefined)
        }
    }

    fn adder_hook(hooks: &mut HookTable) -> HookId {
        hooks.insert(HookKind::LocalTarget {
            target: Rc::new(Adder),
            path: PropertyPath::root(),
        })
    }

    /// body of `x => adder.add1(x)`.
    fn add1_body() -> Vec<Expr> {
        vec![
            Expr::Pipeline {
                subject: -1,
                path: PropertyPath::keys(&["add1"]),
                args: Some(vec![Expr::Import(0)]),
            },
            Expr::Import(1),
        ]
    }

    #[test]
    fn scalar_input_applies_once() {
        let mut hooks = HookTable::new();
        let adder = adder_hook(&mut hooks);
        let result = apply_map(&mut hooks, Value::Number(4.0), vec![adder], &add1_body(), &mut NullSink)
            .expect("apply");
        assert_eq!(result.value, Value::Number(5.0));
    }

    #[test]
    fn array_input_maps_per_element_in_order() {
        let mut hooks = HookTable::new();
        let adder = adder_hook(&mut hooks);
        let input = Value::Array(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]);
        let result = apply_map(&mut hooks, input, vec![adder], &add1_body(), &mut NullSink).expect("apply");
        assert_eq!(
            result.value,
            Value::Array(vec![
                Value::Number(2.0),
                Value::Number(3.0),
                Value::Number(3.0),
                Value::Number(4.0),
            ])
        );
    }

    #[test]
    fn null_and_undefined_pass_through() {
        let mut hooks = HookTable::new();
        let result = apply_map(&mut hooks, Value::Null, Vec::new(), &add1_body(), &mut NullSink).expect("null");
        assert_eq!(result.value, Value::Null);
        let result =
            apply_map(&mut hooks, Value::Undefined, Vec::new(), &add1_body(), &mut NullSink)
                .expect("undefined");
        assert_eq!(result.value, Value::Undefined);
    }

    #[test]
    fn pending_input_is_rejected() {
        let mut hooks = HookTable::new();
        let err = apply_map(
            &mut hooks,
            Value::Pending(crate::session::PullId(3)),
            Vec::new(),
            &add1_body(),
            &mut NullSink,
        )
        .expect_err("must fail");
        assert_eq!(err.kind, crate::value::ErrorKind::Type);
    }

    #[test]
    fn identity_recording_returns_input() {
        let mut hooks = HookTable::new();
        let body = vec![Expr::Import(0)];
        let result =
            apply_map(&mut hooks, Value::Number(7.5), Vec::new(), &body, &mut NullSink)
                .expect("apply");
        assert_eq!(result.value, Value::Number(7.5));
    }

    #[test]
    fn property_access_replays_against_objects() {
        let mut hooks = HookTable::new();
        let mut row = BTreeMap::new();
        row.insert("name".to_string(), Value::from("amy"));
        row.insert("age".to_string(), Value::Number(30.0));
        let body = vec![
            Expr::Pipeline {
                subject: 0,
                path: PropertyPath::keys(&["name"]),
                args: None,
            },
            Expr::Import(1),
        ];
        let result =
            apply_map(&mut hooks, Value::Object(row), Vec::new(), &body, &mut NullSink)
                .expect("apply");
        assert_eq!(result.value, Value::from("amy"));
    }

    #[test]
    fn structured_terminator_reassembles_results() {
        let mut hooks = HookTable::new();
        let adder = adder_hook(&mut hooks);
        // x => { plus: adder.add1(x), same: x }
        let body = vec![
            Expr::Pipeline {
                subject: -1,
                path: PropertyPath::keys(&["add1"]),
                args: Some(vec![Expr::Import(0)]),
            },
            Expr::Object(vec![
                ("plus".to_string(), Expr::Import(1)),
                ("same".to_string(), Expr::Import(0)),
            ]),
        ];
        let result =
            apply_map(&mut hooks, Value::Number(9.0), vec![adder], &body, &mut NullSink)
                .expect("apply");
        let mut expected = BTreeMap::new();
        expected.insert("plus".to_string(), Value::Number(10.0));
        expected.insert("same".to_string(), Value::Number(9.0));
        assert_eq!(result.value, Value::Object(expected));
    }

    #[test]
    fn captures_are_disposed_exactly_once_on_success_and_failure() {
        let mut hooks = HookTable::new();

        let adder = adder_hook(&mut hooks);
        apply_map(&mut hooks, Value::Number(1.0), vec![adder], &add1_body(), &mut NullSink)
            .expect("apply");
        assert!(!hooks.is_live(adder));

        let adder = adder_hook(&mut hooks);
        let err = apply_map(&mut hooks, Value::Bool(true), vec![adder], &add1_body(), &mut NullSink)
            .expect_err("add1 of bool");
        assert_eq!(err.kind, crate::value::ErrorKind::Type);
        assert!(!hooks.is_live(adder));
    }

    #[test]
    fn replay_leaves_no_live_hooks_behind() {
        let mut hooks = HookTable::new();
        let adder = adder_hook(&mut hooks);
        let result = apply_map(
            &mut hooks,
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
            vec![adder],
            &add1_body(),
            &mut NullSink,
        )
        .expect("apply");
        result.dispose(&mut hooks, &mut NullSink).expect("dispose");
        assert_eq!(hooks.live_count(), 0);
    }

    #[test]
    fn empty_recording_is_an_error() {
        let mut hooks = HookTable::new();
        let err =
            apply_map(&mut hooks, Value::Number(1.0), Vec::new(), &[], &mut NullSink)
            .expect_err("empty body");
        assert_eq!(err.message, "empty map recording");
    }

    #[test]
    fn export_references_fail_during_replay() {
        let mut hooks = HookTable::new();
        let body = vec![Expr::Export(2)];
        let err =
            apply_map(&mut hooks, Value::Number(1.0), Vec::new(), &body, &mut NullSink)
            .expect_err("export");
        assert!(err.message.contains("not valid during map replay"));
    }

    #[test]
    fn nested_remap_replays_inner_recording() {
        let mut hooks = HookTable::new();
        let adder = adder_hook(&mut hooks);
        // rows => rows.map(row => adder.add1(row))  with rows = input.
        let body = vec![
            Expr::Remap {
                subject: 0,
                path: PropertyPath::root(),
                captures: vec![Expr::Import(-1)],
                body: add1_body(),
            },
            Expr::Import(1),
        ];
        let input = Value::Array(vec![Value::Number(10.0), Value::Number(20.0)]);
        // The outer map applies to a single object holding the array, so
        // wrap it: apply once against the array-valued input directly.
        let result = apply_one(&mut hooks, input, &[adder], &body, &mut NullSink).expect("apply");
        assert_eq!(
            result.value,
            Value::Array(vec![Value::Number(11.0), Value::Number(21.0)])
        );
        let _ = hooks.dispose_with(adder, &mut NullSink);
    }
}
