//! End-to-end protocol scenarios over an in-memory loopback pair.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{json, Value as Json};

use weft_rpc::path::PathPart;
use weft_rpc::{
    ErrorValue, HookId, MapMisuse, PropertyPath, RpcError, Session, SessionConfig, Target,
    TargetCtx, Value,
};

// ---------------------------------------------------------------------------
// Test targets
// ---------------------------------------------------------------------------

struct Counter {
    total: Cell<f64>,
}

impl Target for Counter {
    fn call(
        &self,
        path: &PropertyPath,
        args: Vec<Value>,
        _ctx: &mut TargetCtx<'_>,
    ) -> Result<Value, ErrorValue> {
        match path.0.as_slice() {
            [PathPart::Key(k)] if k == "increment" => match args.as_slice() {
                [Value::Number(n)] => {
                    self.total.set(self.total.get() + n);
                    Ok(Value::Number(self.total.get()))
                }
                _ => Err(ErrorValue::type_error("increment expects one number")),
            },
            _ => Err(ErrorValue::type_error(format!("no method at {path}"))),
        }
    }

    fn get(&self, path: &PropertyPath, _ctx: &mut TargetCtx<'_>) -> Result<Value, ErrorValue> {
        match path.0.as_slice() {
            [PathPart::Key(k)] if k == "value" => Ok(Value::Number(self.total.get())),
            _ => Ok(Value::Undefined),
        }
    }
}

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

struct TestHost;

/// The demo series served by `generateFibonacci`.
const SERIES: [f64; 8] = [1.0, 2.0, 2.0, 3.0, 4.0, 6.0, 9.0, 14.0];

impl Target for TestHost {
    fn call(
        &self,
        path: &PropertyPath,
        args: Vec<Value>,
        ctx: &mut TargetCtx<'_>,
    ) -> Result<Value, ErrorValue> {
        match path.0.as_slice() {
            [PathPart::Key(k)] if k == "makeCounter" => match args.as_slice() {
                [Value::Number(start)] => Ok(ctx.export(Rc::new(Counter {
                    total: Cell::new(*start),
                }))),
                _ => Err(ErrorValue::type_error("makeCounter expects one number")),
            },
            [PathPart::Key(k)] if k == "generateFibonacci" => match args.as_slice() {
                [Value::Number(count)] if *count >= 0.0 && *count <= SERIES.len() as f64 => {
                    Ok(Value::Array(
                        SERIES[..*count as usize].iter().copied().map(Value::Number).collect(),
                    ))
                }
                _ => Err(ErrorValue::type_error("generateFibonacci expects a count")),
            },
            [PathPart::Key(k)] if k == "echo" => {
                let value = args.into_iter().next().unwrap_or(Value::Undefined);
                ctx.retain(&value)?;
                Ok(value)
            }
            _ => Err(ErrorValue::type_error(format!("no method at {path}"))),
        }
    }

    fn get(&self, path: &PropertyPath, ctx: &mut TargetCtx<'_>) -> Result<Value, ErrorValue> {
        match path.0.as_slice() {
            [PathPart::Key(k)] if k == "foo" => Ok(Value::Number(42.0)),
            [PathPart::Key(k)] if k == "adder" => Ok(ctx.export(Rc::new(Adder))),
            _ => Ok(Value::Undefined),
        }
    }
}

struct UserTarget;

impl Target for UserTarget {
    fn call(
        &self,
        _path: &PropertyPath,
        _args: Vec<Value>,
        _ctx: &mut TargetCtx<'_>,
    ) -> Result<Value, ErrorValue> {
        Ok(Value::Undefined)
    }

    fn get(&self, _path: &PropertyPath, _ctx: &mut TargetCtx<'_>) -> Result<Value, ErrorValue> {
        Ok(Value::Undefined)
    }
}

// ---------------------------------------------------------------------------
// Loopback helpers
// ---------------------------------------------------------------------------

fn pair() -> (Session, Session) {
    let client = Session::new(None, SessionConfig::default());
    let server = Session::new(Some(Rc::new(TestHost)), SessionConfig::default());
    (client, server)
}

fn pump(a: &mut Session, b: &mut Session) {
    loop {
        let mut moved = false;
        for bytes in a.outgoing() {
            b.handle_message(&bytes).expect("b dispatch");
            moved = true;
        }
        for bytes in b.outgoing() {
            a.handle_message(&bytes).expect("a dispatch");
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

fn parse_frames(frames: &[Vec<u8>]) -> Vec<Json> {
    frames
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).expect("frame json"))
        .collect()
}

fn pull_ok(client: &mut Session, server: &mut Session, hook: HookId) -> Value {
    let pid = client.pull(hook).expect("pull");
    pump(client, server);
    let mut ready = client.take_ready();
    assert_eq!(ready.len(), 1, "one completion expected");
    let (got, result) = ready.remove(0);
    assert_eq!(got, pid);
    result.expect("resolution").value
}

fn keys(parts: &[&str]) -> PropertyPath {
    PropertyPath::keys(parts)
}

// ---------------------------------------------------------------------------
// Scenario 1: property pull
// ---------------------------------------------------------------------------

#[test]
fn scenario_property_pull_with_exact_frames() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let foo = client.get(root, keys(&["foo"])).expect("get");
    let pid = client.pull(foo).expect("pull");

    let outbound = client.outgoing();
    assert_eq!(
        parse_frames(&outbound),
        vec![
            json!(["push", 1, ["pipeline", 0, ["foo"]]]),
            json!(["pull", 1]),
        ]
    );
    for bytes in &outbound {
        server.handle_message(bytes).expect("server dispatch");
    }

    let answers = server.outgoing();
    assert_eq!(parse_frames(&answers), vec![json!(["resolve", 1, 42.0])]);
    for bytes in &answers {
        client.handle_message(bytes).expect("client dispatch");
    }

    let mut ready = client.take_ready();
    let (got, result) = ready.remove(0);
    assert_eq!(got, pid);
    assert_eq!(result.expect("value").value, Value::Number(42.0));

    // The only trailing traffic is the slot release.
    let trailing = parse_frames(&client.outgoing());
    assert_eq!(trailing, vec![json!(["release", 1, 1])]);
}

// ---------------------------------------------------------------------------
// Scenario 2: promise pipelining
// ---------------------------------------------------------------------------

#[test]
fn scenario_pipelined_counter_with_exact_frames() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");

    let counter = client
        .call(root, keys(&["makeCounter"]), &[Value::Number(4.0)])
        .expect("makeCounter");
    let result = client
        .call(counter, keys(&["increment"]), &[Value::Number(3.0)])
        .expect("increment");
    let pid = client.pull(result).expect("pull");

    let outbound = client.outgoing();
    assert_eq!(
        parse_frames(&outbound),
        vec![
            json!(["push", 1, ["pipeline", 0, ["makeCounter"], [4.0]]]),
            json!(["push", 2, ["pipeline", 1, ["increment"], [3.0]]]),
            json!(["pull", 2]),
        ]
    );
    for bytes in &outbound {
        server.handle_message(bytes).expect("server dispatch");
    }

    let answers = server.outgoing();
    assert_eq!(parse_frames(&answers), vec![json!(["resolve", 2, 7.0])]);
    for bytes in &answers {
        client.handle_message(bytes).expect("client dispatch");
    }

    let mut ready = client.take_ready();
    let (got, result) = ready.remove(0);
    assert_eq!(got, pid);
    assert_eq!(result.expect("value").value, Value::Number(7.0));
}

#[test]
fn pipelined_calls_share_state_in_order() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let counter = client
        .call(root, keys(&["makeCounter"]), &[Value::Number(0.0)])
        .expect("makeCounter");
    let first = client
        .call(counter, keys(&["increment"]), &[Value::Number(1.0)])
        .expect("first");
    let second = client
        .call(counter, keys(&["increment"]), &[Value::Number(10.0)])
        .expect("second");

    assert_eq!(pull_ok(&mut client, &mut server, first), Value::Number(1.0));
    assert_eq!(
        pull_ok(&mut client, &mut server, second),
        Value::Number(11.0)
    );
}

// ---------------------------------------------------------------------------
// Scenario 3: map over a remote array
// ---------------------------------------------------------------------------

#[test]
fn scenario_map_adds_one_to_each_element() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let adder = client.get(root, keys(&["adder"])).expect("adder");
    let fib = client
        .call(root, keys(&["generateFibonacci"]), &[Value::Number(8.0)])
        .expect("generateFibonacci");

    let mapped = client
        .send_map(fib, PropertyPath::root(), |rec, x| {
            let bumped = rec.call(adder, PropertyPath::keys(&["add1"]), &[Value::Promise(x)])?;
            Ok(Value::Promise(bumped))
        })
        .expect("send_map");

    let value = pull_ok(&mut client, &mut server, mapped);
    assert_eq!(
        value,
        Value::Array(vec![
            Value::Number(2.0),
            Value::Number(3.0),
            Value::Number(3.0),
            Value::Number(4.0),
            Value::Number(5.0),
            Value::Number(7.0),
            Value::Number(10.0),
            Value::Number(15.0),
        ])
    );
}

#[test]
fn map_input_series_is_served_exactly() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let fib = client
        .call(root, keys(&["generateFibonacci"]), &[Value::Number(8.0)])
        .expect("generateFibonacci");
    assert_eq!(
        pull_ok(&mut client, &mut server, fib),
        Value::Array(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(2.0),
            Value::Number(3.0),
            Value::Number(4.0),
            Value::Number(6.0),
            Value::Number(9.0),
            Value::Number(14.0),
        ])
    );
}

// ---------------------------------------------------------------------------
// Scenario 4: forbidden keys are dropped at the receiver
// ---------------------------------------------------------------------------

#[test]
fn scenario_forbidden_key_is_dropped_from_resolution() {
    let mut client = Session::new(None, SessionConfig::default());
    let root = client.bootstrap().expect("bootstrap");
    let result = client.call(root, keys(&["anything"]), &[]).expect("call");
    let _ = client.outgoing();

    client
        .handle_message(br#"["resolve", 1, {"__proto__": {"x": 1}, "y": 2}]"#)
        .expect("resolve dispatch");

    let pid = client.pull(result).expect("pull");
    let mut ready = client.take_ready();
    let (got, outcome) = ready.remove(0);
    assert_eq!(got, pid);
    let mut expected = BTreeMap::new();
    expected.insert("y".to_string(), Value::Number(2.0));
    assert_eq!(outcome.expect("value").value, Value::Object(expected));
}

// ---------------------------------------------------------------------------
// Scenario 5: asynchronous callback misuse
// ---------------------------------------------------------------------------

#[test]
fn scenario_async_callback_fails_synchronously_and_is_silenced() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let fib = client
        .call(root, keys(&["generateFibonacci"]), &[Value::Number(4.0)])
        .expect("generateFibonacci");
    let pending = client.pull(fib).expect("pull");

    let err = client
        .send_map(fib, PropertyPath::root(), |_rec, _x| {
            Ok(Value::Pending(pending))
        })
        .expect_err("async misuse");
    assert!(matches!(
        err,
        RpcError::MapMisuse(MapMisuse::AsyncCallback)
    ));
    assert_eq!(err.to_string(), "map callbacks cannot be asynchronous");

    // The pending pull's eventual completion is consumed quietly.
    pump(&mut client, &mut server);
    assert!(client.take_ready().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 6: local-target misuse
// ---------------------------------------------------------------------------

#[test]
fn scenario_local_target_inside_mapper_fails() {
    let (mut client, _server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let fib = client
        .call(root, keys(&["generateFibonacci"]), &[Value::Number(4.0)])
        .expect("generateFibonacci");
    let local = client.adopt(Rc::new(UserTarget));

    let err = client
        .send_map(fib, PropertyPath::root(), |rec, x| {
            let used = rec.call(x, PropertyPath::keys(&["use"]), &[Value::Stub(local)])?;
            Ok(Value::Promise(used))
        })
        .expect_err("local target misuse");
    assert!(matches!(
        err,
        RpcError::MapMisuse(MapMisuse::LocalCapability)
    ));
    assert_eq!(
        err.to_string(),
        "cannot construct a local target inside a mapper"
    );
}

// ---------------------------------------------------------------------------
// Bidirectional capabilities
// ---------------------------------------------------------------------------

#[test]
fn client_capability_survives_echo_round_trip() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let local = client.adopt(Rc::new(Adder));

    let echoed = client
        .call(root, keys(&["echo"]), &[Value::Stub(local)])
        .expect("echo");
    let value = pull_ok(&mut client, &mut server, echoed);
    // The capability came back as a reference to our own export.
    match value {
        Value::Stub(h) | Value::Promise(h) => {
            let result = client
                .call(h, keys(&["add1"]), &[Value::Number(4.0)])
                .expect("call through echoed capability");
            assert_eq!(
                pull_ok(&mut client, &mut server, result),
                Value::Number(5.0)
            );
        }
        other => panic!("expected capability, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn dispose_before_resolution_discards_the_answer() {
    let (mut client, mut server) = pair();
    let root = client.bootstrap().expect("bootstrap");
    let result = client
        .call(root, keys(&["echo"]), &[Value::Number(1.0)])
        .expect("call");

    // Ship the push, then drop interest before the answer arrives.
    for bytes in client.outgoing() {
        server.handle_message(&bytes).expect("server dispatch");
    }
    let pid = client.pull(result).expect("pull");
    client.dispose(result).expect("dispose");

    pump(&mut client, &mut server);
    let ready = client.take_ready();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0, pid);
    assert!(ready[0].1.is_err(), "cancelled pull surfaces an error");
    // Both peers are still healthy.
    let foo = client.get(root, keys(&["foo"])).expect("get");
    assert_eq!(pull_ok(&mut client, &mut server, foo), Value::Number(42.0));
}
