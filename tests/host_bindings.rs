//! End-to-end tests over the assembled host: scripts drive the module
//! loader, event bus, and scheduler through the installed bindings.
#![cfg(feature = "lua")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wisp::{HostConfig, ScriptError, ScriptHost, Value};

fn host() -> ScriptHost {
    ScriptHost::new(HostConfig::default()).unwrap()
}

/// Register a host function that records every argument it ever sees.
fn install_recorder(host: &ScriptHost, name: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_fn = Arc::clone(&seen);
    host.engine().register_function(
        name,
        Arc::new(move |args| {
            seen_in_fn.lock().unwrap().extend(args.iter().cloned());
            Ok(Value::Null)
        }),
    );
    seen
}

#[test]
fn embedder_host_function_called_from_script() {
    let host = host();
    let seen = install_recorder(&host, "record");

    let result = host
        .execute(r#"record(1, "two", true, nil)"#)
        .unwrap();
    assert_eq!(result, Value::Null);

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            Value::Number(1.0),
            Value::from("two"),
            Value::Bool(true),
            Value::Null
        ]
    );
}

#[test]
fn require_loads_registered_module_once() {
    let host = host();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_fn = Arc::clone(&calls);
    host.engine().register_function(
        "bump",
        Arc::new(move |_| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );

    host.modules()
        .register("greeter", "bump()\nexports.greeting = 'hello'", &[]);

    let first = host
        .execute("local m = require('greeter')\nreturn m.greeting")
        .unwrap();
    let second = host
        .execute("local m = require('greeter')\nreturn m.greeting")
        .unwrap();

    assert_eq!(first, Value::from("hello"));
    assert_eq!(second, Value::from("hello"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn require_unknown_module_raises_in_script() {
    let host = host();
    let err = host.execute("require('ghost')").unwrap_err();
    let ScriptError::Execution(message) = err else {
        panic!("expected execution error");
    };
    assert!(message.contains("ghost"), "got: {message}");
}

#[test]
fn script_listener_receives_emitted_event() {
    let host = host();
    let seen = install_recorder(&host, "record");

    host.execute(r#"on("player_joined", "record(event.name, event.args[1])")"#)
        .unwrap();

    host.events()
        .emit("player_joined", vec![Value::from("alice")]);

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![Value::from("player_joined"), Value::from("alice")]);
}

#[test]
fn script_emit_reaches_script_listener() {
    let host = host();
    let seen = install_recorder(&host, "record");

    host.execute(r#"on("ping", "record(event.args[1])")"#)
        .unwrap();
    host.execute(r#"emit("ping", 99)"#).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Value::Number(99.0)]);
}

#[test]
fn off_removes_script_listener() {
    let host = host();
    let seen = install_recorder(&host, "record");

    let id = host
        .execute(r#"return on("tick", "record(1)")"#)
        .unwrap();
    let removed = host
        .execute(&format!(r#"return off("tick", {id})"#))
        .unwrap();
    assert_eq!(removed, Value::Bool(true));

    host.events().emit("tick", vec![]);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn metadata_rides_along_with_events() {
    let host = host();
    let seen = install_recorder(&host, "record");

    host.execute(r#"set_metadata("server", "alpha")"#).unwrap();
    host.execute(r#"on("x", "record(event.metadata.server)")"#)
        .unwrap();
    host.events().emit("x", vec![]);

    assert_eq!(*seen.lock().unwrap(), vec![Value::from("alpha")]);
}

#[test]
fn set_timeout_runs_deferred_script() {
    let host = host();
    let seen = install_recorder(&host, "record");

    host.execute(r#"set_timeout("record('fired')", 30)"#).unwrap();
    assert!(seen.lock().unwrap().is_empty());

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*seen.lock().unwrap(), vec![Value::from("fired")]);
}

#[test]
fn clear_timer_prevents_deferred_script() {
    let host = host();
    let seen = install_recorder(&host, "record");

    let id = host
        .execute(r#"return set_timeout("record('fired')", 100)"#)
        .unwrap();
    let cancelled = host
        .execute(&format!("return clear_timer({id})"))
        .unwrap();
    assert_eq!(cancelled, Value::Bool(true));

    std::thread::sleep(Duration::from_millis(300));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn set_interval_repeats_until_cleared() {
    let host = host();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_fn = Arc::clone(&calls);
    host.engine().register_function(
        "bump",
        Arc::new(move |_| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );

    let id = host
        .execute(r#"return set_interval("bump()", 40)"#)
        .unwrap();

    std::thread::sleep(Duration::from_millis(400));
    let fired = calls.load(Ordering::SeqCst);
    assert!(fired >= 2, "expected at least 2 interval fires, got {fired}");

    host.execute(&format!("return clear_timer({id})")).unwrap();
}

#[test]
fn sandboxed_execution_allows_clean_code() {
    let host = host();
    assert_eq!(
        host.execute_sandboxed("return 6 * 7").unwrap(),
        Value::Number(42.0)
    );
}

#[test]
fn sandboxed_execution_rejects_file_access() {
    let host = host();
    let err = host
        .execute_sandboxed(r#"io.open("/etc/passwd")"#)
        .unwrap_err();
    assert!(matches!(err, ScriptError::SecurityViolation(_)));
}

#[test]
fn sandboxed_execution_rejects_scheduling() {
    let host = host();
    let err = host
        .execute_sandboxed(r#"set_timeout("x = 1", 10)"#)
        .unwrap_err();
    assert!(matches!(err, ScriptError::SecurityViolation(_)));
}

#[test]
fn sandboxed_infinite_loop_times_out() {
    let mut config = HostConfig::default();
    config.sandbox.timeout_ms = 50;
    let host = ScriptHost::new(config).unwrap();

    let err = host.execute_sandboxed("while true do end").unwrap_err();
    assert!(matches!(err, ScriptError::Timeout(_)));
}

#[test]
fn globals_survive_across_executions() {
    let host = host();
    host.engine().set_global("world_name", Value::from("midgard"));

    assert_eq!(
        host.execute("return world_name").unwrap(),
        Value::from("midgard")
    );

    // Per-call variables shadow, but don't overwrite, the global.
    let mut vars = std::collections::HashMap::new();
    vars.insert("world_name".to_string(), Value::from("asgard"));
    assert_eq!(
        host.engine()
            .execute_with_vars("return world_name", vars)
            .unwrap(),
        Value::from("asgard")
    );
    assert_eq!(
        host.execute("return world_name").unwrap(),
        Value::from("midgard")
    );
}

#[test]
fn call_named_and_heuristic_call() {
    let host = host();
    let source = "function double(n) return n * 2 end";

    assert_eq!(
        host.engine()
            .call_named(source, "double", &[Value::Number(21.0)])
            .unwrap(),
        Value::Number(42.0)
    );
    assert_eq!(
        host.engine()
            .call_function(source, &[Value::Number(5.0)])
            .unwrap(),
        Value::Number(10.0)
    );
}

#[test]
fn shutdown_quiesces_pools() {
    let host = host();
    let seen = install_recorder(&host, "record");

    host.execute(r#"set_timeout("record('late')", 5000)"#).unwrap();
    host.shutdown();

    std::thread::sleep(Duration::from_millis(100));
    assert!(seen.lock().unwrap().is_empty());
    assert!(host.scheduler().active_tasks().is_empty());
}
