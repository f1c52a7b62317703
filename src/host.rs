use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info};

use wisp_core::{ScriptError, Value};
use wisp_events::{EventBus, ListenerId};
use wisp_scheduler::{Scheduler, TaskId};
use wisp_scripting_host::{ModuleLoader, SandboxPolicy, ScriptEngine};

use crate::config::HostConfig;

/// The assembled script host: engine, sandbox, module loader, event bus,
/// and scheduler wired together, with the script-facing host functions
/// (`require`, `on`, `emit`, `set_timeout`, ...) installed into the
/// engine's registry.
///
/// Embedders register their own host functions through
/// [`ScriptHost::engine`] before any scripts run, publish host-side
/// occurrences through [`ScriptHost::events`], and defer host-side work
/// through [`ScriptHost::scheduler`].
pub struct ScriptHost {
    engine: Arc<ScriptEngine>,
    sandbox: SandboxPolicy,
    modules: Arc<ModuleLoader>,
    events: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    shutdown_grace: Duration,
}

impl ScriptHost {
    pub fn new(config: HostConfig) -> anyhow::Result<Self> {
        let engine = Arc::new(ScriptEngine::new());
        Self::with_engine(engine, config)
    }

    /// Assemble around an existing engine (e.g. one with a custom
    /// evaluator).
    pub fn with_engine(engine: Arc<ScriptEngine>, config: HostConfig) -> anyhow::Result<Self> {
        let modules = Arc::new(ModuleLoader::new(Arc::clone(&engine)));
        let events =
            Arc::new(EventBus::new(config.event_workers).context("Failed to create event bus")?);
        let scheduler = Arc::new(
            Scheduler::new(config.scheduler_workers).context("Failed to create scheduler")?,
        );

        let host = Self {
            engine,
            sandbox: config.sandbox.to_policy(),
            modules,
            events,
            scheduler,
            shutdown_grace: config.shutdown_grace(),
        };
        host.install_bindings();
        info!(target: "scripting", "Script host assembled (engine available: {})", host.engine.is_available());
        Ok(host)
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn modules(&self) -> &Arc<ModuleLoader> {
        &self.modules
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn sandbox(&self) -> &SandboxPolicy {
        &self.sandbox
    }

    /// Execute trusted code directly on the engine.
    pub fn execute(&self, code: &str) -> Result<Value, ScriptError> {
        self.engine.execute(code)
    }

    /// Execute untrusted code through the sandbox policy, with its
    /// wall-clock timeout enforced on a worker thread.
    pub fn execute_sandboxed(&self, code: &str) -> Result<Value, ScriptError> {
        self.sandbox.execute_with_timeout(&self.engine, code)
    }

    /// Drain both worker pools within the configured grace period, then
    /// force-stop them.
    pub fn shutdown(&self) {
        debug!(target: "scripting", "Shutting down script host");
        self.scheduler.shutdown(self.shutdown_grace);
        self.events.shutdown(self.shutdown_grace);
    }

    /// Install the script-facing bindings. Deferred and event-triggered
    /// script work is stored as source text and re-executed through the
    /// engine when due: evaluation contexts are single-use, so script
    /// closures cannot outlive the call that created them.
    ///
    /// The closures hold weak references back to the host's services; the
    /// strong edges all point away from the engine, so dropping the host
    /// tears everything down.
    fn install_bindings(&self) {
        self.install_require();
        self.install_event_bindings();
        self.install_timer_bindings();
        self.install_log();
    }

    fn install_require(&self) {
        let modules = Arc::downgrade(&self.modules);
        self.engine.register_function(
            "require",
            Arc::new(move |args| {
                let modules = upgrade(&modules, "require")?;
                let name = arg_string(args, 0, "require", "module name")?;
                modules.load(&name)
            }),
        );
    }

    fn install_event_bindings(&self) {
        let events = Arc::downgrade(&self.events);
        let engine = Arc::downgrade(&self.engine);
        self.engine.register_function(
            "on",
            Arc::new(move |args| {
                let events = upgrade(&events, "on")?;
                let engine = upgrade(&engine, "on")?;
                let event_name = arg_string(args, 0, "on", "event name")?;
                let source = arg_string(args, 1, "on", "handler source")?;

                // The listener owns the engine: the bus may outlive the
                // registration call by a long way.
                let id = events.add_listener(
                    &event_name,
                    Arc::new(move |event| {
                        let mut vars = HashMap::new();
                        vars.insert("event".to_string(), event_to_value(event));
                        engine
                            .execute_with_vars(&source, vars)
                            .map(|_| ())
                            .map_err(anyhow::Error::from)
                    }),
                );
                Ok(Value::Number(id.raw() as f64))
            }),
        );

        let events = Arc::downgrade(&self.events);
        self.engine.register_function(
            "off",
            Arc::new(move |args| {
                let events = upgrade(&events, "off")?;
                let event_name = arg_string(args, 0, "off", "event name")?;
                let id = arg_number(args, 1, "off", "listener id")?;
                let removed =
                    events.remove_listener(&event_name, ListenerId::from_raw(id as u64));
                Ok(Value::Bool(removed))
            }),
        );

        for (binding, mode) in [
            ("emit", EmitMode::Sync),
            ("emit_async", EmitMode::Async),
            ("emit_wait", EmitMode::Wait),
        ] {
            let events = Arc::downgrade(&self.events);
            self.engine.register_function(
                binding,
                Arc::new(move |args| {
                    let events = upgrade(&events, binding)?;
                    let event_name = arg_string(args, 0, binding, "event name")?;
                    let payload = args[1..].to_vec();
                    match mode {
                        EmitMode::Sync => events.emit(&event_name, payload),
                        EmitMode::Async => events.emit_async(&event_name, payload),
                        EmitMode::Wait => events.emit_wait(&event_name, payload),
                    }
                    Ok(Value::Null)
                }),
            );
        }

        let events = Arc::downgrade(&self.events);
        self.engine.register_function(
            "set_metadata",
            Arc::new(move |args| {
                let events = upgrade(&events, "set_metadata")?;
                let key = arg_string(args, 0, "set_metadata", "key")?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                events.set_metadata(key, value);
                Ok(Value::Null)
            }),
        );
    }

    fn install_timer_bindings(&self) {
        for (binding, repeating) in [("set_timeout", false), ("set_interval", true)] {
            let scheduler = Arc::downgrade(&self.scheduler);
            let engine = Arc::downgrade(&self.engine);
            self.engine.register_function(
                binding,
                Arc::new(move |args| {
                    let scheduler = upgrade(&scheduler, binding)?;
                    let engine = upgrade(&engine, binding)?;
                    let source = arg_string(args, 0, binding, "source")?;
                    let millis = arg_number(args, 1, binding, "delay in milliseconds")?;
                    if !millis.is_finite() || millis < 0.0 {
                        return Err(ScriptError::execution(format!(
                            "{binding}: delay must be a non-negative number"
                        )));
                    }

                    let callable: wisp_scheduler::TaskFn = Arc::new(move || {
                        if let Err(e) = engine.execute(&source) {
                            error!(target: "scheduler", "Deferred script failed: {e}");
                        }
                    });

                    let delay = Duration::from_millis(millis as u64);
                    let id = if repeating {
                        scheduler.schedule_repeating(callable, delay)
                    } else {
                        scheduler.schedule_once(callable, delay)
                    };
                    Ok(Value::Number(id.raw() as f64))
                }),
            );
        }

        let scheduler = Arc::downgrade(&self.scheduler);
        self.engine.register_function(
            "clear_timer",
            Arc::new(move |args| {
                let scheduler = upgrade(&scheduler, "clear_timer")?;
                let id = arg_number(args, 0, "clear_timer", "task id")?;
                Ok(Value::Bool(scheduler.cancel(TaskId::from_raw(id as u64))))
            }),
        );
    }

    fn install_log(&self) {
        self.engine.register_function(
            "log",
            Arc::new(|args| {
                let level = arg_string(args, 0, "log", "level")?;
                let message = args
                    .get(1)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                match level.as_str() {
                    "debug" => debug!(target: "script", "{message}"),
                    "warn" => tracing::warn!(target: "script", "{message}"),
                    "error" => error!(target: "script", "{message}"),
                    _ => info!(target: "script", "{message}"),
                }
                Ok(Value::Null)
            }),
        );
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
    }
}

#[derive(Clone, Copy)]
enum EmitMode {
    Sync,
    Async,
    Wait,
}

fn upgrade<T>(weak: &Weak<T>, binding: &str) -> Result<Arc<T>, ScriptError> {
    weak.upgrade()
        .ok_or_else(|| ScriptError::execution(format!("{binding}: script host is shut down")))
}

/// Render an event for a script handler: name, ordered args, metadata.
fn event_to_value(event: &wisp_events::Event) -> Value {
    let mut rendered = HashMap::new();
    rendered.insert("name".to_string(), Value::String(event.name.clone()));
    rendered.insert("args".to_string(), Value::Sequence(event.args.clone()));
    rendered.insert(
        "metadata".to_string(),
        Value::Mapping(event.metadata.clone()),
    );
    Value::Mapping(rendered)
}

fn arg_string(
    args: &[Value],
    index: usize,
    binding: &str,
    what: &str,
) -> Result<String, ScriptError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => Err(ScriptError::execution(format!(
            "{binding}: expected {what} as argument {index}, got {}",
            other.map_or("nothing", Value::kind)
        ))),
    }
}

fn arg_number(
    args: &[Value],
    index: usize,
    binding: &str,
    what: &str,
) -> Result<f64, ScriptError> {
    match args.get(index) {
        Some(Value::Number(n)) => Ok(*n),
        other => Err(ScriptError::execution(format!(
            "{binding}: expected {what} as argument {index}, got {}",
            other.map_or("nothing", Value::kind)
        ))),
    }
}
