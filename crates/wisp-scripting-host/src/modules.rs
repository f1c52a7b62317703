use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, ThreadId};

use tracing::{debug, info};
use wisp_core::{ScriptError, Value};

use crate::engine::ScriptEngine;

/// A registered module: source body plus declared dependencies, in order.
#[derive(Debug, Clone)]
struct ModuleRecord {
    source: String,
    dependencies: Vec<String>,
}

/// Resolves named modules with declared dependency lists into cached
/// export values, executing each module body through the engine exactly
/// once per loader lifetime.
///
/// Resolution is depth-first, left-to-right, and blocks the caller for the
/// whole subtree. Cycles are detected with an explicit visit stack and
/// reported as `CircularDependency` carrying the resolution path — a
/// value, not a stack overflow.
pub struct ModuleLoader {
    engine: Arc<ScriptEngine>,
    records: RwLock<HashMap<String, ModuleRecord>>,
    cache: RwLock<HashMap<String, Value>>,
    /// Modules whose body is currently executing, keyed to the executing
    /// thread. Serializes concurrent first-loads of the same module and
    /// catches cycles entered through a dynamic `require` from inside a
    /// module body (which starts a fresh visit stack).
    in_flight: Mutex<HashMap<String, ThreadId>>,
    in_flight_done: Condvar,
}

impl ModuleLoader {
    pub fn new(engine: Arc<ScriptEngine>) -> Self {
        Self {
            engine,
            records: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            in_flight_done: Condvar::new(),
        }
    }

    /// Register a module body under `name`. Dependencies are validated at
    /// load time, not here; registering with a dangling dependency is
    /// legal until someone loads it.
    pub fn register(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
        dependencies: &[&str],
    ) {
        let name = name.into();
        debug!(target: "scripting", "Registering module: {name}");
        self.records.write().unwrap_or_else(|e| e.into_inner()).insert(
            name,
            ModuleRecord {
                source: source.into(),
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            },
        );
    }

    /// Load a module, executing its body (and its dependency subtree) on
    /// first request and returning the cached export afterwards.
    pub fn load(&self, name: &str) -> Result<Value, ScriptError> {
        let mut path = Vec::new();
        self.load_inner(name, &mut path)
    }

    /// Drop the cached export for `name`, so the next load re-executes the
    /// body. The registration itself stays.
    pub fn unload(&self, name: &str) -> bool {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Drop every cached export.
    pub fn unload_all(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn registered_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn load_inner(&self, name: &str, path: &mut Vec<String>) -> Result<Value, ScriptError> {
        if let Some(cached) = self.cached(name) {
            return Ok(cached);
        }

        if path.iter().any(|visited| visited == name) {
            let mut cycle = path.clone();
            cycle.push(name.to_string());
            return Err(ScriptError::CircularDependency(cycle));
        }

        self.claim(name, path)?;
        path.push(name.to_string());
        let result = self.resolve_and_execute(name, path);
        path.pop();
        self.release(name, result.as_ref().ok());

        result
    }

    /// Mark `name` as in flight for this thread, waiting out any other
    /// thread already executing it. Re-entry by the same thread means a
    /// dynamic require cycled back into a body still on this thread's
    /// stack.
    fn claim(&self, name: &str, path: &[String]) -> Result<(), ScriptError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match in_flight.get(name) {
                None => {
                    in_flight.insert(name.to_string(), thread::current().id());
                    return Ok(());
                }
                Some(owner) if *owner == thread::current().id() => {
                    let mut cycle = path.to_vec();
                    cycle.push(name.to_string());
                    return Err(ScriptError::CircularDependency(cycle));
                }
                Some(_) => {
                    in_flight = self
                        .in_flight_done
                        .wait(in_flight)
                        .unwrap_or_else(|e| e.into_inner());
                    // The other thread finished; if it succeeded the cache
                    // has the export now and claim() turns into a no-op
                    // for our caller's cache re-check.
                    if self
                        .cache
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .contains_key(name)
                    {
                        in_flight.insert(name.to_string(), thread::current().id());
                        return Ok(());
                    }
                }
            }
        }
    }

    fn release(&self, name: &str, export: Option<&Value>) {
        if let Some(export) = export {
            self.cache
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), export.clone());
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.in_flight_done.notify_all();
    }

    fn resolve_and_execute(&self, name: &str, path: &mut Vec<String>) -> Result<Value, ScriptError> {
        // Another thread may have finished the load while we waited.
        if let Some(cached) = self.cached(name) {
            return Ok(cached);
        }

        let record = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::ModuleNotFound(name.to_string()))?;

        // Depth-first, left-to-right dependency resolution.
        let mut vars = HashMap::new();
        for dependency in &record.dependencies {
            let export = self.load_inner(dependency, path)?;
            vars.insert(dependency.clone(), export);
        }

        // Conventional bindings the body populates.
        vars.insert("exports".to_string(), Value::Mapping(HashMap::new()));
        let mut module = HashMap::new();
        module.insert("exports".to_string(), Value::Mapping(HashMap::new()));
        vars.insert("module".to_string(), Value::Mapping(module));

        debug!(target: "scripting", "Executing module body: {name}");
        let (_, captured) =
            self.engine
                .execute_capturing(&record.source, vars, &["exports", "module"])?;

        let export = resolve_export(&captured);
        info!(target: "scripting", "Module loaded: {name}");
        Ok(export)
    }

    fn cached(&self, name: &str) -> Option<Value> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// Prefer `exports`; fall back to `module.exports` when `exports` was left
/// an empty mapping.
fn resolve_export(captured: &HashMap<String, Value>) -> Value {
    let exports = captured.get("exports").cloned().unwrap_or(Value::Null);
    let exports_is_empty = match &exports {
        Value::Mapping(entries) => entries.is_empty(),
        Value::Null => true,
        _ => false,
    };
    if !exports_is_empty {
        return exports;
    }

    if let Some(Value::Mapping(module)) = captured.get("module") {
        if let Some(module_exports) = module.get("exports") {
            if !matches!(module_exports, Value::Null) {
                return module_exports.clone();
            }
        }
    }

    exports
}
