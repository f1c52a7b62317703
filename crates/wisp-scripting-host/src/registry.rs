use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;
use wisp_core::{HostFunction, ScriptError, Value};

/// Name-to-callable registry consulted when a script calls an identifier
/// the evaluator does not know.
///
/// Registration is idempotent overwrite-by-name: the last writer wins.
/// Callers never need external synchronization; the interior lock is the
/// whole story.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, HostFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a callable under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, callable: HostFunction) {
        let name = name.into();
        debug!(target: "scripting", "Registering host function: {name}");
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, callable);
    }

    /// Remove a callable. Returns false if nothing was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<HostFunction> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Invoke a registered callable directly from the host side.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
        let callable = self
            .get(name)
            .ok_or_else(|| ScriptError::FunctionNotFound(name.to_string()))?;
        callable(args)
    }

    /// Snapshot of the current registrations, sorted by name for
    /// deterministic binding. This is what an evaluation context binds; a
    /// registration made after the snapshot is invisible to that call.
    pub fn snapshot(&self) -> Vec<(String, HostFunction)> {
        let mut entries: Vec<(String, HostFunction)> = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, f)| (name.clone(), f.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|(name, _)| name).collect()
    }

    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn constant(value: Value) -> HostFunction {
        Arc::new(move |_args| Ok(value.clone()))
    }

    #[test]
    fn register_and_call() {
        let registry = FunctionRegistry::new();
        registry.register("answer", constant(Value::Number(42.0)));

        assert_eq!(registry.call("answer", &[]).unwrap(), Value::Number(42.0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn last_writer_wins() {
        let registry = FunctionRegistry::new();
        registry.register("f", constant(Value::Number(1.0)));
        registry.register("f", constant(Value::Number(2.0)));

        assert_eq!(registry.call("f", &[]).unwrap(), Value::Number(2.0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn call_unknown_fails_typed() {
        let registry = FunctionRegistry::new();
        let err = registry.call("missing", &[]).unwrap_err();
        assert!(matches!(err, ScriptError::FunctionNotFound(name) if name == "missing"));
    }

    #[test]
    fn snapshot_is_stable_and_detached() {
        let registry = FunctionRegistry::new();
        registry.register("b", constant(Value::Null));
        registry.register("a", constant(Value::Null));

        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        // Later registrations don't show up in the old snapshot
        registry.register("c", constant(Value::Null));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn unregister() {
        let registry = FunctionRegistry::new();
        registry.register("f", constant(Value::Null));
        assert!(registry.unregister("f"));
        assert!(!registry.unregister("f"));
        assert!(registry.is_empty());
    }
}
