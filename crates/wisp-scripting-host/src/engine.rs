use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info};
use wisp_core::{CancelFlag, Evaluator, HostFunction, ScriptError, Value};

use crate::context::EvalContext;
use crate::registry::FunctionRegistry;

/// Evaluator names tried at construction, in order. The first one that
/// binds wins; when none binds the engine stays constructible but every
/// execution fails fast with `EngineUnavailable`.
const EVALUATOR_PREFERENCE: &[&str] = &["lua"];

/// The execution engine: owns the host-function registry and the global
/// variable bag, builds a single-use evaluation context per call, and
/// delegates the actual run to the bound evaluator.
///
/// This is an explicit object, not a process-wide singleton; construct as
/// many isolated engines as you need and pass them by `Arc`.
pub struct ScriptEngine {
    evaluator: Option<Arc<dyn Evaluator>>,
    registry: FunctionRegistry,
    globals: RwLock<HashMap<String, Value>>,
}

impl ScriptEngine {
    /// Bind to the first available evaluator in the fixed preference
    /// order. The check happens once, here; it is not retried per call.
    pub fn new() -> Self {
        let evaluator = Self::bind_evaluator();
        match &evaluator {
            Some(evaluator) => {
                info!(target: "scripting", "Script engine bound to '{}' evaluator", evaluator.name());
            }
            None => {
                error!(
                    target: "scripting",
                    "No script evaluator available (tried: {}); executions will fail",
                    EVALUATOR_PREFERENCE.join(", ")
                );
            }
        }

        Self::with_evaluator(evaluator)
    }

    /// Build an engine around an explicit evaluator, or around none at all.
    /// Intended for embedders that bring their own evaluator and for tests
    /// that need a deliberately unavailable engine.
    pub fn with_evaluator(evaluator: Option<Arc<dyn Evaluator>>) -> Self {
        Self {
            evaluator,
            registry: FunctionRegistry::new(),
            globals: RwLock::new(HashMap::new()),
        }
    }

    fn bind_evaluator() -> Option<Arc<dyn Evaluator>> {
        for name in EVALUATOR_PREFERENCE {
            if let Some(evaluator) = Self::builtin_evaluator(name) {
                return Some(evaluator);
            }
            debug!(target: "scripting", "Evaluator '{name}' not available");
        }
        None
    }

    #[cfg(feature = "lua")]
    fn builtin_evaluator(name: &str) -> Option<Arc<dyn Evaluator>> {
        match name {
            "lua" => Some(Arc::new(crate::lua::LuaEvaluator::new())),
            _ => None,
        }
    }

    #[cfg(not(feature = "lua"))]
    fn builtin_evaluator(_name: &str) -> Option<Arc<dyn Evaluator>> {
        None
    }

    /// Whether an evaluator was bound at construction.
    pub fn is_available(&self) -> bool {
        self.evaluator.is_some()
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Install a host function, overwriting any previous one of that name.
    pub fn register_function(&self, name: impl Into<String>, callable: HostFunction) {
        self.registry.register(name, callable);
    }

    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        self.globals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Execute a script body and convert its result to a host value.
    pub fn execute(&self, code: &str) -> Result<Value, ScriptError> {
        self.execute_with_vars(code, HashMap::new())
    }

    /// Execute with caller-supplied variables. Variables shadow same-named
    /// globals for this call only; the global bag is untouched.
    pub fn execute_with_vars(
        &self,
        code: &str,
        vars: HashMap<String, Value>,
    ) -> Result<Value, ScriptError> {
        let context = self.build_context(vars);
        Ok(self.run(&context, code)?.value)
    }

    /// Execute with a cancellation token the caller can trip from another
    /// thread. Cancellation is cooperative: the evaluator aborts at its
    /// next checkpoint.
    pub fn execute_cancellable(
        &self,
        code: &str,
        vars: HashMap<String, Value>,
        cancel: CancelFlag,
    ) -> Result<Value, ScriptError> {
        let context = self.build_context(vars).with_cancel(cancel);
        Ok(self.run(&context, code)?.value)
    }

    /// Execute and read back the post-execution values of the named
    /// bindings. The module loader harvests `exports` / `module` this way.
    pub fn execute_capturing(
        &self,
        code: &str,
        vars: HashMap<String, Value>,
        capture: &[&str],
    ) -> Result<(Value, HashMap<String, Value>), ScriptError> {
        let context = self.build_context(vars).with_capture(capture);
        let outcome = self.run(&context, code)?;
        Ok((outcome.value, outcome.captured))
    }

    /// Execute a snippet expected to define a function named `name`, then
    /// invoke that function with `args`. This is the explicit-name calling
    /// path; prefer it over [`ScriptEngine::call_function`].
    pub fn call_named(
        &self,
        source: &str,
        name: &str,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        if !is_identifier(name) {
            return Err(ScriptError::FunctionNotFound(name.to_string()));
        }

        let mut vars = HashMap::new();
        let mut arg_names = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let arg_name = format!("__wisp_arg_{index}");
            vars.insert(arg_name.clone(), arg.clone());
            arg_names.push(arg_name);
        }

        let code = format!("{source}\nreturn {name}({})", arg_names.join(", "));
        self.execute_with_vars(&code, vars)
    }

    /// Heuristic convenience over [`ScriptEngine::call_named`]: extract the
    /// declared function name from the source with a best-effort lexical
    /// scan (not a parse) and invoke it. Fails with `FunctionNotFound` when
    /// no declaration pattern matches.
    pub fn call_function(&self, source: &str, args: &[Value]) -> Result<Value, ScriptError> {
        let name = extract_function_name(source).ok_or_else(|| {
            ScriptError::FunctionNotFound("no function declaration in source".to_string())
        })?;
        self.call_named(source, &name, args)
    }

    fn build_context(&self, vars: HashMap<String, Value>) -> EvalContext {
        // Globals snapshot first, caller variables layered on top.
        let mut bindings: Vec<(String, Value)> = self
            .globals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in vars {
            match bindings.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = value,
                None => bindings.push((name, value)),
            }
        }

        EvalContext::new("chunk", bindings, self.registry.snapshot())
    }

    fn run(
        &self,
        context: &EvalContext,
        code: &str,
    ) -> Result<wisp_core::EvalOutcome, ScriptError> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or(ScriptError::EngineUnavailable)?;
        evaluator.eval(context.request(code))
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Best-effort lexical scan for a `function <name>` declaration. Skips
/// anonymous functions and keeps scanning; returns the first named
/// declaration found. Deliberately not a parse.
fn extract_function_name(source: &str) -> Option<String> {
    let bytes = source.as_bytes();
    let mut search_from = 0;

    while let Some(found) = source[search_from..].find("function") {
        let start = search_from + found;
        let end = start + "function".len();
        search_from = end;

        // Word boundaries on both sides, so "my_function_x" doesn't match.
        if start > 0 {
            let before = bytes[start - 1] as char;
            if before.is_ascii_alphanumeric() || before == '_' {
                continue;
            }
        }
        let rest = &source[end..];
        if rest
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            continue;
        }

        let rest = rest.trim_start();
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            return Some(name);
        }
        // Anonymous (`function(...)`) — keep looking.
    }

    None
}
