use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the script host.
///
/// Engine, module, and sandbox failures propagate to the direct caller as
/// one of these variants. Listener and scheduled-callable failures are
/// caught, logged, and never surfaced through this type.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// No evaluator implementation could be bound at engine construction.
    /// Fatal until the embedder provides one; every execution fails fast
    /// with this variant.
    #[error("no script evaluator available")]
    EngineUnavailable,

    /// The evaluator raised while running a script body. Recoverable.
    #[error("script execution failed: {0}")]
    Execution(String),

    /// Sandbox validation rejected the code before execution. The caller
    /// must not retry the same code unmodified.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A sandboxed execution exceeded its wall-clock budget. The underlying
    /// worker may still be running; cancellation is cooperative.
    #[error("script execution exceeded budget of {0:?}")]
    Timeout(Duration),

    /// Module resolution failed: no record registered under this name.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// No function declaration could be located in the supplied source.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// Module dependency resolution revisited an in-progress module. The
    /// payload is the resolution path ending in the repeated name.
    #[error("circular module dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
}

impl ScriptError {
    /// Shorthand for evaluator-raised failures.
    pub fn execution(message: impl Into<String>) -> Self {
        ScriptError::Execution(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = ScriptError::ModuleNotFound("util".into());
        assert_eq!(err.to_string(), "module 'util' not found");

        let err = ScriptError::CircularDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "circular module dependency: a -> b -> a");
    }
}
