/// Embeddable script host
///
/// Lets a hosting application execute untrusted or semi-trusted script
/// snippets against a controlled set of native capabilities, organize
/// scripts into dependency-ordered modules, dispatch named events to
/// script-registered listeners, and schedule delayed or periodic
/// script-triggered work.
///
/// The usual entry point is [`ScriptHost`], which assembles the engine,
/// sandbox, module loader, event bus, and scheduler and installs the
/// script-facing bindings (`require`, `on`, `emit`, `set_timeout`, ...).
/// The individual pieces are also usable on their own through the
/// re-exported crates.
pub mod config;
pub mod host;
pub mod logging;

pub use config::{HostConfig, SandboxConfig};
pub use host::ScriptHost;
pub use logging::init_logging;

// Re-export the building blocks for embedders that assemble their own.
pub use wisp_core::{
    CancelFlag, EvalOutcome, EvalRequest, Evaluator, HostFunction, OpaqueValue, ScriptError,
    Value, WorkerPool,
};
pub use wisp_events::{Event, EventBus, Listener, ListenerId};
pub use wisp_scheduler::{Scheduler, TaskFn, TaskId, TaskKind};
pub use wisp_scripting_host::{
    FunctionRegistry, ModuleLoader, SandboxPolicy, SandboxPolicyBuilder, ScriptEngine,
};

#[cfg(feature = "lua")]
pub use wisp_scripting_host::LuaEvaluator;
