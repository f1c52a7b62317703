use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use wisp_core::{CancelFlag, ScriptError, Value};

use crate::engine::ScriptEngine;

/// Constructs rejected no matter what the capability flags say: dynamic
/// chunk loading, dynamic function construction, and deferred-callback
/// scheduling primitives.
const ALWAYS_DENIED: &[&str] = &[
    "load(",
    "loadstring",
    "loadfile",
    "dofile",
    "setfenv",
    "set_timeout",
    "set_interval",
];

/// Filesystem access patterns, rejected unless `allow_file_access`.
const FILE_DENIED: &[&str] = &[
    "io.open",
    "io.read",
    "io.write",
    "io.lines",
    "io.input",
    "io.output",
    "os.remove",
    "os.rename",
    "os.tmpname",
];

/// Network access patterns, rejected unless `allow_network_access`.
const NETWORK_DENIED: &[&str] = &[
    "socket",
    "http://",
    "https://",
    "http.",
    "net.",
    "fetch(",
    "connect(",
];

/// Process/spawn patterns, rejected unless `allow_process_access`.
const PROCESS_DENIED: &[&str] = &[
    "os.execute",
    "os.exit",
    "io.popen",
    "spawn",
    "subprocess",
    "fork(",
];

/// Capability policy wrapped around the engine for untrusted input.
///
/// Validation is purely syntactic: substring matching over the raw code
/// text, before execution. A match anywhere rejects — including matches
/// inside string literals or comments. That coarseness is deliberate; the
/// goal is "reject anything suspicious", not "perfectly parse intent", and
/// an auditable list of fixed patterns is worth the false positives.
///
/// Immutable after construction; build one with [`SandboxPolicy::builder`].
pub struct SandboxPolicy {
    allow_file_access: bool,
    allow_network_access: bool,
    allow_process_access: bool,
    allowed_globals: HashMap<String, Value>,
    timeout: Duration,
}

impl SandboxPolicy {
    pub fn builder() -> SandboxPolicyBuilder {
        SandboxPolicyBuilder::default()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check `code` against the denylists. Returns the first violation.
    pub fn validate(&self, code: &str) -> Result<(), ScriptError> {
        for pattern in ALWAYS_DENIED {
            if code.contains(pattern) {
                return Err(ScriptError::SecurityViolation(format!(
                    "forbidden construct '{pattern}'"
                )));
            }
        }

        let gated: [(&[&str], bool, &str); 3] = [
            (FILE_DENIED, self.allow_file_access, "file access"),
            (NETWORK_DENIED, self.allow_network_access, "network access"),
            (PROCESS_DENIED, self.allow_process_access, "process access"),
        ];
        for (patterns, allowed, what) in gated {
            if allowed {
                continue;
            }
            for pattern in patterns {
                if code.contains(pattern) {
                    return Err(ScriptError::SecurityViolation(format!(
                        "{what} is not permitted: '{pattern}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate, then execute on the calling thread with the policy's
    /// allowed globals bound.
    pub fn execute(&self, engine: &ScriptEngine, code: &str) -> Result<Value, ScriptError> {
        self.validate(code)?;
        debug!(target: "scripting", "Sandbox validation passed ({} bytes)", code.len());
        engine.execute_with_vars(code, self.allowed_globals.clone())
    }

    /// Validate, then execute on a detached worker thread while the caller
    /// blocks up to the policy timeout.
    ///
    /// On elapse the worker is asked to stop via its cancel flag and the
    /// caller gets `Timeout` immediately. Cancellation is cooperative: the
    /// evaluator aborts at its next instruction-hook checkpoint, so the
    /// worker may briefly outlive the timeout report.
    pub fn execute_with_timeout(
        &self,
        engine: &Arc<ScriptEngine>,
        code: &str,
    ) -> Result<Value, ScriptError> {
        self.validate(code)?;

        let cancel = CancelFlag::new();
        let (tx, rx) = mpsc::channel();

        let worker_engine = Arc::clone(engine);
        let worker_cancel = cancel.clone();
        let worker_code = code.to_string();
        let worker_vars = self.allowed_globals.clone();
        std::thread::spawn(move || {
            let result = worker_engine.execute_cancellable(&worker_code, worker_vars, worker_cancel);
            // Receiver may be gone if the caller already timed out.
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.cancel();
                warn!(
                    target: "scripting",
                    "Sandboxed execution exceeded {:?}, cancellation requested",
                    self.timeout
                );
                Err(ScriptError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ScriptError::execution(
                "sandbox worker exited without a result",
            )),
        }
    }
}

/// Builder for [`SandboxPolicy`]. All capabilities default to denied, the
/// timeout to five seconds.
pub struct SandboxPolicyBuilder {
    allow_file_access: bool,
    allow_network_access: bool,
    allow_process_access: bool,
    allowed_globals: HashMap<String, Value>,
    timeout: Duration,
}

impl Default for SandboxPolicyBuilder {
    fn default() -> Self {
        Self {
            allow_file_access: false,
            allow_network_access: false,
            allow_process_access: false,
            allowed_globals: HashMap::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl SandboxPolicyBuilder {
    pub fn allow_file_access(mut self, allow: bool) -> Self {
        self.allow_file_access = allow;
        self
    }

    pub fn allow_network_access(mut self, allow: bool) -> Self {
        self.allow_network_access = allow;
        self
    }

    pub fn allow_process_access(mut self, allow: bool) -> Self {
        self.allow_process_access = allow;
        self
    }

    /// Bind a value under `name` for every sandboxed execution.
    pub fn allowed_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.allowed_globals.insert(name.into(), value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> SandboxPolicy {
        SandboxPolicy {
            allow_file_access: self.allow_file_access,
            allow_network_access: self.allow_network_access,
            allow_process_access: self.allow_process_access,
            allowed_globals: self.allowed_globals,
            timeout: self.timeout,
        }
    }
}
