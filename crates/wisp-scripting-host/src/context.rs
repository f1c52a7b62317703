use wisp_core::{CancelFlag, EvalRequest, HostFunction, Value};

/// Everything one evaluation sees, assembled fresh per top-level execution
/// call and discarded afterwards. Never reused, never shared across
/// threads.
///
/// Bindings carry the engine's global snapshot with the caller's variables
/// already layered on top (variables shadow same-named globals for this
/// call only). Functions are the registry snapshot taken at build time.
pub struct EvalContext {
    name: String,
    bindings: Vec<(String, Value)>,
    functions: Vec<(String, HostFunction)>,
    capture: Vec<String>,
    cancel: CancelFlag,
}

impl EvalContext {
    pub(crate) fn new(
        name: impl Into<String>,
        bindings: Vec<(String, Value)>,
        functions: Vec<(String, HostFunction)>,
    ) -> Self {
        Self {
            name: name.into(),
            bindings,
            functions,
            capture: Vec::new(),
            cancel: CancelFlag::new(),
        }
    }

    pub(crate) fn with_capture(mut self, names: &[&str]) -> Self {
        self.capture = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub(crate) fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Borrow this context as an evaluator request for `code`.
    pub(crate) fn request<'a>(&'a self, code: &'a str) -> EvalRequest<'a> {
        EvalRequest {
            code,
            name: &self.name,
            bindings: &self.bindings,
            functions: &self.functions,
            capture: &self.capture,
            cancel: self.cancel.clone(),
        }
    }
}
