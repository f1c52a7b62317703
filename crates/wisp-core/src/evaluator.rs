use std::collections::HashMap;

use crate::cancel::CancelFlag;
use crate::error::ScriptError;
use crate::value::{HostFunction, Value};

/// One evaluation request, assembled by the engine from a single-use
/// evaluation context.
///
/// `bindings` are the variables visible to the script (globals snapshot
/// with caller variables already shadowing them). `functions` are the host
/// functions bound for this call. `capture` names bindings whose
/// post-execution values the caller wants back (the module loader reads
/// `exports` this way).
pub struct EvalRequest<'a> {
    pub code: &'a str,
    /// Chunk name for error messages and logs.
    pub name: &'a str,
    pub bindings: &'a [(String, Value)],
    pub functions: &'a [(String, HostFunction)],
    pub capture: &'a [String],
    pub cancel: CancelFlag,
}

/// Result of one evaluation: the script's value plus any captured bindings.
#[derive(Debug)]
pub struct EvalOutcome {
    pub value: Value,
    pub captured: HashMap<String, Value>,
}

/// The opaque component that actually parses and runs script source.
///
/// The host treats this as a black box: it owes no language semantics, only
/// the calling convention of `EvalRequest`/`EvalOutcome`. Implementations
/// must honor the cancel flag at some bounded interval, and must convert
/// values at the boundary per the `Value` contract (numbers to f64,
/// array-likes to sequences, object-likes to mappings, opaque handles
/// passed through untouched).
pub trait Evaluator: Send + Sync {
    /// Short identifier used in logs and the engine's preference walk.
    fn name(&self) -> &'static str;

    fn eval(&self, request: EvalRequest<'_>) -> Result<EvalOutcome, ScriptError>;
}
