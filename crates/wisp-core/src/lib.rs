/// Core types for the wisp script host
///
/// This crate provides the foundational types shared by the engine, event
/// bus, and scheduler crates: the tagged `Value` that crosses the
/// script/host boundary, the `ScriptError` taxonomy, the evaluator seam,
/// cooperative cancellation, and the bounded worker pool.
pub mod cancel;
pub mod error;
pub mod evaluator;
pub mod pool;
pub mod value;

pub use cancel::CancelFlag;
pub use error::ScriptError;
pub use evaluator::{EvalOutcome, EvalRequest, Evaluator};
pub use pool::WorkerPool;
pub use value::{HostFunction, OpaqueValue, Value};
