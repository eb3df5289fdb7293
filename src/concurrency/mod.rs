//! Cancellation and admission-control primitives

mod cancel;
mod correlation;
mod gate;

pub use cancel::CancelToken;
pub use correlation::CorrelationTracker;
pub use gate::{GatePermit, PriorityGate};
