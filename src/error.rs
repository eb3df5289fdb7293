//! Error types for the workflow engine
//!
//! All engine operations return [`WorkflowResult`]. Vertex execution faults
//! propagate between vertices as router-delivered Fail messages carrying a
//! [`crate::message::Fault`] descriptor; `WorkflowError` is the
//! language-level surface for callers of the engine API.

use thiserror::Error;

use crate::message::Fault;

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error conditions raised by the workflow engine
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Structural defect found during graph validation; fatal before start
    #[error("graph validation failed: {reason}")]
    Validation {
        /// What the validator rejected
        reason: String,
    },

    /// A vertex factory rejected its descriptor
    #[error("vertex '{vertex_id}' rejected its configuration: {reason}")]
    VertexInit {
        /// Offending vertex id
        vertex_id: String,
        /// Why initialization failed
        reason: String,
    },

    /// Expression evaluation failed
    #[error("expression evaluation failed: {0}")]
    Evaluation(#[from] crate::eval::EvalError),

    /// A vertex execution exceeded its per-call timeout
    #[error("execution timed out after {timeout_ms} ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// The circuit breaker for a vertex kind is open and no fallback exists
    #[error("circuit breaker open for vertex kind '{kind}'")]
    CircuitOpen {
        /// Vertex kind discriminator
        kind: String,
    },

    /// Cancellation observed; a verdict, not a defect
    #[error("operation cancelled")]
    Cancelled,

    /// A user task failed with a classified fault
    #[error("task fault [{}]: {}", .fault.kind, .fault.message)]
    Task {
        /// The fault as routed downstream
        fault: Fault,
    },

    /// Subflow nesting exceeded the configured limit
    #[error("maximum recursion depth exceeded (depth {depth})")]
    RecursionDepthExceeded {
        /// Depth at which the limit tripped
        depth: u32,
    },

    /// The checkpoint store failed to persist or load a snapshot
    #[error("checkpoint store failure: {reason}")]
    CheckpointStore {
        /// Underlying store failure
        reason: String,
    },

    /// A graph codec could not encode or decode a definition
    #[error("graph codec failure: {reason}")]
    Codec {
        /// Underlying codec failure
        reason: String,
    },

    /// Pause requested but the run forbids it
    #[error("pause is not allowed for this run")]
    PauseNotAllowed,

    /// The run is not in a state that permits the requested control action
    #[error("invalid control transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Internal defect; indicates an engine bug rather than a user error
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for WorkflowError {
    /// User task handlers may bubble arbitrary errors; they classify as
    /// internal unless wrapped in a [`WorkflowError::Task`] fault
    fn from(error: anyhow::Error) -> Self {
        WorkflowError::Internal(format!("{:#}", error))
    }
}

impl WorkflowError {
    /// Fault-kind discriminator used by retry classification
    pub fn fault_kind(&self) -> &str {
        match self {
            WorkflowError::Validation { .. } => "validation",
            WorkflowError::VertexInit { .. } => "vertex-init",
            WorkflowError::Evaluation(_) => "evaluation",
            WorkflowError::Timeout { .. } => "timeout",
            WorkflowError::CircuitOpen { .. } => "circuit-open",
            WorkflowError::Cancelled => "cancelled",
            WorkflowError::Task { fault } => &fault.kind,
            WorkflowError::RecursionDepthExceeded { .. } => "recursion-depth",
            WorkflowError::CheckpointStore { .. } => "checkpoint-store",
            WorkflowError::Codec { .. } => "codec",
            WorkflowError::PauseNotAllowed => "pause-not-allowed",
            WorkflowError::InvalidTransition { .. } => "invalid-transition",
            WorkflowError::Internal(_) => "internal",
        }
    }

    /// Convert into the wire-level fault descriptor routed to downstream vertices
    pub fn to_fault(&self) -> Fault {
        match self {
            WorkflowError::Task { fault } => fault.clone(),
            other => Fault {
                kind: other.fault_kind().to_string(),
                message: other.to_string(),
            },
        }
    }
}
