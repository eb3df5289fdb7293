//! Graph workflow engine
//!
//! This crate executes workflows expressed as directed graphs in which each
//! vertex is a unit of work and each edge is a typed, conditional,
//! message-carrying dependency:
//! - Per-vertex bounded ring mailboxes with lease-based visibility,
//!   retry bookkeeping, and dead-lettering
//! - A router translating vertex completion/failure into filtered enqueues
//!   on downstream mailboxes
//! - An orchestrator driving one worker per vertex with concurrency gates,
//!   retries, circuit breaking, compensation, and completion detection

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod checkpoint;
pub mod clock;
pub mod concurrency;
pub mod engine;
pub mod error;
pub mod eval;
pub mod events;
pub mod graph;
pub mod instance;
pub mod mailbox;
pub mod message;
pub mod resilience;
pub mod router;
pub mod vertex;

#[cfg(feature = "storage")]
pub use checkpoint::SledCheckpointStore;
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, Snapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{CancelToken, PriorityGate};
pub use engine::{CheckpointPolicy, EngineBuilder, EngineOptions, RunHandle, WorkflowEngine};
pub use error::{WorkflowError, WorkflowResult};
pub use eval::{EvalError, ExpressionEvaluator, SimpleEvaluator};
pub use events::{EventBus, ProgressUpdate, WorkflowEvent};
pub use graph::{
    BranchConfig, ContainerConfig, ContainerMode, EdgeDescriptor, ForeachConfig, Graph,
    GraphCodec, JsonGraphCodec, Priority, SubflowConfig, SwitchConfig, TriggerKind,
    UserTaskConfig, ValidatedGraph, VertexDescriptor, VertexKind, WhileConfig, YamlGraphCodec,
};
pub use instance::{Globals, InstanceStatus, VertexInstance, WorkflowStatus};
pub use message::{Bag, Fault, Message, MessageKind};
pub use resilience::{Backoff, CircuitBreakerPolicy, CircuitState, RetryPolicy};
pub use vertex::{
    DefaultVertexFactory, ExecuteContext, ExecuteOutcome, TaskCall, VertexFactory, VertexImpl,
};
