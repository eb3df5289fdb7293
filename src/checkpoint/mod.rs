//! Checkpoint snapshots and the store seam
//!
//! The engine emits snapshots and consumes them on resume; the store owns
//! durability. Any store that round-trips the snapshot fields losslessly
//! satisfies the contract.

mod memory;
#[cfg(feature = "storage")]
mod sled_store;

pub use memory::MemoryCheckpointStore;
#[cfg(feature = "storage")]
pub use sled_store::SledCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::WorkflowResult;
use crate::instance::{VertexInstance, WorkflowStatus};
use crate::mailbox::Envelope;
use crate::message::Bag;
use crate::resilience::BreakerSnapshot;

/// A structured capture of one run's recoverable state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Run id
    pub run_id: Uuid,
    /// Graph id this run executes
    pub graph_id: String,
    /// Workflow status at capture time
    pub status: WorkflowStatus,
    /// Global variable bag
    pub globals: Bag,
    /// Envelope contents per vertex mailbox
    pub mailboxes: HashMap<String, Vec<Envelope>>,
    /// Vertex instances created so far
    pub instances: Vec<VertexInstance>,
    /// Circuit-breaker states keyed on vertex kind
    pub breakers: HashMap<String, BreakerSnapshot>,
    /// Retries consumed against the per-run budget
    pub retries_used: u32,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

/// Durability seam for snapshots
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one for the run
    async fn save(&self, snapshot: &Snapshot) -> WorkflowResult<()>;
    /// Load the latest snapshot for a run
    async fn load(&self, run_id: Uuid) -> WorkflowResult<Option<Snapshot>>;
    /// Runs whose last snapshot is not terminal
    async fn list_incomplete(&self) -> WorkflowResult<Vec<Uuid>>;
}
