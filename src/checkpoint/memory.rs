//! In-memory checkpoint store, for tests and single-process embedding

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, Snapshot};
use crate::error::WorkflowResult;

/// Non-durable store keeping snapshots in a map
#[derive(Default)]
pub struct MemoryCheckpointStore {
    snapshots: DashMap<Uuid, Snapshot>,
}

impl MemoryCheckpointStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, snapshot: &Snapshot) -> WorkflowResult<()> {
        self.snapshots.insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> WorkflowResult<Option<Snapshot>> {
        Ok(self.snapshots.get(&run_id).map(|entry| entry.clone()))
    }

    async fn list_incomplete(&self) -> WorkflowResult<Vec<Uuid>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| *entry.key())
            .collect())
    }
}
