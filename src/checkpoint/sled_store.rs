//! Durable checkpoint store backed by sled
//!
//! Snapshots are stored as JSON bytes keyed by run id. JSON rather than a
//! compact binary format because snapshots embed free-form bag values.

use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, Snapshot};
use crate::error::{WorkflowError, WorkflowResult};

/// Sled-backed store
pub struct SledCheckpointStore {
    db: sled::Db,
}

impl SledCheckpointStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> WorkflowResult<Self> {
        let db = sled::open(path).map_err(|e| WorkflowError::CheckpointStore {
            reason: format!("open: {}", e),
        })?;
        Ok(Self { db })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> WorkflowResult<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| WorkflowError::CheckpointStore {
                reason: format!("flush: {}", e),
            })
    }
}

#[async_trait]
impl CheckpointStore for SledCheckpointStore {
    async fn save(&self, snapshot: &Snapshot) -> WorkflowResult<()> {
        let bytes = serde_json::to_vec(snapshot).map_err(|e| WorkflowError::CheckpointStore {
            reason: format!("encode: {}", e),
        })?;
        self.db
            .insert(snapshot.run_id.as_bytes(), bytes)
            .map_err(|e| WorkflowError::CheckpointStore {
                reason: format!("insert: {}", e),
            })?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> WorkflowResult<Option<Snapshot>> {
        let value =
            self.db
                .get(run_id.as_bytes())
                .map_err(|e| WorkflowError::CheckpointStore {
                    reason: format!("get: {}", e),
                })?;
        match value {
            Some(bytes) => {
                let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    WorkflowError::CheckpointStore {
                        reason: format!("decode: {}", e),
                    }
                })?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn list_incomplete(&self) -> WorkflowResult<Vec<Uuid>> {
        let mut incomplete = Vec::new();
        for item in self.db.iter() {
            let (_, bytes) = item.map_err(|e| WorkflowError::CheckpointStore {
                reason: format!("scan: {}", e),
            })?;
            let snapshot: Snapshot =
                serde_json::from_slice(&bytes).map_err(|e| WorkflowError::CheckpointStore {
                    reason: format!("decode: {}", e),
                })?;
            if !snapshot.status.is_terminal() {
                incomplete.push(snapshot.run_id);
            }
        }
        Ok(incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::WorkflowStatus;

    #[tokio::test]
    async fn test_sled_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledCheckpointStore::open(dir.path().join("ckpt")).unwrap();

        let snapshot = crate::checkpoint::tests::sample_snapshot(WorkflowStatus::Paused);
        store.save(&snapshot).await.unwrap();
        store.flush().unwrap();

        let loaded = store.load(snapshot.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, snapshot.run_id);
        assert_eq!(loaded.status, WorkflowStatus::Paused);
        assert_eq!(loaded.mailboxes["a"].len(), 1);

        let incomplete = store.list_incomplete().await.unwrap();
        assert_eq!(incomplete, vec![snapshot.run_id]);
    }

    #[tokio::test]
    async fn test_missing_run_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledCheckpointStore::open(dir.path().join("ckpt")).unwrap();
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }
}
