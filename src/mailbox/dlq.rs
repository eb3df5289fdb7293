//! Shared dead-letter queue
//!
//! Append-only sink for messages that exhausted retries, were displaced
//! under saturation, or whose edge guards failed to evaluate. Bounded:
//! the oldest entries fall off when full.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::message::Message;

/// One dead-lettered record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry id
    pub id: Uuid,
    /// Vertex whose mailbox or edge produced the entry
    pub vertex_id: String,
    /// Classification: "retries-exhausted", "evicted",
    /// "capacity-exhausted", "guard-eval-failed", ...
    pub reason: String,
    /// Free-form detail (the underlying fault or guard error)
    pub detail: Option<String>,
    /// The message, when one existed
    pub message: Option<Message>,
    /// Retry count at dead-letter time
    pub retry_count: u32,
    /// When the entry was recorded
    pub created_at: DateTime<Utc>,
}

/// Bounded dead-letter queue shared by every mailbox of a run
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    max_size: usize,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    /// Queue holding at most `max_size` entries
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            clock,
        }
    }

    /// Record an entry, dropping the oldest when full
    pub fn record(
        &self,
        vertex_id: &str,
        reason: &str,
        detail: Option<String>,
        message: Option<Message>,
        retry_count: u32,
    ) -> Uuid {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            vertex_id: vertex_id.to_string(),
            reason: reason.to_string(),
            detail,
            message,
            retry_count,
            created_at: self.clock.now(),
        };
        let id = entry.id;
        tracing::debug!(vertex_id, reason, "dead-lettered message");
        let mut entries = self.entries.lock();
        while entries.len() >= self.max_size {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// All entries, oldest first
    pub fn list(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entries matching a reason
    pub fn with_reason(&self, reason: &str) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.reason == reason)
            .cloned()
            .collect()
    }

    /// Entry count
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
