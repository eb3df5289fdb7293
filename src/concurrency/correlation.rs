//! Correlation tracking
//!
//! Counts live messages per correlation id: incremented when a message
//! enters a mailbox, decremented when its processing finishes (instance
//! terminal, dead-lettered, evicted, or drained). A vertex that emitted a
//! correlated batch can then wait for the transitive message tree to
//! settle; the while-loop uses this to observe body effects between
//! iterations.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::concurrency::CancelToken;

/// Live-message counters keyed by correlation id
#[derive(Default)]
pub struct CorrelationTracker {
    counts: DashMap<Uuid, u64>,
    notify: Notify,
}

impl CorrelationTracker {
    /// Fresh tracker
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A message with this correlation entered a mailbox
    pub fn retain(&self, correlation: Uuid) {
        *self.counts.entry(correlation).or_insert(0) += 1;
    }

    /// A message with this correlation finished its life
    pub fn release(&self, correlation: Uuid) {
        let now_zero = match self.counts.get_mut(&correlation) {
            Some(mut entry) => {
                let value = entry.value_mut();
                *value = value.saturating_sub(1);
                *value == 0
            }
            None => false,
        };
        if now_zero {
            self.counts.remove_if(&correlation, |_, count| *count == 0);
            self.notify.notify_waiters();
        }
    }

    /// Live messages for a correlation
    pub fn live(&self, correlation: Uuid) -> u64 {
        self.counts
            .get(&correlation)
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    /// Wait until no message with this correlation is live; returns false
    /// if cancelled first
    pub async fn settled(&self, correlation: Uuid, cancel: &CancelToken) -> bool {
        loop {
            if self.live(correlation) == 0 {
                return true;
            }
            let notified = self.notify.notified();
            if self.live(correlation) == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }
}
