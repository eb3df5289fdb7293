//! Bounded ring mailbox with lease-based visibility
//!
//! Invariants:
//! - at most one valid lease per envelope at any instant
//! - envelopes with `visible_after` in the future are invisible to leasing
//! - once the retry count exceeds the policy cap, the envelope moves to the
//!   dead-letter queue atomically with removal from the ring
//! - Leased envelopes are never evicted under saturation
//!
//! Envelope state transitions happen in one atomic step under the ring
//! lock, checked against the expected prior state; stale lease ids are
//! no-ops. No lock is held across user callbacks.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::Clock;
use crate::concurrency::{CancelToken, CorrelationTracker};
use crate::mailbox::dlq::DeadLetterQueue;
use crate::mailbox::envelope::{Envelope, EnvelopeStatus, LeaseId};
use crate::message::Message;
use crate::resilience::RetryPolicy;

/// Outcome of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Stored in a free slot
    Accepted {
        /// Sequence assigned to the new envelope
        seq: u64,
    },
    /// Stored after displacing the oldest Ready envelope
    AcceptedEvicted {
        /// Sequence assigned to the new envelope
        seq: u64,
        /// Sequence of the displaced envelope
        evicted_seq: u64,
    },
    /// Every slot held a lease; the incoming message dead-lettered
    DeadLettered,
}

/// Outcome of a requeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueResult {
    /// Back to Ready with a backoff-delayed visibility
    Requeued {
        /// When the envelope becomes visible again
        visible_after: DateTime<Utc>,
    },
    /// Retry count exceeded the policy; moved to the dead-letter queue
    DeadLettered,
    /// The lease id no longer names a leased envelope
    Stale,
}

/// A worker's claim on one envelope
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    /// Lease id for acknowledge/requeue
    pub lease_id: LeaseId,
    /// Sequence of the leased envelope
    pub seq: u64,
    /// Retry count observed at lease time
    pub retry_count: u32,
    /// Copy of the enclosed message
    pub message: Message,
}

struct Ring {
    slots: VecDeque<Envelope>,
    next_seq: u64,
}

/// Per-vertex bounded message store
pub struct Mailbox {
    vertex_id: String,
    capacity: usize,
    visibility_timeout: Duration,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    dlq: Arc<DeadLetterQueue>,
    tracker: Arc<CorrelationTracker>,
    inner: Mutex<Ring>,
    notify: Notify,
}

/// Upper bound on one blind wait; keeps a lost wakeup from hanging a worker
const WAIT_SLICE: Duration = Duration::from_millis(100);

impl Mailbox {
    /// Create a mailbox for one vertex
    pub fn new(
        vertex_id: impl Into<String>,
        capacity: usize,
        visibility_timeout: Duration,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        dlq: Arc<DeadLetterQueue>,
        tracker: Arc<CorrelationTracker>,
    ) -> Self {
        Self {
            vertex_id: vertex_id.into(),
            capacity: capacity.max(1),
            visibility_timeout,
            retry,
            clock,
            dlq,
            tracker,
            inner: Mutex::new(Ring {
                slots: VecDeque::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Vertex this mailbox feeds
    pub fn vertex_id(&self) -> &str {
        &self.vertex_id
    }

    /// Envelopes currently Ready or Leased
    pub fn pending(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Place a message; never blocks. Under saturation the oldest Ready
    /// envelope is displaced (newest wins); Leased envelopes survive.
    pub fn enqueue(&self, message: Message) -> EnqueueResult {
        let now = self.clock.now();
        let result = {
            let mut ring = self.inner.lock();
            if ring.slots.len() >= self.capacity {
                match ring
                    .slots
                    .iter()
                    .position(|e| e.status == EnvelopeStatus::Ready)
                {
                    Some(pos) => {
                        let mut evicted = match ring.slots.remove(pos) {
                            Some(envelope) => envelope,
                            None => {
                                return EnqueueResult::DeadLettered;
                            }
                        };
                        evicted.status = EnvelopeStatus::Superseded;
                        let evicted_seq = evicted.seq;
                        let correlation = evicted.message.correlation;
                        self.dlq.record(
                            &self.vertex_id,
                            "evicted",
                            None,
                            Some(evicted.message),
                            evicted.retry_count,
                        );
                        self.tracker.release(correlation);
                        let seq = ring.next_seq;
                        ring.next_seq += 1;
                        ring.slots.push_back(Envelope::new(message, seq, now));
                        EnqueueResult::AcceptedEvicted { seq, evicted_seq }
                    }
                    None => {
                        let correlation = message.correlation;
                        self.dlq.record(
                            &self.vertex_id,
                            "capacity-exhausted",
                            None,
                            Some(message),
                            0,
                        );
                        self.tracker.release(correlation);
                        EnqueueResult::DeadLettered
                    }
                }
            } else {
                let seq = ring.next_seq;
                ring.next_seq += 1;
                ring.slots.push_back(Envelope::new(message, seq, now));
                EnqueueResult::Accepted { seq }
            }
        };
        self.notify.notify_one();
        result
    }

    /// Lease the oldest visible Ready envelope, waiting up to `timeout`
    /// (`None` = forever). Expired leases are reclaimed on every call.
    /// Returns `None` on timeout or cancellation.
    pub async fn lease(
        &self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Option<LeaseHandle> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let (handle, next_visible) = self.try_lease();
            if handle.is_some() {
                return handle;
            }

            let now = tokio::time::Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return None;
                }
            }
            let mut wait = WAIT_SLICE;
            if let Some(visible_in) = next_visible {
                wait = wait.min(visible_in);
            }
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }

            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// One non-blocking lease pass: reclaim expired leases, then claim the
    /// oldest visible Ready envelope. Also reports how long until the next
    /// envelope becomes visible, for wait scheduling.
    fn try_lease(&self) -> (Option<LeaseHandle>, Option<Duration>) {
        let now = self.clock.now();
        let mut ring = self.inner.lock();
        self.reclaim_expired(&mut ring, now);

        let candidate = ring
            .slots
            .iter_mut()
            .filter(|e| e.leasable(now))
            .min_by_key(|e| e.seq);
        if let Some(envelope) = candidate {
            let lease_id = Uuid::new_v4();
            envelope.status = EnvelopeStatus::Leased;
            envelope.lease = Some(lease_id);
            envelope.lease_expiry = Some(now + chrono_ms(self.visibility_timeout));
            return (
                Some(LeaseHandle {
                    lease_id,
                    seq: envelope.seq,
                    retry_count: envelope.retry_count,
                    message: envelope.message.clone(),
                }),
                None,
            );
        }

        // Nothing visible; compute the earliest instant something could be
        let next = ring
            .slots
            .iter()
            .filter_map(|e| match e.status {
                EnvelopeStatus::Ready => Some(e.visible_after),
                EnvelopeStatus::Leased => e.lease_expiry,
                _ => None,
            })
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        (None, next)
    }

    /// Reset expired leases to Ready, or dead-letter them when the reclaim
    /// pushes the retry count past the policy cap
    fn reclaim_expired(&self, ring: &mut Ring, now: DateTime<Utc>) {
        let max_attempts = self.retry.max_attempts;
        let vertex_id = &self.vertex_id;
        let dlq = &self.dlq;
        let tracker = &self.tracker;
        ring.slots.retain_mut(|envelope| {
            let expired = envelope.status == EnvelopeStatus::Leased
                && envelope.lease_expiry.map_or(false, |at| at <= now);
            if !expired {
                return true;
            }
            envelope.retry_count += 1;
            if envelope.retry_count > max_attempts {
                envelope.status = EnvelopeStatus::Superseded;
                tracing::warn!(
                    vertex_id = %vertex_id,
                    seq = envelope.seq,
                    "expired lease exhausted retries"
                );
                dlq.record(
                    vertex_id,
                    "retries-exhausted",
                    Some("lease expired".to_string()),
                    Some(envelope.message.clone()),
                    envelope.retry_count,
                );
                tracker.release(envelope.message.correlation);
                return false;
            }
            envelope.status = EnvelopeStatus::Ready;
            envelope.lease = None;
            envelope.lease_expiry = None;
            envelope.visible_after = now;
            true
        });
    }

    /// Mark the leased envelope Completed and free its slot. Returns false
    /// for a stale lease id (idempotent no-op).
    pub fn acknowledge(&self, lease_id: LeaseId) -> bool {
        let mut ring = self.inner.lock();
        let pos = ring
            .slots
            .iter()
            .position(|e| e.status == EnvelopeStatus::Leased && e.lease == Some(lease_id));
        match pos {
            Some(pos) => {
                if let Some(mut envelope) = ring.slots.remove(pos) {
                    envelope.status = EnvelopeStatus::Completed;
                }
                true
            }
            None => false,
        }
    }

    /// Return a leased envelope to the ring with an incremented retry count
    /// and a backoff-delayed visibility, or dead-letter it when the count
    /// exceeds the policy cap
    pub fn requeue(&self, lease_id: LeaseId, reason: &str) -> RequeueResult {
        let now = self.clock.now();
        let result = {
            let mut ring = self.inner.lock();
            let pos = ring
                .slots
                .iter()
                .position(|e| e.status == EnvelopeStatus::Leased && e.lease == Some(lease_id));
            let Some(pos) = pos else {
                return RequeueResult::Stale;
            };

            let retry_count = ring.slots[pos].retry_count + 1;
            if retry_count > self.retry.max_attempts {
                if let Some(mut envelope) = ring.slots.remove(pos) {
                    envelope.status = EnvelopeStatus::Superseded;
                    envelope.retry_count = retry_count;
                    self.dlq.record(
                        &self.vertex_id,
                        "retries-exhausted",
                        Some(reason.to_string()),
                        Some(envelope.message.clone()),
                        retry_count,
                    );
                }
                RequeueResult::DeadLettered
            } else {
                let visible_after = now + chrono_ms(self.retry.delay_with_jitter(retry_count));
                let envelope = &mut ring.slots[pos];
                envelope.retry_count = retry_count;
                envelope.status = EnvelopeStatus::Ready;
                envelope.lease = None;
                envelope.lease_expiry = None;
                envelope.visible_after = visible_after;
                tracing::debug!(
                    vertex_id = %self.vertex_id,
                    retry_count,
                    reason,
                    "requeued envelope"
                );
                RequeueResult::Requeued { visible_after }
            }
        };
        if matches!(result, RequeueResult::Requeued { .. }) {
            self.notify.notify_one();
        }
        result
    }

    /// Hand a lease back untouched: Ready again, immediately visible, no
    /// retry increment. Used when a worker backs out without executing
    /// (pause landed between wake-up and dispatch).
    pub fn release(&self, lease_id: LeaseId) -> bool {
        let released = {
            let mut ring = self.inner.lock();
            let found = ring
                .slots
                .iter_mut()
                .find(|e| e.status == EnvelopeStatus::Leased && e.lease == Some(lease_id));
            match found {
                Some(envelope) => {
                    envelope.status = EnvelopeStatus::Ready;
                    envelope.lease = None;
                    envelope.lease_expiry = None;
                    true
                }
                None => false,
            }
        };
        if released {
            self.notify.notify_one();
        }
        released
    }

    /// Force a leased envelope straight to the dead-letter queue; used for
    /// terminal, never-retryable failures. Returns false for a stale lease.
    pub fn dead_letter(&self, lease_id: LeaseId, reason: &str, detail: Option<String>) -> bool {
        let mut ring = self.inner.lock();
        let pos = ring
            .slots
            .iter()
            .position(|e| e.status == EnvelopeStatus::Leased && e.lease == Some(lease_id));
        match pos {
            Some(pos) => {
                if let Some(mut envelope) = ring.slots.remove(pos) {
                    envelope.status = EnvelopeStatus::Superseded;
                    self.dlq.record(
                        &self.vertex_id,
                        reason,
                        detail,
                        Some(envelope.message.clone()),
                        envelope.retry_count,
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Discard every Ready envelope; used on cancellation. Leased
    /// envelopes stay with their holders.
    pub fn drain(&self) -> usize {
        let mut ring = self.inner.lock();
        let before = ring.slots.len();
        let tracker = &self.tracker;
        ring.slots.retain_mut(|envelope| {
            if envelope.status == EnvelopeStatus::Ready {
                envelope.status = EnvelopeStatus::Superseded;
                tracker.release(envelope.message.correlation);
                false
            } else {
                true
            }
        });
        before - ring.slots.len()
    }

    /// Copy of every stored envelope, for checkpointing
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.inner.lock().slots.iter().cloned().collect()
    }

    /// Rebuild from a checkpoint. Envelopes leased at snapshot time become
    /// Ready again with the retry count bumped to reflect the partial
    /// execution.
    pub fn restore(&self, envelopes: Vec<Envelope>) {
        let now = self.clock.now();
        let mut ring = self.inner.lock();
        ring.slots.clear();
        for mut envelope in envelopes {
            if envelope.status == EnvelopeStatus::Leased {
                envelope.status = EnvelopeStatus::Ready;
                envelope.lease = None;
                envelope.lease_expiry = None;
                envelope.retry_count += 1;
                envelope.visible_after = now;
            }
            self.tracker.retain(envelope.message.correlation);
            ring.next_seq = ring.next_seq.max(envelope.seq + 1);
            ring.slots.push_back(envelope);
        }
        drop(ring);
        self.notify.notify_one();
    }
}

fn chrono_ms(duration: Duration) -> ChronoDuration {
    // Microsecond precision: jittered backoffs are not whole milliseconds
    ChronoDuration::microseconds(duration.as_micros() as i64)
}
