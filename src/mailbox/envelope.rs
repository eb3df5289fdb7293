//! Mailbox envelopes: a message plus lease and retry bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

/// Identifier of one lease grant
pub type LeaseId = Uuid;

/// Envelope lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Visible to leasing once `visible_after` passes
    Ready,
    /// Exclusively claimed by one worker until the lease expires
    Leased,
    /// Acknowledged; the slot is freed
    Completed,
    /// Exhausted retries or displaced; lives on in the dead-letter queue
    Superseded,
}

/// One stored message with its mailbox bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The enclosed message
    pub message: Message,
    /// Monotonic per-mailbox enqueue sequence
    pub seq: u64,
    /// Lifecycle state
    pub status: EnvelopeStatus,
    /// Invisible to leasing before this instant
    pub visible_after: DateTime<Utc>,
    /// Times this envelope has been requeued or reclaimed
    pub retry_count: u32,
    /// Valid only while Leased
    pub lease: Option<LeaseId>,
    /// When the current lease lapses
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Fresh Ready envelope, visible immediately
    pub fn new(message: Message, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            message,
            seq,
            status: EnvelopeStatus::Ready,
            visible_after: now,
            retry_count: 0,
            lease: None,
            lease_expiry: None,
        }
    }

    /// Whether this envelope can be leased at `now`
    pub fn leasable(&self, now: DateTime<Utc>) -> bool {
        self.status == EnvelopeStatus::Ready && self.visible_after <= now
    }
}
