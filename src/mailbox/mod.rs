//! Per-vertex mailboxes
//!
//! Each vertex owns a bounded ring of message envelopes with lease-based
//! visibility. Workers lease the oldest visible envelope, execute, then
//! acknowledge or requeue; exhausted envelopes move to the shared
//! dead-letter queue atomically with removal from the ring.

mod dlq;
mod envelope;
mod ring;

pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use envelope::{Envelope, EnvelopeStatus, LeaseId};
pub use ring::{EnqueueResult, LeaseHandle, Mailbox, RequeueResult};
