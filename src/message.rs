//! Messages flowing between vertices
//!
//! A message is immutable once constructed. The router derives messages
//! from vertex completion events; the engine fabricates `Start` messages
//! for entry vertices.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// String-keyed bag of opaque values, the universal data currency
pub type Bag = HashMap<String, Value>;

/// Message kind, mirrored by edge trigger filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Synthetic trigger for entry vertices
    Start,
    /// Source vertex completed normally
    Complete,
    /// Source vertex failed terminally
    Fail,
    /// Source vertex was cancelled
    Cancel,
    /// Loop/foreach iteration emission
    Next,
}

/// Error descriptor carried by Fail messages
///
/// `kind` is the discriminator matched by retry policies
/// (`RetryOn`/`DoNotRetryOn`), not a language-level type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Classification discriminator, e.g. "timeout", "circuit-open"
    pub kind: String,
    /// Human-readable description
    pub message: String,
}

impl Fault {
    /// Build a fault from a kind and message
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// One unit of communication between vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// What happened at the source
    pub kind: MessageKind,
    /// Source vertex id; `None` for Start
    pub source: Option<String>,
    /// Port the source emitted on, if any
    pub source_port: Option<String>,
    /// Target-port hint from the matched edge, surfaced in the input bag
    pub target_port: Option<String>,
    /// Data payload (source output bag for derived messages)
    #[serde(default)]
    pub payload: Bag,
    /// Error descriptor; present only for Fail
    pub fault: Option<Fault>,
    /// Iteration index; present only for Next
    pub iteration: Option<u64>,
    /// Correlation id linking a message to the emission it derives from
    pub correlation: Uuid,
}

impl Message {
    /// Synthetic start message for an entry vertex
    pub fn start() -> Self {
        Self {
            kind: MessageKind::Start,
            source: None,
            source_port: None,
            target_port: None,
            payload: Bag::new(),
            fault: None,
            iteration: None,
            correlation: Uuid::new_v4(),
        }
    }

    /// Derived message produced by the router for one matched edge
    pub fn derived(
        kind: MessageKind,
        source: &str,
        source_port: Option<String>,
        target_port: Option<String>,
        payload: Bag,
        fault: Option<Fault>,
        iteration: Option<u64>,
        correlation: Uuid,
    ) -> Self {
        Self {
            kind,
            source: Some(source.to_string()),
            source_port,
            target_port,
            payload,
            fault,
            iteration,
            correlation,
        }
    }
}
