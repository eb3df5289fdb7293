//! Runtime records for workflow and vertex instances

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::message::{Bag, Fault};

/// Vertex instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Created, not yet executing
    Pending,
    /// Inside the user function
    Running,
    /// Finished successfully
    Completed,
    /// Failed terminally
    Failed,
    /// Observed cancellation
    Cancelled,
}

impl InstanceStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

/// One activation of a vertex
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexInstance {
    /// Fresh instance id
    pub id: Uuid,
    /// Vertex this instance activates
    pub vertex_id: String,
    /// Owning run
    pub run_id: Uuid,
    /// Lifecycle state
    pub status: InstanceStatus,
    /// When execution began
    pub started_at: DateTime<Utc>,
    /// When a terminal state was reached
    pub ended_at: Option<DateTime<Utc>>,
    /// Output bag; read by the router only after terminal state
    #[serde(default)]
    pub output: Bag,
    /// Failure descriptor for Failed instances
    pub fault: Option<Fault>,
    /// Port chosen on the outbound event
    pub chosen_port: Option<String>,
    /// Position in the run's completion order, for the compensation walk
    pub completion_index: Option<u64>,
}

impl VertexInstance {
    /// New running instance
    pub fn running(vertex_id: &str, run_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            vertex_id: vertex_id.to_string(),
            run_id,
            status: InstanceStatus::Running,
            started_at: now,
            ended_at: None,
            output: Bag::new(),
            fault: None,
            chosen_port: None,
            completion_index: None,
        }
    }

    /// Execution duration, once ended
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Workflow run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Executing
    Running,
    /// Every created instance completed
    Completed,
    /// At least one instance failed terminally
    Failed,
    /// The cancellation token fired
    Cancelled,
    /// Parked at a checkpoint
    Paused,
}

impl WorkflowStatus {
    /// Terminal verdicts
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Shared global variable bag
///
/// Last writer wins per key; readers see some previously committed value.
/// There is deliberately no transaction API.
#[derive(Clone, Default)]
pub struct Globals {
    map: Arc<DashMap<String, Value>>,
}

impl Globals {
    /// Empty bag
    pub fn new() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }

    /// Bag pre-seeded from a map
    pub fn from_bag(bag: Bag) -> Self {
        let globals = Self::new();
        for (key, value) in bag {
            globals.map.insert(key, value);
        }
        globals
    }

    /// Read one key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Write one key, replacing any prior value
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    /// Point-in-time copy as a plain bag
    pub fn snapshot(&self) -> Bag {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Point-in-time copy as a JSON object, for evaluator variable bags
    pub fn as_value(&self) -> Value {
        Value::Object(
            self.map
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        )
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
