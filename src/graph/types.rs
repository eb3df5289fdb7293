//! Descriptor types for graphs, vertices, and edges

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::message::{Bag, MessageKind};
use crate::resilience::{CircuitBreakerPolicy, RetryPolicy};

/// Vertex kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexKind {
    /// Opaque user function resolved through the factory's handler registry
    UserTask,
    /// Two-way conditional split on a boolean expression
    Branch,
    /// Multi-way split matching a stringified expression against case keys
    Switch,
    /// Iterates a sequence, emitting one Next per element
    Foreach,
    /// Condition-driven loop re-evaluated before each iteration
    WhileLoop,
    /// Isolated child workflow with explicit input/output mappings
    Subflow,
    /// Private child graph executed sequentially or in parallel
    Container,
    /// Timer/trigger vertex; representable but rejected by validation
    Trigger,
}

impl VertexKind {
    /// Stable string form used for gate and circuit-breaker keys
    pub fn as_str(&self) -> &'static str {
        match self {
            VertexKind::UserTask => "user_task",
            VertexKind::Branch => "branch",
            VertexKind::Switch => "switch",
            VertexKind::Foreach => "foreach",
            VertexKind::WhileLoop => "while_loop",
            VertexKind::Subflow => "subflow",
            VertexKind::Container => "container",
            VertexKind::Trigger => "trigger",
        }
    }
}

/// Scheduling priority for gate admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Admitted before normal and low
    High,
    /// Default class
    Normal,
    /// Admitted last
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Index into per-class waiter queues, high first
    pub fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Edge trigger filter entry; the subset of message kinds an edge reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Source completed
    Complete,
    /// Source failed
    Fail,
    /// Source was cancelled
    Cancel,
    /// Loop/foreach iteration
    Next,
}

impl TriggerKind {
    /// Whether a message kind passes this trigger
    pub fn matches(&self, kind: MessageKind) -> bool {
        matches!(
            (self, kind),
            (TriggerKind::Complete, MessageKind::Complete)
                | (TriggerKind::Fail, MessageKind::Fail)
                | (TriggerKind::Cancel, MessageKind::Cancel)
                | (TriggerKind::Next, MessageKind::Next)
        )
    }
}

fn default_triggers() -> BTreeSet<TriggerKind> {
    BTreeSet::from([TriggerKind::Complete])
}

fn default_true() -> bool {
    true
}

/// One vertex of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexDescriptor {
    /// Stable id, unique within the graph
    pub id: String,
    /// Display name; combined with the kind for per-type gate keys
    pub name: String,
    /// Kind discriminator selecting the implementation
    pub kind: VertexKind,
    /// Kind-specific configuration bag, validated into a typed config
    #[serde(default)]
    pub config: Bag,
    /// Admission priority
    #[serde(default)]
    pub priority: Priority,
    /// Per-vertex-type concurrency cap; 0 = unbounded
    #[serde(default)]
    pub max_concurrent: usize,
    /// Retry policy; falls back to the engine default when absent
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Circuit-breaker policy, shared across all vertices of this kind
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    /// Vertex receiving dispatches while the breaker is open
    #[serde(default)]
    pub fallback: Option<String>,
    /// Vertex triggered during the compensation walk
    #[serde(default)]
    pub compensation: Option<String>,
    /// Port to report when the implementation chooses none
    #[serde(default)]
    pub on_completion_port: Option<String>,
}

impl VertexDescriptor {
    /// Minimal descriptor with defaults everywhere else
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: VertexKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            config: Bag::new(),
            priority: Priority::default(),
            max_concurrent: 0,
            retry: None,
            circuit_breaker: None,
            fallback: None,
            compensation: None,
            on_completion_port: None,
        }
    }

    /// Gate key shared by vertices of the same kind and name
    pub fn type_key(&self) -> String {
        format!("{}|{}", self.kind.as_str(), self.name)
    }

    /// Parse the configuration bag into a typed config
    pub fn typed_config<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        let object = Value::Object(
            self.config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        serde_json::from_value(object).map_err(|e| e.to_string())
    }
}

/// One directed, filtered dependency between two vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Source vertex id
    pub source: String,
    /// Target vertex id
    pub target: String,
    /// Message kinds this edge reacts to; defaults to {Complete}
    #[serde(default = "default_triggers")]
    pub triggers: BTreeSet<TriggerKind>,
    /// Only match events emitted on this port; null matches any
    #[serde(default)]
    pub source_port: Option<String>,
    /// Informational port hint surfaced in the target's input bag
    #[serde(default)]
    pub target_port: Option<String>,
    /// Boolean guard over `{output, globals}`; empty/absent always passes
    #[serde(default)]
    pub guard: Option<String>,
    /// Delivery ordering among sibling edges, ascending
    #[serde(default)]
    pub priority: i32,
    /// Disabled edges are ignored everywhere
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Traversed only during the compensation walk
    #[serde(default)]
    pub is_compensation: bool,
}

impl EdgeDescriptor {
    /// Plain Complete-triggered edge between two vertices
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            triggers: default_triggers(),
            source_port: None,
            target_port: None,
            guard: None,
            priority: 0,
            enabled: true,
            is_compensation: false,
        }
    }

    /// Same edge with a different trigger set
    pub fn with_triggers(mut self, triggers: impl IntoIterator<Item = TriggerKind>) -> Self {
        self.triggers = triggers.into_iter().collect();
        self
    }

    /// Same edge filtered to one source port
    pub fn with_source_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    /// Same edge with a guard expression
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }
}

/// A complete workflow definition, immutable once validated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// Graph identifier
    pub id: String,
    /// Ordered vertex descriptors
    pub vertices: Vec<VertexDescriptor>,
    /// Ordered edge descriptors
    pub edges: Vec<EdgeDescriptor>,
    /// Explicit entry override; otherwise entries are inferred
    #[serde(default)]
    pub entry_vertex: Option<String>,
    /// Workflow-wide concurrency cap; 0 = unbounded
    #[serde(default)]
    pub max_concurrency: usize,
    /// Default per-call timeout in milliseconds
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl Graph {
    /// Empty graph with an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vertices: Vec::new(),
            edges: Vec::new(),
            entry_vertex: None,
            max_concurrency: 0,
            default_timeout_ms: None,
        }
    }

    /// Append a vertex
    pub fn vertex(mut self, descriptor: VertexDescriptor) -> Self {
        self.vertices.push(descriptor);
        self
    }

    /// Append an edge
    pub fn edge(mut self, descriptor: EdgeDescriptor) -> Self {
        self.edges.push(descriptor);
        self
    }
}

/// Typed config for user-task vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTaskConfig {
    /// Handler name resolved through the factory registry
    pub handler: String,
}

/// Typed config for branch vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Boolean expression over `{globals, input}`
    pub condition: String,
}

/// Typed config for switch vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Expression whose stringified value selects a case
    pub expression: String,
    /// Case key to port name; empty port name means "use the key"
    #[serde(default)]
    pub cases: HashMap<String, String>,
}

/// Typed config for foreach vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachConfig {
    /// Expression producing the sequence; mutually exclusive with `items`
    #[serde(default)]
    pub expression: Option<String>,
    /// Literal sequence; mutually exclusive with `expression`
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    /// Variable name each element is bound under in the emitted bag
    pub item_var: String,
}

fn default_max_iterations() -> u64 {
    1000
}

/// Typed config for while-loop vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileConfig {
    /// Boolean condition re-evaluated before each iteration
    pub condition: String,
    /// Hard iteration cap; reaching it is a failure, not completion
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
}

/// Typed config for subflow vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowConfig {
    /// Inline child graph definition
    #[serde(default)]
    pub graph: Option<Value>,
    /// External definition path, decoded through the configured codec
    #[serde(default)]
    pub path: Option<String>,
    /// Parent global key to child global key, applied before start
    #[serde(default)]
    pub input_mappings: HashMap<String, String>,
    /// Child global key to parent global key, applied after terminal state
    #[serde(default)]
    pub output_mappings: HashMap<String, String>,
    /// Per-subflow timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Container child execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerMode {
    /// Children run one at a time in dependency order
    Sequential,
    /// Independent children of each dependency level run concurrently
    Parallel,
}

impl Default for ContainerMode {
    fn default() -> Self {
        ContainerMode::Sequential
    }
}

/// Typed config for container vertices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Private child vertices
    pub vertices: Vec<VertexDescriptor>,
    /// Private child edges; endpoints must name child vertices
    #[serde(default)]
    pub edges: Vec<EdgeDescriptor>,
    /// Execution mode
    #[serde(default)]
    pub mode: ContainerMode,
}
