//! Vertex implementations and the factory seam
//!
//! A vertex implementation exposes two operations: `initialize` validates
//! the kind-specific configuration and fails on any defect, and `execute`
//! performs the work. The engine treats an `execute` call as failed when
//! it returns an error, observes cancellation, or exceeds the per-call
//! timeout. Implementations must not retain the input bag past return and
//! should expect concurrent writes to the shared globals.

mod branch;
mod container;
mod foreach;
mod subflow;
mod switch;
mod task;
mod while_loop;

pub use branch::Branch;
pub use container::Container;
pub use foreach::Foreach;
pub use subflow::Subflow;
pub use switch::Switch;
pub use task::UserTask;
pub use while_loop::WhileLoop;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::concurrency::{CancelToken, CorrelationTracker};
use crate::engine::EngineOptions;
use crate::error::{WorkflowError, WorkflowResult};
use crate::eval::ExpressionEvaluator;
use crate::events::{EventBus, WorkflowEvent};
use crate::graph::{GraphCodec, VertexDescriptor, VertexKind};
use crate::instance::Globals;
use crate::message::{Bag, MessageKind};
use crate::router::{RouteEvent, Router};

/// What a vertex returns on success
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutcome {
    /// Output bag, inherited by derived messages
    pub output: Bag,
    /// Port chosen for the outbound event
    pub port: Option<String>,
}

impl ExecuteOutcome {
    /// Empty outcome
    pub fn empty() -> Self {
        Self::default()
    }

    /// Outcome with an output bag
    pub fn with_output(output: Bag) -> Self {
        Self { output, port: None }
    }

    /// Set the chosen port
    pub fn on_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }
}

/// Engine-side capabilities handed to executing vertices
#[derive(Clone)]
pub(crate) struct EngineHooks {
    pub router: Arc<Router>,
    pub events: EventBus,
    pub tracker: Arc<CorrelationTracker>,
    pub codec: Arc<dyn GraphCodec>,
    pub factory: Arc<dyn VertexFactory>,
    pub options: EngineOptions,
    pub compensating: Arc<AtomicBool>,
    pub subflow_depth: u32,
}

/// Execution context for one vertex activation
pub struct ExecuteContext {
    /// Vertex being executed
    pub vertex_id: String,
    /// Input bag from the consumed message
    pub input: Bag,
    /// Shared, mutable global bag
    pub globals: Globals,
    /// Cancellation token for this call
    pub cancel: CancelToken,
    /// Expression evaluator
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    /// Clock seam
    pub clock: Arc<dyn Clock>,
    /// Correlation of the message being processed
    pub correlation: Uuid,
    pub(crate) hooks: Option<EngineHooks>,
}

impl ExecuteContext {
    /// Bare context for direct vertex invocation (tests, containers)
    pub fn detached(
        vertex_id: impl Into<String>,
        input: Bag,
        globals: Globals,
        cancel: CancelToken,
        evaluator: Arc<dyn ExpressionEvaluator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vertex_id: vertex_id.into(),
            input,
            globals,
            cancel,
            evaluator,
            clock,
            correlation: Uuid::new_v4(),
            hooks: None,
        }
    }

    /// Variable bag for the evaluator: `{globals, input}`
    pub fn vars(&self) -> Bag {
        let mut vars = Bag::new();
        vars.insert("globals".to_string(), self.globals.as_value());
        vars.insert(
            "input".to_string(),
            serde_json::Value::Object(
                self.input
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        );
        vars
    }

    /// Emit a `Next` event through the router mid-execution; returns the
    /// number of mailboxes reached. Emissions inherit this activation's
    /// correlation unless one is supplied.
    pub fn emit_next(&self, payload: Bag, iteration: u64, correlation: Option<Uuid>) -> usize {
        let Some(hooks) = &self.hooks else {
            return 0;
        };
        let event = RouteEvent {
            source: self.vertex_id.clone(),
            kind: MessageKind::Next,
            source_port: None,
            payload,
            fault: None,
            iteration: Some(iteration),
            correlation: correlation.unwrap_or(self.correlation),
        };
        hooks.router.route(
            &event,
            &self.globals,
            hooks.compensating.load(Ordering::Acquire),
        )
    }

    /// Wait until every message transitively derived from `correlation`
    /// has finished processing; false when cancelled first
    pub async fn settle(&self, correlation: Uuid) -> bool {
        match &self.hooks {
            Some(hooks) => hooks.tracker.settled(correlation, &self.cancel).await,
            None => true,
        }
    }

    /// Publish a progress detail on the event stream
    pub fn progress(&self, detail: impl Into<String>) {
        if let Some(hooks) = &self.hooks {
            hooks.events.publish(WorkflowEvent::NodeProgress {
                vertex_id: self.vertex_id.clone(),
                detail: detail.into(),
            });
        }
    }
}

/// A vertex implementation
#[async_trait]
pub trait VertexImpl: Send + Sync {
    /// Validate kind-specific configuration; any error is fatal to the run
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()>;

    /// Perform the work. Must observe `ctx.cancel` promptly and must not
    /// retain references to the input bag past return.
    async fn execute(&self, ctx: &mut ExecuteContext) -> WorkflowResult<ExecuteOutcome>;
}

/// Arguments handed to a registered user-task handler
pub struct TaskCall {
    /// Input bag from the consumed message
    pub input: Bag,
    /// Shared globals
    pub globals: Globals,
    /// Cancellation token for this call
    pub cancel: CancelToken,
}

/// A registered user-task function
pub type TaskHandler =
    Arc<dyn Fn(TaskCall) -> BoxFuture<'static, WorkflowResult<ExecuteOutcome>> + Send + Sync>;

/// Builds vertex implementations from descriptors, keyed on kind
pub trait VertexFactory: Send + Sync {
    /// Build an uninitialized implementation for a descriptor
    fn build(&self, descriptor: &VertexDescriptor) -> WorkflowResult<Box<dyn VertexImpl>>;
}

/// Factory wiring the built-in kinds plus a user handler registry
#[derive(Default)]
pub struct DefaultVertexFactory {
    handlers: DashMap<String, TaskHandler>,
}

impl DefaultVertexFactory {
    /// Factory with an empty handler registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async user-task handler under a name
    pub fn register(&self, name: impl Into<String>, handler: TaskHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register a synchronous closure as a handler
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskCall) -> WorkflowResult<ExecuteOutcome> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(
            name,
            Arc::new(move |call| {
                let f = f.clone();
                Box::pin(async move { f(call) })
            }),
        );
    }

    /// Look up a handler by name
    pub fn handler(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.get(name).map(|entry| entry.clone())
    }
}

impl VertexFactory for DefaultVertexFactory {
    fn build(&self, descriptor: &VertexDescriptor) -> WorkflowResult<Box<dyn VertexImpl>> {
        match descriptor.kind {
            VertexKind::UserTask => {
                let config: crate::graph::UserTaskConfig =
                    descriptor
                        .typed_config()
                        .map_err(|e| WorkflowError::VertexInit {
                            vertex_id: descriptor.id.clone(),
                            reason: e,
                        })?;
                let handler =
                    self.handler(&config.handler)
                        .ok_or_else(|| WorkflowError::VertexInit {
                            vertex_id: descriptor.id.clone(),
                            reason: format!("no handler registered as '{}'", config.handler),
                        })?;
                Ok(Box::new(UserTask::new(handler)))
            }
            VertexKind::Branch => Ok(Box::new(Branch::default())),
            VertexKind::Switch => Ok(Box::new(Switch::default())),
            VertexKind::Foreach => Ok(Box::new(Foreach::default())),
            VertexKind::WhileLoop => Ok(Box::new(WhileLoop::default())),
            VertexKind::Subflow => Ok(Box::new(Subflow::default())),
            VertexKind::Container => Ok(Box::new(Container::default())),
            VertexKind::Trigger => Err(WorkflowError::VertexInit {
                vertex_id: descriptor.id.clone(),
                reason: "vertex kind not supported".to_string(),
            }),
        }
    }
}
