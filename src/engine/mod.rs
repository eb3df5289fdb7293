//! Workflow engine orchestrator
//!
//! Drives a validated graph to a verdict: one worker per vertex, leased
//! mailbox consumption, gate admission, retry/circuit integration,
//! compensation, and completion detection.

mod compensation;
mod completion;
mod worker;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, Snapshot};
use crate::clock::{Clock, SystemClock};
use crate::concurrency::{CancelToken, CorrelationTracker, PriorityGate};
use crate::error::{WorkflowError, WorkflowResult};
use crate::eval::{ExpressionEvaluator, SimpleEvaluator};
use crate::events::{EventBus, ProgressUpdate, WorkflowEvent};
use crate::graph::{GraphCodec, JsonGraphCodec, ValidatedGraph, VertexDescriptor};
use crate::instance::{Globals, InstanceStatus, VertexInstance, WorkflowStatus};
use crate::mailbox::{DeadLetterEntry, DeadLetterQueue, Mailbox};
use crate::message::{Fault, Message};
use crate::resilience::{BreakerRegistry, RetryPolicy};
use crate::router::{RouteEvent, Router};
use crate::vertex::{DefaultVertexFactory, VertexFactory, VertexImpl};

/// When the engine takes checkpoints (given a configured store)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Never snapshot automatically
    Never,
    /// Snapshot when the run pauses
    OnPause,
    /// Snapshot when the run pauses and after every node completion
    OnNodeCompletion,
}

/// Engine-wide configuration
#[derive(Clone)]
pub struct EngineOptions {
    /// Per-call execution timeout; the graph's default overrides it
    pub per_call_timeout: Duration,
    /// How long a lease stays exclusive before reclaim
    pub visibility_timeout: Duration,
    /// Ring capacity per mailbox
    pub mailbox_capacity: usize,
    /// Retry policy for vertices that configure none
    pub default_retry: RetryPolicy,
    /// Whether pause() is permitted
    pub allow_pause: bool,
    /// Whole-run timeout; elapsing cancels the run
    pub workflow_timeout: Option<Duration>,
    /// Checkpoint cadence
    pub checkpoint: CheckpointPolicy,
    /// Subflow nesting limit
    pub max_subflow_depth: u32,
    /// Default per-subflow timeout
    pub subflow_timeout: Option<Duration>,
    /// Event stream backlog per subscriber
    pub event_capacity: usize,
    /// Dead-letter queue capacity
    pub dlq_capacity: usize,
    /// Workflow-wide cap on total retries
    pub retry_budget: Option<u32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            per_call_timeout: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(30),
            mailbox_capacity: 256,
            default_retry: RetryPolicy::none(),
            allow_pause: true,
            workflow_timeout: None,
            checkpoint: CheckpointPolicy::OnPause,
            max_subflow_depth: 8,
            subflow_timeout: None,
            event_capacity: 1024,
            dlq_capacity: 10_000,
            retry_budget: None,
        }
    }
}

/// Builder for [`WorkflowEngine`]
pub struct EngineBuilder {
    graph: ValidatedGraph,
    options: EngineOptions,
    evaluator: Arc<dyn ExpressionEvaluator>,
    factory: Arc<dyn VertexFactory>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn GraphCodec>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    globals: Globals,
    parent_cancel: Option<CancelToken>,
    subflow_depth: u32,
    snapshot: Option<Snapshot>,
}

impl EngineBuilder {
    /// Builder over a validated graph with default collaborators
    pub fn new(graph: ValidatedGraph) -> Self {
        Self {
            graph,
            options: EngineOptions::default(),
            evaluator: Arc::new(SimpleEvaluator::new()),
            factory: Arc::new(DefaultVertexFactory::new()),
            clock: Arc::new(SystemClock),
            codec: Arc::new(JsonGraphCodec),
            checkpoint_store: None,
            globals: Globals::new(),
            parent_cancel: None,
            subflow_depth: 0,
            snapshot: None,
        }
    }

    /// Override the engine options
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Override the expression evaluator
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Override the vertex factory
    pub fn factory(mut self, factory: Arc<dyn VertexFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Override the clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the graph codec (used by subflows loading external paths)
    pub fn codec(mut self, codec: Arc<dyn GraphCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Attach a checkpoint store
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Seed the global variable bag
    pub fn globals(mut self, globals: Globals) -> Self {
        self.globals = globals;
        self
    }

    /// Resume state from a snapshot instead of starting fresh
    pub fn from_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Link cancellation under a parent token (subflows)
    pub(crate) fn parent_cancel(mut self, parent: CancelToken) -> Self {
        self.parent_cancel = Some(parent);
        self
    }

    /// Nesting depth for subflow recursion limiting
    pub(crate) fn subflow_depth(mut self, depth: u32) -> Self {
        self.subflow_depth = depth;
        self
    }

    /// Build the engine: instantiate vertex implementations, mailboxes,
    /// router, gates, and breakers. Initialization errors are fatal.
    pub fn build(self) -> WorkflowResult<Arc<WorkflowEngine>> {
        let run_id = self
            .snapshot
            .as_ref()
            .map(|s| s.run_id)
            .unwrap_or_else(Uuid::new_v4);
        let dlq = Arc::new(DeadLetterQueue::new(
            self.options.dlq_capacity,
            self.clock.clone(),
        ));
        let tracker = CorrelationTracker::new();

        let mut vertex_impls: HashMap<String, Arc<dyn VertexImpl>> = HashMap::new();
        for descriptor in self.graph.vertices() {
            let mut implementation = self.factory.build(descriptor)?;
            implementation.initialize(descriptor)?;
            vertex_impls.insert(descriptor.id.clone(), Arc::from(implementation));
        }

        let mut mailboxes: HashMap<String, Arc<Mailbox>> = HashMap::new();
        for descriptor in self.graph.vertices() {
            let retry = effective_retry(descriptor, &self.options);
            mailboxes.insert(
                descriptor.id.clone(),
                Arc::new(Mailbox::new(
                    descriptor.id.clone(),
                    self.options.mailbox_capacity,
                    self.options.visibility_timeout,
                    retry,
                    self.clock.clone(),
                    dlq.clone(),
                    tracker.clone(),
                )),
            );
        }

        let router = Arc::new(Router::new(
            &self.graph,
            mailboxes.clone(),
            self.evaluator.clone(),
            dlq.clone(),
            tracker.clone(),
        ));

        let workflow_gate = PriorityGate::new("workflow", self.graph.graph().max_concurrency);
        let mut kind_gates: HashMap<String, Arc<PriorityGate>> = HashMap::new();
        for descriptor in self.graph.vertices() {
            kind_gates
                .entry(descriptor.type_key())
                .or_insert_with(|| PriorityGate::new(descriptor.type_key(), descriptor.max_concurrent));
        }

        let breakers = Arc::new(BreakerRegistry::new());
        for descriptor in self.graph.vertices() {
            if let Some(policy) = &descriptor.circuit_breaker {
                breakers.ensure(descriptor.kind.as_str(), policy.clone(), self.clock.clone());
            }
        }

        let cancel_root = match &self.parent_cancel {
            Some(parent) => parent.child(),
            None => CancelToken::new(),
        };
        let (verdict_tx, _) = watch::channel(None);

        let call_timeout = self
            .graph
            .graph()
            .default_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.options.per_call_timeout);
        let event_capacity = self.options.event_capacity;

        let engine = WorkflowEngine {
            run_id,
            graph: Arc::new(self.graph),
            options: self.options,
            call_timeout,
            clock: self.clock,
            evaluator: self.evaluator,
            factory: self.factory,
            codec: self.codec,
            checkpoint_store: self.checkpoint_store,
            globals: self.globals,
            dlq,
            tracker,
            mailboxes,
            vertex_impls,
            router,
            events: EventBus::new(event_capacity),
            instances: Arc::new(DashMap::new()),
            status: RwLock::new(WorkflowStatus::Running),
            cancel_root,
            shutdown: CancelToken::new(),
            workflow_gate,
            kind_gates,
            breakers,
            active: Arc::new(AtomicUsize::new(0)),
            activity: Arc::new(Notify::new()),
            retries_used: Arc::new(AtomicU32::new(0)),
            completion_seq: AtomicU64::new(0),
            compensating: Arc::new(AtomicBool::new(false)),
            compensation_done: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
            pause_notify: Arc::new(Notify::new()),
            first_fault: Mutex::new(None),
            verdict_tx,
            subflow_depth: self.subflow_depth,
            restored: self.snapshot.is_some(),
            started: AtomicBool::new(false),
        };
        let engine = Arc::new(engine);

        if let Some(snapshot) = self.snapshot {
            engine.restore_from(snapshot);
        }
        Ok(engine)
    }
}

fn effective_retry(descriptor: &VertexDescriptor, options: &EngineOptions) -> RetryPolicy {
    descriptor
        .retry
        .clone()
        .unwrap_or_else(|| options.default_retry.clone())
}

/// One run of a validated graph
pub struct WorkflowEngine {
    run_id: Uuid,
    pub(crate) graph: Arc<ValidatedGraph>,
    pub(crate) options: EngineOptions,
    pub(crate) call_timeout: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) factory: Arc<dyn VertexFactory>,
    pub(crate) codec: Arc<dyn GraphCodec>,
    pub(crate) checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub(crate) globals: Globals,
    pub(crate) dlq: Arc<DeadLetterQueue>,
    pub(crate) tracker: Arc<CorrelationTracker>,
    pub(crate) mailboxes: HashMap<String, Arc<Mailbox>>,
    pub(crate) vertex_impls: HashMap<String, Arc<dyn VertexImpl>>,
    pub(crate) router: Arc<Router>,
    pub(crate) events: EventBus,
    pub(crate) instances: Arc<DashMap<Uuid, VertexInstance>>,
    status: RwLock<WorkflowStatus>,
    pub(crate) cancel_root: CancelToken,
    pub(crate) shutdown: CancelToken,
    pub(crate) workflow_gate: Arc<PriorityGate>,
    pub(crate) kind_gates: HashMap<String, Arc<PriorityGate>>,
    pub(crate) breakers: Arc<BreakerRegistry>,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) activity: Arc<Notify>,
    pub(crate) retries_used: Arc<AtomicU32>,
    pub(crate) completion_seq: AtomicU64,
    pub(crate) compensating: Arc<AtomicBool>,
    pub(crate) compensation_done: AtomicBool,
    paused: Arc<AtomicBool>,
    pause_notify: Arc<Notify>,
    first_fault: Mutex<Option<Fault>>,
    verdict_tx: watch::Sender<Option<WorkflowStatus>>,
    pub(crate) subflow_depth: u32,
    restored: bool,
    started: AtomicBool,
}

impl WorkflowEngine {
    /// Run id
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current workflow status
    pub fn status(&self) -> WorkflowStatus {
        *self.status.read()
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Handle on the shared global bag
    pub fn globals(&self) -> Globals {
        self.globals.clone()
    }

    /// Dead-letter entries recorded so far
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dlq.list()
    }

    /// Every vertex instance created so far
    pub fn instances(&self) -> Vec<VertexInstance> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    /// Instances of one vertex, oldest first
    pub fn instances_for(&self, vertex_id: &str) -> Vec<VertexInstance> {
        let mut found: Vec<VertexInstance> = self
            .instances
            .iter()
            .filter(|e| e.vertex_id == vertex_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|i| i.started_at);
        found
    }

    /// The first vertex-level failure, the run's authoritative error
    pub fn first_fault(&self) -> Option<Fault> {
        self.first_fault.lock().clone()
    }

    /// Start workers, feed entry vertices, begin completion detection
    pub fn start(self: &Arc<Self>) -> WorkflowResult<RunHandle> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkflowError::InvalidTransition {
                from: "started".to_string(),
                to: "started".to_string(),
            });
        }
        tracing::info!(run_id = %self.run_id, graph = %self.graph.id(), "workflow starting");
        self.events.publish(WorkflowEvent::WorkflowStarted {
            run_id: self.run_id,
            graph_id: self.graph.id().to_string(),
        });

        for descriptor in self.graph.vertices() {
            let engine = self.clone();
            let vertex_id = descriptor.id.clone();
            tokio::spawn(async move {
                worker::worker_loop(engine, vertex_id).await;
            });
        }

        // A resumed run already carries its messages in the restored rings
        if !self.restored {
            for entry in self.graph.entries() {
                self.router.deliver(entry, Message::start());
            }
        }

        let engine = self.clone();
        tokio::spawn(async move {
            completion::completion_loop(engine).await;
        });

        Ok(RunHandle {
            engine: self.clone(),
            verdict_rx: self.verdict_tx.subscribe(),
        })
    }

    /// Request cancellation; the verdict becomes Cancelled once workers
    /// return control
    pub fn cancel(&self) {
        tracing::info!(run_id = %self.run_id, "workflow cancellation requested");
        self.cancel_root.cancel();
        self.poke();
    }

    /// Park leasing, wait for in-flight work to land, snapshot, and set
    /// status Paused
    pub async fn pause(&self) -> WorkflowResult<Snapshot> {
        if !self.options.allow_pause {
            return Err(WorkflowError::PauseNotAllowed);
        }
        if self.status() != WorkflowStatus::Running {
            return Err(WorkflowError::InvalidTransition {
                from: format!("{:?}", self.status()),
                to: "Paused".to_string(),
            });
        }
        self.paused.store(true, Ordering::SeqCst);
        while self.active.load(Ordering::SeqCst) != 0 {
            tokio::select! {
                _ = self.activity.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        {
            // The run may have reached a verdict while we waited
            let mut current = self.status.write();
            if *current != WorkflowStatus::Running {
                self.paused.store(false, Ordering::SeqCst);
                return Err(WorkflowError::InvalidTransition {
                    from: format!("{:?}", *current),
                    to: "Paused".to_string(),
                });
            }
            *current = WorkflowStatus::Paused;
        }
        let snapshot = self.snapshot();
        if let Some(store) = &self.checkpoint_store {
            if self.options.checkpoint != CheckpointPolicy::Never {
                store.save(&snapshot).await?;
            }
        }
        self.events
            .publish(WorkflowEvent::WorkflowPaused { run_id: self.run_id });
        tracing::info!(run_id = %self.run_id, "workflow paused");
        Ok(snapshot)
    }

    /// Resume a paused run in place
    pub fn resume(&self) -> WorkflowResult<()> {
        if self.status() != WorkflowStatus::Paused {
            return Err(WorkflowError::InvalidTransition {
                from: format!("{:?}", self.status()),
                to: "Running".to_string(),
            });
        }
        *self.status.write() = WorkflowStatus::Running;
        self.paused.store(false, Ordering::SeqCst);
        self.pause_notify.notify_waiters();
        tracing::info!(run_id = %self.run_id, "workflow resumed");
        Ok(())
    }

    /// Point-in-time recoverable state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            run_id: self.run_id,
            graph_id: self.graph.id().to_string(),
            status: self.status(),
            globals: self.globals.snapshot(),
            mailboxes: self
                .mailboxes
                .iter()
                .map(|(id, mailbox)| (id.clone(), mailbox.snapshot()))
                .collect(),
            instances: self.instances(),
            breakers: self.breakers.snapshot_all(),
            retries_used: self.retries_used.load(Ordering::SeqCst),
            taken_at: self.clock.now(),
        }
    }

    fn restore_from(&self, snapshot: Snapshot) {
        for (key, value) in snapshot.globals {
            self.globals.set(key, value);
        }
        for (vertex_id, envelopes) in snapshot.mailboxes {
            if let Some(mailbox) = self.mailboxes.get(&vertex_id) {
                mailbox.restore(envelopes);
            }
        }
        // In-flight instances at snapshot time are re-leasable, not resumable
        let mut max_completion = 0;
        for instance in snapshot.instances {
            if instance.status.is_terminal() {
                if let Some(index) = instance.completion_index {
                    max_completion = max_completion.max(index + 1);
                }
                self.instances.insert(instance.id, instance);
            }
        }
        self.completion_seq
            .store(max_completion, Ordering::SeqCst);
        self.breakers.restore_all(&snapshot.breakers);
        self.retries_used
            .store(snapshot.retries_used, Ordering::SeqCst);
        tracing::info!(run_id = %self.run_id, "state restored from checkpoint");
    }

    /// Wake the completion detector
    pub(crate) fn poke(&self) {
        self.activity.notify_waiters();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Park until resumed; returns immediately when shutting down
    pub(crate) async fn wait_resumed(&self) {
        while self.paused.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            tokio::select! {
                _ = self.pause_notify.notified() => {}
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    pub(crate) fn record_first_fault(&self, fault: &Fault) {
        let mut slot = self.first_fault.lock();
        if slot.is_none() {
            *slot = Some(fault.clone());
        }
    }

    pub(crate) fn route_event(&self, event: RouteEvent) -> usize {
        self.router
            .route(&event, &self.globals, self.compensating.load(Ordering::Acquire))
    }

    /// Aggregate progress over instantiated vertices
    pub(crate) fn publish_progress(&self) {
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        let mut running = 0;
        let mut duration_sum: u64 = 0;
        for entry in self.instances.iter() {
            match entry.status {
                InstanceStatus::Completed => {
                    completed += 1;
                    duration_sum += entry.duration_ms().unwrap_or(0);
                }
                InstanceStatus::Failed => failed += 1,
                InstanceStatus::Cancelled => cancelled += 1,
                InstanceStatus::Running | InstanceStatus::Pending => running += 1,
            }
        }
        let instantiated = completed + failed + cancelled + running;
        let terminal = completed + failed + cancelled;
        let percent_complete = if instantiated == 0 {
            0.0
        } else {
            terminal as f64 / instantiated as f64 * 100.0
        };
        let estimated_remaining_ms = if completed > 0 && running > 0 {
            Some(duration_sum / completed as u64 * running as u64)
        } else {
            None
        };
        self.events.publish(WorkflowEvent::Progress(ProgressUpdate {
            instantiated,
            completed,
            failed,
            cancelled,
            running,
            percent_complete,
            estimated_remaining_ms,
        }));
    }

    pub(crate) async fn save_checkpoint(&self) {
        if let Some(store) = &self.checkpoint_store {
            let snapshot = self.snapshot();
            if let Err(e) = store.save(&snapshot).await {
                tracing::warn!(run_id = %self.run_id, error = %e, "checkpoint save failed");
            }
        }
    }

    pub(crate) async fn finish(&self, status: WorkflowStatus) {
        {
            let mut current = self.status.write();
            if current.is_terminal() {
                return;
            }
            *current = status;
        }
        let event = match status {
            WorkflowStatus::Completed => WorkflowEvent::WorkflowCompleted { run_id: self.run_id },
            WorkflowStatus::Failed => WorkflowEvent::WorkflowFailed {
                run_id: self.run_id,
                fault: self
                    .first_fault()
                    .unwrap_or_else(|| Fault::new("unknown", "workflow failed")),
            },
            WorkflowStatus::Cancelled => {
                WorkflowEvent::WorkflowCancelled { run_id: self.run_id }
            }
            other => {
                tracing::error!(?other, "finish called with non-terminal status");
                return;
            }
        };
        tracing::info!(run_id = %self.run_id, ?status, "workflow finished");
        self.events.publish(event);
        self.save_checkpoint().await;
        let _ = self.verdict_tx.send(Some(status));
        self.shutdown.cancel();
    }
}

/// Handle returned by [`WorkflowEngine::start`]
pub struct RunHandle {
    engine: Arc<WorkflowEngine>,
    verdict_rx: watch::Receiver<Option<WorkflowStatus>>,
}

impl RunHandle {
    /// The engine behind this run
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Wait for the terminal verdict
    pub async fn verdict(&mut self) -> WorkflowStatus {
        loop {
            if let Some(status) = *self.verdict_rx.borrow() {
                return status;
            }
            if self.verdict_rx.changed().await.is_err() {
                return self.engine.status();
            }
        }
    }
}
