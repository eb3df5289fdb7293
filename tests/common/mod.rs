//! Shared fixtures for the integration suites

#![allow(dead_code)]

use flowgraph_engine::{
    Bag, DefaultVertexFactory, EdgeDescriptor, ExecuteOutcome, Graph, TaskCall, VertexDescriptor,
    VertexKind, WorkflowError, WorkflowResult,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Initialize tracing once per process; safe to call from every test
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// User-task descriptor bound to a registered handler name
pub fn task(id: &str, handler: &str) -> VertexDescriptor {
    let mut vertex = VertexDescriptor::new(id, id, VertexKind::UserTask);
    vertex.config.insert("handler".to_string(), json!(handler));
    vertex
}

/// Branch descriptor with a condition expression
pub fn branch(id: &str, condition: &str) -> VertexDescriptor {
    let mut vertex = VertexDescriptor::new(id, id, VertexKind::Branch);
    vertex
        .config
        .insert("condition".to_string(), json!(condition));
    vertex
}

/// Factory with a "noop" handler pre-registered
pub fn factory_with_noop() -> Arc<DefaultVertexFactory> {
    let factory = Arc::new(DefaultVertexFactory::new());
    factory.register_fn("noop", |_call: TaskCall| Ok(ExecuteOutcome::empty()));
    factory
}

/// Handler that returns a constant output bag
pub fn register_constant(factory: &DefaultVertexFactory, name: &str, key: &str, value: i64) {
    let key = key.to_string();
    factory.register_fn(name, move |_call: TaskCall| {
        let mut output = Bag::new();
        output.insert(key.clone(), json!(value));
        Ok(ExecuteOutcome::with_output(output))
    });
}

/// Handler that counts invocations and fails with the given kind until
/// `succeed_from` (1-based attempt number) is reached
pub fn register_flaky(
    factory: &DefaultVertexFactory,
    name: &str,
    kind: &str,
    succeed_from: usize,
) -> Arc<AtomicUsize> {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let kind = kind.to_string();
    factory.register_fn(name, move |_call: TaskCall| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt >= succeed_from {
            Ok(ExecuteOutcome::empty())
        } else {
            Err(WorkflowError::Task {
                fault: flowgraph_engine::Fault::new(kind.clone(), format!("attempt {}", attempt)),
            })
        }
    });
    attempts
}

/// Linear chain graph over pre-built vertices
pub fn chain(id: &str, vertices: Vec<VertexDescriptor>) -> Graph {
    let mut graph = Graph::new(id);
    let ids: Vec<String> = vertices.iter().map(|v| v.id.clone()).collect();
    for vertex in vertices {
        graph = graph.vertex(vertex);
    }
    for pair in ids.windows(2) {
        graph = graph.edge(EdgeDescriptor::new(pair[0].clone(), pair[1].clone()));
    }
    graph
}

/// Drain every event currently buffered on a receiver
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<flowgraph_engine::WorkflowEvent>,
) -> Vec<flowgraph_engine::WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A handler whose result type helps type inference in closures
pub type HandlerResult = WorkflowResult<ExecuteOutcome>;
