//! End-to-end scenarios: sequencing, branching, loops, fan-out, and
//! concurrency limits

mod common;

use common::*;
use flowgraph_engine::{
    Bag, DefaultVertexFactory, EdgeDescriptor, EngineBuilder, ExecuteOutcome, Globals, Graph,
    InstanceStatus, TaskCall, TriggerKind, ValidatedGraph, VertexDescriptor, VertexKind,
    WorkflowError, WorkflowEvent, WorkflowStatus,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_sequential_three_vertices() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    register_constant(&factory, "write_x", "x", 1);
    register_constant(&factory, "write_y", "y", 2);
    register_constant(&factory, "write_z", "z", 3);

    let graph = chain(
        "seq",
        vec![task("a", "write_x"), task("b", "write_y"), task("c", "write_z")],
    );
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert!(engine.globals().is_empty());
    for vertex in ["a", "b", "c"] {
        let instances = engine.instances_for(vertex);
        assert_eq!(instances.len(), 1, "vertex {}", vertex);
        assert_eq!(instances[0].status, InstanceStatus::Completed);
    }

    let order: Vec<String> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            WorkflowEvent::WorkflowStarted { .. } => Some("started".to_string()),
            WorkflowEvent::NodeStarted { vertex_id, .. } => Some(format!("ns:{}", vertex_id)),
            WorkflowEvent::NodeCompleted { vertex_id, .. } => Some(format!("nc:{}", vertex_id)),
            WorkflowEvent::WorkflowCompleted { .. } => Some("completed".to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        vec![
            "started", "ns:a", "nc:a", "ns:b", "nc:b", "ns:c", "nc:c", "completed"
        ]
    );
}

#[tokio::test]
async fn test_branch_routes_true_port_only() {
    init_tracing();
    let factory = factory_with_noop();
    factory.register_fn("seed", |call: TaskCall| {
        call.globals.set("x", json!(10));
        Ok(ExecuteOutcome::empty())
    });

    let graph = Graph::new("branching")
        .vertex(task("setup", "seed"))
        .vertex(branch("decide", "globals.x > 5"))
        .vertex(task("t", "noop"))
        .vertex(task("f", "noop"))
        .edge(EdgeDescriptor::new("setup", "decide"))
        .edge(EdgeDescriptor::new("decide", "t").with_source_port("TrueBranch"))
        .edge(EdgeDescriptor::new("decide", "f").with_source_port("FalseBranch"));

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(engine.instances_for("t").len(), 1);
    assert!(engine.instances_for("f").is_empty());
    let decide = engine.instances_for("decide");
    assert_eq!(decide[0].chosen_port.as_deref(), Some("TrueBranch"));
    assert_eq!(decide[0].output.get("BranchTaken"), Some(&json!("TrueBranch")));
}

#[tokio::test]
async fn test_foreach_fans_out_in_order() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        factory.register_fn("collect", move |call: TaskCall| {
            received
                .lock()
                .push(call.input.get("item").cloned().unwrap_or(json!(null)));
            Ok(ExecuteOutcome::empty())
        });
    }

    let mut foreach = VertexDescriptor::new("fanout", "fanout", VertexKind::Foreach);
    foreach
        .config
        .insert("items".to_string(), json!(["a", "b", "c"]));
    foreach.config.insert("item_var".to_string(), json!("item"));

    let graph = Graph::new("foreach")
        .vertex(foreach)
        .vertex(task("d", "collect"))
        .edge(EdgeDescriptor::new("fanout", "d").with_triggers([TriggerKind::Next]));

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(*received.lock(), vec![json!("a"), json!("b"), json!("c")]);
    assert_eq!(engine.instances_for("d").len(), 3);
    let fanout = engine.instances_for("fanout");
    assert_eq!(fanout[0].status, InstanceStatus::Completed);
    assert_eq!(fanout[0].output.get("Count"), Some(&json!(3)));

    let iteration_events = drain_events(&mut events)
        .into_iter()
        .filter(|event| matches!(event, WorkflowEvent::NodeProgress { vertex_id, .. } if vertex_id == "fanout"))
        .count();
    assert_eq!(iteration_events, 3);
}

#[tokio::test]
async fn test_while_loop_observes_body_effects() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    factory.register_fn("increment", |call: TaskCall| {
        let current = call
            .globals
            .get("counter")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        call.globals.set("counter", json!(current + 1));
        Ok(ExecuteOutcome::empty())
    });

    let mut while_vertex = VertexDescriptor::new("loop", "loop", VertexKind::WhileLoop);
    while_vertex
        .config
        .insert("condition".to_string(), json!("globals.counter < 3"));

    let globals = Globals::new();
    globals.set("counter", json!(0));

    let graph = Graph::new("while")
        .vertex(while_vertex)
        .vertex(task("body", "increment"))
        .edge(EdgeDescriptor::new("loop", "body").with_triggers([TriggerKind::Next]));

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .globals(globals.clone())
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(globals.get("counter"), Some(json!(3)));
    assert_eq!(engine.instances_for("body").len(), 3);
    let loop_instance = &engine.instances_for("loop")[0];
    assert_eq!(loop_instance.output.get("Iterations"), Some(&json!(3)));
}

#[tokio::test]
async fn test_cycle_validation_rejects_before_start() {
    let graph = Graph::new("cyclic")
        .vertex(task("a", "noop"))
        .vertex(task("b", "noop"))
        .edge(EdgeDescriptor::new("a", "b"))
        .edge(EdgeDescriptor::new("b", "a"));

    let err = ValidatedGraph::validate(graph).unwrap_err();
    match err {
        WorkflowError::Validation { reason } => {
            assert!(reason.contains("cycle"));
            assert!(reason.contains('a'));
            assert!(reason.contains('b'));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_workflow_concurrency_cap() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        factory.register(
            "slow",
            Arc::new(move |_call: TaskCall| {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(ExecuteOutcome::empty())
                })
            }),
        );
    }

    let mut graph = Graph::new("capped");
    for i in 0..5 {
        graph = graph.vertex(task(&format!("v{}", i), "slow"));
    }
    graph.max_concurrency = 2;

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(engine.instances().len(), 5);
    assert!(
        max_in_flight.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent executions",
        max_in_flight.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_switch_routes_matching_case() {
    init_tracing();
    let factory = factory_with_noop();
    factory.register_fn("seed_tier", |call: TaskCall| {
        call.globals.set("tier", json!("gold"));
        Ok(ExecuteOutcome::empty())
    });

    let mut switch = VertexDescriptor::new("route", "route", VertexKind::Switch);
    switch
        .config
        .insert("expression".to_string(), json!("globals.tier"));
    switch.config.insert(
        "cases".to_string(),
        json!({"gold": "Premium", "silver": ""}),
    );

    let graph = Graph::new("switching")
        .vertex(task("setup", "seed_tier"))
        .vertex(switch)
        .vertex(task("premium", "noop"))
        .vertex(task("standard", "noop"))
        .edge(EdgeDescriptor::new("setup", "route"))
        .edge(EdgeDescriptor::new("route", "premium").with_source_port("Premium"))
        .edge(EdgeDescriptor::new("route", "standard").with_source_port("Default"));

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(engine.instances_for("premium").len(), 1);
    assert!(engine.instances_for("standard").is_empty());
}

#[tokio::test]
async fn test_unreached_vertices_are_not_failures() {
    init_tracing();
    let factory = factory_with_noop();

    // "orphan" has an inbound edge gated on Fail, which never fires
    let graph = Graph::new("partial")
        .vertex(task("a", "noop"))
        .vertex(task("orphan", "noop"))
        .edge(EdgeDescriptor::new("a", "orphan").with_triggers([TriggerKind::Fail]));

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert!(engine.instances_for("orphan").is_empty());
}

#[tokio::test]
async fn test_guard_failure_dead_letters_without_failing_run() {
    init_tracing();
    let factory = factory_with_noop();

    let graph = Graph::new("guarded")
        .vertex(task("a", "noop"))
        .vertex(task("b", "noop"))
        .vertex(task("c", "noop"))
        .edge(EdgeDescriptor::new("a", "b").with_guard("output.x +"))
        .edge(EdgeDescriptor::new("a", "c"));

    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert!(engine.instances_for("b").is_empty());
    assert_eq!(engine.instances_for("c").len(), 1);
    let guard_entries: Vec<_> = engine
        .dead_letters()
        .into_iter()
        .filter(|entry| entry.reason == "guard-eval-failed")
        .collect();
    assert_eq!(guard_entries.len(), 1);
}

#[tokio::test]
async fn test_globals_seeded_through_builder() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    let seen = Arc::new(Mutex::new(None::<serde_json::Value>));
    {
        let seen = seen.clone();
        factory.register_fn("observe", move |call: TaskCall| {
            *seen.lock() = call.globals.get("mode");
            Ok(ExecuteOutcome::empty())
        });
    }

    let globals = Globals::new();
    globals.set("mode", json!("fast"));
    let graph = Graph::new("seeded").vertex(task("only", "observe"));
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .globals(globals)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(*seen.lock(), Some(json!("fast")));
}

#[tokio::test]
async fn test_bag_values_flow_downstream() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    register_constant(&factory, "produce", "x", 41);
    let seen = Arc::new(Mutex::new(None::<i64>));
    {
        let seen = seen.clone();
        factory.register_fn("consume", move |call: TaskCall| {
            *seen.lock() = call.input.get("x").and_then(|v| v.as_i64());
            let mut output = Bag::new();
            output.insert("y".to_string(), json!(1));
            Ok(ExecuteOutcome::with_output(output))
        });
    }

    let graph = chain("bags", vec![task("p", "produce"), task("c", "consume")]);
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(*seen.lock(), Some(41));
}
