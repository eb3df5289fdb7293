//! Cancellation liveness, pause/resume, and checkpoint restore

mod common;

use common::*;
use flowgraph_engine::{
    CheckpointStore, DefaultVertexFactory, EngineBuilder, EngineOptions, ExecuteOutcome, Graph,
    InstanceStatus, MemoryCheckpointStore, RetryPolicy, TaskCall, ValidatedGraph, WorkflowError,
    WorkflowStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
#[serial_test::serial]
async fn test_cancel_interrupts_cooperative_task() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    factory.register(
        "cooperative",
        Arc::new(|call: TaskCall| {
            Box::pin(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(ExecuteOutcome::empty()),
                    _ = call.cancel.cancelled() => Err(WorkflowError::Cancelled),
                }
            })
        }),
    );

    let graph = Graph::new("cancellable").vertex(task("v", "cooperative"));
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled_at = Instant::now();
    engine.cancel();

    assert_eq!(handle.verdict().await, WorkflowStatus::Cancelled);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(2),
        "verdict took {:?}",
        cancelled_at.elapsed()
    );
    let instances = engine.instances_for("v");
    assert_eq!(instances[0].status, InstanceStatus::Cancelled);
}

#[tokio::test]
#[serial_test::serial]
async fn test_cancel_bounds_uncooperative_task_by_timeout() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    factory.register(
        "stubborn",
        Arc::new(|_call: TaskCall| {
            Box::pin(async move {
                // Ignores its cancellation token entirely
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ExecuteOutcome::empty())
            })
        }),
    );

    let graph = Graph::new("stubborn-run").vertex(task("v", "stubborn"));
    let options = EngineOptions {
        per_call_timeout: Duration::from_millis(200),
        ..EngineOptions::default()
    };
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .options(options)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled_at = Instant::now();
    engine.cancel();

    // Control returns within the per-call timeout plus a small constant
    assert_eq!(handle.verdict().await, WorkflowStatus::Cancelled);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "verdict took {:?}",
        cancelled_at.elapsed()
    );
}

#[tokio::test]
async fn test_cancel_drains_pending_messages() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    factory.register(
        "slow",
        Arc::new(|call: TaskCall| {
            Box::pin(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(ExecuteOutcome::empty()),
                    _ = call.cancel.cancelled() => Err(WorkflowError::Cancelled),
                }
            })
        }),
    );
    factory.register_fn("noop", |_call: TaskCall| Ok(ExecuteOutcome::empty()));

    // The slow entry blocks while its downstream never gets to run
    let graph = chain("draining", vec![task("a", "slow"), task("b", "noop")]);
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel();
    assert_eq!(handle.verdict().await, WorkflowStatus::Cancelled);
    assert!(engine.instances_for("b").is_empty());
}

#[tokio::test]
async fn test_workflow_timeout_cancels_run() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    factory.register(
        "forever",
        Arc::new(|call: TaskCall| {
            Box::pin(async move {
                call.cancel.cancelled().await;
                Err(WorkflowError::Cancelled)
            })
        }),
    );

    let graph = Graph::new("deadline").vertex(task("v", "forever"));
    let options = EngineOptions {
        workflow_timeout: Some(Duration::from_millis(150)),
        ..EngineOptions::default()
    };
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .options(options)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert_eq!(handle.verdict().await, WorkflowStatus::Cancelled);
}

#[tokio::test]
#[serial_test::serial]
async fn test_pause_then_resume_in_place() {
    init_tracing();
    let factory = Arc::new(DefaultVertexFactory::new());
    let executed = Arc::new(AtomicUsize::new(0));
    {
        let executed = executed.clone();
        factory.register(
            "step",
            Arc::new(move |_call: TaskCall| {
                let executed = executed.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(ExecuteOutcome::empty())
                })
            }),
        );
    }

    let graph = chain(
        "pausable",
        (0..5).map(|i| task(&format!("s{}", i), "step")).collect(),
    );
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let snapshot = engine.pause().await.unwrap();
    assert_eq!(engine.status(), WorkflowStatus::Paused);
    assert_eq!(snapshot.status, WorkflowStatus::Paused);
    let done_at_pause = executed.load(Ordering::SeqCst);
    assert!(done_at_pause < 5, "pause landed mid-run");

    // No progress while paused
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(executed.load(Ordering::SeqCst), done_at_pause);

    engine.resume().unwrap();
    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(executed.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_pause_rejected_when_disallowed() {
    let factory = factory_with_noop();
    let graph = Graph::new("strict").vertex(task("a", "noop"));
    let options = EngineOptions {
        allow_pause: false,
        ..EngineOptions::default()
    };
    let engine = EngineBuilder::new(ValidatedGraph::validate(graph).unwrap())
        .factory(factory)
        .options(options)
        .build()
        .unwrap();
    let mut handle = engine.start().unwrap();

    assert!(matches!(
        engine.pause().await,
        Err(WorkflowError::PauseNotAllowed)
    ));
    handle.verdict().await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_checkpoint_restore_resumes_pending_work() {
    init_tracing();
    let store = Arc::new(MemoryCheckpointStore::new());

    // "a" succeeds and stamps globals; "b" fails while the first engine
    // runs, then succeeds in the restored engine
    let build_factory = |b_succeeds: bool| {
        let factory = Arc::new(DefaultVertexFactory::new());
        factory.register_fn("stamp", |call: TaskCall| {
            call.globals.set("a_ran", json!(true));
            Ok(ExecuteOutcome::empty())
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        factory.register_fn("flaky_b", move |_call: TaskCall| {
            counter.fetch_add(1, Ordering::SeqCst);
            if b_succeeds {
                Ok(ExecuteOutcome::empty())
            } else {
                Err(WorkflowError::Task {
                    fault: flowgraph_engine::Fault::new("transient", "not yet"),
                })
            }
        });
        (factory, calls)
    };

    let graph = || {
        let mut b = task("b", "flaky_b");
        // Long enough that the pause lands while the envelope is parked
        b.retry = Some(RetryPolicy::fixed(500, 5));
        chain("restorable", vec![task("a", "stamp"), b])
    };

    let (first_factory, _) = build_factory(false);
    let first = EngineBuilder::new(ValidatedGraph::validate(graph()).unwrap())
        .factory(first_factory)
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    let mut events = first.subscribe();
    let _handle = first.start().unwrap();

    // Wait for b's first failed attempt to be requeued
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match events.try_recv() {
            Ok(flowgraph_engine::WorkflowEvent::NodeFailed {
                will_retry: true, ..
            }) => break,
            _ => {
                assert!(Instant::now() < deadline, "b never failed");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    let snapshot = first.pause().await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Paused);
    assert_eq!(snapshot.mailboxes.get("b").map(|m| m.len()), Some(1));

    assert_eq!(store.list_incomplete().await.unwrap(), vec![first.run_id()]);
    let reloaded = store.load(first.run_id()).await.unwrap().unwrap();

    // Restored engine picks up the parked envelope; the handler now
    // succeeds, and the already-completed "a" is not re-executed
    let (second_factory, b_calls) = build_factory(true);
    let second = EngineBuilder::new(ValidatedGraph::validate(graph()).unwrap())
        .factory(second_factory)
        .checkpoint_store(store.clone())
        .from_snapshot(reloaded)
        .build()
        .unwrap();
    assert_eq!(second.run_id(), first.run_id());
    assert_eq!(second.globals().get("a_ran"), Some(json!(true)));

    let mut handle = second.start().unwrap();
    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.instances_for("a").len(), 1, "a restored, not re-run");
    assert_eq!(
        second.instances_for("b").len(),
        1,
        "b executed once after restore"
    );
    // The terminal snapshot saved at finish clears the incomplete list
    assert!(store.list_incomplete().await.unwrap().is_empty());
}
