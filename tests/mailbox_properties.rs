//! Concurrency properties of the mailbox: lease exclusivity under
//! contention and delivery accounting

mod common;

use flowgraph_engine::{CancelToken, Clock, Message, RetryPolicy, SystemClock, ValidatedGraph};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flowgraph_engine::mailbox::{DeadLetterQueue, Mailbox};

fn mailbox(capacity: usize, retry: RetryPolicy) -> Arc<Mailbox> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dlq = Arc::new(DeadLetterQueue::new(1000, clock.clone()));
    let tracker = flowgraph_engine::concurrency::CorrelationTracker::new();
    Arc::new(Mailbox::new(
        "shared",
        capacity,
        Duration::from_secs(30),
        retry,
        clock,
        dlq,
        tracker,
    ))
}

#[tokio::test]
async fn test_no_double_lease_under_contention() {
    let mailbox = mailbox(256, RetryPolicy::none());
    let cancel = CancelToken::new();

    const MESSAGES: usize = 100;
    for _ in 0..MESSAGES {
        mailbox.enqueue(Message::start());
    }

    let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let processed = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let mailbox = mailbox.clone();
        let cancel = cancel.clone();
        let held = held.clone();
        let processed = processed.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let Some(lease) = mailbox.lease(Some(Duration::from_millis(50)), &cancel).await
                else {
                    return;
                };
                {
                    let mut held = held.lock();
                    assert!(
                        held.insert(lease.seq),
                        "sequence {} leased twice concurrently",
                        lease.seq
                    );
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                {
                    held.lock().remove(&lease.seq);
                }
                assert!(mailbox.acknowledge(lease.lease_id));
                processed.lock().push(lease.seq);
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let processed = processed.lock();
    assert_eq!(processed.len(), MESSAGES, "every message processed once");
    let unique: HashSet<u64> = processed.iter().copied().collect();
    assert_eq!(unique.len(), MESSAGES);
}

#[tokio::test]
async fn test_retry_observation_bound() {
    // Property: a message is observed at most max_attempts + 1 times
    let mailbox = mailbox(8, RetryPolicy::fixed(0, 2));
    let cancel = CancelToken::new();
    mailbox.enqueue(Message::start());

    let mut observations = 0;
    while let Some(lease) = mailbox.lease(Some(Duration::from_millis(50)), &cancel).await {
        observations += 1;
        mailbox.requeue(lease.lease_id, "always-fails");
        assert!(observations <= 3, "observed more than max_attempts + 1 times");
    }
    assert_eq!(observations, 3);
}

#[tokio::test]
async fn test_single_consumer_sees_enqueue_order() {
    let mailbox = mailbox(64, RetryPolicy::none());
    let cancel = CancelToken::new();
    for _ in 0..10 {
        mailbox.enqueue(Message::start());
    }
    let mut seqs = Vec::new();
    while let Some(lease) = mailbox.lease(Some(Duration::ZERO), &cancel).await {
        seqs.push(lease.seq);
        mailbox.acknowledge(lease.lease_id);
    }
    assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_reachability_matches_instantiation() {
    // The validator's reachable set names exactly the vertices a complete
    // run instantiates
    use crate::common::*;
    use flowgraph_engine::{EdgeDescriptor, EngineBuilder, Graph, TriggerKind, WorkflowStatus};

    let factory = factory_with_noop();
    let graph = Graph::new("reach")
        .vertex(task("a", "noop"))
        .vertex(task("b", "noop"))
        .vertex(task("dead", "noop"))
        .edge(EdgeDescriptor::new("a", "b"))
        .edge(EdgeDescriptor::new("b", "dead").with_triggers([TriggerKind::Fail]));
    let mut graph = graph;
    graph.entry_vertex = Some("a".to_string());

    let validated = ValidatedGraph::validate(graph).unwrap();
    let reachable = validated.reachable();
    assert!(reachable.contains("dead"), "statically reachable via Fail edge");

    let engine = EngineBuilder::new(validated).factory(factory).build().unwrap();
    let mut handle = engine.start().unwrap();
    assert_eq!(handle.verdict().await, WorkflowStatus::Completed);

    let instantiated: HashSet<String> = engine
        .instances()
        .into_iter()
        .map(|i| i.vertex_id)
        .collect();
    assert_eq!(
        instantiated,
        HashSet::from(["a".to_string(), "b".to_string()])
    );
}
