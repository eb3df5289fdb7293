//! Observable event stream
//!
//! Fan-out broadcast with non-blocking send: subscribers that fall behind
//! lose the oldest events rather than slowing the engine. Dropping the
//! engine (the last sender) completes every subscriber's stream.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::message::Fault;
use crate::resilience::CircuitState;

/// Aggregate run progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Vertex instances created so far
    pub instantiated: usize,
    /// Instances that completed
    pub completed: usize,
    /// Instances that failed terminally
    pub failed: usize,
    /// Instances cancelled
    pub cancelled: usize,
    /// Instances currently running
    pub running: usize,
    /// Terminal share of instantiated instances, 0..=100
    pub percent_complete: f64,
    /// Rough remaining time from the mean completed duration
    pub estimated_remaining_ms: Option<u64>,
}

/// Events published during a run
#[derive(Debug, Clone, Serialize)]
pub enum WorkflowEvent {
    /// The run started and entry vertices were triggered
    WorkflowStarted {
        /// Run id
        run_id: Uuid,
        /// Graph id
        graph_id: String,
    },
    /// Every reachable vertex finished successfully
    WorkflowCompleted {
        /// Run id
        run_id: Uuid,
    },
    /// The run failed; carries the first vertex-level failure
    WorkflowFailed {
        /// Run id
        run_id: Uuid,
        /// Authoritative failure
        fault: Fault,
    },
    /// The run was cancelled
    WorkflowCancelled {
        /// Run id
        run_id: Uuid,
    },
    /// The run reached a paused checkpoint
    WorkflowPaused {
        /// Run id
        run_id: Uuid,
    },
    /// A vertex instance began executing
    NodeStarted {
        /// Vertex id
        vertex_id: String,
        /// Instance id
        instance_id: Uuid,
    },
    /// A vertex instance completed
    NodeCompleted {
        /// Vertex id
        vertex_id: String,
        /// Instance id
        instance_id: Uuid,
        /// Wall-clock execution time
        duration_ms: u64,
    },
    /// A vertex execution failed; `will_retry` marks a scheduled retry
    NodeFailed {
        /// Vertex id
        vertex_id: String,
        /// Instance id
        instance_id: Uuid,
        /// Failure descriptor
        fault: Fault,
        /// True when the envelope was requeued for another attempt
        will_retry: bool,
    },
    /// A vertex instance observed cancellation
    NodeCancelled {
        /// Vertex id
        vertex_id: String,
        /// Instance id
        instance_id: Uuid,
    },
    /// Mid-execution progress detail from a vertex (e.g. loop iterations)
    NodeProgress {
        /// Vertex id
        vertex_id: String,
        /// Free-form detail
        detail: String,
    },
    /// A circuit breaker changed state
    BreakerTransition {
        /// Vertex kind the breaker guards
        kind: String,
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// Coarse aggregate progress
    Progress(ProgressUpdate),
}

/// Broadcast bus for workflow events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Bus with a bounded per-subscriber backlog
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe; the receiver sees events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Publish without blocking; a send with no subscribers is fine
    pub fn publish(&self, event: WorkflowEvent) {
        tracing::trace!(?event, "workflow event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::WorkflowStarted {
            run_id: Uuid::new_v4(),
            graph_id: "g".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WorkflowEvent::WorkflowStarted { .. }));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::WorkflowCancelled {
            run_id: Uuid::new_v4(),
        });
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(WorkflowEvent::WorkflowCompleted {
                run_id: Uuid::new_v4(),
            });
        }
        // The first recv reports the lag, subsequent ones drain the tail
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_completes_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        drop(bus);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
