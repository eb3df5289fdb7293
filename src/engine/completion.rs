//! Completion detection and verdict
//!
//! The run is done when every created instance is terminal, no mailbox
//! holds a Ready or Leased envelope, and no worker is between lease and
//! route. Verdict precedence: cancellation, then failure (after a
//! best-effort compensation walk when one is configured), then completion.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{compensation, WorkflowEngine};
use crate::instance::{InstanceStatus, WorkflowStatus};

/// Poll fallback so a missed poke can never wedge verdict detection
const TICK: Duration = Duration::from_millis(20);

pub(crate) async fn completion_loop(engine: Arc<WorkflowEngine>) {
    let deadline = engine
        .options
        .workflow_timeout
        .map(|t| tokio::time::Instant::now() + t);

    loop {
        tokio::select! {
            _ = engine.activity.notified() => {}
            _ = tokio::time::sleep(TICK) => {}
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline && !engine.cancel_root.is_cancelled() {
                tracing::warn!(run_id = %engine.run_id(), "workflow timeout elapsed");
                engine.cancel_root.cancel();
            }
        }

        if engine.cancel_root.is_cancelled() {
            if engine.active.load(Ordering::SeqCst) != 0 {
                continue;
            }
            let mut drained = 0;
            for mailbox in engine.mailboxes.values() {
                drained += mailbox.drain();
            }
            if drained > 0 {
                tracing::debug!(drained, "drained mailboxes on cancellation");
            }
            engine.finish(WorkflowStatus::Cancelled).await;
            return;
        }

        if engine.is_paused() {
            continue;
        }

        if engine.active.load(Ordering::SeqCst) != 0 {
            continue;
        }
        let pending: usize = engine.mailboxes.values().map(|m| m.pending()).sum();
        if pending != 0 {
            continue;
        }
        if engine
            .instances
            .iter()
            .any(|entry| !entry.status.is_terminal())
        {
            continue;
        }

        let any_failed = engine
            .instances
            .iter()
            .any(|entry| entry.status == InstanceStatus::Failed);
        if any_failed {
            if !engine.compensation_done.swap(true, Ordering::SeqCst) {
                // Flag first: events produced by compensation vertices must
                // already see the compensation edge table
                engine.compensating.store(true, Ordering::Release);
                let enqueued = compensation::run_walk(&engine);
                if enqueued > 0 {
                    tracing::info!(enqueued, "compensation walk started");
                    continue;
                }
                engine.compensating.store(false, Ordering::Release);
            }
            engine.finish(WorkflowStatus::Failed).await;
            return;
        }

        engine.finish(WorkflowStatus::Completed).await;
        return;
    }
}
