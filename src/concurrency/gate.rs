//! Priority-ordered concurrency gate
//!
//! Admission control for workers: FIFO within a priority class, classes
//! drained High then Normal then Low when a slot frees. Capacity 0 encodes
//! "unbounded" and performs no counting at all. The workflow-wide gate and
//! the per-vertex-type gates are both instances of this type; workers
//! acquire workflow first, kind second, and release in reverse order.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::concurrency::CancelToken;
use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::Priority;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct GateInner {
    available: usize,
    next_waiter_id: u64,
    /// One FIFO queue per priority class, high first
    queues: [VecDeque<Waiter>; 3],
}

/// Counting gate with priority-classed FIFO waiters
pub struct PriorityGate {
    name: String,
    /// 0 = unbounded
    capacity: usize,
    inner: Mutex<GateInner>,
}

impl PriorityGate {
    /// Create a gate; capacity 0 admits everyone without counting
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(GateInner {
                available: capacity,
                next_waiter_id: 0,
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            }),
        })
    }

    /// Gate name, for logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured capacity; 0 = unbounded
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free slots; meaningless for unbounded gates
    pub fn available(&self) -> usize {
        self.inner.lock().available
    }

    /// Acquire a slot, waiting behind earlier arrivals of the same or
    /// higher priority. Cancellation during the wait returns
    /// [`WorkflowError::Cancelled`] without leaking the slot.
    pub async fn acquire(
        self: &Arc<Self>,
        priority: Priority,
        cancel: &CancelToken,
    ) -> WorkflowResult<GatePermit> {
        if self.capacity == 0 {
            return Ok(GatePermit { gate: None });
        }
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        let (waiter_id, mut rx) = {
            let mut inner = self.inner.lock();
            if inner.available > 0 {
                inner.available -= 1;
                return Ok(GatePermit {
                    gate: Some(self.clone()),
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.queues[priority.index()].push_back(Waiter { id, tx });
            (id, rx)
        };

        tokio::select! {
            granted = &mut rx => match granted {
                Ok(()) => Ok(GatePermit { gate: Some(self.clone()) }),
                Err(_) => Err(WorkflowError::Internal(format!(
                    "gate '{}' dropped a waiter", self.name
                ))),
            },
            _ = cancel.cancelled() => {
                let removed = {
                    let mut inner = self.inner.lock();
                    let queue = &mut inner.queues[priority.index()];
                    let before = queue.len();
                    queue.retain(|w| w.id != waiter_id);
                    queue.len() != before
                };
                // A grant may have raced the cancellation; pass it on
                if !removed && rx.try_recv().is_ok() {
                    self.release();
                }
                Err(WorkflowError::Cancelled)
            }
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        for queue in inner.queues.iter_mut() {
            while let Some(waiter) = queue.pop_front() {
                if waiter.tx.send(()).is_ok() {
                    return;
                }
                // Receiver gone (cancelled waiter); hand the slot onward
            }
        }
        inner.available = (inner.available + 1).min(self.capacity);
    }
}

/// RAII slot; dropping releases the gate
pub struct GatePermit {
    gate: Option<Arc<PriorityGate>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unbounded_gate_never_blocks() {
        let gate = PriorityGate::new("wf", 0);
        let cancel = CancelToken::new();
        for _ in 0..64 {
            let permit = gate.acquire(Priority::Normal, &cancel).await.unwrap();
            std::mem::forget(permit);
        }
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let gate = PriorityGate::new("wf", 2);
        let cancel = CancelToken::new();
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let max_in_flight = max_in_flight.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(Priority::Normal, &cancel).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_high_priority_admitted_first() {
        let gate = PriorityGate::new("wf", 1);
        let cancel = CancelToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let holder = gate.acquire(Priority::Normal, &cancel).await.unwrap();

        let mut handles = Vec::new();
        for (priority, label) in [(Priority::Low, "low"), (Priority::High, "high")] {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(priority, &cancel).await.unwrap();
                order.lock().push(label);
            }));
            // Deterministic enqueue order: low first, then high
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(holder);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_slot() {
        let gate = PriorityGate::new("wf", 1);
        let cancel = CancelToken::new();
        let holder = gate.acquire(Priority::Normal, &cancel).await.unwrap();

        let waiter_cancel = CancelToken::new();
        let waiter = {
            let gate = gate.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { gate.acquire(Priority::Normal, &waiter_cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(WorkflowError::Cancelled)
        ));

        drop(holder);
        // Slot must be reusable after the cancelled wait
        let _permit = gate.acquire(Priority::Normal, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_within_class() {
        let gate = PriorityGate::new("wf", 1);
        let cancel = CancelToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let holder = gate.acquire(Priority::Normal, &cancel).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(Priority::Normal, &cancel).await.unwrap();
                order.lock().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(holder);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
