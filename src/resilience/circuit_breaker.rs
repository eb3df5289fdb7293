//! Circuit breaker keyed on vertex kind
//!
//! One breaker is shared by every vertex of a kind within a run. State
//! transitions follow the classic three-state machine: Closed trips Open
//! when the failure rate over the last `minimum_throughput` calls reaches
//! the threshold; Open cools down into HalfOpen; HalfOpen admits one probe
//! at a time and closes after enough consecutive successes.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::clock::Clock;

/// Breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Failure-rate threshold in [0, 1] that trips the breaker
    pub failure_threshold: f64,
    /// Minimum window size before the rate is meaningful
    pub minimum_throughput: u32,
    /// How long the breaker stays Open before probing
    pub open_duration_ms: u64,
    /// Consecutive half-open successes needed to close
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            minimum_throughput: 10,
            open_duration_ms: 30_000,
            half_open_successes: 2,
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting calls
    Open,
    /// Probing recovery with single admissions
    HalfOpen,
}

/// Outcome of asking the breaker for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed; `probe` marks a half-open trial call
    Allowed {
        /// True when this call is the single half-open probe
        probe: bool,
    },
    /// The breaker is open (or the probe slot is taken)
    Rejected,
}

/// A state transition, surfaced on the event stream by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
}

/// Serializable breaker state for checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Recent call outcomes, true = failure
    pub window: Vec<bool>,
    /// Consecutive half-open successes so far
    pub half_open_streak: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: CircuitState,
    /// Recent outcomes, true = failure, capped at `minimum_throughput`
    window: VecDeque<bool>,
    opened_at: Option<DateTime<Utc>>,
    half_open_streak: u32,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
}

/// Circuit breaker for one vertex kind
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(policy: CircuitBreakerPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_streak: 0,
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
            }),
        }
    }

    /// Ask for admission; may transition Open -> HalfOpen when the cooldown
    /// has elapsed
    pub fn try_acquire(&self) -> (Admission, Option<Transition>) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => (Admission::Allowed { probe: false }, None),
            CircuitState::Open => {
                let cooled = inner.opened_at.map_or(true, |at| {
                    self.clock.now() - at
                        >= ChronoDuration::milliseconds(self.policy.open_duration_ms as i64)
                });
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_streak = 0;
                    inner.probe_in_flight = true;
                    (
                        Admission::Allowed { probe: true },
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    )
                } else {
                    (Admission::Rejected, None)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    (Admission::Rejected, None)
                } else {
                    inner.probe_in_flight = true;
                    (Admission::Allowed { probe: true }, None)
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        match inner.state {
            CircuitState::Closed => {
                push_outcome(&mut inner.window, false, self.policy.minimum_throughput);
                None
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_streak += 1;
                if inner.half_open_streak >= self.policy.half_open_successes {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.half_open_streak = 0;
                    inner.opened_at = None;
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                    })
                } else {
                    None
                }
            }
            // Late success from a call admitted before the trip
            CircuitState::Open => None,
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                push_outcome(&mut inner.window, true, self.policy.minimum_throughput);
                if inner.window.len() >= self.policy.minimum_throughput as usize {
                    let failures = inner.window.iter().filter(|&&f| f).count();
                    let rate = failures as f64 / inner.window.len() as f64;
                    if rate >= self.policy.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(self.clock.now());
                        tracing::warn!(rate, "circuit breaker opened");
                        return Some(Transition {
                            from: CircuitState::Closed,
                            to: CircuitState::Open,
                        });
                    }
                }
                None
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_streak = 0;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Lifetime call/failure counters
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.total_calls, inner.total_failures)
    }

    /// Serializable state for checkpointing
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            window: inner.window.iter().copied().collect(),
            half_open_streak: inner.half_open_streak,
            opened_at: inner.opened_at,
        }
    }

    /// Restore from a checkpoint snapshot
    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut inner = self.inner.lock();
        inner.state = snapshot.state;
        inner.window = snapshot.window.iter().copied().collect();
        inner.half_open_streak = snapshot.half_open_streak;
        inner.opened_at = snapshot.opened_at;
        inner.probe_in_flight = false;
    }
}

fn push_outcome(window: &mut VecDeque<bool>, failed: bool, cap: u32) {
    while window.len() >= cap.max(1) as usize {
        window.pop_front();
    }
    window.push_back(failed);
}

/// Registry of breakers keyed on vertex kind
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Register a breaker for a kind unless one already exists
    pub fn ensure(&self, kind: &str, policy: CircuitBreakerPolicy, clock: Arc<dyn Clock>) {
        self.breakers
            .entry(kind.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(policy, clock)));
    }

    /// Breaker for a kind, if any vertex of that kind configured one
    pub fn get(&self, kind: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(kind).map(|entry| entry.clone())
    }

    /// Snapshot every breaker for checkpointing
    pub fn snapshot_all(&self) -> std::collections::HashMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Restore breaker states from a checkpoint
    pub fn restore_all(&self, snapshots: &std::collections::HashMap<String, BreakerSnapshot>) {
        for (kind, snapshot) in snapshots {
            if let Some(breaker) = self.get(kind) {
                breaker.restore(snapshot);
            }
        }
    }
}
