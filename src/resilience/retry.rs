//! Retry policy with backoff and jitter

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Backoff strategy between retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum Backoff {
    /// No delay between retries
    None,
    /// Constant delay
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Delay grows linearly with the retry count
    Linear {
        /// First-retry delay in milliseconds
        initial_ms: u64,
        /// Delay ceiling in milliseconds
        max_ms: u64,
    },
    /// Delay multiplies with each retry
    Exponential {
        /// First-retry delay in milliseconds
        initial_ms: u64,
        /// Growth factor per retry
        multiplier: f64,
        /// Delay ceiling in milliseconds
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::None
    }
}

/// Retry policy for a vertex
///
/// `max_attempts` is an inclusive cap on the retry count: a message is
/// observed at most `max_attempts + 1` times before it dead-letters.
/// `retry_on`/`do_not_retry_on` match fault-kind discriminators, not type
/// names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy
    #[serde(default)]
    pub backoff: Backoff,
    /// Inclusive retry cap
    #[serde(default)]
    pub max_attempts: u32,
    /// When non-empty, only these fault kinds are retried
    #[serde(default)]
    pub retry_on: BTreeSet<String>,
    /// These fault kinds are never retried
    #[serde(default)]
    pub do_not_retry_on: BTreeSet<String>,
    /// Cap on total retries across the entire run
    #[serde(default)]
    pub budget: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            backoff: Backoff::None,
            max_attempts: 0,
            retry_on: BTreeSet::new(),
            do_not_retry_on: BTreeSet::new(),
            budget: None,
        }
    }

    /// Exponential policy shorthand
    pub fn exponential(initial_ms: u64, multiplier: f64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            },
            max_attempts,
            retry_on: BTreeSet::new(),
            do_not_retry_on: BTreeSet::new(),
            budget: None,
        }
    }

    /// Fixed-delay policy shorthand
    pub fn fixed(delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Fixed { delay_ms },
            max_attempts,
            retry_on: BTreeSet::new(),
            do_not_retry_on: BTreeSet::new(),
            budget: None,
        }
    }

    /// Expected (jitter-free) delay before the `retry`-th retry, 1-based
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let ms = match &self.backoff {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear { initial_ms, max_ms } => {
                initial_ms.saturating_mul(retry as u64).min(*max_ms)
            }
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let factor = multiplier.powi(retry as i32 - 1);
                let raw = (*initial_ms as f64 * factor).round();
                if raw >= *max_ms as f64 {
                    *max_ms
                } else {
                    raw as u64
                }
            }
        };
        Duration::from_millis(ms)
    }

    /// Delay with symmetric ±25 % jitter applied
    pub fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.delay_for(retry);
        if base.is_zero() {
            return base;
        }
        // f64() yields [0, 1); map to [-0.25, 0.25)
        let jitter = (fastrand::f64() - 0.5) * 0.5;
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + jitter)).max(0.0))
    }

    /// Whether a fault of this kind may be retried under this policy
    pub fn permits_kind(&self, kind: &str) -> bool {
        if self.do_not_retry_on.contains(kind) {
            return false;
        }
        self.retry_on.is_empty() || self.retry_on.contains(kind)
    }

    /// Whether another retry is allowed given the current retry count
    pub fn permits_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }
}
