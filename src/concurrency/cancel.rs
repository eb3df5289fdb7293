//! Hierarchical cancellation tokens
//!
//! The engine owns the root token for a run; per-call and subflow tokens
//! are children. Cancelling a parent cancels every descendant. Cancellation
//! is cooperative: workers observe it at suspension points.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

/// Cloneable cancellation token with parent/child linkage
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: RwLock<bool>,
    notify: Notify,
    parent: Option<CancelToken>,
    children: RwLock<Vec<CancelToken>>,
}

impl CancelToken {
    /// Fresh root token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
                parent: None,
                children: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Derive a child; cancelled automatically when this token cancels
    pub fn child(&self) -> Self {
        let child = Self {
            inner: Arc::new(TokenInner {
                cancelled: RwLock::new(*self.inner.cancelled.read()),
                notify: Notify::new(),
                parent: Some(self.clone()),
                children: RwLock::new(Vec::new()),
            }),
        };
        self.inner.children.write().push(child.clone());
        child
    }

    /// Cancel this token and every descendant
    pub fn cancel(&self) {
        {
            let mut cancelled = self.inner.cancelled.write();
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.inner.notify.notify_waiters();
        let children = self.inner.children.read().clone();
        for child in children {
            child.cancel();
        }
    }

    /// Whether this token or any ancestor has been cancelled
    pub fn is_cancelled(&self) -> bool {
        if *self.inner.cancelled.read() {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Wait until cancelled; returns immediately if already cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check between registration and await to close the race
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
