//! Cooperative cancellation token.
//!
//! Every long-running operation across the crate accepts a cancellation
//! token, and tokens can be linked — the job runner links a dequeue-deadline
//! timer to the caller's token via [`CancelToken::child_token`].

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: RwLock<bool>,
    notify: Notify,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// A token that is already cancelled; publishing/subscribing with it
    /// must surface a cancellation error rather than proceed.
    pub fn already_cancelled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.read()
    }

    pub fn cancel(&self) {
        let mut guard = self.inner.cancelled.write();
        if !*guard {
            *guard = true;
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolves immediately if already cancelled, otherwise waits.
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        let notified = self.inner.notify.notified();
        async move {
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// A child token cancelled whenever `self` is cancelled, but which can
    /// also be cancelled independently — e.g. a per-dequeue deadline timer
    /// linked to a caller's token.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let parent_notified = self.clone();
        let child_clone = child.clone();
        tokio::spawn(async move {
            parent_notified.cancelled().await;
            child_clone.cancel();
        });
        child
    }
}
