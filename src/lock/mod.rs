//! Distributed lock provider capability.
//!
//! Two variants share one [`LockProvider`] surface and one [`LockHandle`]
//! type so callers can swap providers without touching call sites: a
//! cache+bus-backed mutex with release notifications
//! ([`cache_lock::CacheLockProvider`]) and a cache-only fixed-window
//! throttle ([`throttle::ThrottlingLockProvider`]).

pub mod cache_lock;
pub mod throttle;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use cache_lock::CacheLockProvider;
pub use throttle::ThrottlingLockProvider;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type LockResult<T> = Result<T, LockError>;

pub(crate) fn validate_resource(resource: &str) -> LockResult<()> {
    if resource.is_empty() {
        return Err(LockError::InvalidArgument("resource must not be empty".into()));
    }
    Ok(())
}

/// Backend a [`LockHandle`] calls back into to release itself, either
/// explicitly or on drop. Kept as its own narrow, object-safe trait because
/// [`LockProvider`] itself cannot be (its implementations are generic over
/// the cache/bus they're built from); this is the seam that lets a handle
/// carry a `Arc<dyn LockBackend>` regardless of which concrete provider
/// created it.
#[async_trait]
pub(crate) trait LockBackend: Send + Sync + 'static {
    async fn conditional_release(&self, resource: &str, holder_id: &str) -> LockResult<()>;
}

/// A held lock. Disposal (drop) releases the lock if it is still held and
/// hasn't been explicitly released already; `release()` does so eagerly and
/// synchronously with respect to the backend call completing.
///
/// Cloning shares the same underlying release state (`released` is an
/// `Arc<AtomicBool>`), so the job runner can hand a clone to a handler's
/// context while keeping its own clone to release on return: whichever
/// side calls `release()` (or drops) first wins, and the other is a no-op.
#[derive(Clone)]
pub struct LockHandle {
    resource: String,
    holder_id: String,
    renew_count: Arc<AtomicU32>,
    released: Arc<AtomicBool>,
    backend: Option<Arc<dyn LockBackend>>,
}

impl LockHandle {
    pub(crate) fn new(resource: String, holder_id: String, backend: Arc<dyn LockBackend>) -> Self {
        Self {
            resource,
            holder_id,
            renew_count: Arc::new(AtomicU32::new(0)),
            released: Arc::new(AtomicBool::new(false)),
            backend: Some(backend),
        }
    }

    /// A handle for providers whose release is a no-op: the throttling
    /// provider's counter auto-expires with the window instead.
    pub(crate) fn noop(resource: String) -> Self {
        Self {
            resource,
            holder_id: String::new(),
            renew_count: Arc::new(AtomicU32::new(0)),
            released: Arc::new(AtomicBool::new(true)),
            backend: None,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn renew_count(&self) -> u32 {
        self.renew_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_renew(&self) {
        self.renew_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Idempotent; release of an already-released handle is a silent no-op.
    pub async fn release(&self) -> LockResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(backend) = &self.backend {
            backend.conditional_release(&self.resource, &self.holder_id).await?;
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(backend) = self.backend.take() {
            let resource = self.resource.clone();
            let holder_id = self.holder_id.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.conditional_release(&resource, &holder_id).await {
                    tracing::warn!(%resource, error = %err, "lock release on drop failed");
                }
            });
        }
    }
}

/// The lock provider capability.
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    /// Attempts to acquire `resource`. `lock_timeout` bounds how long the
    /// lease is held before it expires on its own; `acquire_timeout` bounds
    /// how long the caller waits for a free lock. Returns `Ok(None)` on a
    /// normal acquire-timeout — that is not an error.
    async fn acquire(
        &self,
        resource: &str,
        lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
        cancel: &crate::cancellation::CancelToken,
    ) -> LockResult<Option<LockHandle>>;

    /// Releases `resource` if `handle` is still its holder. Idempotent.
    async fn release(&self, handle: &LockHandle) -> LockResult<()> {
        handle.release().await
    }

    async fn is_locked(&self, resource: &str) -> LockResult<bool>;

    /// Extends `handle`'s lease by `extension` (or the provider's default
    /// lock timeout). Fails (`Ok(false)`) if `handle` is no longer the
    /// holder — a late renewal racing a new holder must not steal the lock
    /// back.
    async fn renew(&self, handle: &LockHandle, extension: Option<Duration>) -> LockResult<bool>;
}
