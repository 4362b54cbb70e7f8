//! Cache-backed mutex with release notifications.
//!
//! Acquire is a compare-and-set via [`Cache::add`]; a waiter subscribes to
//! a `lock-released:<resource>` bus topic — the lock provider's own
//! namespace, since the bus itself has no notion of locks — and also falls
//! back to a small bounded poll so a missed notification can't wedge a
//! waiter forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::bus::{MessageBus, MessageOptions, RawPayload};
use crate::cache::Cache;
use crate::cancellation::CancelToken;
use crate::clock::{system_clock, SharedClock};
use crate::lock::{validate_resource, LockBackend, LockError, LockHandle, LockProvider, LockResult};
use crate::metrics::{MetricsSink, NoopMetrics};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

fn release_topic(resource: &str) -> String {
    format!("lock-released:{resource}")
}

struct CacheLockBackend<C, B> {
    cache: Arc<C>,
    bus: Arc<B>,
    metrics: Arc<dyn MetricsSink>,
}

#[async_trait]
impl<C: Cache, B: MessageBus> LockBackend for CacheLockBackend<C, B> {
    async fn conditional_release(&self, resource: &str, holder_id: &str) -> LockResult<()> {
        let key = lock_key(resource);
        let current: Option<String> =
            self.cache.get(&key).await.map_err(|e| LockError::Backend(e.to_string()))?;
        if current.as_deref() != Some(holder_id) {
            // Not the current holder (already expired/taken over): a
            // silent no-op.
            return Ok(());
        }
        self.cache.remove(&key).await.map_err(|e| LockError::Backend(e.to_string()))?;
        self.metrics.counter("lock.released", 1);
        let _ = self
            .bus
            .publish_raw(
                &release_topic(resource),
                Arc::new(()) as RawPayload,
                MessageOptions::default(),
                &CancelToken::new(),
            )
            .await;
        Ok(())
    }
}

/// Cache+bus backed distributed lock provider.
pub struct CacheLockProvider<C: Cache, B: MessageBus> {
    cache: Arc<C>,
    bus: Arc<B>,
    backend: Arc<CacheLockBackend<C, B>>,
    clock: SharedClock,
    poll_interval: Duration,
    metrics: Arc<dyn MetricsSink>,
    acquire_attempts: AtomicU64,
}

impl<C: Cache, B: MessageBus> CacheLockProvider<C, B> {
    pub fn new(cache: Arc<C>, bus: Arc<B>) -> Self {
        Self::with_metrics(cache, bus, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(cache: Arc<C>, bus: Arc<B>, metrics: Arc<dyn MetricsSink>) -> Self {
        let backend = Arc::new(CacheLockBackend {
            cache: cache.clone(),
            bus: bus.clone(),
            metrics: metrics.clone(),
        });
        Self {
            cache,
            bus,
            backend,
            clock: system_clock(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics,
            acquire_attempts: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn try_acquire_once(&self, resource: &str, holder_id: &str, lock_timeout: Duration) -> LockResult<bool> {
        self.cache
            .add(&lock_key(resource), &holder_id.to_string(), Some(lock_timeout))
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl<C: Cache, B: MessageBus> LockProvider for CacheLockProvider<C, B> {
    async fn acquire(
        &self,
        resource: &str,
        lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> LockResult<Option<LockHandle>> {
        validate_resource(resource)?;
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let lock_timeout = lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let holder_id = Uuid::new_v4().to_string();
        let deadline = acquire_timeout.map(|d| {
            self.clock.now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        });

        loop {
            self.acquire_attempts.fetch_add(1, Ordering::Relaxed);
            if self.try_acquire_once(resource, &holder_id, lock_timeout).await? {
                self.metrics.counter("lock.acquired", 1);
                return Ok(Some(LockHandle::new(resource.to_string(), holder_id, self.backend.clone())));
            }

            let now = self.clock.now();
            let Some(dl) = deadline else {
                return Ok(None);
            };
            if now >= dl {
                return Ok(None);
            }

            // Wait for either a release notification on this resource's
            // topic or the bounded poll interval, whichever comes first,
            // so a missed notification still converges.
            let released = CancelToken::new();
            let wake = released.clone();
            let sub = self.bus.subscribe_raw(
                &release_topic(resource),
                move |_payload, _envelope| {
                    let wake = wake.clone();
                    async move {
                        wake.cancel();
                    }
                },
                released.clone(),
            );
            let remaining = (dl - now).to_std().unwrap_or(Duration::ZERO);
            let wait_for = self.poll_interval.min(remaining);
            tokio::select! {
                _ = released.cancelled() => {}
                _ = self.clock.sleep(wait_for, cancel) => {}
            }
            released.cancel();
            let _ = sub;
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
        }
    }

    async fn is_locked(&self, resource: &str) -> LockResult<bool> {
        validate_resource(resource)?;
        self.cache
            .exists(&lock_key(resource))
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }

    async fn renew(&self, handle: &LockHandle, extension: Option<Duration>) -> LockResult<bool> {
        let key = lock_key(handle.resource());
        let current: Option<String> =
            self.cache.get(&key).await.map_err(|e| LockError::Backend(e.to_string()))?;
        if current.as_deref() != Some(handle.holder_id()) {
            return Ok(false);
        }
        let extension = extension.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        self.cache
            .set(&key, &handle.holder_id().to_string(), Some(extension))
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        handle.bump_renew();
        self.metrics.counter("lock.renewed", 1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryMessageBus;
    use crate::cache::{InMemoryCache, InMemoryCacheConfig};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    fn provider() -> CacheLockProvider<InMemoryCache, InMemoryMessageBus> {
        CacheLockProvider::new(
            Arc::new(InMemoryCache::new(InMemoryCacheConfig::default())),
            Arc::new(InMemoryMessageBus::default()),
        )
    }

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let p = provider();
        let cancel = CancelToken::new();
        let handle = p
            .acquire("x", Some(StdDuration::from_secs(5)), Some(StdDuration::from_secs(1)), &cancel)
            .await
            .unwrap()
            .expect("should acquire");
        assert!(p.is_locked("x").await.unwrap());
        handle.release().await.unwrap();
        assert!(!p.is_locked("x").await.unwrap());
        let second = p
            .acquire("x", Some(StdDuration::from_secs(5)), Some(StdDuration::from_secs(1)), &cancel)
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn contended_acquire_waits_for_release() {
        let p = Arc::new(provider());
        let cancel = CancelToken::new();
        let first = p
            .acquire("y", Some(StdDuration::from_millis(500)), Some(StdDuration::from_secs(2)), &cancel)
            .await
            .unwrap()
            .unwrap();

        let p2 = p.clone();
        let waiter = tokio::spawn(async move {
            p2.acquire("y", Some(StdDuration::from_secs(2)), Some(StdDuration::from_secs(2)), &CancelToken::new())
                .await
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        first.release().await.unwrap();

        let result = tokio::time::timeout(StdDuration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.unwrap().is_some());
    }

    #[tokio::test]
    async fn mutual_exclusion_under_contention() {
        let p = Arc::new(provider());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..25 {
            let p = p.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let h = p
                    .acquire(
                        "shared",
                        Some(StdDuration::from_secs(5)),
                        Some(StdDuration::from_secs(1)),
                        &CancelToken::new(),
                    )
                    .await
                    .unwrap()
                    .expect("should eventually acquire");
                let v = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(StdDuration::from_millis(2)).await;
                h.release().await.unwrap();
                v
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 25);
        assert!(!p.is_locked("shared").await.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_lease_for_current_holder() {
        let p = provider();
        let handle = p
            .acquire("z", Some(StdDuration::from_millis(100)), Some(StdDuration::from_secs(1)), &CancelToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(p.renew(&handle, Some(StdDuration::from_secs(5))).await.unwrap());
        assert_eq!(handle.renew_count(), 1);
    }
}
