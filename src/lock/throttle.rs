//! Fixed-window throttling lock provider.
//!
//! A resource maps to a cache key scoped to the current window (the
//! window's start instant, floored to `period`); acquiring increments that
//! key's hit count and succeeds while it stays under `max_hits`. Release is
//! a no-op — the counter expires with the window on its own. The counter
//! key carries a short grace TTL past the window boundary, so a slow reader
//! never observes a just-rolled-over window as having zero hits when in
//! fact the previous window's writers are still landing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::Cache;
use crate::cancellation::CancelToken;
use crate::clock::{system_clock, SharedClock};
use crate::lock::{validate_resource, LockError, LockHandle, LockProvider, LockResult};
use crate::metrics::{MetricsSink, NoopMetrics};

const DEFAULT_GRACE: Duration = Duration::from_millis(500);

fn floor_to_period(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_ms = period.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let floored_ms = now_ms - now_ms.rem_euclid(period_ms);
    DateTime::from_timestamp_millis(floored_ms).unwrap_or(now)
}

pub struct ThrottlingLockProvider<C: Cache> {
    cache: Arc<C>,
    clock: SharedClock,
    max_hits: u64,
    period: Duration,
    grace: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl<C: Cache> ThrottlingLockProvider<C> {
    pub fn new(cache: Arc<C>, max_hits: u64, period: Duration) -> Self {
        Self {
            cache,
            clock: system_clock(),
            max_hits,
            period,
            grace: DEFAULT_GRACE,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn window_key(&self, resource: &str, window_start: DateTime<Utc>) -> String {
        format!("lock:throttle:{resource}:{}", window_start.timestamp_millis())
    }
}

#[async_trait]
impl<C: Cache> LockProvider for ThrottlingLockProvider<C> {
    async fn acquire(
        &self,
        resource: &str,
        _lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> LockResult<Option<LockHandle>> {
        validate_resource(resource)?;
        let deadline = acquire_timeout.map(|d| {
            self.clock.now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        });

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            let now = self.clock.now();
            if let Some(dl) = deadline {
                if now >= dl {
                    return Ok(None);
                }
            }

            let window_start = floor_to_period(now, self.period);
            let window_end = window_start
                + chrono::Duration::from_std(self.period).unwrap_or_else(|_| chrono::Duration::zero());
            let key = self.window_key(resource, window_start);

            // Increment first and check the result, rather than check-then-
            // increment: the latter is a TOCTOU race that lets concurrent
            // callers overshoot `max_hits` between the read and the write.
            // `Cache::increment` is atomic per key, so this is the only way
            // to enforce "at most N" under contention.
            let ttl = (window_end - now).to_std().unwrap_or(Duration::ZERO) + self.grace;
            let new_count =
                self.cache.increment(&key, 1, Some(ttl)).await.map_err(|e| LockError::Backend(e.to_string()))?;
            if new_count <= self.max_hits as i64 {
                self.metrics.counter("lock.throttle.acquired", 1);
                return Ok(Some(LockHandle::noop(resource.to_string())));
            }
            // Overshot: compensate so the counter still reflects at most
            // the hits that were actually granted.
            self.cache.increment(&key, -1, None).await.map_err(|e| LockError::Backend(e.to_string()))?;

            self.metrics.counter("lock.throttle.rejected", 1);
            let until_rollover = (window_end - now).to_std().unwrap_or(Duration::from_millis(10)).max(Duration::from_millis(1));
            let sleep_for = match deadline {
                Some(dl) => until_rollover.min((dl - now).to_std().unwrap_or(Duration::ZERO)),
                None => return Ok(None),
            };
            self.clock.sleep(sleep_for, cancel).await;
        }
    }

    async fn is_locked(&self, resource: &str) -> LockResult<bool> {
        validate_resource(resource)?;
        let now = self.clock.now();
        let window_start = floor_to_period(now, self.period);
        let key = self.window_key(resource, window_start);
        let current: i64 = self.cache.get(&key).await.map_err(|e| LockError::Backend(e.to_string()))?.unwrap_or(0);
        Ok(current >= self.max_hits as i64)
    }

    /// Renewal is meaningless for a counter-based quota; the window expires
    /// on a fixed schedule regardless of caller activity.
    async fn renew(&self, _handle: &LockHandle, _extension: Option<Duration>) -> LockResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryCache, InMemoryCacheConfig};
    use crate::clock::TestClock;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn allows_exactly_n_then_blocks_until_rollover() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
        let provider = ThrottlingLockProvider::new(cache, 25, StdDuration::from_secs(1))
            .with_clock(clock.clone() as SharedClock);

        for _ in 0..25 {
            let h = provider
                .acquire("api", None, Some(StdDuration::from_millis(50)), &CancelToken::new())
                .await
                .unwrap();
            assert!(h.is_some());
        }

        let denied = provider
            .acquire("api", None, Some(StdDuration::from_millis(10)), &CancelToken::new())
            .await
            .unwrap();
        assert!(denied.is_none(), "26th acquire within the window should be denied");
    }

    #[tokio::test]
    async fn window_resets_after_rollover() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
        let provider = ThrottlingLockProvider::new(cache, 2, StdDuration::from_millis(100))
            .with_clock(clock.clone() as SharedClock);

        assert!(provider.acquire("r", None, Some(StdDuration::from_millis(10)), &CancelToken::new()).await.unwrap().is_some());
        assert!(provider.acquire("r", None, Some(StdDuration::from_millis(10)), &CancelToken::new()).await.unwrap().is_some());
        assert!(provider.acquire("r", None, Some(StdDuration::from_millis(10)), &CancelToken::new()).await.unwrap().is_none());

        clock.advance(StdDuration::from_millis(150));
        assert!(provider.acquire("r", None, Some(StdDuration::from_millis(10)), &CancelToken::new()).await.unwrap().is_some());
    }
}
