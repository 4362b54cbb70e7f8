//! Abstract clock used throughout the crate so tests can advance time
//! deterministically instead of racing the wall clock.
//!
//! `Clock` is injected wherever code needs the current time or needs to
//! sleep, rather than reached for as a global, so a `TestClock` can stand
//! in during tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cancellation::CancelToken;

/// Abstract monotonic/wall clock.
///
/// Implementations must be cheap to clone and safe to share across tasks.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock instant.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`, or until `cancel` fires, whichever
    /// comes first.
    fn sleep(
        &self,
        duration: Duration,
        cancel: &CancelToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

/// Real wall-clock time backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(
        &self,
        duration: Duration,
        cancel: &CancelToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let cancel = cancel.clone();
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = cancel.cancelled() => {}
            }
        })
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// `advance` moves the clock forward and wakes any task parked in `sleep`
/// whose deadline has passed, so TTL expiry, throttle-window rollover, and
/// lease-timeout tests never depend on real elapsed time.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<TestClockInner>,
}

struct TestClockInner {
    now_millis: AtomicI64,
    waiters: Mutex<Vec<(i64, Arc<Notify>)>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(TestClockInner {
                now_millis: AtomicI64::new(start.timestamp_millis()),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Advance the clock and release any waiters whose deadline has elapsed.
    pub fn advance(&self, by: Duration) {
        let new_now = self.inner.now_millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst)
            + by.as_millis() as i64;
        let mut waiters = self.inner.waiters.lock();
        waiters.retain(|(deadline, notify)| {
            if *deadline <= new_now {
                notify.notify_one();
                false
            } else {
                true
            }
        });
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.inner.now_millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    fn sleep(
        &self,
        duration: Duration,
        cancel: &CancelToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let cancel = cancel.clone();
        let deadline = self.inner.now_millis.load(Ordering::SeqCst) + duration.as_millis() as i64;
        let notify = Arc::new(Notify::new());
        self.inner.waiters.lock().push((deadline, notify.clone()));
        Box::pin(async move {
            tokio::select! {
                _ = notify.notified() => {}
                _ = cancel.cancelled() => {}
            }
        })
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
