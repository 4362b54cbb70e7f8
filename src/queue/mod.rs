//! Reliable queue state machine.
//!
//! A four-list state machine: `in` (ready) / `work` (leased) / `wait`
//! (scheduled retry) / `dead` (terminal). This in-memory engine keeps that
//! bookkeeping behind a process-local guarded structure (mutex over lists +
//! per-id metadata) and uses the injected [`crate::cache::Cache`] capability
//! for the one genuinely cache-shaped responsibility it has: payload storage
//! with a `payload_ttl` floor chosen as `max(1.5 × Σ retry_delays, 7 days)`.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] crate::serializer::SerializerError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Wire-format key-naming convention an external (Redis-like) backend would
/// use to key all four lists and per-item fields. The in-memory engine
/// doesn't address its lists by these strings, but exposes them so a future
/// backend implementing [`Queue`] can stay consistent.
pub mod wire {
    use uuid::Uuid;

    pub fn list_key(queue: &str, list: &str) -> String {
        format!("q:{queue}:{list}")
    }

    pub fn payload_key(queue: &str, id: Uuid) -> String {
        format!("q:{queue}:{id}")
    }

    pub fn attempts_key(queue: &str, id: Uuid) -> String {
        format!("q:{queue}:{id}:attempts")
    }

    pub fn enqueued_key(queue: &str, id: Uuid) -> String {
        format!("q:{queue}:{id}:enqueued")
    }

    pub fn dequeued_key(queue: &str, id: Uuid) -> String {
        format!("q:{queue}:{id}:dequeued")
    }

    pub fn wait_key(queue: &str, id: Uuid) -> String {
        format!("q:{queue}:{id}:wait")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemState {
    Queued,
    Working,
    Waiting,
    Deadletter,
}

/// Point-in-time counters for a queue instance. `queued`/`working`/
/// `deadletter` are gauges recomputed from the live list lengths; the rest
/// are monotonic counters.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub queued: u64,
    pub working: u64,
    pub deadletter: u64,
}

/// Delivery metadata accompanying `enqueue`, carrying the same
/// correlation-id-and-properties shape a bus message does, so a queue item
/// and a bus message can carry the same tracing context.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
}

/// A dequeued item. `complete`/`abandon`/`renew_lock` forward to the queue
/// that produced this entry through an object-safe backend handle, the way
/// [`crate::lock::LockHandle`] forwards to its provider — necessary because
/// [`Queue`] itself is generic over the payload type and so cannot be
/// stored as a trait object.
pub struct QueueEntry<T> {
    pub id: Uuid,
    pub payload: T,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
    pub(crate) backend: std::sync::Arc<dyn QueueBackend>,
}

impl<T> QueueEntry<T> {
    pub async fn complete(&self) -> QueueResult<()> {
        self.backend.complete(self.id).await
    }

    pub async fn abandon(&self) -> QueueResult<()> {
        self.backend.abandon(self.id).await
    }

    pub async fn renew_lock(&self, extension: Option<Duration>) -> QueueResult<()> {
        self.backend.renew_lock(self.id, extension).await
    }
}

/// Object-safe seam a [`QueueEntry`] calls back into; see the module doc.
#[async_trait]
pub(crate) trait QueueBackend: Send + Sync + 'static {
    async fn complete(&self, id: Uuid) -> QueueResult<()>;
    async fn abandon(&self, id: Uuid) -> QueueResult<()>;
    async fn renew_lock(&self, id: Uuid, extension: Option<Duration>) -> QueueResult<()>;
}

/// Retry/lease/dead-letter configuration. Exposed as a config struct with
/// documented defaults rather than magic constants.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_retries: u32,
    /// Non-decreasing multipliers applied to `base_retry_delay`; index by
    /// `min(attempts, len - 1)`.
    pub retry_multipliers: Vec<u32>,
    pub base_retry_delay: Duration,
    pub work_item_timeout: Duration,
    pub dead_letter_max_items: usize,
    pub dead_letter_ttl: Duration,
    /// Payload TTL; defaults to `max(1.5 × Σ retry_delays, 7 days)`.
    pub payload_ttl: Duration,
    pub maintenance_interval: Duration,
    /// Bounded poll fallback period a blocked `dequeue` retries at even
    /// without a wake-up signal, so a queue with no subscribers on the
    /// wake-up topic still delivers.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let base_retry_delay = Duration::from_secs(1);
        let retry_multipliers = vec![1, 3, 5, 10];
        let total_retry: Duration =
            retry_multipliers.iter().map(|m| base_retry_delay * *m).sum();
        let seven_days = Duration::from_secs(7 * 24 * 3600);
        let payload_ttl = total_retry.mul_f64(1.5).max(seven_days);
        Self {
            max_retries: 3,
            retry_multipliers,
            base_retry_delay,
            work_item_timeout: Duration::from_secs(30),
            dead_letter_max_items: 100,
            dead_letter_ttl: seven_days,
            payload_ttl,
            maintenance_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl QueueConfig {
    pub(crate) fn retry_delay(&self, attempts: u32) -> Duration {
        let idx = (attempts.saturating_sub(1) as usize).min(self.retry_multipliers.len() - 1);
        self.base_retry_delay * self.retry_multipliers[idx]
    }
}

fn validate_queue_name(name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::InvalidArgument("queue name must not be empty".into()));
    }
    Ok(())
}

/// The reliable queue capability.
#[async_trait]
pub trait Queue<T>: Send + Sync + 'static
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(&self, payload: &T) -> QueueResult<Uuid> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    async fn enqueue_with(&self, payload: &T, options: EnqueueOptions) -> QueueResult<Uuid>;

    /// Blocks until an item is available, the cancellation token fires, or
    /// the implementation's own bounded wait elapses. Returns `Ok(None)` on
    /// cancellation — not an error.
    async fn dequeue(&self, cancel: &crate::cancellation::CancelToken) -> QueueResult<Option<QueueEntry<T>>>;

    fn stats(&self) -> QueueStats;

    async fn delete_queue(&self) -> QueueResult<()>;
}
