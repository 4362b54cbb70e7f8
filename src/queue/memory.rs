//! In-memory reliable queue.
//!
//! List/metadata transitions are guarded by one `parking_lot::Mutex` so a
//! move between `in`/`work`/`wait`/`dead` and its metadata update happen
//! atomically together. A single background task per instance runs periodic
//! maintenance: lease timeout reclamation, wait-list release, dead-letter
//! trim.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::Cache;
use crate::cancellation::CancelToken;
use crate::clock::{system_clock, SharedClock};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::queue::{
    validate_queue_name, wire, EnqueueOptions, Queue, QueueBackend, QueueConfig, QueueEntry, QueueError,
    QueueItemState, QueueResult, QueueStats,
};
use crate::serializer::{JsonSerializer, Serializer};

struct ItemMeta {
    state: QueueItemState,
    attempts: u32,
    enqueued_at: DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
    wait_until: Option<DateTime<Utc>>,
    correlation_id: Option<String>,
    properties: HashMap<String, String>,
}

#[derive(Default)]
struct Lists {
    ready: VecDeque<Uuid>,
    dead: VecDeque<Uuid>,
    meta: HashMap<Uuid, ItemMeta>,
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

/// Shared, payload-type-erased core. Holding this behind an `Arc` (rather
/// than on [`InMemoryQueue`] directly) is what lets [`QueueEntry`] carry an
/// `Arc<dyn QueueBackend>` back to its queue without `Queue<T>` itself
/// needing to be object-safe.
struct QueueCore<C: Cache> {
    name: String,
    cache: Arc<C>,
    config: QueueConfig,
    clock: SharedClock,
    lists: Mutex<Lists>,
    wake: Notify,
    stats: QueueCounters,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancelToken,
}

impl<C: Cache> QueueCore<C> {
    fn payload_key(&self, id: Uuid) -> String {
        wire::payload_key(&self.name, id)
    }

    async fn run_maintenance(&self) {
        let now = self.clock.now();
        let mut timed_out = Vec::new();
        let mut released = Vec::new();
        {
            let mut lists = self.lists.lock();
            for (id, meta) in lists.meta.iter() {
                match meta.state {
                    QueueItemState::Working => {
                        if meta.lease_expires_at.map(|l| now >= l).unwrap_or(false) {
                            timed_out.push(*id);
                        }
                    }
                    QueueItemState::Waiting => {
                        if meta.wait_until.map(|w| now >= w).unwrap_or(false) {
                            released.push(*id);
                        }
                    }
                    _ => {}
                }
            }
            for id in &released {
                if let Some(meta) = lists.meta.get_mut(id) {
                    meta.state = QueueItemState::Queued;
                    meta.wait_until = None;
                }
                lists.ready.push_back(*id);
            }
        }
        if !released.is_empty() {
            self.wake.notify_waiters();
        }
        for id in timed_out {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            self.metrics.counter("queue.timeouts", 1);
            let _ = self.abandon(id).await;
        }
        self.trim_deadletter().await;
    }

    async fn trim_deadletter(&self) {
        let overflow: Vec<Uuid> = {
            let mut lists = self.lists.lock();
            let mut removed = Vec::new();
            while lists.dead.len() > self.config.dead_letter_max_items {
                match lists.dead.pop_front() {
                    Some(id) => {
                        lists.meta.remove(&id);
                        removed.push(id);
                    }
                    None => break,
                }
            }
            removed
        };
        for id in overflow {
            let _ = self.cache.remove(&self.payload_key(id)).await;
        }
    }

    fn snapshot_stats(&self) -> QueueStats {
        let lists = self.lists.lock();
        let (mut queued, mut working) = (0u64, 0u64);
        for meta in lists.meta.values() {
            match meta.state {
                QueueItemState::Queued => queued += 1,
                QueueItemState::Working => working += 1,
                _ => {}
            }
        }
        QueueStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            abandoned: self.stats.abandoned.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            queued,
            working,
            deadletter: lists.dead.len() as u64,
        }
    }
}

#[async_trait]
impl<C: Cache> QueueBackend for QueueCore<C> {
    async fn complete(&self, id: Uuid) -> QueueResult<()> {
        {
            let mut lists = self.lists.lock();
            match lists.meta.get(&id).map(|m| m.state) {
                Some(QueueItemState::Working) => {}
                // Already terminal (completed/deadlettered) or unknown:
                // silent no-op.
                _ => return Ok(()),
            }
            lists.meta.remove(&id);
        }
        let _ = self.cache.remove(&self.payload_key(id)).await;
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.metrics.counter("queue.completed", 1);
        Ok(())
    }

    async fn abandon(&self, id: Uuid) -> QueueResult<()> {
        enum Decision {
            Deadletter,
            ImmediateRetry,
            DelayedRetry,
        }
        let decision = {
            let mut lists = self.lists.lock();
            let Some(meta) = lists.meta.get_mut(&id) else {
                return Ok(());
            };
            if meta.state != QueueItemState::Working {
                return Ok(());
            }
            meta.attempts += 1;
            let attempts = meta.attempts;
            if attempts > self.config.max_retries {
                meta.state = QueueItemState::Deadletter;
                meta.lease_expires_at = None;
                lists.dead.push_back(id);
                Decision::Deadletter
            } else {
                let delay = self.config.retry_delay(attempts);
                if delay.is_zero() {
                    meta.state = QueueItemState::Queued;
                    meta.lease_expires_at = None;
                    // Retries jump to the head of the ready list so they're
                    // picked up before fresh, never-tried work.
                    lists.ready.push_front(id);
                    Decision::ImmediateRetry
                } else {
                    meta.state = QueueItemState::Waiting;
                    meta.lease_expires_at = None;
                    meta.wait_until = Some(
                        self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    Decision::DelayedRetry
                }
            }
        };
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        self.metrics.counter("queue.abandoned", 1);
        match decision {
            Decision::Deadletter => {
                let _ = self.cache.set_expiration(&self.payload_key(id), self.config.dead_letter_ttl).await;
                self.metrics.counter("queue.deadlettered", 1);
                self.trim_deadletter().await;
            }
            Decision::ImmediateRetry => {
                self.wake.notify_waiters();
            }
            Decision::DelayedRetry => {}
        }
        Ok(())
    }

    async fn renew_lock(&self, id: Uuid, extension: Option<Duration>) -> QueueResult<()> {
        let mut lists = self.lists.lock();
        if let Some(meta) = lists.meta.get_mut(&id) {
            if meta.state == QueueItemState::Working {
                let ext = extension.unwrap_or(self.config.work_item_timeout);
                meta.lease_expires_at = Some(
                    self.clock.now() + chrono::Duration::from_std(ext).unwrap_or_else(|_| chrono::Duration::zero()),
                );
            }
        }
        Ok(())
    }
}

/// In-memory queue of payload type `T`.
pub struct InMemoryQueue<T, C: Cache, S: Serializer = JsonSerializer> {
    core: Arc<QueueCore<C>>,
    serializer: S,
    maintenance: Option<JoinHandle<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Cache> InMemoryQueue<T, C, JsonSerializer> {
    pub fn new(name: impl Into<String>, cache: Arc<C>, config: QueueConfig) -> QueueResult<Self> {
        Self::with_serializer(name, cache, config, JsonSerializer, Arc::new(NoopMetrics), system_clock())
    }
}

impl<T, C: Cache, S: Serializer + Clone> InMemoryQueue<T, C, S> {
    pub fn with_serializer(
        name: impl Into<String>,
        cache: Arc<C>,
        config: QueueConfig,
        serializer: S,
        metrics: Arc<dyn MetricsSink>,
        clock: SharedClock,
    ) -> QueueResult<Self> {
        let name = name.into();
        validate_queue_name(&name)?;
        let core = Arc::new(QueueCore {
            name,
            cache,
            config,
            clock,
            lists: Mutex::new(Lists::default()),
            wake: Notify::new(),
            stats: QueueCounters::default(),
            metrics,
            shutdown: CancelToken::new(),
        });

        let maintenance = {
            let core = core.clone();
            let interval = core.config.maintenance_interval;
            let shutdown = core.shutdown.clone();
            Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    core.run_maintenance().await;
                }
            }))
        };

        Ok(Self { core, serializer, maintenance, _marker: PhantomData })
    }
}

impl<T, C: Cache, S: Serializer> Drop for InMemoryQueue<T, C, S> {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<T, C, S> Queue<T> for InMemoryQueue<T, C, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    C: Cache,
    S: Serializer + Clone,
{
    async fn enqueue_with(&self, payload: &T, options: EnqueueOptions) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();
        let bytes = self.serializer.serialize(payload)?;
        self.core
            .cache
            .set(&self.core.payload_key(id), &bytes, Some(self.core.config.payload_ttl))
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        {
            let mut lists = self.core.lists.lock();
            lists.meta.insert(
                id,
                ItemMeta {
                    state: QueueItemState::Queued,
                    attempts: 0,
                    enqueued_at: self.core.clock.now(),
                    lease_expires_at: None,
                    wait_until: None,
                    correlation_id: options.correlation_id,
                    properties: options.properties,
                },
            );
            lists.ready.push_back(id);
        }
        self.core.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.core.metrics.counter("queue.enqueued", 1);
        self.core.wake.notify_waiters();
        Ok(id)
    }

    async fn dequeue(&self, cancel: &CancelToken) -> QueueResult<Option<QueueEntry<T>>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let popped = {
                let mut lists = self.core.lists.lock();
                lists.ready.pop_front()
            };
            if let Some(id) = popped {
                let bytes: Option<Vec<u8>> = self
                    .core
                    .cache
                    .get(&self.core.payload_key(id))
                    .await
                    .map_err(|e| QueueError::Backend(e.to_string()))?;
                let Some(bytes) = bytes else {
                    // Payload TTL elapsed before dequeue reached it; drop
                    // this dangling id and keep looking.
                    self.core.lists.lock().meta.remove(&id);
                    continue;
                };
                let payload: T = self.serializer.deserialize(&bytes)?;
                let now = self.core.clock.now();
                let lease_expires_at = now
                    + chrono::Duration::from_std(self.core.config.work_item_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let (attempts, enqueued_at, correlation_id, properties) = {
                    let mut lists = self.core.lists.lock();
                    let meta = lists.meta.get_mut(&id).expect("meta exists for a ready id");
                    meta.state = QueueItemState::Working;
                    meta.lease_expires_at = Some(lease_expires_at);
                    (meta.attempts, meta.enqueued_at, meta.correlation_id.clone(), meta.properties.clone())
                };
                self.core.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                self.core.metrics.counter("queue.dequeued", 1);
                return Ok(Some(QueueEntry {
                    id,
                    payload,
                    attempts,
                    enqueued_at,
                    correlation_id,
                    properties,
                    backend: self.core.clone(),
                }));
            }

            tokio::select! {
                _ = self.core.wake.notified() => {}
                _ = self.core.clock.sleep(self.core.config.poll_interval, cancel) => {}
            }
        }
    }

    fn stats(&self) -> QueueStats {
        self.core.snapshot_stats()
    }

    async fn delete_queue(&self) -> QueueResult<()> {
        let ids: Vec<Uuid> = {
            let mut lists = self.core.lists.lock();
            let ids: Vec<Uuid> = lists.meta.keys().copied().collect();
            lists.ready.clear();
            lists.dead.clear();
            lists.meta.clear();
            ids
        };
        for id in ids {
            let _ = self.core.cache.remove(&self.core.payload_key(id)).await;
        }
        Ok(())
    }
}
