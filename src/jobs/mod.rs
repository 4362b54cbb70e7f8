//! Work-item job runner.
//!
//! Dispatches queued work items to handlers keyed by a stable type name.
//! The runner itself ([`JobRunner`]) is generic only over the queue backend —
//! every per-handler type parameter is erased behind [`ErasedHandler`] so one
//! runner instance can dispatch many distinct [`WorkItem`] types registered
//! at runtime, each handler pairing an `acquire_lock` step with a `handle`
//! step.

pub mod envelope;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

pub use envelope::{WorkItem, WorkItemEnvelope, WorkItemStatus};

use crate::bus::{BusError, MessageBus, MessageOptions};
use crate::cancellation::CancelToken;
use crate::lock::{LockError, LockHandle, LockProvider};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::queue::{Queue, QueueBackend, QueueEntry, QueueError};
use crate::serializer::{JsonSerializer, Serializer};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("failed to parse work item payload: {0}")]
    Parse(String),

    #[error("no handler registered for type '{0}'")]
    Configuration(String),

    #[error("work item lock unavailable")]
    LockUnavailable,

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type JobResult<T> = Result<T, JobError>;

/// Object-safe seam used so the job runner can publish progress status
/// without itself being generic over a concrete [`MessageBus`] type (which
/// would force every handler registration to repeat that type parameter).
/// Mirrors how [`crate::lock::LockBackend`] and [`crate::queue::QueueBackend`]
/// narrow a non-object-safe capability trait down to the one operation a
/// cross-cutting caller actually needs.
#[async_trait]
trait RawPublisher: Send + Sync + 'static {
    async fn publish_status(&self, status: &WorkItemStatus) -> JobResult<()>;
}

struct BusPublisher<B: MessageBus> {
    bus: Arc<B>,
}

#[async_trait]
impl<B: MessageBus> RawPublisher for BusPublisher<B> {
    async fn publish_status(&self, status: &WorkItemStatus) -> JobResult<()> {
        self.bus
            .publish(status.clone(), MessageOptions::default(), &CancelToken::new())
            .await
            .map_err(JobError::from)
    }
}

/// Per-work-item handle a handler uses to report progress from inside
/// `handle()`. Cheap to clone — every clone shares the same lock handle and
/// renewal policy.
#[derive(Clone)]
struct ProgressReporter {
    work_item_id: Uuid,
    type_name: String,
    enabled: bool,
    publisher: Arc<dyn RawPublisher>,
    queue_backend: Arc<dyn QueueBackend>,
    queue_entry_id: Uuid,
    locks: Arc<dyn LockProvider>,
    lock: Option<LockHandle>,
    auto_renew: bool,
}

impl ProgressReporter {
    fn with_lock(mut self, lock: Option<LockHandle>, auto_renew: bool) -> Self {
        self.lock = lock;
        self.auto_renew = auto_renew;
        self
    }

    /// Publishes a status message and, when the handler opted in to
    /// auto-renewal, extends both the queue lease and the work-item lock
    /// in parallel. A no-op when the envelope didn't request progress
    /// reports.
    async fn report(&self, progress: i8, message: impl Into<String>) -> JobResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let status = WorkItemStatus {
            work_item_id: self.work_item_id,
            progress,
            message: message.into(),
            type_name: self.type_name.clone(),
        };
        self.publisher.publish_status(&status).await?;
        if self.auto_renew {
            let renew_queue = self.queue_backend.renew_lock(self.queue_entry_id, None);
            match &self.lock {
                Some(lock) => {
                    let renew_lock = self.locks.renew(lock, None);
                    let (queue_result, lock_result) = tokio::join!(renew_queue, renew_lock);
                    if let Err(err) = queue_result {
                        tracing::warn!(error = %err, "queue lease renewal on progress failed");
                    }
                    if let Err(err) = lock_result {
                        tracing::warn!(error = %err, "work-item lock renewal on progress failed");
                    }
                }
                None => {
                    if let Err(err) = renew_queue.await {
                        tracing::warn!(error = %err, "queue lease renewal on progress failed");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Per-work-item handler interface. `T` is the decoded payload type;
/// registering a handler via [`JobRunner::register`] erases `T` behind
/// [`ErasedHandler`] so the runner's registry can hold many distinct
/// handlers.
#[async_trait]
pub trait WorkItemHandler<T: WorkItem>: Send + Sync + 'static {
    /// Acquires whatever lock this handler's policy requires before
    /// processing `payload`. The default policy acquires nothing — an
    /// empty lock that always proceeds.
    async fn acquire_lock(
        &self,
        payload: &T,
        locks: &dyn LockProvider,
        cancel: &CancelToken,
    ) -> JobResult<Option<LockHandle>> {
        let _ = (payload, locks, cancel);
        Ok(None)
    }

    /// When `true`, every `report_progress` call also renews the queue
    /// lease and the work-item lock.
    fn auto_renew_lock_on_progress(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: WorkItemContext<T>) -> JobResult<()>;
}

/// Context passed to [`WorkItemHandler::handle`].
pub struct WorkItemContext<T> {
    pub payload: T,
    pub job_id: Uuid,
    pub lock: Option<LockHandle>,
    pub cancel: CancelToken,
    progress: ProgressReporter,
}

impl<T> WorkItemContext<T> {
    pub async fn report_progress(&self, percent: i8, message: impl Into<String>) -> JobResult<()> {
        self.progress.report(percent, message).await
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync + 'static {
    async fn process(
        &self,
        envelope: &WorkItemEnvelope,
        locks: Arc<dyn LockProvider>,
        reporter: ProgressReporter,
        cancel: CancelToken,
    ) -> JobResult<()>;
}

struct TypedHandlerAdapter<T, H, S> {
    handler: Arc<H>,
    serializer: S,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H, S> ErasedHandler for TypedHandlerAdapter<T, H, S>
where
    T: WorkItem,
    H: WorkItemHandler<T>,
    S: Serializer + Send + Sync + 'static,
{
    async fn process(
        &self,
        envelope: &WorkItemEnvelope,
        locks: Arc<dyn LockProvider>,
        reporter: ProgressReporter,
        cancel: CancelToken,
    ) -> JobResult<()> {
        let payload: T = self
            .serializer
            .deserialize(&envelope.payload)
            .map_err(|e| JobError::Parse(e.to_string()))?;
        let lock = self.handler.acquire_lock(&payload, locks.as_ref(), &cancel).await?;
        let reporter = reporter.with_lock(lock.clone(), self.handler.auto_renew_lock_on_progress());
        reporter.report(0, format!("{} started", envelope.type_name)).await?;

        let ctx = WorkItemContext {
            payload,
            job_id: envelope.work_item_id,
            lock: lock.clone(),
            cancel,
            progress: reporter.clone(),
        };
        let result = self.handler.handle(ctx).await;

        // Always release the work-item lock before returning, regardless
        // of outcome.
        if let Some(lock) = lock {
            if let Err(err) = lock.release().await {
                tracing::warn!(error = %err, "work-item lock release failed");
            }
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Bounds how long a single dequeue wait blocks before the run loop
    /// re-checks the shutdown token.
    pub dequeue_deadline: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self { dequeue_deadline: Duration::from_secs(30) }
    }
}

#[derive(Default)]
struct JobCounters {
    completed: std::sync::atomic::AtomicU64,
    failed: std::sync::atomic::AtomicU64,
    configuration_errors: std::sync::atomic::AtomicU64,
}

/// Ties the queue, bus, and lock provider together to process typed
/// background work. Generic only over the queue implementation; registered
/// handler types are erased (see module doc).
pub struct JobRunner<Q: Queue<WorkItemEnvelope>, S: Serializer = JsonSerializer> {
    queue: Arc<Q>,
    publisher: Arc<dyn RawPublisher>,
    default_locks: Arc<dyn LockProvider>,
    registry: DashMap<String, Arc<dyn ErasedHandler>>,
    serializer: S,
    config: JobRunnerConfig,
    metrics: Arc<dyn MetricsSink>,
    stats: JobCounters,
}

impl<Q: Queue<WorkItemEnvelope>> JobRunner<Q, JsonSerializer> {
    pub fn new<B: MessageBus>(
        queue: Arc<Q>,
        bus: Arc<B>,
        default_locks: Arc<dyn LockProvider>,
        config: JobRunnerConfig,
    ) -> Self {
        Self::with_serializer(queue, bus, default_locks, config, JsonSerializer, Arc::new(NoopMetrics))
    }
}

impl<Q: Queue<WorkItemEnvelope>, S: Serializer + Clone> JobRunner<Q, S> {
    pub fn with_serializer<B: MessageBus>(
        queue: Arc<Q>,
        bus: Arc<B>,
        default_locks: Arc<dyn LockProvider>,
        config: JobRunnerConfig,
        serializer: S,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            queue,
            publisher: Arc::new(BusPublisher { bus }),
            default_locks,
            registry: DashMap::new(),
            serializer,
            config,
            metrics,
            stats: JobCounters::default(),
        }
    }

    /// Registers a handler for `T`. Later registrations for the same
    /// `T::type_name()` replace earlier ones.
    pub fn register<T, H>(&self, handler: H)
    where
        T: WorkItem,
        H: WorkItemHandler<T>,
    {
        let adapter: Arc<dyn ErasedHandler> = Arc::new(TypedHandlerAdapter {
            handler: Arc::new(handler),
            serializer: self.serializer.clone(),
            _marker: PhantomData,
        });
        self.registry.insert(T::type_name().to_string(), adapter);
    }

    /// Enqueues `payload` as a work item. `send_progress_reports` controls
    /// whether the runner publishes `WorkItemStatus` updates while
    /// processing it.
    pub async fn enqueue<T: WorkItem>(&self, payload: &T, send_progress_reports: bool) -> JobResult<Uuid> {
        let envelope = WorkItemEnvelope::new(payload, &self.serializer, send_progress_reports)
            .map_err(|e| JobError::Parse(e.to_string()))?;
        let id = envelope.work_item_id;
        self.queue.enqueue(&envelope).await?;
        Ok(id)
    }

    /// Resolves `raw` against the registry, falling back to the part
    /// before `@` if present, so a versioned type name still matches a
    /// handler registered under its bare name.
    fn resolve_handler(&self, raw: &str) -> Option<Arc<dyn ErasedHandler>> {
        if let Some(handler) = self.registry.get(raw) {
            return Some(handler.value().clone());
        }
        if let Some(idx) = raw.rfind('@') {
            if let Some(handler) = self.registry.get(&raw[..idx]) {
                return Some(handler.value().clone());
            }
        }
        None
    }

    async fn process_entry(&self, entry: QueueEntry<WorkItemEnvelope>, cancel: CancelToken) -> JobResult<()> {
        let envelope = &entry.payload;
        let Some(handler) = self.resolve_handler(&envelope.type_name) else {
            // Unroutable type: complete (not abandon) so it doesn't retry
            // forever against a handler that will never be registered.
            let _ = entry.complete().await;
            self.stats.configuration_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.metrics.counter("jobs.configuration_errors", 1);
            return Err(JobError::Configuration(envelope.type_name.clone()));
        };

        let reporter = ProgressReporter {
            work_item_id: envelope.work_item_id,
            type_name: envelope.type_name.clone(),
            enabled: envelope.send_progress_reports,
            publisher: self.publisher.clone(),
            queue_backend: entry.backend.clone(),
            queue_entry_id: entry.id,
            locks: self.default_locks.clone(),
            lock: None,
            auto_renew: false,
        };

        match handler.process(envelope, self.default_locks.clone(), reporter.clone(), cancel).await {
            Ok(()) => {
                let _ = entry.complete().await;
                reporter
                    .report(100, format!("{} complete", envelope.type_name))
                    .await
                    .ok();
                self.stats.completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.metrics.counter("jobs.completed", 1);
                Ok(())
            }
            Err(err) => {
                reporter.report(-1, format!("Failed: {err}")).await.ok();
                let _ = entry.abandon().await;
                self.stats.failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.metrics.counter("jobs.failed", 1);
                Err(err)
            }
        }
    }

    /// Dequeues and processes exactly one work item, or returns `Ok(false)`
    /// if none arrived within the configured dequeue deadline.
    pub async fn run_once(&self, shutdown: &CancelToken) -> JobResult<bool> {
        let dequeue_cancel = shutdown.child_token();
        let entry = match tokio::time::timeout(self.config.dequeue_deadline, self.queue.dequeue(&dequeue_cancel)).await
        {
            Ok(result) => result?,
            Err(_elapsed) => None,
        };
        let Some(entry) = entry else {
            return Ok(false);
        };
        self.process_entry(entry, shutdown.child_token()).await?;
        Ok(true)
    }

    /// Runs until `shutdown` is cancelled, processing one item at a time.
    /// A handler/configuration/lock failure for one item is logged and
    /// does not stop the loop; per-item failures are ordinary outcomes the
    /// queue's retry/deadletter machinery already handles.
    pub async fn run(&self, shutdown: CancelToken) {
        while !shutdown.is_cancelled() {
            if let Err(err) = self.run_once(&shutdown).await {
                tracing::warn!(error = %err, "job runner iteration failed");
            }
        }
    }

    pub fn stats(&self) -> JobRunnerStats {
        JobRunnerStats {
            completed: self.stats.completed.load(std::sync::atomic::Ordering::Relaxed),
            failed: self.stats.failed.load(std::sync::atomic::Ordering::Relaxed),
            configuration_errors: self.stats.configuration_errors.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRunnerStats {
    pub completed: u64,
    pub failed: u64,
    pub configuration_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryMessageBus;
    use crate::cache::{InMemoryCache, InMemoryCacheConfig};
    use crate::lock::CacheLockProvider;
    use crate::queue::{InMemoryQueue, QueueConfig};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl WorkItem for Greet {
        fn type_name() -> &'static str {
            "Greet"
        }
    }

    struct GreetHandler {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkItemHandler<Greet> for GreetHandler {
        fn auto_renew_lock_on_progress(&self) -> bool {
            true
        }

        async fn handle(&self, ctx: WorkItemContext<Greet>) -> JobResult<()> {
            ctx.report_progress(50, "half").await?;
            self.seen.lock().unwrap().push(ctx.payload.name.clone());
            Ok(())
        }
    }

    fn runner() -> (
        JobRunner<InMemoryQueue<WorkItemEnvelope, InMemoryCache>>,
        Arc<InMemoryMessageBus>,
    ) {
        let cache = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
        let bus = Arc::new(InMemoryMessageBus::default());
        let queue = Arc::new(
            InMemoryQueue::new("jobs", cache.clone(), QueueConfig {
                work_item_timeout: StdDuration::from_secs(5),
                maintenance_interval: StdDuration::from_millis(50),
                poll_interval: StdDuration::from_millis(20),
                ..QueueConfig::default()
            })
            .unwrap(),
        );
        let locks = Arc::new(CacheLockProvider::new(cache, bus.clone()));
        let runner = JobRunner::new(queue, bus.clone(), locks, JobRunnerConfig {
            dequeue_deadline: StdDuration::from_millis(200),
        });
        (runner, bus)
    }

    #[tokio::test]
    async fn processes_registered_work_item_with_progress() {
        let (runner, bus) = runner();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        runner.register(GreetHandler { seen: seen.clone() });

        let progress_count = Arc::new(AtomicU32::new(0));
        let progress_count2 = progress_count.clone();
        bus.subscribe::<WorkItemStatus, _, _>(
            move |_status, _env| {
                let c = progress_count2.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
            CancelToken::new(),
        );

        runner.enqueue(&Greet { name: "Ada".to_string() }, true).await.unwrap();
        let shutdown = CancelToken::new();
        assert!(runner.run_once(&shutdown).await.unwrap());

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["Ada".to_string()]);
        assert_eq!(progress_count.load(Ordering::SeqCst), 3);
        assert_eq!(runner.stats().completed, 1);
    }

    #[tokio::test]
    async fn unregistered_type_completes_with_configuration_error() {
        let (runner, _bus) = runner();
        runner.enqueue(&Greet { name: "nobody-handles-this".to_string() }, false).await.unwrap();
        let shutdown = CancelToken::new();
        let err = runner.run_once(&shutdown).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
        assert_eq!(runner.stats().configuration_errors, 1);
    }

    struct FailingHandler;

    #[async_trait]
    impl WorkItemHandler<Greet> for FailingHandler {
        async fn handle(&self, _ctx: WorkItemContext<Greet>) -> JobResult<()> {
            Err(JobError::HandlerFailed("boom".into()))
        }
    }

    #[tokio::test]
    async fn handler_failure_abandons_entry() {
        let (runner, _bus) = runner();
        runner.register(FailingHandler);
        runner.enqueue(&Greet { name: "x".to_string() }, false).await.unwrap();
        let shutdown = CancelToken::new();
        let err = runner.run_once(&shutdown).await.unwrap_err();
        assert!(matches!(err, JobError::HandlerFailed(_)));
        assert_eq!(runner.stats().failed, 1);
    }

    struct ContendedHandler {
        called: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl WorkItemHandler<Greet> for ContendedHandler {
        async fn acquire_lock(
            &self,
            _payload: &Greet,
            locks: &dyn LockProvider,
            cancel: &CancelToken,
        ) -> JobResult<Option<LockHandle>> {
            match locks
                .acquire("greet-resource", Some(StdDuration::from_secs(5)), Some(StdDuration::from_millis(50)), cancel)
                .await?
            {
                Some(handle) => Ok(Some(handle)),
                None => Err(JobError::LockUnavailable),
            }
        }

        async fn handle(&self, _ctx: WorkItemContext<Greet>) -> JobResult<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn lock_denied_by_handler_aborts_before_handle_and_abandons() {
        let cache = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
        let bus = Arc::new(InMemoryMessageBus::default());
        let locks = Arc::new(CacheLockProvider::new(cache.clone(), bus.clone()));
        let queue = Arc::new(
            InMemoryQueue::new("jobs-locked", cache.clone(), QueueConfig {
                work_item_timeout: StdDuration::from_secs(5),
                maintenance_interval: StdDuration::from_millis(50),
                poll_interval: StdDuration::from_millis(20),
                ..QueueConfig::default()
            })
            .unwrap(),
        );
        let runner = JobRunner::new(queue, bus.clone(), locks, JobRunnerConfig {
            dequeue_deadline: StdDuration::from_millis(200),
        });

        let handle_called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        runner.register(ContendedHandler { called: handle_called.clone() });

        // A separate lock provider instance holds the resource, so the
        // runner's own acquire races against an external holder rather than
        // itself.
        let external_locks = Arc::new(CacheLockProvider::new(cache, bus));
        let held = external_locks
            .acquire("greet-resource", Some(StdDuration::from_secs(5)), Some(StdDuration::from_secs(1)), &CancelToken::new())
            .await
            .unwrap()
            .expect("should acquire freely");

        runner.enqueue(&Greet { name: "Blocked".to_string() }, false).await.unwrap();
        let shutdown = CancelToken::new();
        let err = runner.run_once(&shutdown).await.unwrap_err();
        assert!(matches!(err, JobError::LockUnavailable));
        assert!(!handle_called.load(Ordering::SeqCst), "handler must not run when its lock acquisition fails");
        assert_eq!(runner.stats().failed, 1);

        held.release().await.unwrap();
    }
}
