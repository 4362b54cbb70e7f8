//! In-memory message bus.
//!
//! Each delivery to a subscriber runs in its own `tokio::spawn`ed task, so one
//! panicking handler can never block or fail delivery to another. Delayed
//! delivery uses a single `BTreeMap`-keyed-by-due-time scheduler backed by one
//! background task, rather than a timer per delayed message.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{
    BoxFuture, BusError, BusResult, BusStats, Envelope, Message, MessageBus, MessageOptions,
    RawPayload, Subscription, ANY_TYPE,
};
use crate::cancellation::CancelToken;
use crate::clock::{system_clock, SharedClock};
use crate::metrics::{MetricsSink, NoopMetrics};

struct SubEntry {
    id: Uuid,
    filter: String,
    /// Raw subscribers (`subscribe_raw`) are the only ones reachable by
    /// `publish_raw`; typed subscribers (`subscribe::<T>`) only ever
    /// receive payloads that really are `T`, so a raw publish — whose
    /// payload has no statically checked type — never reaches them.
    is_raw: bool,
    cancel: CancelToken,
    handler: Arc<dyn Fn(RawPayload, Envelope) -> BoxFuture<'static> + Send + Sync>,
}

struct DelayedEnvelope {
    payload: RawPayload,
    type_name: &'static str,
    interfaces: &'static [&'static str],
    envelope: Envelope,
    is_raw: bool,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_no_subscribers: AtomicU64,
    subscriber_errors: AtomicU64,
}

fn matches(filter: &str, type_name: &str, interfaces: &[&'static str]) -> bool {
    filter == ANY_TYPE || filter == type_name || interfaces.iter().any(|i| *i == filter)
}

pub struct InMemoryMessageBus {
    subscriptions: Arc<RwLock<Vec<SubEntry>>>,
    delayed: Arc<Mutex<BTreeMap<DateTime<Utc>, Vec<DelayedEnvelope>>>>,
    delayed_wake: Arc<Notify>,
    shutdown: CancelToken,
    scheduler: Option<JoinHandle<()>>,
    clock: SharedClock,
    stats: Arc<BusCounters>,
    metrics: Arc<dyn MetricsSink>,
    /// Interns raw type-name strings so `publish_raw` leaks at most one
    /// `&'static str` per distinct name, not once per call.
    type_name_interner: DashMap<String, &'static str>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl InMemoryMessageBus {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        let subscriptions: Arc<RwLock<Vec<SubEntry>>> = Arc::new(RwLock::new(Vec::new()));
        let delayed: Arc<Mutex<BTreeMap<DateTime<Utc>, Vec<DelayedEnvelope>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let delayed_wake = Arc::new(Notify::new());
        let shutdown = CancelToken::new();
        let clock = system_clock();
        let stats = Arc::new(BusCounters::default());

        let scheduler = {
            let subscriptions = subscriptions.clone();
            let delayed = delayed.clone();
            let delayed_wake = delayed_wake.clone();
            let shutdown = shutdown.clone();
            let clock = clock.clone();
            let stats = stats.clone();
            let metrics = metrics.clone();
            Some(tokio::spawn(async move {
                loop {
                    let next_due = delayed.lock().keys().next().copied();
                    let sleep_for = match next_due {
                        Some(due) => {
                            let now = clock.now();
                            (due - now).to_std().unwrap_or(std::time::Duration::ZERO)
                        }
                        None => std::time::Duration::from_secs(3600),
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = delayed_wake.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                    let now = clock.now();
                    let due_batches: Vec<Vec<DelayedEnvelope>> = {
                        let mut guard = delayed.lock();
                        let due_keys: Vec<DateTime<Utc>> =
                            guard.range(..=now).map(|(k, _)| *k).collect();
                        due_keys.into_iter().filter_map(|k| guard.remove(&k)).collect()
                    };
                    for batch in due_batches {
                        for msg in batch {
                            fan_out(
                                &subscriptions,
                                &stats,
                                &metrics,
                                msg.payload,
                                msg.type_name,
                                msg.interfaces,
                                msg.envelope,
                                msg.is_raw,
                            )
                            .await;
                        }
                    }
                }
            }))
        };

        Self {
            subscriptions,
            delayed,
            delayed_wake,
            shutdown,
            scheduler,
            clock,
            stats,
            metrics,
            type_name_interner: DashMap::new(),
        }
    }

    fn intern_type_name(&self, name: &str) -> &'static str {
        if let Some(existing) = self.type_name_interner.get(name) {
            return *existing;
        }
        let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
        self.type_name_interner.insert(name.to_string(), leaked);
        leaked
    }

    fn push_subscription(&self, entry: SubEntry) -> Subscription {
        let id = entry.id;
        self.subscriptions.write().push(entry);
        Subscription { id }
    }
}

impl Drop for InMemoryMessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler.take() {
            handle.abort();
        }
        // Undelivered delayed messages are discarded on shutdown.
        self.delayed.lock().clear();
    }
}

async fn fan_out(
    subscriptions: &RwLock<Vec<SubEntry>>,
    stats: &BusCounters,
    metrics: &Arc<dyn MetricsSink>,
    payload: RawPayload,
    type_name: &'static str,
    interfaces: &'static [&'static str],
    envelope: Envelope,
    is_raw: bool,
) {
    stats.published.fetch_add(1, Ordering::Relaxed);
    metrics.counter("bus.published", 1);

    // Snapshot under a read lock, pruning cancelled subscriptions first so
    // the dispatch loop never touches a listener mid-teardown.
    subscriptions.write().retain(|s| !s.cancel.is_cancelled());
    let targets: Vec<(Arc<dyn Fn(RawPayload, Envelope) -> BoxFuture<'static> + Send + Sync>, CancelToken)> =
        subscriptions
            .read()
            .iter()
            .filter(|s| (!is_raw || s.is_raw) && matches(&s.filter, type_name, interfaces))
            .map(|s| (s.handler.clone(), s.cancel.clone()))
            .collect();

    if targets.is_empty() {
        stats.dropped_no_subscribers.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let mut handles = Vec::with_capacity(targets.len());
    for (handler, cancel) in targets {
        if cancel.is_cancelled() {
            continue;
        }
        let payload = payload.clone();
        let envelope = envelope.clone();
        handles.push(tokio::spawn(async move {
            handler(payload, envelope).await;
        }));
    }

    for handle in handles {
        match handle.await {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                metrics.counter("bus.delivered", 1);
            }
            Err(join_err) => {
                stats.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                metrics.counter("bus.subscriber_errors", 1);
                tracing::error!(error = %join_err, "bus subscriber handler panicked");
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish<T: Message>(
        &self,
        value: T,
        options: MessageOptions,
        cancel: &CancelToken,
    ) -> BusResult<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let payload: RawPayload = Arc::new(value);
        let envelope = Envelope {
            type_name: T::type_name(),
            correlation_id: options.correlation_id,
            properties: options.properties,
        };
        if let Some(delay) = options.delivery_delay.filter(|d| !d.is_zero()) {
            let due = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.delayed.lock().entry(due).or_default().push(DelayedEnvelope {
                payload,
                type_name: T::type_name(),
                interfaces: T::interfaces(),
                envelope,
                is_raw: false,
            });
            self.delayed_wake.notify_one();
            return Ok(());
        }
        fan_out(
            &self.subscriptions,
            &self.stats,
            &self.metrics,
            payload,
            T::type_name(),
            T::interfaces(),
            envelope,
            false,
        )
        .await;
        Ok(())
    }

    async fn publish_raw(
        &self,
        type_name: &str,
        payload: RawPayload,
        options: MessageOptions,
        cancel: &CancelToken,
    ) -> BusResult<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let type_name = self.intern_type_name(type_name);
        let envelope = Envelope {
            type_name,
            correlation_id: options.correlation_id,
            properties: options.properties,
        };
        if let Some(delay) = options.delivery_delay.filter(|d| !d.is_zero()) {
            let due = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.delayed.lock().entry(due).or_default().push(DelayedEnvelope {
                payload,
                type_name,
                interfaces: &[],
                envelope,
                is_raw: true,
            });
            self.delayed_wake.notify_one();
            return Ok(());
        }
        fan_out(&self.subscriptions, &self.stats, &self.metrics, payload, type_name, &[], envelope, true)
            .await;
        Ok(())
    }

    fn subscribe<T, F, Fut>(&self, handler: F, cancel: CancelToken) -> Subscription
    where
        T: Message,
        F: Fn(Arc<T>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped = Arc::new(move |payload: RawPayload, envelope: Envelope| -> BoxFuture<'static> {
            let handler = handler.clone();
            match payload.downcast::<T>() {
                Ok(typed) => Box::pin(async move { handler(typed, envelope).await }),
                Err(_) => Box::pin(async {}),
            }
        });
        self.push_subscription(SubEntry {
            id: Uuid::new_v4(),
            filter: T::type_name().to_string(),
            is_raw: false,
            cancel,
            handler: wrapped,
        })
    }

    fn subscribe_raw<F, Fut>(&self, filter: &str, handler: F, cancel: CancelToken) -> Subscription
    where
        F: Fn(RawPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped = Arc::new(move |payload: RawPayload, envelope: Envelope| -> BoxFuture<'static> {
            let handler = handler.clone();
            Box::pin(async move { handler(payload, envelope).await })
        });
        self.push_subscription(SubEntry {
            id: Uuid::new_v4(),
            filter: filter.to_string(),
            is_raw: true,
            cancel,
            handler: wrapped,
        })
    }

    fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped_no_subscribers: self.stats.dropped_no_subscribers.load(Ordering::Relaxed),
            subscriber_errors: self.stats.subscriber_errors.load(Ordering::Relaxed),
            pending_delayed: self.delayed.lock().values().map(|v| v.len() as u64).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;
    use tokio::sync::Mutex as AsyncMutex;

    struct SimpleMessageA {
        data: String,
    }
    struct SimpleMessageB {
        data: String,
    }
    struct SimpleMessageC {
        data: String,
    }

    const I_SIMPLE_MESSAGE: &str = "ISimpleMessage";

    impl Message for SimpleMessageA {
        fn type_name() -> &'static str {
            "SimpleMessageA"
        }
        fn interfaces() -> &'static [&'static str] {
            &[I_SIMPLE_MESSAGE]
        }
    }
    impl Message for SimpleMessageB {
        fn type_name() -> &'static str {
            "SimpleMessageB"
        }
        fn interfaces() -> &'static [&'static str] {
            &[I_SIMPLE_MESSAGE]
        }
    }
    impl Message for SimpleMessageC {
        fn type_name() -> &'static str {
            "SimpleMessageC"
        }
    }

    #[tokio::test]
    async fn derived_type_delivery_via_interface_subscription() {
        let bus = InMemoryMessageBus::default();
        let received = Arc::new(AsyncMutex::new(Vec::new()));
        let received2 = received.clone();
        bus.subscribe_raw(
            I_SIMPLE_MESSAGE,
            move |payload, envelope| {
                let received = received2.clone();
                async move {
                    received.lock().await.push(envelope.type_name.to_string());
                    let _ = payload;
                }
            },
            CancelToken::new(),
        );

        bus.publish(SimpleMessageA { data: "Hello".into() }, MessageOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        bus.publish(SimpleMessageB { data: "Hello".into() }, MessageOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        bus.publish(SimpleMessageC { data: "Hello".into() }, MessageOptions::default(), &CancelToken::new())
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let got = received.lock().await;
        assert_eq!(got.len(), 2);
        assert!(got.contains(&"SimpleMessageA".to_string()));
        assert!(got.contains(&"SimpleMessageB".to_string()));
    }

    #[tokio::test]
    async fn concrete_type_subscription_gets_downcast_value() {
        let bus = InMemoryMessageBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe::<SimpleMessageA, _, _>(
            move |msg, _env| {
                let seen = seen2.clone();
                async move {
                    assert_eq!(msg.data, "Hello");
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            },
            CancelToken::new(),
        );
        bus.publish(SimpleMessageA { data: "Hello".into() }, MessageOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_with_cancelled_token_errors() {
        let bus = InMemoryMessageBus::default();
        let cancelled = CancelToken::already_cancelled();
        let err = bus
            .publish(SimpleMessageC { data: "x".into() }, MessageOptions::default(), &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_subscription_receives_nothing_further() {
        let bus = InMemoryMessageBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let cancel = CancelToken::new();
        bus.subscribe::<SimpleMessageC, _, _>(
            move |_msg, _env| {
                let count = count2.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            cancel.clone(),
        );
        cancel.cancel();
        bus.publish(SimpleMessageC { data: "x".into() }, MessageOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delayed_delivery_holds_until_due() {
        let bus = InMemoryMessageBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe::<SimpleMessageC, _, _>(
            move |_msg, _env| {
                let count = count2.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            CancelToken::new(),
        );
        let options = MessageOptions {
            delivery_delay: Some(StdDuration::from_millis(50)),
            ..Default::default()
        };
        bus.publish(SimpleMessageC { data: "x".into() }, options, &CancelToken::new())
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
