//! A single end-to-end pass exercising cache, bus, lock, and queue together
//! through the public API, the way a caller wiring the crate up for the
//! first time would. Per-subsystem boundary behavior (eviction thresholds,
//! retry/deadletter trajectories, throttle windows, lock contention) is
//! covered by the colocated unit tests in each module; this file checks that
//! the five capabilities compose without the generic/object-safety seams
//! (`LockBackend`, `QueueBackend`, `RawPublisher`) leaking into the public
//! surface.

use std::sync::Arc;
use std::time::Duration;

use foundatio_rs::bus::InMemoryMessageBus;
use foundatio_rs::cache::{Cache, InMemoryCache, InMemoryCacheConfig};
use foundatio_rs::cancellation::CancelToken;
use foundatio_rs::lock::{CacheLockProvider, LockProvider};
use foundatio_rs::queue::{InMemoryQueue, Queue, QueueConfig};

#[tokio::test]
async fn cache_lock_and_queue_compose_through_a_shared_cache() {
    let cache = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
    let bus = Arc::new(InMemoryMessageBus::default());

    // Cache: basic set/get round-trip, independent of the other subsystems.
    cache.set("greeting", &"hello".to_string(), None).await.unwrap();
    let value: Option<String> = cache.get("greeting").await.unwrap();
    assert_eq!(value.as_deref(), Some("hello"));

    // Lock: acquire and release backed by the same cache instance the queue
    // will use for payload storage, confirming no shared-state collisions
    // between the lock namespace (`lock:<resource>`) and queue payload keys
    // (`q:<queue>:<id>`).
    let locks = CacheLockProvider::new(cache.clone(), bus.clone());
    let handle = locks
        .acquire("order-42", Some(Duration::from_secs(5)), Some(Duration::from_secs(1)), &CancelToken::new())
        .await
        .unwrap()
        .expect("lock should be free");
    assert!(locks.is_locked("order-42").await.unwrap());
    handle.release().await.unwrap();
    assert!(!locks.is_locked("order-42").await.unwrap());

    // Queue: enqueue/dequeue/complete using the same cache for payloads.
    let queue: InMemoryQueue<String, InMemoryCache> = InMemoryQueue::new(
        "orders",
        cache.clone(),
        QueueConfig {
            maintenance_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            ..QueueConfig::default()
        },
    )
    .unwrap();
    queue.enqueue(&"order-42".to_string()).await.unwrap();
    let entry = queue.dequeue(&CancelToken::new()).await.unwrap().expect("item should be ready");
    assert_eq!(entry.payload, "order-42");
    entry.complete().await.unwrap();
    assert_eq!(queue.stats().completed, 1);

    // The lock's cache entries and the queue's payload entries coexist.
    assert!(cache.exists("greeting").await.unwrap());
}
