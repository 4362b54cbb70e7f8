//! In-memory cache engine.
//!
//! Storage is a `DashMap<String, Entry>`; a secondary `DashMap<String,
//! HashSet<String>>` indexes colon-delimited key prefixes to accelerate
//! `remove_by_prefix`. TTL reaping is both lazy (reads drop expired entries)
//! and proactive, via a single background task per cache instance.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::{validate_key, Cache, CacheError, CacheResult, CacheStats, ExpirationCause, ExpiredListener};
use crate::clock::{system_clock, SharedClock};
use crate::serializer::{JsonSerializer, Serializer};

/// Eviction scoring weights and capacity limits, exposed as configuration
/// rather than buried as magic constants.
#[derive(Debug, Clone)]
pub struct InMemoryCacheConfig {
    /// Evict once the item count exceeds this. `None` disables the check.
    pub max_items: Option<usize>,
    /// Evict once the aggregate tracked size exceeds this. `None` disables
    /// the check; untracked entries (no explicit size hint) count as 0.
    pub max_memory_bytes: Option<u64>,
    /// Weight applied to an entry's size in the eviction score.
    pub size_weight: f64,
    /// Weight applied to `1 / (now - last_access + eps)`.
    pub recency_weight: f64,
    /// Weight applied to `1 / (now - insertion_time + eps)`.
    pub insertion_weight: f64,
    /// The proactive reaper never wakes more often than this, even if an
    /// entry's TTL would otherwise demand it.
    pub min_reap_interval: Duration,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_items: None,
            max_memory_bytes: None,
            size_weight: 0.5,
            recency_weight: 0.3,
            insertion_weight: 0.2,
            min_reap_interval: Duration::from_millis(50),
        }
    }
}

const SCORE_EPSILON_SECS: f64 = 0.001;

enum CacheValue {
    Bytes(Vec<u8>),
    /// Set members keyed by hash, with the original string retained so
    /// `get_set` can return it.
    Set(HashMap<u64, String>),
}

struct Entry {
    value: CacheValue,
    expires_at: Option<DateTime<Utc>>,
    size_bytes: usize,
    last_access: DateTime<Utc>,
    insertion_time: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }
}

fn hash_member(member: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    member.hash(&mut hasher);
    hasher.finish()
}

fn prefix_segments(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut acc = String::new();
    for (i, part) in key.split(':').enumerate() {
        if i > 0 {
            acc.push(':');
        }
        acc.push_str(part);
        segments.push(acc.clone());
    }
    segments
}

/// Shared by both the background reaper task and `read_bytes`'s lazy path:
/// removes every expired entry, deindexes it, adjusts the tracked size, and
/// fires the TTL expiry event for each — the proactive and lazy paths must
/// both raise the event so listeners see every expiry exactly once.
fn reap_expired(
    entries: &DashMap<String, Entry>,
    prefix_index: &DashMap<String, HashSet<String>>,
    total_size: &AtomicU64,
    listeners: &RwLock<Vec<ExpiredListener>>,
    stats: &CacheCounters,
    now: DateTime<Utc>,
) {
    let expired_keys: Vec<String> = entries
        .iter()
        .filter(|e| e.is_expired(now))
        .map(|e| e.key().clone())
        .collect();
    for key in expired_keys {
        if let Some((_, entry)) = entries.remove(&key) {
            total_size.fetch_sub(entry.size_bytes as u64, Ordering::Relaxed);
            for segment in prefix_segments(&key) {
                if let Some(mut set) = prefix_index.get_mut(&segment) {
                    set.remove(&key);
                }
            }
            stats.ttl_expirations.fetch_add(1, Ordering::Relaxed);
            for listener in listeners.read().iter() {
                listener(&key, ExpirationCause::Ttl);
            }
        }
    }
}

pub struct InMemoryCache<S: Serializer = JsonSerializer> {
    entries: Arc<DashMap<String, Entry>>,
    prefix_index: Arc<DashMap<String, HashSet<String>>>,
    config: InMemoryCacheConfig,
    clock: SharedClock,
    serializer: S,
    listeners: Arc<RwLock<Vec<ExpiredListener>>>,
    total_size: Arc<AtomicU64>,
    stats: Arc<CacheCounters>,
    reap_wake: Arc<Notify>,
    shutdown: crate::cancellation::CancelToken,
    reaper: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    removals: AtomicU64,
    ttl_expirations: AtomicU64,
    capacity_evictions: AtomicU64,
}

impl InMemoryCache<JsonSerializer> {
    pub fn new(config: InMemoryCacheConfig) -> Self {
        Self::with_serializer(config, JsonSerializer)
    }
}

impl<S: Serializer + Clone> InMemoryCache<S> {
    pub fn with_serializer(config: InMemoryCacheConfig, serializer: S) -> Self {
        let entries: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());
        let prefix_index: Arc<DashMap<String, HashSet<String>>> = Arc::new(DashMap::new());
        let total_size = Arc::new(AtomicU64::new(0));
        let listeners: Arc<RwLock<Vec<ExpiredListener>>> = Arc::new(RwLock::new(Vec::new()));
        let stats = Arc::new(CacheCounters::default());
        let reap_wake = Arc::new(Notify::new());
        let shutdown = crate::cancellation::CancelToken::new();
        let clock = system_clock();

        let reaper = {
            let entries = entries.clone();
            let prefix_index = prefix_index.clone();
            let total_size = total_size.clone();
            let listeners = listeners.clone();
            let stats = stats.clone();
            let reap_wake = reap_wake.clone();
            let shutdown = shutdown.clone();
            let clock = clock.clone();
            let min_interval = config.min_reap_interval;
            Some(tokio::spawn(async move {
                loop {
                    let next_deadline = entries.iter().filter_map(|e| e.expires_at).min();
                    let sleep_for = match next_deadline {
                        Some(deadline) => {
                            let now = clock.now();
                            let until = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                            until.max(min_interval)
                        }
                        None => Duration::from_secs(3600),
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = reap_wake.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                    reap_expired(&entries, &prefix_index, &total_size, &listeners, &stats, clock.now());
                }
            }))
        };

        Self {
            entries,
            prefix_index,
            config,
            clock,
            serializer,
            listeners,
            total_size,
            stats,
            reap_wake,
            shutdown,
            reaper,
        }
    }

    fn fire_expired(&self, key: &str, cause: ExpirationCause) {
        match cause {
            ExpirationCause::Ttl => {
                self.stats.ttl_expirations.fetch_add(1, Ordering::Relaxed);
            }
            ExpirationCause::Capacity => {
                self.stats.capacity_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        for listener in self.listeners.read().iter() {
            listener(key, cause);
        }
    }

    fn index_key(&self, key: &str) {
        for segment in prefix_segments(key) {
            self.prefix_index.entry(segment).or_default().insert(key.to_string());
        }
    }

    fn deindex_key(&self, key: &str) {
        for segment in prefix_segments(key) {
            if let Some(mut set) = self.prefix_index.get_mut(&segment) {
                set.remove(key);
            }
        }
    }

    fn remove_entry(&self, key: &str) -> Option<Entry> {
        let removed = self.entries.remove(key).map(|(_, e)| e);
        if let Some(entry) = &removed {
            self.total_size.fetch_sub(entry.size_bytes as u64, Ordering::Relaxed);
            self.deindex_key(key);
        }
        removed
    }

    fn insert_entry(&self, key: &str, entry: Entry) {
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.total_size.fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
        } else {
            self.index_key(key);
        }
        let new_size = self.entries.get(key).map(|e| e.size_bytes as u64).unwrap_or(0);
        self.total_size.fetch_add(new_size, Ordering::Relaxed);
        self.reap_wake.notify_one();
        self.maybe_evict();
    }

    fn maybe_evict(&self) {
        let count_over = self.config.max_items.map(|max| self.entries.len() > max).unwrap_or(false);
        let size_over = self
            .config
            .max_memory_bytes
            .map(|max| self.total_size.load(Ordering::Relaxed) > max)
            .unwrap_or(false);
        if !count_over && !size_over {
            return;
        }

        let now = self.clock.now();
        let mut scored: Vec<(String, f64, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|e| {
                let key = e.key().clone();
                let age_access = (now - e.last_access).num_milliseconds() as f64 / 1000.0;
                let age_insert = (now - e.insertion_time).num_milliseconds() as f64 / 1000.0;
                let score = self.config.size_weight * e.size_bytes as f64
                    + self.config.recency_weight * (1.0 / (age_access.max(0.0) + SCORE_EPSILON_SECS))
                    + self.config.insertion_weight * (1.0 / (age_insert.max(0.0) + SCORE_EPSILON_SECS));
                (key, score, e.insertion_time)
            })
            .collect();

        // Highest score evicted first; ties break by oldest insertion time.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.2.cmp(&b.2))
        });

        for (key, _, _) in scored {
            let still_count_over =
                self.config.max_items.map(|max| self.entries.len() > max).unwrap_or(false);
            let still_size_over = self
                .config
                .max_memory_bytes
                .map(|max| self.total_size.load(Ordering::Relaxed) > max)
                .unwrap_or(false);
            if !still_count_over && !still_size_over {
                break;
            }
            if self.remove_entry(&key).is_some() {
                self.fire_expired(&key, ExpirationCause::Capacity);
            }
        }
    }

    /// Returns the live entry's bytes if present and unexpired, lazily
    /// reaping it (and firing the TTL event) otherwise.
    fn read_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.remove_entry(key);
            self.fire_expired(key, ExpirationCause::Ttl);
            return None;
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_access = now;
            match &entry.value {
                CacheValue::Bytes(b) => Some(b.clone()),
                CacheValue::Set(_) => None,
            }
        } else {
            None
        }
    }

    fn ttl_to_expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|d| self.clock.now() + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero()))
    }
}

impl<S: Serializer> Drop for InMemoryCache<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<S: Serializer + Clone> Cache for InMemoryCache<S> {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> CacheResult<Option<T>> {
        validate_key(key)?;
        match self.read_bytes(key) {
            Some(bytes) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(self.serializer.deserialize(&bytes)?))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        validate_key(key)?;
        let bytes = self.serializer.serialize(value)?;
        let now = self.clock.now();
        let size_bytes = bytes.len();
        self.insert_entry(
            key,
            Entry {
                value: CacheValue::Bytes(bytes),
                expires_at: self.ttl_to_expiry(ttl),
                size_bytes,
                last_access: now,
                insertion_time: now,
            },
        );
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn add<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        validate_key(key)?;
        let now = self.clock.now();
        let already_live = self.entries.get(key).map(|e| !e.is_expired(now)).unwrap_or(false);
        if already_live {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn replace<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        validate_key(key)?;
        let now = self.clock.now();
        let already_live = self.entries.get(key).map(|e| !e.is_expired(now)).unwrap_or(false);
        if !already_live {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        let removed = self.remove_entry(key).is_some();
        if removed {
            self.stats.removals.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn remove_all(&self, keys: Option<&[String]>) -> CacheResult<u64> {
        let mut count = 0u64;
        match keys {
            Some(keys) => {
                for key in keys {
                    if self.remove(key).await? {
                        count += 1;
                    }
                }
            }
            None => {
                let all: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
                for key in all {
                    if self.remove_entry(&key).is_some() {
                        count += 1;
                    }
                }
                self.stats.removals.fetch_add(count, Ordering::Relaxed);
            }
        }
        Ok(count)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let candidates: Vec<String> = match self.prefix_index.get(prefix) {
            Some(set) => set.iter().cloned().collect(),
            None => self
                .entries
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect(),
        };
        let mut count = 0u64;
        for key in candidates {
            if self.remove_entry(&key).is_some() {
                count += 1;
            }
        }
        self.stats.removals.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        let now = self.clock.now();
        Ok(self.entries.get(key).map(|e| !e.is_expired(now)).unwrap_or(false))
    }

    async fn get_expiration(&self, key: &str) -> CacheResult<Option<Duration>> {
        validate_key(key)?;
        let now = self.clock.now();
        Ok(self.entries.get(key).and_then(|e| {
            e.expires_at.and_then(|exp| (exp - now).to_std().ok())
        }))
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        validate_key(key)?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = self.ttl_to_expiry(Some(ttl));
        }
        self.reap_wake.notify_one();
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        validate_key(key)?;
        let now = self.clock.now();
        let expires_at = self.ttl_to_expiry(ttl);
        let mut new_value = 0i64;
        let mut is_new = false;
        {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                is_new = true;
                Entry {
                    value: CacheValue::Bytes(Vec::new()),
                    expires_at,
                    size_bytes: 0,
                    last_access: now,
                    insertion_time: now,
                }
            });
            if entry.is_expired(now) {
                is_new = true;
                entry.value = CacheValue::Bytes(Vec::new());
                entry.insertion_time = now;
                entry.expires_at = expires_at;
            }
            let current = match &entry.value {
                CacheValue::Bytes(b) if !b.is_empty() => {
                    std::str::from_utf8(b).ok().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0)
                }
                _ => 0,
            };
            new_value = current + delta;
            let bytes = new_value.to_string().into_bytes();
            entry.size_bytes = bytes.len();
            entry.value = CacheValue::Bytes(bytes);
            entry.last_access = now;
            if ttl.is_some() {
                entry.expires_at = expires_at;
            }
        }
        if is_new {
            self.index_key(key);
        }
        self.reap_wake.notify_one();
        self.maybe_evict();
        Ok(new_value)
    }

    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        self.set_extreme(key, value, ttl, |current, candidate| candidate > current).await
    }

    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        self.set_extreme(key, value, ttl, |current, candidate| candidate < current).await
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> CacheResult<u64> {
        validate_key(key)?;
        let now = self.clock.now();
        let expires_at = self.ttl_to_expiry(ttl);
        let mut added = 0u64;
        let mut is_new = false;
        {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                is_new = true;
                Entry {
                    value: CacheValue::Set(HashMap::new()),
                    expires_at,
                    size_bytes: 0,
                    last_access: now,
                    insertion_time: now,
                }
            });
            if entry.is_expired(now) {
                is_new = true;
                entry.value = CacheValue::Set(HashMap::new());
                entry.insertion_time = now;
                entry.expires_at = expires_at;
            }
            if let CacheValue::Set(map) = &mut entry.value {
                for member in members {
                    if map.insert(hash_member(member), member.clone()).is_none() {
                        added += 1;
                    }
                }
                entry.size_bytes = map.values().map(|v| v.len()).sum();
            }
            entry.last_access = now;
            if ttl.is_some() {
                entry.expires_at = expires_at;
            }
        }
        if is_new {
            self.index_key(key);
        }
        self.reap_wake.notify_one();
        self.maybe_evict();
        Ok(added)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> CacheResult<u64> {
        validate_key(key)?;
        let mut removed = 0u64;
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let CacheValue::Set(map) = &mut entry.value {
                for member in members {
                    if map.remove(&hash_member(member)).is_some() {
                        removed += 1;
                    }
                }
                entry.size_bytes = map.values().map(|v| v.len()).sum();
            }
        }
        Ok(removed)
    }

    async fn get_set(&self, key: &str) -> CacheResult<HashSet<String>> {
        validate_key(key)?;
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(self.clock.now()) => match &entry.value {
                CacheValue::Set(map) => Ok(map.values().cloned().collect()),
                CacheValue::Bytes(_) => Ok(HashSet::new()),
            },
            _ => Ok(HashSet::new()),
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            removals: self.stats.removals.load(Ordering::Relaxed),
            ttl_expirations: self.stats.ttl_expirations.load(Ordering::Relaxed),
            capacity_evictions: self.stats.capacity_evictions.load(Ordering::Relaxed),
            current_items: self.entries.len() as u64,
            current_size_bytes: self.total_size.load(Ordering::Relaxed),
        }
    }

    fn on_item_expired(&self, listener: ExpiredListener) {
        self.listeners.write().push(listener);
    }
}

impl<S: Serializer + Clone> InMemoryCache<S> {
    async fn set_extreme(
        &self,
        key: &str,
        value: i64,
        ttl: Option<Duration>,
        keep_new: impl Fn(i64, i64) -> bool,
    ) -> CacheResult<i64> {
        validate_key(key)?;
        let now = self.clock.now();
        let expires_at = self.ttl_to_expiry(ttl);
        let mut result = value;
        let mut is_new = false;
        {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                is_new = true;
                Entry {
                    value: CacheValue::Bytes(Vec::new()),
                    expires_at,
                    size_bytes: 0,
                    last_access: now,
                    insertion_time: now,
                }
            });
            if entry.is_expired(now) {
                is_new = true;
                entry.value = CacheValue::Bytes(Vec::new());
                entry.insertion_time = now;
                entry.expires_at = expires_at;
            }
            let current = match &entry.value {
                CacheValue::Bytes(b) if !b.is_empty() => {
                    std::str::from_utf8(b).ok().and_then(|s| s.parse::<i64>().ok())
                }
                _ => None,
            };
            result = match current {
                Some(current) if !keep_new(current, value) => current,
                _ => value,
            };
            let bytes = result.to_string().into_bytes();
            entry.size_bytes = bytes.len();
            entry.value = CacheValue::Bytes(bytes);
            entry.last_access = now;
            if ttl.is_some() {
                entry.expires_at = expires_at;
            }
        }
        if is_new {
            self.index_key(key);
        }
        self.reap_wake.notify_one();
        self.maybe_evict();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn cache() -> InMemoryCache {
        InMemoryCache::new(InMemoryCacheConfig::default())
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let c = cache();
        c.set("k", &"v".to_string(), None).await.unwrap();
        let got: Option<String> = c.get("k").await.unwrap();
        assert_eq!(got, Some("v".to_string()));
    }

    #[tokio::test]
    async fn empty_key_is_invalid_argument() {
        let c = cache();
        let err = c.set("", &1i32, None).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn add_fails_when_present() {
        let c = cache();
        assert!(c.add("k", &1i32, None).await.unwrap());
        assert!(!c.add("k", &2i32, None).await.unwrap());
        let got: Option<i32> = c.get("k").await.unwrap();
        assert_eq!(got, Some(1));
    }

    #[tokio::test]
    async fn replace_fails_when_absent() {
        let c = cache();
        assert!(!c.replace("k", &1i32, None).await.unwrap());
        c.set("k", &1i32, None).await.unwrap();
        assert!(c.replace("k", &2i32, None).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_zero_is_immediately_expired() {
        let c = cache();
        c.set("k", &1i32, Some(StdDuration::from_millis(0))).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let got: Option<i32> = c.get("k").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn increment_is_commutative_under_interleaving() {
        let c = Arc::new(cache());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                c.increment("counter", 1, None).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let got: Option<i64> = c.get("counter").await.unwrap();
        assert_eq!(got, Some(10));
    }

    #[tokio::test]
    async fn set_if_higher_keeps_max() {
        let c = cache();
        c.set_if_higher("k", 5, None).await.unwrap();
        c.set_if_higher("k", 3, None).await.unwrap();
        let got: Option<i64> = c.get("k").await.unwrap();
        assert_eq!(got, Some(5));
    }

    #[tokio::test]
    async fn increment_on_expired_key_revives_with_fresh_expiry() {
        let c = cache();
        c.increment("counter", 1, Some(StdDuration::from_millis(0))).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        // The previous entry expired; this increment must treat it as
        // absent and start a fresh, unexpired entry rather than reviving
        // the value under the old (already-passed) expiry.
        let got = c.increment("counter", 5, None).await.unwrap();
        assert_eq!(got, 5);
        let read: Option<i64> = c.get("counter").await.unwrap();
        assert_eq!(read, Some(5));
    }

    #[tokio::test]
    async fn set_semantics_add_remove() {
        let c = cache();
        let added = c
            .set_add("s", &["a".to_string(), "b".to_string()], None)
            .await
            .unwrap();
        assert_eq!(added, 2);
        let removed = c.set_remove("s", &["a".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        let members = c.get_set("s").await.unwrap();
        assert_eq!(members, HashSet::from(["b".to_string()]));
    }

    #[tokio::test]
    async fn remove_by_prefix_uses_colon_segments() {
        let c = cache();
        c.set("q:orders:in", &1i32, None).await.unwrap();
        c.set("q:orders:work", &2i32, None).await.unwrap();
        c.set("q:billing:in", &3i32, None).await.unwrap();
        let removed = c.remove_by_prefix("q:orders").await.unwrap();
        assert_eq!(removed, 2);
        assert!(c.exists("q:billing:in").await.unwrap());
    }

    #[tokio::test]
    async fn eviction_under_memory_limit_keeps_within_budget() {
        let config = InMemoryCacheConfig {
            max_memory_bytes: Some(1024),
            ..Default::default()
        };
        let c = cache_with(config);
        for i in 0..20 {
            let value = vec![0u8; 100];
            c.set(&format!("k{i}"), &value, None).await.unwrap();
        }
        let stats = c.stats();
        assert!(stats.current_size_bytes <= 1024, "size was {}", stats.current_size_bytes);
    }

    fn cache_with(config: InMemoryCacheConfig) -> InMemoryCache {
        InMemoryCache::new(config)
    }

    #[tokio::test]
    async fn explicit_remove_does_not_fire_expired_listener() {
        let c = cache();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        c.on_item_expired(Box::new(move |_, _| {
            fired2.store(true, Ordering::SeqCst);
        }));
        c.set("k", &1i32, None).await.unwrap();
        c.remove("k").await.unwrap();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ttl_expiry_fires_listener_with_ttl_cause() {
        let c = cache();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        c.on_item_expired(Box::new(move |_, cause| {
            *seen2.lock().unwrap() = Some(cause);
        }));
        c.set("k", &1i32, Some(StdDuration::from_millis(0))).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let _: Option<i32> = c.get("k").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(ExpirationCause::Ttl));
    }
}
