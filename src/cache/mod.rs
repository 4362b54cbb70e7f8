//! Cache capability surface.
//!
//! An in-process, in-memory implementation ([`InMemoryCache`]) backs the
//! full capability surface a cache provider exposes: typed get/set, atomic
//! increment, set semantics, prefix removal, and expiry events.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::{InMemoryCache, InMemoryCacheConfig};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] crate::serializer::SerializerError),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Why an entry was removed from the cache. Fired only for TTL and capacity
/// evictions; explicit `remove` calls never raise this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationCause {
    Ttl,
    Capacity,
}

/// A listener registered via [`Cache::on_item_expired`].
pub type ExpiredListener = Box<dyn Fn(&str, ExpirationCause) + Send + Sync>;

/// Point-in-time counters for a cache instance.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub removals: u64,
    pub ttl_expirations: u64,
    pub capacity_evictions: u64,
    pub current_items: u64,
    pub current_size_bytes: u64,
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

/// The cache capability. In-process callers use [`InMemoryCache`]; an
/// external (Redis, etc.) backend would implement this same trait, which is
/// why every fallible operation returns [`CacheResult`] rather than
/// panicking, even though the in-memory engine itself is infallible except
/// for argument validation.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> CacheResult<Option<T>>;

    async fn get_many<T: DeserializeOwned + Send>(
        &self,
        keys: &[String],
    ) -> CacheResult<HashMap<String, T>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get::<T>(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    /// Succeeds only if `key` is absent.
    async fn add<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    /// Succeeds only if `key` is present.
    async fn replace<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    async fn set_all<T: Serialize + Send + Sync>(
        &self,
        values: &HashMap<String, T>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        for (key, value) in values {
            self.set(key, value, ttl).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<bool>;

    /// Removes the given keys, or every key if `keys` is `None`. Returns
    /// the number actually removed.
    async fn remove_all(&self, keys: Option<&[String]>) -> CacheResult<u64>;

    async fn remove_by_prefix(&self, prefix: &str) -> CacheResult<u64>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    async fn get_expiration(&self, key: &str) -> CacheResult<Option<Duration>>;

    async fn set_expiration(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Atomic add; creates the key with `delta` if absent. Negative `delta`
    /// implements decrement.
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> CacheResult<i64>;

    async fn decrement(&self, key: &str, delta: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        self.increment(key, -delta, ttl).await
    }

    /// Stores `value` only if it is greater than the current stored number
    /// (or if absent).
    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> CacheResult<i64>;

    /// Stores `value` only if it is lower than the current stored number
    /// (or if absent).
    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> CacheResult<i64>;

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> CacheResult<u64>;

    async fn set_remove(&self, key: &str, members: &[String]) -> CacheResult<u64>;

    async fn get_set(&self, key: &str) -> CacheResult<HashSet<String>>;

    /// Returns a snapshot of current counters.
    fn stats(&self) -> CacheStats;

    /// Registers a listener invoked for TTL/capacity-caused evictions.
    /// Listeners are invoked over a snapshot of the registered list, so a
    /// listener mutating the registry mid-dispatch cannot corrupt iteration.
    fn on_item_expired(&self, listener: ExpiredListener);
}
