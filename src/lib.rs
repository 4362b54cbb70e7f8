//! # foundatio-rs
//!
//! Pluggable application building blocks: a cache, a message bus, a lock
//! provider, a reliable work queue, and a job runner tying them together.
//! Every capability is a trait with at least one in-memory implementation;
//! the in-memory implementations are production-usable for a single
//! process and the seam other backends (Redis, a message broker) plug into.
//!
//! ## Modules
//!
//! - `cache`: get/set/TTL/atomic-counter storage with LRU-ish eviction
//! - `bus`: typed publish/subscribe with interface-based routing
//! - `lock`: distributed mutex and fixed-window throttle, one trait
//! - `queue`: retry/dead-letter reliable work queue
//! - `jobs`: typed background job dispatch over a queue, bus, and lock
//! - `clock`, `cancellation`, `serializer`, `metrics`: ambient collaborators
//!   every capability above is built on

#![warn(missing_docs)]
#![warn(clippy::all)]

// Ambient collaborators every capability module depends on.
pub mod cancellation;
pub mod clock;
pub mod metrics;
pub mod serializer;

// Cache capability.
pub mod cache;

// Message bus capability.
pub mod bus;

// Distributed lock / throttle capability.
pub mod lock;

// Reliable queue capability.
pub mod queue;

// Work-item job runner built on queue + bus + lock.
pub mod jobs;

// Re-export the surface most callers reach for first.
pub use bus::{Message, MessageBus, MessageOptions};
pub use cache::{Cache, CacheError};
pub use cancellation::CancelToken;
pub use clock::{Clock, SharedClock};
pub use jobs::{JobError, JobResult, JobRunner, JobRunnerConfig, WorkItem, WorkItemContext, WorkItemHandler};
pub use lock::{LockError, LockHandle, LockProvider};
pub use metrics::MetricsSink;
pub use queue::{Queue, QueueEntry, QueueError};
pub use serializer::Serializer;

/// Crate version, mirrored from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, mirrored from `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
