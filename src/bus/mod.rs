//! Typed publish/subscribe message bus.
//!
//! Rust has no runtime reflection, so routing is driven by an explicit
//! registry instead: every publishable type implements [`Message`] and
//! declares the short, stable "interface" ids it satisfies. A subscription
//! filters on one such id; a concrete type is routed to a subscriber iff
//! the id the subscriber registered for is either the concrete type's own
//! id, one of its declared interface ids, or the wildcard `"*"`, which
//! matches everything.

pub mod memory;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryMessageBus;

/// Wildcard filter matching every published message, regardless of type.
pub const ANY_TYPE: &str = "*";

#[derive(Error, Debug)]
pub enum BusError {
    #[error("operation was cancelled")]
    Cancelled,

    #[error("message deserialization failed: {0}")]
    Deserialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// A type that can be published on the bus. `type_name` is the short
/// stable id this concrete type is addressed by; `interfaces` lists the
/// additional ids (supertypes/marker traits) it should also be routed to.
pub trait Message: Send + Sync + 'static {
    fn type_name() -> &'static str
    where
        Self: Sized;

    fn interfaces() -> &'static [&'static str]
    where
        Self: Sized,
    {
        &[]
    }
}

/// Delivery options accompanying a publish call.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Holds the message in a delayed-delivery set until this much time has
    /// elapsed, instead of delivering immediately.
    pub delivery_delay: Option<Duration>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
}

/// Metadata accompanying a delivered message. The payload itself is
/// delivered separately, already downcast to `T` for a typed subscriber, or
/// as `Arc<dyn Any + Send + Sync>` for a raw subscriber.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub type_name: &'static str,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
}

pub(crate) type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
pub(crate) type RawPayload = Arc<dyn Any + Send + Sync>;

/// Handle to a live subscription. Dropping it does not cancel the
/// subscription — the registered [`crate::cancellation::CancelToken`] is
/// the single source of truth for that; the id here is for diagnostics only.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped_no_subscribers: u64,
    pub subscriber_errors: u64,
    pub pending_delayed: u64,
}

#[async_trait::async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publishes a typed value. Routes to every live subscription whose
    /// filter matches `T`'s type id, its declared interfaces, or `"*"`.
    async fn publish<T: Message>(
        &self,
        value: T,
        options: MessageOptions,
        cancel: &crate::cancellation::CancelToken,
    ) -> BusResult<()>;

    /// Publishes a message whose type is known only by name, bypassing
    /// static type routing entirely. Raw publishes are routed only to
    /// subscribers registered via [`MessageBus::subscribe_raw`] that opted
    /// in to a matching filter (or `"*"`) — never silently merged into
    /// typed-subscriber delivery, since a raw payload carries no statically
    /// checkable type for a typed subscriber to downcast into.
    async fn publish_raw(
        &self,
        type_name: &str,
        payload: RawPayload,
        options: MessageOptions,
        cancel: &crate::cancellation::CancelToken,
    ) -> BusResult<()>;

    /// Subscribes to messages whose type id, declared interfaces, or `"*"`
    /// matches `T`. The handler receives the message already downcast to
    /// `Arc<T>`.
    fn subscribe<T, F, Fut>(
        &self,
        handler: F,
        cancel: crate::cancellation::CancelToken,
    ) -> Subscription
    where
        T: Message,
        F: Fn(Arc<T>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    /// Subscribes to a raw filter (a type name, or [`ANY_TYPE`]) without
    /// casting; the handler receives the envelope and the untyped payload.
    fn subscribe_raw<F, Fut>(
        &self,
        filter: &str,
        handler: F,
        cancel: crate::cancellation::CancelToken,
    ) -> Subscription
    where
        F: Fn(RawPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    fn stats(&self) -> BusStats;
}
