//! # EventBus Abstraction
//!
//! A typed publish/subscribe bus for fanning domain events out to listeners.
//!
//! ## Why a typed bus
//!
//! Producers publish values of a single event type `E` (usually an enum) and
//! listeners register an [`EventHandler<E>`] against a subject pattern. The
//! compiler checks that every producer and listener agree on the event shape,
//! so there is no reflection-based listener registry to keep in sync.
//!
//! ## Delivery semantics
//!
//! - Events are published **after** the producer's state change is durable.
//!   A failing handler is retried with backoff and then logged; it never
//!   propagates back to the publisher.
//! - Delivery is at-least-once from a handler's point of view (a producer may
//!   republish after a crash), so handlers must be idempotent.
//!
//! ## Usage
//!
//! ```rust
//! use event_bus::{Event, EventBus, EventEnvelope, EventHandler, HandlerError, InMemoryBus};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, serde::Serialize)]
//! enum AccountEvent {
//!     Opened { id: i64 },
//! }
//!
//! impl Event for AccountEvent {
//!     fn subject(&self) -> &'static str {
//!         match self {
//!             AccountEvent::Opened { .. } => "accounts.opened",
//!         }
//!     }
//! }
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl EventHandler<AccountEvent> for Printer {
//!     fn name(&self) -> &'static str {
//!         "printer"
//!     }
//!
//!     async fn handle(&self, envelope: &EventEnvelope<AccountEvent>) -> Result<(), HandlerError> {
//!         println!("{:?}", envelope.payload);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: InMemoryBus<AccountEvent> = InMemoryBus::new("accounts");
//! bus.subscribe("accounts.>", Arc::new(Printer))?;
//! bus.publish(AccountEvent::Opened { id: 7 }).await?;
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod subject;

pub use envelope::EventEnvelope;
pub use inmemory_bus::InMemoryBus;
pub use subject::{subject_matches, validate_pattern};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// An event that can travel over the bus.
///
/// `subject` is a dot-separated routing key such as `payments.payment.captured`.
pub trait Event: Clone + Send + Sync + 'static {
    fn subject(&self) -> &'static str;
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish event: {0}")]
    PublishError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Error returned by a listener.
///
/// `Transient` failures are retried by the bus; `Permanent` failures are
/// logged immediately without retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("transient handler failure: {0}")]
    Transient(String),

    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn permanent(msg: impl fmt::Display) -> Self {
        Self::Permanent(msg.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Identifier returned from [`EventBus::subscribe`], usable with `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A listener for events of type `E`.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Short stable name used in logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), HandlerError>;
}

/// Core event bus abstraction
#[async_trait]
pub trait EventBus<E: Event>: Send + Sync {
    /// Publish an event to every handler whose pattern matches its subject.
    ///
    /// Handlers run to completion (including retries) before this returns.
    /// Handler failures are logged and swallowed.
    async fn publish(&self, event: E) -> BusResult<EventEnvelope<E>>;

    /// Register a handler for a subject pattern (supports `*` and `>`).
    fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler<E>>)
        -> BusResult<SubscriptionId>;

    /// Remove a previously registered handler. Returns false if it was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

impl<E: Event> fmt::Debug for dyn EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
