//! Event bus abstraction for cross-service communication.
//!
//! The outbox publisher pushes envelopes onto the bus; each service's
//! consumer subscribes to the topics it reacts to.
//!
//! ```text
//! ┌───────────────┐   publish    ┌───────────┐  subscribe   ┌──────────────┐
//! │ Outbox        │─────────────►│ EventBus  │─────────────►│ EventConsumer│
//! │ publisher     │              │           │              │ (per service)│
//! └───────────────┘              └───────────┘              └──────┬───────┘
//!                                      ▲                           │
//!                                      └──────── {topic}.DLT ──────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message may arrive more than once, so
//!   every handler is idempotent
//! - **Ordered within partition**: messages share a partition by key
//!   (aggregate id), so one aggregate's events keep their order
//! - **Explicit acknowledgement**: a [`Delivery`] is acknowledged once the
//!   consumer is done with it; unacknowledged deliveries come back
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (tally-testing) for tests
//! - `RedpandaEventBus` (tally-redpanda) for production

use crate::event::{BusMessage, Delivery};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group or offset commit error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of deliveries from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Publish/subscribe transport.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be shared as
/// `Arc<dyn EventBus>` between the publisher and consumers.
pub trait EventBus: Send + Sync {
    /// Publish a message to `message.topic`, keyed by `message.key` and
    /// carrying `message.correlation_id` as the correlation header.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects or does
    /// not confirm the message.
    fn publish(
        &self,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
