//! # Tally Runtime
//!
//! The moving parts every tally service runs next to its command handlers.
//!
//! ## Components
//!
//! - **Outbox publisher**: drains committed outbox records to the bus
//! - **Event consumer**: routes inbound events to idempotent handlers, with
//!   retry and a dead-letter topic
//! - **Retry**: exponential backoff shared by consumers, cross-service calls
//!   and optimistic-concurrency loops
//! - **Config, telemetry, metrics, shutdown**: service process plumbing
//!
//! ## Example
//!
//! ```ignore
//! use tally_runtime::{consumer::EventConsumer, publisher::OutboxPublisher, shutdown::Shutdown};
//!
//! let shutdown = Shutdown::new();
//! let publisher = OutboxPublisher::new(outbox, bus.clone(), "ledger-events", config.outbox.clone());
//! let consumer = EventConsumer::new(bus, "card-events").with_handler(CardCreatedHandler::new(resolver));
//!
//! tokio::spawn(async move { publisher.run(shutdown.subscribe()).await });
//! consumer.run(shutdown.subscribe()).await?;
//! ```

/// Environment-driven service configuration
pub mod config;

/// Inbound event handling with retry and dead-lettering
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Transactional outbox publishing
pub mod publisher;

/// Retry logic with exponential backoff
pub mod retry;

/// Graceful shutdown signalling
pub mod shutdown;

/// Tracing subscriber setup
pub mod telemetry;

pub use consumer::{ConsumeOutcome, EventConsumer, EventContext, EventHandler};
pub use publisher::{OutboxPublisher, PublishReport};
pub use retry::RetryPolicy;
pub use shutdown::{Shutdown, ShutdownSignal};
