//! Idempotent, retrying event consumers.
//!
//! An [`EventConsumer`] subscribes to one topic and routes each message to
//! the [`EventHandler`] registered for its event type:
//!
//! - a body that is not a valid envelope is logged and discarded
//! - an event type with no handler is ignored
//! - a payload the handler's type cannot read goes straight to the
//!   dead-letter topic
//! - a failing handler is retried with [`RetryPolicy::consumer`], and the
//!   message is dead-lettered once the attempts run out
//!
//! Dead-lettered messages keep their original key and body and are published
//! to `<topic>.DLT`. A message is acknowledged only after its outcome is
//! final; when the dead-letter publish itself fails it stays unacknowledged.
//!
//! Handlers must be idempotent: redelivery of an applied event is normal.

use crate::metrics::ConsumerMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::shutdown::ShutdownSignal;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tally_core::correlation::CorrelationId;
use tally_core::error::LedgerError;
use tally_core::event::{BusMessage, EventEnvelope};
use tally_core::event_bus::{EventBus, EventBusError};
use tracing::Instrument;

/// Suffix of dead-letter topics.
pub const DEAD_LETTER_SUFFIX: &str = ".DLT";

/// Dead-letter topic for `topic`.
#[must_use]
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}{DEAD_LETTER_SUFFIX}")
}

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Source topic
    pub topic: String,
    /// Envelope event type
    pub event_type: String,
    /// Envelope aggregate id
    pub aggregate_id: String,
    /// Correlation id from the message header, or synthesized
    pub correlation_id: CorrelationId,
}

/// Applies one event type.
pub trait EventHandler: Send + Sync + 'static {
    /// Payload shape expected under the envelope's `payload`.
    type Payload: DeserializeOwned + Clone + Send + Sync;

    /// Event type this handler accepts.
    fn event_type(&self) -> &'static str;

    /// Apply the event. Errors are retried.
    fn handle(
        &self,
        payload: Self::Payload,
        ctx: &EventContext,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;
}

/// Final outcome of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Handler succeeded
    Applied {
        /// Attempts it took
        attempts: usize,
    },
    /// No handler for the event type
    Ignored,
    /// Body was not a valid envelope
    Discarded(String),
    /// Published to the dead-letter topic
    DeadLettered {
        /// Why it was given up on
        reason: String,
        /// Handler attempts made; zero when the payload was unreadable
        attempts: usize,
    },
}

impl ConsumeOutcome {
    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Ignored => "ignored",
            Self::Discarded(_) => "discarded",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

enum Dispatch {
    Applied { attempts: usize },
    Poison(String),
    Exhausted { error: LedgerError, attempts: usize },
}

trait Route: Send + Sync {
    fn event_type(&self) -> &'static str;

    fn dispatch<'a>(
        &'a self,
        payload: &'a serde_json::Value,
        ctx: &'a EventContext,
        policy: &'a RetryPolicy,
    ) -> BoxFuture<'a, Dispatch>;
}

struct HandlerRoute<H> {
    handler: H,
}

impl<H: EventHandler> Route for HandlerRoute<H> {
    fn event_type(&self) -> &'static str {
        self.handler.event_type()
    }

    fn dispatch<'a>(
        &'a self,
        payload: &'a serde_json::Value,
        ctx: &'a EventContext,
        policy: &'a RetryPolicy,
    ) -> BoxFuture<'a, Dispatch> {
        Box::pin(async move {
            let typed: H::Payload = match serde_json::from_value(payload.clone()) {
                Ok(typed) => typed,
                Err(e) => return Dispatch::Poison(format!("unreadable payload: {e}")),
            };

            let attempts = AtomicUsize::new(0);
            let counter = &attempts;
            let handler = &self.handler;
            let result = retry_with_backoff(policy.clone(), move || {
                counter.fetch_add(1, Ordering::Relaxed);
                handler.handle(typed.clone(), ctx)
            })
            .await;

            let attempts = attempts.load(Ordering::Relaxed);
            match result {
                Ok(()) => Dispatch::Applied { attempts },
                Err(error) => Dispatch::Exhausted { error, attempts },
            }
        })
    }
}

/// Consumer for one topic.
pub struct EventConsumer {
    bus: Arc<dyn EventBus>,
    topic: String,
    routes: Vec<Box<dyn Route>>,
    retry: RetryPolicy,
}

impl EventConsumer {
    /// A consumer with no handlers and the default consumer retry policy.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            routes: Vec::new(),
            retry: RetryPolicy::consumer(),
        }
    }

    /// Register a handler. A later handler for the same event type wins.
    #[must_use]
    pub fn with_handler<H: EventHandler>(mut self, handler: H) -> Self {
        let event_type = handler.event_type();
        self.routes.retain(|route| route.event_type() != event_type);
        self.routes.push(Box::new(HandlerRoute { handler }));
        self
    }

    /// Replace the handler retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Take one message to its final outcome.
    ///
    /// # Errors
    ///
    /// Returns the bus error when a dead-letter publish fails; the message
    /// must then not be acknowledged.
    pub async fn process(&self, message: &BusMessage) -> Result<ConsumeOutcome, EventBusError> {
        let started = Instant::now();
        let envelope = match EventEnvelope::parse(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    partition = ?message.partition,
                    offset = ?message.offset,
                    error = %e,
                    "Discarding malformed message"
                );
                let outcome = ConsumeOutcome::Discarded(e.to_string());
                ConsumerMetrics::record_outcome(&self.topic, outcome.label(), started.elapsed());
                return Ok(outcome);
            }
        };

        let correlation_id = CorrelationId::from_message_header(
            message
                .correlation_id
                .as_deref()
                .or(envelope.correlation_id.as_deref()),
        );
        let span = tracing::info_span!(
            "consume",
            topic = %self.topic,
            event_type = %envelope.event_type,
            aggregate_id = %envelope.aggregate_id,
            correlation_id = %correlation_id,
        );

        let outcome = self
            .route(message, &envelope, correlation_id)
            .instrument(span)
            .await?;
        ConsumerMetrics::record_outcome(&self.topic, outcome.label(), started.elapsed());
        Ok(outcome)
    }

    async fn route(
        &self,
        message: &BusMessage,
        envelope: &EventEnvelope,
        correlation_id: CorrelationId,
    ) -> Result<ConsumeOutcome, EventBusError> {
        let Some(route) = self
            .routes
            .iter()
            .find(|route| route.event_type() == envelope.event_type)
        else {
            tracing::debug!("No handler for event type, ignoring");
            return Ok(ConsumeOutcome::Ignored);
        };

        let ctx = EventContext {
            topic: self.topic.clone(),
            event_type: envelope.event_type.clone(),
            aggregate_id: envelope.aggregate_id.clone(),
            correlation_id,
        };

        match route.dispatch(&envelope.payload, &ctx, &self.retry).await {
            Dispatch::Applied { attempts } => {
                tracing::debug!(attempts, "Event applied");
                Ok(ConsumeOutcome::Applied { attempts })
            }
            Dispatch::Poison(reason) => {
                self.dead_letter(message, &ctx, &reason).await?;
                Ok(ConsumeOutcome::DeadLettered {
                    reason,
                    attempts: 0,
                })
            }
            Dispatch::Exhausted { error, attempts } => {
                let reason = error.to_string();
                self.dead_letter(message, &ctx, &reason).await?;
                Ok(ConsumeOutcome::DeadLettered { reason, attempts })
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &BusMessage,
        ctx: &EventContext,
        reason: &str,
    ) -> Result<(), EventBusError> {
        let mut dead = BusMessage::new(dead_letter_topic(&self.topic), message.payload.clone())
            .with_correlation_id(Some(ctx.correlation_id.as_str().to_string()));
        dead.key.clone_from(&message.key);

        self.bus.publish(&dead).await?;
        ConsumerMetrics::record_dead_letter(&self.topic);
        tracing::error!(
            dead_letter_topic = %dead.topic,
            partition = ?message.partition,
            offset = ?message.offset,
            reason,
            "Message moved to dead-letter topic"
        );
        Ok(())
    }

    /// Consume until shutdown or until the subscription ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), EventBusError> {
        let mut stream = self.bus.subscribe(&[self.topic.as_str()]).await?;
        tracing::info!(topic = %self.topic, handlers = self.routes.len(), "Consumer started");

        loop {
            let next = tokio::select! {
                () = shutdown.triggered() => break,
                next = stream.next() => next,
            };

            match next {
                None => {
                    tracing::warn!(topic = %self.topic, "Subscription ended");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(topic = %self.topic, error = %e, "Failed to receive message");
                }
                Some(Ok(delivery)) => match self.process(&delivery.message).await {
                    Ok(_) => delivery.ack(),
                    Err(e) => tracing::error!(
                        topic = %self.topic,
                        partition = ?delivery.message.partition,
                        offset = ?delivery.message.offset,
                        error = %e,
                        "Dead-letter publish failed, leaving message unacknowledged"
                    ),
                },
            }
        }

        tracing::info!(topic = %self.topic, "Consumer stopped");
        Ok(())
    }
}
