//! Integration events and their wire format.
//!
//! Services talk to each other only through events. An event is written to
//! the outbox as a JSON payload and published wrapped in an
//! [`EventEnvelope`]:
//!
//! ```json
//! {"type": "CARD_CREATED", "aggregateId": "…", "correlationId": "…", "payload": {…}}
//! ```
//!
//! The broker key is the aggregate id, so events of one aggregate stay in one
//! partition and keep their order.
//!
//! # Example
//!
//! ```
//! use serde::Serialize;
//! use tally_core::event::DomainEvent;
//!
//! #[derive(Serialize)]
//! #[serde(rename_all = "camelCase")]
//! struct UserBlocked {
//!     user_id: String,
//! }
//!
//! impl DomainEvent for UserBlocked {
//!     fn event_type(&self) -> &'static str {
//!         "USER_BLOCKED"
//!     }
//!
//!     fn aggregate_id(&self) -> String {
//!         self.user_id.clone()
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// An event a service emits through its outbox.
pub trait DomainEvent: Serialize + Send + Sync {
    /// Stable type discriminator, e.g. `"USER_CREATED"`.
    fn event_type(&self) -> &'static str;

    /// Id of the aggregate the event is about; used as the broker key.
    fn aggregate_id(&self) -> String;

    /// JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be represented as JSON.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Reasons an inbound message is rejected before reaching a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The message had no body.
    #[error("Empty message body")]
    Empty,

    /// The body is not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// A required envelope field is missing or has the wrong type.
    #[error("Missing or invalid envelope field '{0}'")]
    MissingField(&'static str),
}

/// Wire envelope of every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event type discriminator
    #[serde(rename = "type")]
    pub event_type: String,
    /// Aggregate the event is about
    #[serde(default)]
    pub aggregate_id: String,
    /// Correlation id of the operation that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event-specific body
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate an inbound body.
    ///
    /// The payload is kept as raw JSON; typing it is the handler's job, so a
    /// payload that does not fit the handler is distinguishable from a broken
    /// envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] for an empty body, invalid JSON, or a missing
    /// `type` or `payload`.
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(EnvelopeError::Empty);
        }
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        let serde_json::Value::Object(mut map) = value else {
            return Err(EnvelopeError::MissingField("type"));
        };

        let event_type = match map.remove("type") {
            Some(serde_json::Value::String(t)) if !t.trim().is_empty() => t,
            _ => return Err(EnvelopeError::MissingField("type")),
        };
        let payload = match map.remove("payload") {
            Some(serde_json::Value::Null) | None => {
                return Err(EnvelopeError::MissingField("payload"));
            }
            Some(payload) => payload,
        };
        let aggregate_id = match map.remove("aggregateId") {
            Some(serde_json::Value::String(id)) => id,
            _ => String::new(),
        };
        let correlation_id = match map.remove("correlationId") {
            Some(serde_json::Value::String(id)) => Some(id),
            _ => None,
        };

        Ok(Self {
            event_type,
            aggregate_id,
            correlation_id,
            payload,
        })
    }
}

/// A message as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BusMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    /// Raw body
    pub payload: Vec<u8>,
    /// Value of the correlation header
    pub correlation_id: Option<String>,
    /// Partition, when delivered by a partitioned broker
    pub partition: Option<i32>,
    /// Offset within the partition
    pub offset: Option<i64>,
}

impl BusMessage {
    /// Build an outbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            ..Self::default()
        }
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the correlation header.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// A received message plus the means to acknowledge it.
///
/// Brokers with offsets commit only once the delivery is acknowledged.
/// Dropping a delivery without acknowledging leaves it for redelivery.
#[derive(Debug)]
pub struct Delivery {
    /// The received message
    pub message: BusMessage,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    #[must_use]
    pub const fn new(message: BusMessage) -> Self {
        Self { message, ack: None }
    }

    /// A delivery whose acknowledgement is observed through the receiver.
    #[must_use]
    pub fn with_ack(message: BusMessage) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Acknowledge processing.
    pub fn ack(self) {
        if let Some(tx) = self.ack {
            // Receiver gone means the subscription is shutting down.
            let _ = tx.send(());
        }
    }
}
