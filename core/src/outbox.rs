//! Transactional outbox.
//!
//! A state change and the event describing it are committed together: the
//! command builds a [`Commit`] holding its entity writes, its idempotency
//! record (if keyed) and its [`OutboxRecord`]s, and the store applies all of
//! it in one transaction or none of it. A background publisher later drains
//! unpublished records to the bus through [`OutboxStore`].

use crate::StoreFuture;
use crate::correlation::CorrelationId;
use crate::event::{DomainEvent, EventEnvelope};
use crate::idempotency::IdempotencyRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable record of an event awaiting publication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Row id
    pub id: Uuid,
    /// Aggregate kind, e.g. `"card"`
    pub aggregate_type: String,
    /// Aggregate id; the broker key
    pub aggregate_id: String,
    /// Correlation id of the operation that wrote the row
    pub correlation_id: Option<String>,
    /// Event type discriminator
    pub event_type: String,
    /// Event body
    pub payload: serde_json::Value,
    /// Insertion time; publication order
    pub created_at: DateTime<Utc>,
    /// Set once, when the broker confirmed the message
    pub published: bool,
    /// Failed publish attempts
    pub retry_count: u32,
    /// Text of the last publish failure
    pub last_error: Option<String>,
    /// Set when the row exhausted its failure budget
    pub parked_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Record a domain event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event payload cannot be encoded.
    pub fn for_event<E: DomainEvent + ?Sized>(
        aggregate_type: &str,
        event: &E,
        correlation_id: Option<&CorrelationId>,
        at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: event.aggregate_id(),
            correlation_id: correlation_id.map(|c| c.as_str().to_string()),
            event_type: event.event_type().to_string(),
            payload: event.to_payload()?,
            created_at: at,
            published: false,
            retry_count: 0,
            last_error: None,
            parked_at: None,
        })
    }

    /// Wire envelope for this record.
    #[must_use]
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            correlation_id: self.correlation_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Publisher-side access to the outbox table.
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` unpublished, unparked records, oldest first.
    fn fetch_unpublished(&self, limit: usize) -> StoreFuture<'_, Vec<OutboxRecord>>;

    /// Flip `published` to true if it is still false.
    ///
    /// Returns `false` when another publisher got there first.
    fn mark_published(&self, id: Uuid) -> StoreFuture<'_, bool>;

    /// Count a failed publish attempt; returns the new retry count.
    fn record_failure(&self, id: Uuid, error: String) -> StoreFuture<'_, u32>;

    /// Exclude a record from polling.
    fn park(&self, id: Uuid, at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Return every parked record to the queue with a fresh failure budget.
    ///
    /// Returns the number of requeued rows.
    fn requeue_parked(&self) -> StoreFuture<'_, u64>;
}

/// One atomic unit of work.
///
/// `W` is the service's own write type (insert account, update card, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Commit<W> {
    /// Entity writes, applied in order
    pub writes: Vec<W>,
    /// Idempotency record for keyed commands
    pub idempotency: Option<IdempotencyRecord>,
    /// Events describing the writes
    pub outbox: Vec<OutboxRecord>,
}

impl<W> Default for Commit<W> {
    fn default() -> Self {
        Self {
            writes: Vec::new(),
            idempotency: None,
            outbox: Vec::new(),
        }
    }
}

impl<W> Commit<W> {
    /// An empty commit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity write.
    #[must_use]
    pub fn write(mut self, write: W) -> Self {
        self.writes.push(write);
        self
    }

    /// Attach the idempotency record, if any.
    #[must_use]
    pub fn idempotency(mut self, record: Option<IdempotencyRecord>) -> Self {
        self.idempotency = record;
        self
    }

    /// Add an outbox record.
    #[must_use]
    pub fn event(mut self, record: OutboxRecord) -> Self {
        self.outbox.push(record);
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct CardCreated {
        user_id: String,
    }

    impl DomainEvent for CardCreated {
        fn event_type(&self) -> &'static str {
            "CARD_CREATED"
        }

        fn aggregate_id(&self) -> String {
            self.user_id.clone()
        }
    }

    #[test]
    fn record_captures_event_and_correlation() {
        let cid = CorrelationId::new("req-7");
        let event = CardCreated {
            user_id: "u-1".into(),
        };
        let record = OutboxRecord::for_event("card", &event, Some(&cid), Utc::now()).unwrap();

        assert_eq!(record.event_type, "CARD_CREATED");
        assert_eq!(record.aggregate_id, "u-1");
        assert_eq!(record.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(record.payload["userId"], "u-1");
        assert!(!record.published);
        assert_eq!(record.retry_count, 0);

        let envelope = record.to_envelope();
        assert_eq!(envelope.event_type, "CARD_CREATED");
        assert_eq!(envelope.correlation_id.as_deref(), Some("req-7"));
    }

    #[test]
    fn commit_builder_collects_parts() {
        let commit = Commit::new().write(1).write(2).idempotency(None);
        assert_eq!(commit.writes, vec![1, 2]);
        assert!(commit.outbox.is_empty());
    }
}
