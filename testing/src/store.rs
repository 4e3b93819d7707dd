//! In-memory transactional store.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::idempotency::{
    IDEMPOTENCY_KEY_CONSTRAINT, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
};
use tally_core::outbox::{Commit, OutboxRecord, OutboxStore};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A service write applied to in-memory tables.
pub trait TableWrite<S>: Send {
    /// Reject the write against the current tables, without side effects.
    ///
    /// # Errors
    ///
    /// The error the real store would raise: a unique violation, a version
    /// conflict, a missing row.
    fn check(&self, tables: &S) -> Result<(), LedgerError>;

    /// Apply a checked write.
    fn apply(self, tables: &mut S);
}

struct State<S> {
    tables: S,
    idempotency: HashMap<String, IdempotencyRecord>,
    outbox: Vec<OutboxRecord>,
    failures: VecDeque<LedgerError>,
    stale_lookups: usize,
}

/// Service tables, idempotency records and outbox behind one lock.
///
/// A [`Commit`] either lands entirely or not at all, like a database
/// transaction.
pub struct InMemoryStore<S> {
    state: Mutex<State<S>>,
}

impl<S: Default> Default for InMemoryStore<S> {
    fn default() -> Self {
        Self::with_tables(S::default())
    }
}

impl<S: Default> InMemoryStore<S> {
    /// A store with empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> InMemoryStore<S> {
    /// A store seeded with `tables`.
    #[must_use]
    pub fn with_tables(tables: S) -> Self {
        Self {
            state: Mutex::new(State {
                tables,
                idempotency: HashMap::new(),
                outbox: Vec::new(),
                failures: VecDeque::new(),
                stale_lookups: 0,
            }),
        }
    }
}

impl<S: Clone + Send + Sync> InMemoryStore<S> {
    /// Apply a commit atomically.
    ///
    /// # Errors
    ///
    /// Returns an injected failure, the first failing write check, or a unique
    /// violation on the idempotency key. Writes are checked before the key, the
    /// order in which the `PostgreSQL` stores insert rows. Nothing is applied
    /// on error.
    pub async fn commit<W: TableWrite<S>>(&self, commit: Commit<W>) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let mut staged = state.tables.clone();
        for write in commit.writes {
            write.check(&staged)?;
            write.apply(&mut staged);
        }

        if let Some(record) = &commit.idempotency {
            if state.idempotency.contains_key(record.key.as_str()) {
                return Err(LedgerError::UniqueViolation {
                    constraint: IDEMPOTENCY_KEY_CONSTRAINT.to_string(),
                });
            }
        }

        state.tables = staged;
        if let Some(record) = commit.idempotency {
            state.idempotency.insert(record.key.as_str().to_string(), record);
        }
        state.outbox.extend(commit.outbox);
        Ok(())
    }

    /// Read the tables.
    pub async fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.state.lock().await.tables)
    }

    /// Every outbox record, in insertion order.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.outbox.clone()
    }

    /// Append records directly to the outbox.
    pub async fn append_outbox(&self, records: impl IntoIterator<Item = OutboxRecord>) {
        self.state.lock().await.outbox.extend(records);
    }

    /// Number of stored idempotency records.
    pub async fn idempotency_count(&self) -> usize {
        self.state.lock().await.idempotency.len()
    }

    /// Fail the next commits with `errors`, one per commit.
    pub async fn inject_commit_failures(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state.lock().await.failures.extend(errors);
    }

    /// Answer the next `count` idempotency lookups with `None`, as a lookup
    /// that ran before a concurrent request committed its key would.
    pub async fn stale_idempotency_lookups(&self, count: usize) {
        self.state.lock().await.stale_lookups += count;
    }
}

impl<S: Send + Sync> IdempotencyStore for InMemoryStore<S> {
    fn find_idempotency(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.stale_lookups > 0 {
                state.stale_lookups -= 1;
                return Ok(None);
            }
            Ok(state.idempotency.get(key.as_str()).cloned())
        })
    }
}

impl<S: Send + Sync> OutboxStore for InMemoryStore<S> {
    fn fetch_unpublished(&self, limit: usize) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut pending: Vec<OutboxRecord> = state
                .outbox
                .iter()
                .filter(|record| !record.published && record.parked_at.is_none())
                .cloned()
                .collect();
            pending.sort_by_key(|record| record.created_at);
            pending.truncate(limit);
            Ok(pending)
        })
    }

    fn mark_published(&self, id: Uuid) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Ok(match state.outbox.iter_mut().find(|record| record.id == id) {
                Some(record) if !record.published => {
                    record.published = true;
                    true
                }
                _ => false,
            })
        })
    }

    fn record_failure(&self, id: Uuid, error: String) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let record = state
                .outbox
                .iter_mut()
                .find(|record| record.id == id)
                .ok_or_else(|| LedgerError::Storage(format!("outbox record {id} not found")))?;
            record.retry_count += 1;
            record.last_error = Some(error);
            Ok(record.retry_count)
        })
    }

    fn park(&self, id: Uuid, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(record) = state.outbox.iter_mut().find(|record| record.id == id) {
                record.parked_at = Some(at);
            }
            Ok(())
        })
    }

    fn requeue_parked(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut requeued = 0;
            for record in state.outbox.iter_mut().filter(|r| r.parked_at.is_some()) {
                record.parked_at = None;
                record.retry_count = 0;
                requeued += 1;
            }
            Ok(requeued)
        })
    }
}
