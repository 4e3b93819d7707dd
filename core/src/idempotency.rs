//! Idempotency control for client-initiated writes.
//!
//! A caller may attach an [`IdempotencyKey`] to a command. The first request
//! with a key runs and persists an [`IdempotencyRecord`] in the same commit as
//! its effect; later requests with the same key and the same content replay
//! the stored result, and requests with the same key but different content
//! are rejected with [`LedgerError::IdempotencyConflict`].
//!
//! Content is compared through a [`Fingerprint`]: SHA-256 over the request
//! serialized as canonical JSON (keys sorted recursively) with the operation
//! type folded in, so the same key cannot be replayed across operations.

use crate::StoreFuture;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use uuid::Uuid;

/// Name of the storage uniqueness constraint on idempotency keys.
pub const IDEMPOTENCY_KEY_CONSTRAINT: &str = "idempotent_requests_pkey";

/// Maximum accepted key length.
pub const MAX_KEY_LENGTH: usize = 255;

/// Caller-supplied token deduplicating retried requests.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate and wrap a raw key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Validation`] for blank or oversized keys.
    pub fn new(raw: impl Into<String>) -> Result<Self, LedgerError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::Validation("idempotency key must not be blank".into()));
        }
        if trimmed.len() > MAX_KEY_LENGTH {
            return Err(LedgerError::Validation(format!(
                "idempotency key exceeds {MAX_KEY_LENGTH} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Parse an optional header value; a missing or blank header means "no key".
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Validation`] for oversized keys.
    pub fn from_header(header: Option<&str>) -> Result<Option<Self>, LedgerError> {
        match header.map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => Self::new(value).map(Some),
        }
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

/// Lowercase hex SHA-256 of a canonical request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a stored hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a request for an operation.
///
/// The request is converted to JSON, `operationType` is inserted (a
/// non-object request is wrapped as `{"request": ..}` first), keys are sorted
/// recursively and the compact encoding is hashed.
///
/// # Errors
///
/// Returns [`LedgerError::Serialization`] if the request cannot be encoded.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tally_core::idempotency::fingerprint;
///
/// let a = fingerprint(&json!({"to": "b", "amount": "100.00"}), "TRANSFER").unwrap();
/// let b = fingerprint(&json!({"amount": "100.00", "to": "b"}), "TRANSFER").unwrap();
/// let c = fingerprint(&json!({"amount": "100.00", "to": "b"}), "TOP_UP").unwrap();
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
pub fn fingerprint<T: Serialize + ?Sized>(
    request: &T,
    operation: &str,
) -> Result<Fingerprint, LedgerError> {
    let mut map = match serde_json::to_value(request)? {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("request".to_string(), other);
            map
        }
    };
    map.insert(
        "operationType".to_string(),
        serde_json::Value::String(operation.to_string()),
    );
    let canonical = canonicalize(&serde_json::Value::Object(map));
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(Fingerprint(hex::encode(Sha256::digest(&bytes))))
}

/// Recursively sort object keys.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| *k);
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Persisted mapping from a key to the entity its first request produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The caller's key
    pub key: IdempotencyKey,
    /// Id of the entity the original request produced or mutated
    pub entity_id: Uuid,
    /// Fingerprint of the original request
    pub fingerprint: Fingerprint,
    /// When the record was written
    pub created_at: DateTime<Utc>,
}

/// Read side of idempotency storage.
///
/// Writes go through the service's atomic commit so the record lands with
/// the effect it describes.
pub trait IdempotencyStore: Send + Sync {
    /// Look up a record by key.
    fn find_idempotency(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<IdempotencyRecord>>;
}

/// Permission to run a keyed action for the first time.
///
/// The action must turn the claim into a record and persist it in the same
/// commit as its effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    key: IdempotencyKey,
    fingerprint: Fingerprint,
}

impl Claim {
    /// The claimed key.
    #[must_use]
    pub const fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Build the record to commit.
    #[must_use]
    pub fn record(&self, entity_id: impl Into<Uuid>, at: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord {
            key: self.key.clone(),
            entity_id: entity_id.into(),
            fingerprint: self.fingerprint.clone(),
            created_at: at,
        }
    }
}

/// Result of an idempotency lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// First use of the key.
    Miss(Claim),
    /// Same key and content seen before; holds the recorded entity id.
    Replay(Uuid),
}

/// Check a key against storage.
///
/// # Errors
///
/// Returns [`LedgerError::IdempotencyConflict`] when the key was recorded for
/// different content, or the store's error.
pub async fn check<S, T>(
    store: &S,
    key: &IdempotencyKey,
    request: &T,
    operation: &str,
) -> Result<Lookup, LedgerError>
where
    S: IdempotencyStore + ?Sized,
    T: Serialize + ?Sized,
{
    let fingerprint = fingerprint(request, operation)?;
    match store.find_idempotency(key.clone()).await? {
        None => {
            metrics::counter!("idempotency_lookups_total", "outcome" => "miss").increment(1);
            Ok(Lookup::Miss(Claim {
                key: key.clone(),
                fingerprint,
            }))
        }
        Some(record) if record.fingerprint == fingerprint => {
            metrics::counter!("idempotency_lookups_total", "outcome" => "replay").increment(1);
            Ok(Lookup::Replay(record.entity_id))
        }
        Some(_) => {
            metrics::counter!("idempotency_lookups_total", "outcome" => "conflict").increment(1);
            tracing::warn!(idempotency_key = %key, operation, "Idempotency key reused with different request");
            Err(LedgerError::IdempotencyConflict {
                key: key.as_str().to_string(),
            })
        }
    }
}

/// Run `action` at most once per key.
///
/// - no key: `action(None)` runs unconditionally
/// - unseen key: `action(Some(claim))` runs and must commit `claim.record(..)`
///   atomically with its effect
/// - seen key, same content: `replay(entity_id)` re-derives the result
/// - seen key, different content: [`LedgerError::IdempotencyConflict`]
///
/// If two requests race on an unseen key, the loser's action fails, either on
/// [`IDEMPOTENCY_KEY_CONSTRAINT`] or earlier on the entity's own uniqueness
/// rule. On any action error the guard re-checks the key and resolves the
/// loser as a replay or a conflict once the winner's record is visible.
///
/// # Errors
///
/// Propagates the action's, the replay's or the store's error, or
/// [`LedgerError::IdempotencyConflict`].
pub async fn guard<S, T, R, A, AFut, P, PFut>(
    store: &S,
    key: Option<&IdempotencyKey>,
    request: &T,
    operation: &str,
    action: A,
    replay: P,
) -> Result<R, LedgerError>
where
    S: IdempotencyStore + ?Sized,
    T: Serialize + ?Sized,
    A: FnOnce(Option<Claim>) -> AFut,
    AFut: Future<Output = Result<R, LedgerError>>,
    P: FnOnce(Uuid) -> PFut,
    PFut: Future<Output = Result<R, LedgerError>>,
{
    let Some(key) = key else {
        return action(None).await;
    };

    match check(store, key, request, operation).await? {
        Lookup::Replay(entity_id) => {
            tracing::info!(idempotency_key = %key, operation, %entity_id, "Replaying idempotent request");
            replay(entity_id).await
        }
        Lookup::Miss(claim) => match action(Some(claim)).await {
            Err(err) => {
                tracing::debug!(idempotency_key = %key, operation, error = %err, "Keyed action failed, re-checking");
                match check(store, key, request, operation).await? {
                    Lookup::Replay(entity_id) => {
                        tracing::info!(idempotency_key = %key, operation, %entity_id, "Lost idempotency race, replaying");
                        replay(entity_id).await
                    }
                    Lookup::Miss(_) => Err(err),
                }
            }
            ok => ok,
        },
    }
}
