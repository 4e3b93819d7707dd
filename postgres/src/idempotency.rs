//! Rows of `idempotent_requests`.
//!
//! Lookups run on the pool. Inserts run inside the caller's transaction so
//! the record commits with the effect it describes; a concurrent insert of
//! the same key fails on `idempotent_requests_pkey`.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor, Row};
use tally_core::error::LedgerError;
use tally_core::idempotency::{Fingerprint, IdempotencyKey, IdempotencyRecord};
use uuid::Uuid;

/// Look up the record for `key`.
///
/// # Errors
///
/// Returns a storage error if the query fails.
pub async fn find<'e>(
    executor: impl PgExecutor<'e>,
    key: &IdempotencyKey,
) -> Result<Option<IdempotencyRecord>, LedgerError> {
    let row = sqlx::query(
        r"
        SELECT idempotency_key, entity_id, request_hash, created_at
        FROM idempotent_requests
        WHERE idempotency_key = $1
        ",
    )
    .bind(key.as_str())
    .fetch_optional(executor)
    .await
    .map_err(map_sqlx_error)?;

    row.map(|row| -> Result<IdempotencyRecord, LedgerError> {
        let raw_key: String = row.try_get("idempotency_key").map_err(map_sqlx_error)?;
        let entity_id: Uuid = row.try_get("entity_id").map_err(map_sqlx_error)?;
        let hash: String = row.try_get("request_hash").map_err(map_sqlx_error)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_error)?;
        Ok(IdempotencyRecord {
            key: IdempotencyKey::new(raw_key)?,
            entity_id,
            fingerprint: Fingerprint::from_hex(hash.trim()),
            created_at,
        })
    })
    .transpose()
}

/// Insert a record inside an open transaction.
///
/// # Errors
///
/// Returns [`LedgerError::UniqueViolation`] on `idempotent_requests_pkey`
/// when the key is already taken, or a storage error.
pub async fn insert(conn: &mut PgConnection, record: &IdempotencyRecord) -> Result<(), LedgerError> {
    sqlx::query(
        r"
        INSERT INTO idempotent_requests (idempotency_key, entity_id, request_hash, created_at)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(record.key.as_str())
    .bind(record.entity_id)
    .bind(record.fingerprint.as_str())
    .bind(record.created_at)
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}
