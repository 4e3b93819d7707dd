//! The `outbox` table.
//!
//! Services call [`insert`] inside the transaction that makes the change.
//! [`PostgresOutboxStore`] is the publisher's side.

use crate::{map_sqlx_error, retry_count_from_db};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::idempotency::IdempotencyRecord;
use tally_core::outbox::{OutboxRecord, OutboxStore};
use uuid::Uuid;

/// Insert one record inside an open transaction.
///
/// # Errors
///
/// Returns a storage error if the insert fails.
pub async fn insert(conn: &mut PgConnection, record: &OutboxRecord) -> Result<(), LedgerError> {
    sqlx::query(
        r"
        INSERT INTO outbox (
            id, aggregate_type, aggregate_id, correlation_id, event_type,
            payload, created_at, published, retry_count, last_error, parked_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ",
    )
    .bind(record.id)
    .bind(&record.aggregate_type)
    .bind(&record.aggregate_id)
    .bind(record.correlation_id.as_deref())
    .bind(&record.event_type)
    .bind(&record.payload)
    .bind(record.created_at)
    .bind(record.published)
    .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
    .bind(record.last_error.as_deref())
    .bind(record.parked_at)
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

/// Write the idempotency record and outbox rows that close a commit.
///
/// # Errors
///
/// Returns the first failing insert's error; the caller's transaction must
/// then be rolled back.
pub async fn write_commit_tail(
    conn: &mut PgConnection,
    idempotency: Option<&IdempotencyRecord>,
    outbox: &[OutboxRecord],
) -> Result<(), LedgerError> {
    if let Some(record) = idempotency {
        crate::idempotency::insert(&mut *conn, record).await?;
    }
    for record in outbox {
        insert(&mut *conn, record).await?;
    }
    Ok(())
}

fn from_row(row: &PgRow) -> Result<OutboxRecord, sqlx::Error> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        correlation_id: row.try_get("correlation_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        published: row.try_get("published")?,
        retry_count: retry_count_from_db(row.try_get("retry_count")?),
        last_error: row.try_get("last_error")?,
        parked_at: row.try_get("parked_at")?,
    })
}

/// Publisher-side outbox access.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Parked records, oldest first, for inspection.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub async fn list_parked(&self, limit: i64) -> Result<Vec<OutboxRecord>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM outbox
            WHERE parked_at IS NOT NULL
            ORDER BY created_at
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| from_row(row).map_err(map_sqlx_error))
            .collect()
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn fetch_unpublished(&self, limit: usize) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT * FROM outbox
                WHERE published = FALSE AND parked_at IS NULL
                ORDER BY created_at, id
                LIMIT $1
                ",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.iter()
                .map(|row| from_row(row).map_err(map_sqlx_error))
                .collect()
        })
    }

    fn mark_published(&self, id: Uuid) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE outbox SET published = TRUE WHERE id = $1 AND published = FALSE")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn record_failure(&self, id: Uuid, error: String) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let count: Option<i32> = sqlx::query_scalar(
                r"
                UPDATE outbox
                SET retry_count = retry_count + 1, last_error = $2
                WHERE id = $1
                RETURNING retry_count
                ",
            )
            .bind(id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            count
                .map(retry_count_from_db)
                .ok_or_else(|| LedgerError::Storage(format!("outbox record {id} not found")))
        })
    }

    fn park(&self, id: Uuid, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE outbox SET parked_at = $2 WHERE id = $1")
                .bind(id)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        })
    }

    fn requeue_parked(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE outbox SET parked_at = NULL, retry_count = 0 WHERE parked_at IS NOT NULL AND published = FALSE",
            )
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            let requeued = result.rows_affected();
            metrics::counter!("outbox_records_requeued_total").increment(requeued);
            tracing::info!(requeued, "Requeued parked outbox records");
            Ok(requeued)
        })
    }
}
