//! `PostgreSQL` support for the tally services.
//!
//! Every service owns a database with two shared tables next to its own:
//!
//! - `outbox`: events written in the same transaction as the change they
//!   describe, drained by the outbox publisher
//! - `idempotent_requests`: one row per idempotency key
//!
//! This crate provides the pool setup, the shared DDL, error translation,
//! the row helpers services call inside their own transactions, and the
//! [`PostgresOutboxStore`] the publisher polls.
//!
//! # Example
//!
//! ```ignore
//! use tally_postgres::{connect, ensure_schema, PostgresOutboxStore};
//!
//! let pool = connect(&config.database).await?;
//! ensure_schema(&pool, LEDGER_SCHEMA).await?;
//! let outbox = PostgresOutboxStore::new(pool.clone());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod idempotency;
pub mod outbox;

pub use outbox::PostgresOutboxStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tally_core::error::LedgerError;
use tally_runtime::config::DatabaseConfig;

/// Shared tables every service database carries.
pub const SHARED_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS outbox (
    id UUID PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    correlation_id TEXT,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    published BOOLEAN NOT NULL DEFAULT FALSE,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    parked_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS outbox_pending_idx
    ON outbox (created_at)
    WHERE published = FALSE AND parked_at IS NULL;

CREATE TABLE IF NOT EXISTS idempotent_requests (
    idempotency_key VARCHAR(255) NOT NULL,
    entity_id UUID NOT NULL,
    request_hash CHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT idempotent_requests_pkey PRIMARY KEY (idempotency_key)
);
";

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`LedgerError::Unavailable`] if the database cannot be reached
/// within the configured timeout.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, LedgerError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect(&config.url)
        .await
        .map_err(|e| LedgerError::Unavailable(format!("database connection failed: {e}")))?;

    tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Create the shared tables and the service's own, if missing.
///
/// # Errors
///
/// Returns a storage error if any statement fails.
pub async fn ensure_schema(pool: &PgPool, service_schema: &str) -> Result<(), LedgerError> {
    sqlx::raw_sql(SHARED_SCHEMA)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    sqlx::raw_sql(service_schema)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;

    tracing::info!("Database schema ready");
    Ok(())
}

/// SQLSTATE codes of a transaction aborted by another one: serialization
/// failure and deadlock.
const TRANSACTION_ABORT_CODES: [&str; 2] = ["40001", "40P01"];

fn is_transaction_abort(code: &str) -> bool {
    TRANSACTION_ABORT_CODES.contains(&code)
}

/// Translate a sqlx error into the service error.
///
/// Unique violations keep the constraint name so callers can tell an
/// idempotency race from a provisioning race. Deadlocks and serialization
/// failures become [`LedgerError::ConcurrencyConflict`], which the optimistic
/// retry re-runs.
#[must_use]
pub fn map_sqlx_error(error: sqlx::Error) -> LedgerError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => LedgerError::UniqueViolation {
            constraint: db.constraint().unwrap_or_default().to_string(),
        },
        sqlx::Error::Database(db) if db.code().is_some_and(|code| is_transaction_abort(&code)) => {
            tracing::warn!(code = ?db.code(), table = ?db.table(), "Transaction aborted by a concurrent one");
            LedgerError::conflict("transaction", db.table().unwrap_or("unknown"))
        }
        sqlx::Error::PoolTimedOut => LedgerError::Timeout("database pool acquire".to_string()),
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) => LedgerError::Unavailable(error.to_string()),
        _ => LedgerError::Storage(error.to_string()),
    }
}

/// Retry count column to its domain type.
pub(crate) fn retry_count_from_db(raw: i32) -> u32 {
    raw.unsigned_abs()
}
