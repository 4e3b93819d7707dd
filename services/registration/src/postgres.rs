//! `PostgreSQL` implementation of [`RegistrationStore`].

use crate::domain::Credentials;
use crate::store::{RegistrationStore, RegistrationWrite};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use tally_core::ids::UserId;
use tally_core::outbox::Commit;
use tally_postgres::{idempotency, map_sqlx_error, outbox};

/// Tables owned by the registration service.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS credentials (
    user_id UUID NOT NULL,
    username VARCHAR(50) NOT NULL,
    email VARCHAR(255) NOT NULL,
    blocked BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT credentials_pkey PRIMARY KEY (user_id),
    CONSTRAINT credentials_email_key UNIQUE (email)
);
";

/// Registration store on a connection pool.
#[derive(Clone)]
pub struct PgRegistrationStore {
    pool: PgPool,
}

impl PgRegistrationStore {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: &PgRow) -> Result<Credentials, sqlx::Error> {
    Ok(Credentials {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        blocked: row.try_get("blocked")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn apply(conn: &mut PgConnection, write: &RegistrationWrite) -> Result<(), LedgerError> {
    match write {
        RegistrationWrite::Insert(c) => {
            sqlx::query(
                r"
                INSERT INTO credentials (user_id, username, email, blocked, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(c.user_id.as_uuid())
            .bind(&c.username)
            .bind(&c.email)
            .bind(c.blocked)
            .bind(c.created_at)
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        RegistrationWrite::Block(user_id) => {
            let result = sqlx::query("UPDATE credentials SET blocked = TRUE WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::UserNotFound(*user_id));
            }
        }
    }
    Ok(())
}

impl IdempotencyStore for PgRegistrationStore {
    fn find_idempotency(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move { idempotency::find(&self.pool, &key).await })
    }
}

impl RegistrationStore for PgRegistrationStore {
    fn credentials(&self, user_id: UserId) -> StoreFuture<'_, Option<Credentials>> {
        Box::pin(async move {
            sqlx::query("SELECT * FROM credentials WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .and_then(|row| row.as_ref().map(from_row).transpose())
                .map_err(map_sqlx_error)
        })
    }

    fn credentials_by_email(&self, email: String) -> StoreFuture<'_, Option<Credentials>> {
        Box::pin(async move {
            sqlx::query("SELECT * FROM credentials WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await
                .and_then(|row| row.as_ref().map(from_row).transpose())
                .map_err(map_sqlx_error)
        })
    }

    fn commit(&self, commit: Commit<RegistrationWrite>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            for write in &commit.writes {
                apply(&mut tx, write).await?;
            }
            outbox::write_commit_tail(&mut tx, commit.idempotency.as_ref(), &commit.outbox).await?;
            tx.commit().await.map_err(map_sqlx_error)
        })
    }
}
