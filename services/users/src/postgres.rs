//! `PostgreSQL` implementation of [`UserStore`].

use crate::domain::{User, UserStatus};
use crate::store::{UserStore, UserWrite};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use tally_core::ids::UserId;
use tally_core::outbox::Commit;
use tally_core::version::Version;
use tally_postgres::{idempotency, map_sqlx_error, outbox};

/// Tables owned by the users service.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id UUID NOT NULL,
    username VARCHAR(50) NOT NULL,
    email VARCHAR(255) NOT NULL,
    status VARCHAR(16) NOT NULL,
    deleted BOOLEAN NOT NULL DEFAULT FALSE,
    version BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT users_pkey PRIMARY KEY (id),
    CONSTRAINT users_email_key UNIQUE (email)
);
";

/// Users store on a connection pool.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: &PgRow) -> Result<User, LedgerError> {
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    Ok(User {
        id: UserId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        username: row.try_get("username").map_err(map_sqlx_error)?,
        email: row.try_get("email").map_err(map_sqlx_error)?,
        status: status.parse::<UserStatus>()?,
        deleted: row.try_get("deleted").map_err(map_sqlx_error)?,
        version: Version::from_db(row.try_get("version").map_err(map_sqlx_error)?),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

async fn apply(conn: &mut PgConnection, write: &UserWrite) -> Result<(), LedgerError> {
    match write {
        UserWrite::Insert(user) => {
            sqlx::query(
                r"
                INSERT INTO users (id, username, email, status, deleted, version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(user.id.as_uuid())
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.status.as_str())
            .bind(user.deleted)
            .bind(user.version.to_db())
            .bind(user.created_at)
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        UserWrite::Update { user, expected } => {
            let result = sqlx::query(
                r"
                UPDATE users
                SET username = $2, email = $3, status = $4, deleted = $5, version = $6
                WHERE id = $1 AND version = $7
                ",
            )
            .bind(user.id.as_uuid())
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.status.as_str())
            .bind(user.deleted)
            .bind(user.version.to_db())
            .bind(expected.to_db())
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::conflict("user", user.id));
            }
        }
    }
    Ok(())
}

impl IdempotencyStore for PgUserStore {
    fn find_idempotency(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move { idempotency::find(&self.pool, &key).await })
    }
}

impl UserStore for PgUserStore {
    fn user(&self, id: UserId) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM users WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(from_row).transpose()
        })
    }

    fn user_by_email(&self, email: String) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM users WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(from_row).transpose()
        })
    }

    fn commit(&self, commit: Commit<UserWrite>) -> StoreFuture<'_, ()> {
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
