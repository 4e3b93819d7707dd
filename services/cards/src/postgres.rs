//! `PostgreSQL` implementation of [`CardStore`].

use crate::domain::{Card, CardType};
use crate::store::{CardStore, CardWrite};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tally_core::StoreFuture;
use tally_core::directory::CardStatus;
use tally_core::error::LedgerError;
use tally_core::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use tally_core::ids::{AccountId, CardId, UserId};
use tally_core::money::Currency;
use tally_core::outbox::Commit;
use tally_core::version::Version;
use tally_postgres::{idempotency, map_sqlx_error, outbox};
use uuid::Uuid;

/// Tables owned by the cards service.
///
/// `cards_owner_default_key` is a partial unique index: closed or blocked
/// cards do not count against it.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS cards (
    id UUID NOT NULL,
    owner_id UUID NOT NULL,
    account_id UUID,
    number VARCHAR(32) NOT NULL,
    currency VARCHAR(3) NOT NULL,
    card_type VARCHAR(16) NOT NULL,
    status VARCHAR(16) NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT cards_pkey PRIMARY KEY (id)
);

CREATE UNIQUE INDEX IF NOT EXISTS cards_owner_default_key
    ON cards (owner_id, card_type, currency)
    WHERE status = 'ACTIVE';

CREATE INDEX IF NOT EXISTS cards_owner_idx ON cards (owner_id, created_at);
";

/// Cards store on a connection pool.
#[derive(Clone)]
pub struct PgCardStore {
    pool: PgPool,
}

impl PgCardStore {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: &PgRow) -> Result<Card, LedgerError> {
    let account: Option<Uuid> = row.try_get("account_id").map_err(map_sqlx_error)?;
    let currency: String = row.try_get("currency").map_err(map_sqlx_error)?;
    let card_type: String = row.try_get("card_type").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    Ok(Card {
        id: CardId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(map_sqlx_error)?),
        account_id: account.map(AccountId::from_uuid),
        number: row.try_get("number").map_err(map_sqlx_error)?,
        currency: currency.parse::<Currency>()?,
        card_type: card_type.parse::<CardType>()?,
        status: CardStatus::parse(&status)?,
        version: Version::from_db(row.try_get("version").map_err(map_sqlx_error)?),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

async fn apply(conn: &mut PgConnection, write: &CardWrite) -> Result<(), LedgerError> {
    match write {
        CardWrite::Insert(card) => {
            sqlx::query(
                r"
                INSERT INTO cards (
                    id, owner_id, account_id, number, currency, card_type, status, version, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(card.id.as_uuid())
            .bind(card.owner_id.as_uuid())
            .bind(card.account_id.map(Uuid::from))
            .bind(&card.number)
            .bind(card.currency.as_str())
            .bind(card.card_type.as_str())
            .bind(card.status.as_str())
            .bind(card.version.to_db())
            .bind(card.created_at)
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        CardWrite::Update { card, expected } => {
            let result = sqlx::query(
                r"
                UPDATE cards
                SET account_id = $2, status = $3, version = $4
                WHERE id = $1 AND version = $5
                ",
            )
            .bind(card.id.as_uuid())
            .bind(card.account_id.map(Uuid::from))
            .bind(card.status.as_str())
            .bind(card.version.to_db())
            .bind(expected.to_db())
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::conflict("card", card.id));
            }
        }
    }
    Ok(())
}

impl IdempotencyStore for PgCardStore {
    fn find_idempotency(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move { idempotency::find(&self.pool, &key).await })
    }
}

impl CardStore for PgCardStore {
    fn card(&self, id: CardId) -> StoreFuture<'_, Option<Card>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM cards WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(from_row).transpose()
        })
    }

    fn cards_for_owner(&self, owner: UserId) -> StoreFuture<'_, Vec<Card>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT * FROM cards WHERE owner_id = $1 ORDER BY created_at, id")
                .bind(owner.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            rows.iter().map(from_row).collect()
        })
    }

    fn active_card(&self, owner: UserId, card_type: CardType, currency: Currency) -> StoreFuture<'_, Option<Card>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT * FROM cards
                WHERE owner_id = $1 AND card_type = $2 AND currency = $3 AND status = 'ACTIVE'
                ",
            )
            .bind(owner.as_uuid())
            .bind(card_type.as_str())
            .bind(currency.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            row.as_ref().map(from_row).transpose()
        })
    }

    fn commit(&self, commit: Commit<CardWrite>) -> StoreFuture<'_, ()> {
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
