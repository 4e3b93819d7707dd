//! `PostgreSQL` implementation of [`LedgerStore`].

use crate::domain::{Account, Transfer, Turnover};
use crate::store::{LedgerStore, LedgerWrite};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use tally_core::ids::{AccountId, TransferId, UserId};
use tally_core::money::{Currency, Money};
use tally_core::outbox::Commit;
use tally_core::version::Version;
use tally_postgres::{idempotency, map_sqlx_error, outbox};

/// Tables owned by the ledger.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
    id UUID NOT NULL,
    owner_id UUID NOT NULL,
    currency VARCHAR(3) NOT NULL,
    balance NUMERIC(19, 2) NOT NULL DEFAULT 0,
    version BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT accounts_pkey PRIMARY KEY (id),
    CONSTRAINT accounts_owner_id_key UNIQUE (owner_id),
    CONSTRAINT accounts_balance_non_negative CHECK (balance >= 0)
);

CREATE TABLE IF NOT EXISTS transfers (
    id UUID NOT NULL,
    from_account UUID NOT NULL REFERENCES accounts (id),
    to_account UUID NOT NULL REFERENCES accounts (id),
    amount NUMERIC(19, 2) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT transfers_pkey PRIMARY KEY (id),
    CONSTRAINT transfers_amount_positive CHECK (amount > 0)
);

CREATE INDEX IF NOT EXISTS transfers_from_account_idx ON transfers (from_account, created_at);
";

/// Ledger store on a connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, LedgerError> {
    let currency: String = row.try_get("currency").map_err(map_sqlx_error)?;
    let balance: Decimal = row.try_get("balance").map_err(map_sqlx_error)?;
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(map_sqlx_error)?),
        currency: currency.parse::<Currency>()?,
        balance: Money::new(balance),
        version: Version::from_db(row.try_get("version").map_err(map_sqlx_error)?),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer, LedgerError> {
    let amount: Decimal = row.try_get("amount").map_err(map_sqlx_error)?;
    Ok(Transfer {
        id: TransferId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        from_account_id: AccountId::from_uuid(row.try_get("from_account").map_err(map_sqlx_error)?),
        to_account_id: AccountId::from_uuid(row.try_get("to_account").map_err(map_sqlx_error)?),
        amount: Money::new(amount),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

async fn apply(conn: &mut PgConnection, write: &LedgerWrite) -> Result<(), LedgerError> {
    match write {
        LedgerWrite::InsertAccount(account) => {
            sqlx::query(
                r"
                INSERT INTO accounts (id, owner_id, currency, balance, version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(account.id.as_uuid())
            .bind(account.owner_id.as_uuid())
            .bind(account.currency.as_str())
            .bind(account.balance.amount())
            .bind(account.version.to_db())
            .bind(account.created_at)
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        LedgerWrite::UpdateAccount { account, expected } => {
            let result = sqlx::query(
                r"
                UPDATE accounts
                SET balance = $2, version = $3
                WHERE id = $1 AND version = $4
                ",
            )
            .bind(account.id.as_uuid())
            .bind(account.balance.amount())
            .bind(account.version.to_db())
            .bind(expected.to_db())
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::conflict("account", account.id));
            }
        }
        LedgerWrite::InsertTransfer(transfer) => {
            sqlx::query(
                r"
                INSERT INTO transfers (id, from_account, to_account, amount, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(transfer.id.as_uuid())
            .bind(transfer.from_account_id.as_uuid())
            .bind(transfer.to_account_id.as_uuid())
            .bind(transfer.amount.amount())
            .bind(transfer.created_at)
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        }
    }
    Ok(())
}

impl IdempotencyStore for PgLedgerStore {
    fn find_idempotency(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move { idempotency::find(&self.pool, &key).await })
    }
}

impl LedgerStore for PgLedgerStore {
    fn account(&self, id: AccountId) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(account_from_row).transpose()
        })
    }

    fn account_by_owner(&self, owner: UserId) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM accounts WHERE owner_id = $1")
                .bind(owner.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(account_from_row).transpose()
        })
    }

    fn transfer(&self, id: TransferId) -> StoreFuture<'_, Option<Transfer>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM transfers WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(transfer_from_row).transpose()
        })
    }

    fn turnover(
        &self,
        account: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Turnover>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT
                    a.currency AS currency,
                    COUNT(t.id) AS operations_count,
                    COALESCE(SUM(t.amount), 0) AS turnover
                FROM accounts a
                LEFT JOIN transfers t ON t.from_account = a.id
                    AND t.created_at BETWEEN $2 AND $3
                WHERE a.id = $1
                GROUP BY a.id, a.currency
                ",
            )
            .bind(account.as_uuid())
            .bind(from)
            .bind(to)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let currency: String = row.try_get("currency").map_err(map_sqlx_error)?;
            let count: i64 = row.try_get("operations_count").map_err(map_sqlx_error)?;
            let total: Decimal = row.try_get("turnover").map_err(map_sqlx_error)?;
            Ok(Some(Turnover {
                account_id: account,
                currency: currency.parse::<Currency>()?,
                operations_count: u64::try_from(count).unwrap_or_default(),
                turnover: Money::new(total),
            }))
        })
    }

    fn top_transfers(&self, account: AccountId, since: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<Transfer>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT * FROM transfers
                WHERE from_account = $1 AND created_at >= $2
                ORDER BY amount DESC, created_at
                LIMIT $3
                ",
            )
            .bind(account.as_uuid())
            .bind(since)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            rows.iter().map(transfer_from_row).collect()
        })
    }

    fn commit(&self, commit: Commit<LedgerWrite>) -> StoreFuture<'_, ()> {
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
