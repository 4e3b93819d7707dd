//! Persistence seam of the ledger.

use crate::domain::{Account, Transfer, Turnover};
use chrono::{DateTime, Utc};
use tally_core::StoreFuture;
use tally_core::idempotency::IdempotencyStore;
use tally_core::ids::{AccountId, TransferId, UserId};
use tally_core::outbox::Commit;
use tally_core::version::Version;

/// Primary key of `accounts`.
pub const ACCOUNTS_PKEY: &str = "accounts_pkey";

/// One account per owner.
pub const ACCOUNTS_OWNER_KEY: &str = "accounts_owner_id_key";

/// Primary key of `transfers`.
pub const TRANSFERS_PKEY: &str = "transfers_pkey";

/// One write inside a ledger commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerWrite {
    /// Open an account
    InsertAccount(Account),
    /// Replace an account if its stored version is still `expected`
    UpdateAccount {
        /// New state, version already advanced
        account: Account,
        /// Version the change was based on
        expected: Version,
    },
    /// Record a transfer
    InsertTransfer(Transfer),
}

/// Ledger storage plus the shared idempotency table.
pub trait LedgerStore: IdempotencyStore {
    /// Account by id.
    fn account(&self, id: AccountId) -> StoreFuture<'_, Option<Account>>;

    /// The owner's account.
    fn account_by_owner(&self, owner: UserId) -> StoreFuture<'_, Option<Account>>;

    /// Transfer by id.
    fn transfer(&self, id: TransferId) -> StoreFuture<'_, Option<Transfer>>;

    /// Outgoing transfers of `account` created in `[from, to]`, or `None` if
    /// the account does not exist.
    fn turnover(
        &self,
        account: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Turnover>>;

    /// Largest outgoing transfers of `account` since `since`, biggest first.
    fn top_transfers(&self, account: AccountId, since: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<Transfer>>;

    /// Apply writes, idempotency record and outbox rows atomically.
    fn commit(&self, commit: Commit<LedgerWrite>) -> StoreFuture<'_, ()>;
}
