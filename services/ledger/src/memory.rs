//! In-memory [`LedgerStore`] for tests.

use crate::domain::{Account, Transfer, Turnover};
use crate::store::{ACCOUNTS_OWNER_KEY, ACCOUNTS_PKEY, LedgerStore, LedgerWrite, TRANSFERS_PKEY};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::ids::{AccountId, TransferId, UserId};
use tally_core::money::Money;
use tally_core::outbox::Commit;
use tally_testing::{InMemoryStore, TableWrite};

/// The `accounts` and `transfers` tables.
#[derive(Clone, Debug, Default)]
pub struct LedgerTables {
    /// Accounts by id
    pub accounts: HashMap<AccountId, Account>,
    /// Transfers in insertion order
    pub transfers: Vec<Transfer>,
}

/// Ledger store backed by memory.
pub type InMemoryLedgerStore = InMemoryStore<LedgerTables>;

fn unique(constraint: &str) -> LedgerError {
    LedgerError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

impl TableWrite<LedgerTables> for LedgerWrite {
    fn check(&self, tables: &LedgerTables) -> Result<(), LedgerError> {
        match self {
            Self::InsertAccount(account) => {
                if tables.accounts.contains_key(&account.id) {
                    return Err(unique(ACCOUNTS_PKEY));
                }
                if tables.accounts.values().any(|a| a.owner_id == account.owner_id) {
                    return Err(unique(ACCOUNTS_OWNER_KEY));
                }
                Ok(())
            }
            Self::UpdateAccount { account, expected } => match tables.accounts.get(&account.id) {
                Some(stored) if stored.version == *expected => Ok(()),
                Some(_) => Err(LedgerError::conflict("account", account.id)),
                None => Err(LedgerError::AccountNotFound(account.id.to_string())),
            },
            Self::InsertTransfer(transfer) if tables.transfers.iter().any(|t| t.id == transfer.id) => {
                Err(unique(TRANSFERS_PKEY))
            }
            Self::InsertTransfer(_) => Ok(()),
        }
    }

    fn apply(self, tables: &mut LedgerTables) {
        match self {
            Self::InsertAccount(account) | Self::UpdateAccount { account, .. } => {
                tables.accounts.insert(account.id, account);
            }
            Self::InsertTransfer(transfer) => tables.transfers.push(transfer),
        }
    }
}

impl LedgerStore for InMemoryStore<LedgerTables> {
    fn account(&self, id: AccountId) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move { Ok(self.read(|t| t.accounts.get(&id).cloned()).await) })
    }

    fn account_by_owner(&self, owner: UserId) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            Ok(self
                .read(|t| t.accounts.values().find(|a| a.owner_id == owner).cloned())
                .await)
        })
    }

    fn transfer(&self, id: TransferId) -> StoreFuture<'_, Option<Transfer>> {
        Box::pin(async move { Ok(self.read(|t| t.transfers.iter().find(|tr| tr.id == id).cloned()).await) })
    }

    fn turnover(
        &self,
        account: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Turnover>> {
        Box::pin(async move {
            self.read(|t| {
                let Some(stored) = t.accounts.get(&account) else {
                    return Ok(None);
                };
                let mut turnover = Turnover {
                    account_id: account,
                    currency: stored.currency,
                    operations_count: 0,
                    turnover: Money::zero(),
                };
                for transfer in t
                    .transfers
                    .iter()
                    .filter(|tr| tr.from_account_id == account && tr.created_at >= from && tr.created_at <= to)
                {
                    turnover.operations_count += 1;
                    turnover.turnover = turnover.turnover.checked_add(transfer.amount)?;
                }
                Ok(Some(turnover))
            })
            .await
        })
    }

    fn top_transfers(&self, account: AccountId, since: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<Transfer>> {
        Box::pin(async move {
            let mut transfers: Vec<Transfer> = self
                .read(|t| {
                    t.transfers
                        .iter()
                        .filter(|tr| tr.from_account_id == account && tr.created_at >= since)
                        .cloned()
                        .collect()
                })
                .await;
            transfers.sort_by_key(|tr| Reverse(tr.amount));
            transfers.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(transfers)
        })
    }

    fn commit(&self, commit: Commit<LedgerWrite>) -> StoreFuture<'_, ()> {
        Box::pin(InMemoryStore::commit(self, commit))
    }
}
