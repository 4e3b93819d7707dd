//! Events emitted through the ledger outbox.

use serde::Serialize;
use tally_core::event::DomainEvent;
use tally_core::ids::{AccountId, TransferId, UserId};
use tally_core::money::{Currency, Money};

/// Aggregate type of account events.
pub const ACCOUNT_AGGREGATE: &str = "Account";

/// Aggregate type of transfer events.
pub const TRANSFER_AGGREGATE: &str = "Transfer";

/// Event type of [`AccountCreated`].
pub const ACCOUNT_CREATED: &str = "ACCOUNT_CREATED";

/// Event type of [`TransferCompleted`].
pub const TRANSFER_COMPLETED: &str = "TRANSFER_COMPLETED";

/// Event type of a top-up [`BalanceChanged`].
pub const ACCOUNT_TOPPED_UP: &str = "ACCOUNT_TOPPED_UP";

/// Event type of a withdrawal [`BalanceChanged`].
pub const ACCOUNT_WITHDRAWN: &str = "ACCOUNT_WITHDRAWN";

/// An account was opened. Keyed by owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    /// Owner
    pub user_id: UserId,
    /// New account
    pub account_id: AccountId,
    /// Account currency
    pub currency: Currency,
}

impl DomainEvent for AccountCreated {
    fn event_type(&self) -> &'static str {
        ACCOUNT_CREATED
    }

    fn aggregate_id(&self) -> String {
        self.user_id.to_string()
    }
}

/// Money moved between two accounts. Keyed by the source account so its
/// debits stay ordered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompleted {
    /// Transfer id
    pub transfer_id: TransferId,
    /// Debited account
    pub from_account_id: AccountId,
    /// Credited account
    pub to_account_id: AccountId,
    /// Moved amount
    pub amount: Money,
}

impl DomainEvent for TransferCompleted {
    fn event_type(&self) -> &'static str {
        TRANSFER_COMPLETED
    }

    fn aggregate_id(&self) -> String {
        self.from_account_id.to_string()
    }
}

/// A top-up or withdrawal. Keyed by account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChanged {
    #[serde(skip)]
    pub(crate) event_type: &'static str,
    /// Account
    pub account_id: AccountId,
    /// Credited or debited amount
    pub amount: Money,
    /// Balance after the change
    pub balance: Money,
}

impl BalanceChanged {
    /// A top-up of `amount`.
    #[must_use]
    pub const fn topped_up(account_id: AccountId, amount: Money, balance: Money) -> Self {
        Self {
            event_type: ACCOUNT_TOPPED_UP,
            account_id,
            amount,
            balance,
        }
    }

    /// A withdrawal of `amount`.
    #[must_use]
    pub const fn withdrawn(account_id: AccountId, amount: Money, balance: Money) -> Self {
        Self {
            event_type: ACCOUNT_WITHDRAWN,
            account_id,
            amount,
            balance,
        }
    }
}

impl DomainEvent for BalanceChanged {
    fn event_type(&self) -> &'static str {
        self.event_type
    }

    fn aggregate_id(&self) -> String {
        self.account_id.to_string()
    }
}
