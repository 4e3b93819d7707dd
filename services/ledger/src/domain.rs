//! Accounts, transfers and the requests that move money between them.
//!
//! An [`Account`] balance changes only through [`Account::credit`] and
//! [`Account::debit`]; both take already validated [`Money`] and advance the
//! version used for optimistic locking. A [`Transfer`] is an immutable record
//! of one completed movement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_core::error::LedgerError;
use tally_core::ids::{AccountId, CardId, TransferId, UserId};
use tally_core::money::{Currency, Money, validate_positive};
use tally_core::version::Version;

/// A ledger account. One per owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account id
    pub id: AccountId,
    /// Owning user
    pub owner_id: UserId,
    /// Account currency
    pub currency: Currency,
    /// Current balance, never negative
    pub balance: Money,
    /// Optimistic lock token
    pub version: Version,
    /// Opening time
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// A new empty account.
    #[must_use]
    pub fn open(owner_id: UserId, currency: Currency, created_at: DateTime<Utc>) -> Self {
        Self {
            id: AccountId::new(),
            owner_id,
            currency,
            balance: Money::zero(),
            version: Version::INITIAL,
            created_at,
        }
    }

    /// Add `amount` to the balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] unless `amount` is positive.
    pub fn credit(&mut self, amount: Money) -> Result<(), LedgerError> {
        let amount = Money::positive(amount.amount())?;
        self.balance = self.balance.checked_add(amount)?;
        self.version = self.version.next();
        Ok(())
    }

    /// Take `amount` from the balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] unless `amount` is positive
    /// - [`LedgerError::InsufficientFunds`] when the balance is smaller; the
    ///   account is left untouched
    pub fn debit(&mut self, amount: Money) -> Result<(), LedgerError> {
        let amount = Money::positive(amount.amount())?;
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: self.id.to_string(),
            });
        }
        self.balance = self.balance.checked_sub(amount)?;
        self.version = self.version.next();
        Ok(())
    }
}

/// A completed movement between two accounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    /// Transfer id
    pub id: TransferId,
    /// Debited account
    pub from_account_id: AccountId,
    /// Credited account
    pub to_account_id: AccountId,
    /// Moved amount
    pub amount: Money,
    /// Completion time
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    /// Record a transfer of a raw amount.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] unless `amount` is present and
    /// positive after normalization.
    pub fn new(
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Option<Decimal>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        Ok(Self {
            id: TransferId::new(),
            from_account_id,
            to_account_id,
            amount: validate_positive(amount)?,
            created_at,
        })
    }
}

/// Move money between the accounts behind two cards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Card whose account is debited
    pub from_card_id: CardId,
    /// Card whose account is credited
    pub to_card_id: CardId,
    /// Raw amount
    pub amount: Option<Decimal>,
}

/// Body fingerprinted for top-ups and withdrawals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BalanceRequest {
    pub account_id: AccountId,
    pub amount: Money,
}

/// Outgoing activity of an account in a time window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turnover {
    /// Account
    pub account_id: AccountId,
    /// Account currency
    pub currency: Currency,
    /// Number of outgoing transfers
    pub operations_count: u64,
    /// Sum of outgoing transfers
    pub turnover: Money,
}
