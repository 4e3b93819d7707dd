//! The card entity.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tally_core::directory::{CardStatus, CardView};
use tally_core::error::LedgerError;
use tally_core::ids::{AccountId, CardId, UserId};
use tally_core::money::Currency;
use tally_core::version::Version;

/// Kind of card.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardType {
    /// Spends the linked balance
    #[default]
    Debit,
    /// Spends a credit line
    Credit,
}

impl CardType {
    /// Stored form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debit => "DEBIT",
            Self::Credit => "CREDIT",
        }
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(Self::Debit),
            "CREDIT" => Ok(Self::Credit),
            other => Err(LedgerError::Validation(format!("unknown card type '{other}'"))),
        }
    }
}

/// Masked card number, e.g. `4111 **** **** 4821`.
///
/// USD cards use the `4111` prefix, everything else `5500`.
#[must_use]
pub fn masked_number(currency: Currency) -> String {
    let prefix = match currency {
        Currency::Usd => "4111",
        Currency::Eur => "5500",
    };
    let last_four: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("{prefix} **** **** {last_four}")
}

/// Request to issue a card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardRequest {
    /// Card holder
    pub owner_id: UserId,
    /// Card currency
    pub currency: Currency,
    /// Debit or credit
    pub card_type: CardType,
}

/// A payment card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    /// Card id
    pub id: CardId,
    /// Card holder
    pub owner_id: UserId,
    /// Ledger account, once linked
    pub account_id: Option<AccountId>,
    /// Masked number
    pub number: String,
    /// Card currency
    pub currency: Currency,
    /// Debit or credit
    pub card_type: CardType,
    /// Lifecycle status
    pub status: CardStatus,
    /// Optimistic lock token
    pub version: Version,
    /// Issue time
    pub created_at: DateTime<Utc>,
}

impl Card {
    /// A new active, unlinked card.
    #[must_use]
    pub fn issue(owner_id: UserId, currency: Currency, card_type: CardType, created_at: DateTime<Utc>) -> Self {
        Self {
            id: CardId::new(),
            owner_id,
            account_id: None,
            number: masked_number(currency),
            currency,
            card_type,
            status: CardStatus::Active,
            version: Version::INITIAL,
            created_at,
        }
    }

    /// Link to `account` if not linked yet. Returns whether anything changed.
    pub fn link(&mut self, account: AccountId) -> bool {
        if self.account_id.is_some() {
            return false;
        }
        self.account_id = Some(account);
        self.version = self.version.next();
        true
    }

    /// Block the card.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CardBlocked`] for a closed card.
    pub fn block(&mut self) -> Result<bool, LedgerError> {
        match self.status {
            CardStatus::Closed => Err(LedgerError::CardBlocked(self.id)),
            CardStatus::Blocked => Ok(false),
            CardStatus::Active => {
                self.status = CardStatus::Blocked;
                self.version = self.version.next();
                Ok(true)
            }
        }
    }

    /// Close the card for good. Returns whether anything changed.
    pub fn close(&mut self) -> bool {
        if self.status == CardStatus::Closed {
            return false;
        }
        self.status = CardStatus::Closed;
        self.version = self.version.next();
        true
    }

    /// What other services see.
    #[must_use]
    pub fn view(&self) -> CardView {
        CardView {
            id: self.id,
            owner_id: self.owner_id,
            account_id: self.account_id,
            currency: self.currency,
            status: self.status,
        }
    }
}
