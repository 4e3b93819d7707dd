//! Card lookup across the cards/ledger boundary.
//!
//! The ledger resolves card ids to account ids and links freshly provisioned
//! accounts to cards by calling the cards service. [`CardDirectory`] is the
//! contract for that call; the cards service implements it in-process and the
//! ledger ships an HTTP client for it.

use crate::error::LedgerError;
use crate::ids::{AccountId, CardId, UserId};
use crate::money::Currency;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Lifecycle status of a card.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardStatus {
    /// Usable for payments and transfers.
    #[default]
    Active,
    /// Temporarily unusable.
    Blocked,
    /// Permanently unusable.
    Closed,
}

impl CardStatus {
    /// Storage/wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "ACTIVE" => Ok(Self::Active),
            "BLOCKED" => Ok(Self::Blocked),
            "CLOSED" => Ok(Self::Closed),
            other => Err(LedgerError::Serialization(format!("unknown card status '{other}'"))),
        }
    }
}

/// What the ledger needs to know about a card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    /// Card id
    pub id: CardId,
    /// Owning user
    pub owner_id: UserId,
    /// Linked ledger account, once provisioned
    pub account_id: Option<AccountId>,
    /// Card currency
    pub currency: Currency,
    /// Lifecycle status
    pub status: CardStatus,
}

/// Failure of a directory call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote side does not know the resource.
    #[error("not found")]
    NotFound,

    /// The remote side refused the request.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// HTTP-equivalent status
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Connection or protocol failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No response within the deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl RemoteError {
    /// Translate a failure of a call about `card`.
    #[must_use]
    pub fn for_card(self, card: CardId) -> LedgerError {
        match self {
            Self::NotFound => LedgerError::CardNotFound(card),
            Self::Rejected { status: 403, .. } => LedgerError::CardBlocked(card),
            Self::Rejected { status, message } => {
                LedgerError::Unavailable(format!("card service rejected call ({status}): {message}"))
            }
            Self::Transport(reason) => LedgerError::Unavailable(format!("card service: {reason}")),
            Self::Timeout(reason) => LedgerError::Timeout(format!("card service: {reason}")),
        }
    }
}

impl From<LedgerError> for RemoteError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::CardNotFound(_) | LedgerError::UserNotFound(_) => Self::NotFound,
            LedgerError::Timeout(reason) => Self::Timeout(reason),
            other if other.is_retryable() => Self::Transport(other.to_string()),
            other => Self::Rejected {
                status: other.kind().status(),
                message: other.to_string(),
            },
        }
    }
}

/// Boxed future for directory calls.
pub type DirectoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Remote view of the cards service.
pub trait CardDirectory: Send + Sync {
    /// Fetch one card.
    fn card(&self, id: CardId) -> DirectoryFuture<'_, CardView>;

    /// All cards of an owner.
    fn cards_for_owner(&self, owner: UserId) -> DirectoryFuture<'_, Vec<CardView>>;

    /// Link a card to an account. Linking an already linked card is a no-op.
    fn link_account(&self, card: CardId, account: AccountId) -> DirectoryFuture<'_, ()>;
}
