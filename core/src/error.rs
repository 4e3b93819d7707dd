//! Error taxonomy shared by every service.
//!
//! [`LedgerError`] is the one closed error type used from the domain up to the
//! boundary. [`ErrorKind`] gives each variant a status, a stable code and a
//! title; [`ApiError::from_error`] is the single place where an internal
//! error becomes a caller-visible one.

use crate::correlation::CorrelationId;
use crate::ids::{CardId, UserId};
use crate::money::Currency;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Every failure mode of the Tally services.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // ═══════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════

    /// Amount missing, zero, negative or unrepresentable.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Debit would take the balance below zero.
    #[error("Insufficient funds in account {account}")]
    InsufficientFunds {
        /// Account that was debited
        account: String,
    },

    /// Source and destination resolve to the same account.
    #[error("Cannot transfer from account {0} to itself")]
    SameAccountTransfer(String),

    /// Source and destination accounts hold different currencies.
    #[error("Currency mismatch: {from} to {to}")]
    CurrencyMismatch {
        /// Source account currency
        from: Currency,
        /// Destination account currency
        to: Currency,
    },

    /// Request failed field validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    // ═══════════════════════════════════════════════════════════
    // Concurrency and idempotency
    // ═══════════════════════════════════════════════════════════

    /// Idempotency key reused with a different request.
    #[error("Idempotency key '{key}' was already used with a different request")]
    IdempotencyConflict {
        /// The reused key
        key: String,
    },

    /// Stored row version moved on since it was read.
    #[error("Concurrent modification of {entity} {id}")]
    ConcurrencyConflict {
        /// Entity kind, e.g. `account`
        entity: &'static str,
        /// Entity id
        id: String,
    },

    /// A storage uniqueness constraint rejected the write.
    #[error("Unique constraint '{constraint}' violated")]
    UniqueViolation {
        /// Constraint name
        constraint: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Resources
    // ═══════════════════════════════════════════════════════════

    /// No account with this id, or no account for this owner.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// No card with this id.
    #[error("Card not found: {0}")]
    CardNotFound(CardId),

    /// Card exists but is not active.
    #[error("Card {0} is not active")]
    CardBlocked(CardId),

    /// Card has not been linked to an account yet.
    #[error("Card {0} is not linked to an account")]
    CardNotLinked(CardId),

    /// No user with this id.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// No live user with this email.
    #[error("User not found: {0}")]
    UserEmailNotFound(String),

    /// Username or email already taken.
    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    // ═══════════════════════════════════════════════════════════
    // Infrastructure
    // ═══════════════════════════════════════════════════════════

    /// A remote dependency could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// A remote call or publish exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Database failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount(_) => ErrorKind::InvalidAmount,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::SameAccountTransfer(_) => ErrorKind::SameAccountTransfer,
            Self::CurrencyMismatch { .. } => ErrorKind::CurrencyMismatch,
            Self::Validation(_) => ErrorKind::Validation,
            Self::IdempotencyConflict { .. } => ErrorKind::IdempotencyConflict,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::UniqueViolation { .. } => ErrorKind::Duplicate,
            Self::AccountNotFound(_) => ErrorKind::AccountNotFound,
            Self::CardNotFound(_) => ErrorKind::CardNotFound,
            Self::CardBlocked(_) => ErrorKind::CardBlocked,
            Self::CardNotLinked(_) => ErrorKind::CardNotLinked,
            Self::UserNotFound(_) | Self::UserEmailNotFound(_) => ErrorKind::UserNotFound,
            Self::UserAlreadyExists(_) => ErrorKind::UserAlreadyExists,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// `true` for optimistic-lock failures.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// `true` when a uniqueness constraint with this name rejected the write.
    #[must_use]
    pub fn is_unique_violation_on(&self, name: &str) -> bool {
        matches!(self, Self::UniqueViolation { constraint } if constraint == name)
    }

    /// Shorthand for [`LedgerError::ConcurrencyConflict`].
    #[must_use]
    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        Self::ConcurrencyConflict {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Closed classification of [`LedgerError`], with boundary metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid amount
    InvalidAmount,
    /// Insufficient funds
    InsufficientFunds,
    /// Same-account transfer
    SameAccountTransfer,
    /// Currency mismatch
    CurrencyMismatch,
    /// Field validation
    Validation,
    /// Idempotency key reuse
    IdempotencyConflict,
    /// Optimistic-lock conflict
    ConcurrencyConflict,
    /// Uniqueness violation
    Duplicate,
    /// Missing account
    AccountNotFound,
    /// Missing card
    CardNotFound,
    /// Inactive card
    CardBlocked,
    /// Card without account
    CardNotLinked,
    /// Missing user
    UserNotFound,
    /// Duplicate user
    UserAlreadyExists,
    /// Remote dependency down
    Unavailable,
    /// Deadline exceeded
    Timeout,
    /// Database failure
    Storage,
    /// Encoding failure
    Serialization,
    /// Unclassified
    Internal,
}

impl ErrorKind {
    /// HTTP-equivalent status.
    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::InvalidAmount
            | Self::InsufficientFunds
            | Self::SameAccountTransfer
            | Self::CurrencyMismatch
            | Self::Validation => 400,
            Self::CardBlocked => 403,
            Self::AccountNotFound | Self::CardNotFound | Self::CardNotLinked | Self::UserNotFound => {
                404
            }
            Self::IdempotencyConflict
            | Self::ConcurrencyConflict
            | Self::Duplicate
            | Self::UserAlreadyExists => 409,
            Self::Storage | Self::Serialization | Self::Internal => 500,
            Self::Unavailable => 503,
            Self::Timeout => 504,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::SameAccountTransfer => "SAME_ACCOUNT_TRANSFER",
            Self::CurrencyMismatch => "CURRENCY_MISMATCH",
            Self::Validation => "VALIDATION_ERROR",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::ConcurrencyConflict => "CONCURRENT_MODIFICATION",
            Self::Duplicate => "DUPLICATE_RESOURCE",
            Self::AccountNotFound => "ACCOUNT_NOT_FOUND",
            Self::CardNotFound => "CARD_NOT_FOUND",
            Self::CardBlocked => "CARD_BLOCKED",
            Self::CardNotLinked => "CARD_NOT_LINKED",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserAlreadyExists => "USER_ALREADY_EXISTS",
            Self::Unavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Human-readable title.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::InvalidAmount => "Invalid amount",
            Self::InsufficientFunds => "Insufficient funds",
            Self::SameAccountTransfer => "Same account transfer",
            Self::CurrencyMismatch => "Currency mismatch",
            Self::Validation => "Validation failed",
            Self::IdempotencyConflict => "Idempotency conflict",
            Self::ConcurrencyConflict => "Concurrent modification",
            Self::Duplicate => "Duplicate resource",
            Self::AccountNotFound => "Account not found",
            Self::CardNotFound => "Card not found",
            Self::CardBlocked => "Card blocked",
            Self::CardNotLinked => "Card not linked",
            Self::UserNotFound => "User not found",
            Self::UserAlreadyExists => "User already exists",
            Self::Unavailable => "Service unavailable",
            Self::Timeout => "Timeout",
            Self::Storage => "Storage error",
            Self::Serialization => "Serialization error",
            Self::Internal => "Internal error",
        }
    }

    /// Transient failures that a caller, consumer or publisher may retry.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict | Self::Unavailable | Self::Timeout | Self::Storage
        )
    }
}

/// Caller-visible error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Stable code, e.g. `INSUFFICIENT_FUNDS`
    pub code: String,
    /// Short title
    pub title: String,
    /// HTTP-equivalent status
    pub status: u16,
    /// Error message
    pub detail: String,
    /// Correlation id of the failing request
    pub correlation_id: String,
    /// When the error was produced
    pub timestamp: DateTime<Utc>,
}

impl ApiError {
    /// Translate an internal error for a caller.
    ///
    /// Internal infrastructure details are not echoed back; the caller gets
    /// the title and can quote the correlation id.
    #[must_use]
    pub fn from_error(err: &LedgerError, correlation_id: &CorrelationId, at: DateTime<Utc>) -> Self {
        let kind = err.kind();
        let detail = match kind {
            ErrorKind::Storage | ErrorKind::Serialization | ErrorKind::Internal => {
                "An unexpected error occurred".to_string()
            }
            _ => err.to_string(),
        };
        Self {
            code: kind.code().to_string(),
            title: kind.title().to_string(),
            status: kind.status(),
            detail,
            correlation_id: correlation_id.as_str().to_string(),
            timestamp: at,
        }
    }
}
