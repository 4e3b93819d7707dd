//! Row version numbers for optimistic concurrency control.
//!
//! Every mutable entity (account, user, card) carries a [`Version`]. A write
//! names the version it read; the store rejects it with
//! [`LedgerError::ConcurrencyConflict`](crate::error::LedgerError::ConcurrencyConflict)
//! when the stored version has moved on, and bumps the version on success.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version number of a persisted row.
///
/// Versions start at 0 when a row is inserted and increment by 1 on every
/// successful update.
///
/// # Examples
///
/// ```
/// use tally_core::version::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly inserted row.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Read a version from a signed database column.
    ///
    /// Negative values never occur in a healthy table and are read as 0.
    #[must_use]
    pub fn from_db(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }

    /// Encode for a signed database column.
    #[must_use]
    pub fn to_db(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
