//! The user profile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_core::version::Version;

/// Longest accepted username.
pub const MAX_USERNAME_LENGTH: usize = 50;

/// Lifecycle status of a user.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    /// Normal
    #[default]
    Active,
    /// Blocked by an operator
    Blocked,
}

impl UserStatus {
    /// Stored form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(LedgerError::Serialization(format!("unknown user status '{other}'"))),
        }
    }
}

/// Request to create a user directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    /// Display name
    pub username: String,
    /// Email, unique across users
    pub email: String,
}

impl CreateUserRequest {
    /// Convenience constructor.
    #[must_use]
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }

    /// Trim, lowercase the email and validate.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Validation`] for a blank or overlong username
    /// or a malformed email.
    pub fn normalized(self) -> Result<Self, LedgerError> {
        let username = normalize_username(&self.username)?;
        let email = self.email.trim().to_lowercase();
        if !email.split_once('@').is_some_and(|(l, d)| !l.is_empty() && !d.is_empty()) {
            return Err(LedgerError::Validation(format!("invalid email '{email}'")));
        }
        Ok(Self { username, email })
    }
}

/// Request to rename a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    /// New display name
    pub username: String,
}

impl UpdateUserRequest {
    /// Convenience constructor.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    /// Trim and validate.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Validation`] for a blank or overlong username.
    pub fn normalized(self) -> Result<Self, LedgerError> {
        Ok(Self {
            username: normalize_username(&self.username)?,
        })
    }
}

fn normalize_username(raw: &str) -> Result<String, LedgerError> {
    let username = raw.trim().to_string();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(LedgerError::Validation(format!(
            "username must be 1 to {MAX_USERNAME_LENGTH} characters"
        )));
    }
    Ok(username)
}

/// A user profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User id
    pub id: UserId,
    /// Display name
    pub username: String,
    /// Email
    pub email: String,
    /// Lifecycle status
    pub status: UserStatus,
    /// Soft-deleted users stay stored but are hidden from reads
    #[serde(default)]
    pub deleted: bool,
    /// Optimistic lock token
    pub version: Version,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A fresh active user.
    #[must_use]
    pub fn new(id: UserId, username: String, email: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            username,
            email,
            status: UserStatus::Active,
            deleted: false,
            version: Version::INITIAL,
            created_at,
        }
    }

    /// Block the user. Returns `false` if already blocked.
    pub fn block(&mut self) -> bool {
        if self.status == UserStatus::Blocked {
            return false;
        }
        self.status = UserStatus::Blocked;
        self.version = self.version.next();
        true
    }

    /// Change the username. Returns `false` if it is unchanged.
    pub fn rename(&mut self, username: &str) -> bool {
        if self.username == username {
            return false;
        }
        self.username = username.to_string();
        self.version = self.version.next();
        true
    }

    /// Mark the user deleted. Returns `false` if already deleted.
    pub fn soft_delete(&mut self) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        self.version = self.version.next();
        true
    }
}
