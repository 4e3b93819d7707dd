//! Credentials and the registration request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::error::LedgerError;
use tally_core::ids::UserId;

/// Longest accepted username.
pub const MAX_USERNAME_LENGTH: usize = 50;

/// Longest accepted email address.
pub const MAX_EMAIL_LENGTH: usize = 255;

/// A sign-up request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Display name
    pub username: String,
    /// Login email, unique across users
    pub email: String,
}

impl RegisterRequest {
    /// Convenience constructor.
    #[must_use]
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }

    /// Trim both fields, lowercase the email and validate them.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Validation`] for a blank or overlong username
    /// or an email without an `@`.
    pub fn normalized(self) -> Result<Self, LedgerError> {
        let username = self.username.trim().to_string();
        let email = self.email.trim().to_lowercase();

        if username.is_empty() || username.chars().count() > MAX_USERNAME_LENGTH {
            return Err(LedgerError::Validation(format!(
                "username must be 1 to {MAX_USERNAME_LENGTH} characters"
            )));
        }
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => return Err(LedgerError::Validation(format!("invalid email '{email}'"))),
        }
        if email.len() > MAX_EMAIL_LENGTH {
            return Err(LedgerError::Validation("email is too long".to_string()));
        }

        Ok(Self { username, email })
    }
}

/// Stored credentials of one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// User id, shared with every other service
    pub user_id: UserId,
    /// Display name
    pub username: String,
    /// Login email
    pub email: String,
    /// Set once the users service blocks the user
    pub blocked: bool,
    /// Registration time
    pub created_at: DateTime<Utc>,
}
