//! Events emitted through the users outbox.

use serde::Serialize;
use tally_core::event::DomainEvent;
use tally_core::ids::UserId;

/// Aggregate type recorded on outbox rows.
pub const AGGREGATE_TYPE: &str = "User";

/// Event type of [`UserCreated`].
pub const USER_CREATED: &str = "USER_CREATED";

/// Event type of [`UserBlocked`].
pub const USER_BLOCKED: &str = "USER_BLOCKED";

/// A user profile now exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    /// User id
    pub user_id: UserId,
    /// Display name
    pub username: String,
    /// Email
    pub email: String,
}

impl DomainEvent for UserCreated {
    fn event_type(&self) -> &'static str {
        USER_CREATED
    }

    fn aggregate_id(&self) -> String {
        self.user_id.to_string()
    }
}

/// A user was blocked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBlocked {
    /// User id
    pub user_id: UserId,
}

impl DomainEvent for UserBlocked {
    fn event_type(&self) -> &'static str {
        USER_BLOCKED
    }

    fn aggregate_id(&self) -> String {
        self.user_id.to_string()
    }
}
