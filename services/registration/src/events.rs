//! Events emitted through the registration outbox.

use serde::Serialize;
use tally_core::event::DomainEvent;
use tally_core::ids::UserId;

/// Aggregate type recorded on outbox rows.
pub const AGGREGATE_TYPE: &str = "User";

/// Event type of [`UserRegistered`].
pub const USER_REGISTERED: &str = "USER_REGISTERED";

/// Someone signed up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    /// New user id
    pub user_id: UserId,
    /// Display name
    pub username: String,
    /// Login email
    pub email: String,
}

impl DomainEvent for UserRegistered {
    fn event_type(&self) -> &'static str {
        USER_REGISTERED
    }

    fn aggregate_id(&self) -> String {
        self.user_id.to_string()
    }
}
