//! Inbound events.

use crate::service::{RegisteredUser, UserService};
use crate::store::UserStore;
use serde::Deserialize;
use std::sync::Arc;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_runtime::{EventContext, EventHandler};

/// Event type emitted by the registration service.
pub const USER_REGISTERED: &str = "USER_REGISTERED";

/// Payload of `USER_REGISTERED`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegisteredPayload {
    /// Registered user
    pub user_id: Option<UserId>,
    /// Display name
    pub username: String,
    /// Email
    pub email: String,
}

/// Creates the profile of a freshly registered user.
pub struct UserRegisteredHandler<S> {
    service: Arc<UserService<S>>,
}

impl<S> UserRegisteredHandler<S> {
    /// Handler delegating to `service`.
    #[must_use]
    pub const fn new(service: Arc<UserService<S>>) -> Self {
        Self { service }
    }
}

impl<S: UserStore + 'static> EventHandler for UserRegisteredHandler<S> {
    type Payload = UserRegisteredPayload;

    fn event_type(&self) -> &'static str {
        USER_REGISTERED
    }

    async fn handle(&self, payload: UserRegisteredPayload, ctx: &EventContext) -> Result<(), LedgerError> {
        let Some(user_id) = payload.user_id else {
            tracing::warn!(correlation_id = %ctx.correlation_id, "USER_REGISTERED without userId");
            return Ok(());
        };
        tracing::info!(%user_id, correlation_id = %ctx.correlation_id, "USER_REGISTERED received");
        self.service
            .register_user(
                RegisteredUser {
                    user_id,
                    username: payload.username,
                    email: payload.email,
                },
                &ctx.correlation_id,
            )
            .await
    }
}
