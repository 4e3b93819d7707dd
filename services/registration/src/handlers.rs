//! Inbound events.

use crate::service::RegistrationService;
use crate::store::RegistrationStore;
use serde::Deserialize;
use std::sync::Arc;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_runtime::{EventContext, EventHandler};

/// Event type emitted by the users service when it blocks someone.
pub const USER_BLOCKED: &str = "USER_BLOCKED";

/// Payload of `USER_BLOCKED`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBlockedPayload {
    /// Blocked user
    pub user_id: Option<UserId>,
}

/// Blocks local credentials when the users service blocks a user.
pub struct UserBlockedHandler<S> {
    service: Arc<RegistrationService<S>>,
}

impl<S> UserBlockedHandler<S> {
    /// Handler delegating to `service`.
    #[must_use]
    pub const fn new(service: Arc<RegistrationService<S>>) -> Self {
        Self { service }
    }
}

impl<S: RegistrationStore + 'static> EventHandler for UserBlockedHandler<S> {
    type Payload = UserBlockedPayload;

    fn event_type(&self) -> &'static str {
        USER_BLOCKED
    }

    async fn handle(&self, payload: UserBlockedPayload, ctx: &EventContext) -> Result<(), LedgerError> {
        let Some(user_id) = payload.user_id else {
            tracing::warn!(correlation_id = %ctx.correlation_id, "USER_BLOCKED without userId");
            return Ok(());
        };
        self.service.block_user(user_id).await
    }
}
