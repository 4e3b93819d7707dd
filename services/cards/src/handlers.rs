//! Inbound events.

use crate::service::CardService;
use crate::store::CardStore;
use serde::Deserialize;
use std::sync::Arc;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_runtime::{EventContext, EventHandler};

/// Event type emitted by the users service.
pub const USER_CREATED: &str = "USER_CREATED";

/// Payload of `USER_CREATED`. Only the id matters here.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedPayload {
    /// New user
    pub user_id: Option<UserId>,
}

/// Provisions default cards for new users.
pub struct UserCreatedHandler<S> {
    service: Arc<CardService<S>>,
}

impl<S> UserCreatedHandler<S> {
    /// Handler delegating to `service`.
    #[must_use]
    pub const fn new(service: Arc<CardService<S>>) -> Self {
        Self { service }
    }
}

impl<S: CardStore + 'static> EventHandler for UserCreatedHandler<S> {
    type Payload = UserCreatedPayload;

    fn event_type(&self) -> &'static str {
        USER_CREATED
    }

    async fn handle(&self, payload: UserCreatedPayload, ctx: &EventContext) -> Result<(), LedgerError> {
        let Some(user_id) = payload.user_id else {
            tracing::warn!(correlation_id = %ctx.correlation_id, "USER_CREATED without userId");
            return Ok(());
        };
        tracing::info!(%user_id, correlation_id = %ctx.correlation_id, "USER_CREATED received");
        self.service
            .provision_default_cards(user_id, &ctx.correlation_id)
            .await
    }
}
