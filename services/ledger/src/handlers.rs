//! Inbound events.

use crate::service::LedgerService;
use crate::store::LedgerStore;
use serde::Deserialize;
use std::sync::Arc;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_runtime::{EventContext, EventHandler};

/// Event type emitted by the cards service.
pub const CARD_CREATED: &str = "CARD_CREATED";

/// Payload of `CARD_CREATED`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardCreatedPayload {
    /// Card holder
    pub user_id: Option<UserId>,
}

/// Opens the holder's account and links their cards.
pub struct CardCreatedHandler<S> {
    service: Arc<LedgerService<S>>,
}

impl<S> CardCreatedHandler<S> {
    /// Handler delegating to `service`.
    #[must_use]
    pub const fn new(service: Arc<LedgerService<S>>) -> Self {
        Self { service }
    }
}

impl<S: LedgerStore + 'static> EventHandler for CardCreatedHandler<S> {
    type Payload = CardCreatedPayload;

    fn event_type(&self) -> &'static str {
        CARD_CREATED
    }

    async fn handle(&self, payload: CardCreatedPayload, ctx: &EventContext) -> Result<(), LedgerError> {
        let Some(user_id) = payload.user_id else {
            tracing::warn!(correlation_id = %ctx.correlation_id, "CARD_CREATED without userId");
            return Ok(());
        };
        tracing::info!(%user_id, correlation_id = %ctx.correlation_id, "CARD_CREATED received");
        self.service
            .provision_default_account(user_id, &ctx.correlation_id)
            .await
    }
}
