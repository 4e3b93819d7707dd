//! Events emitted through the cards outbox.

use crate::domain::CardType;
use serde::Serialize;
use tally_core::event::DomainEvent;
use tally_core::ids::{CardId, UserId};
use tally_core::money::Currency;

/// Aggregate type recorded on outbox rows.
pub const AGGREGATE_TYPE: &str = "Card";

/// Event type of [`CardCreated`].
pub const CARD_CREATED: &str = "CARD_CREATED";

/// A card was issued. Keyed by owner so one owner's cards stay in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardCreated {
    /// Card holder
    pub user_id: UserId,
    /// New card
    pub card_id: CardId,
    /// Card currency
    pub currency: Currency,
    /// Debit or credit
    pub card_type: CardType,
}

impl DomainEvent for CardCreated {
    fn event_type(&self) -> &'static str {
        CARD_CREATED
    }

    fn aggregate_id(&self) -> String {
        self.user_id.to_string()
    }
}
