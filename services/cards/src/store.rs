//! Persistence seam of the cards service.

use crate::domain::{Card, CardType};
use tally_core::StoreFuture;
use tally_core::idempotency::IdempotencyStore;
use tally_core::ids::{CardId, UserId};
use tally_core::money::Currency;
use tally_core::outbox::Commit;
use tally_core::version::Version;

/// Primary key of `cards`.
pub const CARDS_PKEY: &str = "cards_pkey";

/// At most one active card per owner, type and currency.
pub const CARDS_OWNER_DEFAULT_KEY: &str = "cards_owner_default_key";

/// One write inside a cards commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CardWrite {
    /// Insert a new card
    Insert(Card),
    /// Replace a card if its stored version is still `expected`
    Update {
        /// New state, version already advanced
        card: Card,
        /// Version the change was based on
        expected: Version,
    },
}

/// Card storage plus the shared idempotency table.
pub trait CardStore: IdempotencyStore {
    /// Card by id.
    fn card(&self, id: CardId) -> StoreFuture<'_, Option<Card>>;

    /// All cards of an owner, oldest first.
    fn cards_for_owner(&self, owner: UserId) -> StoreFuture<'_, Vec<Card>>;

    /// The owner's active card of this type and currency.
    fn active_card(&self, owner: UserId, card_type: CardType, currency: Currency) -> StoreFuture<'_, Option<Card>>;

    /// Apply writes, idempotency record and outbox rows atomically.
    fn commit(&self, commit: Commit<CardWrite>) -> StoreFuture<'_, ()>;
}
