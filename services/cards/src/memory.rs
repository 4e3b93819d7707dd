//! In-memory [`CardStore`] for tests.

use crate::domain::{Card, CardType};
use crate::store::{CARDS_OWNER_DEFAULT_KEY, CARDS_PKEY, CardStore, CardWrite};
use std::collections::HashMap;
use tally_core::StoreFuture;
use tally_core::directory::CardStatus;
use tally_core::error::LedgerError;
use tally_core::ids::{CardId, UserId};
use tally_core::money::Currency;
use tally_core::outbox::Commit;
use tally_testing::{InMemoryStore, TableWrite};

/// The `cards` table.
#[derive(Clone, Debug, Default)]
pub struct CardTables {
    /// Rows by id
    pub cards: HashMap<CardId, Card>,
}

impl CardTables {
    fn active(&self, owner: UserId, card_type: CardType, currency: Currency) -> Option<&Card> {
        self.cards.values().find(|c| {
            c.owner_id == owner
                && c.card_type == card_type
                && c.currency == currency
                && c.status == CardStatus::Active
        })
    }
}

/// Cards store backed by memory.
pub type InMemoryCardStore = InMemoryStore<CardTables>;

impl TableWrite<CardTables> for CardWrite {
    fn check(&self, tables: &CardTables) -> Result<(), LedgerError> {
        match self {
            Self::Insert(card) if tables.cards.contains_key(&card.id) => Err(LedgerError::UniqueViolation {
                constraint: CARDS_PKEY.to_string(),
            }),
            Self::Insert(card)
                if card.status == CardStatus::Active
                    && tables.active(card.owner_id, card.card_type, card.currency).is_some() =>
            {
                Err(LedgerError::UniqueViolation {
                    constraint: CARDS_OWNER_DEFAULT_KEY.to_string(),
                })
            }
            Self::Insert(_) => Ok(()),
            Self::Update { card, expected } => match tables.cards.get(&card.id) {
                Some(stored) if stored.version == *expected => Ok(()),
                Some(_) => Err(LedgerError::conflict("card", card.id)),
                None => Err(LedgerError::CardNotFound(card.id)),
            },
        }
    }

    fn apply(self, tables: &mut CardTables) {
        match self {
            Self::Insert(card) | Self::Update { card, .. } => {
                tables.cards.insert(card.id, card);
            }
        }
    }
}

impl CardStore for InMemoryStore<CardTables> {
    fn card(&self, id: CardId) -> StoreFuture<'_, Option<Card>> {
        Box::pin(async move { Ok(self.read(|t| t.cards.get(&id).cloned()).await) })
    }

    fn cards_for_owner(&self, owner: UserId) -> StoreFuture<'_, Vec<Card>> {
        Box::pin(async move {
            let mut cards: Vec<Card> = self
                .read(|t| t.cards.values().filter(|c| c.owner_id == owner).cloned().collect())
                .await;
            cards.sort_by_key(|c| (c.created_at, *c.id.as_uuid()));
            Ok(cards)
        })
    }

    fn active_card(&self, owner: UserId, card_type: CardType, currency: Currency) -> StoreFuture<'_, Option<Card>> {
        Box::pin(async move { Ok(self.read(|t| t.active(owner, card_type, currency).cloned()).await) })
    }

    fn commit(&self, commit: Commit<CardWrite>) -> StoreFuture<'_, ()> {
        Box::pin(InMemoryStore::commit(self, commit))
    }
}
