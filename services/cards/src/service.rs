//! Card commands and queries.

use crate::domain::{Card, CardType, CreateCardRequest};
use crate::events::{AGGREGATE_TYPE, CardCreated};
use crate::store::{CARDS_OWNER_DEFAULT_KEY, CardStore, CardWrite};
use std::sync::Arc;
use tally_core::correlation::CorrelationId;
use tally_core::directory::{CardDirectory, CardView, DirectoryFuture, RemoteError};
use tally_core::environment::Clock;
use tally_core::error::LedgerError;
use tally_core::idempotency::{Claim, IdempotencyKey, guard};
use tally_core::ids::{AccountId, CardId, UserId};
use tally_core::money::Currency;
use tally_core::outbox::{Commit, OutboxRecord};
use tally_runtime::retry::{RetryPolicy, retry_with_predicate};

/// Idempotency operation of [`CardService::create_card`].
pub const CREATE_CARD: &str = "CREATE_CARD";

/// Cards command handler.
pub struct CardService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: CardStore> CardService<S> {
    /// Build on a store and a clock.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Give a new user their default USD debit card.
    ///
    /// Safe to run any number of times for the same user: an existing active
    /// default card, or losing the insert race on it, counts as done.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn provision_default_cards(&self, owner: UserId, correlation: &CorrelationId) -> Result<(), LedgerError> {
        let (card_type, currency) = (CardType::Debit, Currency::Usd);
        if let Some(card) = self.store.active_card(owner, card_type, currency).await? {
            tracing::info!(user_id = %owner, card_id = %card.id, "Default card already exists");
            return Ok(());
        }

        let card = Card::issue(owner, currency, card_type, self.clock.now());
        match self.insert(card, None, correlation).await {
            Ok(card) => {
                tracing::info!(user_id = %owner, card_id = %card.id, "Default card provisioned");
                Ok(())
            }
            Err(err) if err.is_unique_violation_on(CARDS_OWNER_DEFAULT_KEY) => {
                tracing::info!(user_id = %owner, "Default card created concurrently");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Issue a card on request.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UniqueViolation`] if the owner already holds an
    ///   active card of that type and currency
    /// - [`LedgerError::IdempotencyConflict`] on key reuse with another request
    pub async fn create_card(
        &self,
        request: CreateCardRequest,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<Card, LedgerError> {
        guard(
            self.store.as_ref(),
            key,
            &request,
            CREATE_CARD,
            |claim| self.create(&request, claim, correlation),
            |id| self.card(CardId::from_uuid(id)),
        )
        .await
    }

    async fn create(
        &self,
        request: &CreateCardRequest,
        claim: Option<Claim>,
        correlation: &CorrelationId,
    ) -> Result<Card, LedgerError> {
        let card = Card::issue(request.owner_id, request.currency, request.card_type, self.clock.now());
        self.insert(card, claim, correlation).await
    }

    async fn insert(&self, card: Card, claim: Option<Claim>, correlation: &CorrelationId) -> Result<Card, LedgerError> {
        let now = card.created_at;
        let event = CardCreated {
            user_id: card.owner_id,
            card_id: card.id,
            currency: card.currency,
            card_type: card.card_type,
        };
        let commit = Commit::new()
            .write(CardWrite::Insert(card.clone()))
            .idempotency(claim.map(|c| c.record(card.id, now)))
            .event(OutboxRecord::for_event(AGGREGATE_TYPE, &event, Some(correlation), now)?);
        self.store.commit(commit).await?;
        Ok(card)
    }

    /// One card.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CardNotFound`] if there is none.
    pub async fn card(&self, id: CardId) -> Result<Card, LedgerError> {
        self.store.card(id).await?.ok_or(LedgerError::CardNotFound(id))
    }

    /// All cards of an owner, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn cards_for_owner(&self, owner: UserId) -> Result<Vec<Card>, LedgerError> {
        self.store.cards_for_owner(owner).await
    }

    /// Attach a ledger account. A card keeps the first account it was linked to.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CardNotFound`], or the version conflict if every
    /// optimistic attempt lost.
    pub async fn link_account(&self, id: CardId, account: AccountId) -> Result<Card, LedgerError> {
        self.update(id, |card| Ok(card.link(account))).await?;
        self.card(id).await
    }

    /// Block a card.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CardNotFound`], or [`LedgerError::CardBlocked`]
    /// for a closed card.
    pub async fn block(&self, id: CardId) -> Result<Card, LedgerError> {
        self.update(id, Card::block).await?;
        self.card(id).await
    }

    /// Close a card for good.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CardNotFound`].
    pub async fn close(&self, id: CardId) -> Result<Card, LedgerError> {
        self.update(id, |card| Ok(card.close())).await?;
        self.card(id).await
    }

    async fn update<F>(&self, id: CardId, change: F) -> Result<(), LedgerError>
    where
        F: Fn(&mut Card) -> Result<bool, LedgerError>,
    {
        retry_with_predicate(
            RetryPolicy::optimistic(),
            || self.update_once(id, &change),
            LedgerError::is_concurrency_conflict,
        )
        .await
    }

    async fn update_once<F>(&self, id: CardId, change: &F) -> Result<(), LedgerError>
    where
        F: Fn(&mut Card) -> Result<bool, LedgerError>,
    {
        let mut card = self.card(id).await?;
        let expected = card.version;
        if change(&mut card)? {
            self.store
                .commit(Commit::new().write(CardWrite::Update { card, expected }))
                .await?;
            tracing::info!(card_id = %id, "Card updated");
        }
        Ok(())
    }
}

impl<S: CardStore + 'static> CardDirectory for CardService<S> {
    fn card(&self, id: CardId) -> DirectoryFuture<'_, CardView> {
        Box::pin(async move { Ok(Self::card(self, id).await?.view()) })
    }

    fn cards_for_owner(&self, owner: UserId) -> DirectoryFuture<'_, Vec<CardView>> {
        Box::pin(async move {
            let cards = Self::cards_for_owner(self, owner).await?;
            Ok(cards.iter().map(Card::view).collect())
        })
    }

    fn link_account(&self, card: CardId, account: AccountId) -> DirectoryFuture<'_, ()> {
        Box::pin(async move {
            Self::link_account(self, card, account).await.map_err(RemoteError::from)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::CARD_CREATED;
    use crate::memory::InMemoryCardStore;
    use tally_core::directory::CardStatus;
    use tally_core::version::Version;
    use tally_testing::test_clock;

    fn service() -> (Arc<InMemoryCardStore>, CardService<InMemoryCardStore>) {
        let store = Arc::new(InMemoryCardStore::new());
        (store.clone(), CardService::new(store, Arc::new(test_clock())))
    }

    #[tokio::test]
    async fn default_card_is_provisioned_once() {
        let (store, service) = service();
        let owner = UserId::new();
        let cid = CorrelationId::new("kafka-7");

        service.provision_default_cards(owner, &cid).await.unwrap();
        service.provision_default_cards(owner, &cid).await.unwrap();

        let cards = service.cards_for_owner(owner).await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].card_type, CardType::Debit);
        assert_eq!(cards[0].currency, Currency::Usd);
        assert!(cards[0].number.starts_with("4111"));

        let outbox = store.outbox_records().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, CARD_CREATED);
        assert_eq!(outbox[0].aggregate_id, owner.to_string());
        assert_eq!(outbox[0].payload["cardId"], cards[0].id.to_string());
        assert_eq!(outbox[0].payload["currency"], "USD");
        assert_eq!(outbox[0].correlation_id.as_deref(), Some("kafka-7"));
    }

    #[tokio::test]
    async fn concurrent_provisioning_converges() {
        let (store, service) = service();
        let service = Arc::new(service);
        let owner = UserId::new();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.provision_default_cards(owner, &CorrelationId::generate()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.read(|t| t.cards.len()).await, 1);
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn create_card_replays_by_key() {
        let (store, service) = service();
        let key = IdempotencyKey::new("card-1").unwrap();
        let cid = CorrelationId::generate();
        let request = CreateCardRequest {
            owner_id: UserId::new(),
            currency: Currency::Eur,
            card_type: CardType::Credit,
        };

        let first = service.create_card(request.clone(), Some(&key), &cid).await.unwrap();
        let replay = service.create_card(request.clone(), Some(&key), &cid).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(store.idempotency_count().await, 1);

        let other = CreateCardRequest {
            currency: Currency::Usd,
            ..request.clone()
        };
        let err = service.create_card(other, Some(&key), &cid).await.unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));

        let err = service.create_card(request, None, &cid).await.unwrap_err();
        assert!(err.is_unique_violation_on(CARDS_OWNER_DEFAULT_KEY));
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn create_card_that_lost_the_key_race_replays() {
        let (store, service) = service();
        let key = IdempotencyKey::new("card-1").unwrap();
        let cid = CorrelationId::generate();
        let request = CreateCardRequest {
            owner_id: UserId::new(),
            currency: Currency::Eur,
            card_type: CardType::Credit,
        };
        let first = service.create_card(request.clone(), Some(&key), &cid).await.unwrap();

        store.stale_idempotency_lookups(1).await;
        let second = service.create_card(request, Some(&key), &cid).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.read(|t| t.cards.len()).await, 1);
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn link_keeps_the_first_account() {
        let (_store, service) = service();
        let owner = UserId::new();
        service.provision_default_cards(owner, &CorrelationId::generate()).await.unwrap();
        let card = service.cards_for_owner(owner).await.unwrap().remove(0);
        let first = AccountId::new();

        let linked = service.link_account(card.id, first).await.unwrap();
        let again = service.link_account(card.id, AccountId::new()).await.unwrap();

        assert_eq!(linked.account_id, Some(first));
        assert_eq!(again.account_id, Some(first));
        assert_eq!(again.version, Version::new(1));
    }

    #[tokio::test]
    async fn link_retries_version_conflicts() {
        let (store, service) = service();
        let owner = UserId::new();
        service.provision_default_cards(owner, &CorrelationId::generate()).await.unwrap();
        let card = service.cards_for_owner(owner).await.unwrap().remove(0);
        store
            .inject_commit_failures([LedgerError::conflict("card", card.id)])
            .await;

        let linked = service.link_account(card.id, AccountId::new()).await.unwrap();

        assert!(linked.account_id.is_some());
    }

    #[tokio::test]
    async fn blocked_and_closed_cards_free_the_default_slot() {
        let (_store, service) = service();
        let owner = UserId::new();
        let cid = CorrelationId::generate();
        service.provision_default_cards(owner, &cid).await.unwrap();
        let card = service.cards_for_owner(owner).await.unwrap().remove(0);

        assert_eq!(service.block(card.id).await.unwrap().status, CardStatus::Blocked);
        assert_eq!(service.close(card.id).await.unwrap().status, CardStatus::Closed);
        assert_eq!(service.block(card.id).await.unwrap_err(), LedgerError::CardBlocked(card.id));

        service.provision_default_cards(owner, &cid).await.unwrap();
        assert_eq!(service.cards_for_owner(owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn directory_exposes_views_and_remote_errors() {
        let (_store, service) = service();
        let owner = UserId::new();
        service.provision_default_cards(owner, &CorrelationId::generate()).await.unwrap();
        let directory: &dyn CardDirectory = &service;

        let views = directory.cards_for_owner(owner).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, CardStatus::Active);
        assert_eq!(views[0].account_id, None);

        let account = AccountId::new();
        directory.link_account(views[0].id, account).await.unwrap();
        assert_eq!(directory.card(views[0].id).await.unwrap().account_id, Some(account));

        assert_eq!(directory.card(CardId::new()).await.unwrap_err(), RemoteError::NotFound);
        assert_eq!(
            directory.link_account(CardId::new(), account).await.unwrap_err(),
            RemoteError::NotFound
        );
        assert!(directory.cards_for_owner(UserId::new()).await.unwrap().is_empty());
    }
}
