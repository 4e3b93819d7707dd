//! Card to account resolution.
//!
//! Transfers address cards; balances live on accounts. The cards service
//! owns the link between the two, so every transfer asks it through a
//! [`CardDirectory`]. Linking runs the other way: when the ledger opens an
//! account it pushes the account id to every unlinked card of the owner.
//! That push is retried because the cards service may not have caught up
//! with the events that led here.

use crate::store::LedgerStore;
use std::sync::Arc;
use tally_core::directory::{CardDirectory, CardStatus, RemoteError};
use tally_core::error::LedgerError;
use tally_core::ids::{AccountId, CardId, UserId};
use tally_runtime::retry::{RetryPolicy, retry_with_backoff};

/// Resolves cards to accounts and links new cards.
pub struct CardResolver<S> {
    store: Arc<S>,
    directory: Arc<dyn CardDirectory>,
    link_policy: RetryPolicy,
}

impl<S: LedgerStore> CardResolver<S> {
    /// Resolver over the local store and a card directory.
    ///
    /// Linking makes 5 attempts, 2 seconds apart.
    #[must_use]
    pub fn new(store: Arc<S>, directory: Arc<dyn CardDirectory>) -> Self {
        Self {
            store,
            directory,
            link_policy: RetryPolicy::fixed(5, std::time::Duration::from_secs(2)),
        }
    }

    /// Replace the link retry policy.
    #[must_use]
    pub fn with_link_policy(mut self, policy: RetryPolicy) -> Self {
        self.link_policy = policy;
        self
    }

    /// Account behind an active, linked card.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::CardNotFound`] for an unknown card
    /// - [`LedgerError::CardBlocked`] when the card is not active
    /// - [`LedgerError::CardNotLinked`] when it has no account yet
    /// - [`LedgerError::Unavailable`] or [`LedgerError::Timeout`] when the
    ///   cards service cannot be reached
    pub async fn resolve_account(&self, card: CardId) -> Result<AccountId, LedgerError> {
        let view = self.directory.card(card).await.map_err(|e| e.for_card(card))?;
        if view.status != CardStatus::Active {
            return Err(LedgerError::CardBlocked(card));
        }
        view.account_id.ok_or(LedgerError::CardNotLinked(card))
    }

    /// Link every unlinked card of `owner` to the owner's account.
    ///
    /// Returns how many cards were linked by the successful attempt.
    ///
    /// # Errors
    ///
    /// Returns the last failure once all attempts are used up.
    pub async fn link_new_cards_to_account(&self, owner: UserId) -> Result<usize, LedgerError> {
        retry_with_backoff(self.link_policy.clone(), || self.link_once(owner)).await
    }

    async fn link_once(&self, owner: UserId) -> Result<usize, LedgerError> {
        tracing::info!(user_id = %owner, "Resolving card-account links");
        let account = self
            .store
            .account_by_owner(owner)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(format!("owner {owner}")))?;

        let cards = match self.directory.cards_for_owner(owner).await {
            Ok(cards) => cards,
            Err(RemoteError::NotFound) => {
                tracing::info!(user_id = %owner, "No cards found");
                return Ok(0);
            }
            Err(err) => return Err(owner_lookup_failed(err)),
        };

        let mut linked = 0;
        for card in cards.iter().filter(|card| card.account_id.is_none()) {
            tracing::info!(card_id = %card.id, account_id = %account.id, "Linking card to account");
            self.directory
                .link_account(card.id, account.id)
                .await
                .map_err(|e| e.for_card(card.id))?;
            linked += 1;
        }
        Ok(linked)
    }
}

fn owner_lookup_failed(err: RemoteError) -> LedgerError {
    match err {
        RemoteError::Timeout(reason) => LedgerError::Timeout(format!("card service: {reason}")),
        other => LedgerError::Unavailable(format!("card service: {other}")),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::domain::Account;
    use crate::memory::InMemoryLedgerStore;
    use crate::store::LedgerWrite;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tally_core::directory::{CardView, DirectoryFuture};
    use tally_core::environment::Clock;
    use tally_core::money::Currency;
    use tally_core::outbox::Commit;
    use tally_testing::test_clock;

    /// Directory that fails the first `failures` owner lookups.
    #[derive(Default)]
    struct ScriptedDirectory {
        cards: Mutex<HashMap<CardId, CardView>>,
        failures: AtomicUsize,
        lookups: AtomicUsize,
    }

    impl ScriptedDirectory {
        fn with_card(self, view: CardView) -> Self {
            self.cards.lock().unwrap().insert(view.id, view);
            self
        }

        fn failing(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    impl CardDirectory for ScriptedDirectory {
        fn card(&self, id: CardId) -> DirectoryFuture<'_, CardView> {
            let card = self.cards.lock().unwrap().get(&id).cloned();
            Box::pin(async move { card.ok_or(RemoteError::NotFound) })
        }

        fn cards_for_owner(&self, owner: UserId) -> DirectoryFuture<'_, Vec<CardView>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let cards: Vec<CardView> = self
                .cards
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.owner_id == owner)
                .cloned()
                .collect();
            Box::pin(async move {
                if failing {
                    return Err(RemoteError::Transport("connection refused".into()));
                }
                Ok(cards)
            })
        }

        fn link_account(&self, card: CardId, account: AccountId) -> DirectoryFuture<'_, ()> {
            let result = match self.cards.lock().unwrap().get_mut(&card) {
                Some(view) => {
                    view.account_id.get_or_insert(account);
                    Ok(())
                }
                None => Err(RemoteError::NotFound),
            };
            Box::pin(async move { result })
        }
    }

    fn view(owner: UserId, status: CardStatus, account_id: Option<AccountId>) -> CardView {
        CardView {
            id: CardId::new(),
            owner_id: owner,
            account_id,
            currency: Currency::Usd,
            status,
        }
    }

    async fn store_with_account(owner: UserId) -> (Arc<InMemoryLedgerStore>, AccountId) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account = Account::open(owner, Currency::Usd, test_clock().now());
        let id = account.id;
        store.commit(Commit::new().write(LedgerWrite::InsertAccount(account))).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn resolve_requires_an_active_linked_card() {
        let owner = UserId::new();
        let account = AccountId::new();
        let linked = view(owner, CardStatus::Active, Some(account));
        let blocked = view(owner, CardStatus::Blocked, Some(account));
        let unlinked = view(owner, CardStatus::Active, None);
        let directory = ScriptedDirectory::default()
            .with_card(linked.clone())
            .with_card(blocked.clone())
            .with_card(unlinked.clone());
        let resolver = CardResolver::new(Arc::new(InMemoryLedgerStore::new()), Arc::new(directory));

        assert_eq!(resolver.resolve_account(linked.id).await.unwrap(), account);
        assert_eq!(
            resolver.resolve_account(blocked.id).await.unwrap_err(),
            LedgerError::CardBlocked(blocked.id)
        );
        assert_eq!(
            resolver.resolve_account(unlinked.id).await.unwrap_err(),
            LedgerError::CardNotLinked(unlinked.id)
        );
        let missing = CardId::new();
        assert_eq!(
            resolver.resolve_account(missing).await.unwrap_err(),
            LedgerError::CardNotFound(missing)
        );
    }

    #[tokio::test]
    async fn linking_only_touches_unlinked_cards() {
        let owner = UserId::new();
        let (store, account) = store_with_account(owner).await;
        let other = AccountId::new();
        let fresh = view(owner, CardStatus::Active, None);
        let old = view(owner, CardStatus::Active, Some(other));
        let directory = Arc::new(
            ScriptedDirectory::default()
                .with_card(fresh.clone())
                .with_card(old.clone()),
        );
        let resolver = CardResolver::new(store, directory.clone());

        assert_eq!(resolver.link_new_cards_to_account(owner).await.unwrap(), 1);
        assert_eq!(resolver.link_new_cards_to_account(owner).await.unwrap(), 0);

        let cards = directory.cards.lock().unwrap();
        assert_eq!(cards[&fresh.id].account_id, Some(account));
        assert_eq!(cards[&old.id].account_id, Some(other));
    }

    #[tokio::test(start_paused = true)]
    async fn linking_converges_after_transient_failures() {
        let owner = UserId::new();
        let (store, account) = store_with_account(owner).await;
        let card = view(owner, CardStatus::Active, None);
        let directory = Arc::new(ScriptedDirectory::default().with_card(card.clone()).failing(3));
        let resolver = CardResolver::new(store, directory.clone());

        assert_eq!(resolver.link_new_cards_to_account(owner).await.unwrap(), 1);

        assert_eq!(directory.lookups.load(Ordering::SeqCst), 4);
        assert_eq!(directory.cards.lock().unwrap()[&card.id].account_id, Some(account));
    }

    #[tokio::test]
    async fn linking_gives_up_after_the_policy_is_spent() {
        let owner = UserId::new();
        let (store, _account) = store_with_account(owner).await;
        let directory = Arc::new(ScriptedDirectory::default().failing(10));
        let resolver = CardResolver::new(store, directory.clone())
            .with_link_policy(RetryPolicy::fixed(3, Duration::ZERO));

        let err = resolver.link_new_cards_to_account(owner).await.unwrap_err();

        assert!(matches!(err, LedgerError::Unavailable(_)));
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn owner_without_cards_is_not_an_error() {
        let owner = UserId::new();
        let (store, _account) = store_with_account(owner).await;
        let resolver = CardResolver::new(store, Arc::new(ScriptedDirectory::default()));

        assert_eq!(resolver.link_new_cards_to_account(owner).await.unwrap(), 0);
    }
}
