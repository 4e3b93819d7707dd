//! Ledger commands and queries.
//!
//! Every money-moving command follows the same shape: resolve foreign ids,
//! pass through the idempotency [`guard`], then read the accounts, mutate
//! them in memory and commit the new versions together with the outbox row
//! and the idempotency record. A lost version race re-runs the read-mutate
//! step a few times before the conflict is surfaced as a retryable error.

use crate::domain::{Account, BalanceRequest, Transfer, TransferRequest, Turnover};
use crate::events::{ACCOUNT_AGGREGATE, AccountCreated, BalanceChanged, TRANSFER_AGGREGATE, TransferCompleted};
use crate::resolver::CardResolver;
use crate::store::{ACCOUNTS_OWNER_KEY, LedgerStore, LedgerWrite};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tally_core::correlation::CorrelationId;
use tally_core::directory::CardDirectory;
use tally_core::environment::Clock;
use tally_core::error::LedgerError;
use tally_core::idempotency::{Claim, IdempotencyKey, guard};
use tally_core::ids::{AccountId, TransferId, UserId};
use tally_core::money::{Currency, Money, validate_positive};
use tally_core::outbox::{Commit, OutboxRecord};
use tally_runtime::retry::{RetryPolicy, retry_with_predicate};

/// Idempotency operation of [`LedgerService::transfer`].
pub const TRANSFER: &str = "TRANSFER";

/// Idempotency operation of [`LedgerService::top_up`].
pub const TOP_UP: &str = "TOP_UP";

/// Idempotency operation of [`LedgerService::withdraw`].
pub const WITHDRAW: &str = "WITHDRAW";

/// Largest page of [`LedgerService::top_transfers`].
pub const MAX_TOP_TRANSFERS: u32 = 100;

#[derive(Copy, Clone)]
enum Direction {
    Credit,
    Debit,
}

/// Ledger command handler.
pub struct LedgerService<S> {
    store: Arc<S>,
    resolver: CardResolver<S>,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStore> LedgerService<S> {
    /// Build on a store, the cards directory and a clock.
    #[must_use]
    pub fn new(store: Arc<S>, directory: Arc<dyn CardDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            resolver: CardResolver::new(store.clone(), directory),
            store,
            clock,
        }
    }

    /// Replace the retry policy of card linking.
    #[must_use]
    pub fn with_link_policy(mut self, policy: RetryPolicy) -> Self {
        self.resolver = self.resolver.with_link_policy(policy);
        self
    }

    /// The card resolver.
    #[must_use]
    pub const fn resolver(&self) -> &CardResolver<S> {
        &self.resolver
    }

    /// Make sure `owner` has a USD account and that all their cards point to it.
    ///
    /// Linking runs even when the account already existed, so a redelivered
    /// or later `CARD_CREATED` still links cards issued after the account.
    ///
    /// # Errors
    ///
    /// Storage errors, or the resolver's error once its retries are spent.
    pub async fn provision_default_account(&self, owner: UserId, correlation: &CorrelationId) -> Result<(), LedgerError> {
        if self.store.account_by_owner(owner).await?.is_some() {
            tracing::info!(user_id = %owner, "Account already exists");
        } else {
            self.open_account(owner, Currency::Usd, correlation).await?;
        }
        let linked = self.resolver.link_new_cards_to_account(owner).await?;
        tracing::info!(user_id = %owner, linked, "Cards linked");
        Ok(())
    }

    async fn open_account(&self, owner: UserId, currency: Currency, correlation: &CorrelationId) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let account = Account::open(owner, currency, now);
        let event = AccountCreated {
            user_id: owner,
            account_id: account.id,
            currency,
        };
        let account_id = account.id;
        let commit = Commit::new()
            .write(LedgerWrite::InsertAccount(account))
            .event(OutboxRecord::for_event(ACCOUNT_AGGREGATE, &event, Some(correlation), now)?);

        match self.store.commit(commit).await {
            Ok(()) => {
                tracing::info!(%account_id, user_id = %owner, %currency, "Account created");
                Ok(())
            }
            Err(err) if err.is_unique_violation_on(ACCOUNTS_OWNER_KEY) => {
                tracing::info!(user_id = %owner, "Account created concurrently");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Move money between the accounts behind two cards.
    ///
    /// # Errors
    ///
    /// - card errors from the resolver
    /// - [`LedgerError::InvalidAmount`], [`LedgerError::SameAccountTransfer`],
    ///   [`LedgerError::CurrencyMismatch`], [`LedgerError::InsufficientFunds`]
    /// - [`LedgerError::IdempotencyConflict`] on key reuse with another request
    /// - [`LedgerError::ConcurrencyConflict`] if every optimistic attempt lost
    pub async fn transfer(
        &self,
        request: TransferRequest,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<Transfer, LedgerError> {
        tracing::info!(
            from_card_id = %request.from_card_id,
            to_card_id = %request.to_card_id,
            amount = ?request.amount,
            "Transfer started"
        );
        let from = self.resolver.resolve_account(request.from_card_id).await?;
        let to = self.resolver.resolve_account(request.to_card_id).await?;

        guard(
            self.store.as_ref(),
            key,
            &request,
            TRANSFER,
            |claim| self.execute_transfer(from, to, request.amount, claim, correlation),
            |id| self.get_transfer(TransferId::from_uuid(id)),
        )
        .await
    }

    async fn execute_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Option<Decimal>,
        claim: Option<Claim>,
        correlation: &CorrelationId,
    ) -> Result<Transfer, LedgerError> {
        let amount = validate_positive(amount)?;
        if from == to {
            return Err(LedgerError::SameAccountTransfer(from.to_string()));
        }
        retry_with_predicate(
            RetryPolicy::optimistic(),
            || self.transfer_once(from, to, amount, claim.as_ref(), correlation),
            LedgerError::is_concurrency_conflict,
        )
        .await
    }

    async fn transfer_once(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        claim: Option<&Claim>,
        correlation: &CorrelationId,
    ) -> Result<Transfer, LedgerError> {
        let mut source = self.account(from).await?;
        let mut target = self.account(to).await?;
        if source.currency != target.currency {
            return Err(LedgerError::CurrencyMismatch {
                from: source.currency,
                to: target.currency,
            });
        }

        let (source_version, target_version) = (source.version, target.version);
        source.debit(amount)?;
        target.credit(amount)?;

        let now = self.clock.now();
        let transfer = Transfer::new(from, to, Some(amount.amount()), now)?;
        let event = TransferCompleted {
            transfer_id: transfer.id,
            from_account_id: from,
            to_account_id: to,
            amount: transfer.amount,
        };
        let debit = LedgerWrite::UpdateAccount {
            account: source,
            expected: source_version,
        };
        let credit = LedgerWrite::UpdateAccount {
            account: target,
            expected: target_version,
        };
        let [first, second] = in_lock_order(from, to, debit, credit);
        let commit = Commit::new()
            .write(first)
            .write(second)
            .write(LedgerWrite::InsertTransfer(transfer.clone()))
            .idempotency(claim.map(|c| c.record(transfer.id, now)))
            .event(OutboxRecord::for_event(TRANSFER_AGGREGATE, &event, Some(correlation), now)?);
        self.store.commit(commit).await?;

        tracing::info!(
            transfer_id = %transfer.id,
            from_account_id = %from,
            to_account_id = %to,
            amount = %transfer.amount,
            "Transfer completed"
        );
        Ok(transfer)
    }

    /// Credit an account. Returns the balance afterwards.
    ///
    /// A replayed key returns the account's current balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] unless `amount` is positive
    /// - [`LedgerError::AccountNotFound`]
    /// - [`LedgerError::IdempotencyConflict`] on key reuse with another request
    pub async fn top_up(
        &self,
        account_id: AccountId,
        amount: Option<Decimal>,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<Money, LedgerError> {
        self.change_balance(Direction::Credit, account_id, amount, key, correlation)
            .await
    }

    /// Debit an account. Returns the balance afterwards.
    ///
    /// A replayed key returns the account's current balance.
    ///
    /// # Errors
    ///
    /// Same as [`LedgerService::top_up`], plus
    /// [`LedgerError::InsufficientFunds`].
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount: Option<Decimal>,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<Money, LedgerError> {
        self.change_balance(Direction::Debit, account_id, amount, key, correlation)
            .await
    }

    async fn change_balance(
        &self,
        direction: Direction,
        account_id: AccountId,
        amount: Option<Decimal>,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<Money, LedgerError> {
        let amount = validate_positive(amount)?;
        let request = BalanceRequest { account_id, amount };
        let operation = match direction {
            Direction::Credit => TOP_UP,
            Direction::Debit => WITHDRAW,
        };
        guard(
            self.store.as_ref(),
            key,
            &request,
            operation,
            |claim| {
                retry_with_predicate(
                    RetryPolicy::optimistic(),
                    move || self.change_balance_once(direction, account_id, amount, claim.clone(), correlation),
                    LedgerError::is_concurrency_conflict,
                )
            },
            |id| self.balance(AccountId::from_uuid(id)),
        )
        .await
    }

    async fn change_balance_once(
        &self,
        direction: Direction,
        account_id: AccountId,
        amount: Money,
        claim: Option<Claim>,
        correlation: &CorrelationId,
    ) -> Result<Money, LedgerError> {
        let mut account = self.account(account_id).await?;
        let expected = account.version;
        let event = match direction {
            Direction::Credit => {
                account.credit(amount)?;
                BalanceChanged::topped_up(account_id, amount, account.balance)
            }
            Direction::Debit => {
                account.debit(amount)?;
                BalanceChanged::withdrawn(account_id, amount, account.balance)
            }
        };

        let now = self.clock.now();
        let balance = account.balance;
        let commit = Commit::new()
            .write(LedgerWrite::UpdateAccount { account, expected })
            .idempotency(claim.map(|c| c.record(account_id, now)))
            .event(OutboxRecord::for_event(ACCOUNT_AGGREGATE, &event, Some(correlation), now)?);
        self.store.commit(commit).await?;

        tracing::info!(%account_id, %amount, %balance, event_type = event.event_type, "Balance changed");
        Ok(balance)
    }

    /// One account.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] if there is none.
    pub async fn account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .account(id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    /// Current balance of an account.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] if there is none.
    pub async fn balance(&self, id: AccountId) -> Result<Money, LedgerError> {
        Ok(self.account(id).await?.balance)
    }

    /// The owner's account.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] if the owner has none.
    pub async fn account_for_owner(&self, owner: UserId) -> Result<Account, LedgerError> {
        self.store
            .account_by_owner(owner)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(format!("owner {owner}")))
    }

    /// One transfer.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Internal`] if a recorded transfer is missing.
    pub async fn get_transfer(&self, id: TransferId) -> Result<Transfer, LedgerError> {
        self.store
            .transfer(id)
            .await?
            .ok_or_else(|| LedgerError::Internal(format!("transfer {id} not found")))
    }

    /// Outgoing transfer count and volume of an account in `[from, to]`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] when `from` is after `to`
    /// - [`LedgerError::AccountNotFound`]
    pub async fn turnover(
        &self,
        account: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Turnover, LedgerError> {
        if from > to {
            return Err(LedgerError::Validation(format!("window start {from} is after its end {to}")));
        }
        self.store
            .turnover(account, from, to)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account.to_string()))
    }

    /// Largest outgoing transfers of an account since `since`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] unless `1 <= limit <= 100`
    /// - [`LedgerError::AccountNotFound`]
    pub async fn top_transfers(
        &self,
        account: AccountId,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Transfer>, LedgerError> {
        if limit == 0 || limit > MAX_TOP_TRANSFERS {
            return Err(LedgerError::Validation(format!(
                "limit must be between 1 and {MAX_TOP_TRANSFERS}, got {limit}"
            )));
        }
        self.account(account).await?;
        self.store.top_transfers(account, since, limit).await
    }
}

/// Order the two account writes of a transfer by account id, so opposite
/// transfers lock rows in the same order and cannot deadlock.
fn in_lock_order<W>(from: AccountId, to: AccountId, debit: W, credit: W) -> [W; 2] {
    if from < to { [debit, credit] } else { [credit, debit] }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::{ACCOUNT_CREATED, ACCOUNT_TOPPED_UP, ACCOUNT_WITHDRAWN, TRANSFER_COMPLETED};
    use crate::memory::InMemoryLedgerStore;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tally_cards::memory::InMemoryCardStore;
    use tally_cards::{CardService, CardType, CreateCardRequest};
    use tally_core::ids::CardId;
    use tally_core::version::Version;
    use tally_testing::test_clock;

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        cards: Arc<CardService<InMemoryCardStore>>,
        ledger: Arc<LedgerService<InMemoryLedgerStore>>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryLedgerStore::new());
            let cards = Arc::new(CardService::new(Arc::new(InMemoryCardStore::new()), Arc::new(test_clock())));
            let ledger = LedgerService::new(store.clone(), cards.clone(), Arc::new(test_clock()))
                .with_link_policy(RetryPolicy::fixed(2, Duration::ZERO));
            Self {
                store,
                cards,
                ledger: Arc::new(ledger),
            }
        }

        /// A user with a default card, a linked account and `balance` on it.
        async fn customer(&self, balance: i64) -> (CardId, AccountId) {
            let owner = UserId::new();
            let cid = CorrelationId::generate();
            self.cards.provision_default_cards(owner, &cid).await.unwrap();
            self.ledger.provision_default_account(owner, &cid).await.unwrap();
            let account = self.ledger.account_for_owner(owner).await.unwrap();
            if balance > 0 {
                self.ledger
                    .top_up(account.id, Some(Decimal::from(balance)), None, &cid)
                    .await
                    .unwrap();
            }
            let card = self.cards.cards_for_owner(owner).await.unwrap().remove(0);
            (card.id, account.id)
        }

        async fn balance(&self, account: AccountId) -> String {
            self.ledger.balance(account).await.unwrap().to_string()
        }

        async fn event_types(&self) -> Vec<String> {
            self.store
                .outbox_records()
                .await
                .into_iter()
                .map(|r| r.event_type)
                .collect()
        }
    }

    fn transfer_request(from: CardId, to: CardId, amount: i64) -> TransferRequest {
        TransferRequest {
            from_card_id: from,
            to_card_id: to,
            amount: Some(Decimal::from(amount)),
        }
    }

    #[tokio::test]
    async fn keyed_transfer_replays_without_moving_money_twice() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(1000).await;
        let (card_b, account_b) = f.customer(500).await;
        let key = IdempotencyKey::new("k1").unwrap();
        let cid = CorrelationId::generate();

        let first = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 100), Some(&key), &cid)
            .await
            .unwrap();
        let replay = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 100), Some(&key), &cid)
            .await
            .unwrap();

        assert_eq!(first.id, replay.id);
        assert_eq!(f.balance(account_a).await, "900.00");
        assert_eq!(f.balance(account_b).await, "600.00");
        let completed = f
            .event_types()
            .await
            .into_iter()
            .filter(|t| t == TRANSFER_COMPLETED)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn keyed_commands_that_lost_the_lookup_race_replay() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(1000).await;
        let (card_b, account_b) = f.customer(500).await;
        let cid = CorrelationId::generate();
        let transfer_key = IdempotencyKey::new("k1").unwrap();
        let withdraw_key = IdempotencyKey::new("wd-1").unwrap();
        let first = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 100), Some(&transfer_key), &cid)
            .await
            .unwrap();
        f.ledger
            .withdraw(account_b, Some(Decimal::from(50)), Some(&withdraw_key), &cid)
            .await
            .unwrap();

        f.store.stale_idempotency_lookups(1).await;
        let replay = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 100), Some(&transfer_key), &cid)
            .await
            .unwrap();
        f.store.stale_idempotency_lookups(1).await;
        let balance = f
            .ledger
            .withdraw(account_b, Some(Decimal::from(50)), Some(&withdraw_key), &cid)
            .await
            .unwrap();

        assert_eq!(first.id, replay.id);
        assert_eq!(balance.to_string(), "550.00");
        assert_eq!(f.balance(account_a).await, "900.00");
        assert_eq!(f.balance(account_b).await, "550.00");
        assert_eq!(f.store.read(|t| t.transfers.len()).await, 1);
        let types = f.event_types().await;
        assert_eq!(types.iter().filter(|t| *t == TRANSFER_COMPLETED).count(), 1);
        assert_eq!(types.iter().filter(|t| *t == ACCOUNT_WITHDRAWN).count(), 1);
    }

    #[test]
    fn account_writes_follow_id_order() {
        let (low, high) = {
            let (a, b) = (AccountId::new(), AccountId::new());
            if a < b { (a, b) } else { (b, a) }
        };
        assert_eq!(in_lock_order(low, high, "debit", "credit"), ["debit", "credit"]);
        assert_eq!(in_lock_order(high, low, "debit", "credit"), ["credit", "debit"]);
    }

    #[tokio::test]
    async fn reused_key_with_other_amount_conflicts() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(1000).await;
        let (card_b, account_b) = f.customer(500).await;
        let key = IdempotencyKey::new("k1").unwrap();
        let cid = CorrelationId::generate();
        f.ledger
            .transfer(transfer_request(card_a, card_b, 100), Some(&key), &cid)
            .await
            .unwrap();

        let err = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 200), Some(&key), &cid)
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));
        assert!(!err.is_retryable());
        assert_eq!(f.balance(account_a).await, "900.00");
        assert_eq!(f.balance(account_b).await, "600.00");
    }

    #[tokio::test]
    async fn unkeyed_transfers_run_independently() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(1000).await;
        let (card_b, account_b) = f.customer(500).await;
        let cid = CorrelationId::generate();

        let first = f.ledger.transfer(transfer_request(card_a, card_b, 100), None, &cid).await.unwrap();
        let second = f.ledger.transfer(transfer_request(card_a, card_b, 100), None, &cid).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(f.balance(account_a).await, "800.00");
        assert_eq!(f.balance(account_b).await, "700.00");
    }

    #[tokio::test]
    async fn transfer_writes_its_event_with_the_commit() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(1000).await;
        let (card_b, _account_b) = f.customer(0).await;

        let transfer = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 250), None, &CorrelationId::new("req-42"))
            .await
            .unwrap();

        let outbox = f.store.outbox_records().await;
        let record = outbox.iter().find(|r| r.event_type == TRANSFER_COMPLETED).unwrap();
        assert_eq!(record.aggregate_id, account_a.to_string());
        assert_eq!(record.payload["transferId"], transfer.id.to_string());
        assert_eq!(record.payload["amount"], "250.00");
        assert_eq!(record.correlation_id.as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn transfer_rejects_bad_requests_before_mutating() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(100).await;
        let (card_b, _account_b) = f.customer(0).await;
        let cid = CorrelationId::generate();

        let overdraft = f.ledger.transfer(transfer_request(card_a, card_b, 101), None, &cid).await;
        let same = f.ledger.transfer(transfer_request(card_a, card_a, 1), None, &cid).await;
        let zero = f.ledger.transfer(transfer_request(card_a, card_b, 0), None, &cid).await;
        let missing_card = CardId::new();
        let unknown = f.ledger.transfer(transfer_request(missing_card, card_b, 1), None, &cid).await;

        assert!(matches!(overdraft, Err(LedgerError::InsufficientFunds { .. })));
        assert!(matches!(same, Err(LedgerError::SameAccountTransfer(_))));
        assert!(matches!(zero, Err(LedgerError::InvalidAmount(_))));
        assert_eq!(unknown.unwrap_err(), LedgerError::CardNotFound(missing_card));
        assert_eq!(f.balance(account_a).await, "100.00");
        assert!(!f.event_types().await.contains(&TRANSFER_COMPLETED.to_string()));
    }

    #[tokio::test]
    async fn transfer_between_currencies_is_refused() {
        let f = Fixture::new();
        let (card_a, _account_a) = f.customer(100).await;
        let owner = UserId::new();
        let cid = CorrelationId::generate();
        let eur = f
            .cards
            .create_card(
                CreateCardRequest {
                    owner_id: owner,
                    currency: Currency::Eur,
                    card_type: CardType::Debit,
                },
                None,
                &cid,
            )
            .await
            .unwrap();
        let account = Account::open(owner, Currency::Eur, test_clock().now());
        f.store
            .commit(Commit::new().write(LedgerWrite::InsertAccount(account.clone())))
            .await
            .unwrap();
        f.cards.link_account(eur.id, account.id).await.unwrap();

        let err = f
            .ledger
            .transfer(transfer_request(card_a, eur.id, 10), None, &cid)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::CurrencyMismatch {
                from: Currency::Usd,
                to: Currency::Eur
            }
        );
    }

    #[tokio::test]
    async fn blocked_card_cannot_send() {
        let f = Fixture::new();
        let (card_a, _account_a) = f.customer(100).await;
        let (card_b, _account_b) = f.customer(0).await;
        f.cards.block(card_a).await.unwrap();

        let err = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 1), None, &CorrelationId::generate())
            .await
            .unwrap_err();

        assert_eq!(err, LedgerError::CardBlocked(card_a));
    }

    #[tokio::test]
    async fn top_up_and_withdraw_replay_the_current_balance() {
        let f = Fixture::new();
        let (_card, account) = f.customer(0).await;
        let cid = CorrelationId::generate();
        let top_up_key = IdempotencyKey::new("top-1").unwrap();
        let withdraw_key = IdempotencyKey::new("wd-1").unwrap();

        let after_top_up = f
            .ledger
            .top_up(account, Some(Decimal::new(10_005, 2)), Some(&top_up_key), &cid)
            .await
            .unwrap();
        let after_withdraw = f
            .ledger
            .withdraw(account, Some(Decimal::from(40)), Some(&withdraw_key), &cid)
            .await
            .unwrap();
        let replayed = f
            .ledger
            .top_up(account, Some(Decimal::new(10_005, 2)), Some(&top_up_key), &cid)
            .await
            .unwrap();

        assert_eq!(after_top_up.to_string(), "100.05");
        assert_eq!(after_withdraw.to_string(), "60.05");
        assert_eq!(replayed.to_string(), "60.05");
        assert_eq!(f.ledger.account(account).await.unwrap().version, Version::new(2));

        let err = f
            .ledger
            .withdraw(account, Some(Decimal::from(1)), Some(&top_up_key), &cid)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));

        let types = f.event_types().await;
        assert_eq!(types.iter().filter(|t| *t == ACCOUNT_TOPPED_UP).count(), 1);
        assert_eq!(types.iter().filter(|t| *t == ACCOUNT_WITHDRAWN).count(), 1);
    }

    #[tokio::test]
    async fn invalid_amounts_are_rejected_before_the_guard() {
        let f = Fixture::new();
        let (_card, account) = f.customer(10).await;
        let key = IdempotencyKey::new("k-invalid").unwrap();
        let cid = CorrelationId::generate();

        for amount in [None, Some(Decimal::ZERO), Some(Decimal::new(-1, 0)), Some(Decimal::new(4, 3))] {
            let err = f.ledger.top_up(account, amount, Some(&key), &cid).await.unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)));
        }
        let err = f
            .ledger
            .withdraw(account, Some(Decimal::from(11)), Some(&key), &cid)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(f.store.idempotency_count().await, 0);
        assert_eq!(f.balance(account).await, "10.00");
    }

    #[tokio::test]
    async fn version_conflicts_are_retried_then_surfaced_as_transient() {
        let f = Fixture::new();
        let (_card, account) = f.customer(0).await;
        let cid = CorrelationId::generate();

        f.store.inject_commit_failures([LedgerError::conflict("account", account)]).await;
        let balance = f.ledger.top_up(account, Some(Decimal::from(5)), None, &cid).await.unwrap();
        assert_eq!(balance.to_string(), "5.00");

        f.store
            .inject_commit_failures((0..3).map(|_| LedgerError::conflict("account", account)))
            .await;
        let err = f
            .ledger
            .top_up(account, Some(Decimal::from(5)), None, &cid)
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(err.is_retryable());
        assert_eq!(f.balance(account).await, "5.00");
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_partial_state() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(100).await;
        let (card_b, account_b) = f.customer(0).await;
        let key = IdempotencyKey::new("k-fail").unwrap();
        let before = f.store.outbox_records().await.len();
        f.store
            .inject_commit_failures([LedgerError::Storage("connection reset".into())])
            .await;

        let err = f
            .ledger
            .transfer(transfer_request(card_a, card_b, 50), Some(&key), &CorrelationId::generate())
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(f.balance(account_a).await, "100.00");
        assert_eq!(f.balance(account_b).await, "0.00");
        assert_eq!(f.store.outbox_records().await.len(), before);
        assert_eq!(f.store.idempotency_count().await, 0);
        assert!(f.store.read(|t| t.transfers.is_empty()).await);
    }

    #[tokio::test]
    async fn provisioning_writes_one_account_and_event() {
        let f = Fixture::new();
        let owner = UserId::new();
        let cid = CorrelationId::new("kafka-1");
        f.cards.provision_default_cards(owner, &cid).await.unwrap();

        f.ledger.provision_default_account(owner, &cid).await.unwrap();
        f.ledger.provision_default_account(owner, &cid).await.unwrap();

        let outbox = f.store.outbox_records().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, ACCOUNT_CREATED);
        assert_eq!(outbox[0].aggregate_id, owner.to_string());
        assert!(!outbox[0].published);
        assert_eq!(outbox[0].correlation_id.as_deref(), Some("kafka-1"));

        let account = f.ledger.account_for_owner(owner).await.unwrap();
        let card = f.cards.cards_for_owner(owner).await.unwrap().remove(0);
        assert_eq!(card.account_id, Some(account.id));
    }

    #[tokio::test]
    async fn concurrent_provisioning_converges() {
        let f = Fixture::new();
        let owner = UserId::new();
        f.cards
            .provision_default_cards(owner, &CorrelationId::generate())
            .await
            .unwrap();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let ledger = f.ledger.clone();
                tokio::spawn(async move { ledger.provision_default_account(owner, &CorrelationId::generate()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(f.store.read(|t| t.accounts.len()).await, 1);
        assert_eq!(f.event_types().await, vec![ACCOUNT_CREATED.to_string()]);
    }

    #[tokio::test]
    async fn later_cards_are_linked_on_redelivery() {
        let f = Fixture::new();
        let owner = UserId::new();
        let cid = CorrelationId::generate();
        f.cards.provision_default_cards(owner, &cid).await.unwrap();
        f.ledger.provision_default_account(owner, &cid).await.unwrap();
        let late = f
            .cards
            .create_card(
                CreateCardRequest {
                    owner_id: owner,
                    currency: Currency::Usd,
                    card_type: CardType::Credit,
                },
                None,
                &cid,
            )
            .await
            .unwrap();

        f.ledger.provision_default_account(owner, &cid).await.unwrap();

        let account = f.ledger.account_for_owner(owner).await.unwrap();
        assert_eq!(f.cards.card(late.id).await.unwrap().account_id, Some(account.id));
    }

    #[tokio::test]
    async fn analytics_cover_outgoing_transfers() {
        let f = Fixture::new();
        let (card_a, account_a) = f.customer(1000).await;
        let (card_b, account_b) = f.customer(0).await;
        let cid = CorrelationId::generate();
        for amount in [50, 300, 120] {
            f.ledger
                .transfer(transfer_request(card_a, card_b, amount), None, &cid)
                .await
                .unwrap();
        }
        let now = test_clock().now();
        let window = (now - ChronoDuration::hours(1), now + ChronoDuration::hours(1));

        let turnover = f.ledger.turnover(account_a, window.0, window.1).await.unwrap();
        assert_eq!(turnover.operations_count, 3);
        assert_eq!(turnover.turnover.to_string(), "470.00");
        assert_eq!(turnover.currency, Currency::Usd);

        let incoming = f.ledger.turnover(account_b, window.0, window.1).await.unwrap();
        assert_eq!(incoming.operations_count, 0);
        assert_eq!(incoming.turnover, Money::zero());

        let top: Vec<String> = f
            .ledger
            .top_transfers(account_a, window.0, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.amount.to_string())
            .collect();
        assert_eq!(top, vec!["300.00".to_string(), "120.00".to_string()]);

        assert!(matches!(
            f.ledger.turnover(account_a, window.1, window.0).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            f.ledger.top_transfers(account_a, window.0, 0).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            f.ledger.turnover(AccountId::new(), window.0, window.1).await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }
}
