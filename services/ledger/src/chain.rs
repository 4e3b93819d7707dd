//! Registration through account opening, with every service on in-memory
//! stores and one shared bus.

#![allow(clippy::unwrap_used)]

use crate::memory::InMemoryLedgerStore;
use crate::{CardCreatedHandler, LedgerService, TransferRequest};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tally_cards::memory::InMemoryCardStore;
use tally_cards::{CardService, UserCreatedHandler};
use tally_core::correlation::CorrelationId;
use tally_core::event::BusMessage;
use tally_core::ids::UserId;
use tally_registration::memory::InMemoryRegistrationStore;
use tally_registration::{RegisterRequest, RegistrationService};
use tally_runtime::config::OutboxConfig;
use tally_runtime::retry::RetryPolicy;
use tally_runtime::{ConsumeOutcome, EventConsumer, OutboxPublisher};
use tally_testing::{InMemoryEventBus, test_clock};
use tally_users::memory::InMemoryUserStore;
use tally_users::{UserRegisteredHandler, UserService};

struct Stage {
    publisher: OutboxPublisher,
    consumer: EventConsumer,
}

struct System {
    bus: Arc<InMemoryEventBus>,
    registration: RegistrationService<InMemoryRegistrationStore>,
    registration_publisher: OutboxPublisher,
    users: Stage,
    cards: Stage,
    ledger: Stage,
    card_service: Arc<CardService<InMemoryCardStore>>,
    ledger_store: Arc<InMemoryLedgerStore>,
    ledger_service: Arc<LedgerService<InMemoryLedgerStore>>,
}

impl System {
    fn new() -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        let clock = Arc::new(test_clock());
        let retry = RetryPolicy::fixed(2, Duration::ZERO);

        let registration_store = Arc::new(InMemoryRegistrationStore::new());
        let registration = RegistrationService::new(registration_store.clone(), clock.clone());
        let registration_publisher = OutboxPublisher::new(
            registration_store,
            bus.clone(),
            tally_registration::TOPIC,
            OutboxConfig::default(),
        );

        let user_store = Arc::new(InMemoryUserStore::new());
        let user_service = Arc::new(UserService::new(user_store.clone(), clock.clone()));
        let users = Stage {
            publisher: OutboxPublisher::new(user_store, bus.clone(), tally_users::TOPIC, OutboxConfig::default()),
            consumer: EventConsumer::new(bus.clone(), tally_users::REGISTERED_TOPIC)
                .with_handler(UserRegisteredHandler::new(user_service))
                .with_retry_policy(retry.clone()),
        };

        let card_store = Arc::new(InMemoryCardStore::new());
        let card_service = Arc::new(CardService::new(card_store.clone(), clock.clone()));
        let cards = Stage {
            publisher: OutboxPublisher::new(card_store, bus.clone(), tally_cards::TOPIC, OutboxConfig::default()),
            consumer: EventConsumer::new(bus.clone(), tally_cards::USER_EVENTS_TOPIC)
                .with_handler(UserCreatedHandler::new(card_service.clone()))
                .with_retry_policy(retry.clone()),
        };

        let ledger_store = Arc::new(InMemoryLedgerStore::new());
        let ledger_service = Arc::new(
            LedgerService::new(ledger_store.clone(), card_service.clone(), clock)
                .with_link_policy(retry.clone()),
        );
        let ledger = Stage {
            publisher: OutboxPublisher::new(ledger_store.clone(), bus.clone(), crate::TOPIC, OutboxConfig::default()),
            consumer: EventConsumer::new(bus.clone(), crate::CARD_EVENTS_TOPIC)
                .with_handler(CardCreatedHandler::new(ledger_service.clone()))
                .with_retry_policy(retry),
        };

        Self {
            bus,
            registration,
            registration_publisher,
            users,
            cards,
            ledger,
            card_service,
            ledger_store,
            ledger_service,
        }
    }

    /// Feed every message published so far on `stage`'s topic to its consumer.
    async fn deliver(&self, stage: &Stage) -> Vec<ConsumeOutcome> {
        let mut outcomes = Vec::new();
        for message in self.bus.published(stage.consumer.topic()) {
            outcomes.push(stage.consumer.process(&message).await.unwrap());
        }
        outcomes
    }

    /// Drain every outbox once and deliver downstream, in pipeline order.
    async fn settle(&self) {
        self.registration_publisher.run_once().await.unwrap();
        self.deliver(&self.users).await;
        self.users.publisher.run_once().await.unwrap();
        self.deliver(&self.cards).await;
        self.cards.publisher.run_once().await.unwrap();
        self.deliver(&self.ledger).await;
        self.ledger.publisher.run_once().await.unwrap();
    }

    async fn register(&self, name: &str) -> UserId {
        self.registration
            .register(
                RegisterRequest::new(name, format!("{name}@example.com")),
                None,
                &CorrelationId::generate(),
            )
            .await
            .unwrap()
            .user_id
    }

    fn event_types(&self, topic: &str) -> Vec<String> {
        self.bus
            .published(topic)
            .iter()
            .map(|m: &BusMessage| {
                let body: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
                body["type"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }
}

#[tokio::test]
async fn registration_ends_with_a_linked_account() {
    let system = System::new();
    let user = system.register("ada").await;

    system.settle().await;

    let account = system.ledger_service.account_for_owner(user).await.unwrap();
    let cards = system.card_service.cards_for_owner(user).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].account_id, Some(account.id));
    assert_eq!(system.event_types(tally_users::TOPIC), vec!["USER_CREATED".to_string()]);
    assert_eq!(system.event_types(tally_cards::TOPIC), vec!["CARD_CREATED".to_string()]);
    assert_eq!(system.event_types(crate::TOPIC), vec!["ACCOUNT_CREATED".to_string()]);
}

#[tokio::test]
async fn redelivering_every_topic_changes_nothing() {
    let system = System::new();
    let user = system.register("grace").await;
    system.settle().await;

    for stage in [&system.users, &system.cards, &system.ledger] {
        for outcome in system.deliver(stage).await {
            assert!(matches!(outcome, ConsumeOutcome::Applied { .. }), "{outcome:?}");
        }
    }
    system.settle().await;

    assert_eq!(system.card_service.cards_for_owner(user).await.unwrap().len(), 1);
    assert_eq!(system.ledger_store.read(|t| t.accounts.len()).await, 1);
    assert_eq!(system.event_types(crate::TOPIC).len(), 1);
    assert!(system.bus.published("card-events.DLT").is_empty());
}

#[tokio::test]
async fn provisioned_users_can_transfer() {
    let system = System::new();
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    system.settle().await;

    let cid = CorrelationId::generate();
    let alice_account = system.ledger_service.account_for_owner(alice).await.unwrap();
    system
        .ledger_service
        .top_up(alice_account.id, Some(Decimal::from(100)), None, &cid)
        .await
        .unwrap();
    let alice_card = system.card_service.cards_for_owner(alice).await.unwrap().remove(0);
    let bob_card = system.card_service.cards_for_owner(bob).await.unwrap().remove(0);

    system
        .ledger_service
        .transfer(
            TransferRequest {
                from_card_id: alice_card.id,
                to_card_id: bob_card.id,
                amount: Some(Decimal::new(2_550, 2)),
            },
            None,
            &cid,
        )
        .await
        .unwrap();
    system.settle().await;

    let bob_account = system.ledger_service.account_for_owner(bob).await.unwrap();
    assert_eq!(system.ledger_service.balance(alice_account.id).await.unwrap().to_string(), "74.50");
    assert_eq!(bob_account.balance.to_string(), "25.50");
    let ledger_events = system.event_types(crate::TOPIC);
    assert_eq!(ledger_events.iter().filter(|t| *t == "TRANSFER_COMPLETED").count(), 1);
}
