//! In-memory event bus.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tally_core::event::{BusMessage, Delivery};
use tally_core::event_bus::{EventBus, EventBusError, EventStream};
use tokio::sync::{Notify, mpsc};

type Subscriber = mpsc::UnboundedSender<Result<Delivery, EventBusError>>;

#[derive(Default)]
struct BusState {
    log: Vec<BusMessage>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    fail_next: usize,
}

/// Event bus that keeps every published message and fans out to live
/// subscribers.
///
/// Offsets are assigned per topic in publish order on a single partition.
#[derive(Default)]
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
    subscribed: Notify,
}

impl InMemoryEventBus {
    /// An empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages published to `topic`, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.lock()
            .log
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Every published message across topics, in order.
    #[must_use]
    pub fn all_published(&self) -> Vec<BusMessage> {
        self.lock().log.clone()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .subscribers
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Wait until `topic` has at least `count` live subscriptions.
    pub async fn wait_for_subscribers(&self, topic: &str, count: usize) {
        loop {
            let notified = self.subscribed.notified();
            if self.subscriber_count(topic) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Deliver `message` to subscribers without going through `publish`,
    /// as a broker would redeliver it.
    pub fn redeliver(&self, message: &BusMessage) {
        Self::fan_out(&mut self.lock(), message);
    }

    fn fan_out(state: &mut BusState, message: &BusMessage) {
        if let Some(subs) = state.subscribers.get_mut(&message.topic) {
            subs.retain(|tx| tx.send(Ok(Delivery::new(message.clone()))).is_ok());
        }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let message = message.clone();
        Box::pin(async move {
            let mut state = self.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(EventBusError::PublishFailed {
                    topic: message.topic,
                    reason: "injected failure".to_string(),
                });
            }

            let offset = state
                .log
                .iter()
                .filter(|m| m.topic == message.topic)
                .count();
            let mut stored = message;
            stored.partition = Some(0);
            stored.offset = i64::try_from(offset).ok();

            Self::fan_out(&mut state, &stored);
            state.log.push(stored);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.lock();
                for topic in topics {
                    state.subscribers.entry(topic).or_default().push(tx.clone());
                }
            }
            self.subscribed.notify_waiters();

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
