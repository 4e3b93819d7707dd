//! Outbox publisher.
//!
//! Drains unpublished outbox records to the bus on a fixed delay. Each cycle:
//!
//! 1. fetch up to `batch_size` unpublished, unparked records, oldest first
//! 2. publish each as an [`EventEnvelope`](tally_core::event::EventEnvelope)
//!    keyed by aggregate id, with the correlation id as a header and a
//!    publish deadline
//! 3. on success flip `published` through a conditional update; losing that
//!    race to another instance is harmless
//! 4. on failure count the attempt, keep the row, and park it once it has
//!    failed `max_failures` times
//!
//! Once a record of some aggregate fails, later records of the same aggregate
//! are skipped for the rest of the cycle so they cannot overtake it.
//!
//! Delivery is at-least-once: a crash between publish and mark republishes
//! the record on the next cycle.

use crate::config::OutboxConfig;
use crate::metrics::OutboxMetrics;
use crate::shutdown::ShutdownSignal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tally_core::environment::{Clock, SystemClock};
use tally_core::error::LedgerError;
use tally_core::event::BusMessage;
use tally_core::event_bus::EventBus;
use tally_core::outbox::{OutboxRecord, OutboxStore};
use tracing::Instrument;

/// Counts from one publishing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records published and marked
    pub published: usize,
    /// Records whose publish failed
    pub failed: usize,
    /// Records parked this cycle
    pub parked: usize,
    /// Records held back behind a failed record of the same aggregate
    pub skipped: usize,
    /// Records another publisher marked first
    pub races_lost: usize,
}

/// Background task moving outbox records onto the bus.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    topic: String,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
}

impl OutboxPublisher {
    /// Publisher for one service topic.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            bus,
            topic: topic.into(),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for parking timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Topic records are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run one publishing cycle.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the outbox cannot be read or updated.
    /// Bus failures are recorded on the rows, not returned.
    pub async fn run_once(&self) -> Result<PublishReport, LedgerError> {
        let records = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut report = PublishReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for record in records {
            if blocked.contains(&record.aggregate_id) {
                report.skipped += 1;
                continue;
            }

            let started = Instant::now();
            match self.publish(&record).await {
                Ok(()) => {
                    OutboxMetrics::record_published(&self.topic, started.elapsed());
                    if self.store.mark_published(record.id).await? {
                        report.published += 1;
                        tracing::debug!(
                            outbox_id = %record.id,
                            event_type = %record.event_type,
                            aggregate_id = %record.aggregate_id,
                            "Published outbox record"
                        );
                    } else {
                        report.races_lost += 1;
                        OutboxMetrics::record_race_lost();
                        tracing::info!(outbox_id = %record.id, "Outbox record already marked by another publisher");
                    }
                }
                Err(reason) => {
                    report.failed += 1;
                    blocked.insert(record.aggregate_id.clone());
                    OutboxMetrics::record_failure(&self.topic);

                    let failures = self.store.record_failure(record.id, reason.clone()).await?;
                    tracing::warn!(
                        outbox_id = %record.id,
                        event_type = %record.event_type,
                        failures,
                        error = %reason,
                        "Outbox publish failed"
                    );

                    if failures >= self.config.max_failures {
                        self.store.park(record.id, self.clock.now()).await?;
                        report.parked += 1;
                        OutboxMetrics::record_parked(&self.topic);
                        tracing::error!(
                            outbox_id = %record.id,
                            event_type = %record.event_type,
                            aggregate_id = %record.aggregate_id,
                            failures,
                            "Outbox record parked after repeated publish failures"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    async fn publish(&self, record: &OutboxRecord) -> Result<(), String> {
        let bytes = record.to_envelope().to_bytes().map_err(|e| e.to_string())?;
        let message = BusMessage::new(&self.topic, bytes)
            .with_key(record.aggregate_id.clone())
            .with_correlation_id(record.correlation_id.clone());

        let deadline = self.config.publish_timeout();
        match tokio::time::timeout(deadline, self.bus.publish(&message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("publish timed out after {}ms", deadline.as_millis())),
        }
    }

    /// Poll until shutdown, waiting `poll_interval` after each cycle.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let span = tracing::info_span!("outbox_publisher", topic = %self.topic);
        async {
            tracing::info!(
                interval_ms = self.config.poll_interval_ms,
                batch_size = self.config.batch_size,
                "Outbox publisher started"
            );
            loop {
                match self.run_once().await {
                    Ok(report) if report != PublishReport::default() => {
                        tracing::debug!(?report, "Outbox cycle finished");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Outbox cycle failed"),
                }

                tokio::select! {
                    () = shutdown.triggered() => break,
                    () = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
            tracing::info!("Outbox publisher stopped");
        }
        .instrument(span)
        .await;
    }
}
