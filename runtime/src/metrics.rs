//! Prometheus metrics.
//!
//! Counters and histograms for the outbox publisher, event consumers,
//! idempotency lookups and retries.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called inside a Tokio runtime. A recorder that is already
    /// installed (as happens in tests) is tolerated.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                self.handle = Some(handle);
                tokio::spawn(async move {
                    if let Err(e) = exporter.await {
                        tracing::error!(error = ?e, "Metrics exporter stopped");
                    }
                });
                tracing::info!(addr = %self.addr, "Metrics server started");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox
    describe_counter!("outbox_records_published_total", "Outbox records published to the bus");
    describe_counter!("outbox_publish_failures_total", "Failed outbox publish attempts");
    describe_counter!("outbox_records_parked_total", "Outbox records parked after exhausting retries");
    describe_counter!("outbox_publish_races_lost_total", "Records already marked by another publisher");
    describe_histogram!("outbox_publish_duration_seconds", "Time taken to publish one outbox record");

    // Consumers
    describe_counter!("consumer_messages_total", "Inbound messages by outcome");
    describe_counter!("consumer_dead_letters_total", "Messages routed to a dead-letter topic");
    describe_histogram!("consumer_handle_duration_seconds", "Time taken to handle one message");

    // Idempotency
    describe_counter!("idempotency_lookups_total", "Idempotency lookups by outcome");

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_exhausted_total", "Operations that exhausted their retries");
}

/// Outbox publisher metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a confirmed publish.
    pub fn record_published(topic: &str, duration: Duration) {
        counter!("outbox_records_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("outbox_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish attempt.
    pub fn record_failure(topic: &str) {
        counter!("outbox_publish_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a parked record.
    pub fn record_parked(topic: &str) {
        counter!("outbox_records_parked_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a lost conditional update.
    pub fn record_race_lost() {
        counter!("outbox_publish_races_lost_total").increment(1);
    }
}

/// Event consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a handled message and how it ended.
    pub fn record_outcome(topic: &str, outcome: &'static str, duration: Duration) {
        counter!("consumer_messages_total", "topic" => topic.to_string(), "outcome" => outcome)
            .increment(1);
        histogram!("consumer_handle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a dead-letter publish.
    pub fn record_dead_letter(topic: &str) {
        counter!("consumer_dead_letters_total", "topic" => topic.to_string()).increment(1);
    }
}
