//! Cards service process.
//!
//! Publishes the cards outbox and provisions default cards from
//! `USER_CREATED` until Ctrl+C or SIGTERM.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_cards::{
    CardService, PgCardStore, SCHEMA, SERVICE_NAME, TOPIC, USER_EVENTS_TOPIC, UserCreatedHandler,
};
use tally_core::environment::SystemClock;
use tally_core::event_bus::EventBus;
use tally_postgres::{PostgresOutboxStore, connect, ensure_schema};
use tally_redpanda::RedpandaEventBus;
use tally_runtime::config::ServiceConfig;
use tally_runtime::metrics::MetricsServer;
use tally_runtime::shutdown::wait_for_signal;
use tally_runtime::telemetry::init_tracing;
use tally_runtime::{EventConsumer, OutboxPublisher, Shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env(SERVICE_NAME).context("loading configuration")?;
    init_tracing(&config.observability);
    tracing::info!(environment = ?config.environment, "Starting cards service");

    if let Some(port) = config.observability.metrics_port {
        MetricsServer::new(SocketAddr::from(([0, 0, 0, 0], port))).start()?;
    }

    let pool = connect(&config.database).await?;
    ensure_schema(&pool, SCHEMA).await?;
    let bus: Arc<dyn EventBus> = Arc::new(RedpandaEventBus::from_config(&config.broker)?);

    let store = Arc::new(PgCardStore::new(pool.clone()));
    let service = Arc::new(CardService::new(store, Arc::new(SystemClock)));

    let publisher = OutboxPublisher::new(
        Arc::new(PostgresOutboxStore::new(pool)),
        bus.clone(),
        TOPIC,
        config.outbox.clone(),
    );
    let consumer = EventConsumer::new(bus, USER_EVENTS_TOPIC)
        .with_handler(UserCreatedHandler::new(service))
        .with_retry_policy(config.consumer.retry_policy());

    let shutdown = Shutdown::new();
    let publisher_signal = shutdown.subscribe();
    let publisher_task = tokio::spawn(async move { publisher.run(publisher_signal).await });
    let consumer_signal = shutdown.subscribe();
    let consumer_task = tokio::spawn(async move { consumer.run(consumer_signal).await });

    wait_for_signal().await;
    shutdown.trigger();

    publisher_task.await?;
    consumer_task.await??;
    tracing::info!("Cards service stopped");
    Ok(())
}
