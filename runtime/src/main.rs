//! `allocation-sync`: keeps per-product allocation records in step with the
//! inventory update topic.
//!
//! Configured entirely through environment variables, see
//! [`SyncConfig`](allocation_sync_runtime::SyncConfig).

use allocation_sync_core::ReconciliationEngine;
use allocation_sync_postgres::{PostgresDeadLetterQueue, PostgresInventoryStore};
use allocation_sync_redpanda::RedpandaEventBus;
use allocation_sync_runtime::{InventoryUpdateConsumer, MetricsServer, SyncConfig};
use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        environment = %config.environment,
        topic = %config.kafka.topic,
        consumer_group = %config.kafka.consumer_group,
        workers = config.consumer.workers,
        "Starting allocation sync"
    );

    let _metrics = match config.observability.metrics_addr {
        Some(addr) => {
            let mut server = MetricsServer::new(addr);
            server.start()?;
            Some(server)
        }
        None => None,
    };

    let database_url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL is not configured")?;
    let store = PostgresInventoryStore::connect(
        database_url,
        config.database.table.clone(),
        config.database.max_connections,
    )
    .await?;
    store.migrate().await?;

    let dead_letters = Arc::new(PostgresDeadLetterQueue::new(store.pool().clone()));
    let engine = Arc::new(ReconciliationEngine::new(store));

    let event_bus = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.kafka.brokers)
            .consumer_group(&config.kafka.consumer_group)
            .auto_offset_reset(&config.kafka.auto_offset_reset)
            .redelivery_backoff(config.kafka.redelivery_backoff())
            .build()?,
    );

    let (consumer, shutdown) = InventoryUpdateConsumer::new(engine, event_bus, &config.kafka.topic);
    let consumer = consumer
        .with_dead_letter_sink(dead_letters)
        .with_malformed_policy(config.consumer.malformed_policy);

    let mut workers = JoinSet::new();
    for worker in 0..config.consumer.workers {
        let mut consumer = consumer.clone();
        workers.spawn(async move {
            tracing::info!(worker, "Worker started");
            consumer.start().await
        });
    }
    drop(consumer);

    let mut failure = None;
    tokio::select! {
        () = shutdown_signal() => {}
        Some(joined) = workers.join_next() => {
            failure = worker_failure(joined);
        }
    }

    // Stop the remaining workers once their in-flight message is done
    shutdown.send_replace(true);
    while let Some(joined) = workers.join_next().await {
        if let Some(e) = worker_failure(joined) {
            failure.get_or_insert(e);
        }
    }

    match failure {
        Some(e) => Err(e),
        None => {
            tracing::info!("Clean shutdown complete");
            Ok(())
        }
    }
}

fn worker_failure(
    joined: Result<Result<(), allocation_sync_runtime::ConsumerError>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Worker stopped");
            Some(e.into())
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker panicked");
            Some(e.into())
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
