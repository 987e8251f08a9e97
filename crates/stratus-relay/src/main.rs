// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Relay - Outbox Event Relay
//!
//! A background service responsible for:
//! - Publishing committed outbox events to the message bus
//! - Retrying failed publishes with backoff and dead-lettering poison events
//! - Releasing claims abandoned by crashed dispatchers
//! - Deleting published events past the retention window

use std::sync::Arc;
use tracing::{info, warn};

use stratus_outbox::PostgresOutboxStore;
use stratus_relay::config::Config;
use stratus_relay::publisher::{LogPublisher, Publisher};
use stratus_relay::runtime::RelayRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_relay=info,stratus_outbox=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        replicas = config.replicas,
        batch_size = config.dispatcher.batch_size,
        max_retries = config.dispatcher.retry.max_retries,
        retention_days = config.sweeper.retention.as_secs() / 86400,
        "Starting Stratus Relay"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    let store = Arc::new(PostgresOutboxStore::migrated(pool).await?);

    info!("Outbox schema verified");

    let publisher: Arc<dyn Publisher> = Arc::new(LogPublisher::new());
    info!(publisher = publisher.publisher_type(), "Publisher initialized");

    let runtime = RelayRuntime::builder()
        .store(store)
        .publisher(publisher)
        .dispatcher_config(config.dispatcher)
        .sweeper_config(config.sweeper)
        .replicas(config.replicas)
        .build()?
        .start()
        .await?;

    info!("Relay ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Stratus Relay shut down");

    Ok(())
}
