// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable relay runtime.
//!
//! [`RelayRuntime`] runs the dispatcher replicas and the retention sweeper as
//! tokio tasks inside an existing application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_outbox::PostgresOutboxStore;
//! use stratus_relay::publisher::LogPublisher;
//! use stratus_relay::runtime::RelayRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let store = Arc::new(PostgresOutboxStore::migrated(pool).await?);
//!
//!     let runtime = RelayRuntime::builder()
//!         .store(store)
//!         .publisher(Arc::new(LogPublisher::new()))
//!         .replicas(2)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use stratus_outbox::{OutboxStore, TxContext};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatcher::{DispatcherConfig, RelayDispatcher};
use crate::error::{RelayError, Result};
use crate::publisher::Publisher;
use crate::sweeper::{MAX_RETENTION, MAX_RETENTION_DAYS, RetentionSweeper, SweeperConfig};

/// Builder for creating a [`RelayRuntime`].
pub struct RelayRuntimeBuilder<S: OutboxStore + ?Sized + 'static> {
    store: Option<Arc<S>>,
    publisher: Option<Arc<dyn Publisher>>,
    dispatcher_config: DispatcherConfig,
    sweeper_config: SweeperConfig,
    replicas: usize,
}

impl<S: OutboxStore + ?Sized + 'static> Default for RelayRuntimeBuilder<S> {
    fn default() -> Self {
        Self {
            store: None,
            publisher: None,
            dispatcher_config: DispatcherConfig::default(),
            sweeper_config: SweeperConfig::default(),
            replicas: 1,
        }
    }
}

impl<S: OutboxStore + ?Sized + 'static> RelayRuntimeBuilder<S> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outbox store (required).
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the bus publisher (required).
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Set the configuration shared by every dispatcher replica.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Set the retention sweeper configuration.
    pub fn sweeper_config(mut self, config: SweeperConfig) -> Self {
        self.sweeper_config = config;
        self
    }

    /// Set the number of dispatcher tasks.
    ///
    /// Default: 1
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or a setting is out
    /// of range.
    pub fn build(self) -> Result<RelayRuntimeConfig<S>> {
        let store = self
            .store
            .ok_or_else(|| RelayError::Other("store is required".to_string()))?;
        let publisher = self
            .publisher
            .ok_or_else(|| RelayError::Other("publisher is required".to_string()))?;

        if self.replicas == 0 {
            return Err(RelayError::Other(
                "at least one dispatcher replica is required".to_string(),
            ));
        }
        if self.dispatcher_config.batch_size <= 0 {
            return Err(RelayError::Other(
                "dispatcher batch size must be greater than zero".to_string(),
            ));
        }
        let dispatcher = &self.dispatcher_config;
        if dispatcher.stale_after
            <= dispatcher
                .claim_timeout
                .saturating_add(dispatcher.publish_timeout)
        {
            return Err(RelayError::Other(
                "stale_after must exceed claim_timeout plus publish_timeout".to_string(),
            ));
        }
        if self.sweeper_config.retention.is_zero() {
            return Err(RelayError::Other(
                "sweeper retention must be greater than zero".to_string(),
            ));
        }
        if self.sweeper_config.retention > MAX_RETENTION {
            return Err(RelayError::Other(format!(
                "sweeper retention must not exceed {MAX_RETENTION_DAYS} days"
            )));
        }
        if self.sweeper_config.enabled && self.sweeper_config.poll_interval.is_zero() {
            return Err(RelayError::Other(
                "sweeper poll interval must be greater than zero".to_string(),
            ));
        }

        Ok(RelayRuntimeConfig {
            store,
            publisher,
            dispatcher_config: self.dispatcher_config,
            sweeper_config: self.sweeper_config,
            replicas: self.replicas,
        })
    }
}

/// Configuration for a [`RelayRuntime`].
pub struct RelayRuntimeConfig<S: OutboxStore + ?Sized + 'static> {
    store: Arc<S>,
    publisher: Arc<dyn Publisher>,
    dispatcher_config: DispatcherConfig,
    sweeper_config: SweeperConfig,
    replicas: usize,
}

impl<S: OutboxStore + ?Sized + 'static> RelayRuntimeConfig<S> {
    /// Start the runtime, spawning the dispatcher and sweeper tasks.
    ///
    /// Reads the outbox status counts first, so an unreachable store fails
    /// here rather than inside the background tasks.
    pub async fn start(self) -> Result<RelayRuntime> {
        let counts = self.store.status_counts(&TxContext::detached()).await?;
        info!(
            pending = counts.pending,
            processing = counts.processing,
            failed = counts.failed,
            published = counts.published,
            "Outbox backlog at startup"
        );

        let mut dispatcher_handles = Vec::with_capacity(self.replicas);
        let mut dispatcher_shutdowns = Vec::with_capacity(self.replicas);

        for replica in 0..self.replicas {
            let dispatcher = RelayDispatcher::new(
                self.store.clone(),
                self.publisher.clone(),
                self.dispatcher_config.clone(),
            )
            .with_name(format!("dispatcher-{replica}"));
            dispatcher_shutdowns.push(dispatcher.shutdown_handle());

            dispatcher_handles.push(tokio::spawn(async move {
                dispatcher.run().await;
            }));
        }

        let sweeper = if self.sweeper_config.enabled {
            let sweeper = RetentionSweeper::new(self.store.clone(), self.sweeper_config.clone());
            let shutdown = sweeper.shutdown_handle();
            let handle = tokio::spawn(async move {
                sweeper.run().await;
            });
            Some((handle, shutdown))
        } else {
            debug!("Retention sweeper disabled; not spawning");
            None
        };

        info!(
            replicas = self.replicas,
            publisher = self.publisher.publisher_type(),
            sweeper = sweeper.is_some(),
            "RelayRuntime started"
        );

        Ok(RelayRuntime {
            dispatcher_handles,
            dispatcher_shutdowns,
            sweeper,
            poll_interval: self.dispatcher_config.poll_interval,
        })
    }
}

/// A running relay that can be embedded in an application.
///
/// The runtime manages:
/// - N dispatcher tasks publishing claimed outbox events
/// - One retention sweeper task (unless disabled)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct RelayRuntime {
    dispatcher_handles: Vec<JoinHandle<()>>,
    dispatcher_shutdowns: Vec<Arc<Notify>>,
    sweeper: Option<(JoinHandle<()>, Arc<Notify>)>,
    poll_interval: Duration,
}

impl RelayRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder<S: OutboxStore + ?Sized + 'static>() -> RelayRuntimeBuilder<S> {
        RelayRuntimeBuilder::new()
    }

    /// Number of dispatcher tasks.
    pub fn replicas(&self) -> usize {
        self.dispatcher_handles.len()
    }

    /// Dispatcher poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every dispatcher and the sweeper, then waits for each to finish
    /// its current cycle.
    pub async fn shutdown(self) -> Result<()> {
        info!("RelayRuntime shutting down...");

        for shutdown in &self.dispatcher_shutdowns {
            shutdown.notify_one();
        }
        if let Some((_, shutdown)) = &self.sweeper {
            shutdown.notify_one();
        }

        let mut panicked = 0usize;
        for handle in self.dispatcher_handles {
            if let Err(e) = handle.await {
                error!("Dispatcher task panicked: {}", e);
                panicked += 1;
            }
        }
        if let Some((handle, _)) = self.sweeper
            && let Err(e) = handle.await
        {
            error!("Retention sweeper task panicked: {}", e);
            panicked += 1;
        }

        if panicked > 0 {
            return Err(RelayError::Other(format!(
                "{panicked} relay task(s) panicked"
            )));
        }

        info!("RelayRuntime shutdown complete");
        Ok(())
    }

    /// Check if every task is still running.
    pub fn is_running(&self) -> bool {
        let sweeper_running = self
            .sweeper
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished());

        !self.dispatcher_handles.is_empty()
            && self.dispatcher_handles.iter().all(|h| !h.is_finished())
            && sweeper_running
    }
}
