// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that deletes old published events.
//!
//! Only `published` rows whose `published_at` is older than the retention
//! window are removed. `failed` rows stay until an operator replays them, and
//! `pending` or `processing` rows are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stratus_outbox::{OutboxStore, TxContext};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{RelayError, Result};

/// Longest retention window the sweeper accepts, in days.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// [`MAX_RETENTION_DAYS`] as a duration.
pub const MAX_RETENTION: Duration = Duration::from_secs(MAX_RETENTION_DAYS * 24 * 3600);

/// Configuration for the retention sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Whether the sweeper runs at all.
    pub enabled: bool,
    /// How often to sweep.
    pub poll_interval: Duration,
    /// How long published events are kept.
    pub retention: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(24 * 3600), // daily
            retention: Duration::from_secs(30 * 24 * 3600), // 30 days
        }
    }
}

/// Periodically deletes published events past the retention window.
pub struct RetentionSweeper<S: OutboxStore + ?Sized> {
    store: Arc<S>,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl<S: OutboxStore + ?Sized> RetentionSweeper<S> {
    /// Create a new sweeper.
    pub fn new(store: Arc<S>, config: SweeperConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention sweeper disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_days = self.config.retention.as_secs() / 86400,
            "Retention sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to sweep published outbox events");
                    }
                }
            }
        }

        info!("Retention sweeper stopped");
    }

    /// Delete events published more than `retention` before now.
    pub async fn sweep(&self) -> Result<u64> {
        self.sweep_at(Utc::now()).await
    }

    /// Delete events published more than `retention` before `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| RelayError::Other(format!("retention window out of range: {e}")))?;
        let cutoff = now.checked_sub_signed(retention).ok_or_else(|| {
            RelayError::Other(format!(
                "retention window of {}s reaches before the earliest timestamp",
                self.config.retention.as_secs()
            ))
        })?;

        let deleted = self
            .store
            .delete_older_than(&TxContext::detached(), cutoff)
            .await?;

        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Swept published outbox events");
        } else {
            debug!(cutoff = %cutoff, "No published outbox events past retention");
        }
        Ok(deleted)
    }
}
