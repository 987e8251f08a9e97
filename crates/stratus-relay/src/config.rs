// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use stratus_outbox::RetryPolicy;

use crate::dispatcher::DispatcherConfig;
use crate::sweeper::{MAX_RETENTION_DAYS, SweeperConfig};

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Connection pool size
    pub db_max_connections: u32,
    /// Dispatcher tasks to run in this process
    pub replicas: usize,
    /// Settings shared by every dispatcher replica
    pub dispatcher: DispatcherConfig,
    /// Retention sweeper settings
    pub sweeper: SweeperConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATUS_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `STRATUS_DB_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `STRATUS_RELAY_REPLICAS`: dispatcher tasks (default: 1)
    /// - `STRATUS_RELAY_BATCH_SIZE`: events per claim (default: 10)
    /// - `STRATUS_RELAY_POLL_INTERVAL_MS`: poll interval (default: 1000)
    /// - `STRATUS_RELAY_MAX_IN_FLIGHT`: concurrent publishes (default: 4)
    /// - `STRATUS_RELAY_CLAIM_TIMEOUT_MS`: claim timeout (default: 5000)
    /// - `STRATUS_RELAY_PUBLISH_TIMEOUT_MS`: per-publish timeout (default: 10000)
    /// - `STRATUS_RELAY_MAX_RETRIES`: attempts before dead-lettering (default: 3)
    /// - `STRATUS_RELAY_RETRY_BASE_MS`: backoff base (default: 1000)
    /// - `STRATUS_RELAY_RETRY_MAX_MS`: backoff cap (default: 300000)
    /// - `STRATUS_RELAY_STALE_AFTER_SECS`: stale claim threshold, longer than the
    ///   claim and publish timeouts combined (default: 300)
    /// - `STRATUS_RELAY_STALE_CHECK_SECS`: stale release interval (default: 60)
    /// - `STRATUS_SWEEPER_ENABLED`: "true" or "1" to run the sweeper (default: true)
    /// - `STRATUS_SWEEPER_INTERVAL_SECS`: sweep interval (default: 86400)
    /// - `STRATUS_SWEEPER_RETENTION_DAYS`: days to keep published events, at most
    ///   36500 (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRATUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRATUS_DATABASE_URL"))?;

        let db_max_connections: u32 = positive("STRATUS_DB_MAX_CONNECTIONS", "10")?;
        let replicas: usize = positive("STRATUS_RELAY_REPLICAS", "1")?;

        let retry = RetryPolicy {
            max_retries: positive("STRATUS_RELAY_MAX_RETRIES", "3")?,
            base_backoff: Duration::from_millis(parse("STRATUS_RELAY_RETRY_BASE_MS", "1000")?),
            max_backoff: Duration::from_millis(parse("STRATUS_RELAY_RETRY_MAX_MS", "300000")?),
        };
        if retry.max_backoff < retry.base_backoff {
            return Err(ConfigError::Invalid(
                "STRATUS_RELAY_RETRY_MAX_MS",
                "must not be smaller than STRATUS_RELAY_RETRY_BASE_MS",
            ));
        }

        let dispatcher = DispatcherConfig {
            batch_size: positive("STRATUS_RELAY_BATCH_SIZE", "10")?,
            poll_interval: Duration::from_millis(positive(
                "STRATUS_RELAY_POLL_INTERVAL_MS",
                "1000",
            )?),
            max_in_flight: positive("STRATUS_RELAY_MAX_IN_FLIGHT", "4")?,
            claim_timeout: Duration::from_millis(positive(
                "STRATUS_RELAY_CLAIM_TIMEOUT_MS",
                "5000",
            )?),
            publish_timeout: Duration::from_millis(positive(
                "STRATUS_RELAY_PUBLISH_TIMEOUT_MS",
                "10000",
            )?),
            retry,
            stale_after: Duration::from_secs(positive("STRATUS_RELAY_STALE_AFTER_SECS", "300")?),
            stale_check_interval: Duration::from_secs(positive(
                "STRATUS_RELAY_STALE_CHECK_SECS",
                "60",
            )?),
        };
        let in_flight_limit = dispatcher
            .claim_timeout
            .saturating_add(dispatcher.publish_timeout);
        if dispatcher.stale_after <= in_flight_limit {
            return Err(ConfigError::Invalid(
                "STRATUS_RELAY_STALE_AFTER_SECS",
                "must exceed the claim and publish timeouts combined",
            ));
        }

        let enabled = std::env::var("STRATUS_SWEEPER_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        let retention_days: u64 = positive("STRATUS_SWEEPER_RETENTION_DAYS", "30")?;
        if retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Invalid(
                "STRATUS_SWEEPER_RETENTION_DAYS",
                "must not exceed 36500",
            ));
        }
        let sweeper = SweeperConfig {
            enabled,
            poll_interval: Duration::from_secs(positive("STRATUS_SWEEPER_INTERVAL_SECS", "86400")?),
            retention: Duration::from_secs(retention_days * 24 * 3600),
        };

        Ok(Self {
            database_url,
            db_max_connections,
            replicas,
            dispatcher,
            sweeper,
        })
    }
}

fn parse<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer"))
}

fn positive<T: FromStr + Default + PartialOrd>(
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    let value: T = std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
