// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-relay.

use std::time::Duration;

use thiserror::Error;

/// Relay errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelayError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Outbox store operation failed.
    #[error("Outbox error: {0}")]
    Outbox(#[from] stratus_outbox::OutboxError),

    /// Publishing to the bus failed.
    #[error("Publish error: {0}")]
    Publish(#[from] crate::publisher::PublishError),

    /// A bounded operation ran out of time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that was cut off.
        operation: &'static str,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
