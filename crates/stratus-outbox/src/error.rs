// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-outbox.

use thiserror::Error;
use uuid::Uuid;

use crate::event::OutboxStatus;

/// Result type using [`OutboxError`].
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Outbox errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OutboxError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying embedded migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Commit or rollback was requested on a context without an open unit of work.
    #[error("no active transaction in context")]
    NoActiveTransaction,

    /// The referenced event does not exist.
    #[error("Outbox event '{0}' not found")]
    EventNotFound(Uuid),

    /// The event is not in the status the operation requires.
    #[error("Outbox event '{id}' is '{actual}', expected '{expected}'")]
    InvalidTransition {
        /// The event ID.
        id: Uuid,
        /// The status the operation requires.
        expected: OutboxStatus,
        /// The status the event actually has.
        actual: OutboxStatus,
    },

    /// The event is `processing` under a newer claim than the one presented.
    #[error("Claim on outbox event '{0}' was released and taken again")]
    ClaimLost(Uuid),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A stored row could not be mapped back to an event.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl OutboxError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migrate(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::NoActiveTransaction => "NO_ACTIVE_TRANSACTION",
            Self::EventNotFound(_) => "EVENT_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ClaimLost(_) => "CLAIM_LOST",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Decode(_) => "DECODE_ERROR",
        }
    }
}
