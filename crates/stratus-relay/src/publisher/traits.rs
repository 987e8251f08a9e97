// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publisher trait definitions.
//!
//! Defines the abstract interface to the message bus.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_outbox::OutboxEvent;
use thiserror::Error;
use uuid::Uuid;

/// Errors from publish attempts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    /// The bus could not be reached or refused the connection.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// The bus refused this message; retrying will not help.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The publish did not finish in time.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// The message could not be encoded for the wire.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PublishError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Result type for publish operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// A message handed to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Outbox event ID; consumers dedupe on it.
    pub id: Uuid,
    /// Destination topic.
    pub topic: String,
    /// Event name.
    pub event_type: String,
    /// Event body.
    pub payload: Value,
    /// Owning workspace, if any.
    pub workspace_id: Option<Uuid>,
    /// When the originating change was committed.
    pub occurred_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Wire form of this message.
    pub fn envelope(&self) -> BusEnvelope {
        BusEnvelope {
            id: self.id,
            topic: self.topic.clone(),
            event_type: self.event_type.clone(),
            workspace_id: self.workspace_id,
            data: self.payload.clone(),
            timestamp: self.occurred_at,
        }
    }
}

impl From<&OutboxEvent> for OutboundMessage {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            topic: event.topic.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            workspace_id: event.workspace_id,
            occurred_at: event.created_at,
        }
    }
}

/// JSON envelope written to the bus.
///
/// `type` carries the topic so subscribers can route without parsing `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Idempotency key.
    pub id: Uuid,
    /// Destination topic.
    #[serde(rename = "type")]
    pub topic: String,
    /// Event name.
    pub event_type: String,
    /// Owning workspace, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workspace_id: Option<Uuid>,
    /// Event body.
    pub data: Value,
    /// When the originating change was committed.
    pub timestamp: DateTime<Utc>,
}

/// The message bus as seen by the relay.
///
/// Implementations only report success or failure; the dispatcher owns
/// retries, timeouts and dead-lettering.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Short name used in logs.
    fn publisher_type(&self) -> &'static str;

    /// Deliver one message.
    async fn publish(&self, message: &OutboundMessage) -> Result<()>;
}
