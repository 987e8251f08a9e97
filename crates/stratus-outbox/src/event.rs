// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox event model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OutboxError, Result};
use crate::topics;

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Waiting to be claimed by a dispatcher.
    Pending,
    /// Claimed by a dispatcher; publish in flight.
    Processing,
    /// Delivered to the bus.
    Published,
    /// Dead letter; retries exhausted or the bus rejected it.
    Failed,
}

impl OutboxStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [OutboxStatus; 4] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Published,
        OutboxStatus::Failed,
    ];

    /// Column value for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(OutboxError::Decode(format!(
                "unknown outbox status '{}'",
                other
            ))),
        }
    }
}

/// An event persisted in the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier; consumers dedupe on it.
    pub id: Uuid,
    /// Destination category on the bus.
    pub topic: String,
    /// Specific event name.
    pub event_type: String,
    /// Event body, opaque to the outbox.
    pub payload: Value,
    /// Workspace the event belongs to, if any.
    pub workspace_id: Option<Uuid>,
    /// Current delivery status.
    pub status: OutboxStatus,
    /// Number of failed publish attempts.
    pub retry_count: i32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the event was enqueued.
    pub created_at: DateTime<Utc>,
    /// Earliest time the event may be claimed.
    pub available_at: DateTime<Utc>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Token of the current claim; a new one is issued on every claim.
    pub claim_token: Option<Uuid>,
    /// When the event was published.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// The claim held on this event, if it was returned by `claim_batch`.
    pub fn claim(&self) -> Option<Claim> {
        match (self.status, self.claim_token) {
            (OutboxStatus::Processing, Some(token)) => Some(Claim {
                id: self.id,
                token,
                retry_count: self.retry_count,
            }),
            _ => None,
        }
    }
}

/// A dispatcher's hold on a `processing` event.
///
/// Acknowledging or failing an event requires the claim it was delivered
/// under. Once the claim is released as stale and the event is claimed
/// again, the old claim no longer matches and its outcome is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// The claimed event.
    pub id: Uuid,
    /// Token issued by the claim.
    pub token: Uuid,
    /// Failed attempts recorded before this claim.
    pub retry_count: i32,
}

/// An event to be enqueued by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    /// Explicit ID; generated at enqueue when absent.
    pub id: Option<Uuid>,
    /// Destination category on the bus.
    pub topic: String,
    /// Specific event name.
    pub event_type: String,
    /// Event body.
    pub payload: Value,
    /// Workspace the event belongs to, if any.
    pub workspace_id: Option<Uuid>,
    /// Explicit enqueue time; the store's clock is used when absent.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewOutboxEvent {
    /// Create a new event for `topic` with the given type and payload.
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            event_type: event_type.into(),
            payload,
            workspace_id: None,
            created_at: None,
        }
    }

    /// Create an event whose payload is the JSON form of `data`.
    pub fn from_serializable<T: Serialize>(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        data: &T,
    ) -> Result<Self> {
        Ok(Self::new(topic, event_type, serde_json::to_value(data)?))
    }

    /// Create a resource lifecycle event.
    ///
    /// The topic follows `{resource}.{provider}.{credential_id}.{region}.{action}`
    /// and the event type is `{resource}-{action}`, e.g. `vm-created`.
    pub fn for_resource(
        resource: &str,
        provider: &str,
        credential_id: &str,
        region: &str,
        action: &str,
        payload: Value,
    ) -> Self {
        Self::new(
            topics::resource_topic(resource, provider, credential_id, region, action),
            topics::event_type(resource, action),
            payload,
        )
    }

    /// Use a caller-chosen ID.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Attach the owning workspace.
    pub fn with_workspace(mut self, workspace_id: Uuid) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    /// Use a caller-chosen enqueue time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Reject events that could never be routed.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(OutboxError::InvalidRequest("topic must not be empty".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(OutboxError::InvalidRequest(
                "event_type must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Number of events per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Events waiting to be claimed.
    pub pending: i64,
    /// Events currently claimed.
    pub processing: i64,
    /// Delivered events not yet swept.
    pub published: i64,
    /// Dead letters.
    pub failed: i64,
}

impl StatusCounts {
    /// Record `count` events with `status`.
    pub fn add(&mut self, status: OutboxStatus, count: i64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Processing => self.processing += count,
            OutboxStatus::Published => self.published += count,
            OutboxStatus::Failed => self.failed += count,
        }
    }

    /// Total events in the table.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.published + self.failed
    }
}
