// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process fan-out over a tokio broadcast channel.
//!
//! Suitable for feeding server-sent-event streams in the same process as the
//! relay. A subscriber that falls behind by more than the channel capacity
//! receives `RecvError::Lagged` and skips ahead.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::traits::{BusEnvelope, OutboundMessage, Publisher, Result};

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcasts envelopes to every live subscriber.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<BusEnvelope>,
}

impl BroadcastPublisher {
    /// Create a publisher whose channel buffers `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to envelopes published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    fn publisher_type(&self) -> &'static str {
        "broadcast"
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        // No subscribers is not an error: there is simply nobody listening.
        match self.tx.send(message.envelope()) {
            Ok(receivers) => {
                debug!(event_id = %message.id, receivers, "Broadcast outbox event");
            }
            Err(_) => {
                debug!(event_id = %message.id, "Broadcast outbox event with no subscribers");
            }
        }
        Ok(())
    }
}
