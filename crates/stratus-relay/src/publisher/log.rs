// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publisher that writes envelopes to the tracing log.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use super::traits::{OutboundMessage, PublishError, Publisher, Result};

/// Logs each message as a JSON envelope.
///
/// Used by the standalone relay when no broker is wired in. With a buffer
/// attached, the encoded envelopes are also kept in memory.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogPublisher {
    /// Create a log-only publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that also keeps every encoded envelope.
    pub fn with_buffer() -> Self {
        Self {
            buffer: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Envelopes captured so far (empty without a buffer).
    pub fn captured(&self) -> Vec<String> {
        match &self.buffer {
            Some(buffer) => buffer.lock().map(|b| b.clone()).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Publisher for LogPublisher {
    fn publisher_type(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let encoded = serde_json::to_string(&message.envelope())?;

        info!(
            event_id = %message.id,
            topic = %message.topic,
            event_type = %message.event_type,
            envelope = %encoded,
            "Published outbox event"
        );

        if let Some(buffer) = &self.buffer {
            buffer
                .lock()
                .map_err(|_| PublishError::Unavailable("log buffer poisoned".to_string()))?
                .push(encoded);
        }
        Ok(())
    }
}
