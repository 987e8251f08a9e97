// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock publisher for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::{OutboundMessage, PublishError, Publisher, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    /// Fail with `Unavailable` for the first N attempts, then succeed.
    FailTimes(usize),
    AlwaysUnavailable,
    AlwaysReject,
}

/// Mock publisher that records deliveries and fails on request.
#[derive(Debug)]
pub struct MockPublisher {
    behavior: Behavior,
    delay: Option<Duration>,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<OutboundMessage>>,
}

impl MockPublisher {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: None,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Create a publisher that accepts everything.
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    /// Create a publisher whose first `n` attempts fail as unavailable.
    pub fn failing_times(n: usize) -> Self {
        Self::with_behavior(Behavior::FailTimes(n))
    }

    /// Create a publisher that is never reachable.
    pub fn unavailable() -> Self {
        Self::with_behavior(Behavior::AlwaysUnavailable)
    }

    /// Create a publisher that rejects every message.
    pub fn rejecting() -> Self {
        Self::with_behavior(Behavior::AlwaysReject)
    }

    /// Sleep this long before answering each attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total publish attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages accepted so far, in delivery order.
    pub async fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().await.clone()
    }

    /// IDs of accepted messages, in delivery order.
    pub async fn delivered_ids(&self) -> Vec<Uuid> {
        self.delivered.lock().await.iter().map(|m| m.id).collect()
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn publisher_type(&self) -> &'static str {
        "mock"
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.behavior {
            Behavior::AlwaysUnavailable => {
                return Err(PublishError::Unavailable("mock bus is down".to_string()));
            }
            Behavior::AlwaysReject => {
                return Err(PublishError::Rejected(format!(
                    "mock bus refuses topic {}",
                    message.topic
                )));
            }
            Behavior::FailTimes(n) if attempt < n => {
                return Err(PublishError::Unavailable(format!(
                    "mock failure {} of {}",
                    attempt + 1,
                    n
                )));
            }
            Behavior::FailTimes(_) | Behavior::Succeed => {}
        }

        self.delivered.lock().await.push(message.clone());
        Ok(())
    }
}
