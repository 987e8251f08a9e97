// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay dispatcher: moves committed outbox events onto the bus.
//!
//! Each cycle:
//! 1. Claims up to `batch_size` due events (`pending → processing`)
//! 2. Publishes them concurrently, at most `max_in_flight` at a time
//! 3. Acknowledges each one (`published`), schedules a retry, or dead-letters it
//!
//! On a separate timer, claims older than `stale_after` are released back to
//! `pending` so events held by a crashed or hung dispatcher are redelivered.
//! Outcomes are recorded against the claim an event was delivered under, so a
//! hung dispatcher that wakes up late cannot overwrite the redelivery.
//!
//! Any number of dispatchers may share a store; the atomic claim keeps them
//! from delivering the same event concurrently.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use stratus_outbox::{Claim, FailureOutcome, OutboxEvent, OutboxStore, RetryPolicy, TxContext};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};
use crate::publisher::{OutboundMessage, PublishError, Publisher};

/// Configuration for a relay dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum events claimed per cycle.
    pub batch_size: i64,
    /// Time between cycles.
    pub poll_interval: Duration,
    /// Maximum concurrent publishes within one batch.
    pub max_in_flight: usize,
    /// Bound on a single claim.
    pub claim_timeout: Duration,
    /// Bound on a single publish; exceeding it counts as a failed attempt.
    pub publish_timeout: Duration,
    /// Retry and dead-letter policy.
    pub retry: RetryPolicy,
    /// Age after which a `processing` claim is considered abandoned.
    ///
    /// Must be longer than `claim_timeout + publish_timeout`.
    pub stale_after: Duration,
    /// Time between stale claim sweeps.
    pub stale_check_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            max_in_flight: 4,
            claim_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(300),       // 5 minutes
            stale_check_interval: Duration::from_secs(60), // 1 minute
        }
    }
}

/// Outcome counts for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events claimed.
    pub claimed: usize,
    /// Events delivered and acknowledged.
    pub published: usize,
    /// Events returned to `pending` for a later attempt.
    pub retried: usize,
    /// Events moved to `failed`.
    pub dead_lettered: usize,
    /// Events whose outcome could not be written back; they stay
    /// `processing` until stale release.
    pub ack_errors: usize,
}

impl DispatchReport {
    /// Whether the cycle found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Published => self.published += 1,
            Delivery::Retrying => self.retried += 1,
            Delivery::DeadLettered => self.dead_lettered += 1,
            Delivery::AckFailed => self.ack_errors += 1,
        }
    }
}

enum Delivery {
    Published,
    Retrying,
    DeadLettered,
    AckFailed,
}

/// Polls the outbox and publishes claimed events.
pub struct RelayDispatcher<S: OutboxStore + ?Sized> {
    store: Arc<S>,
    publisher: Arc<dyn Publisher>,
    config: DispatcherConfig,
    name: String,
    shutdown: Arc<Notify>,
}

impl<S: OutboxStore + ?Sized> RelayDispatcher<S> {
    /// Create a new dispatcher.
    pub fn new(store: Arc<S>, publisher: Arc<dyn Publisher>, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            name: "dispatcher".to_string(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Name used in log lines, to tell replicas apart.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run the dispatcher loop until the shutdown signal is received.
    ///
    /// A cycle in progress when shutdown arrives is finished first; events it
    /// cannot acknowledge are recovered by stale release.
    pub async fn run(&self) {
        info!(
            dispatcher = %self.name,
            publisher = self.publisher.publisher_type(),
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_in_flight = self.config.max_in_flight,
            max_retries = self.config.retry.max_retries,
            "Relay dispatcher started"
        );

        let mut poll = tokio::time::interval(non_zero(self.config.poll_interval));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stale_check = tokio::time::interval(non_zero(self.config.stale_check_interval));
        stale_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(dispatcher = %self.name, "Relay dispatcher received shutdown signal");
                    break;
                }

                _ = stale_check.tick() => {
                    if let Err(e) = self.release_stale().await {
                        error!(
                            dispatcher = %self.name,
                            error = %e,
                            "Failed to release stale claims"
                        );
                    }
                }

                _ = poll.tick() => {
                    match self.dispatch_once().await {
                        Ok(report) if !report.is_idle() => {
                            info!(
                                dispatcher = %self.name,
                                claimed = report.claimed,
                                published = report.published,
                                retried = report.retried,
                                dead_lettered = report.dead_lettered,
                                ack_errors = report.ack_errors,
                                "Dispatch cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(dispatcher = %self.name, error = %e, "Dispatch cycle failed");
                        }
                    }
                }
            }
        }

        info!(dispatcher = %self.name, "Relay dispatcher stopped");
    }

    /// Claim one batch and deliver it.
    ///
    /// Only claim failures are returned as errors. Per-event publish and
    /// acknowledgement failures are handled and counted in the report.
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        let ctx = TxContext::detached();
        let claim = self.store.claim_batch(&ctx, self.config.batch_size);
        let events = tokio::time::timeout(self.config.claim_timeout, claim)
            .await
            .map_err(|_| RelayError::Timeout {
                operation: "claim_batch",
                timeout: self.config.claim_timeout,
            })??;

        let mut report = DispatchReport {
            claimed: events.len(),
            ..DispatchReport::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        debug!(dispatcher = %self.name, count = events.len(), "Claimed outbox events");

        let deliveries: Vec<Delivery> = stream::iter(events)
            .map(|event| self.deliver(event))
            .buffer_unordered(self.config.max_in_flight.max(1))
            .collect()
            .await;

        for delivery in deliveries {
            report.record(delivery);
        }
        Ok(report)
    }

    /// Return abandoned `processing` claims to `pending`.
    pub async fn release_stale(&self) -> Result<u64> {
        let released = self
            .store
            .release_stale_processing(&TxContext::detached(), self.config.stale_after)
            .await?;

        if released > 0 {
            warn!(
                dispatcher = %self.name,
                released,
                stale_after_secs = self.config.stale_after.as_secs(),
                "Released stale outbox claims"
            );
        } else {
            debug!(dispatcher = %self.name, "No stale outbox claims");
        }
        Ok(released)
    }

    async fn deliver(&self, event: OutboxEvent) -> Delivery {
        let Some(claim) = event.claim() else {
            error!(event_id = %event.id, status = %event.status, "Outbox event was not claimed");
            return Delivery::AckFailed;
        };

        let message = OutboundMessage::from(&event);
        let result = match tokio::time::timeout(
            self.config.publish_timeout,
            self.publisher.publish(&message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.config.publish_timeout)),
        };

        match result {
            Ok(()) => self.acknowledge(&event, &claim).await,
            Err(e) if e.is_retryable() => self.retry_or_dead_letter(&event, &claim, &e).await,
            Err(e) => self.dead_letter(&event, &claim, &e).await,
        }
    }

    async fn acknowledge(&self, event: &OutboxEvent, claim: &Claim) -> Delivery {
        match self
            .store
            .mark_published(&TxContext::detached(), claim)
            .await
        {
            Ok(()) => {
                debug!(event_id = %event.id, topic = %event.topic, "Outbox event published");
                Delivery::Published
            }
            Err(e) => {
                // Delivered but not recorded: the event will go out again.
                warn!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to mark outbox event published"
                );
                Delivery::AckFailed
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        event: &OutboxEvent,
        claim: &Claim,
        cause: &PublishError,
    ) -> Delivery {
        let reason = cause.to_string();
        match self
            .store
            .record_failure(
                &TxContext::detached(),
                claim,
                &reason,
                &self.config.retry,
            )
            .await
        {
            Ok(FailureOutcome::Retrying {
                retry_count,
                available_at,
            }) => {
                warn!(
                    event_id = %event.id,
                    topic = %event.topic,
                    retry_count,
                    available_at = %available_at,
                    error = %reason,
                    "Publish failed; will retry"
                );
                Delivery::Retrying
            }
            Ok(FailureOutcome::DeadLettered { retry_count }) => {
                warn!(
                    event_id = %event.id,
                    topic = %event.topic,
                    retry_count,
                    error = %reason,
                    "Publish failed; retries exhausted, event dead-lettered"
                );
                Delivery::DeadLettered
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Failed to record publish failure");
                Delivery::AckFailed
            }
        }
    }

    async fn dead_letter(
        &self,
        event: &OutboxEvent,
        claim: &Claim,
        cause: &PublishError,
    ) -> Delivery {
        let reason = cause.to_string();
        match self
            .store
            .mark_failed(&TxContext::detached(), claim, &reason)
            .await
        {
            Ok(()) => {
                warn!(
                    event_id = %event.id,
                    topic = %event.topic,
                    error = %reason,
                    "Publish rejected; event dead-lettered"
                );
                Delivery::DeadLettered
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Failed to dead-letter outbox event");
                Delivery::AckFailed
            }
        }
    }
}

// tokio::time::interval panics on a zero period.
fn non_zero(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}
