// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox store abstraction.
//!
//! The [`OutboxStore`] trait is the durable bookkeeping for outbox events. It
//! knows nothing about the message bus. Two backends are provided:
//!
//! - [`PostgresOutboxStore`] for production, claiming with `FOR UPDATE SKIP LOCKED`
//! - [`SqliteOutboxStore`] for embedded deployments and tests

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Database;
use uuid::Uuid;

use crate::error::Result;
use crate::event::{Claim, NewOutboxEvent, OutboxEvent, StatusCounts};
use crate::retry::{FailureOutcome, RetryPolicy};
use crate::transaction::TxContext;

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresOutboxStore;
pub use sqlite::SqliteOutboxStore;

/// Durable storage for outbox events.
///
/// Every operation takes a [`TxContext`]: with an active unit of work the
/// statement joins it, otherwise it runs auto-committed on the store's pool.
/// Each write is a single statement, so the claim and every status
/// transition are atomic on their own.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Database the store runs on.
    type Db: Database;

    /// Insert a new `pending` event.
    ///
    /// Call this with the producer's transaction context so the event commits
    /// or rolls back together with the business write.
    async fn enqueue(&self, ctx: &TxContext<Self::Db>, event: NewOutboxEvent)
    -> Result<OutboxEvent>;

    /// Atomically claim up to `limit` claimable `pending` events.
    ///
    /// Claimed events are `processing` with `claimed_at` and a fresh
    /// `claim_token` set, returned in `created_at` order. Concurrent callers
    /// never receive the same event.
    async fn claim_batch(&self, ctx: &TxContext<Self::Db>, limit: i64)
    -> Result<Vec<OutboxEvent>>;

    /// Move a claimed event to `published`.
    ///
    /// Changes nothing and fails with `InvalidTransition` if the event is no
    /// longer `processing`, `ClaimLost` if it was claimed again since, or
    /// `EventNotFound`.
    async fn mark_published(&self, ctx: &TxContext<Self::Db>, claim: &Claim) -> Result<()>;

    /// Record a failed publish of a claimed event.
    ///
    /// Increments `retry_count` and stores `error`. The event returns to
    /// `pending` after the policy's backoff, or is dead-lettered once the new
    /// count reaches `policy.max_retries`. Fails like `mark_published` when
    /// the claim is no longer current.
    async fn record_failure(
        &self,
        ctx: &TxContext<Self::Db>,
        claim: &Claim,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome>;

    /// Dead-letter a claimed event immediately.
    async fn mark_failed(&self, ctx: &TxContext<Self::Db>, claim: &Claim, error: &str)
    -> Result<()>;

    /// Return events claimed longer than `stale_after` ago to `pending`.
    ///
    /// The release is not counted as a failed attempt.
    async fn release_stale_processing(
        &self,
        ctx: &TxContext<Self::Db>,
        stale_after: Duration,
    ) -> Result<u64>;

    /// Dead-lettered events, newest first.
    async fn list_failed(&self, ctx: &TxContext<Self::Db>, limit: i64)
    -> Result<Vec<OutboxEvent>>;

    /// Return a `failed` event to `pending` with a fresh retry budget.
    ///
    /// `last_error` is kept for the operator's reference.
    async fn replay_failed(&self, ctx: &TxContext<Self::Db>, id: Uuid) -> Result<()>;

    /// Delete `published` events whose `published_at` is before `cutoff`.
    async fn delete_older_than(
        &self,
        ctx: &TxContext<Self::Db>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Load a single event.
    async fn get(&self, ctx: &TxContext<Self::Db>, id: Uuid) -> Result<Option<OutboxEvent>>;

    /// Count events per status.
    async fn status_counts(&self, ctx: &TxContext<Self::Db>) -> Result<StatusCounts>;
}
