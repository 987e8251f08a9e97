// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed outbox store.
//!
//! The free functions take a bare connection so they can run on either a
//! transaction or a pooled connection; [`PostgresOutboxStore`] resolves the
//! connection from the caller's [`PgTxContext`] and delegates to them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::debug;
use uuid::Uuid;

use super::OutboxStore;
use crate::error::{OutboxError, Result};
use crate::event::{Claim, NewOutboxEvent, OutboxEvent, OutboxStatus, StatusCounts};
use crate::retry::{FailureOutcome, RetryPolicy, duration_to_millis};
use crate::transaction::PgTxContext;

const EVENT_COLUMNS: &str = "id, topic, event_type, payload, workspace_id, status, retry_count, \
     last_error, created_at, available_at, claimed_at, claim_token, published_at";

/// PostgreSQL-backed outbox store.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a store over an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations and create a store over `pool`.
    pub async fn migrated(pool: PgPool) -> Result<Self> {
        crate::migrations::run_postgres(&pool).await?;
        Ok(Self::new(pool))
    }

    /// The store's pool; the fallback for detached contexts.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxEventRow {
    id: Uuid,
    topic: String,
    event_type: String,
    payload: serde_json::Value,
    workspace_id: Option<Uuid>,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claim_token: Option<Uuid>,
    published_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxError;

    fn try_from(row: OutboxEventRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            topic: row.topic,
            event_type: row.event_type,
            payload: row.payload,
            workspace_id: row.workspace_id,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
            available_at: row.available_at,
            claimed_at: row.claimed_at,
            claim_token: row.claim_token,
            published_at: row.published_at,
        })
    }
}

fn into_events(rows: Vec<OutboxEventRow>) -> Result<Vec<OutboxEvent>> {
    rows.into_iter().map(OutboxEvent::try_from).collect()
}

// ============================================================================
// Producer Operations
// ============================================================================

/// Insert a new pending event.
pub async fn enqueue(conn: &mut PgConnection, event: NewOutboxEvent) -> Result<OutboxEvent> {
    event.validate()?;
    let id = event.id.unwrap_or_else(Uuid::new_v4);

    let sql = format!(
        r#"
        INSERT INTO outbox_events
            (id, topic, event_type, payload, workspace_id, status, created_at, available_at)
        VALUES ($1, $2, $3, $4, $5, 'pending', COALESCE($6, NOW()), COALESCE($6, NOW()))
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(id)
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.workspace_id)
        .bind(event.created_at)
        .fetch_one(&mut *conn)
        .await?;

    debug!(
        event_id = %id,
        topic = %event.topic,
        event_type = %event.event_type,
        "Outbox event enqueued"
    );
    row.try_into()
}

// ============================================================================
// Dispatcher Operations
// ============================================================================

/// Claim up to `limit` eligible pending events in one statement.
///
/// Rows locked by a concurrent claimer are skipped rather than waited on.
pub async fn claim_batch(conn: &mut PgConnection, limit: i64) -> Result<Vec<OutboxEvent>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        UPDATE outbox_events
        SET status = 'processing', claimed_at = NOW(), claim_token = $2
        WHERE id IN (
            SELECT id FROM outbox_events
            WHERE status = 'pending' AND available_at <= NOW()
            ORDER BY created_at, seq
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        AND status = 'pending'
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let rows = sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(limit)
        .bind(Uuid::new_v4())
        .fetch_all(&mut *conn)
        .await?;

    let mut events = into_events(rows)?;
    // RETURNING does not preserve the subquery order.
    events.sort_by_key(|e| e.created_at);
    Ok(events)
}

/// Move a claimed event to published.
pub async fn mark_published(conn: &mut PgConnection, claim: &Claim) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'published', published_at = NOW(), claimed_at = NULL, claim_token = NULL
        WHERE id = $1 AND status = 'processing' AND claim_token = $2
        "#,
    )
    .bind(claim.id)
    .bind(claim.token)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, claim.id, OutboxStatus::Processing).await);
    }
    Ok(())
}

/// Record a failed publish; retry with backoff or dead-letter.
pub async fn record_failure(
    conn: &mut PgConnection,
    claim: &Claim,
    error: &str,
    policy: &RetryPolicy,
) -> Result<FailureOutcome> {
    let retry_count = claim.retry_count + 1;
    let exhausted = policy.is_exhausted(retry_count);
    let status = if exhausted {
        OutboxStatus::Failed
    } else {
        OutboxStatus::Pending
    };

    let available_at: Option<DateTime<Utc>> = sqlx::query_scalar(
        r#"
        UPDATE outbox_events
        SET status = $3,
            retry_count = $4,
            last_error = $5,
            claimed_at = NULL,
            claim_token = NULL,
            available_at = CASE
                WHEN $6 THEN available_at
                ELSE NOW() + ($7::DOUBLE PRECISION * INTERVAL '1 millisecond')
            END
        WHERE id = $1 AND status = 'processing' AND claim_token = $2 AND retry_count = $8
        RETURNING available_at
        "#,
    )
    .bind(claim.id)
    .bind(claim.token)
    .bind(status.as_str())
    .bind(retry_count)
    .bind(error)
    .bind(exhausted)
    .bind(duration_to_millis(policy.backoff_for(retry_count)))
    .bind(claim.retry_count)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(available_at) = available_at else {
        return Err(transition_error(conn, claim.id, OutboxStatus::Processing).await);
    };

    if exhausted {
        Ok(FailureOutcome::DeadLettered { retry_count })
    } else {
        Ok(FailureOutcome::Retrying {
            retry_count,
            available_at,
        })
    }
}

/// Dead-letter a claimed event without further retries.
pub async fn mark_failed(conn: &mut PgConnection, claim: &Claim, error: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'failed', retry_count = retry_count + 1, last_error = $3,
            claimed_at = NULL, claim_token = NULL
        WHERE id = $1 AND status = 'processing' AND claim_token = $2
        "#,
    )
    .bind(claim.id)
    .bind(claim.token)
    .bind(error)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, claim.id, OutboxStatus::Processing).await);
    }
    Ok(())
}

/// Return events claimed longer than `stale_after` ago to pending.
pub async fn release_stale_processing(
    conn: &mut PgConnection,
    stale_after: Duration,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'pending', claimed_at = NULL, claim_token = NULL
        WHERE status = 'processing'
          AND claimed_at <= NOW() - ($1::DOUBLE PRECISION * INTERVAL '1 millisecond')
        "#,
    )
    .bind(duration_to_millis(stale_after))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Operator Operations
// ============================================================================

/// Dead-lettered events, newest first.
pub async fn list_failed(conn: &mut PgConnection, limit: i64) -> Result<Vec<OutboxEvent>> {
    let sql = format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM outbox_events
        WHERE status = 'failed'
        ORDER BY created_at DESC, seq DESC
        LIMIT $1
        "#
    );
    let rows = sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

    into_events(rows)
}

/// Return a failed event to pending with a fresh retry budget.
pub async fn replay_failed(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'pending', retry_count = 0, available_at = NOW(),
            claimed_at = NULL, claim_token = NULL
        WHERE id = $1 AND status = 'failed'
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, id, OutboxStatus::Failed).await);
    }
    Ok(())
}

/// Delete published events older than `cutoff`.
pub async fn delete_older_than(conn: &mut PgConnection, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM outbox_events
        WHERE status = 'published' AND published_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Load one event by ID.
pub async fn get_event(conn: &mut PgConnection, id: Uuid) -> Result<Option<OutboxEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1");
    sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(OutboxEvent::try_from)
        .transpose()
}

/// Count events per status.
pub async fn status_counts(conn: &mut PgConnection) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
            .fetch_all(&mut *conn)
            .await?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        counts.add(status.parse()?, count);
    }
    Ok(counts)
}

/// Build the error for a conditional update that matched no row.
///
/// A row still in the expected status was fenced out by its claim token.
async fn transition_error(
    conn: &mut PgConnection,
    id: Uuid,
    expected: OutboxStatus,
) -> OutboxError {
    let status: std::result::Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;

    match status {
        Ok(None) => OutboxError::EventNotFound(id),
        Ok(Some(actual)) => match actual.parse() {
            Ok(actual) if actual == expected => OutboxError::ClaimLost(id),
            Ok(actual) => OutboxError::InvalidTransition {
                id,
                expected,
                actual,
            },
            Err(e) => e,
        },
        Err(e) => e.into(),
    }
}

// ============================================================================
// OutboxStore Trait Implementation
// ============================================================================

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Db = Postgres;

    async fn enqueue(&self, ctx: &PgTxContext, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let mut conn = ctx.resolve(&self.pool).await?;
        enqueue(&mut conn, event).await
    }

    async fn claim_batch(&self, ctx: &PgTxContext, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = ctx.resolve(&self.pool).await?;
        claim_batch(&mut conn, limit).await
    }

    async fn mark_published(&self, ctx: &PgTxContext, claim: &Claim) -> Result<()> {
        let mut conn = ctx.resolve(&self.pool).await?;
        mark_published(&mut conn, claim).await
    }

    async fn record_failure(
        &self,
        ctx: &PgTxContext,
        claim: &Claim,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        let mut conn = ctx.resolve(&self.pool).await?;
        record_failure(&mut conn, claim, error, policy).await
    }

    async fn mark_failed(&self, ctx: &PgTxContext, claim: &Claim, error: &str) -> Result<()> {
        let mut conn = ctx.resolve(&self.pool).await?;
        mark_failed(&mut conn, claim, error).await
    }

    async fn release_stale_processing(
        &self,
        ctx: &PgTxContext,
        stale_after: Duration,
    ) -> Result<u64> {
        let mut conn = ctx.resolve(&self.pool).await?;
        release_stale_processing(&mut conn, stale_after).await
    }

    async fn list_failed(&self, ctx: &PgTxContext, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = ctx.resolve(&self.pool).await?;
        list_failed(&mut conn, limit).await
    }

    async fn replay_failed(&self, ctx: &PgTxContext, id: Uuid) -> Result<()> {
        let mut conn = ctx.resolve(&self.pool).await?;
        replay_failed(&mut conn, id).await
    }

    async fn delete_older_than(&self, ctx: &PgTxContext, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = ctx.resolve(&self.pool).await?;
        delete_older_than(&mut conn, cutoff).await
    }

    async fn get(&self, ctx: &PgTxContext, id: Uuid) -> Result<Option<OutboxEvent>> {
        let mut conn = ctx.resolve(&self.pool).await?;
        get_event(&mut conn, id).await
    }

    async fn status_counts(&self, ctx: &PgTxContext) -> Result<StatusCounts> {
        let mut conn = ctx.resolve(&self.pool).await?;
        status_counts(&mut conn).await
    }
}
