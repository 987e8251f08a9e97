// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed outbox store.
//!
//! SQLite has no row locks, so the claim is a conditional
//! `UPDATE ... WHERE id IN (subquery) AND status = 'pending' RETURNING`; the
//! engine serializes writers, which makes the statement an exclusive claim.
//! Timestamps are stored as epoch milliseconds and supplied by the caller's
//! clock.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::OutboxStore;
use crate::error::{OutboxError, Result};
use crate::event::{Claim, NewOutboxEvent, OutboxEvent, OutboxStatus, StatusCounts};
use crate::retry::{FailureOutcome, RetryPolicy, duration_to_millis};
use crate::transaction::SqliteTxContext;

const EVENT_COLUMNS: &str = "id, topic, event_type, payload, workspace_id, status, retry_count, \
     last_error, created_at, available_at, claimed_at, claim_token, published_at";

/// SQLite-backed outbox store.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    /// Create a store over an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file, apply migrations and
    /// return a store over it.
    ///
    /// The database runs in WAL mode with a busy timeout so that several
    /// pooled connections, and therefore several dispatchers, can share it.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        crate::migrations::run_sqlite(&pool).await?;
        debug!(path = %path.display(), "SQLite outbox store opened");
        Ok(Self::new(pool))
    }

    /// The store's pool; the fallback for detached contexts.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxEventRow {
    id: String,
    topic: String,
    event_type: String,
    payload: String,
    workspace_id: Option<String>,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    created_at: i64,
    available_at: i64,
    claimed_at: Option<i64>,
    claim_token: Option<String>,
    published_at: Option<i64>,
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxError;

    fn try_from(row: OutboxEventRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            topic: row.topic,
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)?,
            workspace_id: row.workspace_id.as_deref().map(parse_uuid).transpose()?,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: from_millis(row.created_at)?,
            available_at: from_millis(row.available_at)?,
            claimed_at: row.claimed_at.map(from_millis).transpose()?,
            claim_token: row.claim_token.as_deref().map(parse_uuid).transpose()?,
            published_at: row.published_at.map(from_millis).transpose()?,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| OutboxError::Decode(format!("invalid uuid '{}': {}", value, e)))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| OutboxError::Decode(format!("timestamp out of range: {}", millis)))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn into_events(rows: Vec<OutboxEventRow>) -> Result<Vec<OutboxEvent>> {
    rows.into_iter().map(OutboxEvent::try_from).collect()
}

// ============================================================================
// Producer Operations
// ============================================================================

/// Insert a new pending event.
pub async fn enqueue(conn: &mut SqliteConnection, event: NewOutboxEvent) -> Result<OutboxEvent> {
    event.validate()?;
    let id = event.id.unwrap_or_else(Uuid::new_v4);
    let created_at = event
        .created_at
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(now_millis);
    let payload = serde_json::to_string(&event.payload)?;

    let sql = format!(
        r#"
        INSERT INTO outbox_events
            (id, topic, event_type, payload, workspace_id, status, created_at, available_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(id.to_string())
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(payload)
        .bind(event.workspace_id.map(|w| w.to_string()))
        .bind(created_at)
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
pub async fn claim_batch(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<OutboxEvent>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        UPDATE outbox_events
        SET status = 'processing', claimed_at = ?1, claim_token = ?3
        WHERE id IN (
            SELECT id FROM outbox_events
            WHERE status = 'pending' AND available_at <= ?1
            ORDER BY created_at, rowid
            LIMIT ?2
        )
        AND status = 'pending'
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let rows = sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(now_millis())
        .bind(limit)
        .bind(Uuid::new_v4().to_string())
        .fetch_all(&mut *conn)
        .await?;

    let mut events = into_events(rows)?;
    events.sort_by_key(|e| e.created_at);
    Ok(events)
}

/// Move a claimed event to published.
pub async fn mark_published(conn: &mut SqliteConnection, claim: &Claim) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'published', published_at = ?3, claimed_at = NULL, claim_token = NULL
        WHERE id = ?1 AND status = 'processing' AND claim_token = ?2
        "#,
    )
    .bind(claim.id.to_string())
    .bind(claim.token.to_string())
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, claim.id, OutboxStatus::Processing).await);
    }
    Ok(())
}

/// Record a failed publish; retry with backoff or dead-letter.
pub async fn record_failure(
    conn: &mut SqliteConnection,
    claim: &Claim,
    error: &str,
    policy: &RetryPolicy,
) -> Result<FailureOutcome> {
    let retry_count = claim.retry_count + 1;
    let exhausted = policy.is_exhausted(retry_count);
    let (status, retry_at) = if exhausted {
        (OutboxStatus::Failed, None)
    } else {
        let backoff = duration_to_millis(policy.backoff_for(retry_count));
        (OutboxStatus::Pending, Some(now_millis().saturating_add(backoff)))
    };

    let available_at: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE outbox_events
        SET status = ?3,
            retry_count = ?4,
            last_error = ?5,
            claimed_at = NULL,
            claim_token = NULL,
            available_at = COALESCE(?6, available_at)
        WHERE id = ?1 AND status = 'processing' AND claim_token = ?2 AND retry_count = ?7
        RETURNING available_at
        "#,
    )
    .bind(claim.id.to_string())
    .bind(claim.token.to_string())
    .bind(status.as_str())
    .bind(retry_count)
    .bind(error)
    .bind(retry_at)
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
            available_at: from_millis(available_at)?,
        })
    }
}

/// Dead-letter a claimed event without further retries.
pub async fn mark_failed(conn: &mut SqliteConnection, claim: &Claim, error: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'failed', retry_count = retry_count + 1, last_error = ?3,
            claimed_at = NULL, claim_token = NULL
        WHERE id = ?1 AND status = 'processing' AND claim_token = ?2
        "#,
    )
    .bind(claim.id.to_string())
    .bind(claim.token.to_string())
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
    conn: &mut SqliteConnection,
    stale_after: Duration,
) -> Result<u64> {
    let threshold = now_millis().saturating_sub(duration_to_millis(stale_after));
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'pending', claimed_at = NULL, claim_token = NULL
        WHERE status = 'processing' AND claimed_at <= ?1
        "#,
    )
    .bind(threshold)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Operator Operations
// ============================================================================

/// Dead-lettered events, newest first.
pub async fn list_failed(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<OutboxEvent>> {
    let sql = format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM outbox_events
        WHERE status = 'failed'
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?1
        "#
    );
    let rows = sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

    into_events(rows)
}

/// Return a failed event to pending with a fresh retry budget.
pub async fn replay_failed(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'pending', retry_count = 0, available_at = ?2,
            claimed_at = NULL, claim_token = NULL
        WHERE id = ?1 AND status = 'failed'
        "#,
    )
    .bind(id.to_string())
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, id, OutboxStatus::Failed).await);
    }
    Ok(())
}

/// Delete published events older than `cutoff`.
pub async fn delete_older_than(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM outbox_events
        WHERE status = 'published' AND published_at < ?1
        "#,
    )
    .bind(cutoff.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Load one event by ID.
pub async fn get_event(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<OutboxEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = ?1");
    sqlx::query_as::<_, OutboxEventRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .map(OutboxEvent::try_from)
        .transpose()
}

/// Count events per status.
pub async fn status_counts(conn: &mut SqliteConnection) -> Result<StatusCounts> {
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

/// A row still in the expected status was fenced out by its claim token.
async fn transition_error(
    conn: &mut SqliteConnection,
    id: Uuid,
    expected: OutboxStatus,
) -> OutboxError {
    let status: std::result::Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = ?1")
            .bind(id.to_string())
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
impl OutboxStore for SqliteOutboxStore {
    type Db = Sqlite;

    async fn enqueue(&self, ctx: &SqliteTxContext, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let mut conn = ctx.resolve(&self.pool).await?;
        enqueue(&mut conn, event).await
    }

    async fn claim_batch(&self, ctx: &SqliteTxContext, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = ctx.resolve(&self.pool).await?;
        claim_batch(&mut conn, limit).await
    }

    async fn mark_published(&self, ctx: &SqliteTxContext, claim: &Claim) -> Result<()> {
        let mut conn = ctx.resolve(&self.pool).await?;
        mark_published(&mut conn, claim).await
    }

    async fn record_failure(
        &self,
        ctx: &SqliteTxContext,
        claim: &Claim,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        let mut conn = ctx.resolve(&self.pool).await?;
        record_failure(&mut conn, claim, error, policy).await
    }

    async fn mark_failed(&self, ctx: &SqliteTxContext, claim: &Claim, error: &str) -> Result<()> {
        let mut conn = ctx.resolve(&self.pool).await?;
        mark_failed(&mut conn, claim, error).await
    }

    async fn release_stale_processing(
        &self,
        ctx: &SqliteTxContext,
        stale_after: Duration,
    ) -> Result<u64> {
        let mut conn = ctx.resolve(&self.pool).await?;
        release_stale_processing(&mut conn, stale_after).await
    }

    async fn list_failed(&self, ctx: &SqliteTxContext, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = ctx.resolve(&self.pool).await?;
        list_failed(&mut conn, limit).await
    }

    async fn replay_failed(&self, ctx: &SqliteTxContext, id: Uuid) -> Result<()> {
        let mut conn = ctx.resolve(&self.pool).await?;
        replay_failed(&mut conn, id).await
    }

    async fn delete_older_than(&self, ctx: &SqliteTxContext, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = ctx.resolve(&self.pool).await?;
        delete_older_than(&mut conn, cutoff).await
    }

    async fn get(&self, ctx: &SqliteTxContext, id: Uuid) -> Result<Option<OutboxEvent>> {
        let mut conn = ctx.resolve(&self.pool).await?;
        get_event(&mut conn, id).await
    }

    async fn status_counts(&self, ctx: &SqliteTxContext) -> Result<StatusCounts> {
        let mut conn = ctx.resolve(&self.pool).await?;
        status_counts(&mut conn).await
    }
}
