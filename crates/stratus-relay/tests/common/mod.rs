// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for relay integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::SqlitePool;
use stratus_outbox::{
    NewOutboxEvent, OutboxError, OutboxEvent, OutboxStatus, OutboxStore, RetryPolicy,
    SqliteOutboxStore, SqliteTransactionManager, SqliteTxContext,
};
use stratus_relay::{DispatcherConfig, MockPublisher, RelayDispatcher};
use uuid::Uuid;

/// A migrated SQLite store on a temp file that lives as long as the context.
pub struct TestContext {
    pub store: Arc<SqliteOutboxStore>,
    pub txm: SqliteTransactionManager,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = SqliteOutboxStore::from_path(temp_dir.path().join("relay.db"))
            .await
            .expect("Failed to open SQLite outbox store");

        sqlx::query("CREATE TABLE vms (id TEXT PRIMARY KEY NOT NULL, name TEXT NOT NULL)")
            .execute(store.pool())
            .await
            .expect("Failed to create vms table");

        let txm = SqliteTransactionManager::new(store.pool().clone());
        Self {
            store: Arc::new(store),
            txm,
            _temp_dir: temp_dir,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    pub async fn count_vms(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM vms")
            .fetch_one(self.pool())
            .await
            .expect("Failed to count vms")
    }

    /// Enqueue outside any transaction.
    pub async fn enqueue(&self, event: NewOutboxEvent) -> OutboxEvent {
        self.store
            .enqueue(&SqliteTxContext::detached(), event)
            .await
            .expect("Failed to enqueue event")
    }

    pub async fn get(&self, id: Uuid) -> OutboxEvent {
        self.store
            .get(&SqliteTxContext::detached(), id)
            .await
            .expect("Failed to load event")
            .expect("Event should exist")
    }

    pub async fn count_with_status(&self, status: OutboxStatus) -> i64 {
        let counts = self
            .store
            .status_counts(&SqliteTxContext::detached())
            .await
            .expect("Failed to count events");
        match status {
            OutboxStatus::Pending => counts.pending,
            OutboxStatus::Processing => counts.processing,
            OutboxStatus::Published => counts.published,
            OutboxStatus::Failed => counts.failed,
        }
    }

    pub fn dispatcher(
        &self,
        publisher: Arc<MockPublisher>,
        config: DispatcherConfig,
    ) -> RelayDispatcher<SqliteOutboxStore> {
        RelayDispatcher::new(self.store.clone(), publisher, config)
    }
}

/// Dispatcher settings for tests: fast polling, no backoff delay.
pub fn fast_config(max_retries: i32) -> DispatcherConfig {
    DispatcherConfig {
        batch_size: 10,
        poll_interval: Duration::from_millis(20),
        max_in_flight: 4,
        claim_timeout: Duration::from_secs(5),
        publish_timeout: Duration::from_secs(5),
        retry: RetryPolicy::immediate(max_retries),
        stale_after: Duration::from_secs(300),
        stale_check_interval: Duration::from_secs(60),
    }
}

/// Insert a VM row through the context's unit of work.
pub async fn insert_vm(
    ctx: &SqliteTxContext,
    pool: &SqlitePool,
    id: &str,
    name: &str,
) -> Result<(), OutboxError> {
    let mut conn = ctx.resolve(pool).await?;
    sqlx::query("INSERT INTO vms (id, name) VALUES (?1, ?2)")
        .bind(id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub fn vm_created(vm_id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new("vm-events", "vm-created", json!({ "vm_id": vm_id }))
}

pub fn new_vm_id() -> String {
    format!("vm-{}", Uuid::new_v4())
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
