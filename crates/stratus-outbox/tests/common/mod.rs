// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for outbox integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use stratus_outbox::{
    Claim, NewOutboxEvent, OutboxError, OutboxEvent, SqliteOutboxStore, SqliteTransactionManager,
    SqliteTxContext,
};
use uuid::Uuid;

/// A migrated SQLite store on a temp file that lives as long as the context.
pub struct TestContext {
    pub store: SqliteOutboxStore,
    pub txm: SqliteTransactionManager,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = SqliteOutboxStore::from_path(temp_dir.path().join("outbox.db"))
            .await
            .expect("Failed to open SQLite outbox store");

        sqlx::query("CREATE TABLE vms (id TEXT PRIMARY KEY NOT NULL, name TEXT NOT NULL)")
            .execute(store.pool())
            .await
            .expect("Failed to create vms table");

        let txm = SqliteTransactionManager::new(store.pool().clone());
        Self {
            store,
            txm,
            _temp_dir: temp_dir,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    pub async fn count_events(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events")
            .fetch_one(self.pool())
            .await
            .expect("Failed to count events")
    }

    pub async fn count_vms(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM vms")
            .fetch_one(self.pool())
            .await
            .expect("Failed to count vms")
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

/// The claim on `id` among freshly claimed events.
pub fn claim_of(claimed: &[OutboxEvent], id: Uuid) -> Claim {
    claimed
        .iter()
        .find(|e| e.id == id)
        .and_then(OutboxEvent::claim)
        .expect("Event should be claimed")
}

pub fn vm_created(vm_id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new("vm-events", "vm-created", json!({ "vm_id": vm_id }))
}

/// An event with an explicit enqueue time, so ordering is deterministic.
pub fn vm_created_at(vm_id: &str, created_at: DateTime<Utc>) -> NewOutboxEvent {
    vm_created(vm_id).with_created_at(created_at)
}

pub fn new_vm_id() -> String {
    format!("vm-{}", Uuid::new_v4())
}
