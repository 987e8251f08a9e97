// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations for the outbox table.
//!
//! Services embedding the outbox call these on startup, before the first
//! producer transaction.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! stratus_outbox::migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// PostgreSQL outbox migrations.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite outbox migrations.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Apply pending PostgreSQL migrations. Already-applied ones are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Apply pending SQLite migrations. Already-applied ones are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
