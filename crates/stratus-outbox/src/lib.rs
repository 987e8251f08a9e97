// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Outbox - Transactional Outbox
//!
//! This crate records notification events in the same local transaction as
//! the business change that caused them, so a state change and its event
//! either both commit or both roll back. A separate relay (`stratus-relay`)
//! later drains the table to the message bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      Business service        │
//! │ (workspaces, VMs, networks)  │
//! └──────────────┬───────────────┘
//!                │ run_in_transaction(ctx, |tx| ...)
//!                ▼
//! ┌──────────────────────────────┐        ┌──────────────────────────┐
//! │      TransactionManager      │───────►│  domain rows + one row   │
//! │   TxContext carries the tx   │        │    in outbox_events      │
//! └──────────────────────────────┘        └────────────┬─────────────┘
//!                                                      │ claim_batch
//!                                                      ▼
//!                                         ┌──────────────────────────┐
//!                                         │   stratus-relay          │
//!                                         │   dispatcher replicas    │
//!                                         └──────────────────────────┘
//! ```
//!
//! # Event Status State Machine
//!
//! ```text
//!   ┌─────────┐  claim   ┌────────────┐  publish ok  ┌───────────┐
//!   │ PENDING │─────────►│ PROCESSING │─────────────►│ PUBLISHED │──► swept after retention
//!   └─────────┘          └─────┬──────┘              └───────────┘
//!     ▲     ▲                  │
//!     │     │ retry / stale    │ retries exhausted or rejected
//!     │     └──────────────────┤
//!     │                        ▼
//!     │  operator replay  ┌────────┐
//!     └───────────────────│ FAILED │
//!                         └────────┘
//! ```
//!
//! `published_at` is set if and only if the status is `published`; the table
//! carries a CHECK constraint for it in both backends.
//!
//! # Backends
//!
//! | Backend | Claim | Use |
//! |---------|-------|-----|
//! | [`PostgresOutboxStore`] | `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING` | production |
//! | [`SqliteOutboxStore`] | `UPDATE ... WHERE id IN (subquery) AND status = 'pending' RETURNING` | embedded, tests |
//!
//! # Modules
//!
//! - [`event`]: event model and status machine
//! - [`transaction`]: transaction scope
//! - [`store`]: the [`OutboxStore`] trait and its backends
//! - [`retry`]: retry policy and failure outcomes
//! - [`topics`]: resource topic naming
//! - [`migrations`]: embedded schema migrations
//! - [`error`]: error types

#![deny(missing_docs)]

/// Error types with stable error codes.
pub mod error;

/// Outbox event model.
pub mod event;

/// Embedded schema migrations.
pub mod migrations;

/// Retry policy for failed publishes.
pub mod retry;

/// Outbox store trait and backends.
pub mod store;

/// Resource topic naming.
pub mod topics;

/// Transaction scope and manager.
pub mod transaction;

pub use error::{OutboxError, Result};
pub use event::{Claim, NewOutboxEvent, OutboxEvent, OutboxStatus, StatusCounts};
pub use retry::{FailureOutcome, RetryPolicy};
pub use store::{OutboxStore, PostgresOutboxStore, SqliteOutboxStore};
pub use transaction::{
    Handle, PgTransactionManager, PgTxContext, SqliteTransactionManager, SqliteTxContext,
    TransactionManager, TxContext,
};
