// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction scope.
//!
//! A [`TxContext`] is passed explicitly to every store operation. It either
//! carries an open unit of work, in which case the operation runs on that
//! transaction's connection, or it is detached and the operation runs on an
//! auto-committing connection from the pool.
//!
//! ```ignore
//! let txm = TransactionManager::new(pool.clone());
//! txm.run_in_transaction(&TxContext::detached(), |tx| async move {
//!     vms::insert(&tx, &vm).await?;
//!     store.enqueue(&tx, NewOutboxEvent::new("vm-events", "vm-created", payload)).await?;
//!     Ok::<_, OutboxError>(())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use sqlx::pool::PoolConnection;
use sqlx::{Database, Pool, Postgres, Sqlite, Transaction};
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, error};

use crate::error::{OutboxError, Result};

type Slot<DB> = Mutex<Option<Transaction<'static, DB>>>;

/// Context carrying the current unit of work, if any.
///
/// Clones share the same unit of work. Once committed or rolled back the
/// context stays bound but is no longer active.
pub struct TxContext<DB: Database> {
    unit: Option<Arc<Slot<DB>>>,
}

/// Transaction context for PostgreSQL.
pub type PgTxContext = TxContext<Postgres>;

/// Transaction context for SQLite.
pub type SqliteTxContext = TxContext<Sqlite>;

impl<DB: Database> Clone for TxContext<DB> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit.clone(),
        }
    }
}

impl<DB: Database> Default for TxContext<DB> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<DB: Database> std::fmt::Debug for TxContext<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext")
            .field("bound", &self.unit.is_some())
            .finish()
    }
}

impl<DB: Database> TxContext<DB> {
    /// A context with no unit of work; operations auto-commit.
    pub fn detached() -> Self {
        Self { unit: None }
    }

    fn bound(tx: Transaction<'static, DB>) -> Self {
        Self {
            unit: Some(Arc::new(Mutex::new(Some(tx)))),
        }
    }

    /// Whether the context carries a unit of work that is still open.
    pub async fn is_active(&self) -> bool {
        match &self.unit {
            Some(unit) => unit.lock().await.is_some(),
            None => false,
        }
    }

    /// Get a connection for one operation.
    ///
    /// Returns the open transaction's connection when the context is bound,
    /// otherwise a pooled connection from `fallback`. A bound context whose
    /// transaction was already finalized yields
    /// [`OutboxError::NoActiveTransaction`].
    ///
    /// The returned handle holds the unit of work exclusively; drop it before
    /// committing or rolling back the same context.
    pub async fn resolve(&self, fallback: &Pool<DB>) -> Result<Handle<DB>> {
        match &self.unit {
            Some(unit) => {
                let guard = unit.clone().lock_owned().await;
                OwnedMutexGuard::try_map(guard, |slot| slot.as_deref_mut())
                    .map(Handle::Transaction)
                    .map_err(|_| OutboxError::NoActiveTransaction)
            }
            None => Ok(Handle::Pooled(fallback.acquire().await?)),
        }
    }

    async fn take(&self) -> Result<Transaction<'static, DB>> {
        let unit = self.unit.as_ref().ok_or(OutboxError::NoActiveTransaction)?;
        unit.lock()
            .await
            .take()
            .ok_or(OutboxError::NoActiveTransaction)
    }
}

/// Connection handle returned by [`TxContext::resolve`].
pub enum Handle<DB: Database> {
    /// The connection of the context's open transaction.
    Transaction(OwnedMappedMutexGuard<Option<Transaction<'static, DB>>, DB::Connection>),
    /// An auto-committing pooled connection.
    Pooled(PoolConnection<DB>),
}

impl<DB: Database> Handle<DB> {
    /// Whether statements on this handle join a transaction.
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

impl<DB: Database> Deref for Handle<DB> {
    type Target = DB::Connection;

    fn deref(&self) -> &DB::Connection {
        match self {
            Self::Transaction(guard) => &**guard,
            Self::Pooled(conn) => &**conn,
        }
    }
}

impl<DB: Database> DerefMut for Handle<DB> {
    fn deref_mut(&mut self) -> &mut DB::Connection {
        match self {
            Self::Transaction(guard) => &mut **guard,
            Self::Pooled(conn) => &mut **conn,
        }
    }
}

/// Opens and finalizes units of work on a pool.
pub struct TransactionManager<DB: Database> {
    pool: Pool<DB>,
}

/// Transaction manager for PostgreSQL.
pub type PgTransactionManager = TransactionManager<Postgres>;

/// Transaction manager for SQLite.
pub type SqliteTransactionManager = TransactionManager<Sqlite>;

impl<DB: Database> Clone for TransactionManager<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<DB: Database> TransactionManager<DB> {
    /// Create a manager over `pool`.
    pub fn new(pool: Pool<DB>) -> Self {
        Self { pool }
    }

    /// The underlying pool; also the fallback for detached contexts.
    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }

    /// Open a new unit of work and return a context carrying it.
    pub async fn begin(&self) -> Result<TxContext<DB>> {
        let tx = self.pool.begin().await?;
        debug!("Transaction begun");
        Ok(TxContext::bound(tx))
    }

    /// Commit the unit of work carried by `ctx`.
    pub async fn commit(&self, ctx: &TxContext<DB>) -> Result<()> {
        let tx = ctx.take().await?;
        tx.commit().await?;
        debug!("Transaction committed");
        Ok(())
    }

    /// Roll back the unit of work carried by `ctx`.
    pub async fn rollback(&self, ctx: &TxContext<DB>) -> Result<()> {
        let tx = ctx.take().await?;
        tx.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    /// Run `f` inside a unit of work.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err` or
    /// panics; a panic is resumed after the rollback. When `ctx` already
    /// carries an open unit of work, `f` joins it and the outer scope decides
    /// the outcome.
    pub async fn run_in_transaction<F, Fut, T, E>(
        &self,
        ctx: &TxContext<DB>,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TxContext<DB>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<OutboxError>,
    {
        if ctx.is_active().await {
            return f(ctx.clone()).await;
        }

        let tx_ctx = self.begin().await?;
        match AssertUnwindSafe(f(tx_ctx.clone())).catch_unwind().await {
            Ok(Ok(value)) => {
                self.commit(&tx_ctx).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback_after_failure(&tx_ctx).await;
                Err(err)
            }
            Err(panic) => {
                self.rollback_after_failure(&tx_ctx).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn rollback_after_failure(&self, ctx: &TxContext<DB>) {
        match self.rollback(ctx).await {
            Ok(()) | Err(OutboxError::NoActiveTransaction) => {}
            Err(e) => error!(error = %e, "Failed to roll back transaction"),
        }
    }
}
