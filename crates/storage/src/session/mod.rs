//! Unit-of-work layer.
//!
//! Every operation against the backend runs inside a [`Session`]: a
//! connection-bound transaction at a caller-selectable isolation level.
//! Two execution modes exist: the direct mode here (each statement executes
//! immediately, minimal bookkeeping) and the buffered mode in
//! [`buffered`] (pending writes tracked and flushed on demand).
//!
//! ## Thread safety
//!
//! [`Storage`] is cheaply cloneable and shareable; a [`Session`] is owned
//! by exactly one logical operation for its duration and is never shared
//! across concurrent callers.

pub mod buffered;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use taskforge_core::{EntityKind, StorageError, StorageResult};

use crate::config::StorageConfig;
use crate::schema;
use crate::statements::{StatementCache, StatementKind};

pub use buffered::{BufferedSession, PendingWrite};

/// Transaction isolation level requested for a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    fn set_statement(&self) -> String {
        format!("SET TRANSACTION ISOLATION LEVEL {}", self.as_str())
    }
}

impl core::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
enum BootstrapState {
    Pending,
    Done,
    Failed(String),
}

/// Handle to the relational backend.
///
/// Owns the connection pool, the statement cache, and the bootstrap-once
/// flag. Constructed explicitly and passed to collaborators; no ambient
/// globals, so independent instances coexist in one process.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
    config: Arc<StorageConfig>,
    statements: Arc<StatementCache>,
    bootstrap: Arc<tokio::sync::Mutex<BootstrapState>>,
}

impl Storage {
    pub fn new(pool: PgPool, config: StorageConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            statements: Arc::new(StatementCache::new()),
            bootstrap: Arc::new(tokio::sync::Mutex::new(BootstrapState::Pending)),
        }
    }

    /// Connect to the backend and wrap the pool.
    pub async fn connect(url: &str, config: StorageConfig) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, config))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Verify/create the schema. Attempted at most once per instance: a
    /// failed attempt is remembered and surfaced until [`Self::rearm_bootstrap`].
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let mut state = self.bootstrap.lock().await;
        match &*state {
            BootstrapState::Done => Ok(()),
            BootstrapState::Failed(msg) => Err(StorageError::SchemaBootstrap(msg.clone())),
            BootstrapState::Pending => match schema::create_all(&self.pool).await {
                Ok(()) => {
                    debug!("schema bootstrap complete");
                    *state = BootstrapState::Done;
                    Ok(())
                }
                Err(e) => {
                    let msg = e.to_string();
                    *state = BootstrapState::Failed(msg.clone());
                    Err(StorageError::SchemaBootstrap(msg))
                }
            },
        }
    }

    /// Allow the next session open to attempt schema bootstrap again.
    pub async fn rearm_bootstrap(&self) {
        *self.bootstrap.lock().await = BootstrapState::Pending;
    }

    /// Open a session at the instance's default isolation level.
    pub async fn begin_default(&self) -> StorageResult<Session> {
        self.begin(self.config.default_isolation).await
    }

    /// Open a session: take a connection, `BEGIN`, set the isolation level.
    #[instrument(skip(self))]
    pub async fn begin(&self, isolation: IsolationLevel) -> StorageResult<Session> {
        self.ensure_schema().await?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query(&isolation.set_statement())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;
        Ok(Session {
            tx,
            isolation,
            statements: self.statements.clone(),
        })
    }

    /// Run `f` inside a direct-mode session; commit on `Ok`, roll back on
    /// `Err`.
    pub async fn with_session<T, F>(&self, isolation: IsolationLevel, f: F) -> StorageResult<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, StorageResult<T>>,
    {
        let mut session = self.begin(isolation).await?;
        match f(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(e) => {
                session.rollback().await;
                Err(e)
            }
        }
    }

    /// Run `f` inside a buffered session; pending writes are flushed before
    /// commit, discarded on error.
    pub async fn with_buffered_session<T, F>(
        &self,
        isolation: IsolationLevel,
        f: F,
    ) -> StorageResult<T>
    where
        F: for<'s> FnOnce(&'s mut BufferedSession) -> BoxFuture<'s, StorageResult<T>>,
    {
        let session = self.begin(isolation).await?;
        let mut buffered = BufferedSession::new(session);
        match f(&mut buffered).await {
            Ok(value) => {
                buffered.commit().await?;
                Ok(value)
            }
            Err(e) => {
                buffered.rollback().await;
                Err(e)
            }
        }
    }

    /// Current backend time, outside any session.
    pub async fn now(&self) -> StorageResult<DateTime<Utc>> {
        sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("now", e))
    }
}

impl core::fmt::Debug for Storage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Storage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A connection-bound transaction.
///
/// Dropping a session without committing rolls the transaction back
/// (backend-side), which is the correct outcome on every error path.
pub struct Session {
    tx: Transaction<'static, Postgres>,
    isolation: IsolationLevel,
    statements: Arc<StatementCache>,
}

impl Session {
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// The underlying connection, for typed `sqlx` queries.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub(crate) fn statements(&self) -> Arc<StatementCache> {
        self.statements.clone()
    }

    /// Guard for operations that reuse an ambient session: a different
    /// isolation level than the session's is a configuration error.
    pub fn require_isolation(&self, requested: IsolationLevel) -> StorageResult<()> {
        if requested == self.isolation {
            Ok(())
        } else {
            Err(StorageError::IsolationConflict {
                requested: requested.to_string(),
                active: self.isolation.to_string(),
            })
        }
    }

    /// Current backend time as seen by this transaction.
    pub async fn now(&mut self) -> StorageResult<DateTime<Utc>> {
        sqlx::query_scalar("SELECT now()")
            .fetch_one(self.conn())
            .await
            .map_err(|e| map_sqlx_error("now", e))
    }

    /// Execute a raw statement with no parameters; returns affected rows.
    pub async fn execute_raw(&mut self, sql: &str) -> StorageResult<u64> {
        let result = sqlx::query(sql)
            .execute(self.conn())
            .await
            .map_err(|e| map_sqlx_error("execute_raw", e))?;
        Ok(result.rows_affected())
    }

    /// Delete rows of `kind` whose id is in `ids`; returns removed count.
    pub async fn delete_by_id_set(
        &mut self,
        kind: EntityKind,
        ids: &[i64],
    ) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = self.statements.sql(kind, StatementKind::DeleteByIdSet);
        let result = sqlx::query(&sql)
            .bind(ids)
            .execute(self.conn())
            .await
            .map_err(|e| map_sqlx_error("delete_by_id_set", e))?;
        Ok(result.rows_affected())
    }

    pub async fn commit(self) -> StorageResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    /// Roll back explicitly. Errors are logged, not surfaced: the caller is
    /// already on an error path and the backend discards the transaction
    /// when the connection returns to the pool anyway.
    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            tracing::warn!(error = %e, "transaction rollback failed");
        }
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

/// Map sqlx errors into the storage taxonomy.
///
/// Serialization failures (40001), deadlocks (40P01), cancelled statements
/// (57014), and connection/pool trouble are transient: a retry with a fresh
/// attempt is expected to succeed. Everything else surfaces as a backend
/// error.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") | Some("57014") => {
                    StorageError::TransientBackend(msg)
                }
                _ => StorageError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::TransientBackend(format!("{operation}: {err}"))
        }
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) => {
            StorageError::TransientBackend(format!("{operation}: {err}"))
        }
        sqlx::Error::RowNotFound => {
            StorageError::Backend(format!("{operation}: unexpected missing row"))
        }
        other => StorageError::Backend(format!("{operation}: {other}")),
    }
}

/// True when the raw sqlx error is a unique-constraint violation (23505).
/// The lock manager reads this as "another acquirer won the race".
pub(crate) fn sqlx_is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_levels_render_standard_sql() {
        assert_eq!(
            IsolationLevel::ReadCommitted.set_statement(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(
            IsolationLevel::Serializable.set_statement(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        );
    }

    #[test]
    fn pool_errors_map_to_transient() {
        let err = map_sqlx_error("op", sqlx::Error::PoolClosed);
        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        let err = map_sqlx_error("op", sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
    }
}
