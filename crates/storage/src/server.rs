//! Server registry: worker processes announce themselves, heartbeat, and
//! get purged once their heartbeat goes stale.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use taskforge_core::{ServerId, StorageResult};

use crate::session::{map_sqlx_error, Storage};

/// Server registry operations consumed by the host scheduler.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Register (or re-register) a server with its serialized context.
    async fn announce(&self, id: &ServerId, data: &str) -> StorageResult<()>;

    /// Refresh the heartbeat. Returns `false` for an unknown server.
    async fn heartbeat(&self, id: &ServerId) -> StorageResult<bool>;

    async fn remove(&self, id: &ServerId) -> StorageResult<()>;

    /// Delete servers whose last heartbeat is older than `older_than`.
    /// Returns the removed count.
    async fn purge_timed_out(&self, older_than: Duration) -> StorageResult<u64>;
}

#[async_trait]
impl ServerRegistry for Storage {
    async fn announce(&self, id: &ServerId, data: &str) -> StorageResult<()> {
        self.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO taskforge_server (id, data, last_heartbeat) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, last_heartbeat = now()",
        )
        .bind(id.as_str())
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("server_announce", e))?;
        Ok(())
    }

    async fn heartbeat(&self, id: &ServerId) -> StorageResult<bool> {
        self.ensure_schema().await?;
        let result = sqlx::query(
            "UPDATE taskforge_server SET last_heartbeat = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("server_heartbeat", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, id: &ServerId) -> StorageResult<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM taskforge_server WHERE id = $1")
            .bind(id.as_str())
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("server_remove", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_timed_out(&self, older_than: Duration) -> StorageResult<u64> {
        self.ensure_schema().await?;
        let result = sqlx::query(
            "DELETE FROM taskforge_server \
             WHERE last_heartbeat < now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("server_purge", e))?;
        Ok(result.rows_affected())
    }
}
