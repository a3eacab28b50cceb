//! Postgres queue provider.
//!
//! The claim is one statement: an `UPDATE .. RETURNING` whose target row is
//! picked by a `FOR UPDATE SKIP LOCKED` subquery. The backend's row-update
//! atomicity resolves races — if another process claimed the row first, the
//! update affects zero rows and the caller simply retries.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

use taskforge_core::{JobId, StorageResult};

use crate::queue::{ClaimedEntry, QueueProvider};
use crate::session::{map_sqlx_error, Storage};

const CLAIM_SQL: &str = "UPDATE taskforge_job_queue \
     SET fetched_at = now() \
     WHERE id = (\
         SELECT id FROM taskforge_job_queue \
         WHERE queue = ANY($1) \
           AND (fetched_at IS NULL OR fetched_at < now() - make_interval(secs => $2)) \
         ORDER BY id \
         FOR UPDATE SKIP LOCKED \
         LIMIT 1\
     ) \
     RETURNING id, job_id, queue";

/// Queue rows in `taskforge_job_queue`.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    storage: Storage,
    name: String,
}

impl PostgresJobQueue {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            name: "postgres".to_string(),
        }
    }

    /// A distinctly named provider, for hosts running several backends.
    pub fn named(storage: Storage, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
        }
    }
}

#[async_trait]
impl QueueProvider for PostgresJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job_id: JobId, queue: &str) -> StorageResult<()> {
        self.storage.ensure_schema().await?;
        sqlx::query("INSERT INTO taskforge_job_queue (job_id, queue) VALUES ($1, $2)")
            .bind(job_id.as_i64())
            .bind(queue)
            .execute(self.storage.pool())
            .await
            .map_err(|e| map_sqlx_error("queue_enqueue", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn try_claim(
        &self,
        queues: &[String],
        staleness: Duration,
    ) -> StorageResult<Option<ClaimedEntry>> {
        self.storage.ensure_schema().await?;
        let row = sqlx::query(CLAIM_SQL)
            .bind(queues)
            .bind(staleness.as_secs_f64())
            .fetch_optional(self.storage.pool())
            .await
            .map_err(|e| map_sqlx_error("queue_claim", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entry_id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("queue_claim_row", e))?;
        let job_id: i64 = row
            .try_get("job_id")
            .map_err(|e| map_sqlx_error("queue_claim_row", e))?;
        let queue: String = row
            .try_get("queue")
            .map_err(|e| map_sqlx_error("queue_claim_row", e))?;
        Ok(Some(ClaimedEntry {
            entry_id,
            job_id: JobId::from_raw(job_id),
            queue,
        }))
    }

    async fn acknowledge(&self, entry_id: i64) -> StorageResult<()> {
        sqlx::query("DELETE FROM taskforge_job_queue WHERE id = $1")
            .bind(entry_id)
            .execute(self.storage.pool())
            .await
            .map_err(|e| map_sqlx_error("queue_acknowledge", e))?;
        Ok(())
    }

    async fn requeue(&self, entry_id: i64) -> StorageResult<()> {
        sqlx::query("UPDATE taskforge_job_queue SET fetched_at = NULL WHERE id = $1")
            .bind(entry_id)
            .execute(self.storage.pool())
            .await
            .map_err(|e| map_sqlx_error("queue_requeue", e))?;
        Ok(())
    }
}
