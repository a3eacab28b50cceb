//! Job persistence: creation, parameters, state history, expiry touches.
//!
//! Foreground operations: every error propagates to the caller unmodified,
//! except that missing rows read back as `None`/empty. All expiry
//! arithmetic happens on the backend clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use taskforge_core::{JobId, JobRecord, JobStateRecord, NewState, StorageResult};

use crate::session::buffered::{apply_write, PendingWrite};
use crate::session::{map_sqlx_error, Session, Storage};

/// Job storage operations consumed by the host scheduler.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job and its initial parameters in one transaction; returns
    /// the backend-assigned id.
    async fn create_job(
        &self,
        invocation_data: &str,
        arguments: &str,
        parameters: &[(String, String)],
        expire_in: Option<Duration>,
    ) -> StorageResult<JobId>;

    async fn get_job(&self, id: JobId) -> StorageResult<Option<JobRecord>>;

    /// Upsert a `(job, name)` parameter.
    async fn set_job_parameter(
        &self,
        id: JobId,
        name: &str,
        value: Option<&str>,
    ) -> StorageResult<()>;

    async fn get_job_parameter(&self, id: JobId, name: &str) -> StorageResult<Option<String>>;

    /// Append a history row and update the job's current-state columns.
    async fn set_job_state(&self, id: JobId, state: NewState) -> StorageResult<()>;

    /// Append a history row without touching the current state.
    async fn add_job_state(&self, id: JobId, state: NewState) -> StorageResult<()>;

    /// Full state history, oldest first.
    async fn get_state_history(&self, id: JobId) -> StorageResult<Vec<JobStateRecord>>;

    /// Schedule the job (and, via the sweep cascade, its children) for
    /// expiration `ttl` from the backend's now.
    async fn set_job_expiry(&self, id: JobId, ttl: Duration) -> StorageResult<()>;

    /// Clear the job's expiry so the sweeper never removes it.
    async fn persist_job(&self, id: JobId) -> StorageResult<()>;
}

#[async_trait]
impl JobStore for Storage {
    #[instrument(skip(self, invocation_data, arguments, parameters))]
    async fn create_job(
        &self,
        invocation_data: &str,
        arguments: &str,
        parameters: &[(String, String)],
        expire_in: Option<Duration>,
    ) -> StorageResult<JobId> {
        let mut session = self.begin_default().await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO taskforge_job (invocation_data, arguments, expire_at) \
             VALUES ($1, $2, CASE WHEN $3::float8 IS NULL THEN NULL \
                                  ELSE now() + make_interval(secs => $3) END) \
             RETURNING id",
        )
        .bind(invocation_data)
        .bind(arguments)
        .bind(expire_in.map(|d| d.as_secs_f64()))
        .fetch_one(session.conn())
        .await
        .map_err(|e| map_sqlx_error("job_insert", e))?;

        let job_id = JobId::from_raw(id);
        for (name, value) in parameters {
            apply_write(
                &mut session,
                &PendingWrite::UpsertJobParameter {
                    job_id,
                    name: name.clone(),
                    value: Some(value.clone()),
                },
            )
            .await?;
        }

        session.commit().await?;
        Ok(job_id)
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<JobRecord>> {
        let mut session = self.begin_default().await?;
        let job = fetch_job(&mut session, id).await?;
        session.commit().await?;
        Ok(job)
    }

    async fn set_job_parameter(
        &self,
        id: JobId,
        name: &str,
        value: Option<&str>,
    ) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::UpsertJobParameter {
                job_id: id,
                name: name.to_string(),
                value: value.map(str::to_string),
            },
        )
        .await?;
        session.commit().await
    }

    async fn get_job_parameter(&self, id: JobId, name: &str) -> StorageResult<Option<String>> {
        self.ensure_schema().await?;
        let value: Option<Option<String>> = sqlx::query_scalar(
            "SELECT \"value\" FROM taskforge_job_parameter WHERE job_id = $1 AND name = $2",
        )
        .bind(id.as_i64())
        .bind(name)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("job_parameter_get", e))?;
        Ok(value.flatten())
    }

    #[instrument(skip(self, state), fields(state = %state.name))]
    async fn set_job_state(&self, id: JobId, state: NewState) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::AppendJobState {
                job_id: id,
                state,
                set_current: true,
            },
        )
        .await?;
        session.commit().await
    }

    async fn add_job_state(&self, id: JobId, state: NewState) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::AppendJobState {
                job_id: id,
                state,
                set_current: false,
            },
        )
        .await?;
        session.commit().await
    }

    async fn get_state_history(&self, id: JobId) -> StorageResult<Vec<JobStateRecord>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT id, job_id, name, reason, data, created_at \
             FROM taskforge_job_state WHERE job_id = $1 ORDER BY id",
        )
        .bind(id.as_i64())
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("job_state_history", e))?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            history.push(job_state_from_row(&row)?);
        }
        Ok(history)
    }

    async fn set_job_expiry(&self, id: JobId, ttl: Duration) -> StorageResult<()> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE taskforge_job \
             SET expire_at = now() + make_interval(secs => $2) WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("job_set_expiry", e))?;
        Ok(())
    }

    async fn persist_job(&self, id: JobId) -> StorageResult<()> {
        self.ensure_schema().await?;
        sqlx::query("UPDATE taskforge_job SET expire_at = NULL WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("job_persist", e))?;
        Ok(())
    }
}

/// Load one job inside an existing session. Used by the buffered mode's
/// tracked loads as well as the direct read path.
pub(crate) async fn fetch_job(
    session: &mut Session,
    id: JobId,
) -> StorageResult<Option<JobRecord>> {
    let row = sqlx::query(
        "SELECT id, invocation_data, arguments, created_at, expire_at, \
                state_name, state_reason, state_data \
         FROM taskforge_job WHERE id = $1",
    )
    .bind(id.as_i64())
    .fetch_optional(session.conn())
    .await
    .map_err(|e| map_sqlx_error("job_fetch", e))?;

    row.map(|row| job_from_row(&row)).transpose()
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> StorageResult<JobRecord> {
    let read = |e: sqlx::Error| map_sqlx_error("job_row", e);
    Ok(JobRecord {
        id: JobId::from_raw(row.try_get::<i64, _>("id").map_err(read)?),
        invocation_data: row.try_get("invocation_data").map_err(read)?,
        arguments: row.try_get("arguments").map_err(read)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(read)?,
        expire_at: row.try_get("expire_at").map_err(read)?,
        state_name: row.try_get("state_name").map_err(read)?,
        state_reason: row.try_get("state_reason").map_err(read)?,
        state_data: row.try_get("state_data").map_err(read)?,
    })
}

fn job_state_from_row(row: &sqlx::postgres::PgRow) -> StorageResult<JobStateRecord> {
    let read = |e: sqlx::Error| map_sqlx_error("job_state_row", e);
    Ok(JobStateRecord {
        id: row.try_get("id").map_err(read)?,
        job_id: JobId::from_raw(row.try_get::<i64, _>("job_id").map_err(read)?),
        name: row.try_get("name").map_err(read)?,
        reason: row.try_get("reason").map_err(read)?,
        data: row.try_get("data").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}
