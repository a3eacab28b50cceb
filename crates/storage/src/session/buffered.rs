//! Buffered execution mode.
//!
//! A [`BufferedSession`] wraps a direct session and records pending writes
//! as typed operations instead of executing them immediately. Loaded jobs
//! are tracked so repeated reads inside one unit of work hit the cache.
//! `flush` applies pending writes in queue order; `commit` flushes first.
//! Suited to multi-step read-modify-write sequences; for high-volume batch
//! deletes use the direct mode.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskforge_core::{EntityKind, JobId, JobRecord, KeyKind, NewState, StorageResult};

use crate::session::{map_sqlx_error, Session};
use crate::statements::StatementKind;

/// A write recorded by the buffered mode, applied on flush.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    UpsertJobParameter {
        job_id: JobId,
        name: String,
        value: Option<String>,
    },
    AppendJobState {
        job_id: JobId,
        state: NewState,
        /// Also update the job's denormalized current-state columns.
        set_current: bool,
    },
    SetJobExpiry {
        job_id: JobId,
        expire_at: Option<DateTime<Utc>>,
    },
    UpsertHashField {
        key: String,
        field: String,
        value: Option<String>,
    },
    PushListValue {
        key: String,
        value: Option<String>,
    },
    RemoveListValue {
        key: String,
        value: String,
    },
    UpsertSetValue {
        key: String,
        value: String,
        score: f64,
    },
    RemoveSetValue {
        key: String,
        value: String,
    },
    IncrementCounter {
        key: String,
        delta: i64,
        expire_at: Option<DateTime<Utc>>,
    },
    SetKeyExpiry {
        kind: KeyKind,
        key: String,
        expire_at: Option<DateTime<Utc>>,
    },
    DeleteKey {
        kind: KeyKind,
        key: String,
    },
}

/// Session wrapper that tracks loaded jobs and defers writes until flush.
pub struct BufferedSession {
    session: Session,
    pending: Vec<PendingWrite>,
    jobs: HashMap<JobId, JobRecord>,
}

impl BufferedSession {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            pending: Vec::new(),
            jobs: HashMap::new(),
        }
    }

    /// The underlying session, for reads that bypass the buffer.
    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Record a write; nothing reaches the backend until [`Self::flush`].
    pub fn queue(&mut self, write: PendingWrite) {
        self.pending.push(write);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Load a job, serving repeats from the tracked set.
    pub async fn load_job(&mut self, id: JobId) -> StorageResult<Option<JobRecord>> {
        if let Some(job) = self.jobs.get(&id) {
            return Ok(Some(job.clone()));
        }
        let loaded = crate::jobs::fetch_job(&mut self.session, id).await?;
        if let Some(job) = &loaded {
            self.jobs.insert(id, job.clone());
        }
        Ok(loaded)
    }

    /// Apply every pending write in queue order.
    pub async fn flush(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        debug!(pending = self.pending.len(), "flushing buffered writes");
        let writes = std::mem::take(&mut self.pending);
        for write in &writes {
            apply_write(&mut self.session, write).await?;
        }
        // Tracked jobs may be stale after state/expiry writes.
        self.jobs.clear();
        Ok(())
    }

    pub async fn commit(mut self) -> StorageResult<()> {
        self.flush().await?;
        self.session.commit().await
    }

    /// Discard pending writes and roll back.
    pub async fn rollback(self) {
        self.session.rollback().await;
    }
}

impl core::fmt::Debug for BufferedSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferedSession")
            .field("pending", &self.pending.len())
            .field("tracked_jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

/// Execute one write against the session.
///
/// Shared by the buffered flush and the direct-mode operations so both
/// modes produce identical statements. Upserts follow the
/// lookup-then-insert-or-update protocol and rely on the ambient
/// transaction (plus `FOR UPDATE` on the lookup) for atomicity.
pub(crate) async fn apply_write(session: &mut Session, write: &PendingWrite) -> StorageResult<()> {
    let statements = session.statements();
    match write {
        PendingWrite::UpsertJobParameter {
            job_id,
            name,
            value,
        } => {
            let lookup = statements.sql(EntityKind::JobParameter, StatementKind::SelectForUpsert);
            let existing: Option<i64> = sqlx::query_scalar(&lookup)
                .bind(job_id.as_i64())
                .bind(name)
                .fetch_optional(session.conn())
                .await
                .map_err(|e| map_sqlx_error("job_parameter_lookup", e))?;
            match existing {
                Some(id) => {
                    let update = statements.sql(EntityKind::JobParameter, StatementKind::UpdateRow);
                    sqlx::query(&update)
                        .bind(id)
                        .bind(value)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("job_parameter_update", e))?;
                }
                None => {
                    let insert = statements.sql(EntityKind::JobParameter, StatementKind::InsertRow);
                    sqlx::query(&insert)
                        .bind(job_id.as_i64())
                        .bind(name)
                        .bind(value)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("job_parameter_insert", e))?;
                }
            }
        }
        PendingWrite::AppendJobState {
            job_id,
            state,
            set_current,
        } => {
            sqlx::query(
                "INSERT INTO taskforge_job_state (job_id, name, reason, data) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(job_id.as_i64())
            .bind(&state.name)
            .bind(&state.reason)
            .bind(&state.data)
            .execute(session.conn())
            .await
            .map_err(|e| map_sqlx_error("job_state_insert", e))?;

            if *set_current {
                sqlx::query(
                    "UPDATE taskforge_job \
                     SET state_name = $2, state_reason = $3, state_data = $4 \
                     WHERE id = $1",
                )
                .bind(job_id.as_i64())
                .bind(&state.name)
                .bind(&state.reason)
                .bind(&state.data)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("job_state_set_current", e))?;
            }
        }
        PendingWrite::SetJobExpiry { job_id, expire_at } => {
            sqlx::query("UPDATE taskforge_job SET expire_at = $2 WHERE id = $1")
                .bind(job_id.as_i64())
                .bind(expire_at)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("job_set_expiry", e))?;
        }
        PendingWrite::UpsertHashField { key, field, value } => {
            let lookup = statements.sql(EntityKind::Hash, StatementKind::SelectForUpsert);
            let existing: Option<i64> = sqlx::query_scalar(&lookup)
                .bind(key)
                .bind(field)
                .fetch_optional(session.conn())
                .await
                .map_err(|e| map_sqlx_error("hash_lookup", e))?;
            match existing {
                Some(id) => {
                    let update = statements.sql(EntityKind::Hash, StatementKind::UpdateRow);
                    sqlx::query(&update)
                        .bind(id)
                        .bind(value)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("hash_update", e))?;
                }
                None => {
                    let insert = statements.sql(EntityKind::Hash, StatementKind::InsertRow);
                    sqlx::query(&insert)
                        .bind(key)
                        .bind(field)
                        .bind(value)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("hash_insert", e))?;
                }
            }
        }
        PendingWrite::PushListValue { key, value } => {
            let insert = statements.sql(EntityKind::List, StatementKind::InsertRow);
            sqlx::query(&insert)
                .bind(key)
                .bind(value)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("list_insert", e))?;
        }
        PendingWrite::RemoveListValue { key, value } => {
            let delete = statements.sql(EntityKind::List, StatementKind::DeleteByKeyAndValue);
            sqlx::query(&delete)
                .bind(key)
                .bind(value)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("list_remove_value", e))?;
        }
        PendingWrite::UpsertSetValue { key, value, score } => {
            let lookup = statements.sql(EntityKind::Set, StatementKind::SelectForUpsert);
            let existing: Option<i64> = sqlx::query_scalar(&lookup)
                .bind(key)
                .bind(value)
                .fetch_optional(session.conn())
                .await
                .map_err(|e| map_sqlx_error("set_lookup", e))?;
            match existing {
                Some(id) => {
                    let update = statements.sql(EntityKind::Set, StatementKind::UpdateRow);
                    sqlx::query(&update)
                        .bind(id)
                        .bind(score)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("set_update", e))?;
                }
                None => {
                    let insert = statements.sql(EntityKind::Set, StatementKind::InsertRow);
                    sqlx::query(&insert)
                        .bind(key)
                        .bind(value)
                        .bind(score)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("set_insert", e))?;
                }
            }
        }
        PendingWrite::RemoveSetValue { key, value } => {
            let delete = statements.sql(EntityKind::Set, StatementKind::DeleteByKeyAndValue);
            sqlx::query(&delete)
                .bind(key)
                .bind(value)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("set_remove_value", e))?;
        }
        PendingWrite::IncrementCounter {
            key,
            delta,
            expire_at,
        } => {
            let insert = statements.sql(EntityKind::Counter, StatementKind::InsertRow);
            sqlx::query(&insert)
                .bind(key)
                .bind(delta)
                .bind(expire_at)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("counter_insert", e))?;
        }
        PendingWrite::SetKeyExpiry {
            kind,
            key,
            expire_at,
        } => {
            let update = statements.sql(kind.entity(), StatementKind::SetExpiryByKey);
            sqlx::query(&update)
                .bind(key)
                .bind(expire_at)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("set_key_expiry", e))?;
        }
        PendingWrite::DeleteKey { kind, key } => {
            let delete = statements.sql(kind.entity(), StatementKind::DeleteByKey);
            sqlx::query(&delete)
                .bind(key)
                .execute(session.conn())
                .await
                .map_err(|e| map_sqlx_error("delete_key", e))?;
        }
    }
    Ok(())
}
