//! Postgres lease store.
//!
//! Acquisition is one transaction: purge the resource's expired row, then
//! conditionally insert a fresh lease selected from the constant one-row
//! `taskforge_source` table, guarded by `NOT EXISTS` over live rows. Zero
//! affected rows means someone else holds the lease; a unique violation
//! means another acquirer won the install race this instant — both read as
//! "not acquired". All time comparisons use the backend clock.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use taskforge_core::{EntityKind, StorageResult};

use crate::session::{map_sqlx_error, sqlx_is_unique_violation, Storage};
use crate::statements::StatementKind;

/// Lease rows in `taskforge_lock`.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    storage: Storage,
}

impl PostgresLeaseStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl super::LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self))]
    async fn try_acquire(&self, resource: &str, lease: Duration) -> StorageResult<bool> {
        let statements = self.storage.statements();
        let purge = statements.sql(EntityKind::Lock, StatementKind::LockPurgeExpired);
        let insert = statements.sql(EntityKind::Lock, StatementKind::LockConditionalInsert);

        let mut session = self.storage.begin_default().await?;

        sqlx::query(&purge)
            .bind(resource)
            .execute(session.conn())
            .await
            .map_err(|e| map_sqlx_error("lock_purge_expired", e))?;

        let inserted = sqlx::query(&insert)
            .bind(resource)
            .bind(lease.as_secs() as i64)
            .execute(session.conn())
            .await;

        match inserted {
            Ok(result) => {
                let acquired = result.rows_affected() == 1;
                session.commit().await?;
                Ok(acquired)
            }
            Err(e) if sqlx_is_unique_violation(&e) => {
                // Concurrent acquirer inserted between our predicate check
                // and the write; the resource is held.
                session.rollback().await;
                Ok(false)
            }
            Err(e) => {
                session.rollback().await;
                Err(map_sqlx_error("lock_conditional_insert", e))
            }
        }
    }

    async fn release(&self, resource: &str) -> StorageResult<()> {
        let delete = self
            .storage
            .statements()
            .sql(EntityKind::Lock, StatementKind::LockDelete);
        sqlx::query(&delete)
            .bind(resource)
            .execute(self.storage.pool())
            .await
            .map_err(|e| map_sqlx_error("lock_delete", e))?;
        Ok(())
    }

    async fn extend(&self, resource: &str, lease: Duration) -> StorageResult<bool> {
        let update = self
            .storage
            .statements()
            .sql(EntityKind::Lock, StatementKind::LockExtend);
        let result = sqlx::query(&update)
            .bind(resource)
            .bind(lease.as_secs() as i64)
            .execute(self.storage.pool())
            .await
            .map_err(|e| map_sqlx_error("lock_extend", e))?;
        Ok(result.rows_affected() == 1)
    }
}
