//! Postgres sweep store.
//!
//! Removal is select-then-delete inside one session: pick up to N expired
//! ids (oldest first), then delete exactly that id set. Splitting the two
//! keeps the delete's row set explicit and lets the id selection use the
//! expiry index.

use async_trait::async_trait;
use tracing::instrument;

use taskforge_core::{EntityKind, StorageResult};

use crate::session::{map_sqlx_error, Storage};
use crate::statements::StatementKind;

/// Expired-row removal against the Postgres tables.
#[derive(Debug, Clone)]
pub struct PostgresSweepStore {
    storage: Storage,
}

impl PostgresSweepStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl super::SweepStore for PostgresSweepStore {
    #[instrument(skip(self))]
    async fn remove_expired(&self, kind: EntityKind, batch: i64) -> StorageResult<u64> {
        let select = self
            .storage
            .statements()
            .sql(kind, StatementKind::SelectExpiredIds);

        let mut session = self.storage.begin_default().await?;
        let ids: Vec<i64> = sqlx::query_scalar(&select)
            .bind(batch)
            .fetch_all(session.conn())
            .await
            .map_err(|e| map_sqlx_error("select_expired_ids", e))?;

        if ids.is_empty() {
            session.commit().await?;
            return Ok(0);
        }

        let removed = session.delete_by_id_set(kind, &ids).await?;
        session.commit().await?;
        Ok(removed)
    }
}
