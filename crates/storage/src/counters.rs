//! Counters: append-only deltas, periodically compacted.
//!
//! Increments never contend — each is a fresh delta row. Reads sum deltas
//! plus the compacted aggregate. `aggregate` folds a batch of deltas into
//! `taskforge_aggregated_counter` and deletes them in the same transaction,
//! so the summed value observed by readers never changes across a
//! compaction.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, instrument};

use taskforge_core::{EntityKind, StorageError, StorageResult};

use crate::session::buffered::{apply_write, PendingWrite};
use crate::session::{map_sqlx_error, Storage};
use crate::statements::StatementKind;

/// Counter storage operations consumed by the host scheduler.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record a delta for `key`, optionally expiring `ttl` from the
    /// backend's now.
    async fn counter_increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Current value: sum of pending deltas plus the compacted aggregate.
    /// Zero for an absent key.
    async fn counter_get(&self, key: &str) -> StorageResult<i64>;

    /// Compact up to `batch` delta rows into the aggregated table.
    /// Returns the number of deltas folded.
    async fn counter_aggregate(&self, batch: i64) -> StorageResult<u64>;
}

#[async_trait]
impl CounterStore for Storage {
    async fn counter_increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        let expire_at = match ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| StorageError::serialization(format!("ttl out of range: {e}")))?;
                Some(session.now().await? + ttl)
            }
            None => None,
        };
        apply_write(
            &mut session,
            &PendingWrite::IncrementCounter {
                key: key.to_string(),
                delta,
                expire_at,
            },
        )
        .await?;
        session.commit().await
    }

    async fn counter_get(&self, key: &str) -> StorageResult<i64> {
        self.ensure_schema().await?;
        sqlx::query_scalar(
            "SELECT (COALESCE((SELECT sum(\"value\") FROM taskforge_counter \
                               WHERE \"key\" = $1), 0) \
                   + COALESCE((SELECT sum(\"value\") FROM taskforge_aggregated_counter \
                               WHERE \"key\" = $1), 0))::bigint",
        )
        .bind(key)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_sqlx_error("counter_get", e))
    }

    #[instrument(skip(self))]
    async fn counter_aggregate(&self, batch: i64) -> StorageResult<u64> {
        let mut session = self.begin_default().await?;

        let rows = sqlx::query(
            "SELECT id, \"key\", \"value\", expire_at FROM taskforge_counter \
             ORDER BY id LIMIT $1 FOR UPDATE",
        )
        .bind(batch)
        .fetch_all(session.conn())
        .await
        .map_err(|e| map_sqlx_error("counter_select_batch", e))?;

        if rows.is_empty() {
            session.commit().await?;
            return Ok(0);
        }

        // Fold deltas per key; the aggregate keeps the furthest expiry.
        let mut ids = Vec::with_capacity(rows.len());
        let mut folded: BTreeMap<String, (i64, Option<DateTime<Utc>>)> = BTreeMap::new();
        for row in &rows {
            let read = |e: sqlx::Error| map_sqlx_error("counter_row", e);
            let id: i64 = row.try_get("id").map_err(read)?;
            let key: String = row.try_get("key").map_err(read)?;
            let value: i64 = row.try_get("value").map_err(read)?;
            let expire_at: Option<DateTime<Utc>> = row.try_get("expire_at").map_err(read)?;

            ids.push(id);
            let entry = folded.entry(key).or_insert((0, None));
            entry.0 += value;
            entry.1 = entry.1.max(expire_at);
        }

        let statements = session.statements();
        for (key, (delta, expire_at)) in &folded {
            let lookup =
                statements.sql(EntityKind::AggregatedCounter, StatementKind::SelectForUpsert);
            let existing = sqlx::query(&lookup)
                .bind(key)
                .fetch_optional(session.conn())
                .await
                .map_err(|e| map_sqlx_error("aggregated_lookup", e))?;

            match existing {
                Some(row) => {
                    let read = |e: sqlx::Error| map_sqlx_error("aggregated_row", e);
                    let id: i64 = row.try_get("id").map_err(read)?;
                    let value: i64 = row.try_get("value").map_err(read)?;
                    let current_expire: Option<DateTime<Utc>> =
                        row.try_get("expire_at").map_err(read)?;

                    let update =
                        statements.sql(EntityKind::AggregatedCounter, StatementKind::UpdateRow);
                    sqlx::query(&update)
                        .bind(id)
                        .bind(value + delta)
                        .bind(current_expire.max(*expire_at))
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("aggregated_update", e))?;
                }
                None => {
                    let insert =
                        statements.sql(EntityKind::AggregatedCounter, StatementKind::InsertRow);
                    sqlx::query(&insert)
                        .bind(key)
                        .bind(delta)
                        .bind(expire_at)
                        .execute(session.conn())
                        .await
                        .map_err(|e| map_sqlx_error("aggregated_insert", e))?;
                }
            }
        }

        session.delete_by_id_set(EntityKind::Counter, &ids).await?;
        session.commit().await?;

        info!(folded = ids.len(), keys = folded.len(), "compacted counters");
        Ok(ids.len() as u64)
    }
}
