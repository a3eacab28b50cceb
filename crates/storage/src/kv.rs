//! Keyed value structures: hashes, lists, scored sets.
//!
//! Hash rows are unique per (key, field) and written through the upsert
//! protocol; list rows are insertion-ordered and non-unique; set rows are
//! unique per (key, value) with a score. `expire`/`persist`/`ttl` are the
//! explicit expiry touch operations — sweeping only ever shrinks the live
//! set, it never extends it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use taskforge_core::{KeyKind, StorageError, StorageResult};

use crate::session::buffered::{apply_write, PendingWrite};
use crate::session::{map_sqlx_error, Storage};

/// Signal value returned by [`KeyValueStore::ttl`] for an absent key or a
/// key with no expiry.
pub const NO_TTL: chrono::Duration = chrono::Duration::seconds(-1);

/// Key/value storage operations consumed by the host scheduler.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Upsert a batch of hash fields under one key, in one transaction.
    async fn hash_set_range(
        &self,
        key: &str,
        pairs: &[(String, Option<String>)],
    ) -> StorageResult<()>;

    /// All non-null fields of a hash; empty map when the key is absent.
    async fn hash_get_all(&self, key: &str) -> StorageResult<HashMap<String, String>>;

    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>>;

    /// Append a list entry (insertion-ordered).
    async fn list_push(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete every list entry matching key and value.
    async fn list_remove_value(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Newest-first list values, up to `limit`.
    async fn list_range(&self, key: &str, limit: i64) -> StorageResult<Vec<String>>;

    /// Upsert a set member: insert with `score`, or update the score of the
    /// existing (key, value) row.
    async fn set_add(&self, key: &str, value: &str, score: f64) -> StorageResult<()>;

    async fn set_remove(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Set members ordered by score, up to `limit`.
    async fn set_range(&self, key: &str, limit: i64) -> StorageResult<Vec<String>>;

    /// Set the expiry of every row under `key` to `ttl` from the backend's
    /// now.
    async fn expire(&self, kind: KeyKind, key: &str, ttl: Duration) -> StorageResult<()>;

    /// Clear the expiry of every row under `key`.
    async fn persist(&self, kind: KeyKind, key: &str) -> StorageResult<()>;

    /// Remaining time to live of `key`: `expiry − now` on the backend
    /// clock, or [`NO_TTL`] when the key is absent or carries no expiry.
    async fn ttl(&self, kind: KeyKind, key: &str) -> StorageResult<chrono::Duration>;
}

#[async_trait]
impl KeyValueStore for Storage {
    #[instrument(skip(self, pairs), fields(count = pairs.len()))]
    async fn hash_set_range(
        &self,
        key: &str,
        pairs: &[(String, Option<String>)],
    ) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        for (field, value) in pairs {
            apply_write(
                &mut session,
                &PendingWrite::UpsertHashField {
                    key: key.to_string(),
                    field: field.clone(),
                    value: value.clone(),
                },
            )
            .await?;
        }
        session.commit().await
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT field, \"value\" FROM taskforge_hash WHERE \"key\" = $1",
        )
        .bind(key)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("hash_get_all", e))?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let field: String = row
                .try_get("field")
                .map_err(|e| map_sqlx_error("hash_row", e))?;
            let value: Option<String> = row
                .try_get("value")
                .map_err(|e| map_sqlx_error("hash_row", e))?;
            if let Some(value) = value {
                entries.insert(field, value);
            }
        }
        Ok(entries)
    }

    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        self.ensure_schema().await?;
        let value: Option<Option<String>> = sqlx::query_scalar(
            "SELECT \"value\" FROM taskforge_hash WHERE \"key\" = $1 AND field = $2",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("hash_get", e))?;
        Ok(value.flatten())
    }

    async fn list_push(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::PushListValue {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
        )
        .await?;
        session.commit().await
    }

    async fn list_remove_value(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::RemoveListValue {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
        .await?;
        session.commit().await
    }

    async fn list_range(&self, key: &str, limit: i64) -> StorageResult<Vec<String>> {
        self.ensure_schema().await?;
        let rows: Vec<Option<String>> = sqlx::query_scalar(
            "SELECT \"value\" FROM taskforge_list \
             WHERE \"key\" = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(key)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_range", e))?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn set_add(&self, key: &str, value: &str, score: f64) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::UpsertSetValue {
                key: key.to_string(),
                value: value.to_string(),
                score,
            },
        )
        .await?;
        session.commit().await
    }

    async fn set_remove(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::RemoveSetValue {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
        .await?;
        session.commit().await
    }

    async fn set_range(&self, key: &str, limit: i64) -> StorageResult<Vec<String>> {
        self.ensure_schema().await?;
        sqlx::query_scalar(
            "SELECT \"value\" FROM taskforge_set \
             WHERE \"key\" = $1 ORDER BY score, id LIMIT $2",
        )
        .bind(key)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("set_range", e))
    }

    async fn expire(&self, kind: KeyKind, key: &str, ttl: Duration) -> StorageResult<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::serialization(format!("ttl out of range: {e}")))?;
        let mut session = self.begin_default().await?;
        let expire_at = session.now().await? + ttl;
        apply_write(
            &mut session,
            &PendingWrite::SetKeyExpiry {
                kind,
                key: key.to_string(),
                expire_at: Some(expire_at),
            },
        )
        .await?;
        session.commit().await
    }

    async fn persist(&self, kind: KeyKind, key: &str) -> StorageResult<()> {
        let mut session = self.begin_default().await?;
        apply_write(
            &mut session,
            &PendingWrite::SetKeyExpiry {
                kind,
                key: key.to_string(),
                expire_at: None,
            },
        )
        .await?;
        session.commit().await
    }

    async fn ttl(&self, kind: KeyKind, key: &str) -> StorageResult<chrono::Duration> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT min(expire_at), now() FROM {} WHERE \"key\" = $1",
            kind.entity().table(),
        );
        let (expire_at, now): (Option<DateTime<Utc>>, DateTime<Utc>) =
            sqlx::query_as(&sql)
                .bind(key)
                .fetch_one(self.pool())
                .await
                .map_err(|e| map_sqlx_error("ttl", e))?;
        Ok(match expire_at {
            Some(at) => at - now,
            None => NO_TTL,
        })
    }
}
