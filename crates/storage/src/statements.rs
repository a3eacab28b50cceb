//! Parameterized statement templates, built once per (entity, operation)
//! pair and memoized.
//!
//! Rebuilding a template is harmless (builders are pure), the cache only
//! avoids duplicate work; it is process-local and must never be mistaken
//! for cross-process coordination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use taskforge_core::EntityKind;

/// The hand-written statement shapes the engine caches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// `DELETE .. WHERE id = ANY($1)`.
    DeleteByIdSet,
    /// `DELETE .. WHERE "key" = $1`.
    DeleteByKey,
    /// `DELETE .. WHERE "key" = $1 AND "value" = $2`.
    DeleteByKeyAndValue,
    /// `UPDATE .. SET expire_at = $2 WHERE "key" = $1`.
    SetExpiryByKey,
    /// Select up to `$1` expired row ids, oldest first.
    SelectExpiredIds,
    /// Locking lookup feeding the upsert (insert-or-update) protocol.
    SelectForUpsert,
    /// Plain insert for the upsert protocol's absent branch.
    InsertRow,
    /// Targeted update for the upsert protocol's present branch.
    UpdateRow,
    /// Atomic insert-if-no-live-row from the one-row source table.
    LockConditionalInsert,
    /// Remove a resource's expired lease before attempting acquisition.
    LockPurgeExpired,
    /// Release: delete the lease row (idempotent).
    LockDelete,
    /// Explicit lease extension ("touch").
    LockExtend,
}

/// Memoized statement templates keyed by `(entity, operation)`.
///
/// Concurrent first-callers serialize on the internal mutex, so a template
/// is built at most once and every caller observes the identical text.
#[derive(Debug, Default)]
pub struct StatementCache {
    templates: Mutex<HashMap<(EntityKind, StatementKind), Arc<str>>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (building on first use) the template for an entity/operation
    /// pair. Identical pairs always return identical text.
    pub fn sql(&self, kind: EntityKind, stmt: StatementKind) -> Arc<str> {
        let mut templates = self.templates.lock().unwrap();
        templates
            .entry((kind, stmt))
            .or_insert_with(|| Arc::from(build(kind, stmt)))
            .clone()
    }
}

/// Seconds-since-epoch of the backend clock, as used by every lock
/// predicate. Kept as one fragment so all comparisons agree.
const EPOCH_NOW: &str = "floor(extract(epoch FROM now()))::bigint";

fn build(kind: EntityKind, stmt: StatementKind) -> String {
    let table = kind.table();
    match stmt {
        StatementKind::DeleteByIdSet => {
            format!("DELETE FROM {table} WHERE id = ANY($1)")
        }
        StatementKind::DeleteByKey => match kind {
            EntityKind::Hash
            | EntityKind::List
            | EntityKind::Set
            | EntityKind::Counter
            | EntityKind::AggregatedCounter => {
                format!("DELETE FROM {table} WHERE \"key\" = $1")
            }
            _ => unimplemented!("no delete-by-key template for {table}"),
        },
        StatementKind::DeleteByKeyAndValue => match kind {
            EntityKind::List | EntityKind::Set => {
                format!("DELETE FROM {table} WHERE \"key\" = $1 AND \"value\" = $2")
            }
            _ => unimplemented!("no delete-by-key-and-value template for {table}"),
        },
        StatementKind::SetExpiryByKey => match kind {
            EntityKind::Hash
            | EntityKind::List
            | EntityKind::Set
            | EntityKind::Counter
            | EntityKind::AggregatedCounter => {
                format!("UPDATE {table} SET expire_at = $2 WHERE \"key\" = $1")
            }
            _ => unimplemented!("no set-expiry template for {table}"),
        },
        StatementKind::SelectExpiredIds => match kind {
            // Children expire with their parent job, never on their own.
            EntityKind::JobState | EntityKind::JobParameter | EntityKind::JobQueue => format!(
                "SELECT c.id FROM {table} c \
                 JOIN {job} j ON j.id = c.job_id \
                 WHERE j.expire_at IS NOT NULL AND j.expire_at < now() \
                 ORDER BY c.id LIMIT $1",
                job = EntityKind::Job.table(),
            ),
            EntityKind::Lock => format!(
                "SELECT id FROM {table} WHERE expire_at_epoch < {EPOCH_NOW} ORDER BY id LIMIT $1"
            ),
            EntityKind::Job
            | EntityKind::Hash
            | EntityKind::List
            | EntityKind::Set
            | EntityKind::Counter
            | EntityKind::AggregatedCounter => format!(
                "SELECT id FROM {table} \
                 WHERE expire_at IS NOT NULL AND expire_at < now() \
                 ORDER BY id LIMIT $1"
            ),
            EntityKind::Server => unimplemented!("servers are purged by heartbeat, not expiry"),
        },
        StatementKind::SelectForUpsert => match kind {
            EntityKind::Hash => format!(
                "SELECT id FROM {table} WHERE \"key\" = $1 AND field = $2 FOR UPDATE"
            ),
            EntityKind::Set => format!(
                "SELECT id FROM {table} WHERE \"key\" = $1 AND \"value\" = $2 FOR UPDATE"
            ),
            EntityKind::AggregatedCounter => format!(
                "SELECT id, \"value\", expire_at FROM {table} WHERE \"key\" = $1 FOR UPDATE"
            ),
            EntityKind::JobParameter => format!(
                "SELECT id FROM {table} WHERE job_id = $1 AND name = $2 FOR UPDATE"
            ),
            _ => unimplemented!("no upsert lookup template for {table}"),
        },
        StatementKind::InsertRow => match kind {
            EntityKind::Hash => format!(
                "INSERT INTO {table} (\"key\", field, \"value\") VALUES ($1, $2, $3)"
            ),
            EntityKind::Set => format!(
                "INSERT INTO {table} (\"key\", \"value\", score) VALUES ($1, $2, $3)"
            ),
            EntityKind::AggregatedCounter => format!(
                "INSERT INTO {table} (\"key\", \"value\", expire_at) VALUES ($1, $2, $3)"
            ),
            EntityKind::JobParameter => format!(
                "INSERT INTO {table} (job_id, name, \"value\") VALUES ($1, $2, $3)"
            ),
            EntityKind::List => {
                format!("INSERT INTO {table} (\"key\", \"value\") VALUES ($1, $2)")
            }
            EntityKind::Counter => format!(
                "INSERT INTO {table} (\"key\", \"value\", expire_at) VALUES ($1, $2, $3)"
            ),
            _ => unimplemented!("no insert template for {table}"),
        },
        StatementKind::UpdateRow => match kind {
            EntityKind::Hash => format!("UPDATE {table} SET \"value\" = $2 WHERE id = $1"),
            EntityKind::Set => format!("UPDATE {table} SET score = $2 WHERE id = $1"),
            EntityKind::AggregatedCounter => format!(
                "UPDATE {table} SET \"value\" = $2, expire_at = $3 WHERE id = $1"
            ),
            EntityKind::JobParameter => {
                format!("UPDATE {table} SET \"value\" = $2 WHERE id = $1")
            }
            _ => unimplemented!("no update template for {table}"),
        },
        StatementKind::LockConditionalInsert => format!(
            "INSERT INTO {table} (resource, acquired_at, expire_at_epoch) \
             SELECT $1, now(), {EPOCH_NOW} + $2 \
             FROM taskforge_source \
             WHERE NOT EXISTS (\
                 SELECT 1 FROM {table} \
                 WHERE resource = $1 AND expire_at_epoch > {EPOCH_NOW}\
             )"
        ),
        StatementKind::LockPurgeExpired => format!(
            "DELETE FROM {table} WHERE resource = $1 AND expire_at_epoch <= {EPOCH_NOW}"
        ),
        StatementKind::LockDelete => format!("DELETE FROM {table} WHERE resource = $1"),
        StatementKind::LockExtend => format!(
            "UPDATE {table} SET expire_at_epoch = {EPOCH_NOW} + $2 WHERE resource = $1"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_pairs_share_one_template() {
        let cache = StatementCache::new();
        let a = cache.sql(EntityKind::Job, StatementKind::DeleteByIdSet);
        let b = cache.sql(EntityKind::Job, StatementKind::DeleteByIdSet);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn templates_differ_per_entity() {
        let cache = StatementCache::new();
        let job = cache.sql(EntityKind::Job, StatementKind::DeleteByIdSet);
        let hash = cache.sql(EntityKind::Hash, StatementKind::DeleteByIdSet);
        assert_ne!(&*job, &*hash);
        assert!(job.contains("taskforge_job"));
        assert!(hash.contains("taskforge_hash"));
    }

    #[test]
    fn conditional_insert_uses_source_table_and_live_predicate() {
        let cache = StatementCache::new();
        let sql = cache.sql(EntityKind::Lock, StatementKind::LockConditionalInsert);
        assert!(sql.contains("FROM taskforge_source"));
        assert!(sql.contains("WHERE NOT EXISTS"));
        assert!(sql.contains("expire_at_epoch >"));
    }

    #[test]
    fn child_expiry_joins_parent_job() {
        let cache = StatementCache::new();
        for kind in [
            EntityKind::JobState,
            EntityKind::JobParameter,
            EntityKind::JobQueue,
        ] {
            let sql = cache.sql(kind, StatementKind::SelectExpiredIds);
            assert!(sql.contains("JOIN taskforge_job"), "{sql}");
        }
    }

    #[test]
    fn reserved_word_columns_are_quoted() {
        let cache = StatementCache::new();
        let sql = cache.sql(EntityKind::Set, StatementKind::DeleteByKeyAndValue);
        assert!(sql.contains("\"key\""));
        assert!(sql.contains("\"value\""));
    }

    #[test]
    fn concurrent_first_callers_observe_identical_text() {
        let cache = Arc::new(StatementCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache.sql(EntityKind::Lock, StatementKind::LockConditionalInsert)
                })
            })
            .collect();
        let texts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for text in &texts[1..] {
            assert!(Arc::ptr_eq(&texts[0], text));
        }
    }
}
