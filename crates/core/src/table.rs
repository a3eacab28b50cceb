//! Entity-to-table mapping.
//!
//! All mapping decisions (table names, which entities carry a TTL, the order
//! the sweeper visits them in) live here so statement building and sweeping
//! never hardcode a table name.

use serde::{Deserialize, Serialize};

/// Every persisted entity kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Job,
    JobParameter,
    JobState,
    JobQueue,
    Lock,
    Hash,
    List,
    Set,
    Counter,
    AggregatedCounter,
    Server,
}

impl EntityKind {
    /// Physical table name.
    ///
    /// Prefixed so the schema coexists with application tables; `"key"` and
    /// `"value"` columns still need quoting in statements (reserved words).
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Job => "taskforge_job",
            EntityKind::JobParameter => "taskforge_job_parameter",
            EntityKind::JobState => "taskforge_job_state",
            EntityKind::JobQueue => "taskforge_job_queue",
            EntityKind::Lock => "taskforge_lock",
            EntityKind::Hash => "taskforge_hash",
            EntityKind::List => "taskforge_list",
            EntityKind::Set => "taskforge_set",
            EntityKind::Counter => "taskforge_counter",
            EntityKind::AggregatedCounter => "taskforge_aggregated_counter",
            EntityKind::Server => "taskforge_server",
        }
    }

    /// The lock table stores expiry as integer epoch seconds; every other
    /// TTL-bearing table uses a nullable timestamp column.
    pub fn uses_epoch_expiry(&self) -> bool {
        matches!(self, EntityKind::Lock)
    }

    /// Kinds the expiration sweeper visits, in dependency order: children
    /// are removed before or alongside their parents so a partial pass never
    /// leaves orphans pointing at deleted rows.
    pub const SWEEP_ORDER: [EntityKind; 9] = [
        EntityKind::JobState,
        EntityKind::JobQueue,
        EntityKind::JobParameter,
        EntityKind::Lock,
        EntityKind::AggregatedCounter,
        EntityKind::Job,
        EntityKind::List,
        EntityKind::Set,
        EntityKind::Hash,
    ];
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.table())
    }
}

/// The keyed-value entity kinds that support `expire`/`persist`/`ttl`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Hash,
    List,
    Set,
}

impl KeyKind {
    pub fn entity(&self) -> EntityKind {
        match self {
            KeyKind::Hash => EntityKind::Hash,
            KeyKind::List => EntityKind::List,
            KeyKind::Set => EntityKind::Set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_order_removes_children_before_jobs() {
        let order = EntityKind::SWEEP_ORDER;
        let pos = |k: EntityKind| order.iter().position(|x| *x == k).unwrap();
        assert!(pos(EntityKind::JobState) < pos(EntityKind::Job));
        assert!(pos(EntityKind::JobQueue) < pos(EntityKind::Job));
        assert!(pos(EntityKind::JobParameter) < pos(EntityKind::Job));
    }

    #[test]
    fn only_lock_uses_epoch_expiry() {
        for kind in EntityKind::SWEEP_ORDER {
            assert_eq!(kind.uses_epoch_expiry(), kind == EntityKind::Lock);
        }
    }
}
