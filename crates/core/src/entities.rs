//! Typed row records.
//!
//! Pure data: each struct mirrors one table row. Behavior (claiming,
//! locking, sweeping) lives in the storage crate; the only methods here are
//! small constructors and predicates over the row's own fields.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, ServerId};

/// A background job row.
///
/// `invocation_data` and `arguments` are opaque serialized payloads owned by
/// the host scheduler; the engine only stores and returns them. The current
/// state columns are denormalized from the newest [`JobStateRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub invocation_data: String,
    pub arguments: String,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub state_name: Option<String>,
    pub state_reason: Option<String>,
    pub state_data: Option<String>,
}

impl JobRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at < now)
    }
}

/// A `(job, name)`-unique job parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameterRecord {
    pub job_id: JobId,
    pub name: String,
    pub value: Option<String>,
}

/// One append-only state-history row.
///
/// Never updated in place; rows disappear only when the parent job expires
/// and the sweep cascade removes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub id: i64,
    pub job_id: JobId,
    pub name: String,
    pub reason: Option<String>,
    pub data: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A state transition to record against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewState {
    pub name: String,
    pub reason: Option<String>,
    pub data: Option<String>,
}

impl NewState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// A queue membership row.
///
/// `fetched_at == None` means available. A non-null value marks the entry
/// claimed; the row is deleted on acknowledge, or the timestamp cleared on
/// requeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueRecord {
    pub id: i64,
    pub job_id: JobId,
    pub queue: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl JobQueueRecord {
    /// Claimable: never fetched, or fetched so long ago the claim is
    /// considered orphaned (crashed worker recovery).
    pub fn is_claimable(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        match self.fetched_at {
            None => true,
            Some(at) => at < now - staleness,
        }
    }
}

/// A distributed-lock lease row. Existence of a non-expired row for a
/// resource means the lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub acquired_at: DateTime<Utc>,
    /// Expiry as integer epoch seconds, for cheap comparison in the
    /// conditional-insert predicate.
    pub expire_at_epoch: i64,
}

impl LockRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expire_at_epoch > now.timestamp()
    }
}

/// A `(key, field)`-unique hash entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub key: String,
    pub field: String,
    pub value: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// A list entry. Not unique; ordered by insertion id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRecord {
    pub id: i64,
    pub key: String,
    pub value: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// A scored set entry, `(key, value)`-unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRecord {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub score: f64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// An append-only counter delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub id: i64,
    pub key: String,
    pub value: i64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// The compaction target for counter deltas, unique per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedCounterRecord {
    pub key: String,
    pub value: i64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// A registered server (worker process) and its last heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub data: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServerRecord {
    pub fn is_timed_out(&self, now: DateTime<Utc>, older_than: Duration) -> bool {
        self.last_heartbeat < now - older_than
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn queue_entry_claimable_when_unfetched_or_stale() {
        let now = at(10_000);
        let staleness = Duration::seconds(60);

        let fresh = JobQueueRecord {
            id: 1,
            job_id: JobId::from_raw(1),
            queue: "default".into(),
            fetched_at: None,
        };
        assert!(fresh.is_claimable(now, staleness));

        let claimed = JobQueueRecord {
            fetched_at: Some(at(9_990)),
            ..fresh.clone()
        };
        assert!(!claimed.is_claimable(now, staleness));

        let orphaned = JobQueueRecord {
            fetched_at: Some(at(9_000)),
            ..fresh
        };
        assert!(orphaned.is_claimable(now, staleness));
    }

    #[test]
    fn lock_liveness_is_epoch_comparison() {
        let now = at(5_000);
        let live = LockRecord {
            resource: "r".into(),
            acquired_at: now,
            expire_at_epoch: 5_001,
        };
        let expired = LockRecord {
            expire_at_epoch: 4_999,
            ..live.clone()
        };
        assert!(live.is_live(now));
        assert!(!expired.is_live(now));
    }

    #[test]
    fn job_expiry_is_strictly_before_now() {
        let now = at(100);
        let job = JobRecord {
            id: JobId::from_raw(1),
            invocation_data: "{}".into(),
            arguments: "[]".into(),
            created_at: at(0),
            expire_at: Some(now),
            state_name: None,
            state_reason: None,
            state_data: None,
        };
        assert!(!job.is_expired(now));
        assert!(job.is_expired(at(101)));
    }
}
