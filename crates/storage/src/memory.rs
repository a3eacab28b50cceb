//! In-memory backend for tests and development.
//!
//! One mutex-guarded state struct implements every capability trait with
//! the same observable contract as the Postgres backend: atomic claims,
//! insert-if-no-live-row leases, batched expiry sweeps. The grid's own
//! clock (`Utc::now`) plays the role of the backend clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskforge_core::{
    AggregatedCounterRecord, CounterRecord, EntityKind, JobId, JobQueueRecord, JobRecord,
    JobStateRecord, KeyKind, ListRecord, LockRecord, NewState, ServerId, ServerRecord,
    StorageError, StorageResult,
};

use crate::counters::CounterStore;
use crate::jobs::JobStore;
use crate::kv::{KeyValueStore, NO_TTL};
use crate::lock::LeaseStore;
use crate::queue::{ClaimedEntry, QueueProvider};
use crate::server::ServerRegistry;
use crate::sweep::SweepStore;

#[derive(Debug, Clone)]
struct HashEntry {
    value: Option<String>,
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SetEntry {
    id: i64,
    score: f64,
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct GridState {
    next_id: i64,
    jobs: BTreeMap<i64, JobRecord>,
    parameters: HashMap<(i64, String), Option<String>>,
    states: BTreeMap<i64, JobStateRecord>,
    queue: BTreeMap<i64, JobQueueRecord>,
    locks: HashMap<String, LockRecord>,
    hashes: HashMap<(String, String), HashEntry>,
    lists: BTreeMap<i64, ListRecord>,
    sets: HashMap<(String, String), SetEntry>,
    counters: BTreeMap<i64, CounterRecord>,
    aggregated: HashMap<String, AggregatedCounterRecord>,
    servers: HashMap<String, ServerRecord>,
}

impl GridState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory storage grid.
#[derive(Debug)]
pub struct InMemoryGrid {
    state: Mutex<GridState>,
    name: String,
}

impl InMemoryGrid {
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    /// A distinctly named grid, for routing tests with several providers.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(GridState::default()),
            name: name.into(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryGrid {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_ttl(ttl: Duration) -> StorageResult<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| StorageError::serialization(format!("ttl out of range: {e}")))
}

fn is_expired(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expire_at.is_some_and(|at| at < now)
}

#[async_trait]
impl LeaseStore for InMemoryGrid {
    async fn try_acquire(&self, resource: &str, lease: Duration) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        if state.locks.get(resource).is_some_and(|l| l.is_live(now)) {
            return Ok(false);
        }
        state.locks.insert(
            resource.to_string(),
            LockRecord {
                resource: resource.to_string(),
                acquired_at: now,
                expire_at_epoch: now.timestamp() + lease.as_secs() as i64,
            },
        );
        Ok(true)
    }

    async fn release(&self, resource: &str) -> StorageResult<()> {
        self.state.lock().unwrap().locks.remove(resource);
        Ok(())
    }

    async fn extend(&self, resource: &str, lease: Duration) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        match state.locks.get_mut(resource) {
            Some(lock) => {
                lock.expire_at_epoch = now.timestamp() + lease.as_secs() as i64;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl QueueProvider for InMemoryGrid {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job_id: JobId, queue: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.queue.insert(
            id,
            JobQueueRecord {
                id,
                job_id,
                queue: queue.to_string(),
                fetched_at: None,
            },
        );
        Ok(())
    }

    async fn try_claim(
        &self,
        queues: &[String],
        staleness: Duration,
    ) -> StorageResult<Option<ClaimedEntry>> {
        let staleness = chrono_ttl(staleness)?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        // BTreeMap iteration gives insertion-id order: FIFO.
        for entry in state.queue.values_mut() {
            if queues.contains(&entry.queue) && entry.is_claimable(now, staleness) {
                entry.fetched_at = Some(now);
                return Ok(Some(ClaimedEntry {
                    entry_id: entry.id,
                    job_id: entry.job_id,
                    queue: entry.queue.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn acknowledge(&self, entry_id: i64) -> StorageResult<()> {
        self.state.lock().unwrap().queue.remove(&entry_id);
        Ok(())
    }

    async fn requeue(&self, entry_id: i64) -> StorageResult<()> {
        if let Some(entry) = self.state.lock().unwrap().queue.get_mut(&entry_id) {
            entry.fetched_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl SweepStore for InMemoryGrid {
    async fn remove_expired(&self, kind: EntityKind, batch: i64) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let batch = batch.max(0) as usize;

        let expired_jobs: Vec<i64> = state
            .jobs
            .values()
            .filter(|j| j.is_expired(now))
            .map(|j| j.id.as_i64())
            .collect();

        let removed = match kind {
            EntityKind::JobState => {
                let ids: Vec<i64> = state
                    .states
                    .values()
                    .filter(|s| expired_jobs.contains(&s.job_id.as_i64()))
                    .map(|s| s.id)
                    .take(batch)
                    .collect();
                for id in &ids {
                    state.states.remove(id);
                }
                ids.len()
            }
            EntityKind::JobQueue => {
                let ids: Vec<i64> = state
                    .queue
                    .values()
                    .filter(|q| expired_jobs.contains(&q.job_id.as_i64()))
                    .map(|q| q.id)
                    .take(batch)
                    .collect();
                for id in &ids {
                    state.queue.remove(id);
                }
                ids.len()
            }
            EntityKind::JobParameter => {
                let keys: Vec<(i64, String)> = state
                    .parameters
                    .keys()
                    .filter(|(job_id, _)| expired_jobs.contains(job_id))
                    .take(batch)
                    .cloned()
                    .collect();
                for key in &keys {
                    state.parameters.remove(key);
                }
                keys.len()
            }
            EntityKind::Lock => {
                let resources: Vec<String> = state
                    .locks
                    .values()
                    .filter(|l| !l.is_live(now))
                    .map(|l| l.resource.clone())
                    .take(batch)
                    .collect();
                for resource in &resources {
                    state.locks.remove(resource);
                }
                resources.len()
            }
            EntityKind::AggregatedCounter => {
                let keys: Vec<String> = state
                    .aggregated
                    .values()
                    .filter(|c| is_expired(c.expire_at, now))
                    .map(|c| c.key.clone())
                    .take(batch)
                    .collect();
                for key in &keys {
                    state.aggregated.remove(key);
                }
                keys.len()
            }
            EntityKind::Job => {
                let ids: Vec<i64> = expired_jobs.into_iter().take(batch).collect();
                for id in &ids {
                    state.jobs.remove(id);
                }
                ids.len()
            }
            EntityKind::List => {
                let ids: Vec<i64> = state
                    .lists
                    .values()
                    .filter(|l| is_expired(l.expire_at, now))
                    .map(|l| l.id)
                    .take(batch)
                    .collect();
                for id in &ids {
                    state.lists.remove(id);
                }
                ids.len()
            }
            EntityKind::Set => {
                let keys: Vec<(String, String)> = state
                    .sets
                    .iter()
                    .filter(|(_, e)| is_expired(e.expire_at, now))
                    .map(|(k, _)| k.clone())
                    .take(batch)
                    .collect();
                for key in &keys {
                    state.sets.remove(key);
                }
                keys.len()
            }
            EntityKind::Hash => {
                let keys: Vec<(String, String)> = state
                    .hashes
                    .iter()
                    .filter(|(_, e)| is_expired(e.expire_at, now))
                    .map(|(k, _)| k.clone())
                    .take(batch)
                    .collect();
                for key in &keys {
                    state.hashes.remove(key);
                }
                keys.len()
            }
            EntityKind::Counter | EntityKind::Server => 0,
        };
        Ok(removed as u64)
    }
}

#[async_trait]
impl JobStore for InMemoryGrid {
    async fn create_job(
        &self,
        invocation_data: &str,
        arguments: &str,
        parameters: &[(String, String)],
        expire_in: Option<Duration>,
    ) -> StorageResult<JobId> {
        let expire_in = expire_in.map(chrono_ttl).transpose()?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let id = state.next_id();
        let job_id = JobId::from_raw(id);
        state.jobs.insert(
            id,
            JobRecord {
                id: job_id,
                invocation_data: invocation_data.to_string(),
                arguments: arguments.to_string(),
                created_at: now,
                expire_at: expire_in.map(|ttl| now + ttl),
                state_name: None,
                state_reason: None,
                state_data: None,
            },
        );
        for (name, value) in parameters {
            state
                .parameters
                .insert((id, name.clone()), Some(value.clone()));
        }
        Ok(job_id)
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<JobRecord>> {
        Ok(self.state.lock().unwrap().jobs.get(&id.as_i64()).cloned())
    }

    async fn set_job_parameter(
        &self,
        id: JobId,
        name: &str,
        value: Option<&str>,
    ) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .parameters
            .insert((id.as_i64(), name.to_string()), value.map(str::to_string));
        Ok(())
    }

    async fn get_job_parameter(&self, id: JobId, name: &str) -> StorageResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .parameters
            .get(&(id.as_i64(), name.to_string()))
            .cloned()
            .flatten())
    }

    async fn set_job_state(&self, id: JobId, state: NewState) -> StorageResult<()> {
        let mut grid = self.state.lock().unwrap();
        let now = Utc::now();
        let state_id = grid.next_id();
        grid.states.insert(
            state_id,
            JobStateRecord {
                id: state_id,
                job_id: id,
                name: state.name.clone(),
                reason: state.reason.clone(),
                data: state.data.clone(),
                created_at: now,
            },
        );
        if let Some(job) = grid.jobs.get_mut(&id.as_i64()) {
            job.state_name = Some(state.name);
            job.state_reason = state.reason;
            job.state_data = state.data;
        }
        Ok(())
    }

    async fn add_job_state(&self, id: JobId, state: NewState) -> StorageResult<()> {
        let mut grid = self.state.lock().unwrap();
        let now = Utc::now();
        let state_id = grid.next_id();
        grid.states.insert(
            state_id,
            JobStateRecord {
                id: state_id,
                job_id: id,
                name: state.name,
                reason: state.reason,
                data: state.data,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn get_state_history(&self, id: JobId) -> StorageResult<Vec<JobStateRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .states
            .values()
            .filter(|s| s.job_id == id)
            .cloned()
            .collect())
    }

    async fn set_job_expiry(&self, id: JobId, ttl: Duration) -> StorageResult<()> {
        let ttl = chrono_ttl(ttl)?;
        let mut grid = self.state.lock().unwrap();
        let now = Utc::now();
        if let Some(job) = grid.jobs.get_mut(&id.as_i64()) {
            job.expire_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn persist_job(&self, id: JobId) -> StorageResult<()> {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(&id.as_i64()) {
            job.expire_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryGrid {
    async fn hash_set_range(
        &self,
        key: &str,
        pairs: &[(String, Option<String>)],
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        for (field, value) in pairs {
            state
                .hashes
                .entry((key.to_string(), field.clone()))
                .and_modify(|e| e.value = value.clone())
                .or_insert(HashEntry {
                    value: value.clone(),
                    expire_at: None,
                });
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .iter()
            .filter(|((k, _), _)| k == key)
            .filter_map(|((_, field), e)| e.value.clone().map(|v| (field.clone(), v)))
            .collect())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(&(key.to_string(), field.to_string()))
            .and_then(|e| e.value.clone()))
    }

    async fn list_push(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.lists.insert(
            id,
            ListRecord {
                id,
                key: key.to_string(),
                value: Some(value.to_string()),
                expire_at: None,
            },
        );
        Ok(())
    }

    async fn list_remove_value(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .lists
            .retain(|_, l| !(l.key == key && l.value.as_deref() == Some(value)));
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: i64) -> StorageResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .lists
            .values()
            .rev()
            .filter(|l| l.key == key)
            .filter_map(|l| l.value.clone())
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn set_add(&self, key: &str, value: &str, score: f64) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.sets.get_mut(&(key.to_string(), value.to_string())) {
            Some(entry) => entry.score = score,
            None => {
                let id = state.next_id();
                state.sets.insert(
                    (key.to_string(), value.to_string()),
                    SetEntry {
                        id,
                        score,
                        expire_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, value: &str) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .sets
            .remove(&(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn set_range(&self, key: &str, limit: i64) -> StorageResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<(&SetEntry, &String)> = state
            .sets
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|((_, v), e)| (e, v))
            .collect();
        members.sort_by(|a, b| {
            a.0.score
                .partial_cmp(&b.0.score)
                .unwrap_or(core::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        Ok(members
            .into_iter()
            .map(|(_, v)| v.clone())
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn expire(&self, kind: KeyKind, key: &str, ttl: Duration) -> StorageResult<()> {
        let ttl = chrono_ttl(ttl)?;
        let mut state = self.state.lock().unwrap();
        let expire_at = Some(Utc::now() + ttl);
        set_key_expiry(&mut state, kind, key, expire_at);
        Ok(())
    }

    async fn persist(&self, kind: KeyKind, key: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        set_key_expiry(&mut state, kind, key, None);
        Ok(())
    }

    async fn ttl(&self, kind: KeyKind, key: &str) -> StorageResult<chrono::Duration> {
        let state = self.state.lock().unwrap();
        let now = Utc::now();
        let min_expiry = match kind {
            KeyKind::Hash => state
                .hashes
                .iter()
                .filter(|((k, _), _)| k == key)
                .filter_map(|(_, e)| e.expire_at)
                .min(),
            KeyKind::List => state
                .lists
                .values()
                .filter(|l| l.key == key)
                .filter_map(|l| l.expire_at)
                .min(),
            KeyKind::Set => state
                .sets
                .iter()
                .filter(|((k, _), _)| k == key)
                .filter_map(|(_, e)| e.expire_at)
                .min(),
        };
        Ok(match min_expiry {
            Some(at) => at - now,
            None => NO_TTL,
        })
    }
}

fn set_key_expiry(
    state: &mut GridState,
    kind: KeyKind,
    key: &str,
    expire_at: Option<DateTime<Utc>>,
) {
    match kind {
        KeyKind::Hash => {
            for ((k, _), entry) in state.hashes.iter_mut() {
                if k == key {
                    entry.expire_at = expire_at;
                }
            }
        }
        KeyKind::List => {
            for entry in state.lists.values_mut() {
                if entry.key == key {
                    entry.expire_at = expire_at;
                }
            }
        }
        KeyKind::Set => {
            for ((k, _), entry) in state.sets.iter_mut() {
                if k == key {
                    entry.expire_at = expire_at;
                }
            }
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryGrid {
    async fn counter_increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let ttl = ttl.map(chrono_ttl).transpose()?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let id = state.next_id();
        state.counters.insert(
            id,
            CounterRecord {
                id,
                key: key.to_string(),
                value: delta,
                expire_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn counter_get(&self, key: &str) -> StorageResult<i64> {
        let state = self.state.lock().unwrap();
        let deltas: i64 = state
            .counters
            .values()
            .filter(|c| c.key == key)
            .map(|c| c.value)
            .sum();
        let aggregated = state.aggregated.get(key).map(|c| c.value).unwrap_or(0);
        Ok(deltas + aggregated)
    }

    async fn counter_aggregate(&self, batch: i64) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<i64> = state
            .counters
            .keys()
            .take(batch.max(0) as usize)
            .copied()
            .collect();
        for id in &ids {
            let Some(row) = state.counters.remove(id) else {
                continue;
            };
            match state.aggregated.get_mut(&row.key) {
                Some(agg) => {
                    agg.value += row.value;
                    agg.expire_at = agg.expire_at.max(row.expire_at);
                }
                None => {
                    state.aggregated.insert(
                        row.key.clone(),
                        AggregatedCounterRecord {
                            key: row.key,
                            value: row.value,
                            expire_at: row.expire_at,
                        },
                    );
                }
            }
        }
        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl ServerRegistry for InMemoryGrid {
    async fn announce(&self, id: &ServerId, data: &str) -> StorageResult<()> {
        self.state.lock().unwrap().servers.insert(
            id.as_str().to_string(),
            ServerRecord {
                id: id.clone(),
                data: data.to_string(),
                last_heartbeat: Utc::now(),
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, id: &ServerId) -> StorageResult<bool> {
        match self.state.lock().unwrap().servers.get_mut(id.as_str()) {
            Some(server) => {
                server.last_heartbeat = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, id: &ServerId) -> StorageResult<()> {
        self.state.lock().unwrap().servers.remove(id.as_str());
        Ok(())
    }

    async fn purge_timed_out(&self, older_than: Duration) -> StorageResult<u64> {
        let older_than = chrono_ttl(older_than)?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let before = state.servers.len();
        state
            .servers
            .retain(|_, s| !s.is_timed_out(now, older_than));
        Ok((before - state.servers.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_fifo_and_single_owner() {
        let grid = InMemoryGrid::new();
        grid.enqueue(JobId::from_raw(1), "default").await.unwrap();
        grid.enqueue(JobId::from_raw(2), "default").await.unwrap();

        let queues = vec!["default".to_string()];
        let staleness = Duration::from_secs(1800);

        let first = grid.try_claim(&queues, staleness).await.unwrap().unwrap();
        assert_eq!(first.job_id, JobId::from_raw(1));

        let second = grid.try_claim(&queues, staleness).await.unwrap().unwrap();
        assert_eq!(second.job_id, JobId::from_raw(2));

        // Both claimed, nothing left.
        assert!(grid.try_claim(&queues, staleness).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acknowledge_removes_and_requeue_reopens() {
        let grid = InMemoryGrid::new();
        grid.enqueue(JobId::from_raw(1), "default").await.unwrap();
        let queues = vec!["default".to_string()];
        let staleness = Duration::from_secs(1800);

        let claim = grid.try_claim(&queues, staleness).await.unwrap().unwrap();
        grid.requeue(claim.entry_id).await.unwrap();

        let again = grid.try_claim(&queues, staleness).await.unwrap().unwrap();
        assert_eq!(again.entry_id, claim.entry_id);

        grid.acknowledge(again.entry_id).await.unwrap();
        assert!(grid.try_claim(&queues, staleness).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_blocks_until_released() {
        let grid = InMemoryGrid::new();
        assert!(grid
            .try_acquire("resource", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!grid
            .try_acquire("resource", Duration::from_secs(60))
            .await
            .unwrap());

        grid.release("resource").await.unwrap();
        assert!(grid
            .try_acquire("resource", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn aggregate_folds_deltas_without_changing_sum() {
        let grid = InMemoryGrid::new();
        for _ in 0..5 {
            grid.counter_increment("stats:succeeded", 2, None)
                .await
                .unwrap();
        }
        assert_eq!(grid.counter_get("stats:succeeded").await.unwrap(), 10);

        let folded = grid.counter_aggregate(100).await.unwrap();
        assert_eq!(folded, 5);
        assert_eq!(grid.counter_get("stats:succeeded").await.unwrap(), 10);

        // Nothing left to fold.
        assert_eq!(grid.counter_aggregate(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn server_purge_spares_recent_heartbeats() {
        let grid = InMemoryGrid::new();
        let id = ServerId::new("worker-a");
        grid.announce(&id, "{}").await.unwrap();

        assert_eq!(grid.purge_timed_out(Duration::from_secs(60)).await.unwrap(), 0);
        assert!(grid.heartbeat(&id).await.unwrap());
        assert_eq!(grid.purge_timed_out(Duration::ZERO).await.unwrap(), 1);
        assert!(!grid.heartbeat(&id).await.unwrap());
    }
}
