//! Queue storage: providers, routing, and the claim contract.
//!
//! A queue entry's `fetched_at` transitions null → timestamp exactly once
//! per logical claim; the claim must be a single atomic statement so
//! concurrent dequeuers across processes never hand out the same entry
//! twice. Acknowledging deletes the row; requeueing clears the timestamp.

pub mod dequeue;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use taskforge_core::{JobId, StorageError, StorageResult};

pub use dequeue::{ClaimedJob, Dequeuer};
pub use postgres::PostgresJobQueue;

/// One successfully claimed queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedEntry {
    pub entry_id: i64,
    pub job_id: JobId,
    pub queue: String,
}

/// Backend seam for queue rows.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Human-readable provider name, for routing errors and logs.
    fn name(&self) -> &str;

    async fn enqueue(&self, job_id: JobId, queue: &str) -> StorageResult<()>;

    /// Atomically claim one available entry among `queues` (FIFO by
    /// insertion id). Entries fetched longer than `staleness` ago count as
    /// orphaned and are claimable again. Returns `None` when nothing is
    /// available or a concurrent claimer won every race this attempt.
    async fn try_claim(
        &self,
        queues: &[String],
        staleness: Duration,
    ) -> StorageResult<Option<ClaimedEntry>>;

    /// Acknowledge completion: delete the entry.
    async fn acknowledge(&self, entry_id: i64) -> StorageResult<()>;

    /// Return the entry to the queue: clear its claim timestamp.
    async fn requeue(&self, entry_id: i64) -> StorageResult<()>;
}

fn same_provider(a: &Arc<dyn QueueProvider>, b: &Arc<dyn QueueProvider>) -> bool {
    // Compare data pointers only; vtable pointers may differ per codegen
    // unit for the same object.
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Maps queue names to providers.
///
/// Every dequeue must resolve all requested queue names to exactly one
/// provider; mixing providers in one request is a configuration error
/// surfaced immediately, never retried.
pub struct ProviderRegistry {
    default_provider: Arc<dyn QueueProvider>,
    routes: HashMap<String, Arc<dyn QueueProvider>>,
}

impl ProviderRegistry {
    pub fn new(default_provider: Arc<dyn QueueProvider>) -> Self {
        Self {
            default_provider,
            routes: HashMap::new(),
        }
    }

    /// Route a specific queue name to a non-default provider.
    pub fn route(&mut self, queue: impl Into<String>, provider: Arc<dyn QueueProvider>) {
        self.routes.insert(queue.into(), provider);
    }

    fn provider_for(&self, queue: &str) -> &Arc<dyn QueueProvider> {
        self.routes.get(queue).unwrap_or(&self.default_provider)
    }

    /// Resolve `queues` to their single provider, or fail with
    /// [`StorageError::MixedQueueProviders`].
    pub fn resolve(&self, queues: &[String]) -> StorageResult<Arc<dyn QueueProvider>> {
        let (first, rest) = queues
            .split_first()
            .ok_or_else(|| StorageError::backend("dequeue requires at least one queue"))?;
        let provider = self.provider_for(first);
        for queue in rest {
            let other = self.provider_for(queue);
            if !same_provider(provider, other) {
                return Err(StorageError::MixedQueueProviders(format!(
                    "queue {first:?} uses {}, queue {queue:?} uses {}",
                    provider.name(),
                    other.name(),
                )));
            }
        }
        Ok(provider.clone())
    }
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("default_provider", &self.default_provider.name())
            .field("routes", &self.routes.len())
            .finish()
    }
}
