//! Dequeue protocol: poll for a claim, block until one lands or the caller
//! cancels.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use taskforge_core::{JobId, StorageError, StorageResult};

use crate::config::StorageConfig;
use crate::queue::{ClaimedEntry, ProviderRegistry, QueueProvider};

/// Polling dequeuer over a provider registry.
#[derive(Debug)]
pub struct Dequeuer {
    registry: Arc<ProviderRegistry>,
    poll_interval: Duration,
    staleness: Duration,
}

impl Dequeuer {
    pub fn new(registry: Arc<ProviderRegistry>, config: &StorageConfig) -> Self {
        Self {
            registry,
            poll_interval: config.queue_poll_interval,
            staleness: config.staleness_threshold,
        }
    }

    /// Claim one job from `queues`, blocking until an entry becomes
    /// available or `cancel` fires.
    ///
    /// Queue routing is validated up front: mixed providers fail
    /// immediately. Transient backend errors between polls are logged and
    /// absorbed; the loop's liveness matters more than any single attempt.
    #[instrument(skip(self, cancel))]
    pub async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> StorageResult<ClaimedJob> {
        let provider = self.registry.resolve(queues)?;
        loop {
            match provider.try_claim(queues, self.staleness).await {
                Ok(Some(entry)) => {
                    debug!(job_id = %entry.job_id, queue = %entry.queue, "claimed queue entry");
                    return Ok(ClaimedJob {
                        provider: provider.clone(),
                        entry,
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "transient error during claim attempt");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// A claimed job: exactly one dequeuer owns this entry until it
/// acknowledges or requeues.
pub struct ClaimedJob {
    provider: Arc<dyn QueueProvider>,
    entry: ClaimedEntry,
}

impl ClaimedJob {
    pub fn job_id(&self) -> JobId {
        self.entry.job_id
    }

    pub fn queue(&self) -> &str {
        &self.entry.queue
    }

    /// Completion: remove the queue entry. Removal, not a state change,
    /// signals release.
    pub async fn acknowledge(self) -> StorageResult<()> {
        self.provider.acknowledge(self.entry.entry_id).await
    }

    /// Failure path owned by the caller: clear the claim so another worker
    /// can pick the entry up.
    pub async fn requeue(self) -> StorageResult<()> {
        self.provider.requeue(self.entry.entry_id).await
    }
}

impl core::fmt::Debug for ClaimedJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClaimedJob")
            .field("entry", &self.entry)
            .field("provider", &self.provider.name())
            .finish()
    }
}
