//! Distributed lock manager.
//!
//! A lock is a lease row: a non-expired row for a resource means held.
//! Acquisition moves through `Unlocked → Acquiring → Held → Released`, with
//! `Acquiring → TimedOut` when the deadline passes and
//! `Acquiring → Cancelled` when the caller's token fires. The manager polls
//! an atomic insert-if-no-live-row at a fixed interval; the lease is a
//! crash-recovery safety net, not an auto-renewed heartbeat — callers
//! needing long-held locks must [`LockManager::extend`] explicitly.

pub mod postgres;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use taskforge_core::{StorageError, StorageResult};

pub use postgres::PostgresLeaseStore;

/// Backend seam for lease rows.
///
/// `try_acquire` must be race-free against concurrent acquirers: it either
/// installs the one live row for `resource` and returns `true`, or observes
/// a live row (or loses the install race) and returns `false`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_acquire(&self, resource: &str, lease: Duration) -> StorageResult<bool>;

    /// Delete the lease row. Idempotent: releasing an already-released or
    /// expired lock is not an error.
    async fn release(&self, resource: &str) -> StorageResult<()>;

    /// Push the lease expiry out. Returns `false` if no row exists.
    async fn extend(&self, resource: &str, lease: Duration) -> StorageResult<bool>;
}

/// Polling lock acquisition over a [`LeaseStore`].
#[derive(Debug)]
pub struct LockManager<S> {
    store: Arc<S>,
    retry_interval: Duration,
    lease: Duration,
}

impl<S: LeaseStore + 'static> LockManager<S> {
    pub fn new(store: Arc<S>, retry_interval: Duration, lease: Duration) -> Self {
        Self {
            store,
            retry_interval,
            lease,
        }
    }

    /// Acquire `resource`, retrying until the hard deadline (measured from
    /// the first attempt) or until `cancel` fires.
    ///
    /// Transient backend errors during an attempt count as "not acquired"
    /// and are retried; they never escape this loop.
    #[instrument(skip(self, cancel))]
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StorageResult<LockGuard<S>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.try_acquire(resource, self.lease).await {
                Ok(true) => {
                    debug!(resource, "lock acquired");
                    return Ok(LockGuard {
                        store: self.store.clone(),
                        resource: resource.to_string(),
                        released: false,
                    });
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(resource, error = %e, "transient error during lock attempt");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
            let nap = self.retry_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StorageError::LockCancelled {
                        resource: resource.to_string(),
                    });
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Run `f` under the lock; release is guaranteed on every exit path
    /// (normal return, error, cancellation — and panics fall back to the
    /// guard's drop).
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> StorageResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let guard = self.acquire(resource, timeout, cancel).await?;
        let result = f().await;
        if let Err(e) = guard.release().await {
            warn!(resource, error = %e, "lock release failed; lease will expire");
        }
        result
    }

    /// Explicitly push a held lock's lease out by the manager's lease
    /// duration.
    pub async fn extend(&self, guard: &LockGuard<S>) -> StorageResult<bool> {
        self.store.extend(&guard.resource, self.lease).await
    }
}

/// A held lock. Release explicitly with [`LockGuard::release`]; dropping an
/// unreleased guard performs a best-effort release, and the lease expiry
/// reclaims the row if that cannot run.
pub struct LockGuard<S: LeaseStore + 'static> {
    store: Arc<S>,
    resource: String,
    released: bool,
}

impl<S: LeaseStore + 'static> LockGuard<S> {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub async fn release(mut self) -> StorageResult<()> {
        self.released = true;
        self.store.release(&self.resource).await
    }
}

impl<S: LeaseStore + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let resource = std::mem::take(&mut self.resource);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.release(&resource).await;
            });
        }
    }
}

impl<S: LeaseStore + 'static> core::fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("released", &self.released)
            .finish()
    }
}
