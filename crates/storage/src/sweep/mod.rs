//! Expiration sweep engine.
//!
//! A recurring background task that removes expired rows from every
//! TTL-bearing table in bounded batches, under the distributed lock so only
//! one process sweeps at a time. Batching bounds lock-hold time; the
//! per-kind drain loop keeps going until a batch removes zero rows.

pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use taskforge_core::{EntityKind, StorageResult};

use crate::config::SweepConfig;
use crate::lock::{LeaseStore, LockManager};

pub use postgres::PostgresSweepStore;

/// Backend seam for batch removal of expired rows.
#[async_trait]
pub trait SweepStore: Send + Sync {
    /// Delete up to `batch` rows of `kind` whose expiry is before the
    /// backend's now. Returns the number removed.
    async fn remove_expired(&self, kind: EntityKind, batch: i64) -> StorageResult<u64>;
}

/// The recurring sweep task.
#[derive(Debug)]
pub struct ExpirationSweeper<S, L> {
    store: Arc<S>,
    locks: LockManager<L>,
    config: SweepConfig,
}

impl<S, L> ExpirationSweeper<S, L>
where
    S: SweepStore + 'static,
    L: LeaseStore + 'static,
{
    pub fn new(store: Arc<S>, locks: LockManager<L>, config: SweepConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Run until cancelled: one full pass over all entity kinds, then sleep
    /// for the check interval.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("expiration sweeper started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let removed = self.sweep_pass(&cancel).await;
            let total: u64 = removed.iter().map(|(_, n)| n).sum();
            debug!(total, "sweep pass complete");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }
        info!("expiration sweeper stopped");
    }

    /// One pass: drain each TTL-bearing kind in dependency order so
    /// children are removed before or alongside their parents.
    pub async fn sweep_pass(&self, cancel: &CancellationToken) -> Vec<(EntityKind, u64)> {
        let mut totals = Vec::with_capacity(EntityKind::SWEEP_ORDER.len());
        for kind in EntityKind::SWEEP_ORDER {
            if cancel.is_cancelled() {
                break;
            }
            let batches = self.drain(kind, cancel).await;
            totals.push((kind, batches.iter().sum()));
        }
        totals
    }

    /// Drain one entity kind: repeat lock → batch delete → release until a
    /// batch removes zero rows. Returns the per-batch removed counts,
    /// including the final zero.
    ///
    /// Lock unavailability skips the kind for this pass (another process is
    /// sweeping); any other error is logged and the drain continues.
    /// Cancellation stops promptly, abandoning the in-flight batch.
    #[instrument(skip(self, cancel))]
    pub async fn drain(&self, kind: EntityKind, cancel: &CancellationToken) -> Vec<u64> {
        let mut batches = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return batches;
            }
            let store = self.store.clone();
            let batch_size = self.config.batch_size;
            let attempt = self
                .locks
                .with_lock(
                    &self.config.lock_resource,
                    self.config.lock_timeout,
                    cancel,
                    || async move { store.remove_expired(kind, batch_size).await },
                )
                .await;

            let removed = match attempt {
                Ok(n) => n,
                Err(e) if e.is_lock_unavailable() => {
                    debug!(%kind, error = %e, "sweeper lock unavailable; skipping kind this pass");
                    return batches;
                }
                Err(e) => {
                    warn!(%kind, error = %e, "sweep batch failed; continuing");
                    if !self.nap(cancel).await {
                        return batches;
                    }
                    continue;
                }
            };

            batches.push(removed);
            if removed == 0 {
                return batches;
            }
            info!(%kind, removed, "removed expired rows");
            if !self.nap(cancel).await {
                return batches;
            }
        }
    }

    /// Inter-pass delay; returns false when cancelled mid-sleep.
    async fn nap(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.inter_pass_delay) => true,
        }
    }
}
