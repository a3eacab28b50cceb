//! Engine configuration.

use std::time::Duration;

use crate::session::IsolationLevel;

/// Storage engine configuration.
///
/// Passed explicitly to [`crate::Storage`] at construction; there are no
/// ambient globals, so multiple independently configured instances can
/// coexist in one process (useful in tests).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Isolation level used when a caller does not request one.
    pub default_isolation: IsolationLevel,
    /// How long an idle dequeue waits between claim attempts.
    pub queue_poll_interval: Duration,
    /// Claims older than this are considered orphaned and become claimable
    /// again (crashed-worker recovery).
    pub staleness_threshold: Duration,
    /// Fixed sleep between lock acquisition attempts.
    pub lock_retry_interval: Duration,
    /// Lease attached to acquired locks; an unreleased lock becomes
    /// acquirable once the lease passes.
    pub lock_lease: Duration,
    /// Expiration sweeper settings.
    pub sweep: SweepConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            queue_poll_interval: Duration::from_secs(1),
            staleness_threshold: Duration::from_secs(30 * 60),
            lock_retry_interval: Duration::from_millis(100),
            lock_lease: Duration::from_secs(60),
            sweep: SweepConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_sweep(mut self, sweep: SweepConfig) -> Self {
        self.sweep = sweep;
        self
    }
}

/// Expiration sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Sleep between full passes over all entity kinds.
    pub check_interval: Duration,
    /// Maximum rows removed per batch; bounds lock-hold time.
    pub batch_size: i64,
    /// Sleep between batches while draining one entity kind.
    pub inter_pass_delay: Duration,
    /// How long a pass waits for the sweeper lock before skipping a kind.
    pub lock_timeout: Duration,
    /// Lock resource name shared by all sweepers against this store.
    pub lock_resource: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30 * 60),
            batch_size: 1000,
            inter_pass_delay: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(30),
            lock_resource: "taskforge:expiration-sweeper".to_string(),
        }
    }
}

impl SweepConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_inter_pass_delay(mut self, delay: Duration) -> Self {
        self.inter_pass_delay = delay;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = StorageConfig::default();
        assert_eq!(config.sweep.batch_size, 1000);
        assert_eq!(config.sweep.inter_pass_delay, Duration::from_secs(1));
        assert_eq!(config.sweep.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.staleness_threshold, Duration::from_secs(1800));
    }

    #[test]
    fn builders_override_fields() {
        let config = StorageConfig::default()
            .with_queue_poll_interval(Duration::from_millis(10))
            .with_sweep(SweepConfig::default().with_batch_size(5));
        assert_eq!(config.queue_poll_interval, Duration::from_millis(10));
        assert_eq!(config.sweep.batch_size, 5);
    }
}
