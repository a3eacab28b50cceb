//! Storage error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the storage engine.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-level error.
///
/// The first four variants are the coordination-layer taxonomy callers are
/// expected to match on. `TransientBackend` is recoverable by discarding the
/// attempt and retrying; background loops swallow it, foreground operations
/// propagate it.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The distributed lock could not be acquired within the deadline.
    /// Recoverable: the resource is busy, not broken.
    #[error("lock on {resource:?} not acquired within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    /// Lock acquisition was abandoned because the caller cancelled.
    #[error("lock acquisition on {resource:?} cancelled")]
    LockCancelled { resource: String },

    /// A blocking operation (dequeue poll) was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The requested queue names resolve to more than one queue provider.
    /// Configuration error, fatal to the calling request.
    #[error("queues map to multiple providers: {0}")]
    MixedQueueProviders(String),

    /// Deadlock, statement timeout, or connection failure from the backend.
    /// Recovered by discarding the attempt and retrying.
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// Schema verification/creation failed. Fatal, surfaced at startup.
    #[error("schema bootstrap failed: {0}")]
    SchemaBootstrap(String),

    /// A nested operation requested a different isolation level than the
    /// ambient session. Configuration error.
    #[error("isolation conflict: requested {requested}, session is {active}")]
    IsolationConflict { requested: String, active: String },

    /// Any other backend failure (constraint violations surfaced to the
    /// caller, malformed rows, unexpected states).
    #[error("backend error: {0}")]
    Backend(String),

    /// A value could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientBackend(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for errors a retry loop may absorb without losing correctness.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend(_))
    }

    /// True for the lock-unavailable family (timeout or cancellation).
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::LockCancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StorageError::transient("deadlock").is_transient());
        assert!(!StorageError::backend("constraint").is_transient());
    }

    #[test]
    fn lock_unavailable_covers_timeout_and_cancel() {
        let timeout = StorageError::LockTimeout {
            resource: "sweep".into(),
            timeout: Duration::from_secs(30),
        };
        let cancelled = StorageError::LockCancelled {
            resource: "sweep".into(),
        };
        assert!(timeout.is_lock_unavailable());
        assert!(cancelled.is_lock_unavailable());
        assert!(!StorageError::Cancelled.is_lock_unavailable());
    }
}
