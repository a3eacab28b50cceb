//! `taskforge-storage` — relational job-queue storage engine.
//!
//! Persists jobs, queues, distributed locks, key/value structures, and
//! server heartbeats in PostgreSQL, layering atomic queue semantics and
//! cross-process mutual exclusion on top of plain rows and transactions.
//!
//! ## Design
//!
//! - All coordination is backend-side: the two exactly-one-claimant
//!   operations (queue claim, lock acquisition) are single atomic
//!   statements, never check-then-act across round trips.
//! - Capability traits ([`queue::QueueProvider`], [`lock::LeaseStore`],
//!   [`sweep::SweepStore`], [`jobs::JobStore`], [`kv::KeyValueStore`],
//!   [`counters::CounterStore`], [`server::ServerRegistry`]) form the seam
//!   between the engine and the host scheduler; [`session::Storage`]
//!   implements them against Postgres, [`memory::InMemoryGrid`] against a
//!   mutex for tests and development.
//! - Background loops (dequeue polling, expiration sweeping) are plain
//!   `async fn`s the host spawns; every sleep observes a
//!   `CancellationToken`.

pub mod config;
pub mod counters;
pub mod jobs;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod schema;
pub mod server;
pub mod session;
pub mod statements;
pub mod sweep;

#[cfg(test)]
mod integration_tests;

pub use config::{StorageConfig, SweepConfig};
pub use counters::CounterStore;
pub use jobs::JobStore;
pub use kv::KeyValueStore;
pub use lock::{LeaseStore, LockGuard, LockManager};
pub use memory::InMemoryGrid;
pub use queue::{ClaimedEntry, ClaimedJob, Dequeuer, ProviderRegistry, QueueProvider};
pub use server::ServerRegistry;
pub use session::{IsolationLevel, Session, Storage};
pub use sweep::{ExpirationSweeper, SweepStore};
