//! `backbone-jobs`: durable job queue and worker dispatch.
//!
//! - [`JobStore`] persists jobs next to the business tables ([`PgBackend`] in
//!   production, [`MemoryBackend`] for tests and development).
//! - [`JobQueue`] enqueues, standalone or inside a caller's transaction.
//! - [`Registry`] maps kinds to typed [`Handler`]s; [`Dispatcher`] runs them
//!   with leases, heartbeats, timeouts and exponential backoff.
//!
//! Delivery is at-least-once: a job whose executor dies stays `running` until
//! its lease expires and is then claimed again. Handlers must be idempotent.

pub mod context;
pub mod error;
pub mod executor;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod store;
pub mod types;

pub use context::JobContext;
pub use error::{EnqueueError, JobError, RegistryError, StoreError};
pub use executor::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, Outcome};
pub use memory::{MemoryBackend, MemoryTx};
pub use postgres::PgBackend;
pub use queue::JobQueue;
pub use registry::{DynHandler, Handler, Registry, RegistryBuilder};
pub use store::{Backend, JobStore};
pub use types::{
    BackoffStrategy, Disposition, EnqueueOptions, Failure, Job, JobArgs, JobFilter, JobOrder, JobState, JobStats, Lease,
    LeaseToken, NewJob, Priority, RetryPolicy,
};

// Re-exported so implementors don't need a direct dependency.
pub use async_trait::async_trait;
