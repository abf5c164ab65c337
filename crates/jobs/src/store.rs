//! Storage abstraction shared by the job table and the business tables.
//!
//! A [`Backend`] owns the transactional resource. Job operations and domain
//! operations both take `&mut Backend::Tx`, so a handler can write business
//! rows and enqueue follow-up jobs in one unit of work.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use backbone_core::JobId;

use crate::error::StoreError;
use crate::types::{Failure, Job, JobFilter, JobStats, LeaseToken};

/// A transactional store.
///
/// Dropping a `Tx` without committing rolls it back.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;
}

/// Durable job table.
#[async_trait]
pub trait JobStore: Backend {
    /// Insert a job inside an open transaction. Invisible to `claim` until commit.
    async fn insert_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError>;

    /// Claim the next ready job of one of `kinds` for `worker`, leasing it for `lease`.
    ///
    /// Ready means scheduled/retryable and due, or running on an expired lease.
    /// Running jobs whose lease expired on their final attempt are discarded
    /// instead of claimed. Two concurrent claims never return the same job.
    async fn claim(
        &self,
        worker: &str,
        kinds: &[String],
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Extend the lease. Fails with `LeaseLost` if `token` no longer holds it.
    async fn heartbeat(&self, id: JobId, token: LeaseToken, lease: Duration) -> Result<(), StoreError>;

    /// Mark completed inside the handler's transaction.
    async fn complete(&self, tx: &mut Self::Tx, id: JobId, token: LeaseToken) -> Result<(), StoreError>;

    /// Record a failed attempt.
    async fn fail(&self, id: JobId, token: LeaseToken, failure: &Failure) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Move a discarded job back to scheduled with a fresh attempt budget.
    async fn requeue(&self, id: JobId) -> Result<Job, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;
}
