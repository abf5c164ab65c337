//! Operator views over the job table.

use serde::Serialize;

use backbone_core::JobId;
use backbone_jobs::{Job, JobFilter, JobStats, JobStore, StoreError};
use backbone_saga::{SagaProgress, saga_progress};

/// Discarded jobs, newest first, with their last error.
pub async fn discarded<B: JobStore>(store: &B, limit: usize) -> Result<Vec<Job>, StoreError> {
    store.list(&JobFilter::discarded(limit)).await
}

/// Put a discarded job back on the queue with a fresh attempt budget.
pub async fn requeue<B: JobStore>(store: &B, id: JobId) -> Result<Job, StoreError> {
    let job = store.requeue(id).await?;
    tracing::info!(job_id = %job.id, kind = %job.kind, "discarded job requeued by operator");
    Ok(job)
}

pub async fn stats<B: JobStore>(store: &B) -> Result<JobStats, StoreError> {
    store.stats().await
}

/// A saga parent and where each of its steps stands.
#[derive(Debug, Clone, Serialize)]
pub struct SagaReport {
    pub parent: Job,
    pub progress: SagaProgress,
    pub steps: Vec<Job>,
}

pub async fn saga<B: JobStore>(store: &B, parent: JobId) -> Result<Option<SagaReport>, StoreError> {
    let Some(job) = store.get(parent).await? else {
        return Ok(None);
    };
    let progress = saga_progress(store, parent).await?;
    let steps = store.list(&JobFilter::children_of(parent)).await?;
    Ok(Some(SagaReport {
        parent: job,
        progress,
        steps,
    }))
}
