//! Enqueue API.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use backbone_core::JobId;

use crate::error::EnqueueError;
use crate::store::JobStore;
use crate::types::{EnqueueOptions, Job, JobArgs, NewJob};

/// Handle used by request handlers, job handlers and cascades to enqueue work.
///
/// Only kinds that have a registered handler are accepted, so a typo fails at
/// the call site instead of producing a job nobody will ever run.
pub struct JobQueue<B: JobStore> {
    backend: Arc<B>,
    kinds: Arc<BTreeSet<String>>,
    default_max_attempts: u32,
}

impl<B: JobStore> Clone for JobQueue<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            kinds: self.kinds.clone(),
            default_max_attempts: self.default_max_attempts,
        }
    }
}

impl<B: JobStore> JobQueue<B> {
    pub fn new(backend: Arc<B>, kinds: impl IntoIterator<Item = String>, default_max_attempts: u32) -> Self {
        Self {
            backend,
            kinds: Arc::new(kinds.into_iter().collect()),
            default_max_attempts: default_max_attempts.max(1),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.iter().map(String::as_str)
    }

    /// Enqueue in its own transaction.
    pub async fn enqueue<A: JobArgs>(&self, args: &A, options: EnqueueOptions) -> Result<JobId, EnqueueError> {
        self.enqueue_new(NewJob::typed(args)?.with_options(options)).await
    }

    /// Enqueue inside `tx`; the job becomes claimable when `tx` commits.
    pub async fn enqueue_in<A: JobArgs>(
        &self,
        tx: &mut B::Tx,
        args: &A,
        options: EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue_new_in(tx, NewJob::typed(args)?.with_options(options)).await
    }

    /// Untyped enqueue by kind string.
    pub async fn enqueue_new(&self, new: NewJob) -> Result<JobId, EnqueueError> {
        let mut tx = self.backend.begin().await?;
        let id = self.enqueue_new_in(&mut tx, new).await?;
        self.backend.commit(tx).await?;
        Ok(id)
    }

    pub async fn enqueue_new_in(&self, tx: &mut B::Tx, new: NewJob) -> Result<JobId, EnqueueError> {
        if !self.knows(&new.kind) {
            return Err(EnqueueError::UnknownKind(new.kind));
        }
        let job = Job::from_new(new, self.default_max_attempts, Utc::now());
        self.backend.insert_job(tx, &job).await?;
        debug!(
            job_id = %job.id,
            kind = %job.kind,
            scheduled_at = %job.scheduled_at,
            parent_id = ?job.parent_id,
            "job enqueued"
        );
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::store::Backend;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl JobArgs for Ping {
        const KIND: &'static str = "ping";
    }

    fn queue() -> JobQueue<MemoryBackend> {
        JobQueue::new(MemoryBackend::arc(), ["ping".to_string()], 3)
    }

    #[tokio::test]
    async fn rejects_unknown_kind() {
        let queue = queue();
        let err = queue
            .enqueue_new(NewJob::new("pong", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::UnknownKind(k) if k == "pong"));
    }

    #[tokio::test]
    async fn enqueue_applies_default_attempts_and_schedule() {
        let queue = queue();
        let at = Utc::now() + chrono::Duration::minutes(5);
        let id = queue.enqueue(&Ping, EnqueueOptions::at(at)).await.unwrap();

        let job = queue.backend().get(id).await.unwrap().unwrap();
        assert_eq!(job.kind, "ping");
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.scheduled_at, at);
        assert!(!job.is_claimable(Utc::now()));
    }

    #[tokio::test]
    async fn enqueue_in_rolled_back_tx_leaves_nothing() {
        let queue = queue();
        let backend = queue.backend().clone();

        let mut tx = backend.begin().await.unwrap();
        let id = queue.enqueue_in(&mut tx, &Ping, EnqueueOptions::default()).await.unwrap();
        backend.rollback(tx).await.unwrap();

        assert!(backend.get(id).await.unwrap().is_none());
    }
}
