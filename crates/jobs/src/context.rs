//! Per-invocation handler context.

use backbone_core::JobId;

use crate::error::{EnqueueError, StoreError};
use crate::queue::JobQueue;
use crate::store::JobStore;
use crate::types::{EnqueueOptions, Job, JobArgs, NewJob};

/// What a handler sees while it runs.
///
/// The context owns the invocation's unit of work. It is opened on first use
/// of [`JobContext::tx`]; the dispatcher marks the job completed inside it and
/// commits only if the handler returns `Ok`. Any error drops it, rolling back
/// the handler's writes and every job it enqueued.
///
/// While the transaction is open, do not call non-transactional store methods
/// on the same backend from the handler: use `tx()` for every read and write.
pub struct JobContext<'a, B: JobStore> {
    queue: &'a JobQueue<B>,
    job: &'a Job,
    tx: Option<B::Tx>,
}

impl<'a, B: JobStore> JobContext<'a, B> {
    pub fn new(queue: &'a JobQueue<B>, job: &'a Job) -> Self {
        Self { queue, job, tx: None }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn queue(&self) -> &'a JobQueue<B> {
        self.queue
    }

    pub fn backend(&self) -> &'a B {
        self.queue.backend()
    }

    /// The invocation's transaction, opened lazily.
    pub async fn tx(&mut self) -> Result<&mut B::Tx, StoreError> {
        if self.tx.is_none() {
            self.tx = Some(self.queue.backend().begin().await?);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::InvalidState("transaction not open".to_string()))
    }

    pub fn has_tx(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue a child job in this invocation's transaction.
    pub async fn enqueue<A: JobArgs>(&mut self, args: &A, options: EnqueueOptions) -> Result<JobId, EnqueueError> {
        self.enqueue_new(NewJob::typed(args)?.with_options(options)).await
    }

    pub async fn enqueue_new(&mut self, new: NewJob) -> Result<JobId, EnqueueError> {
        let queue = self.queue;
        let parent = self.job.id;
        let tx = self.tx().await?;
        queue.enqueue_new_in(tx, new.child_of(parent)).await
    }

    pub(crate) fn into_tx(self) -> Option<B::Tx> {
        self.tx
    }
}
