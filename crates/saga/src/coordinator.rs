//! Saga coordination (mechanics only, no business rules).
//!
//! A saga is a parent job whose handler, in one unit of work:
//! - makes its own business writes,
//! - inserts one child job per step,
//! - is marked completed.
//!
//! Either all of that commits or none of it does. Steps then run as ordinary
//! jobs: each retries or is discarded on its own, and a failing step never
//! undoes its siblings (forward recovery). The saga is finished once every
//! child is completed or discarded.

use async_trait::async_trait;
use tracing::info;

use backbone_core::JobId;
use backbone_jobs::{Handler, JobArgs, JobContext, JobError, JobFilter, JobState, JobStore, NewJob, StoreError};

/// Result of a saga's business writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStart {
    /// The saga is new; its steps will be enqueued.
    Started,
    /// Another run already started it; nothing to fan out.
    AlreadyStarted,
}

/// Saga contract.
///
/// Implementors define the parent kind (through `Args`), the business writes
/// done when the saga starts, and the child jobs it fans out to.
#[async_trait]
pub trait Saga<B: JobStore>: Send + Sync + 'static {
    type Args: JobArgs;

    /// Stable name for logging.
    fn name(&self) -> &'static str;

    /// Business writes, inside the parent's transaction.
    async fn begin(&self, store: &B, tx: &mut B::Tx, args: &Self::Args) -> Result<SagaStart, JobError>;

    /// Child jobs, one per step.
    fn steps(&self, args: &Self::Args) -> Result<Vec<NewJob>, JobError>;
}

/// Runs a [`Saga`] as the handler for its parent kind.
pub struct SagaCoordinator<S> {
    saga: S,
}

impl<S> SagaCoordinator<S> {
    pub fn new(saga: S) -> Self {
        Self { saga }
    }
}

#[async_trait]
impl<B, S> Handler<B> for SagaCoordinator<S>
where
    B: JobStore,
    S: Saga<B>,
{
    type Args = S::Args;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, args: S::Args) -> Result<(), JobError> {
        let store = ctx.backend();
        let tx = ctx.tx().await?;
        if self.saga.begin(store, tx, &args).await? == SagaStart::AlreadyStarted {
            info!(saga = self.saga.name(), job_id = %ctx.job_id(), "saga already started, nothing to do");
            return Ok(());
        }

        let steps = self.saga.steps(&args)?;
        let count = steps.len();
        for step in steps {
            ctx.enqueue_new(step).await?;
        }

        info!(saga = self.saga.name(), job_id = %ctx.job_id(), steps = count, "saga started");
        Ok(())
    }
}

/// Aggregate state of a saga's children.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SagaProgress {
    pub total: usize,
    pub completed: usize,
    pub discarded: usize,
    /// Scheduled, running or waiting for a retry.
    pub pending: usize,
}

impl SagaProgress {
    /// Every step reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.pending == 0
    }

    pub fn is_fully_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Count the children of `parent` by outcome.
pub async fn saga_progress<B: JobStore>(store: &B, parent: JobId) -> Result<SagaProgress, StoreError> {
    let children = store.list(&JobFilter::children_of(parent)).await?;
    let mut progress = SagaProgress {
        total: children.len(),
        ..Default::default()
    };
    for child in &children {
        match child.state {
            JobState::Completed => progress.completed += 1,
            JobState::Discarded => progress.discarded += 1,
            JobState::Scheduled | JobState::Running | JobState::Retryable => progress.pending += 1,
        }
    }
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backbone_jobs::{Dispatcher, DispatcherConfig, EnqueueOptions, JobQueue, MemoryBackend, Registry, RetryPolicy};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Fanout {
        fail_after_fan_out: bool,
    }

    impl JobArgs for Fanout {
        const KIND: &'static str = "fanout";
    }

    #[derive(Serialize, Deserialize)]
    struct Leaf {
        n: u32,
    }

    impl JobArgs for Leaf {
        const KIND: &'static str = "leaf";
    }

    struct FanoutSaga {
        started: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Saga<MemoryBackend> for FanoutSaga {
        type Args = Fanout;

        fn name(&self) -> &'static str {
            "fanout"
        }

        async fn begin(
            &self,
            _store: &MemoryBackend,
            _tx: &mut backbone_jobs::MemoryTx<()>,
            _args: &Fanout,
        ) -> Result<SagaStart, JobError> {
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(SagaStart::AlreadyStarted);
            }
            Ok(SagaStart::Started)
        }

        fn steps(&self, args: &Fanout) -> Result<Vec<NewJob>, JobError> {
            let mut steps = Vec::new();
            for n in 0..2 {
                steps.push(NewJob::typed(&Leaf { n }).map_err(|e| JobError::validation(e.to_string()))?);
            }
            if args.fail_after_fan_out {
                // An unregistered kind makes the enqueue fail after two children were inserted.
                steps.push(NewJob::new("unregistered", serde_json::json!({})));
            }
            Ok(steps)
        }
    }

    struct LeafHandler;

    #[async_trait]
    impl Handler<MemoryBackend> for LeafHandler {
        type Args = Leaf;

        async fn handle(&self, _ctx: &mut JobContext<'_, MemoryBackend>, _args: Leaf) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn dispatcher(started: Arc<AtomicBool>) -> Dispatcher<MemoryBackend> {
        let registry = Registry::<MemoryBackend>::builder()
            .register(SagaCoordinator::new(FanoutSaga { started }))
            .and_then(|b| b.register(LeafHandler))
            .unwrap()
            .build();
        let queue = JobQueue::new(MemoryBackend::arc(), registry.kinds(), 3);
        let config = DispatcherConfig::default().with_retry(RetryPolicy::fixed(1, Duration::ZERO));
        Dispatcher::new(queue, registry, config)
    }

    #[tokio::test]
    async fn parent_failure_after_enqueuing_two_children_leaves_none() {
        let dispatcher = dispatcher(Arc::new(AtomicBool::new(false)));
        let parent = dispatcher
            .queue()
            .enqueue(&Fanout { fail_after_fan_out: true }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.run_once("w").await.unwrap();

        let backend = dispatcher.queue().backend();
        let progress = saga_progress(backend.as_ref(), parent).await.unwrap();
        assert_eq!(progress.total, 0);
        assert_eq!(backend.get(parent).await.unwrap().unwrap().state, JobState::Discarded);
    }

    #[tokio::test]
    async fn children_run_independently_to_completion() {
        let dispatcher = dispatcher(Arc::new(AtomicBool::new(false)));
        let parent = dispatcher
            .queue()
            .enqueue(&Fanout { fail_after_fan_out: false }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.run_once("w").await.unwrap();
        let backend = dispatcher.queue().backend();
        let progress = saga_progress(backend.as_ref(), parent).await.unwrap();
        assert_eq!(progress, SagaProgress { total: 2, completed: 0, discarded: 0, pending: 2 });

        dispatcher.drain("w").await.unwrap();
        let progress = saga_progress(backend.as_ref(), parent).await.unwrap();
        assert!(progress.is_finished());
        assert!(progress.is_fully_completed());
    }

    #[tokio::test]
    async fn already_started_saga_does_not_fan_out_again() {
        let dispatcher = dispatcher(Arc::new(AtomicBool::new(true)));
        let parent = dispatcher
            .queue()
            .enqueue(&Fanout { fail_after_fan_out: false }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.run_once("w").await.unwrap();

        let backend = dispatcher.queue().backend();
        assert_eq!(backend.get(parent).await.unwrap().unwrap().state, JobState::Completed);
        assert_eq!(saga_progress(backend.as_ref(), parent).await.unwrap().total, 0);
    }
}
