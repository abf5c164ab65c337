//! Handlers for the three offboarding steps.
//!
//! Each step calls its collaborator first, with no transaction open, then
//! records itself on the case inside the job's unit of work. A collaborator
//! that reports the work as already done counts as success, so a retried step
//! never fails on its own earlier effect.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use backbone_jobs::{Handler, JobArgs, JobContext, JobError};

use super::collaborators::{AccessControl, AssetRegistry, CollaboratorError, Telephony};
use super::store::OffboardingStore;
use super::{CleanupAssets, ForwardCalls, RevokeCredentials, UserId};

async fn record_step<B: OffboardingStore>(
    ctx: &mut JobContext<'_, B>,
    user: UserId,
    step: &'static str,
) -> Result<(), JobError> {
    let store = ctx.backend();
    let tx = ctx.tx().await?;
    store.record_step(tx, user, step).await?;
    Ok(())
}

fn already_done(result: Result<(), CollaboratorError>, step: &'static str, user: UserId) -> Result<(), JobError> {
    match result {
        Ok(()) => Ok(()),
        Err(CollaboratorError::AlreadyDone { system }) => {
            info!(step, system, user_id = %user, "step already applied, treating as done");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub struct RevokeCredentialsHandler {
    access: Arc<dyn AccessControl>,
}

impl RevokeCredentialsHandler {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl<B: OffboardingStore> Handler<B> for RevokeCredentialsHandler {
    type Args = RevokeCredentials;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, args: RevokeCredentials) -> Result<(), JobError> {
        already_done(self.access.revoke_all(args.user_id).await, RevokeCredentials::KIND, args.user_id)?;
        record_step(ctx, args.user_id, RevokeCredentials::KIND).await
    }
}

pub struct CleanupAssetsHandler {
    assets: Arc<dyn AssetRegistry>,
}

impl CleanupAssetsHandler {
    pub fn new(assets: Arc<dyn AssetRegistry>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl<B: OffboardingStore> Handler<B> for CleanupAssetsHandler {
    type Args = CleanupAssets;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, args: CleanupAssets) -> Result<(), JobError> {
        let result = match self.assets.reclaim_assets(args.user_id).await {
            Ok(flagged) => {
                info!(user_id = %args.user_id, flagged, "assets flagged for return");
                Ok(())
            }
            Err(e) => Err(e),
        };
        already_done(result, CleanupAssets::KIND, args.user_id)?;
        record_step(ctx, args.user_id, CleanupAssets::KIND).await
    }
}

pub struct ForwardCallsHandler {
    telephony: Arc<dyn Telephony>,
}

impl ForwardCallsHandler {
    pub fn new(telephony: Arc<dyn Telephony>) -> Self {
        Self { telephony }
    }
}

#[async_trait]
impl<B: OffboardingStore> Handler<B> for ForwardCallsHandler {
    type Args = ForwardCalls;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, args: ForwardCalls) -> Result<(), JobError> {
        already_done(self.telephony.forward_calls(args.user_id).await, ForwardCalls::KIND, args.user_id)?;
        record_step(ctx, args.user_id, ForwardCalls::KIND).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{SagaCoordinator, saga_progress};
    use crate::offboarding::{Offboard, OffboardingSaga, OffboardingTables};
    use backbone_jobs::{
        Dispatcher, DispatcherConfig, EnqueueOptions, JobQueue, JobState, JobStore, MemoryBackend, Registry,
        RetryPolicy,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    type Backend = MemoryBackend<OffboardingTables>;

    struct Scripted {
        failures_left: AtomicU32,
        error: CollaboratorError,
        calls: AtomicU32,
    }

    impl Scripted {
        fn ok() -> Arc<Self> {
            Self::failing(0, CollaboratorError::Unavailable { system: "test", message: String::new() })
        }

        fn failing(times: u32, error: CollaboratorError) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(times),
                error,
                calls: AtomicU32::new(0),
            })
        }

        fn next(&self) -> Result<(), CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AccessControl for Scripted {
        async fn revoke_all(&self, _user: UserId) -> Result<(), CollaboratorError> {
            self.next()
        }
    }

    #[async_trait]
    impl AssetRegistry for Scripted {
        async fn reclaim_assets(&self, _user: UserId) -> Result<u32, CollaboratorError> {
            self.next().map(|_| 2)
        }
    }

    #[async_trait]
    impl Telephony for Scripted {
        async fn forward_calls(&self, _user: UserId) -> Result<(), CollaboratorError> {
            self.next()
        }
    }

    fn dispatcher(access: Arc<Scripted>, assets: Arc<Scripted>, phone: Arc<Scripted>) -> Dispatcher<Backend> {
        let registry = Registry::<Backend>::builder()
            .register(SagaCoordinator::new(OffboardingSaga))
            .and_then(|b| b.register(RevokeCredentialsHandler::new(access)))
            .and_then(|b| b.register(CleanupAssetsHandler::new(assets)))
            .and_then(|b| b.register(ForwardCallsHandler::new(phone)))
            .unwrap()
            .build();
        let queue = JobQueue::new(Backend::arc(), registry.kinds(), 5);
        Dispatcher::new(
            queue,
            registry,
            DispatcherConfig::default().with_retry(RetryPolicy::fixed(5, Duration::ZERO)),
        )
    }

    #[tokio::test]
    async fn rejected_step_is_discarded_without_touching_siblings() {
        let rejected = Scripted::failing(
            u32::MAX,
            CollaboratorError::Rejected { system: "telephony", message: "unknown extension".into() },
        );
        let dispatcher = dispatcher(Scripted::ok(), Scripted::ok(), rejected.clone());
        let parent = dispatcher
            .queue()
            .enqueue(&Offboard { user_id: UserId(9) }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.drain("w").await.unwrap();

        let backend = dispatcher.queue().backend();
        let progress = saga_progress(backend.as_ref(), parent).await.unwrap();
        assert_eq!((progress.completed, progress.discarded, progress.pending), (2, 1, 0));
        assert_eq!(rejected.calls.load(Ordering::SeqCst), 1);

        let case = backend.offboarding_case(UserId(9)).await.unwrap().unwrap();
        assert!(case.steps_done.contains("credential-revocation"));
        assert!(case.steps_done.contains("asset-cleanup"));
        assert!(!case.steps_done.contains("call-forwarding"));
    }

    #[tokio::test]
    async fn already_done_counts_as_success() {
        let done = Scripted::failing(1, CollaboratorError::AlreadyDone { system: "iam" });
        let dispatcher = dispatcher(done, Scripted::ok(), Scripted::ok());
        let parent = dispatcher
            .queue()
            .enqueue(&Offboard { user_id: UserId(3) }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.drain("w").await.unwrap();

        let backend = dispatcher.queue().backend();
        assert!(saga_progress(backend.as_ref(), parent).await.unwrap().is_fully_completed());
    }

    #[tokio::test]
    async fn second_offboard_for_same_user_is_a_no_op() {
        let dispatcher = dispatcher(Scripted::ok(), Scripted::ok(), Scripted::ok());
        let first = dispatcher
            .queue()
            .enqueue(&Offboard { user_id: UserId(5) }, EnqueueOptions::default())
            .await
            .unwrap();
        let second = dispatcher
            .queue()
            .enqueue(&Offboard { user_id: UserId(5) }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.drain("w").await.unwrap();

        let backend = dispatcher.queue().backend();
        assert_eq!(saga_progress(backend.as_ref(), first).await.unwrap().total, 3);
        assert_eq!(saga_progress(backend.as_ref(), second).await.unwrap().total, 0);
        assert_eq!(backend.get(second).await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn invalid_user_id_is_discarded() {
        let dispatcher = dispatcher(Scripted::ok(), Scripted::ok(), Scripted::ok());
        let parent = dispatcher
            .queue()
            .enqueue(&Offboard { user_id: UserId(0) }, EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.drain("w").await.unwrap();

        let job = dispatcher.queue().backend().get(parent).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.attempt, 1);
    }
}
