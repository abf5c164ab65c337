//! Handler wrapper that submits each target at most once.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use backbone_jobs::{Handler, JobContext, JobError};

use crate::external::{ExternalSystem, SubmissionRequest};
use crate::marker::{IdempotencyMarker, MarkerStore};

/// Runs `R` jobs against an [`ExternalSystem`].
///
/// 1. A marker on the target means the effect already happened: complete.
/// 2. On a retry, ask the system whether it already accepted the key. This
///    covers an earlier attempt that was accepted remotely but whose marker
///    never committed.
/// 3. Otherwise submit, then record the marker in the job's transaction. If
///    that commit fails the job is retried and step 2 picks up the reference.
pub struct IdempotentSubmitter<R: SubmissionRequest> {
    system: Arc<dyn ExternalSystem<R>>,
    _request: PhantomData<fn() -> R>,
}

impl<R: SubmissionRequest> IdempotentSubmitter<R> {
    pub fn new(system: Arc<dyn ExternalSystem<R>>) -> Self {
        Self {
            system,
            _request: PhantomData,
        }
    }
}

#[async_trait]
impl<B: MarkerStore, R: SubmissionRequest> Handler<B> for IdempotentSubmitter<R> {
    type Args = R;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, request: R) -> Result<(), JobError> {
        let store = ctx.backend();
        let target = request.target();
        let key = request.idempotency_key();
        let system = self.system.name();

        if let Some(marker) = store.marker(&target).await? {
            info!(%target, system, reference = %marker.reference, "already submitted, skipping external call");
            return Ok(());
        }

        let recovered = if ctx.attempt() > 1 {
            self.system.lookup(&key).await?
        } else {
            None
        };

        let reference = match recovered {
            Some(reference) => {
                warn!(%target, system, %reference, attempt = ctx.attempt(), "recovered reference of an earlier submission");
                reference
            }
            None => {
                let reference = self.system.submit(&key, &request).await?;
                info!(%target, system, %reference, "submission accepted");
                reference
            }
        };
        if reference.trim().is_empty() {
            return Err(JobError::external(format!("{system} returned an empty reference")));
        }

        let tx = ctx.tx().await?;
        store
            .record_marker(tx, &IdempotencyMarker::new(target, system, reference))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customs::CustomsDeclaration;
    use crate::external::ExternalError;
    use crate::marker::MarkerTables;
    use backbone_core::MovementId;
    use backbone_jobs::{
        Dispatcher, DispatcherConfig, EnqueueOptions, JobQueue, JobState, JobStore, MemoryBackend, Registry,
        RetryPolicy,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    type Backend = MemoryBackend<MarkerTables>;

    #[derive(Default)]
    struct CustomsDouble {
        accepted: Mutex<HashMap<String, String>>,
        submits: AtomicU32,
        lookups: AtomicU32,
        unavailable_first: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl ExternalSystem<CustomsDeclaration> for CustomsDouble {
        fn name(&self) -> &'static str {
            "customs"
        }

        async fn lookup(&self, key: &str) -> Result<Option<String>, ExternalError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.accepted.lock().unwrap().get(key).cloned())
        }

        async fn submit(&self, key: &str, _request: &CustomsDeclaration) -> Result<String, ExternalError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject {
                return Err(ExternalError::Rejected { system: "customs", message: "missing HS code".into() });
            }
            if n <= self.unavailable_first.load(Ordering::SeqCst) {
                return Err(ExternalError::Unavailable { system: "customs", message: "503".into() });
            }
            let reference = format!("CLR-{n}");
            self.accepted.lock().unwrap().insert(key.to_string(), reference.clone());
            Ok(reference)
        }
    }

    fn dispatcher(customs: Arc<CustomsDouble>) -> Dispatcher<Backend> {
        let registry = Registry::<Backend>::builder()
            .register(IdempotentSubmitter::<CustomsDeclaration>::new(customs))
            .unwrap()
            .build();
        let queue = JobQueue::new(Backend::arc(), registry.kinds(), 5);
        Dispatcher::new(
            queue,
            registry,
            DispatcherConfig::default().with_retry(RetryPolicy::fixed(5, Duration::ZERO)),
        )
    }

    fn declaration(movement_id: MovementId) -> CustomsDeclaration {
        CustomsDeclaration {
            movement_id,
            sku: "SKU-7".into(),
            quantity: 12,
            destination: "CH".into(),
        }
    }

    #[tokio::test]
    async fn second_run_for_the_same_movement_does_not_call_out() {
        let customs = Arc::new(CustomsDouble::default());
        let dispatcher = dispatcher(customs.clone());
        let queue = dispatcher.queue();
        let movement = MovementId::new();

        let first = queue.enqueue(&declaration(movement), EnqueueOptions::default()).await.unwrap();
        dispatcher.drain("w").await.unwrap();
        let second = queue.enqueue(&declaration(movement), EnqueueOptions::default()).await.unwrap();
        dispatcher.drain("w").await.unwrap();

        assert_eq!(customs.submits.load(Ordering::SeqCst), 1);
        for id in [first, second] {
            assert_eq!(queue.backend().get(id).await.unwrap().unwrap().state, JobState::Completed);
        }
    }

    #[tokio::test]
    async fn lost_marker_commit_is_recovered_without_resubmitting() {
        let customs = Arc::new(CustomsDouble::default());
        let dispatcher = dispatcher(customs.clone());
        let queue = dispatcher.queue();
        let movement = MovementId::new();

        let id = queue.enqueue(&declaration(movement), EnqueueOptions::default()).await.unwrap();
        queue.backend().fail_next_commit();
        dispatcher.drain("w").await.unwrap();

        assert_eq!(customs.submits.load(Ordering::SeqCst), 1);
        assert_eq!(customs.lookups.load(Ordering::SeqCst), 1);

        let job = queue.backend().get(id).await.unwrap().unwrap();
        assert_eq!((job.state, job.attempt), (JobState::Completed, 2));

        let target = declaration(movement).target();
        assert_eq!(queue.backend().marker(&target).await.unwrap().unwrap().reference, "CLR-1");
    }

    #[tokio::test]
    async fn unavailable_system_is_retried() {
        let customs = Arc::new(CustomsDouble {
            unavailable_first: AtomicU32::new(2),
            ..Default::default()
        });
        let dispatcher = dispatcher(customs.clone());
        let id = dispatcher
            .queue()
            .enqueue(&declaration(MovementId::new()), EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.drain("w").await.unwrap();

        let job = dispatcher.queue().backend().get(id).await.unwrap().unwrap();
        assert_eq!((job.state, job.attempt), (JobState::Completed, 3));
        assert_eq!(customs.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_discarded_without_marker() {
        let customs = Arc::new(CustomsDouble {
            reject: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(customs.clone());
        let movement = MovementId::new();
        let id = dispatcher
            .queue()
            .enqueue(&declaration(movement), EnqueueOptions::default())
            .await
            .unwrap();

        dispatcher.drain("w").await.unwrap();

        let backend = dispatcher.queue().backend();
        let job = backend.get(id).await.unwrap().unwrap();
        assert_eq!((job.state, job.attempt), (JobState::Discarded, 1));
        assert!(job.last_error.unwrap().contains("missing HS code"));
        assert!(backend.marker(&declaration(movement).target()).await.unwrap().is_none());
    }
}
