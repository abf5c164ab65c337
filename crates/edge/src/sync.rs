//! Periodic, order-preserving replay of the local buffer.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferError, EdgeOperation, LocalBuffer, Payload};
use crate::primary::Primary;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Failed replays after which an operation is reported as stuck.
    pub stuck_after: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 50,
            stuck_after: 5,
        }
    }
}

/// Result of one pass over the buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    /// Local id of the operation the pass stopped at, if any.
    pub blocked_at: Option<i64>,
    pub last_error: Option<String>,
}

impl DrainReport {
    pub fn is_blocked(&self) -> bool {
        self.blocked_at.is_some()
    }
}

/// Sole consumer of one [`LocalBuffer`].
pub struct SyncWorker<T: EdgeOperation> {
    buffer: LocalBuffer<T>,
    primary: Arc<dyn Primary<T>>,
    config: SyncConfig,
}

impl<T: EdgeOperation> SyncWorker<T> {
    pub fn new(buffer: LocalBuffer<T>, primary: Arc<dyn Primary<T>>, config: SyncConfig) -> Self {
        Self { buffer, primary, config }
    }

    /// Replay the oldest batch. Stops at the first failure without skipping it.
    ///
    /// An undecodable row counts as a failed replay, so it surfaces through
    /// [`LocalBuffer::stuck`] instead of blocking silently.
    pub async fn drain_once(&self) -> Result<DrainReport, BufferError> {
        let _order = self.buffer.order_lock().await;
        let batch = self.buffer.drain_batch(self.config.batch_size.max(1)).await?;
        let mut report = DrainReport::default();

        for op in batch {
            let applied = match &op.payload {
                Payload::Decoded(payload) => self.primary.apply(payload).await.map_err(|e| e.to_string()),
                Payload::Corrupt { error, .. } => Err(format!("corrupt payload: {error}")),
            };
            match applied {
                Ok(()) => {
                    self.buffer.delete(&[op.local_id]).await?;
                    report.applied += 1;
                }
                Err(reason) => {
                    let attempts = self.buffer.record_failure(op.local_id, &reason).await?;
                    if attempts >= self.config.stuck_after {
                        error!(
                            family = T::FAMILY,
                            local_id = op.local_id,
                            attempts,
                            last_error = %reason,
                            "buffered operation stuck, blocking replay of everything behind it"
                        );
                    } else {
                        warn!(family = T::FAMILY, local_id = op.local_id, attempts, error = %reason, "replay failed, will retry next tick");
                    }
                    report.blocked_at = Some(op.local_id);
                    report.last_error = Some(reason);
                    break;
                }
            }
        }

        if report.applied > 0 {
            info!(family = T::FAMILY, applied = report.applied, "buffered operations replayed");
        }
        Ok(report)
    }

    /// Drain batch after batch until the buffer is empty or a replay fails.
    pub async fn drain_all(&self) -> Result<DrainReport, BufferError> {
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_once().await?;
            total.applied += report.applied;
            if report.is_blocked() {
                total.blocked_at = report.blocked_at;
                total.last_error = report.last_error;
                return Ok(total);
            }
            if report.applied == 0 {
                return Ok(total);
            }
        }
    }

    /// Run `drain_all` on every tick until shut down.
    pub fn spawn(self) -> SyncHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let interval = self.config.interval;

        let task = tokio::spawn(async move {
            info!(family = T::FAMILY, interval_ms = interval.as_millis() as u64, "sync worker started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match self.drain_all().await {
                            Ok(report) => debug!(family = T::FAMILY, applied = report.applied, blocked = report.is_blocked(), "sync tick"),
                            Err(e) => error!(family = T::FAMILY, error = %e, "sync tick failed"),
                        }
                    }
                }
            }

            info!(family = T::FAMILY, "sync worker stopped");
        });

        SyncHandle { shutdown: shutdown_tx, task }
    }
}

#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop ticking; an in-progress pass finishes first, up to `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
            warn!("sync worker did not stop within the grace period");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primary::PrimaryError;
    use crate::recorder::{EdgeRecorder, Recorded};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Op(String);

    impl EdgeOperation for Op {
        const FAMILY: &'static str = "test";
    }

    /// Applies in memory; can be taken offline or made to fail on one op.
    #[derive(Default)]
    struct ScriptedPrimary {
        applied: Mutex<Vec<String>>,
        offline: Mutex<bool>,
        fail_on: Mutex<Option<String>>,
    }

    impl ScriptedPrimary {
        fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Primary<Op> for ScriptedPrimary {
        async fn apply(&self, op: &Op) -> Result<(), PrimaryError> {
            if *self.offline.lock().unwrap() {
                return Err(PrimaryError::Unreachable("connection refused".into()));
            }
            if self.fail_on.lock().unwrap().as_deref() == Some(op.0.as_str()) {
                return Err(PrimaryError::Unreachable("timeout".into()));
            }
            self.applied.lock().unwrap().push(op.0.clone());
            Ok(())
        }
    }

    async fn setup(batch_size: usize) -> (Arc<ScriptedPrimary>, LocalBuffer<Op>, SyncWorker<Op>) {
        let primary = Arc::new(ScriptedPrimary::default());
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        let worker = SyncWorker::new(
            buffer.clone(),
            primary.clone(),
            SyncConfig { batch_size, stuck_after: 2, ..SyncConfig::default() },
        );
        (primary, buffer, worker)
    }

    #[tokio::test]
    async fn failure_on_b_keeps_b_and_c_and_later_replays_in_order() {
        let (primary, buffer, worker) = setup(10).await;
        for name in ["A", "B", "C"] {
            buffer.append(&Op(name.into())).await.unwrap();
        }

        *primary.fail_on.lock().unwrap() = Some("B".into());
        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(primary.applied(), ["A"]);
        let left: Vec<_> = buffer
            .drain_batch(10)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|o| o.payload.decoded().map(|op| op.0.clone()))
            .collect();
        assert_eq!(left, ["B", "C"]);

        *primary.fail_on.lock().unwrap() = None;
        let report = worker.drain_once().await.unwrap();
        assert_eq!(report, DrainReport { applied: 2, blocked_at: None, last_error: None });
        assert_eq!(primary.applied(), ["A", "B", "C"]);
        assert!(buffer.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn repeated_failure_marks_the_head_stuck() {
        let (primary, buffer, worker) = setup(10).await;
        let head = buffer.append(&Op("A".into())).await.unwrap();
        buffer.append(&Op("B".into())).await.unwrap();
        *primary.offline.lock().unwrap() = true;

        worker.drain_once().await.unwrap();
        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.blocked_at, Some(head));

        let stuck = buffer.stuck(2).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].attempts, 2);
        assert!(primary.applied().is_empty());
    }

    #[tokio::test]
    async fn corrupt_head_is_counted_and_reported_stuck() {
        let (primary, buffer, worker) = setup(10).await;
        let head = sqlx::query("INSERT INTO buffered_operations (family, payload, created_at) VALUES (?1, ?2, ?3)")
            .bind(Op::FAMILY)
            .bind("[1, 2, 3]")
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(buffer.pool())
            .await
            .unwrap()
            .last_insert_rowid();
        buffer.append(&Op("B".into())).await.unwrap();

        worker.drain_once().await.unwrap();
        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.blocked_at, Some(head));
        assert!(report.last_error.unwrap().starts_with("corrupt payload"));
        assert!(primary.applied().is_empty());

        let stuck = buffer.stuck(2).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].local_id, head);
        assert!(matches!(&stuck[0].payload, Payload::Corrupt { raw, .. } if raw == "[1, 2, 3]"));

        // An operator removes the row and replay resumes behind it.
        buffer.delete(&[head]).await.unwrap();
        worker.drain_once().await.unwrap();
        assert_eq!(primary.applied(), ["B"]);
    }

    #[tokio::test]
    async fn drain_all_walks_every_batch() {
        let (primary, buffer, worker) = setup(2).await;
        for n in 0..5 {
            buffer.append(&Op(n.to_string())).await.unwrap();
        }

        let report = worker.drain_all().await.unwrap();
        assert_eq!(report.applied, 5);
        assert_eq!(primary.applied(), ["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn recorder_buffers_when_offline_and_never_overtakes() {
        let (primary, buffer, worker) = setup(10).await;
        let recorder = EdgeRecorder::new(primary.clone(), buffer.clone());

        *primary.offline.lock().unwrap() = true;
        assert!(matches!(recorder.record(&Op("A".into())).await.unwrap(), Recorded::Buffered { .. }));

        // Back online, but A is still buffered: B must queue behind it.
        *primary.offline.lock().unwrap() = false;
        assert!(matches!(recorder.record(&Op("B".into())).await.unwrap(), Recorded::Buffered { .. }));
        assert!(primary.applied().is_empty());

        worker.drain_once().await.unwrap();
        assert_eq!(recorder.record(&Op("C".into())).await.unwrap(), Recorded::Applied);
        assert_eq!(primary.applied(), ["A", "B", "C"]);
    }

    /// The first apply stalls and then reports the primary unreachable.
    #[derive(Default)]
    struct StallingPrimary {
        calls: Mutex<u32>,
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Primary<Op> for StallingPrimary {
        async fn apply(&self, op: &Op) -> Result<(), PrimaryError> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls == 1
            };
            if first {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Err(PrimaryError::Unreachable("timeout".into()));
            }
            self.applied.lock().unwrap().push(op.0.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_records_keep_call_order() {
        let primary = Arc::new(StallingPrimary::default());
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        let recorder = EdgeRecorder::new(primary.clone(), buffer.clone());

        let first = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.record(&Op("A".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // A is still in flight; B must not reach the primary ahead of it.
        let second = recorder.record(&Op("B".into())).await.unwrap();

        assert!(matches!(first.await.unwrap().unwrap(), Recorded::Buffered { .. }));
        assert!(matches!(second, Recorded::Buffered { .. }));
        assert!(primary.applied.lock().unwrap().is_empty());

        let worker = SyncWorker::new(buffer.clone(), primary.clone(), SyncConfig::default());
        assert_eq!(worker.drain_all().await.unwrap().applied, 2);
        assert_eq!(primary.applied.lock().unwrap().as_slice(), ["A", "B"]);
    }

    #[tokio::test]
    async fn spawned_worker_drains_on_tick_and_stops() {
        let primary = Arc::new(ScriptedPrimary::default());
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        buffer.append(&Op("A".into())).await.unwrap();

        let handle = SyncWorker::new(
            buffer.clone(),
            primary.clone(),
            SyncConfig { interval: Duration::from_millis(10), ..SyncConfig::default() },
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(primary.applied(), ["A"]);
        assert!(buffer.is_empty().await.unwrap());
    }
}
