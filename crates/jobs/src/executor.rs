//! Job dispatcher: a pool of executors with leases, retries and backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use backbone_core::JobId;

use crate::context::JobContext;
use crate::error::{JobError, StoreError};
use crate::queue::JobQueue;
use crate::registry::Registry;
use crate::store::JobStore;
use crate::types::{Disposition, Failure, Job, LeaseToken, RetryPolicy};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging; executors are named `{name}-{n}`.
    pub name: String,
    /// Number of concurrent executors.
    pub workers: usize,
    /// How long an idle executor sleeps before polling again.
    pub poll_interval: Duration,
    /// Lease length; renewed every third of it while a handler runs.
    pub lease: Duration,
    /// Upper bound on a single handler invocation.
    pub job_timeout: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(30),
            job_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_discarded: u64,
    pub leases_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
    leases_lost: AtomicU64,
    running: AtomicUsize,
    started: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            leases_lost: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    fn record(&self, outcome: &Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Completed => &self.succeeded,
            Outcome::Retried { .. } => &self.retried,
            Outcome::Discarded => &self.discarded,
            Outcome::LeaseLost => &self.leases_lost,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_discarded: self.discarded.load(Ordering::Relaxed),
            leases_lost: self.leases_lost.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retried { at: chrono::DateTime<Utc> },
    Discarded,
    /// Another executor took the job over; nothing was recorded.
    LeaseLost,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pulls ready jobs from the store and runs them with registered handlers.
pub struct Dispatcher<B: JobStore> {
    queue: JobQueue<B>,
    registry: Registry<B>,
    kinds: Vec<String>,
    config: DispatcherConfig,
    counters: Arc<Counters>,
}

impl<B: JobStore> Dispatcher<B> {
    pub fn new(queue: JobQueue<B>, registry: Registry<B>, config: DispatcherConfig) -> Self {
        let kinds = registry.kinds();
        Self {
            queue,
            registry,
            kinds,
            config,
            counters: Arc::new(Counters::new()),
        }
    }

    pub fn queue(&self) -> &JobQueue<B> {
        &self.queue
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// Claim and run at most one job. Used by executors and by tests.
    pub async fn run_once(&self, worker: &str) -> Result<Option<(JobId, Outcome)>, StoreError> {
        let Some(job) = self
            .queue
            .backend()
            .claim(worker, &self.kinds, self.config.lease, Utc::now())
            .await?
        else {
            return Ok(None);
        };

        debug!(worker, job_id = %job.id, kind = %job.kind, attempt = job.attempt, "claimed job");

        self.counters.running.fetch_add(1, Ordering::Relaxed);
        let result = self.execute(&job).await;
        self.counters.running.fetch_sub(1, Ordering::Relaxed);

        let outcome = result?;
        self.counters.record(&outcome);
        Ok(Some((job.id, outcome)))
    }

    /// Run jobs until none is ready. Returns how many were processed.
    pub async fn drain(&self, worker: &str) -> Result<usize, StoreError> {
        let mut processed = 0;
        while self.run_once(worker).await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    async fn execute(&self, job: &Job) -> Result<Outcome, StoreError> {
        let token = job
            .lease
            .as_ref()
            .map(|l| l.token)
            .ok_or_else(|| StoreError::InvalidState(format!("claimed job {} has no lease", job.id)))?;

        let _heartbeat = self.spawn_heartbeat(job.id, token);

        let Some(handler) = self.registry.get(&job.kind) else {
            let error = JobError::validation(format!("no handler registered for kind '{}'", job.kind));
            return self.record_failure(job, token, error).await;
        };

        let mut ctx = JobContext::new(&self.queue, job);
        let result = match tokio::time::timeout(self.config.job_timeout, handler.call(&mut ctx)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::transient(format!(
                "handler timed out after {}ms",
                self.config.job_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => self.finish(ctx, job, token).await,
            Err(error) => {
                // Roll back the handler's writes before recording the failure.
                drop(ctx);
                self.record_failure(job, token, error).await
            }
        }
    }

    async fn finish(&self, ctx: JobContext<'_, B>, job: &Job, token: LeaseToken) -> Result<Outcome, StoreError> {
        let backend = self.queue.backend();
        let mut tx = match ctx.into_tx() {
            Some(tx) => tx,
            None => backend.begin().await?,
        };

        match backend.complete(&mut tx, job.id, token).await {
            Ok(()) => {}
            Err(StoreError::LeaseLost(_)) => {
                drop(tx);
                warn!(job_id = %job.id, kind = %job.kind, "lease lost before completion, discarding handler writes");
                return Ok(Outcome::LeaseLost);
            }
            Err(e) => {
                drop(tx);
                return self.record_failure(job, token, JobError::Store(e)).await;
            }
        }

        if let Err(e) = backend.commit(tx).await {
            return self.record_failure(job, token, JobError::Store(e)).await;
        }

        debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "job completed");
        Ok(Outcome::Completed)
    }

    async fn record_failure(&self, job: &Job, token: LeaseToken, error: JobError) -> Result<Outcome, StoreError> {
        let retry = &self.config.retry;
        let disposition = if error.is_retryable() && retry.should_retry(job.attempt, job.max_attempts) {
            let delay = retry.delay_for_attempt(job.attempt);
            Disposition::Retry {
                at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            }
        } else {
            Disposition::Discard
        };

        let failure = Failure {
            error: error.to_string(),
            disposition,
        };

        match self.queue.backend().fail(job.id, token, &failure).await {
            Ok(()) => {}
            Err(StoreError::LeaseLost(_)) => {
                warn!(job_id = %job.id, kind = %job.kind, error = %failure.error, "lease lost before recording failure");
                return Ok(Outcome::LeaseLost);
            }
            Err(e) => return Err(e),
        }

        Ok(match disposition {
            Disposition::Retry { at } => {
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    retry_at = %at,
                    error = %failure.error,
                    "job failed, retry scheduled"
                );
                Outcome::Retried { at }
            }
            Disposition::Discard => {
                error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    last_error = %failure.error,
                    "job discarded"
                );
                Outcome::Discarded
            }
        })
    }

    fn spawn_heartbeat(&self, id: JobId, token: LeaseToken) -> AbortOnDrop {
        let backend = self.queue.backend().clone();
        let lease = self.config.lease;
        let every = (lease / 3).max(Duration::from_millis(10));

        AbortOnDrop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match backend.heartbeat(id, token, lease).await {
                    Ok(()) => {}
                    Err(StoreError::LeaseLost(_)) => {
                        warn!(job_id = %id, "lease lost, heartbeat stopped");
                        return;
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "heartbeat failed"),
                }
            }
        }))
    }
}

impl<B: JobStore> Dispatcher<B> {
    /// Start `config.workers` executors.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = self.config.shutdown_grace;
        let counters = self.counters.clone();
        let this = Arc::new(self);

        info!(dispatcher = %this.config.name, workers = this.config.workers, kinds = ?this.kinds, "dispatcher started");

        let tasks = (0..this.config.workers.max(1))
            .map(|n| {
                let this = this.clone();
                let shutdown = shutdown_rx.clone();
                let worker = format!("{}-{}", this.config.name, n);
                tokio::spawn(async move { executor_loop(this, worker, shutdown).await })
            })
            .collect();

        DispatcherHandle {
            shutdown: shutdown_tx,
            tasks,
            grace,
            counters,
        }
    }
}

async fn executor_loop<B: JobStore>(dispatcher: Arc<Dispatcher<B>>, worker: String, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = %worker, "executor started");
    let poll = dispatcher.config.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match dispatcher.run_once(&worker).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(worker = %worker, error = %e, "failed to claim or record job"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!(worker = %worker, "executor stopped");
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
    counters: Arc<Counters>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// Stop claiming, wait up to the grace period, then abort what is left.
    ///
    /// Aborted jobs stay `running` until their lease expires and are then
    /// claimed again.
    pub async fn shutdown(self) -> DispatcherStats {
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.grace;

        let mut aborted = 0;
        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }

        let stats = self.counters.snapshot();
        if aborted > 0 {
            warn!(aborted, "executors did not finish within the grace period");
        }
        info!(processed = stats.jobs_processed, "dispatcher stopped");
        stats
    }
}
