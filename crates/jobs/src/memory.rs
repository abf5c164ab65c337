//! In-memory backend for tests and local development.
//!
//! One async mutex guards the whole state; a transaction holds it from
//! `begin` until it is committed or dropped, so transactions are serializable
//! and the lock doubles as the row lock domain stores need. Rollback restores
//! a snapshot taken at `begin`.
//!
//! Never call a non-transactional method on the same backend while holding a
//! `MemoryTx` in the same task: it waits for the lock the task already holds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::error;

use backbone_core::JobId;

use crate::error::StoreError;
use crate::store::{Backend, JobStore};
use crate::types::{Disposition, Failure, Job, JobFilter, JobOrder, JobState, JobStats, LeaseToken};

/// Everything the memory backend stores. `E` holds the business tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryState<E> {
    jobs: BTreeMap<JobId, Job>,
    tables: E,
}

/// In-memory [`Backend`] + [`JobStore`], generic over extra tables `E`.
#[derive(Debug)]
pub struct MemoryBackend<E = ()> {
    state: Arc<Mutex<MemoryState<E>>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl<E> Clone for MemoryBackend<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            fail_next_commit: self.fail_next_commit.clone(),
        }
    }
}

impl<E: Default> Default for MemoryBackend<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Default> MemoryBackend<E> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl<E> MemoryBackend<E> {
    /// Make the next `commit` fail and roll back. Test hook.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Read the business tables outside a transaction.
    pub async fn read<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.tables)
    }
}

/// Open transaction on a [`MemoryBackend`].
pub struct MemoryTx<E> {
    guard: OwnedMutexGuard<MemoryState<E>>,
    snapshot: Option<MemoryState<E>>,
}

impl<E> MemoryTx<E> {
    /// Business tables, writable for the life of the transaction.
    pub fn tables(&mut self) -> &mut E {
        &mut self.guard.tables
    }

    fn jobs(&mut self) -> &mut BTreeMap<JobId, Job> {
        &mut self.guard.jobs
    }
}

impl<E> Drop for MemoryTx<E> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl<E> Backend for MemoryBackend<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Tx = MemoryTx<E>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = Some(guard.clone());
        Ok(MemoryTx { guard, snapshot })
    }

    async fn commit(&self, mut tx: Self::Tx) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            // Dropping `tx` restores the snapshot.
            return Err(StoreError::database("simulated commit failure"));
        }
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }
}

fn discard_expired_final_attempts(jobs: &mut BTreeMap<JobId, Job>, now: DateTime<Utc>) {
    for job in jobs.values_mut() {
        if job.state == JobState::Running && job.lease_expired(now) && job.attempt >= job.max_attempts {
            error!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt,
                "lease expired on final attempt, discarding job"
            );
            job.mark_failed(
                &Failure {
                    error: "lease expired".to_string(),
                    disposition: Disposition::Discard,
                },
                now,
            );
        }
    }
}

#[async_trait]
impl<E> JobStore for MemoryBackend<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn insert_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError> {
        let jobs = tx.jobs();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim(
        &self,
        worker: &str,
        kinds: &[String],
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        discard_expired_final_attempts(&mut state.jobs, now);

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now) && kinds.contains(&j.kind))
            .min_by_key(|j| (j.priority, j.scheduled_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.claim(worker, lease, now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, id: JobId, token: LeaseToken, lease: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.holds_lease(token) {
            return Err(StoreError::LeaseLost(id));
        }
        job.extend_lease(lease, Utc::now());
        Ok(())
    }

    async fn complete(&self, tx: &mut Self::Tx, id: JobId, token: LeaseToken) -> Result<(), StoreError> {
        let job = tx.jobs().get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.holds_lease(token) {
            return Err(StoreError::LeaseLost(id));
        }
        job.mark_completed(Utc::now());
        Ok(())
    }

    async fn fail(&self, id: JobId, token: LeaseToken, failure: &Failure) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.holds_lease(token) {
            return Err(StoreError::LeaseLost(id));
        }
        job.mark_failed(failure, Utc::now());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        match filter.order {
            JobOrder::Created => jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))),
            JobOrder::Updated => jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id))),
        }
        jobs.truncate(filter.effective_limit());
        Ok(jobs)
    }

    async fn requeue(&self, id: JobId) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.state != JobState::Discarded {
            return Err(StoreError::InvalidState(format!(
                "only discarded jobs can be requeued, {id} is {}",
                job.state.as_str()
            )));
        }
        job.requeue(Utc::now());
        Ok(job.clone())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.count(job.state, 1);
        }
        Ok(stats)
    }
}
