//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use backbone_core::JobId;

/// Typed job payload.
///
/// Each payload type names the kind string it is stored under. The store only
/// sees `kind` + JSON; handlers get the decoded type back.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RebuildIndex { table: String }
///
/// impl JobArgs for RebuildIndex {
///     const KIND: &'static str = "search.rebuild_index";
/// }
/// ```
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable kind tag; changing it orphans jobs already in the store.
    const KIND: &'static str;
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Claimed by an executor holding a lease.
    Running,
    /// Handler returned success.
    Completed,
    /// Last attempt failed; re-scheduled with backoff.
    Retryable,
    /// Exhausted retries or failed permanently. Kept for inspection.
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Discarded)
    }
}

impl core::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "retryable" => Ok(JobState::Retryable),
            "discarded" => Ok(JobState::Discarded),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Relative urgency among ready jobs. Lower numeric value is claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_i16(&self) -> i16 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            i16::MIN..=0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// Proof of ownership handed out by a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive, expiring claim on a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy applied by the dispatcher when a handler fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed for jobs that don't set their own limit.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt; keeps tests reproducible.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// True while `attempt` (the number already made) is below `max_attempts`.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}

/// When and how to run an enqueued job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Not-before time. `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    /// Overrides the queue's default attempt budget.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn at(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..Default::default()
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self::at(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A job that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub kind: String,
    pub args: serde_json::Value,
    pub options: EnqueueOptions,
    pub parent_id: Option<JobId>,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            kind: kind.into(),
            args,
            options: EnqueueOptions::default(),
            parent_id: None,
        }
    }

    /// Serialize a typed payload under its kind.
    pub fn typed<A: JobArgs>(args: &A) -> Result<Self, serde_json::Error> {
        Ok(Self::new(A::KIND, serde_json::to_value(args)?))
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn child_of(mut self, parent: JobId) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

/// A durable job as recorded in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub args: serde_json::Value,
    pub state: JobState,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    /// Attempts started so far; incremented on every claim.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Job whose handler enqueued this one, if any.
    pub parent_id: Option<JobId>,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a `NewJob`, filling the attempt budget from the queue default.
    pub fn from_new(new: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            kind: new.kind,
            args: new.args,
            state: JobState::Scheduled,
            priority: new.options.priority,
            scheduled_at: new.options.scheduled_at.unwrap_or(now),
            attempt: 0,
            max_attempts: new.options.max_attempts.unwrap_or(default_max_attempts).max(1),
            last_error: None,
            parent_id: new.parent_id,
            lease: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Ready to be claimed at `now`: due and waiting, or running on an expired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Scheduled | JobState::Retryable => self.scheduled_at <= now,
            JobState::Running => self.lease_expired(now),
            JobState::Completed | JobState::Discarded => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|l| l.expires_at <= now)
    }

    pub fn holds_lease(&self, token: LeaseToken) -> bool {
        self.state == JobState::Running && self.lease.as_ref().is_some_and(|l| l.token == token)
    }

    /// Take the lease and start the next attempt.
    pub fn claim(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> LeaseToken {
        let token = LeaseToken::new();
        self.state = JobState::Running;
        self.attempt += 1;
        self.lease = Some(Lease {
            owner: owner.to_string(),
            token,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        });
        self.updated_at = now;
        token
    }

    pub fn extend_lease(&mut self, ttl: Duration, now: DateTime<Utc>) {
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        }
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.lease = None;
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, failure: &Failure, now: DateTime<Utc>) {
        self.last_error = Some(failure.error.clone());
        self.lease = None;
        self.updated_at = now;
        match failure.disposition {
            Disposition::Retry { at } => {
                self.state = JobState::Retryable;
                self.scheduled_at = at;
            }
            Disposition::Discard => {
                self.state = JobState::Discarded;
                self.finished_at = Some(now);
            }
        }
    }

    /// Operator action: give a discarded job a fresh attempt budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Scheduled;
        self.attempt = 0;
        self.scheduled_at = now;
        self.lease = None;
        self.updated_at = now;
        self.finished_at = None;
    }

    /// Decode the payload as `A`.
    pub fn args_as<A: JobArgs>(&self) -> Result<A, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { at: DateTime<Utc> },
    Discard,
}

/// A failed attempt, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error: String,
    pub disposition: Disposition,
}

/// Which timestamp listings sort on, newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    #[default]
    Created,
    /// Last state change; for a discarded job, when it was discarded.
    Updated,
}

/// Filter for the inspection surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<String>,
    pub parent_id: Option<JobId>,
    pub order: JobOrder,
    /// Zero means no limit. Applied after ordering.
    pub limit: usize,
}

impl JobFilter {
    /// The `limit` most recently discarded jobs.
    pub fn discarded(limit: usize) -> Self {
        Self {
            state: Some(JobState::Discarded),
            order: JobOrder::Updated,
            limit,
            ..Default::default()
        }
    }

    pub fn children_of(parent: JobId) -> Self {
        Self {
            parent_id: Some(parent),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 { usize::MAX } else { self.limit }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| s == job.state)
            && self.kind.as_deref().is_none_or(|k| k == job.kind)
            && self.parent_id.is_none_or(|p| job.parent_id == Some(p))
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub retryable: usize,
    pub discarded: usize,
}

impl JobStats {
    pub fn count(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Scheduled => self.scheduled += n,
            JobState::Running => self.running += n,
            JobState::Completed => self.completed += n,
            JobState::Retryable => self.retryable += n,
            JobState::Discarded => self.discarded += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl JobArgs for Ping {
        const KIND: &'static str = "test.ping";
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_job_budget() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1, 3));
        assert!(policy.should_retry(2, 3));
        assert!(!policy.should_retry(3, 3));
    }

    proptest! {
        #[test]
        fn exponential_delay_never_exceeds_cap(attempt in 1u32..200, base in 1u64..5_000, cap in 1u64..120_000) {
            let policy = RetryPolicy::exponential(10, Duration::from_millis(base), Duration::from_millis(cap));
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(cap));
        }

        #[test]
        fn exponential_delay_is_monotonic(attempt in 1u32..60) {
            let policy = RetryPolicy::exponential(10, Duration::from_millis(10), Duration::from_secs(3600));
            prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1));
        }
    }

    #[test]
    fn typed_new_job_uses_kind_constant() {
        let new = NewJob::typed(&Ping { n: 7 }).unwrap();
        assert_eq!(new.kind, "test.ping");
        assert_eq!(new.args, serde_json::json!({"n": 7}));
    }

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = Job::from_new(NewJob::typed(&Ping { n: 1 }).unwrap(), 3, now);

        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.attempt, 0);
        assert!(job.is_claimable(now));

        let token = job.claim("w1", Duration::from_secs(30), now);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert!(job.holds_lease(token));
        assert!(!job.is_claimable(now));

        job.mark_completed(now);
        assert_eq!(job.state, JobState::Completed);
        assert!(!job.holds_lease(token));
        assert_eq!(job.args_as::<Ping>().unwrap(), Ping { n: 1 });
    }

    #[test]
    fn expired_lease_makes_running_job_claimable_again() {
        let now = Utc::now();
        let mut job = Job::from_new(NewJob::new("x", serde_json::json!({})), 3, now);
        let first = job.claim("w1", Duration::from_millis(10), now);

        let later = now + chrono::Duration::milliseconds(50);
        assert!(job.is_claimable(later));

        let second = job.claim("w2", Duration::from_secs(30), later);
        assert_ne!(first, second);
        assert!(!job.holds_lease(first));
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn failure_retries_then_discards() {
        let now = Utc::now();
        let mut job = Job::from_new(NewJob::new("x", serde_json::json!({})), 2, now);
        job.claim("w1", Duration::from_secs(1), now);

        let retry_at = now + chrono::Duration::seconds(5);
        job.mark_failed(
            &Failure {
                error: "boom".into(),
                disposition: Disposition::Retry { at: retry_at },
            },
            now,
        );
        assert_eq!(job.state, JobState::Retryable);
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(retry_at));

        job.claim("w1", Duration::from_secs(1), retry_at);
        job.mark_failed(
            &Failure {
                error: "boom again".into(),
                disposition: Disposition::Discard,
            },
            retry_at,
        );
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.last_error.as_deref(), Some("boom again"));
        assert!(!job.is_claimable(retry_at + chrono::Duration::days(1)));
    }

    #[test]
    fn filter_matches_children_only() {
        let now = Utc::now();
        let parent = JobId::new();
        let child = Job::from_new(NewJob::new("c", serde_json::json!({})).child_of(parent), 3, now);
        let orphan = Job::from_new(NewJob::new("c", serde_json::json!({})), 3, now);

        let filter = JobFilter::children_of(parent);
        assert!(filter.matches(&child));
        assert!(!filter.matches(&orphan));
    }
}
