//! Postgres-backed job store.
//!
//! Jobs live in the same database as the business tables, so a handler's
//! domain writes and the job rows it inserts share one `sqlx::Transaction`.
//!
//! ## Claiming
//!
//! `claim` selects the next ready row with `FOR UPDATE SKIP LOCKED` and flips it
//! to `running` in the same statement, so concurrent executors (in one process
//! or several) never receive the same job. Running rows whose lease has
//! expired are eligible again, which is how jobs from crashed executors are
//! recovered.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) / `Database` |
//! | Database (other) | Any other | `Database` |
//! | RowNotFound / PoolClosed / Io | N/A | `Database` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, instrument};
use uuid::Uuid;

use backbone_core::JobId;

use crate::error::StoreError;
use crate::store::{Backend, JobStore};
use crate::types::{Disposition, Failure, Job, JobFilter, JobOrder, JobState, JobStats, Lease, LeaseToken, Priority};

const JOB_COLUMNS: &str = "id, kind, args, state, priority, scheduled_at, attempt, max_attempts, \
     last_error, parent_id, lease_owner, lease_token, lease_expires_at, created_at, updated_at, finished_at";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL,
    args JSONB NOT NULL,
    state TEXT NOT NULL,
    priority SMALLINT NOT NULL DEFAULT 2,
    scheduled_at TIMESTAMPTZ NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    parent_id UUID,
    lease_owner TEXT,
    lease_token UUID,
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS jobs_ready_idx ON jobs (state, priority, scheduled_at);
CREATE INDEX IF NOT EXISTS jobs_parent_idx ON jobs (parent_id) WHERE parent_id IS NOT NULL;
"#;

/// Postgres [`Backend`]. Cheap to clone; domain stores implement their traits on it too.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job table if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn discard_expired_final_attempts(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'discarded',
                last_error = 'lease expired',
                lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = $1,
                finished_at = $1
            WHERE state = 'running'
              AND lease_expires_at <= $1
              AND attempt >= max_attempts
            RETURNING id, kind, attempt
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("discard_expired", e))?;

        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let kind: String = row.try_get("kind")?;
            let attempt: i32 = row.try_get("attempt")?;
            error!(job_id = %id, kind = %kind, attempt, "lease expired on final attempt, discarding job");
        }
        Ok(())
    }
}

/// Whether `err` is a unique-constraint violation (`23505`).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Map a sqlx error, keeping the failing operation in the message.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Database(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => StoreError::Database(format!("connection pool closed during {}", operation)),
        sqlx::Error::RowNotFound => StoreError::Database(format!("row not found in {}", operation)),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Data(format!("failed to decode column {} in {}: {}", index, operation, source))
        }
        other => StoreError::Database(format!("error in {}: {}", operation, other)),
    }
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_default()
}

struct JobRow(Job);

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = state.parse::<JobState>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "state".to_string(),
            source: e.into(),
        })?;
        let lease_token: Option<Uuid> = row.try_get("lease_token")?;
        let lease_owner: Option<String> = row.try_get("lease_owner")?;
        let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        let lease = match (lease_owner, lease_token, lease_expires_at) {
            (Some(owner), Some(token), Some(expires_at)) => Some(Lease {
                owner,
                token: LeaseToken(token),
                expires_at,
            }),
            _ => None,
        };
        let id: Uuid = row.try_get("id")?;
        let parent_id: Option<Uuid> = row.try_get("parent_id")?;
        let attempt: i32 = row.try_get("attempt")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let priority: i16 = row.try_get("priority")?;

        Ok(JobRow(Job {
            id: JobId::from_uuid(id),
            kind: row.try_get("kind")?,
            args: row.try_get("args")?,
            state,
            priority: Priority::from_i16(priority),
            scheduled_at: row.try_get("scheduled_at")?,
            attempt: attempt.max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
            last_error: row.try_get("last_error")?,
            parent_id: parent_id.map(JobId::from_uuid),
            lease,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        }))
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl JobStore for PgBackend {
    #[instrument(skip(self, tx, job), fields(job_id = %job.id, kind = %job.kind), err)]
    async fn insert_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, args, state, priority, scheduled_at, attempt, max_attempts,
                              parent_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.kind)
        .bind(&job.args)
        .bind(job.state.as_str())
        .bind(job.priority.as_i16())
        .bind(job.scheduled_at)
        .bind(job.attempt as i32)
        .bind(job.max_attempts as i32)
        .bind(job.parent_id.map(Uuid::from))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim(
        &self,
        worker: &str,
        kinds: &[String],
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.discard_expired_final_attempts(now).await?;

        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE kind = ANY($5)
                  AND ((state IN ('scheduled', 'retryable') AND scheduled_at <= $1)
                       OR (state = 'running' AND lease_expires_at <= $1))
                ORDER BY priority, scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'running',
                attempt = attempt + 1,
                lease_owner = $2,
                lease_token = $3,
                lease_expires_at = $4,
                updated_at = $1
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(worker)
            .bind(LeaseToken::new().0)
            .bind(lease_expiry(now, lease))
            .bind(kinds)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;
        Ok(row.map(|r| r.0))
    }

    #[instrument(skip(self, token), fields(job_id = %id), err)]
    async fn heartbeat(&self, id: JobId, token: LeaseToken, lease: Duration) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND lease_token = $2 AND state = 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.0)
        .bind(lease_expiry(now, lease))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx, token), fields(job_id = %id), err)]
    async fn complete(&self, tx: &mut Self::Tx, id: JobId, token: LeaseToken) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = $3,
                finished_at = $3
            WHERE id = $1 AND lease_token = $2 AND state = 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.0)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(id));
        }
        Ok(())
    }

    #[instrument(skip(self, token, failure), fields(job_id = %id), err)]
    async fn fail(&self, id: JobId, token: LeaseToken, failure: &Failure) -> Result<(), StoreError> {
        let now = Utc::now();
        let (state, scheduled_at, finished_at) = match failure.disposition {
            Disposition::Retry { at } => (JobState::Retryable, Some(at), None),
            Disposition::Discard => (JobState::Discarded, None, Some(now)),
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $3,
                scheduled_at = COALESCE($4, scheduled_at),
                finished_at = $5,
                last_error = $6,
                lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = $7
            WHERE id = $1 AND lease_token = $2 AND state = 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.0)
        .bind(state.as_str())
        .bind(scheduled_at)
        .bind(finished_at)
        .bind(&failure.error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        Ok(row.map(|r| r.0))
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let order = match filter.order {
            JobOrder::Created => "created_at",
            JobOrder::Updated => "updated_at",
        };
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::uuid IS NULL OR parent_id = $3)
            ORDER BY {order} DESC, id DESC
            LIMIT $4
            "#
        );
        let limit = i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX);
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.kind.as_deref())
            .bind(filter.parent_id.map(Uuid::from))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue(&self, id: JobId) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'scheduled',
                attempt = 0,
                scheduled_at = $2,
                finished_at = NULL,
                updated_at = $2
            WHERE id = $1 AND state = 'discarded'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.as_uuid())
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;

        match row {
            Some(r) => Ok(r.0),
            None => match self.get(id).await? {
                Some(job) => Err(StoreError::InvalidState(format!(
                    "only discarded jobs can be requeued, {id} is {}",
                    job.state.as_str()
                ))),
                None => Err(StoreError::JobNotFound(id)),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            if let Ok(state) = state.parse::<JobState>() {
                stats.count(state, n.max(0) as usize);
            }
        }
        Ok(stats)
    }
}
