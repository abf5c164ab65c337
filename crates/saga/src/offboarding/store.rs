//! Offboarding case persistence.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use backbone_jobs::postgres::map_sqlx_error;
use backbone_jobs::{JobStore, MemoryBackend, PgBackend, StoreError};

use super::UserId;

/// One person's offboarding, with the steps that have finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffboardingCase {
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub steps_done: BTreeSet<String>,
}

/// Offboarding cases, stored next to the job table.
#[async_trait]
pub trait OffboardingStore: JobStore {
    /// Open a case. Returns `false` if one already exists.
    async fn start_offboarding(&self, tx: &mut Self::Tx, user: UserId) -> Result<bool, StoreError>;

    /// Record a finished step. Recording the same step twice is a no-op.
    async fn record_step(&self, tx: &mut Self::Tx, user: UserId, step: &str) -> Result<(), StoreError>;

    async fn offboarding_case(&self, user: UserId) -> Result<Option<OffboardingCase>, StoreError>;
}

/// In-memory table for [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct OffboardingTables {
    cases: BTreeMap<UserId, OffboardingCase>,
}

impl AsRef<OffboardingTables> for OffboardingTables {
    fn as_ref(&self) -> &OffboardingTables {
        self
    }
}

impl AsMut<OffboardingTables> for OffboardingTables {
    fn as_mut(&mut self) -> &mut OffboardingTables {
        self
    }
}

fn cases<E: AsMut<OffboardingTables>>(tables: &mut E) -> &mut BTreeMap<UserId, OffboardingCase> {
    &mut tables.as_mut().cases
}

#[async_trait]
impl<E> OffboardingStore for MemoryBackend<E>
where
    E: AsRef<OffboardingTables> + AsMut<OffboardingTables> + Clone + Send + Sync + 'static,
{
    async fn start_offboarding(&self, tx: &mut Self::Tx, user: UserId) -> Result<bool, StoreError> {
        let cases = cases(tx.tables());
        if cases.contains_key(&user) {
            return Ok(false);
        }
        cases.insert(
            user,
            OffboardingCase {
                user_id: user,
                started_at: Utc::now(),
                steps_done: BTreeSet::new(),
            },
        );
        Ok(true)
    }

    async fn record_step(&self, tx: &mut Self::Tx, user: UserId, step: &str) -> Result<(), StoreError> {
        let case = cases(tx.tables())
            .get_mut(&user)
            .ok_or_else(|| StoreError::data(format!("no offboarding case for user {user}")))?;
        case.steps_done.insert(step.to_string());
        Ok(())
    }

    async fn offboarding_case(&self, user: UserId) -> Result<Option<OffboardingCase>, StoreError> {
        Ok(self
            .read(|t| AsRef::<OffboardingTables>::as_ref(t).cases.get(&user).cloned())
            .await)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offboarding_cases (
    user_id BIGINT PRIMARY KEY,
    started_at TIMESTAMPTZ NOT NULL,
    steps_done TEXT[] NOT NULL DEFAULT '{}'
);
"#;

/// Create the offboarding table if missing.
pub async fn ensure_schema(backend: &PgBackend) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(backend.pool())
        .await
        .map_err(|e| map_sqlx_error("ensure_offboarding_schema", e))?;
    Ok(())
}

#[async_trait]
impl OffboardingStore for PgBackend {
    #[tracing::instrument(skip(self, tx), fields(user_id = %user), err)]
    async fn start_offboarding(&self, tx: &mut Self::Tx, user: UserId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO offboarding_cases (user_id, started_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user.0)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("start_offboarding", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, tx), fields(user_id = %user), err)]
    async fn record_step(&self, tx: &mut Self::Tx, user: UserId, step: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offboarding_cases
            SET steps_done = CASE WHEN $2 = ANY(steps_done) THEN steps_done ELSE array_append(steps_done, $2) END
            WHERE user_id = $1
            "#,
        )
        .bind(user.0)
        .bind(step)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("record_step", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::data(format!("no offboarding case for user {user}")));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(user_id = %user), err)]
    async fn offboarding_case(&self, user: UserId) -> Result<Option<OffboardingCase>, StoreError> {
        let row = sqlx::query("SELECT user_id, started_at, steps_done FROM offboarding_cases WHERE user_id = $1")
            .bind(user.0)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("offboarding_case", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let steps: Vec<String> = row.try_get("steps_done")?;
        Ok(Some(OffboardingCase {
            user_id: UserId(row.try_get("user_id")?),
            started_at: row.try_get("started_at")?,
            steps_done: steps.into_iter().collect(),
        }))
    }
}
