//! Persisted proof that an external submission happened.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use backbone_jobs::postgres::map_sqlx_error;
use backbone_jobs::{JobStore, MemoryBackend, PgBackend, StoreError};

use crate::external::SubmissionTarget;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotencyMarker {
    pub target: SubmissionTarget,
    pub system: String,
    /// Reference returned by the external system (e.g. a clearance number).
    pub reference: String,
    pub recorded_at: DateTime<Utc>,
}

impl IdempotencyMarker {
    pub fn new(target: SubmissionTarget, system: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            target,
            system: system.into(),
            reference: reference.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MarkerStore: JobStore {
    async fn marker(&self, target: &SubmissionTarget) -> Result<Option<IdempotencyMarker>, StoreError>;

    /// Persist `marker`. Recording the same reference again is a no-op; a
    /// different reference for the same target is a data error.
    async fn record_marker(&self, tx: &mut Self::Tx, marker: &IdempotencyMarker) -> Result<(), StoreError>;
}

fn conflicting(existing: &str, marker: &IdempotencyMarker) -> StoreError {
    StoreError::data(format!(
        "{} already submitted as '{}', refusing '{}'",
        marker.target, existing, marker.reference
    ))
}

/// In-memory table for [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct MarkerTables {
    markers: BTreeMap<SubmissionTarget, IdempotencyMarker>,
}

impl AsRef<MarkerTables> for MarkerTables {
    fn as_ref(&self) -> &MarkerTables {
        self
    }
}

impl AsMut<MarkerTables> for MarkerTables {
    fn as_mut(&mut self) -> &mut MarkerTables {
        self
    }
}

fn markers<E: AsMut<MarkerTables>>(tables: &mut E) -> &mut BTreeMap<SubmissionTarget, IdempotencyMarker> {
    &mut tables.as_mut().markers
}

#[async_trait]
impl<E> MarkerStore for MemoryBackend<E>
where
    E: AsRef<MarkerTables> + AsMut<MarkerTables> + Clone + Send + Sync + 'static,
{
    async fn marker(&self, target: &SubmissionTarget) -> Result<Option<IdempotencyMarker>, StoreError> {
        Ok(self
            .read(|t| AsRef::<MarkerTables>::as_ref(t).markers.get(target).cloned())
            .await)
    }

    async fn record_marker(&self, tx: &mut Self::Tx, marker: &IdempotencyMarker) -> Result<(), StoreError> {
        let markers = markers(tx.tables());
        match markers.get(&marker.target) {
            Some(existing) if existing.reference == marker.reference => Ok(()),
            Some(existing) => Err(conflicting(&existing.reference, marker)),
            None => {
                markers.insert(marker.target.clone(), marker.clone());
                Ok(())
            }
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_markers (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    system TEXT NOT NULL,
    reference TEXT NOT NULL CHECK (reference <> ''),
    recorded_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
"#;

/// Create the marker table if missing.
pub async fn ensure_schema(backend: &PgBackend) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(backend.pool())
        .await
        .map_err(|e| map_sqlx_error("ensure_marker_schema", e))?;
    Ok(())
}

#[async_trait]
impl MarkerStore for PgBackend {
    #[tracing::instrument(skip(self), fields(target = %target), err)]
    async fn marker(&self, target: &SubmissionTarget) -> Result<Option<IdempotencyMarker>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT system, reference, recorded_at
            FROM idempotency_markers
            WHERE entity_type = $1 AND entity_id = $2
            "#,
        )
        .bind(&target.entity_type)
        .bind(&target.entity_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("marker", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(IdempotencyMarker {
            target: target.clone(),
            system: row.try_get("system")?,
            reference: row.try_get("reference")?,
            recorded_at: row.try_get("recorded_at")?,
        }))
    }

    #[tracing::instrument(skip(self, tx, marker), fields(target = %marker.target), err)]
    async fn record_marker(&self, tx: &mut Self::Tx, marker: &IdempotencyMarker) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_markers (entity_type, entity_id, system, reference, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_type, entity_id) DO NOTHING
            "#,
        )
        .bind(&marker.target.entity_type)
        .bind(&marker.target.entity_id)
        .bind(&marker.system)
        .bind(&marker.reference)
        .bind(marker.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("record_marker", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        let existing: String = sqlx::query_scalar(
            "SELECT reference FROM idempotency_markers WHERE entity_type = $1 AND entity_id = $2",
        )
        .bind(&marker.target.entity_type)
        .bind(&marker.target.entity_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("record_marker", e))?;

        if existing == marker.reference {
            Ok(())
        } else {
            Err(conflicting(&existing, marker))
        }
    }
}
