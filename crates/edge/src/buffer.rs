//! Disk-resident FIFO of operations the primary path could not take.
//!
//! Operations are stored in a SQLite table (`buffered_operations`) keyed by a
//! monotonically increasing local id. Several payload families can share one
//! database file; each [`LocalBuffer`] only sees its own family.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A payload family that can be buffered at the edge.
pub trait EdgeOperation: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable family tag stored with every row.
    const FAMILY: &'static str;
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode buffered operation: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("buffered operation {local_id} has an invalid timestamp: {message}")]
    Timestamp { local_id: i64, message: String },

    #[error("failed to resolve buffer location: {0}")]
    Location(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A stored payload, decoded if it still matches the family's type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload<T> {
    Decoded(T),
    /// Stored text that no longer decodes. Replay stops here until an operator
    /// removes the row.
    Corrupt { raw: String, error: String },
}

impl<T> Payload<T> {
    pub fn decoded(&self) -> Option<&T> {
        match self {
            Payload::Decoded(op) => Some(op),
            Payload::Corrupt { .. } => None,
        }
    }
}

/// One buffered operation as read back for replay or inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferedOperation<T> {
    pub local_id: i64,
    pub payload: Payload<T>,
    pub created_at: DateTime<Utc>,
    /// Failed replays so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// SQLite-backed buffer for one payload family.
///
/// Cheap to clone; clones share the pool and the ordering lock.
#[derive(Debug)]
pub struct LocalBuffer<T> {
    pool: SqlitePool,
    order: Arc<Mutex<()>>,
    _family: PhantomData<fn() -> T>,
}

impl<T> Clone for LocalBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            order: self.order.clone(),
            _family: PhantomData,
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buffered_operations (
    local_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    family          TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT NULL,
    last_attempt_at TEXT NULL
);

CREATE INDEX IF NOT EXISTS buffered_operations_family_idx ON buffered_operations (family, local_id);
"#;

/// `{data_dir}/backbone/edge-buffer.db`, creating the directory if needed.
pub fn default_buffer_path() -> Result<PathBuf, BufferError> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or_else(|| BufferError::Location("no data_dir() and no home_dir()".to_string()))?;
    dir.push("backbone");
    std::fs::create_dir_all(&dir)?;
    dir.push("edge-buffer.db");
    Ok(dir)
}

impl<T: EdgeOperation> LocalBuffer<T> {
    /// Open (or create) the buffer database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        // One writer keeps local ids in append order.
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// A buffer that lives as long as the process. For tests and dry runs.
    pub async fn in_memory() -> Result<Self, BufferError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Share an existing pool, e.g. with another family's buffer.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, BufferError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            order: Arc::new(Mutex::new(())),
            _family: PhantomData,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Serializes everything that decides the order operations reach the
    /// primary: the recorder's empty-check, apply and append, and each replay
    /// pass. Hold the guard for the whole sequence.
    pub async fn order_lock(&self) -> MutexGuard<'_, ()> {
        self.order.lock().await
    }

    /// Persist `op` at the tail. Returns its local id.
    pub async fn append(&self, op: &T) -> Result<i64, BufferError> {
        let payload = serde_json::to_string(op)?;
        let result = sqlx::query(
            r#"
            INSERT INTO buffered_operations (family, payload, created_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(T::FAMILY)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let local_id = result.last_insert_rowid();
        debug!(family = T::FAMILY, local_id, "operation buffered");
        Ok(local_id)
    }

    /// The oldest `limit` operations, in insertion order. Does not remove them.
    ///
    /// A row whose payload no longer decodes comes back as
    /// [`Payload::Corrupt`] in its place.
    pub async fn drain_batch(&self, limit: usize) -> Result<Vec<BufferedOperation<T>>, BufferError> {
        let rows = sqlx::query(
            r#"
            SELECT local_id, payload, created_at, attempts, last_error
            FROM buffered_operations
            WHERE family = ?1
            ORDER BY local_id ASC
            LIMIT ?2
            "#,
        )
        .bind(T::FAMILY)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_operation).collect()
    }

    /// Remove operations that were applied on the primary.
    pub async fn delete(&self, local_ids: &[i64]) -> Result<u64, BufferError> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for local_id in local_ids {
            deleted += sqlx::query("DELETE FROM buffered_operations WHERE local_id = ?1 AND family = ?2")
                .bind(local_id)
                .bind(T::FAMILY)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Count a failed replay against `local_id`. Returns the new attempt count.
    pub async fn record_failure(&self, local_id: i64, error: &str) -> Result<u32, BufferError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE buffered_operations
            SET attempts = attempts + 1,
                last_error = ?2,
                last_attempt_at = ?3
            WHERE local_id = ?1
            RETURNING attempts
            "#,
        )
        .bind(local_id)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.unwrap_or(0).max(0) as u32)
    }

    pub async fn len(&self) -> Result<u64, BufferError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffered_operations WHERE family = ?1")
            .bind(T::FAMILY)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, BufferError> {
        Ok(self.len().await? == 0)
    }

    /// Operations whose replay failed at least `threshold` times.
    pub async fn stuck(&self, threshold: u32) -> Result<Vec<BufferedOperation<T>>, BufferError> {
        let rows = sqlx::query(
            r#"
            SELECT local_id, payload, created_at, attempts, last_error
            FROM buffered_operations
            WHERE family = ?1 AND attempts >= ?2
            ORDER BY local_id ASC
            "#,
        )
        .bind(T::FAMILY)
        .bind(i64::from(threshold.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_operation).collect()
    }
}

fn row_to_operation<T: EdgeOperation>(row: SqliteRow) -> Result<BufferedOperation<T>, BufferError> {
    let local_id: i64 = row.try_get("local_id")?;

    let raw: String = row.try_get("payload")?;
    let payload = match serde_json::from_str::<T>(&raw) {
        Ok(op) => Payload::Decoded(op),
        Err(e) => Payload::Corrupt { raw, error: e.to_string() },
    };

    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BufferError::Timestamp {
            local_id,
            message: e.to_string(),
        })?;

    let attempts: i64 = row.try_get("attempts")?;

    Ok(BufferedOperation {
        local_id,
        payload,
        created_at,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Op(String);

    impl EdgeOperation for Op {
        const FAMILY: &'static str = "test";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other(u8);

    impl EdgeOperation for Other {
        const FAMILY: &'static str = "other";
    }

    fn names(batch: &[BufferedOperation<Op>]) -> Vec<&str> {
        batch
            .iter()
            .map(|o| o.payload.decoded().map_or("<corrupt>", |op| op.0.as_str()))
            .collect()
    }

    async fn append_raw(buffer: &LocalBuffer<Op>, payload: &str) -> i64 {
        sqlx::query("INSERT INTO buffered_operations (family, payload, created_at) VALUES (?1, ?2, ?3)")
            .bind(Op::FAMILY)
            .bind(payload)
            .bind(Utc::now().to_rfc3339())
            .execute(buffer.pool())
            .await
            .unwrap()
            .last_insert_rowid()
    }

    #[tokio::test]
    async fn drains_in_insertion_order() {
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        for name in ["A", "B", "C"] {
            buffer.append(&Op(name.into())).await.unwrap();
        }

        assert_eq!(names(&buffer.drain_batch(2).await.unwrap()), ["A", "B"]);
        assert_eq!(names(&buffer.drain_batch(10).await.unwrap()), ["A", "B", "C"]);
        assert_eq!(buffer.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn delete_removes_only_named_operations() {
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        let a = buffer.append(&Op("A".into())).await.unwrap();
        buffer.append(&Op("B".into())).await.unwrap();

        assert_eq!(buffer.delete(&[a]).await.unwrap(), 1);
        assert_eq!(names(&buffer.drain_batch(10).await.unwrap()), ["B"]);
    }

    #[tokio::test]
    async fn failures_accumulate_into_stuck() {
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        let a = buffer.append(&Op("A".into())).await.unwrap();
        buffer.append(&Op("B".into())).await.unwrap();

        buffer.record_failure(a, "timeout").await.unwrap();
        assert!(buffer.stuck(2).await.unwrap().is_empty());
        assert_eq!(buffer.record_failure(a, "rejected: unknown sku").await.unwrap(), 2);

        let stuck = buffer.stuck(2).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].local_id, a);
        assert_eq!(stuck[0].last_error.as_deref(), Some("rejected: unknown sku"));
    }

    #[tokio::test]
    async fn undecodable_row_stays_in_place_and_can_become_stuck() {
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        buffer.append(&Op("A".into())).await.unwrap();
        let bad = append_raw(&buffer, "{\"not\": \"an op\"}").await;
        buffer.append(&Op("C".into())).await.unwrap();

        let batch = buffer.drain_batch(10).await.unwrap();
        assert_eq!(names(&batch), ["A", "<corrupt>", "C"]);
        assert!(matches!(&batch[1].payload, Payload::Corrupt { raw, .. } if raw.contains("not")));

        buffer.record_failure(bad, "corrupt payload").await.unwrap();
        buffer.record_failure(bad, "corrupt payload").await.unwrap();
        let stuck = buffer.stuck(2).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].local_id, bad);
        assert_eq!(stuck[0].attempts, 2);
        assert!(stuck[0].payload.decoded().is_none());
    }

    #[tokio::test]
    async fn clones_share_the_ordering_lock() {
        let buffer = LocalBuffer::<Op>::in_memory().await.unwrap();
        let clone = buffer.clone();

        let guard = buffer.order_lock().await;
        assert!(clone.order.try_lock().is_err());
        drop(guard);
        assert!(clone.order.try_lock().is_ok());
    }

    #[tokio::test]
    async fn families_sharing_a_file_do_not_see_each_other() {
        let ops = LocalBuffer::<Op>::in_memory().await.unwrap();
        let others = LocalBuffer::<Other>::with_pool(ops.pool().clone()).await.unwrap();

        ops.append(&Op("A".into())).await.unwrap();
        others.append(&Other(1)).await.unwrap();

        assert_eq!(ops.len().await.unwrap(), 1);
        assert_eq!(others.drain_batch(10).await.unwrap()[0].payload, Payload::Decoded(Other(1)));
    }

    #[tokio::test]
    async fn survives_reopening_the_file() {
        let dir = std::env::temp_dir().join(format!("backbone-edge-{}", std::process::id()));
        let path = dir.join("reopen.db");
        let _ = std::fs::remove_file(&path);

        {
            let buffer = LocalBuffer::<Op>::open(&path).await.unwrap();
            buffer.append(&Op("A".into())).await.unwrap();
            buffer.pool().close().await;
        }

        let buffer = LocalBuffer::<Op>::open(&path).await.unwrap();
        assert_eq!(names(&buffer.drain_batch(10).await.unwrap()), ["A"]);
        buffer.pool().close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
