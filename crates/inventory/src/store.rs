//! Inventory persistence, next to the job table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use backbone_core::{MovementId, ReservationId};
use backbone_jobs::postgres::map_sqlx_error;
use backbone_jobs::{JobStore, MemoryBackend, PgBackend, StoreError};

use crate::movement::{MovementKind, StockMovement};
use crate::reservation::{Reservation, ReservationStatus};

/// Stock levels, reservations and movements.
///
/// The `lock_*` methods take a row lock held until `tx` ends; every
/// check-then-act on a reservation or a stock level goes through them.
#[async_trait]
pub trait InventoryStore: JobStore {
    /// Current availability of `sku`, locked for update. Unknown SKUs have 0.
    async fn lock_stock(&self, tx: &mut Self::Tx, sku: &str) -> Result<i64, StoreError>;

    async fn set_stock(&self, tx: &mut Self::Tx, sku: &str, available: i64) -> Result<(), StoreError>;

    async fn insert_reservation(&self, tx: &mut Self::Tx, reservation: &Reservation) -> Result<(), StoreError>;

    async fn lock_reservation(&self, tx: &mut Self::Tx, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    async fn update_reservation(&self, tx: &mut Self::Tx, reservation: &Reservation) -> Result<(), StoreError>;

    async fn insert_movement(&self, tx: &mut Self::Tx, movement: &StockMovement) -> Result<(), StoreError>;

    async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    async fn available(&self, sku: &str) -> Result<i64, StoreError>;

    /// Movements of `sku`, oldest first.
    async fn movements(&self, sku: &str) -> Result<Vec<StockMovement>, StoreError>;
}

/// In-memory tables for [`MemoryBackend`]. The backend's transaction holds
/// the whole state, which subsumes row locks.
#[derive(Debug, Clone, Default)]
pub struct InventoryTables {
    stock: BTreeMap<String, i64>,
    reservations: BTreeMap<ReservationId, Reservation>,
    movements: Vec<StockMovement>,
}

impl AsRef<InventoryTables> for InventoryTables {
    fn as_ref(&self) -> &InventoryTables {
        self
    }
}

impl AsMut<InventoryTables> for InventoryTables {
    fn as_mut(&mut self) -> &mut InventoryTables {
        self
    }
}

fn tables<E: AsMut<InventoryTables>>(e: &mut E) -> &mut InventoryTables {
    e.as_mut()
}

#[async_trait]
impl<E> InventoryStore for MemoryBackend<E>
where
    E: AsRef<InventoryTables> + AsMut<InventoryTables> + Clone + Send + Sync + 'static,
{
    async fn lock_stock(&self, tx: &mut Self::Tx, sku: &str) -> Result<i64, StoreError> {
        Ok(tables(tx.tables()).stock.get(sku).copied().unwrap_or(0))
    }

    async fn set_stock(&self, tx: &mut Self::Tx, sku: &str, available: i64) -> Result<(), StoreError> {
        if available < 0 {
            return Err(StoreError::data(format!("negative stock for {sku}")));
        }
        tables(tx.tables()).stock.insert(sku.to_string(), available);
        Ok(())
    }

    async fn insert_reservation(&self, tx: &mut Self::Tx, reservation: &Reservation) -> Result<(), StoreError> {
        let reservations = &mut tables(tx.tables()).reservations;
        if reservations.contains_key(&reservation.id) {
            return Err(StoreError::data(format!("reservation {} already exists", reservation.id)));
        }
        reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn lock_reservation(&self, tx: &mut Self::Tx, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        Ok(tables(tx.tables()).reservations.get(&id).cloned())
    }

    async fn update_reservation(&self, tx: &mut Self::Tx, reservation: &Reservation) -> Result<(), StoreError> {
        let slot = tables(tx.tables())
            .reservations
            .get_mut(&reservation.id)
            .ok_or_else(|| StoreError::data(format!("reservation {} not found", reservation.id)))?;
        *slot = reservation.clone();
        Ok(())
    }

    async fn insert_movement(&self, tx: &mut Self::Tx, movement: &StockMovement) -> Result<(), StoreError> {
        tables(tx.tables()).movements.push(movement.clone());
        Ok(())
    }

    async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        Ok(self
            .read(|t| AsRef::<InventoryTables>::as_ref(t).reservations.get(&id).cloned())
            .await)
    }

    async fn available(&self, sku: &str) -> Result<i64, StoreError> {
        Ok(self
            .read(|t| AsRef::<InventoryTables>::as_ref(t).stock.get(sku).copied().unwrap_or(0))
            .await)
    }

    async fn movements(&self, sku: &str) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self
            .read(|t| {
                AsRef::<InventoryTables>::as_ref(t)
                    .movements
                    .iter()
                    .filter(|m| m.sku == sku)
                    .cloned()
                    .collect()
            })
            .await)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stock_levels (
    sku TEXT PRIMARY KEY,
    available BIGINT NOT NULL CHECK (available >= 0),
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS reservations (
    id UUID PRIMARY KEY,
    sku TEXT NOT NULL,
    quantity BIGINT NOT NULL CHECK (quantity > 0),
    status TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ NULL
);

CREATE INDEX IF NOT EXISTS reservations_active_idx ON reservations (sku) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS stock_movements (
    id UUID PRIMARY KEY,
    sku TEXT NOT NULL,
    kind TEXT NOT NULL,
    quantity BIGINT NOT NULL,
    destination TEXT NULL,
    occurred_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS stock_movements_sku_idx ON stock_movements (sku, occurred_at);
"#;

/// Create the inventory tables if missing.
pub async fn ensure_schema(backend: &PgBackend) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(backend.pool())
        .await
        .map_err(|e| map_sqlx_error("ensure_inventory_schema", e))?;
    Ok(())
}

struct ReservationRow(Reservation);

impl<'r> sqlx::FromRow<'r, PgRow> for ReservationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status.parse::<ReservationStatus>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: e.into(),
        })?;
        let id: Uuid = row.try_get("id")?;

        Ok(ReservationRow(Reservation {
            id: ReservationId::from_uuid(id),
            sku: row.try_get("sku")?,
            quantity: row.try_get("quantity")?,
            status,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
        }))
    }
}

struct MovementRow(StockMovement);

impl<'r> sqlx::FromRow<'r, PgRow> for MovementRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind.parse::<MovementKind>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "kind".to_string(),
            source: e.into(),
        })?;
        let id: Uuid = row.try_get("id")?;
        let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;

        Ok(MovementRow(StockMovement {
            id: MovementId::from_uuid(id),
            sku: row.try_get("sku")?,
            kind,
            quantity: row.try_get("quantity")?,
            destination: row.try_get("destination")?,
            occurred_at,
        }))
    }
}

const RESERVATION_COLUMNS: &str = "id, sku, quantity, status, expires_at, created_at, finished_at";

#[async_trait]
impl InventoryStore for PgBackend {
    #[tracing::instrument(skip(self, tx), err)]
    async fn lock_stock(&self, tx: &mut Self::Tx, sku: &str) -> Result<i64, StoreError> {
        // Materialize the row so there is something to lock.
        sqlx::query(
            r#"
            INSERT INTO stock_levels (sku, available, updated_at)
            VALUES ($1, 0, now())
            ON CONFLICT (sku) DO NOTHING
            "#,
        )
        .bind(sku)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock", e))?;

        let available: i64 = sqlx::query_scalar("SELECT available FROM stock_levels WHERE sku = $1 FOR UPDATE")
            .bind(sku)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_stock", e))?;
        Ok(available)
    }

    #[tracing::instrument(skip(self, tx), err)]
    async fn set_stock(&self, tx: &mut Self::Tx, sku: &str, available: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_levels (sku, available, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (sku) DO UPDATE SET available = EXCLUDED.available, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(sku)
        .bind(available)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("set_stock", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, tx, reservation), fields(reservation_id = %reservation.id), err)]
    async fn insert_reservation(&self, tx: &mut Self::Tx, reservation: &Reservation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reservations (id, sku, quantity, status, expires_at, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(&reservation.sku)
        .bind(reservation.quantity)
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .bind(reservation.finished_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_reservation", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, tx), fields(reservation_id = %id), err)]
    async fn lock_reservation(&self, tx: &mut Self::Tx, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let row: Option<ReservationRow> =
            sqlx::query_as(&format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"))
                .bind(id.as_uuid())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("lock_reservation", e))?;
        Ok(row.map(|r| r.0))
    }

    #[tracing::instrument(skip(self, tx, reservation), fields(reservation_id = %reservation.id), err)]
    async fn update_reservation(&self, tx: &mut Self::Tx, reservation: &Reservation) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE reservations SET status = $2, finished_at = $3 WHERE id = $1")
            .bind(reservation.id.as_uuid())
            .bind(reservation.status.as_str())
            .bind(reservation.finished_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_reservation", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::data(format!("reservation {} not found", reservation.id)));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, tx, movement), fields(movement_id = %movement.id), err)]
    async fn insert_movement(&self, tx: &mut Self::Tx, movement: &StockMovement) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_movements (id, sku, kind, quantity, destination, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(movement.id.as_uuid())
        .bind(&movement.sku)
        .bind(movement.kind.as_str())
        .bind(movement.quantity)
        .bind(&movement.destination)
        .bind(movement.occurred_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_movement", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(reservation_id = %id), err)]
    async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let row: Option<ReservationRow> =
            sqlx::query_as(&format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(self.pool())
                .await
                .map_err(|e| map_sqlx_error("reservation", e))?;
        Ok(row.map(|r| r.0))
    }

    #[tracing::instrument(skip(self), err)]
    async fn available(&self, sku: &str) -> Result<i64, StoreError> {
        let available: Option<i64> = sqlx::query_scalar("SELECT available FROM stock_levels WHERE sku = $1")
            .bind(sku)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("available", e))?;
        Ok(available.unwrap_or(0))
    }

    #[tracing::instrument(skip(self), err)]
    async fn movements(&self, sku: &str) -> Result<Vec<StockMovement>, StoreError> {
        let rows: Vec<MovementRow> = sqlx::query_as(
            r#"
            SELECT id, sku, kind, quantity, destination, occurred_at
            FROM stock_movements
            WHERE sku = $1
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(sku)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
