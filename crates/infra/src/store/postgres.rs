//! Postgres-backed stock store.
//!
//! One [`PostgresSession`] wraps one database transaction. Tenant scoping
//! is explicit in every query, with `app.tenant_id` set transaction-locally
//! as defense in depth for row-level-security policies.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StorageError` as follows:
//!
//! | PostgreSQL SQLSTATE | StorageError | Scenario |
//! |---------------------|--------------|----------|
//! | `23P01` | `OverlapConflict` | hold exclusion constraint rejected the claim |
//! | `23505` | `DuplicateOperation` | unique violation, in practice (tenant_id, op_id) |
//! | `40001`, `40P01` | `RetryableConflict` | serialization failure / deadlock detected |
//! | `42501`, `42883` | `LockUnavailable` | advisory lock unauthorized / missing |
//! | any other | `Backend` | fatal for the attempt |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use stockpile_core::{
    EventId, HoldId, LocationId, LotId, OrderId, OrderLineId, ProductId, TenantId, WarehouseId,
};
use stockpile_ledger::{
    Candidate, Coordinate, Hold, NewHold, NewLedgerEvent, OrderLine, OrderStatus,
};

use super::queries;
use super::{
    AppendOutcome, OrderLock, ReserveOutcome, SessionBudgets, StockSession, StockStore,
    StorageError,
};
use crate::lock::order_lock_key;

/// How [`StockSession::refresh_snapshot`] recomputes the materialized view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotRefreshMode {
    /// Refresh inside the transaction; readers of the view block briefly.
    #[default]
    Blocking,
    /// `REFRESH … CONCURRENTLY` after commit; readers never block, the
    /// snapshot lags until the deferred refresh lands.
    Concurrent,
}

/// Postgres implementation of [`StockStore`].
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
    refresh_mode: SnapshotRefreshMode,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            refresh_mode: SnapshotRefreshMode::default(),
        }
    }

    pub fn with_refresh_mode(mut self, mode: SnapshotRefreshMode) -> Self {
        self.refresh_mode = mode;
        self
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    type Session = PostgresSession;

    async fn begin(&self, tenant_id: TenantId) -> Result<Self::Session, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query(queries::SET_CONFIG)
            .bind("app.tenant_id")
            .bind(tenant_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_tenant", e))?;

        Ok(PostgresSession {
            tenant_id,
            tx,
            pool: Arc::clone(&self.pool),
            refresh_mode: self.refresh_mode,
            deferred_refresh: false,
        })
    }
}

/// One Postgres transaction of allocation/release work.
pub struct PostgresSession {
    tenant_id: TenantId,
    tx: Transaction<'static, Postgres>,
    pool: Arc<PgPool>,
    refresh_mode: SnapshotRefreshMode,
    deferred_refresh: bool,
}

impl PostgresSession {
    fn check_tenant(&self, tenant_id: TenantId, operation: &str) -> Result<(), StorageError> {
        if tenant_id != self.tenant_id {
            return Err(StorageError::TenantIsolation(format!(
                "{operation}: session tenant {} got payload for {}",
                self.tenant_id, tenant_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StockSession for PostgresSession {
    async fn apply_budgets(&mut self, budgets: &SessionBudgets) -> Result<(), StorageError> {
        let settings = [
            ("lock_timeout", format!("{}ms", budgets.lock_wait.as_millis())),
            (
                "statement_timeout",
                format!("{}ms", budgets.statement.as_millis()),
            ),
        ];
        for (key, value) in settings {
            sqlx::query(queries::SET_CONFIG)
                .bind(key)
                .bind(value)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("apply_budgets", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id, order_id = %order_id))]
    async fn lock_order(&mut self, order_id: OrderId) -> Result<OrderLock, StorageError> {
        let key = order_lock_key(self.tenant_id, order_id);
        match sqlx::query(queries::ACQUIRE_ORDER_LOCK)
            .bind(key)
            .execute(&mut *self.tx)
            .await
        {
            Ok(_) => Ok(OrderLock::Acquired),
            Err(e) => match map_sqlx_error("lock_order", e) {
                StorageError::LockUnavailable(reason) => Ok(OrderLock::Unsupported { reason }),
                other => Err(other),
            },
        }
    }

    async fn order_lines(&mut self, order_id: OrderId) -> Result<Vec<OrderLine>, StorageError> {
        let rows = sqlx::query(queries::SELECT_ORDER_LINES)
            .bind(self.tenant_id.as_uuid())
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("order_lines", e))?;

        rows.iter()
            .map(|row| {
                Ok(OrderLine {
                    id: OrderLineId::from_uuid(get(row, "order_lines", "id")?),
                    order_id: OrderId::from_uuid(get(row, "order_lines", "order_id")?),
                    product_id: ProductId::from_uuid(get(row, "order_lines", "product_id")?),
                    qty: get(row, "order_lines", "qty")?,
                })
            })
            .collect()
    }

    async fn candidates(
        &mut self,
        product_id: ProductId,
        limit: u32,
    ) -> Result<Vec<Candidate>, StorageError> {
        let rows = sqlx::query(queries::ALLOCATION_CANDIDATES)
            .bind(self.tenant_id.as_uuid())
            .bind(product_id.as_uuid())
            .bind(i64::from(limit))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("candidates", e))?;

        rows.iter()
            .map(|row| {
                Ok(Candidate {
                    warehouse_id: WarehouseId::from_uuid(get(row, "candidates", "warehouse_id")?),
                    location_id: LocationId::from_uuid(get(row, "candidates", "location_id")?),
                    lot_id: LotId::from_uuid(get(row, "candidates", "lot_id")?),
                    available_qty: get(row, "candidates", "available_qty")?,
                    expires_on: get::<Option<NaiveDate>>(row, "candidates", "expiry_date")?,
                })
            })
            .collect()
    }

    #[instrument(
        skip(self, hold, event),
        fields(tenant_id = %self.tenant_id, lot_id = %hold.lot_id, qty = hold.qty)
    )]
    async fn reserve(
        &mut self,
        hold: NewHold,
        event: NewLedgerEvent,
    ) -> Result<ReserveOutcome, StorageError> {
        self.check_tenant(hold.tenant_id, "reserve")?;
        self.check_tenant(event.tenant_id, "reserve")?;

        // Savepoint scope: an overlap rolls back only this candidate's
        // writes, never the rest of the attempt.
        let mut sp = self
            .tx
            .begin()
            .await
            .map_err(|e| map_sqlx_error("reserve_savepoint", e))?;

        let inserted = sqlx::query(queries::INSERT_HOLD)
            .bind(hold.id.as_uuid())
            .bind(hold.tenant_id.as_uuid())
            .bind(hold.order_id.as_uuid())
            .bind(hold.order_line_id.as_uuid())
            .bind(hold.product_id.as_uuid())
            .bind(hold.lot_id.as_uuid())
            .bind(hold.warehouse_id.as_uuid())
            .bind(hold.location_id.as_uuid())
            .bind(hold.qty)
            .execute(&mut *sp)
            .await;

        if let Err(e) = inserted {
            let mapped = map_sqlx_error("insert_hold", e);
            sp.rollback()
                .await
                .map_err(|e| map_sqlx_error("reserve_rollback", e))?;
            return match mapped {
                StorageError::OverlapConflict(_) => Ok(ReserveOutcome::Overlap),
                other => Err(other),
            };
        }

        let event_row = sqlx::query(queries::INSERT_LEDGER_EVENT)
            .bind(event.tenant_id.as_uuid())
            .bind(event.event_type.as_str())
            .bind(event.warehouse_id.as_uuid())
            .bind(event.location_id.as_uuid())
            .bind(event.product_id.as_uuid())
            .bind(event.lot_id.as_uuid())
            .bind(event.qty_delta)
            .bind(event.order_id.map(|id| *id.as_uuid()))
            .bind(event.order_line_id.map(|id| *id.as_uuid()))
            .bind(event.reason.as_deref())
            .bind(event.op_id.as_uuid())
            .fetch_optional(&mut *sp)
            .await;

        match event_row {
            Ok(Some(row)) => {
                let event_id = EventId::from_uuid(get(&row, "stock_ledger", "id")?);
                sp.commit()
                    .await
                    .map_err(|e| map_sqlx_error("reserve_commit", e))?;
                Ok(ReserveOutcome::Reserved {
                    hold_id: hold.id,
                    event_id,
                })
            }
            Ok(None) => {
                sp.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("reserve_rollback", e))?;
                Err(StorageError::DuplicateOperation(format!(
                    "op {} already recorded for tenant {}",
                    event.op_id, event.tenant_id
                )))
            }
            Err(e) => {
                let mapped = map_sqlx_error("insert_ledger_event", e);
                sp.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("reserve_rollback", e))?;
                Err(mapped)
            }
        }
    }

    #[instrument(
        skip(self, event),
        fields(tenant_id = %self.tenant_id, event_type = %event.event_type, op_id = %event.op_id)
    )]
    async fn append_event(
        &mut self,
        event: NewLedgerEvent,
    ) -> Result<AppendOutcome, StorageError> {
        self.check_tenant(event.tenant_id, "append_event")?;

        let row = sqlx::query(queries::INSERT_LEDGER_EVENT)
            .bind(event.tenant_id.as_uuid())
            .bind(event.event_type.as_str())
            .bind(event.warehouse_id.as_uuid())
            .bind(event.location_id.as_uuid())
            .bind(event.product_id.as_uuid())
            .bind(event.lot_id.as_uuid())
            .bind(event.qty_delta)
            .bind(event.order_id.map(|id| *id.as_uuid()))
            .bind(event.order_line_id.map(|id| *id.as_uuid()))
            .bind(event.reason.as_deref())
            .bind(event.op_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("append_event", e))?;

        match row {
            Some(row) => Ok(AppendOutcome::Appended(EventId::from_uuid(get(
                &row,
                "stock_ledger",
                "id",
            )?))),
            None => Ok(AppendOutcome::Duplicate),
        }
    }

    async fn current_stock(&mut self, coordinate: Coordinate) -> Result<i64, StorageError> {
        let row = sqlx::query(queries::CURRENT_STOCK)
            .bind(self.tenant_id.as_uuid())
            .bind(coordinate.warehouse_id.as_uuid())
            .bind(coordinate.location_id.as_uuid())
            .bind(coordinate.product_id.as_uuid())
            .bind(coordinate.lot_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("current_stock", e))?;

        get(&row, "current_stock", "qty")
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id, order_id = %order_id))]
    async fn release_holds(&mut self, order_id: OrderId) -> Result<Vec<Hold>, StorageError> {
        let rows = sqlx::query(queries::RELEASE_ACTIVE_HOLDS)
            .bind(self.tenant_id.as_uuid())
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("release_holds", e))?;

        let tenant_id = self.tenant_id;
        rows.iter()
            .map(|row| {
                Ok(Hold {
                    id: HoldId::from_uuid(get(row, "holds", "id")?),
                    tenant_id,
                    order_id: OrderId::from_uuid(get(row, "holds", "order_id")?),
                    order_line_id: OrderLineId::from_uuid(get(row, "holds", "order_line_id")?),
                    product_id: ProductId::from_uuid(get(row, "holds", "product_id")?),
                    lot_id: LotId::from_uuid(get(row, "holds", "lot_id")?),
                    warehouse_id: WarehouseId::from_uuid(get(row, "holds", "warehouse_id")?),
                    location_id: LocationId::from_uuid(get(row, "holds", "location_id")?),
                    qty: get(row, "holds", "qty")?,
                    created_at: get::<DateTime<Utc>>(row, "holds", "created_at")?,
                    released_at: get::<Option<DateTime<Utc>>>(row, "holds", "released_at")?,
                })
            })
            .collect()
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        sqlx::query(queries::SET_ORDER_STATUS)
            .bind(self.tenant_id.as_uuid())
            .bind(order_id.as_uuid())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_order_status", e))?;
        Ok(())
    }

    async fn refresh_snapshot(&mut self) -> Result<(), StorageError> {
        match self.refresh_mode {
            SnapshotRefreshMode::Blocking => {
                sqlx::query(queries::REFRESH_CURRENT_STOCK)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| map_sqlx_error("refresh_snapshot", e))?;
            }
            SnapshotRefreshMode::Concurrent => {
                // CONCURRENTLY cannot run inside a transaction block.
                self.deferred_refresh = true;
            }
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        let Self {
            tx,
            pool,
            deferred_refresh,
            ..
        } = self;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        if deferred_refresh {
            sqlx::query(queries::REFRESH_CURRENT_STOCK_CONCURRENT)
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("refresh_snapshot", e))?;
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Decode one column, wrapping decode failures as backend errors.
fn get<'r, T>(
    row: &'r sqlx::postgres::PgRow,
    operation: &str,
    column: &str,
) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StorageError::backend(operation, format!("column {column}: {e}")))
}

/// Map SQLx errors to `StorageError` per the table in the module docs.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23P01") => StorageError::OverlapConflict(message),
                Some("23505") => StorageError::DuplicateOperation(message),
                Some(code @ ("40001" | "40P01")) => StorageError::RetryableConflict {
                    code: code.to_string(),
                    message,
                },
                Some("42501") | Some("42883") => StorageError::LockUnavailable(message),
                _ => StorageError::backend(operation, db_err.message().to_string()),
            }
        }
        sqlx::Error::PoolClosed => StorageError::backend(operation, "connection pool closed"),
        other => StorageError::backend(operation, other.to_string()),
    }
}
