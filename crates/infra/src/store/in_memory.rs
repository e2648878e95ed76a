//! In-memory stock store.
//!
//! Intended for tests/dev. One big mutex serializes sessions; rollback is a
//! whole-state restore. Registration helpers stand in for the external
//! CRUD modules that own lots, orders, and order lines in production.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use stockpile_core::{EventId, LotId, OpId, OrderId, OrderLineId, ProductId, TenantId};
use stockpile_ledger::{
    Candidate, Coordinate, Hold, LedgerEvent, NewHold, NewLedgerEvent, OrderLine, OrderStatus,
    sort_candidates,
};

use super::{
    AppendOutcome, OrderLock, ReserveOutcome, SessionBudgets, StockSession, StockStore,
    StorageError,
};
use crate::lock::order_lock_key;

#[derive(Debug, Clone)]
struct OrderRecord {
    tenant_id: TenantId,
    status: OrderStatus,
}

#[derive(Debug, Clone, Default)]
struct State {
    ledger: Vec<LedgerEvent>,
    ops: HashSet<(TenantId, OpId)>,
    holds: Vec<Hold>,
    orders: HashMap<OrderId, OrderRecord>,
    lines: Vec<OrderLine>,
    lots: HashMap<LotId, Option<NaiveDate>>,
    snapshot: HashMap<(TenantId, Coordinate), i64>,
    advisory: HashSet<i64>,
}

/// In-memory implementation of [`StockStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lot and its optional expiry (collaborator stand-in).
    pub async fn register_lot(&self, lot_id: LotId, expires_on: Option<NaiveDate>) {
        self.state.lock().await.lots.insert(lot_id, expires_on);
    }

    /// Create an open order (collaborator stand-in).
    pub async fn insert_order(&self, tenant_id: TenantId, order_id: OrderId) {
        self.state.lock().await.orders.insert(
            order_id,
            OrderRecord {
                tenant_id,
                status: OrderStatus::Open,
            },
        );
    }

    /// Add a demand line to an order (collaborator stand-in).
    pub async fn insert_order_line(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        qty: i64,
    ) -> OrderLineId {
        let line = OrderLine {
            id: OrderLineId::new(),
            order_id,
            product_id,
            qty,
        };
        let id = line.id;
        self.state.lock().await.lines.push(line);
        id
    }

    pub async fn order_status(&self, order_id: OrderId) -> Option<OrderStatus> {
        self.state
            .lock()
            .await
            .orders
            .get(&order_id)
            .map(|rec| rec.status)
    }

    /// Snapshot value at a coordinate, as of the last refresh.
    pub async fn snapshot_qty(&self, tenant_id: TenantId, coordinate: Coordinate) -> i64 {
        self.state
            .lock()
            .await
            .snapshot
            .get(&(tenant_id, coordinate))
            .copied()
            .unwrap_or(0)
    }

    /// Signed sum of all ledger events at a coordinate.
    pub async fn ledger_total(&self, tenant_id: TenantId, coordinate: Coordinate) -> i64 {
        self.state
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.coordinate() == coordinate)
            .map(|e| e.qty_delta)
            .sum()
    }

    /// All stored ledger events (test inspection).
    pub async fn ledger_events(&self) -> Vec<LedgerEvent> {
        self.state.lock().await.ledger.clone()
    }

    /// All holds, active and released (test inspection).
    pub async fn holds(&self) -> Vec<Hold> {
        self.state.lock().await.holds.clone()
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    type Session = InMemorySession;

    async fn begin(&self, tenant_id: TenantId) -> Result<Self::Session, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let undo = Some((*guard).clone());
        Ok(InMemorySession {
            tenant_id,
            guard,
            undo,
            lock_keys: Vec::new(),
        })
    }
}

/// One in-memory transaction.
///
/// Holds the store mutex for its whole lifetime, so sessions are fully
/// serialized; concurrent callers queue at [`StockStore::begin`]. Rollback
/// (explicit or on drop) restores the state captured at begin.
pub struct InMemorySession {
    tenant_id: TenantId,
    guard: OwnedMutexGuard<State>,
    undo: Option<State>,
    lock_keys: Vec<i64>,
}

impl InMemorySession {
    fn store_event(&mut self, event: NewLedgerEvent) -> LedgerEvent {
        let stored = LedgerEvent {
            id: EventId::new(),
            tenant_id: event.tenant_id,
            event_type: event.event_type,
            warehouse_id: event.warehouse_id,
            location_id: event.location_id,
            product_id: event.product_id,
            lot_id: event.lot_id,
            qty_delta: event.qty_delta,
            op_id: event.op_id,
            order_id: event.order_id,
            order_line_id: event.order_line_id,
            reason: event.reason,
            recorded_at: Utc::now(),
        };
        self.guard.ops.insert((stored.tenant_id, stored.op_id));
        self.guard.ledger.push(stored.clone());
        stored
    }

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
impl StockSession for InMemorySession {
    async fn apply_budgets(&mut self, _budgets: &SessionBudgets) -> Result<(), StorageError> {
        // Nothing to bound: the in-memory store never waits on row locks.
        Ok(())
    }

    async fn lock_order(&mut self, order_id: OrderId) -> Result<OrderLock, StorageError> {
        // Sessions are already serialized by the store mutex; the key set is
        // kept so lock scoping matches the Postgres session.
        let key = order_lock_key(self.tenant_id, order_id);
        self.guard.advisory.insert(key);
        self.lock_keys.push(key);
        Ok(OrderLock::Acquired)
    }

    async fn order_lines(&mut self, order_id: OrderId) -> Result<Vec<OrderLine>, StorageError> {
        let visible = self
            .guard
            .orders
            .get(&order_id)
            .is_some_and(|rec| rec.tenant_id == self.tenant_id);
        if !visible {
            return Ok(Vec::new());
        }

        let mut lines: Vec<OrderLine> = self
            .guard
            .lines
            .iter()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.id);
        Ok(lines)
    }

    async fn candidates(
        &mut self,
        product_id: ProductId,
        limit: u32,
    ) -> Result<Vec<Candidate>, StorageError> {
        let mut sums: HashMap<Coordinate, i64> = HashMap::new();
        for event in self
            .guard
            .ledger
            .iter()
            .filter(|e| e.tenant_id == self.tenant_id && e.product_id == product_id)
        {
            *sums.entry(event.coordinate()).or_insert(0) += event.qty_delta;
        }

        let mut candidates: Vec<Candidate> = sums
            .into_iter()
            .filter(|(_, qty)| *qty > 0)
            .map(|(coordinate, qty)| Candidate {
                warehouse_id: coordinate.warehouse_id,
                location_id: coordinate.location_id,
                lot_id: coordinate.lot_id,
                available_qty: qty,
                expires_on: self.guard.lots.get(&coordinate.lot_id).copied().flatten(),
            })
            .collect();

        sort_candidates(&mut candidates);
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn reserve(
        &mut self,
        hold: NewHold,
        event: NewLedgerEvent,
    ) -> Result<ReserveOutcome, StorageError> {
        self.check_tenant(hold.tenant_id, "reserve")?;
        self.check_tenant(event.tenant_id, "reserve")?;
        if event.qty_delta != -hold.qty {
            return Err(StorageError::backend(
                "reserve",
                format!(
                    "hold qty {} and event delta {} are not equal and opposite",
                    hold.qty, event.qty_delta
                ),
            ));
        }

        // Exclusion-constraint stand-in: one active hold per claim key.
        let overlap = self.guard.holds.iter().any(|h| {
            h.tenant_id == self.tenant_id && h.is_active() && h.claim_key() == hold.claim_key()
        });
        if overlap {
            return Ok(ReserveOutcome::Overlap);
        }

        if self.guard.ops.contains(&(event.tenant_id, event.op_id)) {
            return Err(StorageError::DuplicateOperation(format!(
                "op {} already recorded for tenant {}",
                event.op_id, event.tenant_id
            )));
        }

        let stored_hold = Hold {
            id: hold.id,
            tenant_id: hold.tenant_id,
            order_id: hold.order_id,
            order_line_id: hold.order_line_id,
            product_id: hold.product_id,
            lot_id: hold.lot_id,
            warehouse_id: hold.warehouse_id,
            location_id: hold.location_id,
            qty: hold.qty,
            created_at: Utc::now(),
            released_at: None,
        };
        let hold_id = stored_hold.id;
        self.guard.holds.push(stored_hold);
        let stored_event = self.store_event(event);

        Ok(ReserveOutcome::Reserved {
            hold_id,
            event_id: stored_event.id,
        })
    }

    async fn append_event(
        &mut self,
        event: NewLedgerEvent,
    ) -> Result<AppendOutcome, StorageError> {
        self.check_tenant(event.tenant_id, "append_event")?;

        if self.guard.ops.contains(&(event.tenant_id, event.op_id)) {
            return Ok(AppendOutcome::Duplicate);
        }

        let stored = self.store_event(event);
        Ok(AppendOutcome::Appended(stored.id))
    }

    async fn current_stock(&mut self, coordinate: Coordinate) -> Result<i64, StorageError> {
        let tenant_id = self.tenant_id;
        Ok(self
            .guard
            .ledger
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.coordinate() == coordinate)
            .map(|e| e.qty_delta)
            .sum())
    }

    async fn release_holds(&mut self, order_id: OrderId) -> Result<Vec<Hold>, StorageError> {
        let now = Utc::now();
        let tenant_id = self.tenant_id;
        let mut released = Vec::new();

        for hold in self
            .guard
            .holds
            .iter_mut()
            .filter(|h| h.tenant_id == tenant_id && h.order_id == order_id && h.is_active())
        {
            hold.released_at = Some(now);
            released.push(hold.clone());
        }

        Ok(released)
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        let tenant_id = self.tenant_id;
        if let Some(rec) = self.guard.orders.get_mut(&order_id) {
            if rec.tenant_id == tenant_id {
                rec.status = status;
            }
        }
        Ok(())
    }

    async fn refresh_snapshot(&mut self) -> Result<(), StorageError> {
        // Full recompute, matching the production materialized view.
        let mut snapshot: HashMap<(TenantId, Coordinate), i64> = HashMap::new();
        for event in &self.guard.ledger {
            *snapshot
                .entry((event.tenant_id, event.coordinate()))
                .or_insert(0) += event.qty_delta;
        }
        self.guard.snapshot = snapshot;
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StorageError> {
        for key in self.lock_keys.drain(..) {
            self.guard.advisory.remove(&key);
        }
        self.undo = None;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StorageError> {
        if let Some(previous) = self.undo.take() {
            *self.guard = previous;
        }
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        // A session dropped without commit rolls back.
        if let Some(previous) = self.undo.take() {
            *self.guard = previous;
        }
    }
}
