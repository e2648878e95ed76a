//! End-to-end allocation/release flows against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use stockpile_allocation::{AllocationEngine, AllocationError, AllocationHint, EngineConfig, RetryPolicy};
use stockpile_core::{LocationId, LotId, OrderId, ProductId, TenantId, WarehouseId};
use stockpile_infra::store::in_memory::InMemorySession;
use stockpile_infra::{
    AppendOutcome, InMemoryStockStore, OrderLock, ReserveOutcome, SessionBudgets, StockSession,
    StockStore, StorageError,
};
use stockpile_ledger::{
    Candidate, Coordinate, EventType, Hold, NewHold, NewLedgerEvent, OrderLine, OrderStatus,
};

struct Fixture {
    store: InMemoryStockStore,
    tenant: TenantId,
    product: ProductId,
    warehouse: WarehouseId,
    location: LocationId,
}

impl Fixture {
    fn new() -> Self {
        stockpile_observability::init();
        Self {
            store: InMemoryStockStore::new(),
            tenant: TenantId::new(),
            product: ProductId::new(),
            warehouse: WarehouseId::new(),
            location: LocationId::new(),
        }
    }

    fn coordinate(&self, lot: LotId) -> Coordinate {
        Coordinate {
            warehouse_id: self.warehouse,
            location_id: self.location,
            product_id: self.product,
            lot_id: lot,
        }
    }

    /// Receive `qty` units into a fresh lot, returning its coordinate.
    async fn receive_lot(&self, qty: i64) -> Coordinate {
        let lot = LotId::new();
        self.store.register_lot(lot, None).await;
        let coord = self.coordinate(lot);

        let mut session = self.store.begin(self.tenant).await.unwrap();
        session
            .append_event(NewLedgerEvent::movement(
                self.tenant,
                EventType::Receipt,
                coord,
                qty,
            ))
            .await
            .unwrap();
        session.commit().await.unwrap();
        coord
    }

    async fn order_for(&self, qty: i64) -> OrderId {
        let order = OrderId::new();
        self.store.insert_order(self.tenant, order).await;
        self.store
            .insert_order_line(order, self.product, qty)
            .await;
        order
    }

    /// Active hold quantity must always mirror the uncompensated RESERVE
    /// deltas in the ledger.
    async fn assert_holds_consistent(&self) {
        let active: i64 = self
            .store
            .holds()
            .await
            .iter()
            .filter(|h| h.tenant_id == self.tenant && h.is_active())
            .map(|h| h.qty)
            .sum();

        let compensated_reserves: i64 = self
            .store
            .ledger_events()
            .await
            .iter()
            .filter(|e| {
                e.tenant_id == self.tenant
                    && matches!(e.event_type, EventType::Reserve | EventType::Release)
            })
            .map(|e| e.qty_delta)
            .sum();

        assert_eq!(active, -compensated_reserves);
    }
}

#[tokio::test]
async fn concurrent_allocators_never_double_book() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;

    let order_a = fx.order_for(6).await;
    let order_b = fx.order_for(6).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let (tenant, ea, eb) = (fx.tenant, engine.clone(), engine);
    let task_a = tokio::spawn(async move { ea.allocate(tenant, order_a, None).await });
    let task_b = tokio::spawn(async move { eb.allocate(tenant, order_b, None).await });

    let a = task_a.await.unwrap().unwrap();
    let b = task_b.await.unwrap().unwrap();

    let a_alloc = a.lines[0].allocated;
    let b_alloc = b.lines[0].allocated;

    assert!((0..=6).contains(&a_alloc));
    assert!((0..=6).contains(&b_alloc));
    assert!(a_alloc + b_alloc <= 10, "double booked: {a_alloc} + {b_alloc}");

    fx.assert_holds_consistent().await;
}

#[tokio::test]
async fn over_request_partially_allocates_without_error() {
    let fx = Fixture::new();
    let coord = fx.receive_lot(10).await;
    let order = fx.order_for(12).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let outcome = engine.allocate(fx.tenant, order, None).await.unwrap();

    assert_eq!(outcome.lines.len(), 1);
    assert_eq!(outcome.lines[0].requested, 12);
    assert_eq!(outcome.lines[0].allocated, 10);
    assert_eq!(
        fx.store.order_status(order).await,
        Some(OrderStatus::Allocated)
    );

    // The snapshot was refreshed once and agrees with the ledger.
    assert_eq!(
        fx.store.snapshot_qty(fx.tenant, coord).await,
        fx.store.ledger_total(fx.tenant, coord).await
    );
    fx.assert_holds_consistent().await;
}

#[tokio::test]
async fn release_restores_availability_in_full() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;
    let order = fx.order_for(10).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let first = engine.allocate(fx.tenant, order, None).await.unwrap();
    assert_eq!(first.lines[0].allocated, 10);

    let released = engine.release(fx.tenant, order).await.unwrap();
    assert_eq!(released.released_lines, 1);
    assert_eq!(released.released_qty, 10);
    assert_eq!(fx.store.order_status(order).await, Some(OrderStatus::Open));
    fx.assert_holds_consistent().await;

    let again = engine.allocate(fx.tenant, order, None).await.unwrap();
    assert_eq!(again.lines[0].allocated, 10);
    assert_eq!(
        fx.store.order_status(order).await,
        Some(OrderStatus::Allocated)
    );
    fx.assert_holds_consistent().await;
}

#[tokio::test]
async fn releasing_without_active_holds_is_a_no_op() {
    let fx = Fixture::new();
    let order = fx.order_for(5).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let released = engine.release(fx.tenant, order).await.unwrap();

    assert_eq!(released.released_lines, 0);
    assert_eq!(released.released_qty, 0);
    assert_eq!(fx.store.order_status(order).await, Some(OrderStatus::Open));
}

#[tokio::test]
async fn reallocating_a_satisfied_order_is_safe() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;
    let order = fx.order_for(10).await;

    let engine = AllocationEngine::new(fx.store.clone());
    engine.allocate(fx.tenant, order, None).await.unwrap();
    let second = engine.allocate(fx.tenant, order, None).await.unwrap();

    // Availability is already consumed by the order's own holds.
    assert_eq!(second.lines[0].allocated, 0);
    assert_eq!(
        fx.store.order_status(order).await,
        Some(OrderStatus::Allocated)
    );
    fx.assert_holds_consistent().await;
}

#[tokio::test]
async fn allocation_spreads_across_lots_in_fixed_order() {
    let fx = Fixture::new();
    // Three lots of 4 under one roof; a request of 9 takes 4 + 4 + 1.
    fx.receive_lot(4).await;
    fx.receive_lot(4).await;
    fx.receive_lot(4).await;
    let order = fx.order_for(9).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let outcome = engine.allocate(fx.tenant, order, None).await.unwrap();

    assert_eq!(outcome.lines[0].allocated, 9);

    let holds = fx.store.holds().await;
    let mut quantities: Vec<i64> = holds.iter().map(|h| h.qty).collect();
    quantities.sort_unstable();
    assert_eq!(quantities, vec![1, 4, 4]);
    fx.assert_holds_consistent().await;
}

#[tokio::test]
async fn candidate_limit_hint_bounds_the_walk() {
    let fx = Fixture::new();
    for _ in 0..4 {
        fx.receive_lot(2).await;
    }
    let order = fx.order_for(8).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let hint = AllocationHint {
        candidate_limit: Some(2),
    };
    let outcome = engine.allocate(fx.tenant, order, Some(hint)).await.unwrap();

    // Only two of the four lots were visible to this call.
    assert_eq!(outcome.lines[0].allocated, 4);
}

#[tokio::test]
async fn unknown_order_allocates_nothing() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let outcome = engine
        .allocate(fx.tenant, OrderId::new(), None)
        .await
        .unwrap();

    assert!(outcome.lines.is_empty());
    assert!(!outcome.any_allocated());
    // No ledger writes, so nothing was reserved.
    assert_eq!(fx.store.holds().await.len(), 0);
}

#[tokio::test]
async fn multi_line_orders_allocate_each_line_independently() {
    let fx = Fixture::new();
    fx.receive_lot(5).await;

    // Second product with its own stock.
    let other_product = ProductId::new();
    let other_lot = LotId::new();
    fx.store.register_lot(other_lot, None).await;
    let other_coord = Coordinate {
        warehouse_id: fx.warehouse,
        location_id: fx.location,
        product_id: other_product,
        lot_id: other_lot,
    };
    let mut session = fx.store.begin(fx.tenant).await.unwrap();
    session
        .append_event(NewLedgerEvent::movement(
            fx.tenant,
            EventType::Receipt,
            other_coord,
            2,
        ))
        .await
        .unwrap();
    session.commit().await.unwrap();

    let order = OrderId::new();
    fx.store.insert_order(fx.tenant, order).await;
    let line_a = fx.store.insert_order_line(order, fx.product, 5).await;
    let line_b = fx.store.insert_order_line(order, other_product, 6).await;

    let engine = AllocationEngine::new(fx.store.clone());
    let outcome = engine.allocate(fx.tenant, order, None).await.unwrap();

    let find = |id| outcome.lines.iter().find(|l| l.order_line_id == id).unwrap();
    assert_eq!(find(line_a).allocated, 5);
    assert_eq!(find(line_b).allocated, 2);
    assert_eq!(find(line_b).shortfall(), 4);
    assert_eq!(
        fx.store.order_status(order).await,
        Some(OrderStatus::Allocated)
    );
    fx.assert_holds_consistent().await;
}

// --- retry-path coverage -------------------------------------------------

/// Wraps the in-memory store and fails the first `failures` commits with an
/// injected conflict, rolling the transaction back like a real aborted one.
#[derive(Clone)]
struct FlakyStore {
    inner: InMemoryStockStore,
    failures_left: Arc<AtomicU32>,
    fatal: bool,
}

impl FlakyStore {
    fn failing(inner: InMemoryStockStore, failures: u32) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicU32::new(failures)),
            fatal: false,
        }
    }

    fn fatal(inner: InMemoryStockStore, failures: u32) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicU32::new(failures)),
            fatal: true,
        }
    }
}

struct FlakySession {
    inner: InMemorySession,
    failures_left: Arc<AtomicU32>,
    fatal: bool,
}

#[async_trait]
impl StockStore for FlakyStore {
    type Session = FlakySession;

    async fn begin(&self, tenant_id: TenantId) -> Result<Self::Session, StorageError> {
        Ok(FlakySession {
            inner: self.inner.begin(tenant_id).await?,
            failures_left: Arc::clone(&self.failures_left),
            fatal: self.fatal,
        })
    }
}

#[async_trait]
impl StockSession for FlakySession {
    async fn apply_budgets(&mut self, budgets: &SessionBudgets) -> Result<(), StorageError> {
        self.inner.apply_budgets(budgets).await
    }

    async fn lock_order(&mut self, order_id: OrderId) -> Result<OrderLock, StorageError> {
        self.inner.lock_order(order_id).await
    }

    async fn order_lines(&mut self, order_id: OrderId) -> Result<Vec<OrderLine>, StorageError> {
        self.inner.order_lines(order_id).await
    }

    async fn candidates(
        &mut self,
        product_id: ProductId,
        limit: u32,
    ) -> Result<Vec<Candidate>, StorageError> {
        self.inner.candidates(product_id, limit).await
    }

    async fn reserve(
        &mut self,
        hold: NewHold,
        event: NewLedgerEvent,
    ) -> Result<ReserveOutcome, StorageError> {
        self.inner.reserve(hold, event).await
    }

    async fn append_event(
        &mut self,
        event: NewLedgerEvent,
    ) -> Result<AppendOutcome, StorageError> {
        self.inner.append_event(event).await
    }

    async fn current_stock(&mut self, coordinate: Coordinate) -> Result<i64, StorageError> {
        self.inner.current_stock(coordinate).await
    }

    async fn release_holds(&mut self, order_id: OrderId) -> Result<Vec<Hold>, StorageError> {
        self.inner.release_holds(order_id).await
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        self.inner.set_order_status(order_id, status).await
    }

    async fn refresh_snapshot(&mut self) -> Result<(), StorageError> {
        self.inner.refresh_snapshot().await
    }

    async fn commit(self) -> Result<(), StorageError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            self.inner.rollback().await?;
            if self.fatal {
                return Err(StorageError::backend("commit", "injected io failure"));
            }
            return Err(StorageError::RetryableConflict {
                code: "40001".to_string(),
                message: "injected serialization failure".to_string(),
            });
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.inner.rollback().await
    }
}

fn fast_retry_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            jitter_max: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn serialization_failures_are_retried_to_success() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;
    let order = fx.order_for(6).await;

    let flaky = FlakyStore::failing(fx.store.clone(), 2);
    let engine = AllocationEngine::with_config(flaky, fast_retry_config());

    let started = Instant::now();
    let outcome = engine.allocate(fx.tenant, order, None).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.lines[0].allocated, 6);
    // Two backoff sleeps: at least base*2 + base*4.
    assert!(elapsed >= Duration::from_millis(60), "elapsed {elapsed:?}");

    // Aborted attempts left no duplicate rows: one seed receipt plus one
    // RESERVE from the committed attempt.
    assert_eq!(fx.store.ledger_events().await.len(), 2);
    assert_eq!(fx.store.holds().await.len(), 1);
    fx.assert_holds_consistent().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_last_conflict() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;
    let order = fx.order_for(6).await;

    let flaky = FlakyStore::failing(fx.store.clone(), u32::MAX);
    let mut config = fast_retry_config();
    config.retry.max_attempts = 3;
    let engine = AllocationEngine::with_config(flaky, config);

    let err = engine.allocate(fx.tenant, order, None).await.unwrap_err();
    match err {
        AllocationError::Exhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.is_retryable());
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }

    // Every attempt rolled back; only the seed receipt remains.
    assert_eq!(fx.store.ledger_events().await.len(), 1);
    assert!(fx.store.holds().await.is_empty());
    assert_eq!(fx.store.order_status(order).await, Some(OrderStatus::Open));
}

#[tokio::test]
async fn fatal_failures_abort_without_retry() {
    let fx = Fixture::new();
    fx.receive_lot(10).await;
    let order = fx.order_for(6).await;

    let flaky = FlakyStore::fatal(fx.store.clone(), u32::MAX);
    let engine = AllocationEngine::with_config(flaky.clone(), fast_retry_config());

    let err = engine.allocate(fx.tenant, order, None).await.unwrap_err();
    assert!(matches!(err, AllocationError::Storage(_)));

    // Exactly one attempt was made.
    assert_eq!(flaky.failures_left.load(Ordering::SeqCst), u32::MAX - 1);
    assert!(fx.store.holds().await.is_empty());
}
