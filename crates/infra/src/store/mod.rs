//! Transactional storage seam for the allocation core.
//!
//! The engine never talks to a database directly; it opens a
//! [`StockSession`] from a [`StockStore`], performs all reads and writes of
//! one attempt inside that session, and either commits or rolls back. Each
//! session is one ACID transaction: a fatal failure mid-attempt leaves the
//! ledger and hold store exactly as they were.
//!
//! Order/product/warehouse CRUD, HTTP, and read APIs live outside this
//! seam; the trait carries only what allocation and release consume.

pub mod in_memory;
pub mod postgres;
pub mod queries;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use stockpile_core::{EventId, HoldId, OrderId, ProductId, TenantId};
use stockpile_ledger::{Candidate, Coordinate, Hold, NewHold, NewLedgerEvent, OrderLine, OrderStatus};

/// Storage operation error.
///
/// The variants mirror how the engine reacts:
///
/// | Variant              | Engine reaction                                  |
/// |----------------------|--------------------------------------------------|
/// | `OverlapConflict`    | absorbed per candidate (never escapes `reserve`) |
/// | `DuplicateOperation` | absorbed as success-no-op on ledger appends      |
/// | `RetryableConflict`  | restart the whole attempt with backoff           |
/// | `LockUnavailable`    | degraded mode, warn and continue                 |
/// | `TenantIsolation`    | fatal                                            |
/// | `Backend`            | fatal                                            |
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another active hold already claims the same (product, lot, location).
    #[error("hold overlaps an active claim: {0}")]
    OverlapConflict(String),

    /// An op_id the tenant has already recorded was re-submitted.
    #[error("duplicate operation: {0}")]
    DuplicateOperation(String),

    /// Deadlock or serialization failure; the attempt may be retried.
    #[error("retryable conflict ({code}): {message}")]
    RetryableConflict { code: String, message: String },

    /// The advisory-lock primitive is unsupported or unauthorized.
    #[error("advisory lock unavailable: {0}")]
    LockUnavailable(String),

    /// Cross-tenant access attempted through a tenant-scoped session.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Any other storage failure; fatal for the attempt.
    #[error("storage failure in {operation}: {message}")]
    Backend { operation: String, message: String },
}

impl StorageError {
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True only for deadlock/serialization failures, the two conditions
    /// that restart an entire attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::RetryableConflict { .. })
    }
}

/// Per-attempt time budgets, applied transaction-locally.
///
/// Short budgets make contention fail fast and leave the recovery to the
/// retry loop instead of queueing behind held row locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBudgets {
    /// How long a statement may wait on a row lock.
    pub lock_wait: Duration,
    /// Overall bound on any single statement.
    pub statement: Duration,
}

impl Default for SessionBudgets {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(200),
            statement: Duration::from_secs(4),
        }
    }
}

/// Result of acquiring the per-order advisory lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLock {
    /// Exclusive for the duration of the transaction.
    Acquired,
    /// The primitive is unsupported/unauthorized in this environment.
    /// Row-level locking still prevents double-booking; only inter-order
    /// serialization is weakened.
    Unsupported { reason: String },
}

/// Result of an idempotent ledger append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(EventId),
    /// The (tenant_id, op_id) pair already exists; nothing was written.
    Duplicate,
}

/// Result of a hold + RESERVE pair attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { hold_id: HoldId, event_id: EventId },
    /// The claim collided with an existing active hold; only this
    /// candidate's writes were rolled back.
    Overlap,
}

/// Factory for tenant-scoped transactional sessions.
#[async_trait]
pub trait StockStore: Send + Sync {
    type Session: StockSession + 'static;

    /// Open a new transaction scoped to `tenant_id`.
    async fn begin(&self, tenant_id: TenantId) -> Result<Self::Session, StorageError>;
}

/// One transaction of allocation/release work.
///
/// Implementations must guarantee:
/// - all writes are invisible to other sessions until [`commit`](Self::commit);
/// - [`reserve`](Self::reserve) executes hold + RESERVE event atomically in
///   a sub-transaction, so an overlap rolls back only that candidate;
/// - [`candidates`](Self::candidates) returns rows in the fixed
///   (warehouse, lot, location, expiry) order and never blocks on rows
///   another session is mid-claim on;
/// - [`append_event`](Self::append_event) is idempotent on (tenant, op_id).
#[async_trait]
pub trait StockSession: Send {
    /// Apply lock-wait and statement budgets for the rest of the session.
    async fn apply_budgets(&mut self, budgets: &SessionBudgets) -> Result<(), StorageError>;

    /// Take the transaction-scoped exclusive lock for one order.
    async fn lock_order(&mut self, order_id: OrderId) -> Result<OrderLock, StorageError>;

    /// Read the order's demand lines.
    async fn order_lines(&mut self, order_id: OrderId) -> Result<Vec<OrderLine>, StorageError>;

    /// Unclaimed stock for a product, bounded and deterministically ordered.
    async fn candidates(
        &mut self,
        product_id: ProductId,
        limit: u32,
    ) -> Result<Vec<Candidate>, StorageError>;

    /// Insert a hold and its paired RESERVE event atomically.
    async fn reserve(
        &mut self,
        hold: NewHold,
        event: NewLedgerEvent,
    ) -> Result<ReserveOutcome, StorageError>;

    /// Append one ledger event, idempotent on (tenant_id, op_id).
    async fn append_event(&mut self, event: NewLedgerEvent)
    -> Result<AppendOutcome, StorageError>;

    /// Signed sum of every ledger event at a coordinate.
    ///
    /// Negative values are possible by construction and left to callers to
    /// interpret; availability enforcement lives in the candidate walk.
    async fn current_stock(&mut self, coordinate: Coordinate) -> Result<i64, StorageError>;

    /// Close every active hold for the order and return them.
    async fn release_holds(&mut self, order_id: OrderId) -> Result<Vec<Hold>, StorageError>;

    /// Flip the order status.
    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError>;

    /// Recompute the denormalized current-stock snapshot.
    async fn refresh_snapshot(&mut self) -> Result<(), StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}
