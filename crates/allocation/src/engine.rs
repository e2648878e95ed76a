//! End-to-end allocation and release for a single order.
//!
//! Concurrency design:
//! - Stable lock ordering: candidates arrive in a fixed
//!   (warehouse, lot, location, expiry) order, so workers that want
//!   overlapping rows request their locks in the same global sequence.
//! - Per-order advisory lock: at most one worker handles a given order at
//!   a time, across processes.
//! - Overlap conflicts on a candidate are absorbed locally; the walk moves
//!   to the next candidate.
//! - Deadlocks and serialization failures restart the whole attempt with
//!   backoff; every retry is a brand-new transaction.

use std::future::Future;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use stockpile_core::{OrderId, TenantId};
use stockpile_infra::{
    OrderLock, ReserveOutcome, SessionBudgets, StockSession, StockStore, StorageError,
};
use stockpile_ledger::{
    AllocationOutcome, DEFAULT_CANDIDATE_LIMIT, LineAllocation, NewHold, NewLedgerEvent,
    OrderStatus, ReleaseOutcome,
};

use crate::retry::{AttemptOutcome, RetryPolicy};

/// Engine failure, after attempt classification.
///
/// Partial allocation never appears here: shortfall is reported per line
/// in the successful outcome.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The retry budget ran out; carries the last retryable cause.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    /// Fatal storage failure, propagated unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Candidates fetched per line. More lots than this can under-allocate
    /// a heavily fragmented product; accepted approximation.
    pub candidate_limit: u32,
    pub budgets: SessionBudgets,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            budgets: SessionBudgets::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Caller-supplied tuning for one allocate call.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AllocationHint {
    /// Override the configured candidate bound for this call.
    pub candidate_limit: Option<u32>,
}

/// Orchestrates allocation and release against one [`StockStore`].
#[derive(Debug, Clone)]
pub struct AllocationEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: StockStore> AllocationEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Allocate stock to every line of an order.
    ///
    /// Walks each line's candidates in the fixed order, reserving
    /// `min(available, remaining)` per coordinate until the line is
    /// satisfied or candidates run out. Partial allocation is a normal,
    /// successful outcome; callers compare `allocated` to `requested` per
    /// line. Calling allocate again on an already-allocated order is safe:
    /// the fresh attempt sees availability already reduced by its own
    /// holds.
    #[instrument(skip(self, hint), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn allocate(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        hint: Option<AllocationHint>,
    ) -> Result<AllocationOutcome, AllocationError> {
        let limit = hint
            .and_then(|h| h.candidate_limit)
            .unwrap_or(self.config.candidate_limit);

        self.with_retry("allocate", || self.try_allocate(tenant_id, order_id, limit))
            .await
    }

    /// Undo every active hold for an order.
    ///
    /// Each closed hold gets one compensating RELEASE event with a fresh
    /// idempotency key. An order with no active holds releases to zero
    /// counts; that is not an error.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn release(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<ReleaseOutcome, AllocationError> {
        self.with_retry("release", || self.try_release(tenant_id, order_id))
            .await
    }

    /// Drive one operation through the classified retry loop.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T, AllocationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match AttemptOutcome::classify(attempt_fn().await) {
                AttemptOutcome::Success(value) => return Ok(value),
                AttemptOutcome::Retryable(err) => {
                    attempt += 1;
                    if !self.config.retry.should_retry(attempt) {
                        return Err(AllocationError::Exhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable conflict, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                AttemptOutcome::Fatal(err) => return Err(err.into()),
            }
        }
    }

    async fn try_allocate(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        limit: u32,
    ) -> Result<AllocationOutcome, StorageError> {
        let mut session = self.store.begin(tenant_id).await?;
        match Self::allocate_in_session(&mut session, &self.config.budgets, tenant_id, order_id, limit)
            .await
        {
            Ok(outcome) => {
                session.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rb) = session.rollback().await {
                    warn!(error = %rb, "rollback after failed attempt also failed");
                }
                Err(err)
            }
        }
    }

    async fn allocate_in_session(
        session: &mut S::Session,
        budgets: &SessionBudgets,
        tenant_id: TenantId,
        order_id: OrderId,
        limit: u32,
    ) -> Result<AllocationOutcome, StorageError> {
        session.apply_budgets(budgets).await?;
        Self::lock_or_degrade(session, order_id).await?;

        let lines = session.order_lines(order_id).await?;
        let mut results = Vec::with_capacity(lines.len());
        let mut ledger_changed = false;

        for line in &lines {
            let mut remaining = line.qty;
            let candidates = session.candidates(line.product_id, limit).await?;

            for candidate in candidates {
                if remaining <= 0 {
                    break;
                }
                if candidate.available_qty <= 0 {
                    continue;
                }
                let take = candidate.available_qty.min(remaining);

                let hold = NewHold::claim(
                    tenant_id,
                    order_id,
                    line.id,
                    line.product_id,
                    candidate.lot_id,
                    candidate.warehouse_id,
                    candidate.location_id,
                    take,
                )
                .map_err(|e| StorageError::backend("reserve", e.to_string()))?;
                let event = NewLedgerEvent::reserve_for(&hold);

                match session.reserve(hold, event).await? {
                    ReserveOutcome::Reserved { .. } => {
                        ledger_changed = true;
                        remaining -= take;
                    }
                    ReserveOutcome::Overlap => {
                        // Another worker is mid-claim on this row; expected
                        // under contention.
                        debug!(lot_id = %candidate.lot_id, "candidate already claimed, moving on");
                    }
                }
            }

            results.push(LineAllocation {
                order_line_id: line.id,
                requested: line.qty,
                allocated: line.qty - remaining,
            });
        }

        if results.iter().any(|r| r.allocated > 0) {
            session
                .set_order_status(order_id, OrderStatus::Allocated)
                .await?;
        }
        if ledger_changed {
            // Once per attempt, not per line.
            session.refresh_snapshot().await?;
        }

        Ok(AllocationOutcome {
            order_id,
            lines: results,
        })
    }

    async fn try_release(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<ReleaseOutcome, StorageError> {
        let mut session = self.store.begin(tenant_id).await?;
        match Self::release_in_session(&mut session, &self.config.budgets, tenant_id, order_id)
            .await
        {
            Ok(outcome) => {
                session.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rb) = session.rollback().await {
                    warn!(error = %rb, "rollback after failed attempt also failed");
                }
                Err(err)
            }
        }
    }

    async fn release_in_session(
        session: &mut S::Session,
        budgets: &SessionBudgets,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<ReleaseOutcome, StorageError> {
        session.apply_budgets(budgets).await?;
        Self::lock_or_degrade(session, order_id).await?;

        let holds = session.release_holds(order_id).await?;
        let mut released_qty = 0;
        for hold in &holds {
            released_qty += hold.qty;
            let event = NewLedgerEvent::release_for(tenant_id, hold, "manual release");
            // Duplicate means the compensation already landed; no-op.
            session.append_event(event).await?;
        }

        if !holds.is_empty() {
            session.set_order_status(order_id, OrderStatus::Open).await?;
            session.refresh_snapshot().await?;
        }

        Ok(ReleaseOutcome {
            order_id,
            released_lines: holds.len() as u64,
            released_qty,
        })
    }

    async fn lock_or_degrade(
        session: &mut S::Session,
        order_id: OrderId,
    ) -> Result<(), StorageError> {
        match session.lock_order(order_id).await? {
            OrderLock::Acquired => {}
            OrderLock::Unsupported { reason } => {
                // Row locks still prevent double-booking; only inter-order
                // serialization is weakened.
                warn!(%order_id, reason = %reason, "advisory locking degraded, relying on row locks");
            }
        }
        Ok(())
    }
}
