//! Named SQL for the Postgres store.
//!
//! Compile-time constants instead of runtime-loaded query files, so a typo
//! in a query name is a build failure, not a `KeyError` at first use.
//!
//! Schema expectations (owned by the migrations module, not this crate):
//! `core.stock_ledger` with a unique index on `(tenant_id, op_id)`;
//! `core.holds` with an exclusion constraint rejecting two rows with equal
//! `(product_id, lot_id, location_id)` while `released_at IS NULL`;
//! `core.lots.expiry_date date NULL`; `dw.current_stock_mv` with a unique
//! index (required for the concurrent refresh variant).

/// Transaction-local GUC assignment (third argument `true` = local).
pub const SET_CONFIG: &str = "SELECT set_config($1, $2, true)";

/// Transaction-scoped exclusive lock on a 64-bit key; released at commit
/// or rollback, never explicitly.
pub const ACQUIRE_ORDER_LOCK: &str = "SELECT pg_advisory_xact_lock($1)";

pub const SELECT_ORDER_LINES: &str = r#"
SELECT ol.id, ol.order_id, ol.product_id, ol.qty::bigint AS qty
FROM core.order_lines ol
WHERE ol.tenant_id = $1
  AND ol.order_id = $2
ORDER BY ol.id
"#;

/// Unclaimed stock for one product in the fixed walk order.
///
/// The ordering (warehouse, lot, location, expiry ascending with
/// non-expiring lots last) is the deadlock-avoidance contract shared by
/// every worker. `FOR UPDATE OF l SKIP LOCKED` claims the lot rows without
/// queueing behind a concurrent claimer; rows another transaction holds
/// simply drop out of this worker's view.
pub const ALLOCATION_CANDIDATES: &str = r#"
SELECT s.warehouse_id, s.location_id, s.lot_id, s.available_qty, l.expiry_date
FROM (
    SELECT sl.warehouse_id, sl.location_id, sl.lot_id,
           SUM(sl.qty_delta)::bigint AS available_qty
    FROM core.stock_ledger sl
    WHERE sl.tenant_id = $1
      AND sl.product_id = $2
    GROUP BY sl.warehouse_id, sl.location_id, sl.lot_id
) s
JOIN core.lots l ON l.id = s.lot_id
WHERE s.available_qty > 0
ORDER BY s.warehouse_id, s.lot_id, s.location_id, l.expiry_date ASC NULLS LAST
LIMIT $3
FOR UPDATE OF l SKIP LOCKED
"#;

/// Raises SQLSTATE 23P01 when the claim collides with an active hold.
pub const INSERT_HOLD: &str = r#"
INSERT INTO core.holds
    (id, tenant_id, order_id, order_line_id, product_id, lot_id,
     warehouse_id, location_id, qty)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

/// Idempotent append: a re-sent `(tenant_id, op_id)` inserts nothing and
/// returns no row.
pub const INSERT_LEDGER_EVENT: &str = r#"
INSERT INTO core.stock_ledger
    (tenant_id, event_type, warehouse_id, location_id, product_id, lot_id,
     qty_delta, order_id, order_line_id, reason, op_id)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (tenant_id, op_id) DO NOTHING
RETURNING id
"#;

pub const CURRENT_STOCK: &str = r#"
SELECT COALESCE(SUM(sl.qty_delta), 0)::bigint AS qty
FROM core.stock_ledger sl
WHERE sl.tenant_id = $1
  AND sl.warehouse_id = $2
  AND sl.location_id = $3
  AND sl.product_id = $4
  AND sl.lot_id = $5
"#;

pub const RELEASE_ACTIVE_HOLDS: &str = r#"
UPDATE core.holds
SET released_at = now()
WHERE tenant_id = $1
  AND order_id = $2
  AND released_at IS NULL
RETURNING id, order_id, order_line_id, product_id, lot_id,
          warehouse_id, location_id, qty::bigint AS qty,
          created_at, released_at
"#;

pub const SET_ORDER_STATUS: &str = r#"
UPDATE core.orders
SET status = $3
WHERE tenant_id = $1
  AND id = $2
"#;

pub const REFRESH_CURRENT_STOCK: &str = "REFRESH MATERIALIZED VIEW dw.current_stock_mv";

/// Non-blocking variant; cannot run inside a transaction block, so the
/// session defers it until after commit.
pub const REFRESH_CURRENT_STOCK_CONCURRENT: &str =
    "REFRESH MATERIALIZED VIEW CONCURRENTLY dw.current_stock_mv";
