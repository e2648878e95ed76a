//! Reservation holds.
//!
//! A hold is a temporary claim on specific stock for one order line. It is
//! created atomically with a RESERVE ledger event of equal and opposite
//! magnitude, and closed either by the release workflow or never (holds do
//! not expire on their own).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockpile_core::{
    DomainError, DomainResult, HoldId, LocationId, LotId, OrderId, OrderLineId, ProductId,
    TenantId, WarehouseId,
};

use crate::event::Coordinate;

/// The key on which two active holds may not overlap.
///
/// Storage enforces that at most one active hold exists per claim; a second
/// claimant gets an overlap conflict and moves on to its next candidate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldClaim {
    pub product_id: ProductId,
    pub lot_id: LotId,
    pub location_id: LocationId,
}

/// A hold ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHold {
    pub id: HoldId,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub order_line_id: OrderLineId,
    pub product_id: ProductId,
    pub lot_id: LotId,
    pub warehouse_id: WarehouseId,
    pub location_id: LocationId,
    pub qty: i64,
}

impl NewHold {
    /// Build a claim of `qty` units. Fails on non-positive quantities.
    #[allow(clippy::too_many_arguments)]
    pub fn claim(
        tenant_id: TenantId,
        order_id: OrderId,
        order_line_id: OrderLineId,
        product_id: ProductId,
        lot_id: LotId,
        warehouse_id: WarehouseId,
        location_id: LocationId,
        qty: i64,
    ) -> DomainResult<Self> {
        if qty <= 0 {
            return Err(DomainError::invariant(format!(
                "hold quantity must be positive, got {qty}"
            )));
        }
        Ok(Self {
            id: HoldId::new(),
            tenant_id,
            order_id,
            order_line_id,
            product_id,
            lot_id,
            warehouse_id,
            location_id,
            qty,
        })
    }

    pub fn claim_key(&self) -> HoldClaim {
        HoldClaim {
            product_id: self.product_id,
            lot_id: self.lot_id,
            location_id: self.location_id,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            warehouse_id: self.warehouse_id,
            location_id: self.location_id,
            product_id: self.product_id,
            lot_id: self.lot_id,
        }
    }
}

/// A hold as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub order_line_id: OrderLineId,
    pub product_id: ProductId,
    pub lot_id: LotId,
    pub warehouse_id: WarehouseId,
    pub location_id: LocationId,
    pub qty: i64,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Hold {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    pub fn claim_key(&self) -> HoldClaim {
        HoldClaim {
            product_id: self.product_id,
            lot_id: self.lot_id,
            location_id: self.location_id,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            warehouse_id: self.warehouse_id,
            location_id: self.location_id,
            product_id: self.product_id,
            lot_id: self.lot_id,
        }
    }
}
