//! Append-only stock ledger events.
//!
//! A ledger event is an immutable, signed quantity change at a stock
//! coordinate. Current stock for a coordinate is the sum of `qty_delta`
//! over all events recorded at it; nothing in the system ever updates or
//! deletes an event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockpile_core::{
    DomainError, DomainResult, EventId, LocationId, LotId, OpId, OrderId, OrderLineId, ProductId,
    TenantId, WarehouseId,
};

use crate::hold::NewHold;

/// Kind of quantity movement recorded in the ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Receipt,
    Ship,
    AdjustIn,
    AdjustOut,
    Reserve,
    Release,
}

impl EventType {
    /// Wire/storage spelling of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Receipt => "RECEIPT",
            EventType::Ship => "SHIP",
            EventType::AdjustIn => "ADJUST_IN",
            EventType::AdjustOut => "ADJUST_OUT",
            EventType::Reserve => "RESERVE",
            EventType::Release => "RELEASE",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "RECEIPT" => Ok(EventType::Receipt),
            "SHIP" => Ok(EventType::Ship),
            "ADJUST_IN" => Ok(EventType::AdjustIn),
            "ADJUST_OUT" => Ok(EventType::AdjustOut),
            "RESERVE" => Ok(EventType::Reserve),
            "RELEASE" => Ok(EventType::Release),
            other => Err(DomainError::validation(format!(
                "unknown ledger event type '{other}'"
            ))),
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tuple identifying a physical stock position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub warehouse_id: WarehouseId,
    pub location_id: LocationId,
    pub product_id: ProductId,
    pub lot_id: LotId,
}

/// A ledger event ready to be appended (not yet assigned an id/timestamp).
///
/// `op_id` is the idempotency key: re-submitting an event with an `op_id`
/// the tenant has already recorded is a storage-level no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEvent {
    pub tenant_id: TenantId,
    pub event_type: EventType,
    pub warehouse_id: WarehouseId,
    pub location_id: LocationId,
    pub product_id: ProductId,
    pub lot_id: LotId,
    pub qty_delta: i64,
    pub op_id: OpId,
    pub order_id: Option<OrderId>,
    pub order_line_id: Option<OrderLineId>,
    pub reason: Option<String>,
}

impl NewLedgerEvent {
    /// A plain quantity movement at a coordinate, with a fresh idempotency key.
    pub fn movement(
        tenant_id: TenantId,
        event_type: EventType,
        coordinate: Coordinate,
        qty_delta: i64,
    ) -> Self {
        Self {
            tenant_id,
            event_type,
            warehouse_id: coordinate.warehouse_id,
            location_id: coordinate.location_id,
            product_id: coordinate.product_id,
            lot_id: coordinate.lot_id,
            qty_delta,
            op_id: OpId::new(),
            order_id: None,
            order_line_id: None,
            reason: None,
        }
    }

    /// The RESERVE event paired with a hold.
    ///
    /// Guarantees `qty_delta == -hold.qty` by construction.
    pub fn reserve_for(hold: &NewHold) -> Self {
        Self {
            tenant_id: hold.tenant_id,
            event_type: EventType::Reserve,
            warehouse_id: hold.warehouse_id,
            location_id: hold.location_id,
            product_id: hold.product_id,
            lot_id: hold.lot_id,
            qty_delta: -hold.qty,
            op_id: OpId::new(),
            order_id: Some(hold.order_id),
            order_line_id: Some(hold.order_line_id),
            reason: Some("allocation reserve".to_string()),
        }
    }

    /// The RELEASE event compensating a previously reserved hold.
    ///
    /// Carries a fresh `op_id`; the compensation is a new ledger fact, not a
    /// correction of the RESERVE row.
    pub fn release_for(tenant_id: TenantId, hold: &crate::hold::Hold, reason: &str) -> Self {
        Self {
            tenant_id,
            event_type: EventType::Release,
            warehouse_id: hold.warehouse_id,
            location_id: hold.location_id,
            product_id: hold.product_id,
            lot_id: hold.lot_id,
            qty_delta: hold.qty,
            op_id: OpId::new(),
            order_id: Some(hold.order_id),
            order_line_id: Some(hold.order_line_id),
            reason: Some(reason.to_string()),
        }
    }

    pub fn with_op_id(mut self, op_id: OpId) -> Self {
        self.op_id = op_id;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
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

/// A ledger event as stored (assigned an id and a timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: EventType,
    pub warehouse_id: WarehouseId,
    pub location_id: LocationId,
    pub product_id: ProductId,
    pub lot_id: LotId,
    pub qty_delta: i64,
    pub op_id: OpId,
    pub order_id: Option<OrderId>,
    pub order_line_id: Option<OrderLineId>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            warehouse_id: self.warehouse_id,
            location_id: self.location_id,
            product_id: self.product_id,
            lot_id: self.lot_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hold::NewHold;

    fn sample_hold() -> NewHold {
        NewHold::claim(
            TenantId::new(),
            OrderId::new(),
            OrderLineId::new(),
            ProductId::new(),
            LotId::new(),
            WarehouseId::new(),
            LocationId::new(),
            7,
        )
        .unwrap()
    }

    #[test]
    fn reserve_event_mirrors_hold_qty() {
        let hold = sample_hold();
        let event = NewLedgerEvent::reserve_for(&hold);

        assert_eq!(event.event_type, EventType::Reserve);
        assert_eq!(event.qty_delta, -7);
        assert_eq!(event.order_id, Some(hold.order_id));
        assert_eq!(event.order_line_id, Some(hold.order_line_id));
    }

    #[test]
    fn event_type_spelling_round_trips() {
        for ty in [
            EventType::Receipt,
            EventType::Ship,
            EventType::AdjustIn,
            EventType::AdjustOut,
            EventType::Reserve,
            EventType::Release,
        ] {
            assert_eq!(EventType::parse(ty.as_str()).unwrap(), ty);
        }
        assert!(EventType::parse("TRANSFER").is_err());
    }

    #[test]
    fn distinct_events_get_distinct_op_ids() {
        let hold = sample_hold();
        let a = NewLedgerEvent::reserve_for(&hold);
        let b = NewLedgerEvent::reserve_for(&hold);
        assert_ne!(a.op_id, b.op_id);
    }
}
