//! Orders as seen by the allocation core.
//!
//! Orders and their lines are owned by an external module; the core only
//! reads lines and flips the order status across allocate/release cycles.

use serde::{Deserialize, Serialize};

use stockpile_core::{DomainError, DomainResult, OrderId, OrderLineId, ProductId};

/// Order status, as far as this core is concerned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Allocated,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Allocated => "allocated",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "allocated" => Ok(OrderStatus::Allocated),
            other => Err(DomainError::validation(format!(
                "unknown order status '{other}'"
            ))),
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single demand line: `qty` units of one product. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: OrderLineId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub qty: i64,
}

/// Per-line result of an allocation attempt.
///
/// `allocated < requested` is the normal shortfall signal, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAllocation {
    pub order_line_id: OrderLineId,
    pub requested: i64,
    pub allocated: i64,
}

impl LineAllocation {
    pub fn shortfall(&self) -> i64 {
        self.requested - self.allocated
    }

    pub fn is_satisfied(&self) -> bool {
        self.allocated >= self.requested
    }
}

/// Result of one `allocate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub order_id: OrderId,
    pub lines: Vec<LineAllocation>,
}

impl AllocationOutcome {
    pub fn total_allocated(&self) -> i64 {
        self.lines.iter().map(|l| l.allocated).sum()
    }

    pub fn any_allocated(&self) -> bool {
        self.lines.iter().any(|l| l.allocated > 0)
    }
}

/// Result of one `release` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub order_id: OrderId,
    pub released_lines: u64,
    pub released_qty: i64,
}
