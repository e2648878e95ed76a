//! `stockpile-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{
    EventId, HoldId, LocationId, LotId, OpId, OrderId, OrderLineId, ProductId, TenantId,
    WarehouseId,
};
