//! Order allocation engine.
//!
//! Orchestrates one order's journey through candidate selection, hold
//! creation, idempotent ledger writes, and status transitions, plus the
//! compensating release workflow. Storage is reached only through the
//! session traits in `stockpile-infra`, so every attempt is one
//! transaction and retries always start clean.

pub mod engine;
pub mod retry;

pub use engine::{AllocationEngine, AllocationError, AllocationHint, EngineConfig};
pub use retry::{AttemptOutcome, RetryPolicy};
