//! Allocation candidates.
//!
//! A candidate is an ephemeral, derived view of one unclaimed stock
//! coordinate that could satisfy a demand line. Candidates are never
//! persisted; the provider rebuilds them from the ledger on every attempt.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockpile_core::{LocationId, LotId, WarehouseId};

/// Upper bound on candidates fetched per line.
///
/// Keeps candidate queries cheap and latency predictable. A product
/// fragmented across more than this many lots can under-allocate even when
/// aggregate stock suffices; accepted approximation.
pub const DEFAULT_CANDIDATE_LIMIT: u32 = 64;

/// One available stock coordinate eligible to satisfy a line's demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub warehouse_id: WarehouseId,
    pub location_id: LocationId,
    pub lot_id: LotId,
    pub available_qty: i64,
    /// Lot expiry, if the lot carries one. Expiring stock sorts first.
    pub expires_on: Option<NaiveDate>,
}

impl Candidate {
    /// Fixed tie-break key: warehouse, lot, location, then expiry ascending
    /// with non-expiring lots last.
    ///
    /// Every worker must walk candidates for a product in this exact order
    /// so that concurrent transactions request row locks in the same global
    /// sequence and cannot deadlock by construction.
    pub fn ordering_key(&self) -> (WarehouseId, LotId, LocationId, bool, Option<NaiveDate>) {
        (
            self.warehouse_id,
            self.lot_id,
            self.location_id,
            self.expires_on.is_none(),
            self.expires_on,
        )
    }
}

/// Sort candidates into the fixed lock-acquisition order.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by_key(Candidate::ordering_key);
}
