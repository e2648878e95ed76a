//! Per-order advisory lock keys.

use sha2::{Digest, Sha256};

use stockpile_core::{OrderId, TenantId};

/// Derive the advisory-lock key serializing work on one order.
///
/// The key is the first 8 bytes of `SHA-256(tenant_uuid_bytes ||
/// order_uuid_bytes)`, read big-endian and reinterpreted as a
/// two's-complement `i64` (values at or above `2^63` wrap negative). The
/// rule is part of the storage contract: any process computing keys this
/// way contends on the same lock for the same order, and on nothing else.
pub fn order_lock_key(tenant_id: TenantId, order_id: OrderId) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_uuid().as_bytes());
    hasher.update(order_id.as_uuid().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}
