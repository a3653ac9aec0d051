//! State Hashing for Change Detection
//!
//! Provides deterministic hashing of replica state for:
//! - Deciding whether a sync send is needed
//! - Comparing replicas in logs and tests

use std::collections::BTreeMap;
use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher for replica state.
///
/// Wraps SHA-256 with length-prefixed helpers so that adjacent
/// strings cannot collide ("ab"+"c" vs "a"+"bc").
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for the sync view of a ledger.
    pub fn for_sync_view() -> Self {
        Self::new(b"CLICKER_SYNC_VIEW_V1")
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a length-prefixed string.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash a canonical key/value map.
///
/// BTreeMap iteration is sorted, so equal maps always hash equal.
pub fn hash_string_map(map: &BTreeMap<String, String>) -> StateHash {
    let mut hasher = StateHasher::for_sync_view();
    hasher.update_u64(map.len() as u64);
    for (key, value) in map {
        hasher.update_str(key);
        hasher.update_str(value);
    }
    hasher.finalize()
}

/// Short hex prefix for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..4])
}

// =============================================================================
// TESTS
// =============================================================================
