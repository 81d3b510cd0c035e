//! Backing store key generation.

use sha2::{Digest, Sha256};

/// Compute the backing store key for an object URL.
pub fn compute_store_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
