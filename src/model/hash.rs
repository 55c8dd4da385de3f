//! Content hashing for layout versioning.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of a serializable value, as 64 lowercase hex characters.
///
/// The value is serialized to JSON first. Struct fields serialize in
/// declaration order, so equal layouts always hash equally.
///
/// # Errors
/// Returns an error if the value cannot be serialized to JSON.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
