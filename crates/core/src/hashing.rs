//! SHA-256 digests shared by the LoRA cache and upload logging.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// First `len` hex characters of the SHA-256 digest of `data`.
///
/// `len` is capped at the full 64-character digest.
pub fn short_digest(data: &[u8], len: usize) -> String {
    let mut hex = sha256_hex(data);
    hex.truncate(len.min(64));
    hex
}
