//! Checksum computation
//!
//! Raw downloads are addressed by the SHA-256 of their bytes. Request
//! fingerprints use MD5, which is only an identity key and never an
//! integrity check.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 content checksum of bytes
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the MD5 digest of bytes as lowercase hex
pub fn compute_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
