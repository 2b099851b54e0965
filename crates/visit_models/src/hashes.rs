//! Digest and distance primitives shared by the store and the match layers.
//!
//! All hashes in this system are fixed-width lowercase hex strings. Fuzzy
//! comparison is character-wise Hamming distance over those strings, not a
//! bitwise distance over the decoded bytes: each hex character corresponds to
//! one signal bin, so a one-bin drift costs exactly one position.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("hash length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Character-wise Hamming distance between two equal-length strings.
///
/// Refuses unequal lengths rather than padding; a truncated candidate row is
/// a corruption signal the caller must decide how to handle.
pub fn hamming(a: &str, b: &str) -> Result<usize, HashError> {
    if a.len() != b.len() {
        return Err(HashError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(a.chars().zip(b.chars()).filter(|(x, y)| x != y).count())
}

/// Similarity in [0, 1]: `1 - hamming / max(len)`. Equal strings score 1.0.
pub fn similarity(a: &str, b: &str) -> Result<f64, HashError> {
    let d = hamming(a, b)?;
    let width = a.len().max(b.len()).max(1);
    Ok(1.0 - d as f64 / width as f64)
}

/// SHA-256 over raw bytes, returned as 64 lowercase hex chars.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// HMAC-SHA256, returned as 64 lowercase hex chars.
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    // Hmac::new_from_slice accepts any key length for SHA-256.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}
