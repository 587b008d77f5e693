// src/utils/crypto.rs
//! Hashing and randomness primitives shared across the service.
//!
//! Content hashes are SHA-256 (via `ring`), rendered as lowercase hex so they
//! can double as primary keys and as the canonical bytes that get signed.

use ring::digest::{digest, SHA256};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Computes the SHA-256 digest of `data` as lowercase hex.
///
/// # Arguments
/// * `data` - Binary data to hash
///
/// # Returns
/// 64-character lowercase hex string. Identical input always yields the
/// identical string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest(&SHA256, data).as_ref())
}

/// Fills a fixed-size buffer from the operating system CSPRNG.
///
/// # Errors
/// Fails only if the system RNG is unavailable.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], Unspecified> {
    let mut buf = [0u8; N];
    SystemRandom::new().fill(&mut buf)?;
    Ok(buf)
}
