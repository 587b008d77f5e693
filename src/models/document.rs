// src/models/document.rs
//! Content-addressed document records.
//!
//! A document is identified by the SHA-256 of its raw bytes. Uploading the
//! same bytes twice resolves to the same [`DocumentHash`] and therefore to the
//! same row.

use crate::utils::crypto::{sha256_hex, SHA256_HEX_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowercase hex SHA-256 of a document's bytes.
///
/// Construction always goes through [`DocumentHash::of`] or
/// [`DocumentHash::parse`], so a value of this type is always 64 lowercase hex
/// characters. Its string form is also the exact byte sequence that gets signed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentHash(String);

/// Rejection reason for a malformed content hash.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("content hash must be 64 hex characters, got {0:?}")]
pub struct InvalidDocumentHash(pub String);

impl DocumentHash {
    /// Hashes raw document bytes.
    pub fn of(bytes: &[u8]) -> Self {
        DocumentHash(sha256_hex(bytes))
    }

    /// Parses a hex content hash supplied by a client.
    ///
    /// Surrounding whitespace is ignored and upper-case hex is folded to lower
    /// case; anything else that is not exactly 64 hex digits is rejected.
    pub fn parse(value: &str) -> Result<Self, InvalidDocumentHash> {
        let trimmed = value.trim();
        if trimmed.len() != SHA256_HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidDocumentHash(value.to_string()));
        }
        Ok(DocumentHash(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The canonical byte representation covered by a signature: the ASCII
    /// bytes of the lowercase hex string.
    pub fn signing_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentHash {
    type Error = InvalidDocumentHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DocumentHash::parse(&value)
    }
}

impl From<DocumentHash> for String {
    fn from(hash: DocumentHash) -> Self {
        hash.0
    }
}

/// A stored upload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document {
    /// Primary key
    pub content_hash: DocumentHash,
    /// Where the bytes live on disk
    pub storage_path: String,
    /// Filename supplied at upload time
    pub original_filename: String,
    pub created_at: DateTime<Utc>,
}
