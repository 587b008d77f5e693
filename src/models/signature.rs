// src/models/signature.rs
//! Recorded document signatures.

use crate::models::document::DocumentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A verified signature by one identity over one document.
///
/// Unique on `(document_hash, signer_email)`. A record only exists after the
/// signature verified against the signer's registered public key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignatureRecord {
    pub document_hash: DocumentHash,
    pub signer_email: String,
    pub signer_name: String,
    /// Base64 of the 64-byte `r || s` ECDSA signature
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// One line of an identity's signing history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignatureHistoryEntry {
    pub document_hash: DocumentHash,
    pub filename: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Observable state of a (document, identity) pair.
///
/// Verification happens inside a single `record_signature` call and a
/// rejected attempt writes nothing, so a pair is either still `Unsigned` or
/// `Signed`. `Signed` is terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureState {
    Unsigned,
    Signed,
}

/// Result of checking a document's recorded signatures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub document_hash: DocumentHash,
    /// True when at least one signature is recorded and every one of them
    /// verifies against its signer's registered key.
    pub valid: bool,
    /// Emails whose signatures verified.
    pub signed_by: Vec<String>,
    /// Emails whose recorded signatures no longer verify.
    pub failed: Vec<String>,
}
