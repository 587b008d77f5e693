// src/models/identity.rs
//! Signer identities and their public-key bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered signer.
///
/// The public key is the durable verification anchor for every signature the
/// identity produces. Private key material is either held by the client and
/// never seen again, or persisted only as a passphrase-encrypted blob.
///
/// # Invariants
/// - exactly one identity per email
/// - a public key resolves to at most one identity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub name: String,
    /// SPKI public key, PEM armoured
    pub public_key: String,
    /// Packed `salt:iv:authTag:ciphertext` blob, present only for
    /// server-custodied keys. Never serialized into API responses.
    #[serde(skip_serializing, default)]
    pub encrypted_private_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Whether the server holds an encrypted copy of this identity's key.
    pub fn is_custodial(&self) -> bool {
        self.encrypted_private_key.is_some()
    }
}
