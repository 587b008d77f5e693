// src/services/identity_registry.rs
//! Identity registry service.
//!
//! Binds signer identities (email + name) to secp256k1 public keys and, for
//! enrolled identities that opt into server custody, keeps the private key as
//! a passphrase-encrypted blob.
//!
//! Each email owns exactly one key, and a key resolves to at most one
//! identity. Both rules are enforced by the store's unique constraints, so two
//! concurrent registrations cannot both succeed.

use crate::models::identity::Identity;
use crate::services::error::ServiceError;
use crate::storage::sqlite_store::SqliteStore;
use crate::wallet::key_management::{canonical_public_key_pem, generate_key_pair, PrivateKeyPem};
use crate::wallet::key_vault::KeyVault;
use chrono::Utc;
use log::info;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Result of enrolling a new identity.
#[derive(Debug, Serialize)]
pub struct Enrollment {
    pub identity: Identity,
    /// Returned once for client-custodied keys and never stored.
    /// `None` when the server keeps an encrypted copy instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKeyPem>,
}

/// Canonical form used for email comparisons.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<String, ServiceError> {
    let email = normalize_email(email);
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(ServiceError::Validation(format!("invalid email address: {:?}", email))),
    }
}

fn validate_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("name is required".into()));
    }
    Ok(name.to_string())
}

/// Service for registering and resolving signer identities.
pub struct IdentityRegistry {
    store: Arc<SqliteStore>,
    vault: KeyVault,
}

impl IdentityRegistry {
    /// Creates a registry over `store`, sealing custodial keys with `vault`.
    pub fn new(store: Arc<SqliteStore>, vault: KeyVault) -> Self {
        Self { store, vault }
    }

    /// Binds `email` to a client-held public key.
    ///
    /// # Arguments
    /// * `email` - Identity email, compared case-insensitively
    /// * `name` - Display name
    /// * `public_key` - SPKI key as PEM or bare base64
    ///
    /// # Errors
    /// - `Validation` for a malformed email or empty name
    /// - `Crypto(KeyFormat)` when the key does not parse
    /// - `DuplicateIdentity` when the email or the key is already bound
    pub fn register_identity(
        &self,
        email: &str,
        name: &str,
        public_key: &str,
    ) -> Result<Identity, ServiceError> {
        let public_key = canonical_public_key_pem(public_key)?;
        self.insert(email, name, public_key, None)
    }

    fn insert(
        &self,
        email: &str,
        name: &str,
        public_key: String,
        encrypted_private_key: Option<String>,
    ) -> Result<Identity, ServiceError> {
        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            email: validate_email(email)?,
            name: validate_name(name)?,
            public_key,
            encrypted_private_key,
            created_at: Utc::now(),
        };

        if !self.store.insert_identity(&identity)? {
            if self.store.identity_by_email(&identity.email)?.is_some() {
                return Err(ServiceError::DuplicateIdentity(identity.email));
            }
            return Err(ServiceError::DuplicateIdentity(
                "public key is bound to another identity".into(),
            ));
        }

        info!(
            "Registered identity {} ({})",
            identity.email,
            if identity.is_custodial() { "server custody" } else { "client custody" }
        );
        Ok(identity)
    }

    /// Generates a key pair and registers its public half.
    ///
    /// Without a passphrase the private key is handed back once and never
    /// persisted. With a passphrase only the encrypted blob is stored and no
    /// private key is returned.
    pub fn enroll_identity(
        &self,
        email: &str,
        name: &str,
        passphrase: Option<&str>,
    ) -> Result<Enrollment, ServiceError> {
        let pair = generate_key_pair()?;

        match passphrase {
            Some(passphrase) => {
                if passphrase.is_empty() {
                    return Err(ServiceError::Validation("passphrase must not be empty".into()));
                }
                let blob = self.vault.encrypt_private_key(&pair.private_key, passphrase)?;
                let identity = self.insert(email, name, pair.public_key, Some(blob))?;
                Ok(Enrollment { identity, private_key: None })
            }
            None => {
                let identity = self.insert(email, name, pair.public_key, None)?;
                Ok(Enrollment { identity, private_key: Some(pair.private_key) })
            }
        }
    }

    /// Finds the identity bound to a public key.
    ///
    /// Armour lines, whitespace and escaped newlines are ignored, so the same
    /// key resolves however it was transported.
    pub fn resolve_identity_by_public_key(&self, public_key: &str) -> Result<Identity, ServiceError> {
        self.store
            .identity_by_public_key(public_key)?
            .ok_or_else(|| ServiceError::IdentityNotFound("no identity for public key".into()))
    }

    pub fn get_by_email(&self, email: &str) -> Result<Identity, ServiceError> {
        let email = normalize_email(email);
        self.store
            .identity_by_email(&email)?
            .ok_or(ServiceError::IdentityNotFound(email))
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, ServiceError> {
        Ok(self.store.list_identities()?)
    }
}
