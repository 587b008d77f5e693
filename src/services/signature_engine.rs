// src/services/signature_engine.rs
//! Signature engine.
//!
//! Produces and checks ECDSA signatures over document content hashes and
//! records verified signatures. A record is written only after the signature
//! verified against the signer's registered public key, and at most one record
//! exists per (document, signer). That uniqueness is a single conditional
//! insert, so two concurrent attempts cannot both succeed.

use crate::models::document::DocumentHash;
use crate::models::identity::Identity;
use crate::models::signature::{SignatureHistoryEntry, SignatureRecord, SignatureState};
use crate::services::error::ServiceError;
use crate::services::identity_registry::normalize_email;
use crate::storage::sqlite_store::SqliteStore;
use crate::wallet::key_management::{self, CryptoError, KeyManager};
use crate::wallet::key_vault::KeyVault;
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;

/// Signs, verifies and records document signatures.
pub struct SignatureEngine {
    store: Arc<SqliteStore>,
    vault: KeyVault,
}

impl SignatureEngine {
    /// Creates an engine over `store`; `vault` opens server-held keys.
    pub fn new(store: Arc<SqliteStore>, vault: KeyVault) -> Self {
        Self { store, vault }
    }

    /// Signs a content hash with a client-supplied private key.
    ///
    /// # Arguments
    /// * `document_hash` - Hash whose hex string is signed
    /// * `private_key` - PKCS#8 key as PEM or bare base64
    ///
    /// # Returns
    /// Base64 signature value.
    pub fn sign(&self, document_hash: &DocumentHash, private_key: &str) -> Result<String, ServiceError> {
        let manager = KeyManager::from_private_key_pem(private_key)?;
        Ok(manager.sign_hash(document_hash)?)
    }

    /// Checks a signature. `Ok(false)` for anything that does not verify.
    pub fn verify(
        &self,
        document_hash: &DocumentHash,
        signature: &str,
        public_key: &str,
    ) -> Result<bool, ServiceError> {
        Ok(key_management::verify_signature(document_hash, signature, public_key)?)
    }

    /// Whether `private_key` belongs to `public_key`.
    pub fn self_test_key_pair_match(&self, private_key: &str, public_key: &str) -> Result<bool, ServiceError> {
        Ok(key_management::self_test_key_pair(private_key, public_key)?)
    }

    fn identity(&self, email: &str) -> Result<Identity, ServiceError> {
        let email = normalize_email(email);
        self.store
            .identity_by_email(&email)?
            .ok_or(ServiceError::IdentityNotFound(email))
    }

    /// Verifies and stores a signature by a registered identity.
    ///
    /// # Errors
    /// - `IdentityNotFound` / `DocumentNotFound` for unknown references
    /// - `Crypto(VerificationFailed)` when the signature does not verify
    ///   against the identity's registered key
    /// - `DuplicateSignature` when this identity already signed the document
    pub fn record_signature(
        &self,
        document_hash: &DocumentHash,
        signer_email: &str,
        signature: &str,
    ) -> Result<SignatureRecord, ServiceError> {
        let identity = self.identity(signer_email)?;
        if self.store.document(document_hash)?.is_none() {
            return Err(ServiceError::DocumentNotFound(document_hash.to_string()));
        }

        if !self.verify(document_hash, signature, &identity.public_key)? {
            warn!(
                "Rejected signature by {} on {}: does not verify",
                identity.email, document_hash
            );
            return Err(CryptoError::VerificationFailed.into());
        }

        let record = SignatureRecord {
            document_hash: document_hash.clone(),
            signer_email: identity.email.clone(),
            signer_name: identity.name.clone(),
            signature: signature.trim().to_string(),
            created_at: Utc::now(),
        };
        if !self.store.insert_signature(&record)? {
            return Err(ServiceError::DuplicateSignature {
                document_hash: document_hash.to_string(),
                signer: identity.email,
            });
        }

        info!("Recorded signature by {} on {}", record.signer_email, document_hash);
        Ok(record)
    }

    /// Signs with the identity's server-held key and records the result.
    ///
    /// The key is decrypted into a zeroizing buffer, checked against the
    /// registered public key, used once and dropped before returning.
    ///
    /// # Errors
    /// - `Validation` if the identity has no server-held key
    /// - `Crypto(WrongPassphrase)` if the passphrase does not open the blob
    /// - `Crypto(KeyPairMismatch)` if the stored key no longer matches
    /// - everything [`record_signature`](Self::record_signature) can return
    pub fn sign_with_stored_key(
        &self,
        email: &str,
        passphrase: &str,
        document_hash: &DocumentHash,
    ) -> Result<SignatureRecord, ServiceError> {
        let identity = self.identity(email)?;
        let blob = identity.encrypted_private_key.as_deref().ok_or_else(|| {
            ServiceError::Validation(format!("{} has no server-held key", identity.email))
        })?;

        let signature = {
            let private_key = self.vault.decrypt_private_key(blob, passphrase)?;
            if !self.self_test_key_pair_match(private_key.as_str(), &identity.public_key)? {
                return Err(CryptoError::KeyPairMismatch.into());
            }
            self.sign(document_hash, private_key.as_str())?
        };

        self.record_signature(document_hash, &identity.email, &signature)
    }

    /// Recorded signatures on a document, oldest first.
    pub fn list_signers(&self, document_hash: &DocumentHash) -> Result<Vec<SignatureRecord>, ServiceError> {
        Ok(self.store.signatures_for_document(document_hash)?)
    }

    /// Documents signed by an identity, newest first.
    pub fn signature_history(&self, email: &str) -> Result<Vec<SignatureHistoryEntry>, ServiceError> {
        let identity = self.identity(email)?;
        Ok(self.store.signature_history(&identity.email)?)
    }

    /// Observable state of a (document, identity) pair.
    pub fn signature_state(
        &self,
        document_hash: &DocumentHash,
        email: &str,
    ) -> Result<SignatureState, ServiceError> {
        let email = normalize_email(email);
        Ok(match self.store.signature(document_hash, &email)? {
            Some(_) => SignatureState::Signed,
            None => SignatureState::Unsigned,
        })
    }
}
