// src/services/verifier.rs
//! Document verification service.
//!
//! Re-checks every recorded signature on a document against the signer's
//! registered public key. Verification by file bytes hashes the upload first,
//! so a modified copy of a signed PDF resolves to an unknown hash.

use crate::models::document::DocumentHash;
use crate::models::signature::VerificationReport;
use crate::services::error::ServiceError;
use crate::services::fingerprint::compute_hash;
use crate::storage::sqlite_store::SqliteStore;
use crate::wallet::key_management::verify_signature;
use log::{info, warn};
use std::sync::Arc;

/// Checks recorded signatures against the identity registry.
pub struct Verifier {
    store: Arc<SqliteStore>,
}

impl Verifier {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Verifies all signatures recorded for `document_hash`.
    ///
    /// # Returns
    /// A report listing which signers verified and which did not. A document
    /// with no signatures is reported as not valid.
    ///
    /// # Errors
    /// `DocumentNotFound` if the hash was never uploaded.
    pub fn verify_document(&self, document_hash: &DocumentHash) -> Result<VerificationReport, ServiceError> {
        if self.store.document(document_hash)?.is_none() {
            return Err(ServiceError::DocumentNotFound(document_hash.to_string()));
        }

        let mut signed_by = Vec::new();
        let mut failed = Vec::new();
        for record in self.store.signatures_for_document(document_hash)? {
            let verified = match self.store.identity_by_email(&record.signer_email)? {
                Some(identity) => {
                    match verify_signature(document_hash, &record.signature, &identity.public_key) {
                        Ok(verified) => verified,
                        Err(e) => {
                            warn!("Registered key for {} is unusable: {}", record.signer_email, e);
                            false
                        }
                    }
                }
                None => false,
            };

            if verified {
                signed_by.push(record.signer_email);
            } else {
                warn!("Signature by {} on {} does not verify", record.signer_email, document_hash);
                failed.push(record.signer_email);
            }
        }

        let valid = !signed_by.is_empty() && failed.is_empty();
        info!(
            "Verified {}: {} valid, {} failed",
            document_hash,
            signed_by.len(),
            failed.len()
        );
        Ok(VerificationReport {
            document_hash: document_hash.clone(),
            valid,
            signed_by,
            failed,
        })
    }

    /// Hashes `bytes` and verifies the matching document.
    pub fn verify_document_bytes(&self, bytes: &[u8]) -> Result<VerificationReport, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::Validation("no file uploaded".into()));
        }
        self.verify_document(&compute_hash(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::Document;
    use crate::models::signature::SignatureRecord;
    use crate::services::identity_registry::IdentityRegistry;
    use crate::services::signature_engine::SignatureEngine;
    use crate::wallet::key_management::generate_key_pair;
    use crate::wallet::key_vault::KeyVault;
    use chrono::Utc;

    const PDF: &[u8] = b"%PDF-1.7 employment contract";

    fn setup() -> (Arc<SqliteStore>, Verifier, SignatureEngine, IdentityRegistry) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert_document(&Document {
                content_hash: compute_hash(PDF),
                storage_path: "uploads/e.pdf".into(),
                original_filename: "employment.pdf".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        let vault = KeyVault::new(1_000).unwrap();
        (
            Arc::clone(&store),
            Verifier::new(Arc::clone(&store)),
            SignatureEngine::new(Arc::clone(&store), vault.clone()),
            IdentityRegistry::new(store, vault),
        )
    }

    #[test]
    fn test_unsigned_document_is_not_valid() {
        let (_, verifier, _, _) = setup();
        let report = verifier.verify_document_bytes(PDF).unwrap();
        assert!(!report.valid);
        assert!(report.signed_by.is_empty());
    }

    #[test]
    fn test_signed_document_verifies() {
        let (_, verifier, engine, registry) = setup();
        let pair = generate_key_pair().unwrap();
        registry.register_identity("ada@example.com", "Ada", &pair.public_key).unwrap();
        let hash = compute_hash(PDF);
        let signature = engine.sign(&hash, pair.private_key.as_str()).unwrap();
        engine.record_signature(&hash, "ada@example.com", &signature).unwrap();

        let report = verifier.verify_document(&hash).unwrap();
        assert!(report.valid);
        assert_eq!(report.signed_by, vec!["ada@example.com".to_string()]);
    }

    #[test]
    fn test_modified_file_is_unknown() {
        let (_, verifier, _, _) = setup();
        let mut tampered = PDF.to_vec();
        tampered[10] ^= 0x01;
        assert!(matches!(
            verifier.verify_document_bytes(&tampered),
            Err(ServiceError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_corrupted_record_is_reported() {
        let (store, verifier, engine, registry) = setup();
        let pair = generate_key_pair().unwrap();
        registry.register_identity("ada@example.com", "Ada", &pair.public_key).unwrap();
        let hash = compute_hash(PDF);
        let other = compute_hash(b"a different document");
        let signature = engine.sign(&other, pair.private_key.as_str()).unwrap();

        store
            .insert_signature(&SignatureRecord {
                document_hash: hash.clone(),
                signer_email: "ada@example.com".into(),
                signer_name: "Ada".into(),
                signature,
                created_at: Utc::now(),
            })
            .unwrap();

        let report = verifier.verify_document(&hash).unwrap();
        assert!(!report.valid);
        assert_eq!(report.failed, vec!["ada@example.com".to_string()]);
    }
}
