// src/wallet/key_management.rs
//! Signing key management.
//!
//! Provides generation, parsing, signing and verification for signer keys:
//! - secp256k1 curve (via `k256` crate)
//! - ECDSA with SHA-256 message digest, RFC 6979 deterministic nonces
//! - PKCS#8 (private) / SPKI (public) PEM encodings
//!
//! # Signed bytes
//! A document signature covers the ASCII bytes of the document's lowercase
//! hex SHA-256 content hash (see [`DocumentHash::signing_bytes`]). ECDSA
//! digests those 64 bytes with SHA-256 internally; nothing else is prepended
//! or hashed. The signature is the 64-byte `r || s` pair, standard base64.

use crate::models::document::DocumentHash;
use crate::utils::serialization::{decode_base64, encode_base64, key_body_to_der};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Message signed by [`self_test_key_pair`].
const SELF_TEST_MESSAGE: &[u8] = b"countersign:key-pair-self-test";

/// Errors raised by key handling and signature checks.
///
/// These are user-correctable outcomes (wrong key, wrong passphrase, altered
/// document) and are kept apart from storage or server failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key format error: {0}")]
    KeyFormat(String),

    #[error("private key does not match the registered public key")]
    KeyPairMismatch,

    #[error("document has been tampered with or signature invalid")]
    VerificationFailed,

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("encrypted key blob is malformed: {0}")]
    MalformedBlob(String),

    #[error("cryptographic operation failed: {0}")]
    Operation(String),
}

/// PEM private key text that is wiped from memory on drop.
#[derive(Clone)]
pub struct PrivateKeyPem(Zeroizing<String>);

impl PrivateKeyPem {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for PrivateKeyPem {
    fn from(value: String) -> Self {
        PrivateKeyPem(Zeroizing::new(value))
    }
}

impl fmt::Debug for PrivateKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyPem(<redacted>)")
    }
}

impl Serialize for PrivateKeyPem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A freshly generated key pair, both halves PEM encoded.
#[derive(Debug, Clone, Serialize)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: PrivateKeyPem,
}

/// Generates a new secp256k1 key pair from the OS CSPRNG.
///
/// # Errors
/// Returns `CryptoError::Operation` if PEM encoding fails.
pub fn generate_key_pair() -> Result<KeyPair, CryptoError> {
    let manager = KeyManager::generate();
    Ok(KeyPair {
        public_key: manager.public_key_pem()?,
        private_key: manager.private_key_pem()?,
    })
}

/// Parses an SPKI public key given as PEM or bare base64.
///
/// # Errors
/// `CryptoError::KeyFormat` when the text is not a secp256k1 public key.
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey, CryptoError> {
    let der = key_body_to_der(public_key)
        .map_err(|e| CryptoError::KeyFormat(format!("public key is not base64: {}", e)))?;
    let public_key = PublicKey::from_public_key_der(&der)
        .map_err(|e| CryptoError::KeyFormat(format!("unreadable public key: {}", e)))?;
    Ok(VerifyingKey::from(&public_key))
}

/// Re-encodes a public key given in any accepted spelling as canonical PEM.
///
/// # Errors
/// `CryptoError::KeyFormat` when the text is not a secp256k1 public key.
pub fn canonical_public_key_pem(public_key: &str) -> Result<String, CryptoError> {
    let verifying_key = parse_public_key(public_key)?;
    PublicKey::from(&verifying_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Operation(e.to_string()))
}

/// Verifies a base64 signature over a content hash.
///
/// Only a malformed public key is an error. A signature that does not check
/// out for any reason (wrong key, altered hash, bad base64, wrong length)
/// yields `Ok(false)`.
pub fn verify_signature(
    document_hash: &DocumentHash,
    signature: &str,
    public_key: &str,
) -> Result<bool, CryptoError> {
    let verifying_key = parse_public_key(public_key)?;

    let Ok(bytes) = decode_base64(signature) else {
        return Ok(false);
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return Ok(false);
    };

    Ok(verifying_key
        .verify(document_hash.signing_bytes(), &signature)
        .is_ok())
}

/// Checks that a private key belongs to a public key.
///
/// Signs a fixed message and verifies it, so a mismatched pair is caught
/// before it produces a signature record that can never verify.
///
/// # Errors
/// `CryptoError::KeyFormat` if either key cannot be parsed.
pub fn self_test_key_pair(private_key: &str, public_key: &str) -> Result<bool, CryptoError> {
    let manager = KeyManager::from_private_key_pem(private_key)?;
    let verifying_key = parse_public_key(public_key)?;
    let signature = manager.sign_message(SELF_TEST_MESSAGE)?;
    Ok(verifying_key.verify(SELF_TEST_MESSAGE, &signature).is_ok())
}

/// Holds one signer's secret key for the duration of a signing operation.
///
/// The secret scalar is zeroized when the manager is dropped; keep its
/// lifetime as short as the operation that needs it.
pub struct KeyManager {
    /// Secret key (never exposed)
    secret_key: SecretKey,
    /// Derived public key for verification
    pub public_key: PublicKey,
}

impl KeyManager {
    /// Generates a fresh secp256k1 key.
    pub fn generate() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        let public_key = secret_key.public_key();
        KeyManager { secret_key, public_key }
    }

    /// Loads a PKCS#8 private key given as PEM or bare base64.
    ///
    /// # Errors
    /// `CryptoError::KeyFormat` when the text is not a secp256k1 private key.
    pub fn from_private_key_pem(private_key: &str) -> Result<Self, CryptoError> {
        let der = Zeroizing::new(
            key_body_to_der(private_key)
                .map_err(|e| CryptoError::KeyFormat(format!("private key is not base64: {}", e)))?,
        );
        let secret_key = SecretKey::from_pkcs8_der(&der)
            .map_err(|e| CryptoError::KeyFormat(format!("unreadable private key: {}", e)))?;
        let public_key = secret_key.public_key();
        Ok(KeyManager { secret_key, public_key })
    }

    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Operation(e.to_string()))
    }

    pub fn private_key_pem(&self) -> Result<PrivateKeyPem, CryptoError> {
        let pem = self
            .secret_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Operation(e.to_string()))?;
        Ok(PrivateKeyPem(pem))
    }

    /// Signs arbitrary bytes (SHA-256 digest, deterministic ECDSA).
    fn sign_message(&self, message: &[u8]) -> Result<Signature, CryptoError> {
        let signing_key = SigningKey::from(&self.secret_key);
        signing_key
            .try_sign(message)
            .map_err(|e| CryptoError::Operation(e.to_string()))
    }

    /// Signs a document's content hash.
    ///
    /// # Returns
    /// Base64 of the 64-byte `r || s` signature.
    pub fn sign_hash(&self, document_hash: &DocumentHash) -> Result<String, CryptoError> {
        let signature = self.sign_message(document_hash.signing_bytes())?;
        Ok(encode_base64(&signature.to_bytes()))
    }
}
