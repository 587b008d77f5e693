// src/wallet/key_vault.rs
//! Passphrase encryption for private keys stored at rest.
//!
//! Keys are sealed with AES-256-GCM under a key derived from the owner's
//! passphrase with PBKDF2-HMAC-SHA256 (both via `ring`). Every blob gets a
//! fresh random salt and nonce.
//!
//! # Blob format
//! Four hex segments joined by colons:
//!
//! ```text
//! salt(16 bytes):iv(12 bytes):authTag(16 bytes):ciphertext
//! ```
//!
//! This framing is shared with previously stored blobs and must not change.
//! The iteration count is not part of the blob, so every vault reading a set
//! of blobs must be configured with the count they were written with.

use crate::utils::crypto::random_bytes;
use crate::wallet::key_management::{CryptoError, PrivateKeyPem};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use std::num::NonZeroU32;
use zeroize::Zeroizing;

/// Iteration count used when nothing else is configured.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Seals and opens private keys with a passphrase.
#[derive(Debug, Clone)]
pub struct KeyVault {
    iterations: NonZeroU32,
}

impl Default for KeyVault {
    fn default() -> Self {
        KeyVault {
            iterations: NonZeroU32::new(DEFAULT_KDF_ITERATIONS).unwrap_or(NonZeroU32::MIN),
        }
    }
}

impl KeyVault {
    /// Creates a vault using `iterations` PBKDF2 rounds.
    ///
    /// # Errors
    /// `CryptoError::Operation` if `iterations` is zero.
    pub fn new(iterations: u32) -> Result<Self, CryptoError> {
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| CryptoError::Operation("kdf iterations must be positive".into()))?;
        Ok(KeyVault { iterations })
    }

    fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<LessSafeKey, CryptoError> {
        let mut key_bytes = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            salt,
            passphrase.as_bytes(),
            &mut key_bytes[..],
        );
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..])
            .map_err(|_| CryptoError::Operation("could not build AES-256-GCM key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypts a private key under `passphrase`.
    ///
    /// # Returns
    /// The packed `salt:iv:authTag:ciphertext` blob.
    pub fn encrypt_private_key(
        &self,
        private_key: &PrivateKeyPem,
        passphrase: &str,
    ) -> Result<String, CryptoError> {
        let rng_failure = |_| CryptoError::Operation("system RNG unavailable".into());
        let salt = random_bytes::<SALT_LEN>().map_err(rng_failure)?;
        let iv = random_bytes::<NONCE_LEN>().map_err(rng_failure)?;

        let key = self.derive_key(passphrase, &salt)?;
        let mut in_out = private_key.as_str().as_bytes().to_vec();
        let tag = key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Operation("encryption failed".into()))?;

        Ok(format!(
            "{}:{}:{}:{}",
            hex::encode(salt),
            hex::encode(iv),
            hex::encode(tag.as_ref()),
            hex::encode(&in_out)
        ))
    }

    /// Opens a packed blob with `passphrase`.
    ///
    /// Fails closed: a wrong passphrase or any modification of the blob makes
    /// the GCM tag check fail, which is reported as `WrongPassphrase`. Corrupt
    /// framing is reported as `MalformedBlob`.
    pub fn decrypt_private_key(
        &self,
        blob: &str,
        passphrase: &str,
    ) -> Result<PrivateKeyPem, CryptoError> {
        let parts: Vec<&str> = blob.trim().split(':').collect();
        let [salt_hex, iv_hex, tag_hex, ciphertext_hex] = parts.as_slice() else {
            return Err(CryptoError::MalformedBlob(format!(
                "expected 4 segments, found {}",
                parts.len()
            )));
        };

        let segment = |name: &str, value: &str| {
            hex::decode(value)
                .map_err(|e| CryptoError::MalformedBlob(format!("{} is not hex: {}", name, e)))
        };
        let salt = segment("salt", *salt_hex)?;
        let iv = segment("iv", *iv_hex)?;
        let tag = segment("authTag", *tag_hex)?;
        let ciphertext = segment("ciphertext", *ciphertext_hex)?;

        if tag.len() != TAG_LEN {
            return Err(CryptoError::MalformedBlob(format!("authTag is {} bytes", tag.len())));
        }
        let nonce = Nonce::try_assume_unique_for_key(&iv)
            .map_err(|_| CryptoError::MalformedBlob(format!("iv is {} bytes", iv.len())))?;

        let key = self.derive_key(passphrase, &salt)?;
        let mut in_out = Zeroizing::new(ciphertext);
        in_out.extend_from_slice(&tag);
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), in_out.as_mut_slice())
            .map_err(|_| CryptoError::WrongPassphrase)?;

        let text = std::str::from_utf8(plaintext)
            .map_err(|_| CryptoError::MalformedBlob("plaintext is not utf-8".into()))?;
        Ok(PrivateKeyPem::from(text.to_string()))
    }
}
