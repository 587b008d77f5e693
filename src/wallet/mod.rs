// src/wallet/mod.rs
//! Key material: generation, signing, and passphrase custody.

pub mod key_management;
pub mod key_vault;
