// src/services/mod.rs
pub mod api_server;
pub mod error;
pub mod fingerprint;
pub mod identity_registry;
pub mod notification;
pub mod renderer;
pub mod signature_engine;
pub mod verifier;
pub mod workflow_engine;
