// src/settings.rs
//! Runtime configuration.
//!
//! Values are layered: built-in defaults, then an optional `countersign.toml`
//! (or the file named by `COUNTERSIGN_CONFIG`), then `COUNTERSIGN_*`
//! environment variables. The resulting [`Settings`] is built once in `main`
//! and handed to each component.

use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// SQLite database file
    pub database_path: String,
    /// Directory for content-addressed uploads
    pub upload_dir: String,
    /// Public base URL used in signing links
    pub sign_link_base: String,
    /// Webhook receiving signing invitations; invitations are only logged
    /// when unset
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
    /// PBKDF2 rounds for server-held keys
    pub kdf_iterations: u32,
    pub max_upload_bytes: usize,
    /// Extra attempts after losing a workflow version check
    pub conflict_retries: u32,
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("bind_addr", "127.0.0.1:3000")?
        .set_default("database_path", "countersign.db")?
        .set_default("upload_dir", "uploads")?
        .set_default("sign_link_base", "http://localhost:3000")?
        .set_default("kdf_iterations", 100_000i64)?
        .set_default("max_upload_bytes", 10 * 1024 * 1024i64)?
        .set_default("conflict_retries", 3i64)
}

impl Settings {
    /// Loads settings from the default file name and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("COUNTERSIGN_CONFIG") {
            Ok(path) => Self::load_from(Some(Path::new(&path))),
            Err(_) => Self::load_from(None),
        }
    }

    /// Loads settings, reading `file` (required) instead of the optional
    /// `countersign.toml` when given.
    pub fn load_from(file: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = match file {
            Some(path) => defaults()?.add_source(File::from(path).required(true)),
            None => defaults()?.add_source(File::with_name("countersign").required(false)),
        };
        builder
            .add_source(Environment::with_prefix("COUNTERSIGN").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
