// src/main.rs

//! # Countersign - Main Entry Point
//!
//! Multi-party PDF signing service. Initializes every component from
//! [`settings::Settings`] and starts the API server.
//!
//! ## Architecture Overview
//! 1. **Storage Layer**: `SqliteStore` for identities, documents, signatures and workflows
//! 2. **Wallet Layer**: secp256k1 signing keys and passphrase-sealed key storage
//! 3. **Services Layer**: identity registry, document intake, signing, verification,
//!    workflow routing, notifications and the HTTP API
//!
//! ## Configuration
//! Defaults, then `countersign.toml`, then `COUNTERSIGN_*` variables
//! (a `.env` file is loaded first). See [`settings::Settings`].

use crate::services::api_server::ApiServer;
use crate::services::fingerprint::DocumentFingerprint;
use crate::services::identity_registry::IdentityRegistry;
use crate::services::notification::{spawn_worker, LogDispatcher, NotificationDispatcher, Notifier, WebhookDispatcher};
use crate::services::renderer::PassthroughRenderer;
use crate::services::signature_engine::SignatureEngine;
use crate::services::verifier::Verifier;
use crate::services::workflow_engine::WorkflowEngine;
use crate::settings::Settings;
use crate::storage::sqlite_store::SqliteStore;
use crate::wallet::key_vault::KeyVault;
use anyhow::Context;
use dotenv::dotenv;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;

// Module declarations (organized by functional domain)
mod models;        // Data structures
mod services;      // Business logic and API
mod settings;      // Runtime configuration
mod storage;       // SQLite persistence
mod utils;         // Helper functions
mod wallet;        // Signing keys and key encryption

/// Main application entry point
///
/// # Initialization Sequence
/// 1. Load `.env`, install the logger, read settings
/// 2. Open the database
/// 3. Start the notification worker
/// 4. Initialize service components
/// 5. Start API server
/// 6. On shutdown, drain queued invitations before exiting
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load().context("failed to load settings")?;
    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr {:?}", settings.bind_addr))?;

    let store = Arc::new(
        SqliteStore::open(&settings.database_path)
            .with_context(|| format!("failed to open database {}", settings.database_path))?,
    );
    let vault = KeyVault::new(settings.kdf_iterations).context("invalid kdf_iterations")?;

    // Invitations go through a queue so signing never waits on delivery
    let dispatcher: Arc<dyn NotificationDispatcher> = match &settings.notification_webhook_url {
        Some(url) => {
            info!("Delivering invitations to webhook {}", url);
            Arc::new(WebhookDispatcher::new(url.as_str()).context("failed to build webhook client")?)
        }
        None => {
            info!("No notification webhook configured; invitations will be logged");
            Arc::new(LogDispatcher)
        }
    };
    let (notifier, invitations) = Notifier::channel(&settings.sign_link_base);
    let worker = spawn_worker(invitations, dispatcher);

    let api_server = ApiServer::new(
        IdentityRegistry::new(Arc::clone(&store), vault.clone()),
        DocumentFingerprint::new(Arc::clone(&store), &settings.upload_dir, settings.max_upload_bytes),
        SignatureEngine::new(Arc::clone(&store), vault),
        Verifier::new(Arc::clone(&store)),
        WorkflowEngine::new(
            store,
            notifier,
            Arc::new(PassthroughRenderer),
            settings.conflict_retries,
        ),
    );

    api_server
        .run(addr, shutdown_signal())
        .await
        .context("API server failed")?;

    // The worker exits once the last Notifier is gone
    drop(api_server);
    info!("Draining notification queue");
    if let Err(e) = worker.await {
        error!("Notification worker failed: {}", e);
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
