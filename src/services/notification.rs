// src/services/notification.rs
//! Signing invitations.
//!
//! The workflow engine never talks to a transport directly. It pushes
//! [`SigningInvitation`]s onto an in-process queue through a [`Notifier`]; a
//! background worker drains the queue and hands each invitation to a
//! [`NotificationDispatcher`]. Enqueueing cannot fail the caller, and a
//! dispatch failure is logged and dropped.

use crate::models::workflow::{Signer, Workflow};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A request for one signer to act on one workflow step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SigningInvitation {
    pub workflow_id: String,
    pub workflow_title: String,
    pub signer_id: String,
    pub signer_name: String,
    pub signer_email: String,
    pub seq: u32,
    /// Per-signer signing page link
    pub link: String,
}

/// Why a dispatcher could not deliver an invitation.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint answered with status {0}")]
    Status(u16),
}

/// Delivers invitations.
#[async_trait::async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, invitation: &SigningInvitation) -> Result<(), NotificationError>;
}

/// Writes invitations to the log. Used when no transport is configured.
pub struct LogDispatcher;

#[async_trait::async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(&self, invitation: &SigningInvitation) -> Result<(), NotificationError> {
        info!(
            "Invitation for {} <{}> to sign \"{}\" (step {}): {}",
            invitation.signer_name,
            invitation.signer_email,
            invitation.workflow_title,
            invitation.seq,
            invitation.link
        );
        Ok(())
    }
}

/// POSTs each invitation as JSON to a fixed URL.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait::async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn notify(&self, invitation: &SigningInvitation) -> Result<(), NotificationError> {
        let response = self.client.post(&self.url).json(invitation).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Cloneable enqueue handle given to the workflow engine.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<SigningInvitation>,
    link_base: String,
}

impl Notifier {
    /// Creates a notifier and the receiving end of its queue.
    ///
    /// # Arguments
    /// * `link_base` - Public base URL of the signing page
    pub fn channel(link_base: &str) -> (Self, mpsc::UnboundedReceiver<SigningInvitation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Self {
            tx,
            link_base: link_base.trim_end_matches('/').to_string(),
        };
        (notifier, rx)
    }

    /// `<link_base>/sign/<workflow_id>/<signer_id>`
    pub fn signing_link(&self, workflow_id: &str, signer_id: &str) -> String {
        format!("{}/sign/{}/{}", self.link_base, workflow_id, signer_id)
    }

    /// Queues an invitation for `signer`. Never fails; a closed queue is logged.
    pub fn invite(&self, workflow: &Workflow, signer: &Signer) {
        let invitation = SigningInvitation {
            workflow_id: workflow.id.clone(),
            workflow_title: workflow.title.clone(),
            signer_id: signer.id.clone(),
            signer_name: signer.name.clone(),
            signer_email: signer.email.clone(),
            seq: signer.seq,
            link: self.signing_link(&workflow.id, &signer.id),
        };
        if self.tx.send(invitation).is_err() {
            warn!(
                "Notification queue closed; invitation for {} on workflow {} dropped",
                signer.email, workflow.id
            );
        }
    }
}

/// Drains the queue until every [`Notifier`] is dropped.
pub async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<SigningInvitation>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) {
    while let Some(invitation) = rx.recv().await {
        match dispatcher.notify(&invitation).await {
            Ok(()) => info!(
                "Notified {} for workflow {} step {}",
                invitation.signer_email, invitation.workflow_id, invitation.seq
            ),
            Err(e) => error!(
                "Failed to notify {} for workflow {}: {}",
                invitation.signer_email, invitation.workflow_id, e
            ),
        }
    }
    info!("Notification worker stopped");
}

/// Spawns [`run_worker`] on the current runtime.
pub fn spawn_worker(
    rx: mpsc::UnboundedReceiver<SigningInvitation>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(run_worker(rx, dispatcher))
}
