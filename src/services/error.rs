// src/services/error.rs
//! Error taxonomy shared by the signing services.

use crate::models::document::InvalidDocumentHash;
use crate::storage::sqlite_store::StoreError;
use crate::wallet::key_management::CryptoError;
use thiserror::Error;

/// Coarse classification used by the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input
    Validation,
    NotFound,
    /// Duplicate identity or signature
    Duplicate,
    /// Key format, key mismatch, verification or passphrase failure
    Crypto,
    /// Lost race or out-of-order action; retry after refreshing
    Conflict,
    /// Storage, render or filesystem failure
    Internal,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("signer {signer_id} not found in workflow {workflow_id}")]
    SignerNotFound { workflow_id: String, signer_id: String },

    #[error("identity already registered: {0}")]
    DuplicateIdentity(String),

    #[error("{signer} has already signed document {document_hash}")]
    DuplicateSignature { document_hash: String, signer: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("signer {0} has already completed this step")]
    SignerAlreadyCompleted(String),

    #[error("signer {signer_id} cannot act until step {seq} is reached")]
    StepNotActive { signer_id: String, seq: u32 },

    #[error("concurrent update lost: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("render error: {0}")]
    Render(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::IdentityNotFound(_)
            | ServiceError::DocumentNotFound(_)
            | ServiceError::WorkflowNotFound(_)
            | ServiceError::SignerNotFound { .. } => ErrorKind::NotFound,
            ServiceError::DuplicateIdentity(_) | ServiceError::DuplicateSignature { .. } => {
                ErrorKind::Duplicate
            }
            ServiceError::Crypto(_) => ErrorKind::Crypto,
            ServiceError::SignerAlreadyCompleted(_)
            | ServiceError::StepNotActive { .. }
            | ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::Storage(_)
            | ServiceError::Render(_)
            | ServiceError::Io(_)
            | ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<InvalidDocumentHash> for ServiceError {
    fn from(err: InvalidDocumentHash) -> Self {
        ServiceError::Validation(err.to_string())
    }
}
