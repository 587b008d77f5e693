// src/services/fingerprint.rs
//! Content-addressed document intake.
//!
//! Uploaded PDFs are identified by the SHA-256 of their bytes and written to
//! `<upload_dir>/<hash>.pdf`. Identical uploads collapse onto one file and one
//! row; the first upload's filename is kept.
//!
//! All operations block on the filesystem and the store. Async callers run
//! them on the blocking pool.

use crate::models::document::{Document, DocumentHash};
use crate::services::error::ServiceError;
use crate::storage::sqlite_store::SqliteStore;
use chrono::Utc;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Leading bytes of every PDF file.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

const DEFAULT_FILENAME: &str = "document.pdf";

/// Hex SHA-256 of raw document bytes.
pub fn compute_hash(bytes: &[u8]) -> DocumentHash {
    DocumentHash::of(bytes)
}

/// Rejects empty, oversized and non-PDF payloads.
pub fn validate_pdf(bytes: &[u8], max_bytes: usize) -> Result<(), ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Validation("no file uploaded".into()));
    }
    if bytes.len() > max_bytes {
        return Err(ServiceError::Validation(format!(
            "file is {} bytes, limit is {}",
            bytes.len(),
            max_bytes
        )));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ServiceError::Validation("only PDF files are accepted".into()));
    }
    Ok(())
}

/// Keeps only the final path component of a client-supplied filename.
fn sanitize_filename(filename: &str) -> String {
    Path::new(filename.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_FILENAME)
        .to_string()
}

/// Stores uploads and their content-hash records.
pub struct DocumentFingerprint {
    store: Arc<SqliteStore>,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
}

impl DocumentFingerprint {
    pub fn new(store: Arc<SqliteStore>, upload_dir: impl Into<PathBuf>, max_upload_bytes: usize) -> Self {
        Self {
            store,
            upload_dir: upload_dir.into(),
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Where a document with `hash` is written.
    pub fn path_for(&self, hash: &DocumentHash) -> PathBuf {
        self.upload_dir.join(format!("{}.pdf", hash))
    }

    /// Validates, writes and records an uploaded PDF.
    ///
    /// # Returns
    /// The stored document row. For a re-upload this is the existing row.
    pub fn store_upload(&self, bytes: &[u8], filename: &str) -> Result<Document, ServiceError> {
        validate_pdf(bytes, self.max_upload_bytes)?;
        let hash = compute_hash(bytes);
        let path = self.path_for(&hash);

        if !path.try_exists()? {
            fs::create_dir_all(&self.upload_dir)?;
            // Concurrent writers each use their own temp file; rename is atomic.
            let tmp = self.upload_dir.join(format!("{}.{}.tmp", hash, Uuid::new_v4()));
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
            debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        }

        self.upsert_document(&hash, &path.to_string_lossy(), &sanitize_filename(filename))
    }

    /// Inserts a document row unless one already exists for `hash`.
    ///
    /// # Returns
    /// The row as stored, which is the earlier one if this was a duplicate.
    pub fn upsert_document(
        &self,
        hash: &DocumentHash,
        path: &str,
        filename: &str,
    ) -> Result<Document, ServiceError> {
        let document = Document {
            content_hash: hash.clone(),
            storage_path: path.to_string(),
            original_filename: filename.to_string(),
            created_at: Utc::now(),
        };

        if self.store.upsert_document(&document)? {
            info!("Stored document {} ({})", hash, filename);
            return Ok(document);
        }
        debug!("Document {} already stored", hash);
        self.get_document(hash)
    }

    pub fn get_document(&self, hash: &DocumentHash) -> Result<Document, ServiceError> {
        self.store
            .document(hash)?
            .ok_or_else(|| ServiceError::DocumentNotFound(hash.to_string()))
    }
}
