// src/storage/sqlite_store.rs
//! SQLite persistence for identities, documents, signatures and workflows.
//!
//! Every uniqueness rule is enforced by the database itself. Writes that can
//! race (identity registration, signature recording, workflow saves) are single
//! conditional statements whose affected-row count tells the caller whether it
//! won, so there is no check-then-insert window.

use crate::models::document::{Document, DocumentHash};
use crate::models::identity::Identity;
use crate::models::signature::{SignatureHistoryEntry, SignatureRecord};
use crate::models::workflow::Workflow;
use crate::storage::schema::init_schema;
use crate::utils::serialization::{deserialize, normalize_key_encoding, serialize};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the store.
///
/// Constraint outcomes the caller is expected to handle (duplicate identity,
/// duplicate signature, stale workflow version) are reported through return
/// values, not through this type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored workflow is unreadable: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    LockPoisoned,
}

/// A workflow together with the version it was loaded at.
#[derive(Debug, Clone)]
pub struct VersionedWorkflow {
    pub workflow: Workflow,
    pub version: i64,
}

/// Thread-safe handle over one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn hash_column(row: &Row, idx: usize) -> rusqlite::Result<DocumentHash> {
    let raw: String = row.get(idx)?;
    DocumentHash::parse(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn identity_from_row(row: &Row) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        public_key: row.get(3)?,
        encrypted_private_key: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn document_from_row(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        content_hash: hash_column(row, 0)?,
        storage_path: row.get(1)?,
        original_filename: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn signature_from_row(row: &Row) -> rusqlite::Result<SignatureRecord> {
    Ok(SignatureRecord {
        document_hash: hash_column(row, 0)?,
        signer_email: row.get(1)?,
        signer_name: row.get(2)?,
        signature: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const IDENTITY_COLUMNS: &str =
    "id, email, name, public_key_pem, encrypted_private_key, created_at";

impl SqliteStore {
    /// Opens (or creates) a database file in WAL mode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;
        debug!("Opened signing store at {} (journal mode {})", path.as_ref().display(), mode);
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    /// Opens a private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    // ---- identities ----

    /// Inserts an identity unless its email or public key is already bound.
    ///
    /// # Returns
    /// `false` when a uniqueness constraint kept the row out.
    pub fn insert_identity(&self, identity: &Identity) -> Result<bool, StoreError> {
        let key_body = normalize_key_encoding(&identity.public_key);
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO identities
                     (id, email, name, public_key, public_key_pem, encrypted_private_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
                params![
                    identity.id,
                    identity.email,
                    identity.name,
                    key_body,
                    identity.public_key,
                    identity.encrypted_private_key,
                    identity.created_at,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn identity_by_email(&self, email: &str) -> Result<Option<Identity>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM identities WHERE email = ?1", IDENTITY_COLUMNS);
            Ok(conn
                .query_row(&sql, params![email], identity_from_row)
                .optional()?)
        })
    }

    /// Looks up an identity by public key, ignoring PEM armour and whitespace.
    pub fn identity_by_public_key(&self, public_key: &str) -> Result<Option<Identity>, StoreError> {
        let key_body = normalize_key_encoding(public_key);
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM identities WHERE public_key = ?1", IDENTITY_COLUMNS);
            Ok(conn
                .query_row(&sql, params![key_body], identity_from_row)
                .optional()?)
        })
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM identities ORDER BY created_at, email",
                IDENTITY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], identity_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // ---- documents ----

    /// Records a document unless one with the same hash exists.
    ///
    /// # Returns
    /// `true` if this call created the row.
    pub fn upsert_document(&self, document: &Document) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO documents (content_hash, storage_path, original_filename, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(content_hash) DO NOTHING",
                params![
                    document.content_hash.as_str(),
                    document.storage_path,
                    document.original_filename,
                    document.created_at,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn document(&self, hash: &DocumentHash) -> Result<Option<Document>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content_hash, storage_path, original_filename, created_at
                     FROM documents WHERE content_hash = ?1",
                    params![hash.as_str()],
                    document_from_row,
                )
                .optional()?)
        })
    }

    // ---- signatures ----

    /// Inserts a signature record unless this signer already signed.
    ///
    /// # Returns
    /// `false` when `(document_hash, signer_email)` already exists.
    pub fn insert_signature(&self, record: &SignatureRecord) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO signatures
                     (document_hash, signer_email, signer_name, signature, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(document_hash, signer_email) DO NOTHING",
                params![
                    record.document_hash.as_str(),
                    record.signer_email,
                    record.signer_name,
                    record.signature,
                    record.created_at,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn signature(
        &self,
        hash: &DocumentHash,
        email: &str,
    ) -> Result<Option<SignatureRecord>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT document_hash, signer_email, signer_name, signature, created_at
                     FROM signatures WHERE document_hash = ?1 AND signer_email = ?2",
                    params![hash.as_str(), email],
                    signature_from_row,
                )
                .optional()?)
        })
    }

    /// Signatures on a document, oldest first.
    pub fn signatures_for_document(
        &self,
        hash: &DocumentHash,
    ) -> Result<Vec<SignatureRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT document_hash, signer_email, signer_name, signature, created_at
                 FROM signatures WHERE document_hash = ?1
                 ORDER BY created_at, signer_email",
            )?;
            let rows = stmt.query_map(params![hash.as_str()], signature_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Everything an identity has signed, newest first.
    pub fn signature_history(&self, email: &str) -> Result<Vec<SignatureHistoryEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.document_hash, d.original_filename, s.signature, s.created_at
                 FROM signatures s
                 JOIN documents d ON d.content_hash = s.document_hash
                 WHERE s.signer_email = ?1
                 ORDER BY s.created_at DESC",
            )?;
            let rows = stmt.query_map(params![email], |row| {
                Ok(SignatureHistoryEntry {
                    document_hash: hash_column(row, 0)?,
                    filename: row.get(1)?,
                    signature: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // ---- workflows ----

    /// Stores a new workflow at version 1.
    pub fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let body = serialize(workflow)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflows (id, document_hash, body, version, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![
                    workflow.id,
                    workflow.document_hash.as_str(),
                    body,
                    workflow.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_workflow(&self, id: &str) -> Result<Option<VersionedWorkflow>, StoreError> {
        let row: Option<(String, i64)> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT body, version FROM workflows WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;

        match row {
            Some((body, version)) => Ok(Some(VersionedWorkflow {
                workflow: deserialize(&body)?,
                version,
            })),
            None => Ok(None),
        }
    }

    /// Replaces a workflow only if it is still at `expected_version`.
    ///
    /// # Returns
    /// `false` when another writer saved first; the caller must reload.
    pub fn save_workflow(&self, workflow: &Workflow, expected_version: i64) -> Result<bool, StoreError> {
        let body = serialize(workflow)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE workflows SET body = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![body, workflow.id, expected_version],
            )?;
            Ok(updated == 1)
        })
    }

    /// Workflows routing a given document, oldest first.
    pub fn workflows_for_document(&self, hash: &DocumentHash) -> Result<Vec<Workflow>, StoreError> {
        let bodies: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM workflows WHERE document_hash = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![hash.as_str()], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })?;
        bodies
            .iter()
            .map(|body| deserialize(body).map_err(StoreError::from))
            .collect()
    }
}
