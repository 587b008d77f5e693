// src/storage/schema.rs
//! Table definitions for the signing store.

use log::info;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id                    TEXT PRIMARY KEY,
    email                 TEXT NOT NULL UNIQUE,
    name                  TEXT NOT NULL,
    public_key            TEXT NOT NULL UNIQUE,
    public_key_pem        TEXT NOT NULL,
    encrypted_private_key TEXT,
    created_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    content_hash      TEXT PRIMARY KEY,
    storage_path      TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS signatures (
    document_hash TEXT NOT NULL REFERENCES documents(content_hash),
    signer_email  TEXT NOT NULL REFERENCES identities(email),
    signer_name   TEXT NOT NULL,
    signature     TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (document_hash, signer_email)
);

CREATE INDEX IF NOT EXISTS idx_signatures_email ON signatures(signer_email);

CREATE TABLE IF NOT EXISTS workflows (
    id            TEXT PRIMARY KEY,
    document_hash TEXT NOT NULL,
    body          TEXT NOT NULL,
    version       INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflows_document ON workflows(document_hash);
"#;

/// Creates every table if missing and stamps the schema version.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let current: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match current {
        Some(version) if version >= SCHEMA_VERSION => {
            info!("Database schema is up to date (v{})", version);
        }
        _ => {
            info!("Creating database schema v{}", SCHEMA_VERSION);
            conn.execute_batch(TABLES)?;
            conn.execute("DELETE FROM schema_version", [])?;
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
        }
    }
    Ok(())
}
