//! Relational store backing sessions, the event journal, secrets, and
//! environment templates.
//!
//! One SQLite connection behind a mutex: every operation runs as a single
//! transaction on that connection, which also serializes journal appends —
//! per-session `seq` assignment can never interleave.

pub mod environments;
pub mod journal;
pub mod secrets;
pub mod sessions;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;

use moor_shared::crypto::{CryptoError, EnvelopeCipher};

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    cipher: EnvelopeCipher,
}

impl Store {
    pub fn open(db_path: &Path, cipher: EnvelopeCipher) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Invalid(format!("cannot create state dir: {e}")))?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, cipher)
    }

    pub fn open_in_memory(cipher: EnvelopeCipher) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, cipher)
    }

    fn from_connection(conn: Connection, cipher: EnvelopeCipher) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher,
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            // A poisoned lock means another thread panicked mid-statement;
            // the connection itself is still usable.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn cipher(&self) -> &EnvelopeCipher {
        &self.cipher
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    // journal_mode returns the resulting mode as a row, so it cannot go
    // through execute().
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version != 0 && current_version != SCHEMA_VERSION {
        return Err(StoreError::Invalid(format!(
            "database schema version {current_version} is newer than this binary supports"
        )));
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            repo_id TEXT,
            repo_branch TEXT,
            provider_type TEXT,
            provider_sandbox_id TEXT,
            image_digest TEXT,
            model_provider TEXT,
            model_id TEXT,
            environment_id TEXT,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_provider_sandbox
            ON sessions(provider_type, provider_sandbox_id)
            WHERE provider_sandbox_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS journal (
            session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (session_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_journal_created ON journal(created_at);

        CREATE TABLE IF NOT EXISTS secrets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            env_var_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            ciphertext BLOB NOT NULL,
            nonce BLOB NOT NULL,
            key_version INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS environments (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sandbox_type TEXT NOT NULL,
            image TEXT NOT NULL,
            resources TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    let cipher = EnvelopeCipher::from_key_bytes(&[42u8; 32]);
    Store::open_in_memory(cipher).expect("in-memory store")
}
