use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    plan_tier TEXT NOT NULL DEFAULT 'free',
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS domains (
    domain_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(user_id) REFERENCES users(user_id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS files (
    file_id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,
    modified_at TEXT,
    FOREIGN KEY(domain_id) REFERENCES domains(domain_id) ON DELETE CASCADE,
    FOREIGN KEY(user_id) REFERENCES users(user_id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    page_number INTEGER NOT NULL,
    is_header INTEGER NOT NULL,
    is_table INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    ciphertext BLOB NOT NULL,
    nonce BLOB NOT NULL UNIQUE,
    auth_tag BLOB NOT NULL,
    FOREIGN KEY(file_id) REFERENCES files(file_id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS file_keys (
    file_id TEXT PRIMARY KEY,
    wrapped_key BLOB NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_domains_user ON domains(user_id);
CREATE INDEX IF NOT EXISTS idx_files_domain ON files(domain_id);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id, ordinal);
"#;

/// Fresh connection with the per-connection pragmas applied. Stores open
/// one per call, so nothing request-scoped outlives the call.
pub(crate) fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Write transaction that takes the write lock up front. A deferred
/// transaction that reads before writing cannot wait on `busy_timeout` once
/// another writer has committed, so every read-then-write path uses this.
pub(crate) fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

pub(crate) fn init(path: &Path) -> Result<()> {
    let conn = connect(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
