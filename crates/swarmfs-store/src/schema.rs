//! Schema migration for the metadata store.
//!
//! A single forward-only `execute_batch` is used rather than a numbered
//! migration chain — the store has no external deployments to migrate
//! between versions of yet. A dedicated `chunks` table was considered and
//! rejected in favor of this `file_chunks` join.

use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id           INTEGER PRIMARY KEY,
    path         TEXT NOT NULL UNIQUE,
    merkle_root  BLOB NOT NULL,
    file_size    INTEGER NOT NULL,
    chunk_size   INTEGER NOT NULL,
    chunk_count  INTEGER NOT NULL,
    added_at     INTEGER NOT NULL,
    modified_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_merkle_root ON files (merkle_root);

CREATE TABLE IF NOT EXISTS file_chunks (
    file_id      INTEGER NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    chunk_index  INTEGER NOT NULL,
    offset       INTEGER NOT NULL,
    size         INTEGER NOT NULL,
    hash         BLOB NOT NULL,
    PRIMARY KEY (file_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_file_chunks_hash ON file_chunks (hash);

CREATE TABLE IF NOT EXISTS topics (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    topic_key       BLOB NOT NULL,
    auto_join       INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    last_joined_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS topic_shares (
    topic_id     INTEGER NOT NULL REFERENCES topics (id) ON DELETE CASCADE,
    share_type   TEXT NOT NULL,
    path         TEXT NOT NULL,
    merkle_root  BLOB NOT NULL,
    shared_at    INTEGER NOT NULL,
    PRIMARY KEY (topic_id, path)
);

CREATE TABLE IF NOT EXISTS incomplete_downloads (
    topic_name    TEXT NOT NULL,
    merkle_root   BLOB NOT NULL,
    output_path   TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    completed_at  INTEGER,
    PRIMARY KEY (topic_name, merkle_root)
);
"#;

/// Apply the store's schema, creating any missing tables and indices.
///
/// # Errors
///
/// Returns an error if the batch fails to execute.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)
}
