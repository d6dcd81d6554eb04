//! # SwarmFS Store
//!
//! Durable metadata store: file records and their chunk layouts, topics and
//! topic key possession, topic shares, and the incomplete-download registry
//! used to resume transfers across restarts.
//!
//! Chunk location is derived from `file_chunks JOIN files`; a dedicated,
//! denormalized chunks table was considered and rejected in favor of the
//! join.
//!
//! All access is serialized through a single [`rusqlite::Connection`]
//! guarded by a mutex, matching the "single owning thread-equivalent"
//! requirement of §5 — SQLite itself is not safely shared across threads
//! without either serialization or its own threading mode, and a mutex is
//! the simplest correct option for an embedded engine.

#![warn(missing_docs)]

pub mod error;
pub mod model;
pub mod schema;

pub use error::{Result, StoreError};
pub use model::{ChunkLocation, ChunkRow, FileRecord, IncompleteDownload, ShareType, Topic, TopicShare};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default number of serving candidates returned for a chunk hash lookup.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 4;

/// The metadata store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if necessary) the metadata store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or migrated.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------

    /// Insert a file record, or update it in place if `path` already
    /// exists. `modified_at = 0` marks an in-progress download.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn upsert_file(
        &self,
        path: &Path,
        merkle_root: [u8; 32],
        file_size: u64,
        chunk_size: u64,
        chunk_count: u64,
        added_at: i64,
        modified_at: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let path_str = path.to_string_lossy();
        conn.execute(
            "INSERT INTO files (path, merkle_root, file_size, chunk_size, chunk_count, added_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
                merkle_root = excluded.merkle_root,
                file_size = excluded.file_size,
                chunk_size = excluded.chunk_size,
                chunk_count = excluded.chunk_count,
                modified_at = excluded.modified_at",
            params![
                path_str,
                merkle_root.to_vec(),
                file_size as i64,
                chunk_size as i64,
                chunk_count as i64,
                added_at,
                modified_at
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM files WHERE path = ?1",
            params![path_str],
            |row| row.get(0),
        )?;
        debug!(file_id = id, path = %path_str, "upserted file record");
        Ok(id)
    }

    /// Update a file's `modified_at`, marking completion (§4.5 finalization).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn set_modified_at(&self, file_id: i64, modified_at: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE files SET modified_at = ?1 WHERE id = ?2",
            params![modified_at, file_id],
        )?;
        Ok(())
    }

    /// Look up a file record by its on-disk path.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn file_by_path(&self, path: &Path) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, path, merkle_root, file_size, chunk_size, chunk_count, added_at, modified_at
             FROM files WHERE path = ?1",
            params![path.to_string_lossy()],
            FileRecord::from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Look up a file record by id.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn file_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, path, merkle_root, file_size, chunk_size, chunk_count, added_at, modified_at
             FROM files WHERE id = ?1",
            params![id],
            FileRecord::from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Look up a file record by its Merkle root. When more than one file
    /// shares a root, the most recently added wins.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn file_by_merkle_root(&self, root: [u8; 32]) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, path, merkle_root, file_size, chunk_size, chunk_count, added_at, modified_at
             FROM files WHERE merkle_root = ?1 ORDER BY added_at DESC LIMIT 1",
            params![root.to_vec()],
            FileRecord::from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    // ---------------------------------------------------------------
    // Chunks
    // ---------------------------------------------------------------

    /// Insert every chunk of a file as a single transactional unit —
    /// partial chunk inserts are forbidden (§4.3).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails to commit.
    pub fn insert_chunks(&self, file_id: i64, chunks: &[ChunkRow]) -> Result<()> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO file_chunks (file_id, chunk_index, offset, size, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(file_id, chunk_index) DO UPDATE SET
                    offset = excluded.offset, size = excluded.size, hash = excluded.hash",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    file_id,
                    chunk.chunk_index as i64,
                    chunk.offset as i64,
                    chunk.size as i64,
                    chunk.hash.to_vec(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch every chunk of `file_id`, ordered by index. Callers may rely
    /// on the contiguous `0..chunk_count` enumeration invariant (§4.3).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn chunks_for_file(&self, file_id: i64) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT chunk_index, offset, size, hash FROM file_chunks
             WHERE file_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let rows = stmt
            .query_map(params![file_id], ChunkRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Resolve a chunk hash to up to `limit` serving candidates, most
    /// recently added first. Only files with `modified_at > 0` are
    /// eligible — a peer never advertises bytes it has not verified.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn resolve_chunk_for_serve(
        &self,
        hash: [u8; 32],
        limit: usize,
    ) -> Result<Vec<ChunkLocation>> {
        self.resolve_chunk(hash, limit, true)
    }

    /// Resolve a chunk hash to up to `limit` candidates including
    /// in-progress files, for locally copying bytes into a new download
    /// instead of re-fetching them over the network (§4.3).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn resolve_chunk_for_write(
        &self,
        hash: [u8; 32],
        limit: usize,
    ) -> Result<Vec<ChunkLocation>> {
        self.resolve_chunk(hash, limit, false)
    }

    fn resolve_chunk(
        &self,
        hash: [u8; 32],
        limit: usize,
        serve_only: bool,
    ) -> Result<Vec<ChunkLocation>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let query = if serve_only {
            "SELECT f.id, f.path, f.merkle_root, f.modified_at, c.chunk_index, c.offset, c.size
             FROM file_chunks c JOIN files f ON f.id = c.file_id
             WHERE c.hash = ?1 AND f.modified_at > 0
             ORDER BY f.added_at DESC LIMIT ?2"
        } else {
            "SELECT f.id, f.path, f.merkle_root, f.modified_at, c.chunk_index, c.offset, c.size
             FROM file_chunks c JOIN files f ON f.id = c.file_id
             WHERE c.hash = ?1
             ORDER BY f.added_at DESC LIMIT ?2"
        };
        let mut stmt = conn.prepare(query)?;
        let rows = stmt
            .query_map(params![hash.to_vec(), limit as i64], ChunkLocation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Topics
    // ---------------------------------------------------------------

    /// Insert or update a topic by name.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn upsert_topic(
        &self,
        name: &str,
        topic_key: [u8; 32],
        auto_join: bool,
        created_at: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO topics (name, topic_key, auto_join, created_at, last_joined_at)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(name) DO UPDATE SET topic_key = excluded.topic_key, auto_join = excluded.auto_join",
            params![name, topic_key.to_vec(), auto_join, created_at],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM topics WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Look up a topic by name.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn topic_by_name(&self, name: &str) -> Result<Option<Topic>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, name, topic_key, auto_join, created_at, last_joined_at
             FROM topics WHERE name = ?1",
            params![name],
            Topic::from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// List every known topic.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn list_topics(&self) -> Result<Vec<Topic>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, topic_key, auto_join, created_at, last_joined_at FROM topics ORDER BY name ASC",
        )?;
        let rows = stmt
            .query_map([], Topic::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record that a topic was (re)joined.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn touch_topic_joined(&self, name: &str, joined_at: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE topics SET last_joined_at = ?1 WHERE name = ?2",
            params![joined_at, name],
        )?;
        Ok(())
    }

    /// Remove a topic (and its shares).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn remove_topic(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let id: Option<i64> = conn
            .query_row("SELECT id FROM topics WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?;
        if let Some(id) = id {
            conn.execute("DELETE FROM topic_shares WHERE topic_id = ?1", params![id])?;
            conn.execute("DELETE FROM topics WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    /// Toggle `auto_join` for every topic in `names` at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails to commit.
    pub fn set_auto_join_bulk(&self, names: &[String], auto_join: bool) -> Result<()> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE topics SET auto_join = ?1 WHERE name = ?2")?;
            for name in names {
                stmt.execute(params![auto_join, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Topic shares
    // ---------------------------------------------------------------

    /// Advertise a file or directory under a topic. Only files with
    /// `modified_at > 0` should ever be passed here by callers (§3).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn add_share(
        &self,
        topic_id: i64,
        share_type: ShareType,
        path: &Path,
        merkle_root: [u8; 32],
        shared_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO topic_shares (topic_id, share_type, path, merkle_root, shared_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(topic_id, path) DO UPDATE SET merkle_root = excluded.merkle_root",
            params![
                topic_id,
                share_type.as_str(),
                path.to_string_lossy(),
                merkle_root.to_vec(),
                shared_at
            ],
        )?;
        Ok(())
    }

    /// Stop advertising `path` under a topic.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn remove_share(&self, topic_id: i64, path: &Path) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM topic_shares WHERE topic_id = ?1 AND path = ?2",
            params![topic_id, path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// List every share advertised under a topic.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn shares_for_topic(&self, topic_id: i64) -> Result<Vec<TopicShare>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT topic_id, share_type, path, merkle_root, shared_at
             FROM topic_shares WHERE topic_id = ?1 ORDER BY shared_at ASC",
        )?;
        let rows = stmt
            .query_map(params![topic_id], TopicShare::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Incomplete downloads
    // ---------------------------------------------------------------

    /// Register (or refresh) an in-progress download so it can be resumed
    /// after a restart (§4.5 S4).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn upsert_incomplete_download(
        &self,
        topic_name: &str,
        merkle_root: [u8; 32],
        output_path: &Path,
        created_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO incomplete_downloads (topic_name, merkle_root, output_path, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, NULL)
             ON CONFLICT(topic_name, merkle_root) DO UPDATE SET output_path = excluded.output_path",
            params![topic_name, merkle_root.to_vec(), output_path.to_string_lossy(), created_at],
        )?;
        Ok(())
    }

    /// Look up an incomplete-download entry.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn incomplete_download(
        &self,
        topic_name: &str,
        merkle_root: [u8; 32],
    ) -> Result<Option<IncompleteDownload>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT topic_name, merkle_root, output_path, created_at, completed_at
             FROM incomplete_downloads WHERE topic_name = ?1 AND merkle_root = ?2",
            params![topic_name, merkle_root.to_vec()],
            IncompleteDownload::from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// List every outstanding (not completed) incomplete download.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn list_incomplete_downloads(&self) -> Result<Vec<IncompleteDownload>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT topic_name, merkle_root, output_path, created_at, completed_at
             FROM incomplete_downloads WHERE completed_at IS NULL ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], IncompleteDownload::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark an incomplete download as completed. A `Fatal` session error
    /// (§7) must *not* call this — the entry is retained for diagnosis.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn complete_incomplete_download(
        &self,
        topic_name: &str,
        merkle_root: [u8; 32],
        completed_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE incomplete_downloads SET completed_at = ?1 WHERE topic_name = ?2 AND merkle_root = ?3",
            params![completed_at, topic_name, merkle_root.to_vec()],
        )?;
        Ok(())
    }

    /// Remove an incomplete-download entry outright (used for explicit
    /// cleanup, not for the fatal-error path).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn remove_incomplete_download(&self, topic_name: &str, merkle_root: [u8; 32]) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM incomplete_downloads WHERE topic_name = ?1 AND merkle_root = ?2",
            params![topic_name, merkle_root.to_vec()],
        )?;
        Ok(())
    }
}

/// A process-wide data directory: owns the metadata store handle and an
/// advisory lock file preventing a second instance from opening the same
/// directory concurrently (§6 — global mutable state is limited to the
/// store's process-wide handle).
pub struct DataDir {
    /// Root of the data directory.
    pub root: PathBuf,
    /// The metadata store at `root/swarmfs.db`.
    pub store: Store,
    _lock: std::fs::File,
}

impl DataDir {
    /// Open (creating if necessary) the data directory at `root`, acquiring
    /// its exclusive lock file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyLocked`] if another process holds the
    /// lock, or an I/O/SQL error otherwise.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(StoreError::Io)?;

        let lock_path = root.join("swarmfs.lock");
        let lock = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    warn!(path = %lock_path.display(), "data directory already locked");
                    StoreError::AlreadyLocked
                }
                _ => StoreError::Io(e),
            })?;

        let store = Store::open(root.join("swarmfs.db"))?;
        Ok(Self {
            root,
            store,
            _lock: lock,
        })
    }
}

impl Drop for DataDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.root.join("swarmfs.lock"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_fetch_file_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let root = [7u8; 32];
        let id = store
            .upsert_file(Path::new("/tmp/a.bin"), root, 100, 10, 10, 1, 0)
            .unwrap();

        let record = store.file_by_id(id).unwrap().unwrap();
        assert_eq!(record.merkle_root, root);
        assert_eq!(record.modified_at, 0);

        let by_path = store.file_by_path(Path::new("/tmp/a.bin")).unwrap().unwrap();
        assert_eq!(by_path.id, id);

        let by_root = store.file_by_merkle_root(root).unwrap().unwrap();
        assert_eq!(by_root.id, id);
    }

    #[test]
    fn chunk_insert_is_transactional_and_contiguous() {
        let store = Store::open_in_memory().unwrap();
        let file_id = store
            .upsert_file(Path::new("/tmp/b.bin"), [1u8; 32], 30, 10, 3, 1, 1)
            .unwrap();

        let chunks = vec![
            ChunkRow { chunk_index: 0, offset: 0, size: 10, hash: [1u8; 32] },
            ChunkRow { chunk_index: 1, offset: 10, size: 10, hash: [2u8; 32] },
            ChunkRow { chunk_index: 2, offset: 20, size: 10, hash: [3u8; 32] },
        ];
        store.insert_chunks(file_id, &chunks).unwrap();

        let fetched = store.chunks_for_file(file_id).unwrap();
        assert_eq!(fetched.len(), 3);
        let mut expected_offset = 0u64;
        for c in &fetched {
            assert_eq!(c.offset, expected_offset);
            expected_offset += c.size as u64;
        }
        assert_eq!(expected_offset, 30);
    }

    #[test]
    fn resolve_chunk_excludes_in_progress_for_serve() {
        let store = Store::open_in_memory().unwrap();
        let hash = [9u8; 32];

        let complete_id = store
            .upsert_file(Path::new("/tmp/done.bin"), [1u8; 32], 10, 10, 1, 1, 5)
            .unwrap();
        store
            .insert_chunks(complete_id, &[ChunkRow { chunk_index: 0, offset: 0, size: 10, hash }])
            .unwrap();

        let progress_id = store
            .upsert_file(Path::new("/tmp/progress.bin"), [2u8; 32], 10, 10, 1, 2, 0)
            .unwrap();
        store
            .insert_chunks(progress_id, &[ChunkRow { chunk_index: 0, offset: 0, size: 10, hash }])
            .unwrap();

        let serve = store.resolve_chunk_for_serve(hash, 10).unwrap();
        assert_eq!(serve.len(), 1);
        assert_eq!(serve[0].file_id, complete_id);

        let write = store.resolve_chunk_for_write(hash, 10).unwrap();
        assert_eq!(write.len(), 2);
    }

    #[test]
    fn incomplete_download_registry_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let root = [5u8; 32];
        store
            .upsert_incomplete_download("myshare", root, Path::new("/tmp/out.bin"), 10)
            .unwrap();

        let entry = store.incomplete_download("myshare", root).unwrap().unwrap();
        assert!(entry.completed_at.is_none());

        store.complete_incomplete_download("myshare", root, 20).unwrap();
        let entry = store.incomplete_download("myshare", root).unwrap().unwrap();
        assert_eq!(entry.completed_at, Some(20));

        assert!(store.list_incomplete_downloads().unwrap().is_empty());
    }

    #[test]
    fn topic_bulk_autojoin_toggle() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_topic("alpha", [1u8; 32], false, 0).unwrap();
        store.upsert_topic("beta", [2u8; 32], false, 0).unwrap();

        store
            .set_auto_join_bulk(&["alpha".to_string(), "beta".to_string()], true)
            .unwrap();

        let topics = store.list_topics().unwrap();
        assert!(topics.iter().all(|t| t.auto_join));
    }
}
