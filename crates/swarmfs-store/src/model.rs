//! Row types returned by the metadata store's queries.

use rusqlite::Row;
use std::path::PathBuf;

fn hash_from_blob(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; 32]> {
    let blob: Vec<u8> = row.get(idx)?;
    blob.try_into().map_err(|v: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            v.len(),
            rusqlite::types::Type::Blob,
            "expected a 32-byte hash".into(),
        )
    })
}

/// A file's metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Row id.
    pub id: i64,
    /// On-disk path.
    pub path: PathBuf,
    /// Merkle root over the file's chunk hashes.
    pub merkle_root: [u8; 32],
    /// Total file size in bytes.
    pub file_size: u64,
    /// Chunk size this file was hashed with.
    pub chunk_size: u64,
    /// Number of chunks.
    pub chunk_count: u64,
    /// Unix timestamp the record was first added.
    pub added_at: i64,
    /// Unix timestamp of last verified completion; `0` means in-progress.
    pub modified_at: i64,
}

impl FileRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: PathBuf::from(row.get::<_, String>(1)?),
            merkle_root: hash_from_blob(row, 2)?,
            file_size: row.get::<_, i64>(3)? as u64,
            chunk_size: row.get::<_, i64>(4)? as u64,
            chunk_count: row.get::<_, i64>(5)? as u64,
            added_at: row.get(6)?,
            modified_at: row.get(7)?,
        })
    }

    /// Whether this file has been fully verified at least once.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.modified_at > 0
    }
}

/// One chunk of a file's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRow {
    /// Zero-based chunk index.
    pub chunk_index: u64,
    /// Byte offset within the file.
    pub offset: u64,
    /// Chunk length in bytes.
    pub size: u32,
    /// Content hash of the chunk.
    pub hash: [u8; 32],
}

impl ChunkRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            chunk_index: row.get::<_, i64>(0)? as u64,
            offset: row.get::<_, i64>(1)? as u64,
            size: row.get::<_, i64>(2)? as u32,
            hash: hash_from_blob(row, 3)?,
        })
    }
}

/// A candidate location of a chunk, joined against its owning file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Id of the owning file.
    pub file_id: i64,
    /// Path of the owning file.
    pub file_path: PathBuf,
    /// Merkle root of the owning file.
    pub merkle_root: [u8; 32],
    /// Owning file's `modified_at`; `0` if still in progress.
    pub modified_at: i64,
    /// Chunk index within the owning file.
    pub chunk_index: u64,
    /// Byte offset within the owning file.
    pub chunk_offset: u64,
    /// Chunk length in bytes.
    pub chunk_size: u32,
}

impl ChunkLocation {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get(0)?,
            file_path: PathBuf::from(row.get::<_, String>(1)?),
            merkle_root: hash_from_blob(row, 2)?,
            modified_at: row.get(3)?,
            chunk_index: row.get::<_, i64>(4)? as u64,
            chunk_offset: row.get::<_, i64>(5)? as u64,
            chunk_size: row.get::<_, i64>(6)? as u32,
        })
    }

    /// Whether this candidate is safe to serve to a remote peer.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.modified_at > 0
    }
}

/// A join topic: a shared key under which peers exchange files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Row id.
    pub id: i64,
    /// Human-readable topic name.
    pub name: String,
    /// Derived topic key (§4.7).
    pub topic_key: [u8; 32],
    /// Whether this topic is joined automatically on startup.
    pub auto_join: bool,
    /// Unix timestamp the topic was first saved.
    pub created_at: i64,
    /// Unix timestamp of the most recent join, `0` if never joined.
    pub last_joined_at: i64,
}

impl Topic {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            topic_key: hash_from_blob(row, 2)?,
            auto_join: row.get(3)?,
            created_at: row.get(4)?,
            last_joined_at: row.get(5)?,
        })
    }
}

/// What kind of filesystem entry a topic share points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    /// A single file.
    File,
    /// A directory tree (enumerated by the namespace layer, external to
    /// this store).
    Directory,
}

impl ShareType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ShareType::File => "file",
            ShareType::Directory => "directory",
        }
    }

    pub(crate) fn from_str(s: &str) -> rusqlite::Result<Self> {
        match s {
            "file" => Ok(ShareType::File),
            "directory" => Ok(ShareType::Directory),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                other.len(),
                rusqlite::types::Type::Text,
                format!("unknown share_type {other:?}").into(),
            )),
        }
    }
}

/// A file or directory advertised under a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicShare {
    /// Owning topic id.
    pub topic_id: i64,
    /// Whether this share is a file or a directory.
    pub share_type: ShareType,
    /// Local path of the shared entry.
    pub path: PathBuf,
    /// Merkle root of the shared entry (directories use their namespace
    /// root, computed by the external namespace layer).
    pub merkle_root: [u8; 32],
    /// Unix timestamp the share was added.
    pub shared_at: i64,
}

impl TopicShare {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            topic_id: row.get(0)?,
            share_type: ShareType::from_str(&row.get::<_, String>(1)?)?,
            path: PathBuf::from(row.get::<_, String>(2)?),
            merkle_root: hash_from_blob(row, 3)?,
            shared_at: row.get(4)?,
        })
    }
}

/// An in-progress download, kept across restarts for resume (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteDownload {
    /// Topic the download was initiated under.
    pub topic_name: String,
    /// Merkle root of the file being downloaded.
    pub merkle_root: [u8; 32],
    /// Output path the file is being written to.
    pub output_path: PathBuf,
    /// Unix timestamp the download was first started.
    pub created_at: i64,
    /// Unix timestamp of completion, if any.
    pub completed_at: Option<i64>,
}

impl IncompleteDownload {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            topic_name: row.get(0)?,
            merkle_root: hash_from_blob(row, 1)?,
            output_path: PathBuf::from(row.get::<_, String>(2)?),
            created_at: row.get(3)?,
            completed_at: row.get(4)?,
        })
    }
}
