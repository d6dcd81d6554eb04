//! Whole-file chunk hashing and chunk-addressed file I/O.
//!
//! Used both to hash a file being shared for the first time (`hash_file`)
//! and, on the receiving side, to rehash an on-disk file during resume
//! (§4.5 startup sequence) and to read/write individual chunk ranges.

use crate::merkle::MerkleTree;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Result of hashing a file: its per-chunk hashes, Merkle tree, and size.
#[derive(Debug, Clone)]
pub struct FileHashes {
    /// Merkle tree over the ordered chunk hashes.
    pub tree: MerkleTree,
    /// File size in bytes.
    pub file_size: u64,
    /// Chunk size used while hashing.
    pub chunk_size: u64,
}

impl FileHashes {
    /// The file's Merkle root.
    #[must_use]
    pub fn root(&self) -> [u8; 32] {
        self.tree.root()
    }

    /// Number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.tree.leaf_count() as u64
    }
}

/// Hash every chunk of the file at `path` and build its Merkle tree.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn hash_file<P: AsRef<Path>>(path: P, chunk_size: u64) -> io::Result<FileHashes> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut leaves = Vec::with_capacity(crate::chunk::chunk_count(file_size, chunk_size) as usize);
    let mut buffer = vec![0u8; chunk_size as usize];

    loop {
        let mut total_read = 0usize;
        while total_read < buffer.len() {
            let n = file.read(&mut buffer[total_read..])?;
            if n == 0 {
                break;
            }
            total_read += n;
        }
        if total_read == 0 {
            break;
        }
        leaves.push(crate::hasher::hash(&buffer[..total_read]));
        if total_read < buffer.len() {
            break;
        }
    }

    if leaves.is_empty() {
        leaves.push(crate::hasher::hash(&[]));
    }

    Ok(FileHashes {
        tree: MerkleTree::from_leaves(leaves),
        file_size,
        chunk_size,
    })
}

/// Rehash a single chunk range of an on-disk file, without loading the
/// whole file. Used during resume to check which chunks already verify.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, seeked, or read.
pub fn hash_chunk_range<P: AsRef<Path>>(
    path: P,
    offset: u64,
    size: u32,
) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0u8; size as usize];
    file.read_exact(&mut buffer)?;
    Ok(crate::hasher::hash(&buffer))
}

/// A random-access output file for an in-progress download: preallocated
/// to the final size, supporting out-of-order chunk writes.
pub struct ChunkWriter {
    file: File,
}

impl ChunkWriter {
    /// Open (creating if necessary) and preallocate `path` to `file_size`
    /// bytes. Preallocation may be sparse.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, opened, or resized.
    pub fn open<P: AsRef<Path>>(path: P, file_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(file_size)?;
        Ok(Self { file })
    }

    /// Write `data` at `offset`. Callers must bound-check
    /// `offset + data.len() <= file_size` themselves (§4.5).
    ///
    /// # Errors
    ///
    /// Returns an error if seeking or writing fails.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    /// Read `size` bytes at `offset`, for serving a chunk to a peer.
    ///
    /// # Errors
    ///
    /// Returns an error if seeking or reading fails.
    pub fn read_at(&mut self, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Flush the file's contents and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `fsync` fails.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
