//! Chunk descriptor math shared by the chunker, the metadata store, and the
//! protocol layer.

/// Describes one chunk of a file: its position, size, and content hash.
///
/// Invariant: `offset == chunk_index * chunk_size`; only the final chunk of
/// a file may have `size < chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// BLAKE3 hash of the chunk's bytes.
    pub hash: [u8; 32],
    /// Zero-based position of this chunk within the file.
    pub chunk_index: u64,
    /// Byte offset of the chunk's first byte within the file.
    pub offset: u64,
    /// Chunk length in bytes: `min(chunk_size, file_size - offset)`.
    pub size: u32,
}

/// Number of chunks a file of `file_size` bytes splits into at `chunk_size`.
#[must_use]
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if file_size == 0 {
        return 1;
    }
    file_size.div_ceil(chunk_size)
}

/// Byte offset of `chunk_index` given `chunk_size`.
#[must_use]
pub fn chunk_offset(chunk_index: u64, chunk_size: u64) -> u64 {
    chunk_index * chunk_size
}

/// Size in bytes of `chunk_index`: `min(chunk_size, file_size - offset)`.
#[must_use]
pub fn chunk_size_at(chunk_index: u64, file_size: u64, chunk_size: u64) -> u32 {
    let offset = chunk_offset(chunk_index, chunk_size);
    let remaining = file_size.saturating_sub(offset);
    remaining.min(chunk_size) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_file() {
        assert_eq!(chunk_count(11, 1024 * 1024), 1);
        assert_eq!(chunk_size_at(0, 11, 1024 * 1024), 11);
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let chunk_size = 1024 * 1024;
        assert_eq!(chunk_count(2 * chunk_size, chunk_size), 2);
        assert_eq!(chunk_size_at(0, 2 * chunk_size, chunk_size), chunk_size as u32);
        assert_eq!(chunk_size_at(1, 2 * chunk_size, chunk_size), chunk_size as u32);
    }

    #[test]
    fn final_chunk_is_short() {
        let chunk_size = 1024 * 1024;
        let file_size = 2 * chunk_size + 1;
        assert_eq!(chunk_count(file_size, chunk_size), 3);
        assert_eq!(chunk_size_at(2, file_size, chunk_size), 1);
    }

    #[test]
    fn offset_matches_index_times_chunk_size() {
        assert_eq!(chunk_offset(5, 1024), 5120);
    }
}
