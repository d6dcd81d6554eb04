//! # SwarmFS Files
//!
//! Content hashing, Merkle tree construction/proofs, chunk bitfields, and
//! chunk descriptors for the SwarmFS transfer engine.
//!
//! This crate provides:
//! - BLAKE3 content hashing over byte ranges
//! - Duplicate-last-leaf Merkle trees with leaf and subtree proofs
//! - A compact chunk-availability bitfield with base64 wire encoding
//! - Chunk descriptor math (offset/size from index and file size)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitfield;
pub mod chunk;
pub mod chunker;
pub mod hasher;
pub mod merkle;

pub use bitfield::Bitfield;
pub use chunk::ChunkDescriptor;
pub use chunker::{ChunkWriter, FileHashes};
pub use hasher::{combine, hash};
pub use merkle::{MerkleError, MerkleTree, Proof, ProofStep};

/// Default chunk size: 1 MiB (§6).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Legacy chunk size some older peers still advertise (§6).
pub const LEGACY_CHUNK_SIZE: u64 = 262_144;

/// Width in bytes of a content hash or Merkle node.
pub const HASH_SIZE: usize = 32;
