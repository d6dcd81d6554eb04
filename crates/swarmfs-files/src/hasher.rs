//! Fixed-output content hashing over arbitrary byte ranges.
//!
//! SwarmFS uses BLAKE3 as its single content hash function: chunk hashes,
//! Merkle node combination, and file-level verification all go through
//! [`hash`] and [`combine`].

/// Hash an arbitrary byte range, returning a 32-byte digest.
#[must_use]
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

/// Combine two node hashes into their parent: `hash(h1 || h2)`.
#[must_use]
pub fn combine(h1: &[u8; 32], h2: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(h1);
    hasher.update(h2);
    *hasher.finalize().as_bytes()
}
