//! Compact chunk-availability bitmap.
//!
//! Packed little-endian-bit storage, byte-aligned, with an explicit
//! declared size so a peer can advertise exactly which chunk indices of a
//! file it is willing to serve.

use base64::Engine;

/// A fixed-size bitmap over chunk indices `0..size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    size: usize,
}

impl Bitfield {
    /// Create an all-clear bitfield over `size` chunks.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size.div_ceil(8)],
            size,
        }
    }

    /// Declared number of chunk slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Set bit `index`. Out-of-range indices are a no-op error.
    pub fn set(&mut self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.size {
            return Err(BitfieldError::OutOfRange);
        }
        self.bytes[index / 8] |= 1 << (index % 8);
        Ok(())
    }

    /// Clear bit `index`. Out-of-range indices are a no-op error.
    pub fn clear(&mut self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.size {
            return Err(BitfieldError::OutOfRange);
        }
        self.bytes[index / 8] &= !(1 << (index % 8));
        Ok(())
    }

    /// Test bit `index`. Out-of-range indices return `false`.
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        if index >= self.size {
            return false;
        }
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of every set bit, in ascending order.
    #[must_use]
    pub fn set_indices(&self) -> Vec<usize> {
        (0..self.size).filter(|&i| self.test(i)).collect()
    }

    /// Bitwise union: `self |= other`, for indices `0..min(self.size, other.size)`.
    pub fn union_with(&mut self, other: &Bitfield) {
        for (a, b) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *a |= *b;
        }
    }

    /// Bitwise difference: chunks `self` has that `other` does not.
    #[must_use]
    pub fn diff(&self, other: &Bitfield) -> Bitfield {
        let mut result = Bitfield::new(self.size);
        for i in 0..self.size {
            if self.test(i) && !other.test(i) {
                // within-bounds set, cannot fail
                let _ = result.set(i);
            }
        }
        result
    }

    /// Encode as base64: the raw packed bytes plus the declared size, so a
    /// receiver with a different chunk_count can still decode correctly.
    #[must_use]
    pub fn to_base64(&self) -> String {
        let mut wire = Vec::with_capacity(self.bytes.len() + 8);
        wire.extend_from_slice(&(self.size as u64).to_be_bytes());
        wire.extend_from_slice(&self.bytes);
        base64::engine::general_purpose::STANDARD.encode(wire)
    }

    /// Decode a bitfield previously produced by [`Bitfield::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self, BitfieldError> {
        let wire = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| BitfieldError::InvalidEncoding)?;
        if wire.len() < 8 {
            return Err(BitfieldError::InvalidEncoding);
        }
        let size = u64::from_be_bytes(wire[0..8].try_into().unwrap()) as usize;
        let bytes = wire[8..].to_vec();
        if bytes.len() != size.div_ceil(8) {
            return Err(BitfieldError::InvalidEncoding);
        }
        Ok(Self { bytes, size })
    }
}

/// Errors from bitfield operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldError {
    /// Index was outside `0..size`.
    #[error("bitfield index out of range")]
    OutOfRange,
    /// base64 payload was malformed or declared a size inconsistent with
    /// its byte length.
    #[error("invalid bitfield encoding")]
    InvalidEncoding,
}
