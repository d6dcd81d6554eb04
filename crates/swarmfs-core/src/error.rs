//! Error types for the peer manager, scheduler, download session, and node
//! facade.
//!
//! Splits errors a session recovers from internally from errors that must
//! surface to the caller as a terminal event (§7 "Propagation policy").

use thiserror::Error;

/// Result alias for core engine operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the peer manager, scheduler, download session, or
/// node facade.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(#[from] swarmfs_store::StoreError),

    /// Underlying protocol failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] swarmfs_protocol::ProtocolError),

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] swarmfs_transport::TransportError),

    /// I/O failure reading, writing, or preallocating the output file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No known file record matches the requested Merkle root and no peer
    /// answered a `METADATA_REQ` for it.
    #[error("no metadata available for this file")]
    NoMetadata,

    /// The final Merkle root recomputed from disk did not match the
    /// advertised root after a full download (§7 Fatal).
    #[error("final merkle root mismatch: file is corrupt or the source lied")]
    RootMismatch {
        /// The chunk index at which `find_first_chunk_mismatch` located the
        /// first divergence, if the linear scan found one.
        first_mismatch: Option<u64>,
    },

    /// A download was cancelled by the caller before completion.
    #[error("download cancelled")]
    Cancelled,

    /// The bitfield declared a size that does not match the file's chunk
    /// count.
    #[error("bitfield size does not match chunk count")]
    BitfieldSizeMismatch,
}
