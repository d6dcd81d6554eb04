//! Errors for frame parsing, message decoding, and dispatch.

use thiserror::Error;

/// Errors produced while parsing frames or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame header declared a protocol version this peer does not
    /// speak. The frame is dropped and logged, not treated as fatal.
    #[error("protocol version mismatch: peer sent {0}")]
    VersionMismatch(u8),

    /// The frame header's type byte does not match any known message.
    #[error("unknown message type byte: {0:#04x}")]
    UnknownMessageType(u8),

    /// A frame declared a payload longer than the atomic-write cap.
    #[error("declared frame payload {0} bytes exceeds the atomic-write cap")]
    PayloadTooLarge(usize),

    /// A binary payload (CHUNK_DATA / SUBTREE_DATA) was shorter than its
    /// fixed-field header.
    #[error("binary payload shorter than its fixed header")]
    BinaryPayloadTooShort,

    /// A binary payload's magic byte did not match the expected value.
    #[error("unexpected binary payload magic byte: {0:#04x}")]
    BadMagic(u8),

    /// A frame's declared length did not match the structural length of
    /// its fixed fields plus payload byte count.
    #[error("frame length does not match structural payload size")]
    LengthMismatch,

    /// A structured-text (JSON) payload failed to parse.
    #[error("malformed message payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A field failed validation at encode or decode time (bad hex length,
    /// non-power-of-two subtree count, misaligned start chunk, etc.).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The projected frame for a subtree response would exceed the
    /// atomic-write cap (§4.4 Overflow).
    #[error("subtree response would exceed the atomic-write cap")]
    Overflow,

    /// The requested chunk or file is not held locally.
    #[error("resource not found")]
    ResourceNotFound,

    /// An on-disk serving candidate's mtime disagreed with the stored
    /// value and a rehash did not confirm the chunk (§7 Stale).
    #[error("serving candidate is stale")]
    Stale,

    /// Underlying store failure while serving a request.
    #[error("store error: {0}")]
    Store(#[from] swarmfs_store::StoreError),

    /// Underlying I/O failure while reading a local file to serve bytes.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport reported a failure while sending or receiving.
    #[error("transport error: {0}")]
    Transport(#[from] swarmfs_transport::TransportError),
}
