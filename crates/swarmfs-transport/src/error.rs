//! Errors for the transport boundary.

use thiserror::Error;

/// Errors a [`crate::SwarmTransport`] implementation may return.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The addressed peer is not currently connected on this topic.
    #[error("peer not connected on this topic")]
    PeerNotConnected,

    /// The local node has not joined the given topic.
    #[error("not joined to this topic")]
    NotJoined,

    /// Key derivation (password-based topic keys) failed.
    #[error("topic key derivation failed: {0}")]
    KeyDerivation(String),

    /// The underlying connection was reset or closed.
    #[error("connection closed")]
    Closed,

    /// Catch-all for implementation-specific failures.
    #[error("transport error: {0}")]
    Other(String),
}
