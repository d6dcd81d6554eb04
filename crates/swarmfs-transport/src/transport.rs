//! The `SwarmTransport` trait: the interface the transfer engine consumes
//! from the swarm transport, independent of whatever discovery substrate
//! actually establishes connections.

use crate::error::TransportError;
use crate::topic_key::TopicKey;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Opaque identifier for a peer, assigned by the transport's discovery
/// substrate. SwarmFS treats it as an equality-comparable handle only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 32]);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Opaque identifier for one connection to a peer. Duplicate connections
/// to the same peer keep only the most recent id (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Events a transport emits as connections come and go and data arrives.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection to `peer_id` became associated with `topic_key`.
    ///
    /// Incoming connections that do not yet list a topic are provisionally
    /// attributed to every currently joined topic; attribution tightens
    /// when the peer's first topic-scoped message arrives. Implementations
    /// that cannot provide that provisional attribution may instead emit
    /// this event once per topic the peer turns out to share.
    PeerConnected {
        /// The connection now serving this peer on this topic.
        conn: ConnectionId,
        /// The peer that connected.
        peer_id: PeerId,
        /// The topic the connection is associated with.
        topic_key: TopicKey,
    },
    /// A peer disconnected from a topic.
    PeerDisconnected {
        /// The peer that disconnected.
        peer_id: PeerId,
        /// The topic it disconnected from.
        topic_key: TopicKey,
    },
    /// Raw bytes arrived from a peer on a connection. The protocol layer
    /// is responsible for frame reassembly; the transport delivers
    /// arbitrary byte-fragment sizes.
    PeerData {
        /// The connection the bytes arrived on.
        conn: ConnectionId,
        /// The peer that sent them.
        peer_id: PeerId,
        /// The raw bytes received.
        bytes: Vec<u8>,
    },
}

/// Pluggable swarm transport: topic join/leave, per-topic broadcast,
/// per-peer unicast, and connection events.
///
/// Implementations own connections; callers (peers and sessions) hold only
/// [`PeerId`]/[`ConnectionId`] handles, looked up through the connection
/// table rather than owned directly (§4 Ownership).
#[async_trait]
pub trait SwarmTransport: Send + Sync {
    /// Announce and begin discovering peers on `topic_name`, admitting
    /// only peers that present the matching `topic_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot join the topic.
    async fn join(&self, topic_name: &str, topic_key: TopicKey) -> Result<(), TransportError>;

    /// Stop announcing and discovering peers on a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot leave the topic.
    async fn leave(&self, topic_name: &str, topic_key: TopicKey) -> Result<(), TransportError>;

    /// Write `bytes` to every connection currently associated with
    /// `topic_key`, returning the number of peers written to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local node has not joined this topic.
    async fn broadcast(&self, topic_key: TopicKey, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Write `bytes` to a single peer's connection on `topic_key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PeerNotConnected`] if no connection to
    /// `peer_id` exists on this topic.
    async fn unicast(
        &self,
        topic_key: TopicKey,
        peer_id: PeerId,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    /// The current per-topic connection table: every peer with a live
    /// connection associated with `topic_key`, and the connection id the
    /// core should use to address it.
    fn connections(&self, topic_key: TopicKey) -> Vec<(PeerId, ConnectionId)>;

    /// Subscribe to this transport's connection and data events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
