//! # SwarmFS Transport
//!
//! The pluggable swarm transport boundary: topic membership, connection
//! events, and per-topic broadcast/unicast delivery, plus topic key
//! derivation.
//!
//! The actual swarm discovery substrate — topic announce, peer rendezvous,
//! NAT traversal, and stream encryption — lives outside this crate; it is
//! an external collaborator that implements [`SwarmTransport`]. This crate
//! only ships the trait, topic key derivation, and an in-process
//! [`LoopbackTransport`] used to exercise the rest of the engine without a
//! real network.

#![warn(missing_docs)]

pub mod error;
pub mod loopback;
pub mod topic_key;
pub mod transport;

pub use error::TransportError;
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use topic_key::TopicKey;
pub use transport::{ConnectionId, PeerId, SwarmTransport, TransportEvent};
