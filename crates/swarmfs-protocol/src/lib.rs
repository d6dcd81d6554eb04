//! # SwarmFS Protocol
//!
//! Wire framing, the message set, per-peer reassembly, in-flight request
//! tables, and message dispatch (§4.4).
//!
//! `frame` and `message` are the codec layer: bytes in, structured
//! [`message::Message`] out, and back. `request_table` tracks everything
//! this peer is waiting on. `dispatch` ties a [`Protocol`] instance to a
//! [`swarmfs_transport::SwarmTransport`] and drives the request/offer and
//! subtree flows described in §4.4.

#![warn(missing_docs)]

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;
pub mod request_table;

pub use dispatch::{Protocol, ProtocolEvent};
pub use error::ProtocolError;
pub use message::RequestId;
