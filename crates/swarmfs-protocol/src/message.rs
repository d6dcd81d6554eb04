//! The SwarmFS message set (§4.4).
//!
//! Most messages are self-describing structured text (JSON); `CHUNK_DATA`
//! and `SUBTREE_DATA` are binary-packed instead, since they carry the bulk
//! file bytes and JSON-encoding those would be wasteful. Fixed-size byte
//! arrays (hashes, request ids) are hex-encoded in the JSON payloads so the
//! wire format stays human-inspectable and easy to log.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use swarmfs_transport::PeerId;

/// A 16-byte identifier correlating a request, its offers, and its
/// response. Never reused while live (§8 invariant 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub [u8; 16]);

impl RequestId {
    /// Generate a fresh random request id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Tagged hex-string (de)serialization for fixed-size byte arrays, used so
/// the structured-text messages stay JSON rather than base64 blobs of raw
/// bytes.
fn to_hex<const N: usize>(bytes: &[u8; N]) -> String {
    hex::encode(bytes)
}

fn from_hex<const N: usize>(s: &str) -> Result<[u8; N], ProtocolError> {
    let v = hex::decode(s).map_err(|_| ProtocolError::InvalidArgument("bad hex".into()))?;
    v.try_into()
        .map_err(|_| ProtocolError::InvalidArgument(format!("expected {N}-byte hex field")))
}

/// The message-type tag byte carried in the frame header (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Ask for a chunk by hash.
    Request = 0x01,
    /// Announce availability and size.
    Offer = 0x02,
    /// Accept an offer (optional; the fast path omits it).
    Download = 0x03,
    /// Binary-framed chunk bytes.
    ChunkData = 0x04,
    /// Abandon a request.
    Cancel = 0x05,
    /// Negative response with a reason.
    Error = 0x06,
    /// Enumerate shared files in a topic (request).
    FileListReq = 0x07,
    /// Enumerate shared files in a topic (response).
    FileListResp = 0x08,
    /// Full chunk layout for a file (request).
    MetadataReq = 0x09,
    /// Full chunk layout for a file (response).
    MetadataResp = 0x0a,
    /// Announce a single newly-available chunk.
    Have = 0x0b,
    /// Full availability bitmap.
    Bitfield = 0x0c,
    /// Ask for a peer's bitmap.
    BitfieldReq = 0x0d,
    /// Batched aligned-subtree transfer request.
    SubtreeReq = 0x0e,
    /// Batched aligned-subtree transfer data.
    SubtreeData = 0x0f,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Request,
            0x02 => Self::Offer,
            0x03 => Self::Download,
            0x04 => Self::ChunkData,
            0x05 => Self::Cancel,
            0x06 => Self::Error,
            0x07 => Self::FileListReq,
            0x08 => Self::FileListResp,
            0x09 => Self::MetadataReq,
            0x0a => Self::MetadataResp,
            0x0b => Self::Have,
            0x0c => Self::Bitfield,
            0x0d => Self::BitfieldReq,
            0x0e => Self::SubtreeReq,
            0x0f => Self::SubtreeData,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// A summary entry in a [`FileListResp`] payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    /// Hex-encoded Merkle root.
    pub merkle_root: String,
    /// Path the holder shares this file under.
    pub path: String,
    /// Total file size in bytes.
    pub file_size: u64,
}

/// The request payload of [`MessageType::Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Hex-encoded request id.
    pub request_id: String,
    /// Hex-encoded chunk hash being requested.
    pub chunk_hash: String,
    /// Hex-encoded topic key this request is scoped to.
    pub topic_key: String,
}

/// The payload of [`MessageType::Offer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    /// Request id this offer responds to.
    pub request_id: String,
    /// Hex-encoded chunk hash on offer.
    pub chunk_hash: String,
    /// Chunk size in bytes.
    pub size: u32,
}

/// The payload of [`MessageType::Download`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    /// Request id being accepted.
    pub request_id: String,
}

/// The payload of [`MessageType::Cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayload {
    /// Request id to abandon.
    pub request_id: String,
}

/// The payload of [`MessageType::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Request id the error responds to, if any.
    pub request_id: Option<String>,
    /// Human-readable reason.
    pub reason: String,
}

/// The payload of [`MessageType::FileListReq`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListReqPayload {
    /// Hex-encoded topic key to enumerate.
    pub topic_key: String,
}

/// The payload of [`MessageType::FileListResp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListRespPayload {
    /// Request id this responds to.
    pub request_id: String,
    /// Files shared under the requested topic.
    pub files: Vec<FileSummary>,
}

/// The payload of [`MessageType::MetadataReq`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataReqPayload {
    /// Request id.
    pub request_id: String,
    /// Hex-encoded Merkle root of the file whose layout is requested.
    pub merkle_root: String,
}

/// The payload of [`MessageType::MetadataResp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRespPayload {
    /// Request id this responds to.
    pub request_id: String,
    /// Hex-encoded Merkle root.
    pub merkle_root: String,
    /// Total file size in bytes.
    pub file_size: u64,
    /// Chunk size used to hash this file.
    pub chunk_size: u64,
    /// Total chunk count.
    pub chunk_count: u64,
    /// Hex-encoded per-chunk content hashes, in chunk-index order.
    pub chunk_hashes: Vec<String>,
}

/// The payload of [`MessageType::Have`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HavePayload {
    /// Index of the chunk that just became available.
    pub chunk_index: u64,
}

/// The payload of [`MessageType::Bitfield`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitfieldPayload {
    /// Base64-encoded packed bitmap (§4.2).
    pub bits: String,
    /// Declared bit count.
    pub size: u64,
}

/// The (empty) payload of [`MessageType::BitfieldReq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitfieldReqPayload {}

/// The payload of [`MessageType::SubtreeReq`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeReqPayload {
    /// Request id.
    pub request_id: String,
    /// Hex-encoded Merkle root of the file.
    pub merkle_root: String,
    /// First chunk index of the requested aligned run.
    pub start_chunk: u64,
    /// Power-of-two chunk count (or 1, for tail fallback).
    pub chunk_count: u32,
}

/// A decoded structured-text message, dispatched by [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// See [`RequestPayload`].
    Request(RequestPayload),
    /// See [`OfferPayload`].
    Offer(OfferPayload),
    /// See [`DownloadPayload`].
    Download(DownloadPayload),
    /// See [`CancelPayload`].
    Cancel(CancelPayload),
    /// See [`ErrorPayload`].
    Error(ErrorPayload),
    /// See [`FileListReqPayload`].
    FileListReq(FileListReqPayload),
    /// See [`FileListRespPayload`].
    FileListResp(FileListRespPayload),
    /// See [`MetadataReqPayload`].
    MetadataReq(MetadataReqPayload),
    /// See [`MetadataRespPayload`].
    MetadataResp(MetadataRespPayload),
    /// See [`HavePayload`].
    Have(HavePayload),
    /// See [`BitfieldPayload`].
    Bitfield(BitfieldPayload),
    /// See [`BitfieldReqPayload`].
    BitfieldReq(BitfieldReqPayload),
    /// See [`SubtreeReqPayload`].
    SubtreeReq(SubtreeReqPayload),
}

impl Message {
    /// The wire type tag for this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Offer(_) => MessageType::Offer,
            Message::Download(_) => MessageType::Download,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Error(_) => MessageType::Error,
            Message::FileListReq(_) => MessageType::FileListReq,
            Message::FileListResp(_) => MessageType::FileListResp,
            Message::MetadataReq(_) => MessageType::MetadataReq,
            Message::MetadataResp(_) => MessageType::MetadataResp,
            Message::Have(_) => MessageType::Have,
            Message::Bitfield(_) => MessageType::Bitfield,
            Message::BitfieldReq(_) => MessageType::BitfieldReq,
            Message::SubtreeReq(_) => MessageType::SubtreeReq,
        }
    }

    /// Serialize to the JSON bytes carried as a frame payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (infallible in practice for
    /// these payload types, but plumbed through for symmetry with decode).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(match self {
            Message::Request(p) => serde_json::to_vec(p)?,
            Message::Offer(p) => serde_json::to_vec(p)?,
            Message::Download(p) => serde_json::to_vec(p)?,
            Message::Cancel(p) => serde_json::to_vec(p)?,
            Message::Error(p) => serde_json::to_vec(p)?,
            Message::FileListReq(p) => serde_json::to_vec(p)?,
            Message::FileListResp(p) => serde_json::to_vec(p)?,
            Message::MetadataReq(p) => serde_json::to_vec(p)?,
            Message::MetadataResp(p) => serde_json::to_vec(p)?,
            Message::Have(p) => serde_json::to_vec(p)?,
            Message::Bitfield(p) => serde_json::to_vec(p)?,
            Message::BitfieldReq(p) => serde_json::to_vec(p)?,
            Message::SubtreeReq(p) => serde_json::to_vec(p)?,
        })
    }

    /// Decode a message given its type tag and payload bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON payload does not match the expected
    /// shape for `msg_type`.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match msg_type {
            MessageType::Request => Message::Request(serde_json::from_slice(payload)?),
            MessageType::Offer => Message::Offer(serde_json::from_slice(payload)?),
            MessageType::Download => Message::Download(serde_json::from_slice(payload)?),
            MessageType::Cancel => Message::Cancel(serde_json::from_slice(payload)?),
            MessageType::Error => Message::Error(serde_json::from_slice(payload)?),
            MessageType::FileListReq => Message::FileListReq(serde_json::from_slice(payload)?),
            MessageType::FileListResp => Message::FileListResp(serde_json::from_slice(payload)?),
            MessageType::MetadataReq => Message::MetadataReq(serde_json::from_slice(payload)?),
            MessageType::MetadataResp => Message::MetadataResp(serde_json::from_slice(payload)?),
            MessageType::Have => Message::Have(serde_json::from_slice(payload)?),
            MessageType::Bitfield => Message::Bitfield(serde_json::from_slice(payload)?),
            MessageType::BitfieldReq => Message::BitfieldReq(serde_json::from_slice(payload)?),
            MessageType::SubtreeReq => Message::SubtreeReq(serde_json::from_slice(payload)?),
            MessageType::ChunkData | MessageType::SubtreeData => {
                return Err(ProtocolError::InvalidArgument(
                    "binary message types are not JSON-decoded".into(),
                ));
            }
        })
    }
}

/// Magic byte prefixing both binary payload kinds (§4.4, §6).
pub const BINARY_MAGIC: u8 = 0x01;

/// Fixed header size of a binary payload: magic(1) + request_id(16) + hash/root(32).
pub const BINARY_HEADER_SIZE: usize = 1 + 16 + 32;

/// A decoded `CHUNK_DATA` binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDataPayload {
    /// Request id this data responds to.
    pub request_id: RequestId,
    /// Content hash of the chunk being delivered.
    pub chunk_hash: [u8; 32],
    /// Raw chunk bytes.
    pub data: Vec<u8>,
}

impl ChunkDataPayload {
    /// Pack into the binary wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BINARY_HEADER_SIZE + self.data.len());
        out.push(BINARY_MAGIC);
        out.extend_from_slice(&self.request_id.0);
        out.extend_from_slice(&self.chunk_hash);
        out.extend_from_slice(&self.data);
        out
    }

    /// Unpack from the binary wire format.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BinaryPayloadTooShort`] or
    /// [`ProtocolError::BadMagic`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < BINARY_HEADER_SIZE {
            return Err(ProtocolError::BinaryPayloadTooShort);
        }
        if bytes[0] != BINARY_MAGIC {
            return Err(ProtocolError::BadMagic(bytes[0]));
        }
        let request_id: [u8; 16] = bytes[1..17].try_into().expect("slice is 16 bytes");
        let chunk_hash: [u8; 32] = bytes[17..49].try_into().expect("slice is 32 bytes");
        Ok(Self {
            request_id: RequestId(request_id),
            chunk_hash,
            data: bytes[BINARY_HEADER_SIZE..].to_vec(),
        })
    }
}

/// A decoded `SUBTREE_DATA` binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeDataPayload {
    /// Request id this data responds to.
    pub request_id: RequestId,
    /// Merkle root of the file the subtree belongs to.
    pub merkle_root: [u8; 32],
    /// Concatenated raw bytes of every chunk in the requested run, in
    /// chunk-index order. The receiver splits this at known chunk
    /// boundaries using the metadata it already holds.
    pub data: Vec<u8>,
}

impl SubtreeDataPayload {
    /// Pack into the binary wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BINARY_HEADER_SIZE + self.data.len());
        out.push(BINARY_MAGIC);
        out.extend_from_slice(&self.request_id.0);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.data);
        out
    }

    /// Unpack from the binary wire format.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BinaryPayloadTooShort`] or
    /// [`ProtocolError::BadMagic`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < BINARY_HEADER_SIZE {
            return Err(ProtocolError::BinaryPayloadTooShort);
        }
        if bytes[0] != BINARY_MAGIC {
            return Err(ProtocolError::BadMagic(bytes[0]));
        }
        let request_id: [u8; 16] = bytes[1..17].try_into().expect("slice is 16 bytes");
        let merkle_root: [u8; 32] = bytes[17..49].try_into().expect("slice is 32 bytes");
        Ok(Self {
            request_id: RequestId(request_id),
            merkle_root,
            data: bytes[BINARY_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Encode a 32-byte hash as the hex string used by structured-text payloads.
#[must_use]
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    to_hex(hash)
}

/// Decode a hex string into a 32-byte hash.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidArgument`] if `s` is not 64 hex chars.
pub fn hash_from_hex(s: &str) -> Result<[u8; 32], ProtocolError> {
    from_hex(s)
}

/// Encode a 16-byte request id as hex.
#[must_use]
pub fn request_id_to_hex(id: &RequestId) -> String {
    hex::encode(id.0)
}

/// Decode a hex request id.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidArgument`] if `s` is not 32 hex chars.
pub fn request_id_from_hex(s: &str) -> Result<RequestId, ProtocolError> {
    Ok(RequestId(from_hex(s)?))
}

/// Render a [`PeerId`] for log messages; not part of the wire format.
#[must_use]
pub fn peer_id_hex(peer: &PeerId) -> String {
    hex::encode(peer.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips_through_its_byte() {
        for code in 0x01u8..=0x0f {
            if code == MessageType::ChunkData as u8 || code == MessageType::SubtreeData as u8 {
                continue;
            }
            let mt = MessageType::try_from(code).unwrap();
            assert_eq!(mt as u8, code);
        }
    }

    #[test]
    fn unknown_message_type_byte_errors() {
        assert!(matches!(
            MessageType::try_from(0xff),
            Err(ProtocolError::UnknownMessageType(0xff))
        ));
    }

    #[test]
    fn request_payload_round_trips_through_json() {
        let msg = Message::Request(RequestPayload {
            request_id: request_id_to_hex(&RequestId::random()),
            chunk_hash: hash_to_hex(&[7u8; 32]),
            topic_key: hash_to_hex(&[9u8; 32]),
        });
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(MessageType::Request, &bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn chunk_data_binary_round_trips() {
        let payload = ChunkDataPayload {
            request_id: RequestId([3u8; 16]),
            chunk_hash: [5u8; 32],
            data: b"hello chunk".to_vec(),
        };
        let bytes = payload.encode();
        assert_eq!(bytes[0], BINARY_MAGIC);
        let decoded = ChunkDataPayload::decode(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn chunk_data_rejects_bad_magic() {
        let mut bytes = ChunkDataPayload {
            request_id: RequestId([1u8; 16]),
            chunk_hash: [2u8; 32],
            data: vec![9],
        }
        .encode();
        bytes[0] = 0x42;
        assert!(matches!(
            ChunkDataPayload::decode(&bytes),
            Err(ProtocolError::BadMagic(0x42))
        ));
    }

    #[test]
    fn chunk_data_rejects_short_payload() {
        assert!(matches!(
            ChunkDataPayload::decode(&[0x01, 0x02]),
            Err(ProtocolError::BinaryPayloadTooShort)
        ));
    }

    #[test]
    fn subtree_data_binary_round_trips() {
        let payload = SubtreeDataPayload {
            request_id: RequestId([4u8; 16]),
            merkle_root: [6u8; 32],
            data: vec![1, 2, 3, 4, 5],
        };
        let bytes = payload.encode();
        let decoded = SubtreeDataPayload::decode(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn hash_hex_round_trips() {
        let hash = [42u8; 32];
        assert_eq!(hash_from_hex(&hash_to_hex(&hash)).unwrap(), hash);
    }

    #[test]
    fn bad_hex_length_is_invalid_argument() {
        assert!(matches!(
            hash_from_hex("deadbeef"),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }
}
