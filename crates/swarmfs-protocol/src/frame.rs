//! Frame encoding, decoding, and per-peer reassembly.
//!
//! A flat, transport-agnostic header —
//! `version:u8 | type:u8 | length:u32_be | payload` — since encryption
//! and stream framing below that are delegated to the transport.

use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes: version (1) + type (1) + length (4).
pub const FRAME_HEADER_SIZE: usize = 6;

/// The protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// A single logical message must not exceed this many payload bytes —
/// matches common secure-stream frame ceilings (§4.4).
pub const ATOMIC_WRITE_CAP: usize = 16 * 1024 * 1024 - 1;

/// A parsed frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Protocol version the sender claims to speak.
    pub version: u8,
    /// Message type byte, already validated against [`MessageType`].
    pub msg_type: MessageType,
    /// Declared payload length in bytes.
    pub length: u32,
}

/// Encode a complete frame: header plus payload bytes.
#[must_use]
pub fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.push(PROTOCOL_VERSION);
    out.push(msg_type as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reassembles whole frames out of arbitrarily-sized byte fragments
/// delivered by the transport. One instance is kept per peer connection.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
}

impl ReassemblyBuffer {
    /// Create an empty reassembly buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append newly-received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next whole frame, if one has fully arrived.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A frame whose
    /// declared length exceeds the atomic-write cap is rejected (and the
    /// buffer is cleared, since the stream can no longer be trusted to
    /// resynchronize). An unknown version or message type still consumes
    /// the frame's bytes before returning the error, so the buffer stays
    /// aligned for the next frame.
    ///
    /// # Errors
    ///
    /// See [`ProtocolError`] variants.
    pub fn next_frame(&mut self) -> Result<Option<(FrameHeader, Vec<u8>)>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if length > ATOMIC_WRITE_CAP {
            self.buf.clear();
            return Err(ProtocolError::PayloadTooLarge(length));
        }

        let total = FRAME_HEADER_SIZE + length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let version = self.buf[0];
        let type_byte = self.buf[1];
        let payload = self.buf[FRAME_HEADER_SIZE..total].to_vec();
        self.buf.drain(0..total);

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        let msg_type = MessageType::try_from(type_byte)?;

        Ok(Some((
            FrameHeader {
                version,
                msg_type,
                length: length as u32,
            },
            payload,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_a_single_fragment_frame() {
        let frame = encode_frame(MessageType::Have, b"hi");
        let mut buf = ReassemblyBuffer::new();
        buf.push(&frame);

        let (header, payload) = buf.next_frame().unwrap().unwrap();
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert!(matches!(header.msg_type, MessageType::Have));
        assert_eq!(payload, b"hi");
        assert!(buf.next_frame().unwrap().is_none());
    }

    #[test]
    fn reassembles_across_split_fragments() {
        let frame = encode_frame(MessageType::Cancel, b"abcdefgh");
        let mut buf = ReassemblyBuffer::new();
        buf.push(&frame[..3]);
        assert!(buf.next_frame().unwrap().is_none());
        buf.push(&frame[3..]);

        let (_, payload) = buf.next_frame().unwrap().unwrap();
        assert_eq!(payload, b"abcdefgh");
    }

    #[test]
    fn handles_two_frames_delivered_as_one_fragment() {
        let mut combined = encode_frame(MessageType::Have, b"one");
        combined.extend(encode_frame(MessageType::Have, b"two"));

        let mut buf = ReassemblyBuffer::new();
        buf.push(&combined);
        let (_, first) = buf.next_frame().unwrap().unwrap();
        let (_, second) = buf.next_frame().unwrap().unwrap();
        assert_eq!(first, b"one");
        assert_eq!(second, b"two");
    }

    #[test]
    fn version_mismatch_still_resyncs_the_buffer() {
        let mut bad_frame = encode_frame(MessageType::Have, b"oops");
        bad_frame[0] = 99;
        let mut good_frame = encode_frame(MessageType::Cancel, b"ok");
        let mut combined = bad_frame;
        combined.append(&mut good_frame);

        let mut buf = ReassemblyBuffer::new();
        buf.push(&combined);

        assert!(matches!(buf.next_frame(), Err(ProtocolError::VersionMismatch(99))));
        let (header, payload) = buf.next_frame().unwrap().unwrap();
        assert!(matches!(header.msg_type, MessageType::Cancel));
        assert_eq!(payload, b"ok");
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut buf = ReassemblyBuffer::new();
        let mut header = vec![PROTOCOL_VERSION, MessageType::Have as u8];
        header.extend_from_slice(&((ATOMIC_WRITE_CAP as u32) + 1).to_be_bytes());
        buf.push(&header);

        assert!(matches!(
            buf.next_frame(),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
