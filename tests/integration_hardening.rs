//! Hardening tests: malformed input, double-locking, and tamper
//! detection across crate boundaries.

use swarmfs_files::bitfield::{Bitfield, BitfieldError};
use swarmfs_files::merkle::{verify_leaf_proof, MerkleTree};
use swarmfs_protocol::frame::{encode_frame, ReassemblyBuffer, ATOMIC_WRITE_CAP, FRAME_HEADER_SIZE};
use swarmfs_protocol::message::MessageType;
use swarmfs_store::DataDir;

#[test]
fn second_open_of_a_locked_data_dir_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let first = DataDir::open(dir.path()).unwrap();

    let err = DataDir::open(dir.path()).unwrap_err();
    assert!(matches!(err, swarmfs_store::StoreError::AlreadyLocked));

    drop(first);
    // Once the first handle drops its lock file, a second open succeeds.
    let _second = DataDir::open(dir.path()).unwrap();
}

#[test]
fn a_frame_header_claiming_an_oversized_payload_is_rejected() {
    let mut buf = ReassemblyBuffer::new();
    let mut header = Vec::with_capacity(FRAME_HEADER_SIZE);
    header.push(1); // protocol version
    header.push(MessageType::Have as u8);
    header.extend_from_slice(&((ATOMIC_WRITE_CAP as u32) + 1).to_be_bytes());
    buf.push(&header);

    let err = buf.next_frame().unwrap_err();
    assert!(matches!(err, swarmfs_protocol::error::ProtocolError::PayloadTooLarge(_)));
}

#[test]
fn a_frame_with_an_unknown_version_byte_is_rejected_but_the_buffer_resyncs() {
    let mut frame = encode_frame(MessageType::Have, b"payload");
    frame[0] = 99; // no peer speaks protocol version 99
    let mut buf = ReassemblyBuffer::new();
    buf.push(&frame);

    let err = buf.next_frame().unwrap_err();
    assert!(matches!(err, swarmfs_protocol::error::ProtocolError::VersionMismatch(99)));
    // The malformed frame's bytes were still consumed; the next push
    // starts a clean frame.
    let good = encode_frame(MessageType::Have, b"ok");
    buf.push(&good);
    let (_header, payload) = buf.next_frame().unwrap().unwrap();
    assert_eq!(payload, b"ok");
}

#[test]
fn truncated_bitfield_wire_payload_is_rejected() {
    let mut bitfield = Bitfield::new(40);
    bitfield.set(3).unwrap();
    let mut encoded = bitfield.to_base64();
    // Corrupt the payload so the declared size no longer matches the
    // byte count it decodes to.
    encoded.truncate(encoded.len() - 4);

    let err = Bitfield::from_base64(&encoded).unwrap_err();
    assert_eq!(err, BitfieldError::InvalidEncoding);
}

#[test]
fn a_leaf_proof_with_a_flipped_sibling_hash_fails_verification() {
    let leaves: Vec<[u8; 32]> = (0..5u8).map(|i| swarmfs_files::hash(&[i])).collect();
    let tree = MerkleTree::from_leaves(leaves.clone());
    let mut proof = tree.prove_leaf(1).unwrap();

    // Flip a bit in the first sibling hash.
    proof.steps[0].sibling[0] ^= 0x01;

    let root = tree.root();
    assert!(!verify_leaf_proof(leaves[1], 1, leaves.len(), &proof, &root).unwrap());
}

#[test]
fn a_leaf_proof_replayed_against_the_wrong_leaf_fails_verification() {
    let leaves: Vec<[u8; 32]> = (0..6u8).map(|i| swarmfs_files::hash(&[i])).collect();
    let tree = MerkleTree::from_leaves(leaves.clone());
    let proof = tree.prove_leaf(2).unwrap();
    let root = tree.root();

    assert!(verify_leaf_proof(leaves[2], 2, leaves.len(), &proof, &root).unwrap());
    assert!(!verify_leaf_proof(leaves[3], 3, leaves.len(), &proof, &root).unwrap());
}
