//! Advanced peer-manager and scheduler scenarios that are easiest to
//! drive directly against their public APIs rather than through a full
//! swarm, because they depend on outcomes (failures, timeouts, subtree
//! overflow) that a well-behaved [`LoopbackTransport`] peer never
//! produces on its own.

use swarmfs_core::config::PeerConfig;
use swarmfs_core::{ChunkState, PeerManager, Scheduler};
use swarmfs_files::Bitfield;
use swarmfs_transport::PeerId;

fn peer(b: u8) -> PeerId {
    PeerId([b; 32])
}

// S5 — hash-mismatch penalty: a peer that keeps failing verification
// crosses the banning threshold and stops being offered as a candidate.
#[test]
fn repeatedly_failing_peer_is_banned_and_dropped_from_candidates() {
    let config = PeerConfig {
        ban_min_outcomes: 4,
        ban_success_rate_floor: 0.5,
        ..PeerConfig::default()
    };
    let manager = PeerManager::new(config);
    manager.add_peer(peer(1));

    let mut bitfield = Bitfield::new(8);
    bitfield.set(0).unwrap();
    manager.set_bitfield(peer(1), bitfield);
    assert!(manager.candidates_for(0).contains(&peer(1)));

    for _ in 0..4 {
        manager.begin_request(peer(1));
        manager.record_failure(peer(1));
    }

    assert!(manager.is_banned(peer(1)));
    assert!(!manager.candidates_for(0).contains(&peer(1)));
}

#[test]
fn timeouts_alone_can_trigger_a_ban_without_enough_outcomes() {
    let config = PeerConfig {
        ban_timeout_threshold: 2,
        ..PeerConfig::default()
    };
    let manager = PeerManager::new(config);
    manager.add_peer(peer(2));

    for _ in 0..3 {
        manager.begin_request(peer(2));
        manager.record_timeout(peer(2));
    }

    assert!(manager.is_banned(peer(2)));
}

#[test]
fn a_fresh_peer_with_no_outcomes_is_never_banned() {
    let manager = PeerManager::new(PeerConfig::default());
    manager.add_peer(peer(3));
    assert!(!manager.is_banned(peer(3)));
    assert_eq!(manager.info(peer(3)).unwrap().success_rate(), 1.0);
}

// Scheduler rarest-first selection should prefer chunks with fewer
// available holders, and switch into endgame once the configured
// threshold is crossed.
#[test]
fn scheduler_prefers_the_rarest_available_chunk() {
    let manager = PeerManager::new(PeerConfig::default());
    manager.add_peer(peer(1));
    manager.add_peer(peer(2));

    let mut common = Bitfield::new(2);
    common.set(0).unwrap();
    common.set(1).unwrap();
    manager.set_bitfield(peer(1), common);

    let mut rare = Bitfield::new(2);
    rare.set(1).unwrap();
    manager.set_bitfield(peer(2), rare);

    let scheduler = Scheduler::new(swarmfs_core::config::TransferConfig::default());
    let states = vec![ChunkState::Missing, ChunkState::Missing];
    let report = scheduler.select(&states, &manager, 10);

    // Chunk 1 is rarer (one holder) than chunk 0 (two holders), so it
    // should be scheduled first.
    assert_eq!(report.picks.first().copied(), Some(1));
}

#[test]
fn scheduler_enters_endgame_once_verified_fraction_crosses_threshold() {
    let config = swarmfs_core::config::TransferConfig {
        endgame_fraction: 0.5,
        endgame_remaining_threshold: 1000,
        ..swarmfs_core::config::TransferConfig::default()
    };
    let scheduler = Scheduler::new(config);
    assert!(!scheduler.is_endgame(4, 10));
    assert!(scheduler.is_endgame(6, 10));
}

// S6 — subtree overflow: a target subtree byte count that exceeds a
// sender's atomic-write cap must be halved, repeatedly, down to a size
// that fits.
#[test]
fn subtree_chunk_count_halves_until_it_fits_the_atomic_write_cap() {
    let chunk_size = 1024 * 1024u64; // 1 MiB
    let cap = swarmfs_core::session::max_subtree_chunks_for_cap(chunk_size);
    // atomic write cap is 16 MiB - 1, so at most 15 whole 1 MiB chunks
    // fit, rounded down to the nearest power of two.
    assert_eq!(cap, 8);

    let mut subtree_chunk_count = 64u32;
    let mut halvings = 0;
    while subtree_chunk_count > cap {
        subtree_chunk_count /= 2;
        halvings += 1;
    }
    assert_eq!(subtree_chunk_count, 16);
    assert_eq!(halvings, 2);

    // One more halving reaches the cap-respecting size.
    subtree_chunk_count /= 2;
    assert_eq!(subtree_chunk_count, 8);
    assert!(subtree_chunk_count <= cap);
}
