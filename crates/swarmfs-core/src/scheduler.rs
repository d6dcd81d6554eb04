//! Chunk scheduler: rarest-first selection with an endgame fallback
//! (§4.5 scheduling pieces).
//!
//! Owns no state of its own — the session holds the authoritative
//! `ChunkState` map and calls into the scheduler each loop iteration, the
//! same separation `node::transfer_manager` draws between its transfer
//! accounting and `node::multi_peer`'s peer bookkeeping.

use crate::config::TransferConfig;
use crate::peer_manager::PeerManager;

/// One chunk's state within a download session (§3, §4.5 state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Not yet requested from anyone.
    Missing,
    /// A request is outstanding.
    Requested,
    /// Bytes arrived but have not yet been hashed/verified.
    Received,
    /// Hash (and, for subtrees, proof) verified; terminal.
    Verified,
    /// Verification failed, or the request timed out/was cancelled;
    /// eligible for another request.
    Failed,
}

/// Result of one normal-mode scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Chunk indices selected for a new request this pass, rarest-first,
    /// capped at the slots the caller offered.
    pub picks: Vec<u64>,
    /// Total chunks still needing a request (`Missing` or `Failed`).
    pub missing: usize,
    /// Of those, how many have zero known holders (§4.5 stuck-swarm
    /// heuristic: sleep 5 s when `missing > 0 && unavailable == missing`).
    pub unavailable: usize,
}

/// Rarest-first / endgame chunk selection.
pub struct Scheduler {
    config: TransferConfig,
}

impl Scheduler {
    /// Construct a scheduler using `config`'s endgame thresholds.
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Whether the session should be in endgame: `verified / total ≥
    /// endgame_fraction` or `total - verified ≤ endgame_remaining_threshold`.
    #[must_use]
    pub fn is_endgame(&self, verified: u64, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        let remaining = total - verified;
        let fraction = verified as f64 / total as f64;
        fraction >= self.config.endgame_fraction || remaining <= self.config.endgame_remaining_threshold
    }

    /// Select up to `slots` chunks to request this pass, rarest-first
    /// among chunks with at least one known holder. Chunks with zero
    /// known holders are counted in `unavailable` but never selected —
    /// there is nobody to ask.
    #[must_use]
    pub fn select(&self, states: &[ChunkState], peer_manager: &PeerManager, slots: usize) -> SchedulerReport {
        let mut needing: Vec<(u64, usize)> = Vec::new();
        let mut unavailable = 0usize;

        for (index, state) in states.iter().enumerate() {
            if !matches!(state, ChunkState::Missing | ChunkState::Failed) {
                continue;
            }
            let count = peer_manager.availability_count(index as u64);
            if count == 0 {
                unavailable += 1;
            } else {
                needing.push((index as u64, count));
            }
        }

        let missing = needing.len() + unavailable;
        needing.sort_by_key(|(_, count)| *count);
        let picks = needing.into_iter().take(slots).map(|(idx, _)| idx).collect();

        SchedulerReport {
            picks,
            missing,
            unavailable,
        }
    }

    /// Every chunk index not yet `Verified`, for endgame parallel
    /// requesting (§4.5 Endgame).
    #[must_use]
    pub fn endgame_targets(&self, states: &[ChunkState]) -> Vec<u64> {
        states
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, ChunkState::Verified))
            .map(|(i, _)| i as u64)
            .collect()
    }
}
