//! Peer manager: per-peer availability index, health scoring, and
//! concurrency caps (§4.6).
//!
//! Grounded in `node::multi_peer::PeerPerformance`'s EWMA throughput/RTT and
//! success/failure counters, and `node::health`'s threshold-based status
//! classification, reused here as the banning check.

use crate::config::PeerConfig;
use dashmap::{DashMap, DashSet};
use rand::seq::SliceRandom;
use swarmfs_files::Bitfield;
use swarmfs_transport::PeerId;

/// Per-peer bookkeeping the manager tracks across a session's lifetime.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's last-announced availability bitmap, if any.
    pub bitfield: Option<Bitfield>,
    /// Completed, hash-verified chunk deliveries.
    pub successful: u32,
    /// Deliveries that failed verification or were otherwise penalized.
    pub failed: u32,
    /// Requests that timed out waiting for a response.
    pub timeouts: u32,
    /// EWMA-smoothed throughput in MiB/s.
    pub avg_speed_mib_s: f64,
    /// Requests currently outstanding to this peer.
    pub active_requests: usize,
    /// Maximum concurrent requests this peer may be assigned.
    pub max_concurrent: usize,
}

impl PeerInfo {
    fn new(max_concurrent: usize) -> Self {
        Self {
            bitfield: None,
            successful: 0,
            failed: 0,
            timeouts: 0,
            avg_speed_mib_s: 0.0,
            active_requests: 0,
            max_concurrent,
        }
    }

    /// Total recorded outcomes (successes + failures), used for the
    /// banning minimum-sample-size gate.
    #[must_use]
    pub fn outcomes(&self) -> u32 {
        self.successful + self.failed
    }

    /// Fraction of recorded outcomes that succeeded; `1.0` with no
    /// outcomes yet, so a brand-new peer is not penalized before it has
    /// had a chance to deliver anything.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.outcomes();
        if total == 0 {
            1.0
        } else {
            f64::from(self.successful) / f64::from(total)
        }
    }

    /// `success_rate · (1 + min(avg_speed_MiB/s, 10)) · max(0, 1 − 0.1 ·
    /// timeouts)` (§4.6).
    #[must_use]
    pub fn score(&self) -> f64 {
        let speed_term = 1.0 + self.avg_speed_mib_s.min(10.0);
        let timeout_term = (1.0 - 0.1 * f64::from(self.timeouts)).max(0.0);
        self.success_rate() * speed_term * timeout_term
    }

    /// Whether this peer has crossed the banning threshold: at least
    /// `ban_min_outcomes` recorded outcomes with a success rate below
    /// `ban_success_rate_floor`, or more than `ban_timeout_threshold`
    /// timeouts.
    #[must_use]
    pub fn should_ban(&self, config: &PeerConfig) -> bool {
        (self.outcomes() >= config.ban_min_outcomes && self.success_rate() < config.ban_success_rate_floor)
            || self.timeouts > config.ban_timeout_threshold
    }

    fn has_capacity(&self) -> bool {
        self.active_requests < self.max_concurrent
    }
}

/// Tracks every known peer's availability and health for one download
/// session (§3 "the peer manager is owned by the session").
pub struct PeerManager {
    config: PeerConfig,
    peers: DashMap<PeerId, PeerInfo>,
    /// `chunk_index → set<peer_id>` (§4.6).
    availability: DashMap<u64, DashSet<PeerId>>,
    banned: DashSet<PeerId>,
}

impl PeerManager {
    /// Construct an empty peer manager.
    #[must_use]
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            availability: DashMap::new(),
            banned: DashSet::new(),
        }
    }

    /// Register a newly-connected peer, if not already known.
    pub fn add_peer(&self, peer_id: PeerId) {
        if self.banned.contains(&peer_id) {
            return;
        }
        self.peers
            .entry(peer_id)
            .or_insert_with(|| PeerInfo::new(self.config.default_max_concurrent));
    }

    /// Remove a peer entirely: drops it from every availability set and
    /// its own record. Returns whether it was known.
    pub fn remove_peer(&self, peer_id: PeerId) -> bool {
        for entry in self.availability.iter() {
            entry.value().remove(&peer_id);
        }
        self.peers.remove(&peer_id).is_some()
    }

    /// Replace a peer's full availability bitmap (`BITFIELD` message).
    pub fn set_bitfield(&self, peer_id: PeerId, bitfield: Bitfield) {
        for index in bitfield.set_indices() {
            self.availability
                .entry(index as u64)
                .or_default()
                .insert(peer_id);
        }
        self.add_peer(peer_id);
        if let Some(mut info) = self.peers.get_mut(&peer_id) {
            info.bitfield = Some(bitfield);
        }
    }

    /// Record a single newly-available chunk (`HAVE` message).
    pub fn mark_have(&self, peer_id: PeerId, chunk_index: u64) {
        self.add_peer(peer_id);
        self.availability.entry(chunk_index).or_default().insert(peer_id);
        if let Some(mut info) = self.peers.get_mut(&peer_id) {
            if let Some(bf) = info.bitfield.as_mut() {
                let _ = bf.set(chunk_index as usize);
            }
        }
    }

    /// Peers currently believed to hold `chunk_index`.
    #[must_use]
    pub fn candidates_for(&self, chunk_index: u64) -> Vec<PeerId> {
        self.availability
            .get(&chunk_index)
            .map(|set| set.iter().map(|p| *p).collect())
            .unwrap_or_default()
    }

    /// Number of distinct peers known to hold `chunk_index` — used by the
    /// scheduler's rarest-first ordering.
    #[must_use]
    pub fn availability_count(&self, chunk_index: u64) -> usize {
        self.availability.get(&chunk_index).map(|s| s.len()).unwrap_or(0)
    }

    /// Select a peer to serve `chunk_index`, given the set of currently
    /// connected peers to fall back to when nobody has advertised the
    /// chunk yet (§4.6 step 1). Restricts to peers under their concurrency
    /// cap, sorts by score, and picks uniformly among the top 3 (or fewer)
    /// to avoid convoying every request onto a single fast peer.
    #[must_use]
    pub fn select_peer(&self, chunk_index: u64, connected: &[PeerId]) -> Option<PeerId> {
        let mut cands = self.candidates_for(chunk_index);
        if cands.is_empty() {
            cands = connected.to_vec();
        }

        let mut scored: Vec<(PeerId, f64)> = cands
            .into_iter()
            .filter_map(|peer_id| {
                let info = self.peers.get(&peer_id)?;
                if !info.has_capacity() {
                    return None;
                }
                Some((peer_id, info.score()))
            })
            .collect();

        if scored.is_empty() {
            return None;
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let pool_size = self.config_pool_size().min(scored.len());
        let pool = &scored[..pool_size];
        pool.choose(&mut rand::thread_rng()).map(|(peer_id, _)| *peer_id)
    }

    fn config_pool_size(&self) -> usize {
        self.config.peer_selection_pool
    }

    /// Mark a request as dispatched to `peer_id`, incrementing its active
    /// count.
    pub fn begin_request(&self, peer_id: PeerId) {
        if let Some(mut info) = self.peers.get_mut(&peer_id) {
            info.active_requests += 1;
        }
    }

    /// Record a successful, hash-verified delivery: updates the EWMA
    /// throughput sample and the success counter, decrements in-flight.
    /// Returns `true` if this crossed the peer into banned territory.
    pub fn record_success(&self, peer_id: PeerId, bytes: u64, elapsed: std::time::Duration) -> bool {
        let mut info = match self.peers.get_mut(&peer_id) {
            Some(info) => info,
            None => return false,
        };
        info.successful += 1;
        info.active_requests = info.active_requests.saturating_sub(1);

        let secs = elapsed.as_secs_f64().max(0.001);
        let sample_mib_s = (bytes as f64 / (1024.0 * 1024.0)) / secs;
        let alpha = self.config.speed_ewma_alpha;
        info.avg_speed_mib_s = alpha * sample_mib_s + (1.0 - alpha) * info.avg_speed_mib_s;

        let banned = info.should_ban(&self.config);
        drop(info);
        if banned {
            self.ban(peer_id);
        }
        banned
    }

    /// Record a failed delivery (hash mismatch, proof failure, malformed
    /// data): `failed++`, decrements in-flight. Returns whether this
    /// banned the peer.
    pub fn record_failure(&self, peer_id: PeerId) -> bool {
        self.penalize(peer_id, |info| info.failed += 1)
    }

    /// Record a request timeout: `timeouts++`, decrements in-flight.
    /// Returns whether this banned the peer.
    pub fn record_timeout(&self, peer_id: PeerId) -> bool {
        self.penalize(peer_id, |info| info.timeouts += 1)
    }

    fn penalize(&self, peer_id: PeerId, apply: impl FnOnce(&mut PeerInfo)) -> bool {
        let mut info = match self.peers.get_mut(&peer_id) {
            Some(info) => info,
            None => return false,
        };
        apply(&mut info);
        info.active_requests = info.active_requests.saturating_sub(1);
        let banned = info.should_ban(&self.config);
        drop(info);
        if banned {
            self.ban(peer_id);
        }
        banned
    }

    /// Evict `peer_id` from every availability set and its own record,
    /// and remember it as banned so it is never re-added this session.
    pub fn ban(&self, peer_id: PeerId) {
        self.remove_peer(peer_id);
        self.banned.insert(peer_id);
    }

    /// Whether `peer_id` has been banned this session. The session checks
    /// the `bool` returned by `record_failure`/`record_timeout` and, when
    /// it is `true`, voids every other pending request still addressed to
    /// that peer immediately (§4.6: a ban "forced its in-flight requests
    /// to timeout immediately so the session reschedules") rather than
    /// waiting on the 30 s sweep.
    #[must_use]
    pub fn is_banned(&self, peer_id: PeerId) -> bool {
        self.banned.contains(&peer_id)
    }

    /// A read-only snapshot of one peer's info, for diagnostics.
    #[must_use]
    pub fn info(&self, peer_id: PeerId) -> Option<PeerInfo> {
        self.peers.get(&peer_id).map(|r| r.clone())
    }

    /// Every peer currently known to this manager (connected or
    /// advertised), for the session's fallback pool when nobody has
    /// announced a given chunk yet (§4.6 step 1).
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }
}
