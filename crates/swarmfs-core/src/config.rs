//! Core engine configuration.
//!
//! One struct per subsystem, each independently constructible with a sane
//! `Default`, composed into a single [`NodeConfig`]. Loaded from an
//! optional TOML file by `swarmfs-cli`; every field has a sane default so
//! the file is never required.

use std::time::Duration;

/// Top-level configuration for a SwarmFS node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Download session behavior.
    pub transfer: TransferConfig,
    /// Peer manager behavior.
    pub peer: PeerConfig,
    /// Metadata store location.
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            peer: PeerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Download session tuning (§4.5).
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Default chunk size for newly-hashed files.
    pub chunk_size: u64,
    /// Maximum outstanding chunk requests per session (§4.5 default 50).
    pub max_concurrent: usize,
    /// Download-loop tick when no event arrives (§4.5: 10 ms).
    pub tick_interval: Duration,
    /// Sleep before retrying when every missing chunk is unavailable
    /// (§4.5 stuck-swarm heuristic: 5 s).
    pub stuck_retry_interval: Duration,
    /// Target subtree byte count before clamping to the atomic-write cap
    /// and rounding down to a power of two (§4.5 subtree sizing).
    pub target_subtree_bytes: u64,
    /// Endgame trigger: fraction of chunks verified (§4.5: 0.95).
    pub endgame_fraction: f64,
    /// Endgame trigger: remaining-chunk count (§4.5: 20).
    pub endgame_remaining_threshold: u64,
    /// Accept an empty subtree proof as valid for backward compatibility
    /// with peers that omit `merkleProof`. Defaults to `false` — hardened
    /// behavior rejects them instead.
    pub accept_empty_subtree_proof: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: swarmfs_files::DEFAULT_CHUNK_SIZE,
            max_concurrent: 50,
            tick_interval: Duration::from_millis(10),
            stuck_retry_interval: Duration::from_secs(5),
            target_subtree_bytes: 64 * 1024 * 1024,
            endgame_fraction: 0.95,
            endgame_remaining_threshold: 20,
            accept_empty_subtree_proof: false,
        }
    }
}

/// Peer manager tuning (§4.6).
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Default per-peer concurrent-request cap.
    pub default_max_concurrent: usize,
    /// EWMA smoothing factor for throughput samples (§4.6: 0.3).
    pub speed_ewma_alpha: f64,
    /// Minimum recorded outcomes before the banning check applies (§4.6: 10).
    pub ban_min_outcomes: u32,
    /// Success-rate floor below which a peer with enough outcomes is
    /// banned (§4.6: 50%).
    pub ban_success_rate_floor: f64,
    /// Timeout count above which a peer is banned regardless of success
    /// rate (§4.6: 5).
    pub ban_timeout_threshold: u32,
    /// Number of top-scoring peer candidates to randomize among when
    /// picking a peer for a chunk (§4.6: top 3).
    pub peer_selection_pool: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: 8,
            speed_ewma_alpha: 0.3,
            ban_min_outcomes: 10,
            ban_success_rate_floor: 0.5,
            ban_timeout_threshold: 5,
            peer_selection_pool: 3,
        }
    }
}

/// Metadata store location (§4.3, §6).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Data directory root, containing `swarmfs.db`, the lock file, and
    /// the IPC socket/pipe.
    pub data_dir: std::path::PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: std::path::PathBuf::from("."),
        }
    }
}
