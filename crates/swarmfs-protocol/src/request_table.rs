//! In-flight request tables (§4.4).
//!
//! Each table is keyed by [`RequestId`] and kept separately per message
//! kind, following `node::session_manager`'s table-of-maps-with-timers
//! pattern. Entries are removed on completion, cancellation, or timeout; a
//! background sweeper discards anything older than 60 s every 30 s.

use crate::message::RequestId;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use swarmfs_transport::PeerId;

/// Default per-request timeout before the sweeper reclaims it (§4.4).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an entry may sit in a table before the sweeper discards it,
/// regardless of its own declared timeout.
pub const SWEEP_MAX_AGE: Duration = Duration::from_secs(60);

/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A chunk-level `REQUEST` awaiting offers and/or data.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    /// The chunk being requested.
    pub chunk_hash: [u8; 32],
    /// Topic this request is scoped to.
    pub topic_key: [u8; 32],
    /// The peer the `REQUEST` was unicast to.
    pub requested_peer: PeerId,
    /// Peers that have offered this chunk so far.
    pub offers: Vec<PeerId>,
    /// When the request was issued.
    pub started_at: Instant,
}

impl ActiveRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > SWEEP_MAX_AGE
    }
}

/// A chunk-level download in progress: an `OFFER` (or `DOWNLOAD`) has been
/// accepted and `CHUNK_DATA` is expected.
#[derive(Debug, Clone)]
pub struct ActiveDownload {
    /// The chunk hash being downloaded.
    pub chunk_hash: [u8; 32],
    /// The peer supplying the data.
    pub peer_id: PeerId,
    /// Declared size from the accepted offer.
    pub expected_size: u32,
    /// Bytes received so far (single-shot for `CHUNK_DATA`, so this is 0
    /// until the whole frame arrives).
    pub received_size: u32,
    /// When the download was accepted.
    pub started_at: Instant,
}

impl ActiveDownload {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > SWEEP_MAX_AGE
    }
}

/// An outstanding `FILE_LIST_REQ`.
#[derive(Debug, Clone)]
pub struct ActiveFileListRequest {
    /// Topic the listing was requested for.
    pub topic_key: [u8; 32],
    /// When the request was issued.
    pub started_at: Instant,
}

impl ActiveFileListRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > SWEEP_MAX_AGE
    }
}

/// An outstanding `METADATA_REQ`.
#[derive(Debug, Clone)]
pub struct ActiveMetadataRequest {
    /// Merkle root whose layout was requested.
    pub merkle_root: [u8; 32],
    /// When the request was issued.
    pub started_at: Instant,
}

impl ActiveMetadataRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > SWEEP_MAX_AGE
    }
}

/// An outstanding `SUBTREE_REQ`.
#[derive(Debug, Clone)]
pub struct ActiveSubtreeRequest {
    /// Merkle root of the file.
    pub merkle_root: [u8; 32],
    /// First chunk index of the requested run.
    pub start_chunk: u64,
    /// Number of chunks in the requested run.
    pub chunk_count: u32,
    /// The peer the request was sent to.
    pub peer_id: PeerId,
    /// When the request was issued.
    pub started_at: Instant,
}

impl ActiveSubtreeRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > SWEEP_MAX_AGE
    }
}

/// How many entries the sweeper discarded from each table in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired `REQUEST` entries discarded.
    pub requests: usize,
    /// Expired `CHUNK_DATA` downloads discarded.
    pub downloads: usize,
    /// Expired `FILE_LIST_REQ` entries discarded.
    pub file_list_requests: usize,
    /// Expired `METADATA_REQ` entries discarded.
    pub metadata_requests: usize,
    /// Expired `SUBTREE_REQ` entries discarded.
    pub subtree_requests: usize,
}

impl SweepReport {
    /// Total entries discarded across every table.
    #[must_use]
    pub fn total(&self) -> usize {
        self.requests + self.downloads + self.file_list_requests + self.metadata_requests + self.subtree_requests
    }
}

/// The full set of in-flight tables owned by one [`crate::dispatch::Protocol`]
/// instance (§4.4, §5 "In-flight tables: owned by the protocol instance; no
/// external mutation").
#[derive(Debug, Default)]
pub struct RequestTables {
    /// `active_requests[request_id]`.
    pub requests: DashMap<RequestId, ActiveRequest>,
    /// `active_downloads[request_id]`.
    pub downloads: DashMap<RequestId, ActiveDownload>,
    /// `active_file_list_requests[request_id]`.
    pub file_list_requests: DashMap<RequestId, ActiveFileListRequest>,
    /// `active_metadata_requests[request_id]`.
    pub metadata_requests: DashMap<RequestId, ActiveMetadataRequest>,
    /// `active_subtree_requests[request_id]`.
    pub subtree_requests: DashMap<RequestId, ActiveSubtreeRequest>,
}

impl RequestTables {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, currently-unused request id (§8 invariant 7: no id
    /// is reused while its original is live in any table).
    #[must_use]
    pub fn fresh_request_id(&self) -> RequestId {
        loop {
            let candidate = RequestId::random();
            if !self.is_live(&candidate) {
                return candidate;
            }
        }
    }

    fn is_live(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
            || self.downloads.contains_key(id)
            || self.file_list_requests.contains_key(id)
            || self.metadata_requests.contains_key(id)
            || self.subtree_requests.contains_key(id)
    }

    /// Discard every entry older than [`SWEEP_MAX_AGE`] across all tables.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        self.requests.retain(|_, v| {
            let keep = !v.is_expired(now);
            if !keep {
                report.requests += 1;
            }
            keep
        });
        self.downloads.retain(|_, v| {
            let keep = !v.is_expired(now);
            if !keep {
                report.downloads += 1;
            }
            keep
        });
        self.file_list_requests.retain(|_, v| {
            let keep = !v.is_expired(now);
            if !keep {
                report.file_list_requests += 1;
            }
            keep
        });
        self.metadata_requests.retain(|_, v| {
            let keep = !v.is_expired(now);
            if !keep {
                report.metadata_requests += 1;
            }
            keep
        });
        self.subtree_requests.retain(|_, v| {
            let keep = !v.is_expired(now);
            if !keep {
                report.subtree_requests += 1;
            }
            keep
        });

        report
    }

    /// Remove every table entry associated with `peer_id`, returning the
    /// request ids that were cancelled so the caller can force their
    /// timers to fire immediately (§4.6 banning, §7 TransportError).
    #[must_use]
    pub fn evict_peer(&self, peer_id: PeerId) -> Vec<RequestId> {
        let mut evicted = Vec::new();

        self.requests.retain(|id, v| {
            if v.requested_peer == peer_id {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        self.downloads.retain(|id, v| {
            if v.peer_id == peer_id {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        self.subtree_requests.retain(|id, v| {
            if v.peer_id == peer_id {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        for mut entry in self.requests.iter_mut() {
            entry.offers.retain(|p| *p != peer_id);
        }

        evicted
    }
}
