//! Per-file download session: chunk request pipelining, peer selection,
//! timeouts, endgame, and on-disk assembly (§4.5).
//!
//! Grounded in `node::transfer`/`node::transfer_manager`'s per-transfer
//! state machine and `node::resume`'s rehash-on-restart flow, adapted so
//! that chunk *selection* belongs to [`crate::scheduler::Scheduler`] and
//! peer *assignment* to [`crate::peer_manager::PeerManager`] rather than to
//! the session itself — the session only pipelines requests and verifies
//! and writes whatever comes back.

use crate::config::NodeConfig;
use crate::error::{CoreError, Result};
use crate::peer_manager::PeerManager;
use crate::scheduler::{ChunkState, Scheduler};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use swarmfs_files::chunk::{chunk_offset, chunk_size_at};
use swarmfs_files::chunker::{hash_chunk_range, hash_file, ChunkWriter};
use swarmfs_files::merkle::{merkle_root, verify_subtree_proof, MerkleTree};
use swarmfs_files::{hash, Bitfield};
use swarmfs_protocol::frame::ATOMIC_WRITE_CAP;
use swarmfs_protocol::message::BINARY_HEADER_SIZE;
use swarmfs_protocol::request_table::REQUEST_TIMEOUT;
use swarmfs_protocol::{Protocol, ProtocolEvent, RequestId};
use swarmfs_store::{ChunkRow, Store};
use swarmfs_transport::{PeerId, TopicKey};
use tokio::sync::{broadcast, mpsc, Mutex};

/// Events a [`DownloadSession`] emits to whatever started it (a CLI
/// command, the node facade, an IPC subscriber).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chunk or subtree transitioned into `VERIFIED`.
    Progress {
        /// Verified chunks so far.
        verified: u64,
        /// Total chunks in the file.
        total: u64,
        /// Bytes written this session (excludes chunks recovered on resume).
        bytes_downloaded: u64,
    },
    /// The download finished and the recomputed root matched.
    Complete {
        /// The file's Merkle root.
        merkle_root: [u8; 32],
        /// Where it was written.
        path: PathBuf,
    },
    /// The session ended without completing (§7 Fatal, or cancellation).
    Error(CoreError),
}

#[derive(Debug, Clone, Copy)]
enum PendingKind {
    Chunk { chunk_index: u64 },
    Subtree { start_chunk: u64, chunk_count: u32 },
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    kind: PendingKind,
    peer_id: PeerId,
    started_at: Instant,
}

/// Per-file download state machine (§4.5). Exclusively owns the chunk-state
/// map and output file handle (§3 Ownership); owns its [`PeerManager`].
pub struct DownloadSession {
    config: crate::config::TransferConfig,
    store: Arc<Store>,
    protocol: Arc<Protocol>,
    peer_manager: Arc<PeerManager>,
    scheduler: Scheduler,
    topic_name: String,
    topic_key: TopicKey,
    merkle_root: [u8; 32],
    file_id: i64,
    file_size: u64,
    chunk_size: u64,
    chunk_count: u64,
    chunk_hashes: Vec<[u8; 32]>,
    tree: MerkleTree,
    output_path: PathBuf,
    writer: Mutex<ChunkWriter>,
    states: Mutex<Vec<ChunkState>>,
    bitfield: Mutex<Bitfield>,
    pending: DashMap<RequestId, PendingEntry>,
    endgame_dupes: DashMap<u64, Vec<RequestId>>,
    subtree_chunk_count: AtomicU32,
    in_flight: AtomicI64,
    verified: AtomicU64,
    bytes_downloaded: AtomicU64,
    cancelled: AtomicBool,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl DownloadSession {
    /// Run the startup sequence (§4.5 steps 1-4) and spawn the download
    /// loop, returning a handle plus the event stream it publishes to.
    ///
    /// `chunk_hashes` and `merkle_root` must already have been obtained
    /// (from a local file record or a `METADATA_RESP`) and are re-verified
    /// here against each other before anything is written to disk.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RootMismatch`] if `chunk_hashes` does not
    /// actually combine to `merkle_root`, or an I/O/store error from
    /// preallocating the output file or registering it.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: NodeConfig,
        store: Arc<Store>,
        protocol: Arc<Protocol>,
        events: broadcast::Receiver<ProtocolEvent>,
        topic_name: String,
        topic_key: TopicKey,
        merkle_root_expected: [u8; 32],
        file_size: u64,
        chunk_size: u64,
        chunk_hashes: Vec<[u8; 32]>,
        output_path: PathBuf,
        initial_peers: &[PeerId],
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>)> {
        if merkle_root(&chunk_hashes) != merkle_root_expected {
            return Err(CoreError::RootMismatch { first_mismatch: None });
        }
        let chunk_count = chunk_hashes.len() as u64;
        let tree = MerkleTree::from_leaves(chunk_hashes.clone());

        let now = now_unix();
        let file_id = store.upsert_file(&output_path, merkle_root_expected, file_size, chunk_size, chunk_count, now, 0)?;
        let rows: Vec<ChunkRow> = chunk_hashes
            .iter()
            .enumerate()
            .map(|(i, h)| ChunkRow {
                chunk_index: i as u64,
                offset: chunk_offset(i as u64, chunk_size),
                size: chunk_size_at(i as u64, file_size, chunk_size),
                hash: *h,
            })
            .collect();
        store.insert_chunks(file_id, &rows)?;
        store.upsert_incomplete_download(&topic_name, merkle_root_expected, &output_path, now)?;

        let writer = ChunkWriter::open(&output_path, file_size)?;

        // Resume path (§4.5 step 3, §8 S4): rehash every chunk range against
        // the already-known hash; whatever the output file already holds
        // from a prior run transitions straight to VERIFIED.
        let mut states = vec![ChunkState::Missing; chunk_count as usize];
        let mut bitfield = Bitfield::new(chunk_count as usize);
        for row in &rows {
            if let Ok(actual) = hash_chunk_range(&output_path, row.offset, row.size) {
                if actual == row.hash {
                    states[row.chunk_index as usize] = ChunkState::Verified;
                    let _ = bitfield.set(row.chunk_index as usize);
                }
            }
        }
        let verified_count = states.iter().filter(|s| matches!(s, ChunkState::Verified)).count() as u64;

        let peer_manager = Arc::new(PeerManager::new(config.peer.clone()));
        for peer_id in initial_peers {
            peer_manager.add_peer(*peer_id);
        }
        let scheduler = Scheduler::new(config.transfer.clone());
        let subtree_chunk_count = AtomicU32::new(initial_subtree_chunk_count(&config.transfer, chunk_size));

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            config: config.transfer.clone(),
            store,
            protocol,
            peer_manager,
            scheduler,
            topic_name,
            topic_key,
            merkle_root: merkle_root_expected,
            file_id,
            file_size,
            chunk_size,
            chunk_count,
            chunk_hashes,
            tree,
            output_path,
            writer: Mutex::new(writer),
            states: Mutex::new(states),
            bitfield: Mutex::new(bitfield),
            pending: DashMap::new(),
            endgame_dupes: DashMap::new(),
            subtree_chunk_count,
            in_flight: AtomicI64::new(0),
            verified: AtomicU64::new(verified_count),
            bytes_downloaded: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            events_tx,
        });

        // Bootstrap from existing connections: ask each for its bitmap.
        for peer_id in initial_peers {
            session.protocol.request_bitfield(session.topic_key, *peer_id);
        }

        let loop_session = Arc::clone(&session);
        tokio::spawn(async move { loop_session.run(events).await });

        Ok((session, events_rx))
    }

    /// Request the download loop stop at its next iteration. The partially
    /// written file is left on disk and the incomplete-download registry
    /// entry is retained so a later resume can continue (§4.5
    /// Cancellation).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Current progress snapshot, for polling callers (e.g. a CLI progress
    /// bar) that do not want to hold the event receiver themselves.
    #[must_use]
    pub fn progress(&self) -> (u64, u64, u64) {
        (
            self.verified.load(Ordering::SeqCst),
            self.chunk_count,
            self.bytes_downloaded.load(Ordering::SeqCst),
        )
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<ProtocolEvent>) {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                self.do_cancel().await;
                return;
            }
            if self.verified.load(Ordering::SeqCst) >= self.chunk_count {
                self.finalize().await;
                return;
            }

            self.sweep_timeouts().await;
            self.schedule().await;

            match tokio::time::timeout(self.config.tick_interval, events.recv()).await {
                Ok(Ok(event)) => self.handle_event(event).await,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    tracing::warn!(skipped = n, "download session event stream lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    let _ = self.events_tx.send(SessionEvent::Error(CoreError::Cancelled));
                    return;
                }
                Err(_elapsed) => {
                    // tick interval elapsed with no event; loop and reschedule
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------

    async fn schedule(&self) {
        let verified = self.verified.load(Ordering::SeqCst);
        if self.scheduler.is_endgame(verified, self.chunk_count) {
            self.schedule_endgame().await;
        }

        let in_flight = self.in_flight.load(Ordering::SeqCst).max(0) as usize;
        let slots = self.config.max_concurrent.saturating_sub(in_flight);
        if slots == 0 {
            return;
        }

        let states_snapshot = self.states.lock().await.clone();
        let report = self.scheduler.select(&states_snapshot, &self.peer_manager, slots);

        if report.missing > 0 && report.unavailable == report.missing {
            tokio::time::sleep(self.config.stuck_retry_interval).await;
            return;
        }

        let connected = self.peer_manager.connected_peers();
        let mut slots_left = slots;
        let mut covered = std::collections::HashSet::new();

        for idx in report.picks {
            if slots_left == 0 {
                break;
            }
            if covered.contains(&idx) {
                continue;
            }

            let n = self.subtree_chunk_count.load(Ordering::SeqCst).max(1);
            let aligned_start = idx - (idx % u64::from(n));
            let (start, count) = if n > 1 && aligned_start + u64::from(n) <= self.chunk_count {
                (aligned_start, n)
            } else {
                (idx, 1)
            };

            let run_is_requestable = {
                let states = self.states.lock().await;
                (start..start + u64::from(count)).all(|i| matches!(states[i as usize], ChunkState::Missing | ChunkState::Failed))
            };
            if !run_is_requestable {
                continue;
            }

            let Some(peer) = self.peer_manager.select_peer(start, &connected) else {
                continue;
            };

            {
                let mut states = self.states.lock().await;
                for i in start..start + u64::from(count) {
                    states[i as usize] = ChunkState::Requested;
                    covered.insert(i);
                }
            }

            let request_id = self.protocol.request_subtree(self.topic_key, peer, self.merkle_root, start, count);
            self.pending.insert(
                request_id,
                PendingEntry {
                    kind: PendingKind::Subtree { start_chunk: start, chunk_count: count },
                    peer_id: peer,
                    started_at: Instant::now(),
                },
            );
            self.peer_manager.begin_request(peer);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            slots_left -= 1;
        }
    }

    /// Endgame (§4.5): request every still-missing chunk from every
    /// candidate holder that does not already have an outstanding copy
    /// for it.
    async fn schedule_endgame(&self) {
        let states_snapshot = self.states.lock().await.clone();
        for idx in self.scheduler.endgame_targets(&states_snapshot) {
            let candidates = self.peer_manager.candidates_for(idx);
            if candidates.is_empty() {
                continue;
            }
            let already_requested: Vec<PeerId> = self
                .endgame_dupes
                .get(&idx)
                .map(|ids| ids.iter().filter_map(|id| self.pending.get(id).map(|e| e.peer_id)).collect())
                .unwrap_or_default();

            for peer in candidates {
                if already_requested.contains(&peer) {
                    continue;
                }
                let request_id = self.protocol.request_chunk(self.topic_key, peer, self.chunk_hashes[idx as usize]);
                self.pending.insert(
                    request_id,
                    PendingEntry {
                        kind: PendingKind::Chunk { chunk_index: idx },
                        peer_id: peer,
                        started_at: Instant::now(),
                    },
                );
                self.peer_manager.begin_request(peer);
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.endgame_dupes.entry(idx).or_default().push(request_id);
            }

            let mut states = self.states.lock().await;
            if matches!(states[idx as usize], ChunkState::Missing | ChunkState::Failed) {
                states[idx as usize] = ChunkState::Requested;
            }
        }
    }

    // -----------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------

    async fn handle_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::PeerConnected { peer_id, topic_key } if topic_key == self.topic_key => {
                self.peer_manager.add_peer(peer_id);
                self.protocol.request_bitfield(self.topic_key, peer_id);
            }
            ProtocolEvent::PeerDisconnected { peer_id, topic_key, evicted_requests } if topic_key == self.topic_key => {
                self.peer_manager.remove_peer(peer_id);
                for id in evicted_requests {
                    if let Some((_, entry)) = self.pending.remove(&id) {
                        self.in_flight.fetch_sub(1, Ordering::SeqCst);
                        self.void_pending(entry, false).await;
                    }
                }
            }
            ProtocolEvent::ChunkDownloaded { request_id, peer_id, data, .. } => {
                self.on_chunk_downloaded(request_id, peer_id, data).await;
            }
            ProtocolEvent::SubtreeDownloaded { request_id, peer_id, data, .. } => {
                self.on_subtree_downloaded(request_id, peer_id, data).await;
            }
            ProtocolEvent::Have { peer_id, chunk_index } => {
                self.peer_manager.mark_have(peer_id, chunk_index);
            }
            ProtocolEvent::BitfieldReceived { peer_id, bitfield } => {
                self.peer_manager.set_bitfield(peer_id, bitfield);
            }
            ProtocolEvent::BitfieldRequested { peer_id, .. } => {
                // The reference protocol does not thread a real topic key
                // through BITFIELD_REQ (see swarmfs_protocol::dispatch); a
                // session only ever runs one topic, so it answers
                // unconditionally.
                let bf = self.bitfield.lock().await.clone();
                self.protocol.send_bitfield(self.topic_key, peer_id, &bf);
            }
            ProtocolEvent::RemoteError { request_id: Some(id), reason } => {
                if let Some((_, entry)) = self.pending.remove(&id) {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    if reason == "overflow" {
                        if let PendingKind::Subtree { start_chunk, chunk_count } = entry.kind {
                            let _ = self.subtree_chunk_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n / 2).max(1)));
                            self.requeue_run(start_chunk, chunk_count).await;
                        }
                    } else {
                        self.void_pending(entry, true).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn void_pending(&self, entry: PendingEntry, penalize: bool) {
        match entry.kind {
            PendingKind::Chunk { chunk_index } => {
                self.mark_failed(chunk_index).await;
                if penalize && self.peer_manager.record_failure(entry.peer_id) {
                    self.evict_banned_peer(entry.peer_id).await;
                }
                if let Some(mut ids) = self.endgame_dupes.get_mut(&chunk_index) {
                    ids.retain(|_| true); // pruned lazily by cancel_endgame_duplicates / sweep
                }
            }
            PendingKind::Subtree { start_chunk, chunk_count } => {
                self.requeue_run(start_chunk, chunk_count).await;
                if penalize && self.peer_manager.record_failure(entry.peer_id) {
                    self.evict_banned_peer(entry.peer_id).await;
                }
            }
        }
    }

    /// Void every other request still pending against a peer that was just
    /// banned (§4.6: a ban "forced its in-flight requests to timeout
    /// immediately so the session reschedules"). The entry whose outcome
    /// triggered the ban has already been removed and voided by the caller;
    /// this only catches the peer's *other* outstanding requests, which
    /// would otherwise sit until `sweep_timeouts` fires up to 30 s later.
    async fn evict_banned_peer(&self, peer_id: PeerId) {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| e.peer_id == peer_id)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.protocol.cancel(self.topic_key, peer_id, id);
                match entry.kind {
                    PendingKind::Chunk { chunk_index } => self.mark_failed(chunk_index).await,
                    PendingKind::Subtree { start_chunk, chunk_count } => self.requeue_run(start_chunk, chunk_count).await,
                }
            }
        }
    }

    async fn on_chunk_downloaded(&self, request_id: RequestId, peer_id: PeerId, data: Vec<u8>) {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            return; // unknown or already-resolved (e.g. post-cancel) request
        };
        let PendingKind::Chunk { chunk_index } = entry.kind else {
            return;
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.complete_chunk(chunk_index, peer_id, entry.started_at, data).await;
    }

    async fn complete_chunk(&self, chunk_index: u64, peer_id: PeerId, started_at: Instant, data: Vec<u8>) {
        {
            let states = self.states.lock().await;
            if states[chunk_index as usize] == ChunkState::Verified {
                return; // late duplicate from an endgame race, discarded
            }
        }

        let expected = self.chunk_hashes[chunk_index as usize];
        if hash(&data) != expected {
            self.mark_failed(chunk_index).await;
            if self.peer_manager.record_failure(peer_id) {
                self.evict_banned_peer(peer_id).await;
            }
            return;
        }

        let offset = chunk_offset(chunk_index, self.chunk_size);
        if offset + data.len() as u64 > self.file_size {
            self.mark_failed(chunk_index).await;
            if self.peer_manager.record_failure(peer_id) {
                self.evict_banned_peer(peer_id).await;
            }
            return;
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_at(offset, &data) {
                tracing::warn!(chunk_index, error = %err, "chunk write failed");
                self.mark_failed(chunk_index).await;
                return;
            }
        }

        if self.peer_manager.record_success(peer_id, data.len() as u64, started_at.elapsed()) {
            self.evict_banned_peer(peer_id).await;
        }
        self.cancel_endgame_duplicates(chunk_index).await;

        {
            let mut states = self.states.lock().await;
            states[chunk_index as usize] = ChunkState::Verified;
        }
        {
            let mut bf = self.bitfield.lock().await;
            let _ = bf.set(chunk_index as usize);
        }
        self.verified.fetch_add(1, Ordering::SeqCst);
        self.bytes_downloaded.fetch_add(data.len() as u64, Ordering::SeqCst);
        let _ = self.protocol.announce_have(self.topic_key, chunk_index).await;
        self.emit_progress();
    }

    async fn on_subtree_downloaded(&self, request_id: RequestId, peer_id: PeerId, data: Vec<u8>) {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            return;
        };
        let PendingKind::Subtree { start_chunk, chunk_count } = entry.kind else {
            return;
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let end = start_chunk + u64::from(chunk_count);
        let mut pieces: Vec<&[u8]> = Vec::with_capacity(chunk_count as usize);
        let mut cursor = 0usize;
        for idx in start_chunk..end {
            let size = chunk_size_at(idx, self.file_size, self.chunk_size) as usize;
            if cursor + size > data.len() {
                self.requeue_run(start_chunk, chunk_count).await;
                if self.peer_manager.record_failure(peer_id) {
                    self.evict_banned_peer(peer_id).await;
                }
                return;
            }
            pieces.push(&data[cursor..cursor + size]);
            cursor += size;
        }
        if cursor != data.len() {
            self.requeue_run(start_chunk, chunk_count).await;
            if self.peer_manager.record_failure(peer_id) {
                self.evict_banned_peer(peer_id).await;
            }
            return;
        }

        for (i, piece) in pieces.iter().enumerate() {
            let idx = start_chunk + i as u64;
            if hash(piece) != self.chunk_hashes[idx as usize] {
                self.requeue_run(start_chunk, chunk_count).await;
                if self.peer_manager.record_failure(peer_id) {
                    self.evict_banned_peer(peer_id).await;
                }
                return;
            }
        }

        // Defense in depth: prove the received run's subtree root chains to
        // the file root, generated locally from the already-trusted
        // `chunk_hashes` (§4.1, §8 invariant 3). `accept_empty_subtree_proof`
        // mirrors the source's backward-compatible "empty merkleProof is
        // accepted" fallback; hardened mode (the default) always performs
        // this check.
        if chunk_count > 1 && !self.config.accept_empty_subtree_proof {
            let level = chunk_count.trailing_zeros() as usize;
            let index = (start_chunk / u64::from(chunk_count)) as usize;
            let verified_subtree = self.tree.node(level, index).is_some_and(|subtree_root| {
                self.tree
                    .prove_subtree(level, index)
                    .is_ok_and(|proof| verify_subtree_proof(subtree_root, level, index, self.chunk_count as usize, &proof, &self.merkle_root).unwrap_or(false))
            });
            if !verified_subtree {
                self.requeue_run(start_chunk, chunk_count).await;
                if self.peer_manager.record_failure(peer_id) {
                    self.evict_banned_peer(peer_id).await;
                }
                return;
            }
        }

        let mut any_written = false;
        {
            let mut writer = self.writer.lock().await;
            for (i, piece) in pieces.iter().enumerate() {
                let idx = start_chunk + i as u64;
                {
                    let states = self.states.lock().await;
                    if states[idx as usize] == ChunkState::Verified {
                        continue;
                    }
                }
                let offset = chunk_offset(idx, self.chunk_size);
                if offset + piece.len() as u64 > self.file_size {
                    continue;
                }
                if writer.write_at(offset, piece).is_ok() {
                    any_written = true;
                }
            }
        }
        if any_written && self.peer_manager.record_success(peer_id, data.len() as u64, entry.started_at.elapsed()) {
            self.evict_banned_peer(peer_id).await;
        }

        let mut newly_verified = 0u64;
        let mut new_bytes = 0u64;
        {
            let mut states = self.states.lock().await;
            let mut bf = self.bitfield.lock().await;
            for (i, piece) in pieces.iter().enumerate() {
                let idx = start_chunk + i as u64;
                if states[idx as usize] != ChunkState::Verified {
                    states[idx as usize] = ChunkState::Verified;
                    let _ = bf.set(idx as usize);
                    newly_verified += 1;
                    new_bytes += piece.len() as u64;
                }
            }
        }
        for i in start_chunk..end {
            self.cancel_endgame_duplicates(i).await;
        }
        if newly_verified > 0 {
            self.verified.fetch_add(newly_verified, Ordering::SeqCst);
            self.bytes_downloaded.fetch_add(new_bytes, Ordering::SeqCst);
            for i in start_chunk..end {
                let _ = self.protocol.announce_have(self.topic_key, i).await;
            }
            self.emit_progress();
        }
    }

    async fn cancel_endgame_duplicates(&self, chunk_index: u64) {
        if let Some((_, ids)) = self.endgame_dupes.remove(&chunk_index) {
            for id in ids {
                if let Some((_, entry)) = self.pending.remove(&id) {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.protocol.cancel(self.topic_key, entry.peer_id, id);
                }
            }
        }
    }

    async fn mark_failed(&self, chunk_index: u64) {
        let mut states = self.states.lock().await;
        if states[chunk_index as usize] != ChunkState::Verified {
            states[chunk_index as usize] = ChunkState::Failed;
        }
    }

    async fn requeue_run(&self, start: u64, count: u32) {
        let mut states = self.states.lock().await;
        for i in start..start + u64::from(count) {
            if states[i as usize] != ChunkState::Verified {
                states[i as usize] = ChunkState::Failed;
            }
        }
    }

    async fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(e.started_at) > REQUEST_TIMEOUT)
            .map(|e| *e.key())
            .collect();

        for id in expired {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                let banned = self.peer_manager.record_timeout(entry.peer_id);
                self.protocol.cancel(self.topic_key, entry.peer_id, id);
                match entry.kind {
                    PendingKind::Chunk { chunk_index } => self.mark_failed(chunk_index).await,
                    PendingKind::Subtree { start_chunk, chunk_count } => self.requeue_run(start_chunk, chunk_count).await,
                }
                if banned {
                    self.evict_banned_peer(entry.peer_id).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Cancellation & finalization
    // -----------------------------------------------------------------

    async fn do_cancel(&self) {
        let outstanding: Vec<(RequestId, PeerId)> = self.pending.iter().map(|e| (*e.key(), e.peer_id)).collect();
        for (id, peer) in outstanding {
            self.protocol.cancel(self.topic_key, peer, id);
        }
        self.pending.clear();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.sync();
        }
        let _ = self.events_tx.send(SessionEvent::Error(CoreError::Cancelled));
    }

    async fn finalize(&self) {
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.sync() {
                let _ = self.events_tx.send(SessionEvent::Error(CoreError::Io(err)));
                return;
            }
        }

        let hashes = match hash_file(&self.output_path, self.chunk_size) {
            Ok(h) => h,
            Err(err) => {
                let _ = self.events_tx.send(SessionEvent::Error(CoreError::Io(err)));
                return;
            }
        };

        if hashes.root() == self.merkle_root {
            let now = now_unix();
            if let Err(err) = self.store.set_modified_at(self.file_id, now) {
                let _ = self.events_tx.send(SessionEvent::Error(CoreError::Store(err)));
                return;
            }
            let _ = self.store.complete_incomplete_download(&self.topic_name, self.merkle_root, now);
            let _ = self.events_tx.send(SessionEvent::Complete {
                merkle_root: self.merkle_root,
                path: self.output_path.clone(),
            });
        } else {
            let first_mismatch = find_first_chunk_mismatch(&self.output_path, &self.chunk_hashes, self.chunk_size, self.file_size);
            tracing::error!(root = %hex::encode(self.merkle_root), first_mismatch = ?first_mismatch, "final merkle root mismatch");
            let _ = self.events_tx.send(SessionEvent::Error(CoreError::RootMismatch { first_mismatch }));
        }
    }

    fn emit_progress(&self) {
        let _ = self.events_tx.send(SessionEvent::Progress {
            verified: self.verified.load(Ordering::SeqCst),
            total: self.chunk_count,
            bytes_downloaded: self.bytes_downloaded.load(Ordering::SeqCst),
        });
    }
}

/// Compute the initial subtree chunk count: the configured target byte
/// count divided by chunk size, rounded down to a power of two (§4.5
/// subtree sizing). Not pre-clamped to the atomic-write cap — the session
/// learns the cap empirically by halving on `Overflow` responses (§8 S6).
fn initial_subtree_chunk_count(config: &crate::config::TransferConfig, chunk_size: u64) -> u32 {
    let max_chunks = (config.target_subtree_bytes / chunk_size.max(1)).max(1);
    round_down_pow2(max_chunks) as u32
}

fn round_down_pow2(n: u64) -> u64 {
    if n <= 1 {
        return 1;
    }
    1u64 << (63 - n.leading_zeros())
}

/// Linear scan locating the first chunk whose on-disk bytes do not match
/// the expected hash, for operator diagnostics after a root mismatch
/// (§4.5 Finalization).
#[must_use]
pub fn find_first_chunk_mismatch(path: &std::path::Path, chunk_hashes: &[[u8; 32]], chunk_size: u64, file_size: u64) -> Option<u64> {
    for (idx, expected) in chunk_hashes.iter().enumerate() {
        let idx = idx as u64;
        let offset = chunk_offset(idx, chunk_size);
        let size = chunk_size_at(idx, file_size, chunk_size);
        match hash_chunk_range(path, offset, size) {
            Ok(actual) if actual == *expected => continue,
            _ => return Some(idx),
        }
    }
    None
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Ensure a single logical message never exceeds the atomic-write cap once
/// binary framing overhead is added; used by callers sizing their own
/// subtree requests defensively alongside the server-driven halving above.
#[must_use]
pub fn max_subtree_chunks_for_cap(chunk_size: u64) -> u32 {
    let cap = (ATOMIC_WRITE_CAP - BINARY_HEADER_SIZE) as u64;
    round_down_pow2((cap / chunk_size.max(1)).max(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use swarmfs_store::Store;
    use swarmfs_transport::{LoopbackNetwork, LoopbackTransport, SwarmTransport, TopicKey};
    use tokio::time::{timeout, Duration};

    fn peer(b: u8) -> PeerId {
        PeerId([b; 32])
    }

    async fn make_protocol(id: u8, network: &Arc<LoopbackNetwork>, store: Arc<Store>) -> (Arc<Protocol>, broadcast::Sender<ProtocolEvent>) {
        let transport = Arc::new(LoopbackTransport::new(peer(id), network.clone()));
        let (protocol, mut events_rx) = Protocol::new(transport, store, peer(id));
        protocol.spawn();

        // Relay the protocol's single-consumer mpsc events into a broadcast
        // channel so (in these tests) a single download session can
        // subscribe the same way `Node` does in production.
        let (tx, _rx) = broadcast::channel(1024);
        let relay_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let _ = relay_tx.send(event);
            }
        });
        (protocol, tx)
    }

    async fn share_file(holder_store: &Store, path: &std::path::Path, contents: &[u8], chunk_size: u64) -> ([u8; 32], Vec<[u8; 32]>) {
        std::fs::write(path, contents).unwrap();
        let hashes = hash_file(path, chunk_size).unwrap();
        let leaves: Vec<[u8; 32]> = (0..hashes.chunk_count()).map(|i| hashes.tree.leaf(i as usize).unwrap()).collect();

        let file_id = holder_store
            .upsert_file(path, hashes.root(), contents.len() as u64, chunk_size, hashes.chunk_count(), 0, 1)
            .unwrap();
        let rows: Vec<ChunkRow> = leaves
            .iter()
            .enumerate()
            .map(|(i, h)| ChunkRow {
                chunk_index: i as u64,
                offset: chunk_offset(i as u64, chunk_size),
                size: chunk_size_at(i as u64, contents.len() as u64, chunk_size),
                hash: *h,
            })
            .collect();
        holder_store.insert_chunks(file_id, &rows).unwrap();

        // mtime must match what the protocol reads back when serving
        let meta = std::fs::metadata(path).unwrap();
        let mtime = meta.modified().unwrap().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        holder_store.set_modified_at(file_id, mtime).unwrap();

        (hashes.root(), leaves)
    }

    #[tokio::test]
    async fn single_chunk_file_downloads_and_verifies() {
        let network = LoopbackNetwork::new();
        let holder_store = Arc::new(Store::open_in_memory().unwrap());
        let (holder_protocol, _holder_events) = make_protocol(1, &network, holder_store.clone()).await;

        let requester_store = Arc::new(Store::open_in_memory().unwrap());
        let (requester_protocol, requester_events) = make_protocol(2, &network, requester_store.clone()).await;

        let topic = TopicKey::from_name("t");
        holder_protocol.transport().join("t", topic).await.unwrap();
        requester_protocol.transport().join("t", topic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let holder_dir = tempfile::tempdir().unwrap();
        let source_path = holder_dir.path().join("source.bin");
        let contents = b"hello world".to_vec();
        let (root, leaves) = share_file(&holder_store, &source_path, &contents, 1024 * 1024).await;

        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("dest.bin");

        let (session, mut session_events) = DownloadSession::start(
            NodeConfig::default(),
            requester_store,
            requester_protocol,
            requester_events,
            "t".to_string(),
            topic,
            root,
            contents.len() as u64,
            1024 * 1024,
            leaves,
            out_path.clone(),
            &[peer(1)],
        )
        .await
        .unwrap();

        let mut completed = false;
        for _ in 0..50 {
            match timeout(Duration::from_secs(2), session_events.recv()).await {
                Ok(Some(SessionEvent::Complete { path, .. })) => {
                    assert_eq!(path, out_path);
                    completed = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(completed, "download did not complete");
        assert_eq!(std::fs::read(&out_path).unwrap(), contents);
        let _ = session;
    }

    #[tokio::test]
    async fn resume_rehashes_matching_bytes_without_downloading() {
        let chunk_size = 16u64;
        let data: Vec<u8> = (0..(chunk_size * 2)).map(|i| i as u8).collect();
        let leaves: Vec<[u8; 32]> = data.chunks(chunk_size as usize).map(hash).collect();
        let root = merkle_root(&leaves);

        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("partial.bin");
        std::fs::write(&out_path, &data[..chunk_size as usize]).unwrap(); // only chunk 0 present

        let network = LoopbackNetwork::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (protocol, events_rx) = make_protocol(3, &network, store.clone()).await;
        let topic = TopicKey::from_name("resume");
        protocol.transport().join("resume", topic).await.unwrap();

        let (session, _events) = DownloadSession::start(
            NodeConfig::default(),
            store,
            protocol,
            events_rx,
            "resume".to_string(),
            topic,
            root,
            data.len() as u64,
            chunk_size,
            leaves,
            out_path.clone(),
            &[],
        )
        .await
        .unwrap();

        let (verified, total, _) = session.progress();
        assert_eq!(verified, 1);
        assert_eq!(total, 2);
        session.cancel();
    }

    #[tokio::test]
    async fn cancel_emits_terminal_error_event() {
        let chunk_size = 1024 * 1024u64;
        let leaves = vec![hash(b"only chunk")];
        let root = merkle_root(&leaves);

        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("cancelled.bin");

        let network = LoopbackNetwork::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (protocol, events_rx) = make_protocol(4, &network, store.clone()).await;
        let topic = TopicKey::from_name("cancel");
        protocol.transport().join("cancel", topic).await.unwrap();

        let (session, mut session_events) = DownloadSession::start(
            NodeConfig::default(),
            store,
            protocol,
            events_rx,
            "cancel".to_string(),
            topic,
            root,
            b"only chunk".len() as u64,
            chunk_size,
            leaves,
            out_path,
            &[],
        )
        .await
        .unwrap();

        session.cancel();
        let event = timeout(Duration::from_secs(2), session_events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, SessionEvent::Error(CoreError::Cancelled)));
    }

    #[test]
    fn subtree_chunk_count_rounds_down_to_power_of_two() {
        let config = crate::config::TransferConfig {
            target_subtree_bytes: 64 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(initial_subtree_chunk_count(&config, 1024 * 1024), 64);
    }

    #[test]
    fn max_subtree_chunks_respects_atomic_write_cap() {
        let n = max_subtree_chunks_for_cap(1024 * 1024);
        assert!(n <= 16);
        assert!(n.is_power_of_two());
    }

    #[tokio::test]
    async fn banning_a_peer_immediately_voids_its_other_pending_requests() {
        // §4.6: banning a peer must force its in-flight requests to time
        // out immediately rather than wait on the 30s sweep.
        let chunk_size = 16u64;
        let data: Vec<u8> = (0..(chunk_size * 4)).map(|i| i as u8).collect();
        let leaves: Vec<[u8; 32]> = data.chunks(chunk_size as usize).map(hash).collect();
        let root = merkle_root(&leaves);

        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("banning.bin");

        let network = LoopbackNetwork::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (protocol, events_rx) = make_protocol(5, &network, store.clone()).await;
        let topic = TopicKey::from_name("banning");
        protocol.transport().join("banning", topic).await.unwrap();

        let (session, _events) = DownloadSession::start(
            NodeConfig::default(),
            store,
            protocol,
            events_rx,
            "banning".to_string(),
            topic,
            root,
            data.len() as u64,
            chunk_size,
            leaves,
            out_path,
            &[],
        )
        .await
        .unwrap();

        let flaky = peer(9);
        session.peer_manager.add_peer(flaky);

        // Two chunks pipelined to the flaky peer, neither resolved yet.
        let id_a = RequestId::random();
        let id_b = RequestId::random();
        session.pending.insert(
            id_a,
            PendingEntry {
                kind: PendingKind::Chunk { chunk_index: 1 },
                peer_id: flaky,
                started_at: Instant::now(),
            },
        );
        session.pending.insert(
            id_b,
            PendingEntry {
                kind: PendingKind::Chunk { chunk_index: 2 },
                peer_id: flaky,
                started_at: Instant::now(),
            },
        );
        session.in_flight.fetch_add(2, Ordering::SeqCst);

        session.evict_banned_peer(flaky).await;

        assert!(!session.pending.contains_key(&id_a));
        assert!(!session.pending.contains_key(&id_b));
        let states = session.states.lock().await;
        assert_eq!(states[1], ChunkState::Failed);
        assert_eq!(states[2], ChunkState::Failed);
        drop(states);
        session.cancel();
    }

    #[test]
    fn find_first_chunk_mismatch_locates_corrupted_chunk() {
        let chunk_size = 8u64;
        let data = vec![1u8; 16];
        let mut f = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut f, &data).unwrap();
        let leaves = vec![hash(&data[..8]), hash(&[9u8; 8])]; // second leaf deliberately wrong
        let mismatch = find_first_chunk_mismatch(f.path(), &leaves, chunk_size, 16);
        assert_eq!(mismatch, Some(1));
    }
}
