//! # SwarmFS Core
//!
//! The transfer engine: peer manager (§4.6), chunk scheduler (§4.5
//! scheduling pieces), download session state machine (§4.5), and the
//! [`Node`] facade that wires them to a [`swarmfs_store::Store`] and a
//! [`swarmfs_transport::SwarmTransport`] into a single composition root.
//!
//! Everything outside this crate — swarm discovery, NAT traversal, the
//! CLI, TUI, and IPC daemon — is an external collaborator that talks to
//! [`Node`] (§1 Out of scope).

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod ipc;
pub mod peer_manager;
pub mod scheduler;
pub mod session;

pub use config::{NodeConfig, PeerConfig, StoreConfig, TransferConfig};
pub use error::{CoreError, Result};
pub use peer_manager::{PeerInfo, PeerManager};
pub use scheduler::{ChunkState, Scheduler, SchedulerReport};
pub use session::{DownloadSession, SessionEvent};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use swarmfs_files::chunk::{chunk_count, chunk_offset, chunk_size_at};
use swarmfs_files::chunker::hash_file;
use swarmfs_store::model::{FileRecord, ShareType, Topic};
use swarmfs_store::{ChunkRow, Store};
use swarmfs_protocol::{Protocol, ProtocolEvent, RequestId};
use swarmfs_transport::{PeerId, SwarmTransport, TopicKey};
use tokio::sync::mpsc;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// A locally known file's chunk layout, either read straight from the
/// store or learned from a peer's `METADATA_RESP` (§4.4).
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Merkle root.
    pub merkle_root: [u8; 32],
    /// Total file size in bytes.
    pub file_size: u64,
    /// Chunk size the file was hashed with.
    pub chunk_size: u64,
    /// Per-chunk content hashes, in order.
    pub chunk_hashes: Vec<[u8; 32]>,
}

/// How long [`Node::fetch_metadata`] waits for a `METADATA_RESP` before
/// giving up and trying the next peer.
const METADATA_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// The node facade: one metadata store, one wire protocol instance bound
/// to one pluggable transport, and zero or more concurrently running
/// download sessions.
///
/// The transport it wires to is a caller-supplied [`SwarmTransport`]
/// implementation rather than a concrete discovery stack — swarm discovery
/// is an external collaborator (§1).
pub struct Node {
    config: NodeConfig,
    store: Arc<Store>,
    protocol: Arc<Protocol>,
    transport: Arc<dyn SwarmTransport>,
    local_peer_id: PeerId,
    // Held for its lock file's lifetime when opened via `Node::open`;
    // `None` when constructed directly over a caller-owned store (tests).
    _lock: Option<std::fs::File>,
}

impl Node {
    /// Open the data directory at `config.store.data_dir` (acquiring its
    /// lock file, §6) and bind a protocol instance to `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory is already locked by
    /// another process or the store cannot be opened.
    pub fn open(
        config: NodeConfig,
        transport: Arc<dyn SwarmTransport>,
        local_peer_id: PeerId,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let lock_path = config.store.data_dir.join("swarmfs.lock");
        let lock = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => swarmfs_store::StoreError::AlreadyLocked,
                _ => swarmfs_store::StoreError::Io(e),
            })?;
        let store = Arc::new(Store::open(config.store.data_dir.join("swarmfs.db"))?);
        Ok(Self::new_with_lock(config, store, transport, local_peer_id, Some(lock)))
    }

    /// Bind a protocol instance to `transport` over an already-open
    /// `store` (tests typically share an in-memory store across several
    /// `Node`s this way; [`Node::open`] is the on-disk entry point).
    #[must_use]
    pub fn new(
        config: NodeConfig,
        store: Arc<Store>,
        transport: Arc<dyn SwarmTransport>,
        local_peer_id: PeerId,
    ) -> Arc<Self> {
        Self::new_with_lock(config, store, transport, local_peer_id, None)
    }

    fn new_with_lock(
        config: NodeConfig,
        store: Arc<Store>,
        transport: Arc<dyn SwarmTransport>,
        local_peer_id: PeerId,
        lock: Option<std::fs::File>,
    ) -> Arc<Self> {
        let (protocol, _events) = Protocol::new(Arc::clone(&transport), Arc::clone(&store), local_peer_id);
        protocol.spawn();
        Arc::new(Self {
            config,
            store,
            protocol,
            transport,
            local_peer_id,
            _lock: lock,
        })
    }

    /// This node's configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The underlying metadata store, for callers (CLI, IPC daemon) that
    /// need read-only access beyond what this facade exposes.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The underlying protocol instance.
    #[must_use]
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// This node's peer id, as seen by the transport.
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    // -----------------------------------------------------------------
    // Topics
    // -----------------------------------------------------------------

    /// Derive a topic's key (public or password-derived, §4.7, §6), join
    /// the swarm, and record the topic so it can be auto-joined on
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation, the store write, or the
    /// transport join fails.
    pub async fn join_topic(&self, name: &str, password: Option<&[u8]>, auto_join: bool) -> Result<TopicKey> {
        let topic_key = match password {
            Some(pw) => TopicKey::from_password(name, pw)?,
            None => TopicKey::from_name(name),
        };
        let now = now_unix();
        self.store.upsert_topic(name, *topic_key.as_bytes(), auto_join, now)?;
        self.store.touch_topic_joined(name, now)?;
        self.transport.join(name, topic_key).await?;
        Ok(topic_key)
    }

    /// Leave a previously joined topic. The topic record is retained
    /// (§6 `topic leave` does not forget the topic, only its membership).
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is unknown or the transport leave
    /// fails.
    pub async fn leave_topic(&self, name: &str) -> Result<()> {
        let topic = self.store.topic_by_name(name)?.ok_or(CoreError::NoMetadata)?;
        let topic_key = TopicKey(topic.topic_key);
        self.transport.leave(name, topic_key).await?;
        Ok(())
    }

    /// List every known topic.
    ///
    /// # Errors
    ///
    /// Returns an error on a store failure.
    pub fn list_topics(&self) -> Result<Vec<Topic>> {
        Ok(self.store.list_topics()?)
    }

    /// Auto-join every topic with `auto_join = true`, in the order
    /// returned by the store. Used at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the store listing fails; individual join
    /// failures are logged and skipped so one bad topic does not block
    /// the rest.
    pub async fn rejoin_auto_join_topics(&self) -> Result<Vec<String>> {
        let mut rejoined = Vec::new();
        for topic in self.store.list_topics()? {
            if !topic.auto_join {
                continue;
            }
            let topic_key = TopicKey(topic.topic_key);
            match self.transport.join(&topic.name, topic_key).await {
                Ok(()) => {
                    let _ = self.store.touch_topic_joined(&topic.name, now_unix());
                    rejoined.push(topic.name);
                }
                Err(err) => tracing::warn!(topic = %topic.name, error = %err, "auto-join failed"),
            }
        }
        Ok(rejoined)
    }

    // -----------------------------------------------------------------
    // Local files
    // -----------------------------------------------------------------

    /// Hash `path` (offloadable to a worker pool by the caller — this
    /// crate treats hashing as a synchronous CPU step, §5), record it as a
    /// complete file (`modified_at = now`, immediately eligible to
    /// serve), and return its record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the store write
    /// fails.
    pub fn add_file(&self, path: &Path, chunk_size: Option<u64>) -> Result<FileRecord> {
        let chunk_size = chunk_size.unwrap_or(self.config.transfer.chunk_size);
        let hashes = hash_file(path, chunk_size)?;
        let file_size = std::fs::metadata(path)?.len();
        let now = now_unix();
        let count = chunk_count(file_size, chunk_size);

        let file_id = self.store.upsert_file(path, hashes.root(), file_size, chunk_size, count, now, now)?;
        let rows: Vec<ChunkRow> = (0..hashes.chunk_count())
            .map(|i| ChunkRow {
                chunk_index: i,
                offset: chunk_offset(i, chunk_size),
                size: chunk_size_at(i, file_size, chunk_size),
                hash: hashes.tree.leaf(i as usize).expect("index within leaf_count"),
            })
            .collect();
        self.store.insert_chunks(file_id, &rows)?;

        self.store
            .file_by_id(file_id)?
            .ok_or(CoreError::NoMetadata)
    }

    /// Re-hash `path` against its recorded chunk layout and report any
    /// chunk indices whose on-disk bytes no longer match (§8 "Verify
    /// after Add").
    ///
    /// # Errors
    ///
    /// Returns an error if no record exists for `path`, or the file
    /// cannot be read.
    pub fn verify_file(&self, path: &Path) -> Result<Vec<u64>> {
        let record = self.store.file_by_path(path)?.ok_or(CoreError::NoMetadata)?;
        let rows = self.store.chunks_for_file(record.id)?;
        let mut corrupted = Vec::new();
        for row in &rows {
            match swarmfs_files::chunker::hash_chunk_range(path, row.offset, row.size) {
                Ok(actual) if actual == row.hash => {}
                _ => corrupted.push(row.chunk_index),
            }
        }
        Ok(corrupted)
    }

    /// Advertise an already-verified file under a topic (§3 Topic share
    /// invariant: only `modified_at > 0` files may be shared).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoMetadata`] if the topic is unknown, the file
    /// has no record, or the file is still in progress.
    pub fn share_file(&self, topic_name: &str, path: &Path) -> Result<()> {
        let topic = self.store.topic_by_name(topic_name)?.ok_or(CoreError::NoMetadata)?;
        let record = self.store.file_by_path(path)?.ok_or(CoreError::NoMetadata)?;
        if !record.is_complete() {
            return Err(CoreError::NoMetadata);
        }
        self.store
            .add_share(topic.id, ShareType::File, path, record.merkle_root, now_unix())?;
        Ok(())
    }

    /// Stop advertising a path under a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is unknown or the store write fails.
    pub fn unshare_file(&self, topic_name: &str, path: &Path) -> Result<()> {
        let topic = self.store.topic_by_name(topic_name)?.ok_or(CoreError::NoMetadata)?;
        self.store.remove_share(topic.id, path)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Downloads
    // -----------------------------------------------------------------

    /// Look up a file's chunk layout locally, without touching the
    /// network.
    ///
    /// # Errors
    ///
    /// Returns an error on a store failure.
    pub fn local_metadata(&self, merkle_root: [u8; 32]) -> Result<Option<FileMetadata>> {
        let Some(record) = self.store.file_by_merkle_root(merkle_root)? else {
            return Ok(None);
        };
        let rows = self.store.chunks_for_file(record.id)?;
        Ok(Some(FileMetadata {
            merkle_root: record.merkle_root,
            file_size: record.file_size,
            chunk_size: record.chunk_size,
            chunk_hashes: rows.iter().map(|r| r.hash).collect(),
        }))
    }

    /// Ask `peer_id` for a file's full chunk layout via `METADATA_REQ`,
    /// waiting up to [`METADATA_REQUEST_TIMEOUT`] for the matching
    /// `METADATA_RESP` (§4.4).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoMetadata`] if the peer does not answer in
    /// time or answers for a different request.
    pub async fn fetch_metadata(
        &self,
        topic_key: TopicKey,
        peer_id: PeerId,
        merkle_root: [u8; 32],
    ) -> Result<FileMetadata> {
        let mut events = self.protocol.subscribe();
        let request_id: RequestId = self.protocol.request_metadata(topic_key, peer_id, merkle_root);
        let deadline = tokio::time::Instant::now() + METADATA_REQUEST_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::NoMetadata);
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(ProtocolEvent::Metadata {
                    request_id: id,
                    merkle_root: root,
                    file_size,
                    chunk_size,
                    chunk_hashes,
                    ..
                })) if id == request_id && root == merkle_root => {
                    return Ok(FileMetadata {
                        merkle_root: root,
                        file_size,
                        chunk_size,
                        chunk_hashes,
                    });
                }
                Ok(Ok(ProtocolEvent::RemoteError { request_id: Some(id), .. })) if id == request_id => {
                    return Err(CoreError::NoMetadata);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return Err(CoreError::NoMetadata),
                Err(_elapsed) => return Err(CoreError::NoMetadata),
            }
        }
    }

    /// Start a download session for `merkle_root` under `topic_name`,
    /// using metadata already known locally if present, otherwise asking
    /// the first of `initial_peers` (§4.5 startup sequence).
    ///
    /// # Errors
    ///
    /// Returns an error if no metadata can be obtained, the topic key is
    /// unknown, or the session fails to start (preallocation, store
    /// writes).
    pub async fn download(
        &self,
        topic_name: &str,
        topic_key: TopicKey,
        merkle_root: [u8; 32],
        output_path: PathBuf,
        initial_peers: &[PeerId],
    ) -> Result<(Arc<DownloadSession>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let metadata = match self.local_metadata(merkle_root)? {
            Some(m) => m,
            None => {
                let mut last_err = CoreError::NoMetadata;
                let mut found = None;
                for peer in initial_peers {
                    match self.fetch_metadata(topic_key, *peer, merkle_root).await {
                        Ok(m) => {
                            found = Some(m);
                            break;
                        }
                        Err(err) => last_err = err,
                    }
                }
                found.ok_or(last_err)?
            }
        };

        let events = self.protocol.subscribe();
        DownloadSession::start(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.protocol),
            events,
            topic_name.to_string(),
            topic_key,
            metadata.merkle_root,
            metadata.file_size,
            metadata.chunk_size,
            metadata.chunk_hashes,
            output_path,
            initial_peers,
        )
        .await
    }

    /// Resume every incomplete download recorded in the store (§4.5
    /// restart resume). Callers typically invoke this once at startup,
    /// after [`Node::rejoin_auto_join_topics`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store listing fails. Individual resume
    /// failures are logged and skipped.
    pub async fn resume_incomplete_downloads(
        &self,
        initial_peers: &[PeerId],
    ) -> Result<Vec<(String, [u8; 32], Arc<DownloadSession>, mpsc::UnboundedReceiver<SessionEvent>)>> {
        let mut resumed = Vec::new();
        for entry in self.store.list_incomplete_downloads()? {
            if entry.completed_at.is_some() {
                continue;
            }
            let Some(topic) = self.store.topic_by_name(&entry.topic_name)? else {
                tracing::warn!(topic = %entry.topic_name, "incomplete download references unknown topic, skipping");
                continue;
            };
            let topic_key = TopicKey(topic.topic_key);
            match self
                .download(&entry.topic_name, topic_key, entry.merkle_root, entry.output_path.clone(), initial_peers)
                .await
            {
                Ok((session, rx)) => resumed.push((entry.topic_name, entry.merkle_root, session, rx)),
                Err(err) => tracing::warn!(root = %hex::encode(entry.merkle_root), error = %err, "failed to resume download"),
            }
        }
        Ok(resumed)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self._lock.is_some() {
            let _ = std::fs::remove_file(self.config.store.data_dir.join("swarmfs.lock"));
        }
    }
}
