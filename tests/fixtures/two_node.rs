//! Two-node test fixture for integration testing.
//!
//! Provides a reusable seeder/leecher pair wired to a shared
//! [`LoopbackNetwork`], the same in-process transport `swarmfs-core`'s own
//! unit tests use, so integration tests don't each hand-roll the
//! store/protocol/topic-join boilerplate.
//!
//! ```no_run
//! use swarmfs_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_transfer() {
//!     let fixture = TwoNodeFixture::new().await;
//!     let (path, root) = fixture.share_file("greeting.txt", b"hello swarm");
//!     let (_session, mut events) = fixture.download(root, "greeting_out.txt").await;
//!     // ... await events ...
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use swarmfs_core::{Node, NodeConfig};
use swarmfs_transport::{LoopbackNetwork, LoopbackTransport, PeerId, TopicKey};

/// Random 32-byte peer id, distinct on every call with overwhelming
/// probability — good enough for test fixtures.
fn random_peer_id() -> PeerId {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    PeerId(bytes)
}

/// A seeder/leecher pair sharing one topic over a [`LoopbackNetwork`].
pub struct TwoNodeFixture {
    pub seeder: Arc<Node>,
    pub leecher: Arc<Node>,
    pub topic_name: String,
    pub topic_key: TopicKey,
    seeder_dir: tempfile::TempDir,
    leecher_dir: tempfile::TempDir,
}

impl TwoNodeFixture {
    /// Build a fixture with both nodes already joined to the same public
    /// topic, each backed by its own in-memory store.
    pub async fn new() -> Self {
        Self::with_topic("fixture-topic").await
    }

    /// Same as [`TwoNodeFixture::new`], naming the shared topic
    /// explicitly (useful when a test needs several independent swarms
    /// that must not see each other's peers).
    pub async fn with_topic(topic_name: &str) -> Self {
        let network = LoopbackNetwork::new();

        let seeder_store = Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
        let seeder_transport = Arc::new(LoopbackTransport::new(random_peer_id(), network.clone()));
        let seeder_peer_id = seeder_transport.peer_id();
        let seeder = Node::new(NodeConfig::default(), seeder_store, seeder_transport, seeder_peer_id);

        let leecher_store = Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
        let leecher_transport = Arc::new(LoopbackTransport::new(random_peer_id(), network.clone()));
        let leecher_peer_id = leecher_transport.peer_id();
        let leecher = Node::new(NodeConfig::default(), leecher_store, leecher_transport, leecher_peer_id);

        let topic_key = seeder.join_topic(topic_name, None, false).await.unwrap();
        leecher.join_topic(topic_name, None, false).await.unwrap();
        // Let both LoopbackTransport pumps process the join envelopes
        // before a test issues its first request.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        Self {
            seeder,
            leecher,
            topic_name: topic_name.to_string(),
            topic_key,
            seeder_dir: tempfile::tempdir().unwrap(),
            leecher_dir: tempfile::tempdir().unwrap(),
        }
    }

    /// This fixture's seeder peer id.
    pub fn seeder_peer_id(&self) -> PeerId {
        self.seeder.local_peer_id()
    }

    /// This fixture's leecher peer id.
    pub fn leecher_peer_id(&self) -> PeerId {
        self.leecher.local_peer_id()
    }

    /// Write `contents` under the seeder's scratch directory as `name`,
    /// hash and record it, and share it under this fixture's topic.
    /// Returns the on-disk path and the file's Merkle root.
    pub fn share_file(&self, name: &str, contents: &[u8]) -> (PathBuf, [u8; 32]) {
        let path = self.seeder_dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        let record = self.seeder.add_file(&path, None).unwrap();
        self.seeder.share_file(&self.topic_name, &path).unwrap();
        (path, record.merkle_root)
    }

    /// Start a download on the leecher for `root`, writing to `out_name`
    /// under the leecher's scratch directory, sourcing metadata and
    /// chunks from the seeder.
    pub async fn download(
        &self,
        root: [u8; 32],
        out_name: &str,
    ) -> (Arc<swarmfs_core::DownloadSession>, tokio::sync::mpsc::UnboundedReceiver<swarmfs_core::SessionEvent>) {
        let out_path = self.leecher_dir.path().join(out_name);
        self.leecher
            .download(&self.topic_name, self.topic_key, root, out_path, &[self.seeder_peer_id()])
            .await
            .unwrap()
    }

    /// The leecher's scratch directory, for tests that need to inspect
    /// downloaded bytes directly.
    pub fn leecher_dir(&self) -> &std::path::Path {
        self.leecher_dir.path()
    }

    /// The seeder's scratch directory.
    pub fn seeder_dir(&self) -> &std::path::Path {
        self.seeder_dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_joins_both_nodes_to_the_same_topic() {
        let fixture = TwoNodeFixture::new().await;
        assert_ne!(fixture.seeder_peer_id().0, fixture.leecher_peer_id().0);
    }

    #[tokio::test]
    async fn fixture_share_and_download_round_trips() {
        let fixture = TwoNodeFixture::new().await;
        let (_path, root) = fixture.share_file("a.bin", b"fixture contents");
        let (_session, mut events) = fixture.download(root, "a_out.bin").await;

        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .expect("download did not finish in time")
                .expect("session event stream closed early")
            {
                swarmfs_core::SessionEvent::Complete { .. } => break,
                swarmfs_core::SessionEvent::Error(err) => panic!("download failed: {err}"),
                swarmfs_core::SessionEvent::Progress { .. } => continue,
            }
        }

        let written = std::fs::read(fixture.leecher_dir().join("a_out.bin")).unwrap();
        assert_eq!(written, b"fixture contents");
    }
}
