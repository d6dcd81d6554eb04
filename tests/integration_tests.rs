//! End-to-end download scenarios over a [`LoopbackNetwork`] swarm,
//! covering the boundary and restart scenarios this crate's wire protocol
//! and download session are built around.

use swarmfs_core::SessionEvent;
use swarmfs_integration_tests::fixtures::TwoNodeFixture;
use swarmfs_transport::{LoopbackNetwork, LoopbackTransport, PeerId};

async fn drain_to_completion(mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
            .await
            .expect("download timed out")
            .expect("session event stream closed before completion")
        {
            SessionEvent::Complete { .. } => return,
            SessionEvent::Error(err) => panic!("download failed: {err}"),
            SessionEvent::Progress { .. } => continue,
        }
    }
}

// S1 — single-chunk file.
#[tokio::test]
async fn single_chunk_file_downloads_byte_identical() {
    let fixture = TwoNodeFixture::new().await;
    let contents = b"hello world".to_vec();
    let (_path, root) = fixture.share_file("hello.txt", &contents);

    let expected_root = swarmfs_files::hash(&contents);
    assert_eq!(root, expected_root);

    let (_session, events) = fixture.download(root, "hello_out.txt").await;
    drain_to_completion(events).await;

    let written = std::fs::read(fixture.leecher_dir().join("hello_out.txt")).unwrap();
    assert_eq!(written, contents);
}

// S2 — two-chunk file, exactly `2 * chunk_size` bytes.
#[tokio::test]
async fn two_chunk_file_downloads_byte_identical() {
    let fixture = TwoNodeFixture::new().await;
    let chunk_size = 64 * 1024u64;
    let contents: Vec<u8> = (0..2 * chunk_size).map(|i| (i % 256) as u8).collect();

    let path = fixture.seeder_dir().join("two_chunk.bin");
    std::fs::write(&path, &contents).unwrap();
    let record = fixture.seeder.add_file(&path, Some(chunk_size)).unwrap();
    fixture.seeder.share_file(&fixture.topic_name, &path).unwrap();

    let (_session, events) = fixture.download(record.merkle_root, "two_chunk_out.bin").await;
    drain_to_completion(events).await;

    let written = std::fs::read(fixture.leecher_dir().join("two_chunk_out.bin")).unwrap();
    assert_eq!(written, contents);
}

// S3 — three-chunk odd-node file: `2 * chunk_size + 1` bytes, exercising the
// duplicate-last-leaf Merkle rule through a real download.
#[tokio::test]
async fn three_chunk_odd_node_file_downloads_byte_identical() {
    let fixture = TwoNodeFixture::new().await;
    let chunk_size = 64 * 1024u64;
    let contents: Vec<u8> = (0..2 * chunk_size + 1).map(|i| (i % 251) as u8).collect();

    let path = fixture.seeder_dir().join("odd.bin");
    std::fs::write(&path, &contents).unwrap();
    let record = fixture.seeder.add_file(&path, Some(chunk_size)).unwrap();
    fixture.seeder.share_file(&fixture.topic_name, &path).unwrap();

    let (_session, events) = fixture.download(record.merkle_root, "odd_out.bin").await;
    drain_to_completion(events).await;

    let written = std::fs::read(fixture.leecher_dir().join("odd_out.bin")).unwrap();
    assert_eq!(written, contents);
}

// S4 — download resumes: a leecher that already has some verified chunks
// on disk (simulating a crash-and-restart) should rehash rather than
// re-download them.
#[tokio::test]
async fn resumed_download_reuses_already_verified_bytes() {
    let fixture = TwoNodeFixture::new().await;
    let chunk_size = 16 * 1024u64;
    let contents: Vec<u8> = (0..10 * chunk_size).map(|i| (i % 200) as u8).collect();
    let root = {
        let path = fixture.seeder_dir().join("resume.bin");
        std::fs::write(&path, &contents).unwrap();
        let record = fixture.seeder.add_file(&path, Some(chunk_size)).unwrap();
        fixture.seeder.share_file(&fixture.topic_name, &path).unwrap();
        record.merkle_root
    };

    // Pre-seed the leecher's output file with the correct bytes so the
    // resume rehash finds them already VERIFIED instead of downloading.
    let out_path = fixture.leecher_dir().join("resume_out.bin");
    std::fs::write(&out_path, &contents).unwrap();

    let (session, events) = fixture
        .leecher
        .download(&fixture.topic_name, fixture.topic_key, root, out_path.clone(), &[fixture.seeder_peer_id()])
        .await
        .unwrap();

    drain_to_completion(events).await;
    // Every chunk was already on disk: nothing should have been fetched
    // over the wire this run.
    let (verified, total, bytes_downloaded) = session.progress();
    assert_eq!(verified, total);
    assert_eq!(bytes_downloaded, 0);

    let written = std::fs::read(&out_path).unwrap();
    assert_eq!(written, contents);
}

// Multi-peer swarm: a leecher pulls the same file from two independent
// seeders at once, exercising the peer manager's candidate selection
// across more than one source.
#[tokio::test]
async fn leecher_downloads_from_either_of_two_seeders() {
    let network = LoopbackNetwork::new();
    let topic_name = "multi-seeder";

    let seeder_a_store = std::sync::Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
    let seeder_a_transport = std::sync::Arc::new(LoopbackTransport::new(PeerId([1; 32]), network.clone()));
    let seeder_a = swarmfs_core::Node::new(
        swarmfs_core::NodeConfig::default(),
        seeder_a_store,
        seeder_a_transport,
        PeerId([1; 32]),
    );

    let seeder_b_store = std::sync::Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
    let seeder_b_transport = std::sync::Arc::new(LoopbackTransport::new(PeerId([2; 32]), network.clone()));
    let seeder_b = swarmfs_core::Node::new(
        swarmfs_core::NodeConfig::default(),
        seeder_b_store,
        seeder_b_transport,
        PeerId([2; 32]),
    );

    let leecher_store = std::sync::Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
    let leecher_transport = std::sync::Arc::new(LoopbackTransport::new(PeerId([3; 32]), network.clone()));
    let leecher = swarmfs_core::Node::new(
        swarmfs_core::NodeConfig::default(),
        leecher_store,
        leecher_transport,
        PeerId([3; 32]),
    );

    let topic_key = seeder_a.join_topic(topic_name, None, false).await.unwrap();
    seeder_b.join_topic(topic_name, None, false).await.unwrap();
    leecher.join_topic(topic_name, None, false).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let seeder_dir = tempfile::tempdir().unwrap();
    let path = seeder_dir.path().join("shared.bin");
    let contents: Vec<u8> = (0..256 * 1024u64).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &contents).unwrap();

    // Both seeders hold the same bytes under their own store.
    let record_a = seeder_a.add_file(&path, None).unwrap();
    seeder_a.share_file(topic_name, &path).unwrap();
    let path_b = seeder_dir.path().join("shared_copy.bin");
    std::fs::copy(&path, &path_b).unwrap();
    seeder_b.add_file(&path_b, None).unwrap();
    seeder_b.share_file(topic_name, &path_b).unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("shared_out.bin");
    let (_session, events) = leecher
        .download(
            topic_name,
            topic_key,
            record_a.merkle_root,
            out_path.clone(),
            &[PeerId([1; 32]), PeerId([2; 32])],
        )
        .await
        .unwrap();

    drain_to_completion(events).await;
    let written = std::fs::read(&out_path).unwrap();
    assert_eq!(written, contents);
}
