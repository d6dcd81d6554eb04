//! Benchmarks for file hashing and a full two-node loopback download, the
//! same end-to-end path exercised by `tests/integration_tests.rs` (§4.5).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use swarmfs_core::{Node, NodeConfig};
use swarmfs_files::chunker::hash_file;
use swarmfs_transport::{LoopbackNetwork, LoopbackTransport, PeerId};

fn bench_hash_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_file");
    for &mib in &[1u64, 8, 32] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.bin");
        let contents = vec![0x5au8; (mib * 1024 * 1024) as usize];
        std::fs::write(&path, &contents).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(format!("{mib}MiB")), &path, |b, path| {
            b.iter(|| hash_file(black_box(path), 1024 * 1024).unwrap());
        });
    }
    group.finish();
}

fn bench_loopback_download(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("loopback_download_4mib", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let network = LoopbackNetwork::new();
                let seeder_store = Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
                let seeder_transport = Arc::new(LoopbackTransport::new(PeerId([1; 32]), network.clone()));
                let seeder = Node::new(NodeConfig::default(), seeder_store, seeder_transport, PeerId([1; 32]));

                let leecher_store = Arc::new(swarmfs_store::Store::open_in_memory().unwrap());
                let leecher_transport = Arc::new(LoopbackTransport::new(PeerId([2; 32]), network.clone()));
                let leecher = Node::new(NodeConfig::default(), leecher_store, leecher_transport, PeerId([2; 32]));

                let topic_key = seeder.join_topic("bench", None, false).await.unwrap();
                leecher.join_topic("bench", None, false).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;

                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("source.bin");
                std::fs::write(&path, vec![0x7bu8; 4 * 1024 * 1024]).unwrap();
                let record = seeder.add_file(&path, None).unwrap();
                seeder.share_file("bench", &path).unwrap();

                let out_path = dir.path().join("dest.bin");
                let (_session, mut events) = leecher
                    .download("bench", topic_key, record.merkle_root, out_path, &[PeerId([1; 32])])
                    .await
                    .unwrap();

                loop {
                    match events.recv().await.unwrap() {
                        swarmfs_core::SessionEvent::Complete { .. } => break,
                        swarmfs_core::SessionEvent::Error(err) => panic!("download failed: {err}"),
                        swarmfs_core::SessionEvent::Progress { .. } => continue,
                    }
                }
            });
        });
    });
}

criterion_group!(benches, bench_hash_file, bench_loopback_download);
criterion_main!(benches);
