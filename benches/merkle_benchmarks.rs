//! Benchmarks for Merkle tree construction and proof generation/verification
//! over realistic leaf counts (§4.1).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use swarmfs_files::hash;
use swarmfs_files::merkle::{verify_leaf_proof, MerkleTree};

fn leaves_of(count: usize) -> Vec<[u8; 32]> {
    (0..count as u64).map(|i| hash(&i.to_le_bytes())).collect()
}

fn bench_tree_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_tree_construction");
    for &count in &[16usize, 256, 4096, 65536] {
        let leaves = leaves_of(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &leaves, |b, leaves| {
            b.iter(|| MerkleTree::from_leaves(black_box(leaves.clone())));
        });
    }
    group.finish();
}

fn bench_leaf_proof_generation(c: &mut Criterion) {
    let leaves = leaves_of(65536);
    let tree = MerkleTree::from_leaves(leaves);
    c.bench_function("merkle_prove_leaf_65536", |b| {
        b.iter(|| tree.prove_leaf(black_box(12345)).unwrap());
    });
}

fn bench_leaf_proof_verification(c: &mut Criterion) {
    let leaves = leaves_of(65536);
    let tree = MerkleTree::from_leaves(leaves.clone());
    let root = tree.root();
    let proof = tree.prove_leaf(12345).unwrap();
    c.bench_function("merkle_verify_leaf_65536", |b| {
        b.iter(|| verify_leaf_proof(black_box(leaves[12345]), 12345, leaves.len(), &proof, &root).unwrap());
    });
}

criterion_group!(benches, bench_tree_construction, bench_leaf_proof_generation, bench_leaf_proof_verification);
criterion_main!(benches);
