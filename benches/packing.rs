//! 패킹 경로와 순회 경로의 마이크로벤치마크.
//!
//! 틱 예산 안에서 처리 가능한 원소 수를 가늠하는 용도다.

use std::collections::BinaryHeap;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ovs::buffer::PacketBuffer;
use ovs::frustum::{DetailParams, ViewFrustum};
use ovs::sequence::SequenceWindow;
use ovs::traversal::{BatchOutcome, Traversal};
use ovs::tree::{descend, EncodeDetail, EncodeOutcome, TreeElement, WorldContent};
use ovs::voxel::VoxelTree;

/// 시드 고정 난수로 흩뿌린 데모 장면
fn build_tree(count: usize, seed: u64) -> VoxelTree {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tree = VoxelTree::with_default_bounds();
    for _ in 0..count {
        let depth = rng.gen_range(2..=5);
        let path: Vec<u8> = (0..depth).map(|_| rng.gen_range(0..8u8)).collect();
        let color = [rng.gen(), rng.gen(), rng.gen()];
        let _ = tree.set_voxel(&path, color, 1_000);
    }
    tree
}

fn collect_paths(element: &dyn TreeElement, path: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
    out.push(path.clone());
    for octant in 0..8 {
        if let Some(child) = element.child(octant) {
            path.push(octant);
            collect_paths(child, path, out);
            path.pop();
        }
    }
}

/// 전체 장면을 섹션 단위로 패킹: 원소 인코딩 + (선택) zstd 압축
fn bench_section_packing(c: &mut Criterion) {
    let tree = build_tree(4096, 99);
    let mut paths = Vec::new();
    collect_paths(tree.root(), &mut Vec::new(), &mut paths);

    let mut group = c.benchmark_group("section_packing");
    for compress in [false, true] {
        let label = if compress { "zstd" } else { "raw" };
        group.bench_with_input(
            BenchmarkId::new("full_scene", label),
            &compress,
            |b, &compress| {
                let mut buffer = PacketBuffer::new(compress, 3, 1400);
                b.iter(|| {
                    let mut packed = 0u64;
                    for path in &paths {
                        let node = match descend(tree.root(), path) {
                            Some(node) => node,
                            None => continue,
                        };
                        buffer.begin_section();
                        match node.encode_payload(path, &mut buffer, EncodeDetail::Full) {
                            EncodeOutcome::Appended => {
                                buffer.end_section();
                                packed += 1;
                            }
                            EncodeOutcome::DidntFit => {
                                // 섹션 버퍼를 비우고 같은 원소를 다시 담는다
                                buffer.discard_section();
                                if buffer.has_content() {
                                    black_box(buffer.finalize().ok());
                                    buffer.reset();
                                }
                                buffer.begin_section();
                                if node.encode_payload(path, &mut buffer, EncodeDetail::Full)
                                    == EncodeOutcome::Appended
                                {
                                    buffer.end_section();
                                    packed += 1;
                                } else {
                                    buffer.discard_section();
                                }
                            }
                        }
                    }
                    if buffer.has_content() {
                        black_box(buffer.finalize().ok());
                    }
                    buffer.reset();
                    black_box(packed)
                })
            },
        );
    }
    group.finish();
}

/// 첫 패스 순회: 절두체 판정 + 우선순위 계산 + 힙 적재
fn bench_first_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_pass");
    for &count in &[512usize, 4096] {
        let tree = build_tree(count, 7);
        let view = ViewFrustum::new(
            Vec3::new(0.0, 0.0, 500.0),
            Quat::IDENTITY,
            90.0,
            0.1,
            4000.0,
        );
        let detail = DetailParams::default();

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let mut queue = BinaryHeap::new();
                let mut traversal =
                    Traversal::start(view, detail, tree.root_cube(), None, 0.1, 1.0);
                loop {
                    let (outcome, _) =
                        traversal.next_batch(tree.root(), &mut queue, Duration::from_millis(50));
                    if outcome == BatchOutcome::Exhausted {
                        break;
                    }
                }
                black_box(queue.len())
            })
        });
    }
    group.finish();
}

/// 손실이 섞인 수신 스트림의 시퀀스 추적
fn bench_sequence_window(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(3);
    let sequences: Vec<u16> = (0..10_000u32)
        .filter(|_| !rng.gen_bool(0.05))
        .map(|seq| seq as u16)
        .collect();

    c.bench_function("sequence_window_5pct_loss", |b| {
        b.iter(|| {
            let mut window = SequenceWindow::new(4096, 1000);
            for &seq in &sequences {
                window.record(seq);
            }
            black_box(window.missing_count())
        })
    });
}

criterion_group!(
    benches,
    bench_section_packing,
    bench_first_pass,
    bench_sequence_window
);
criterion_main!(benches);
