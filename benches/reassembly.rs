// Reassembly Benchmarks
//
// Measures how fast disk images are rebuilt from decompressed parts.
//
// Key metrics:
// - Sparse writer throughput on mostly-empty and dense data
// - Full pull + reassembly from a warm cache

use std::hint::black_box;
use std::io::Cursor;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use vmkeeper::cancel::CancelToken;
use vmkeeper::registry::mock::{MockRegistry, PublishOptions};
use vmkeeper::registry::{ImageReference, Puller};
use vmkeeper::vm::disk::write_sparse;

const IMAGE_SIZE: usize = 16 * 1024 * 1024;

fn image(density: usize) -> Vec<u8> {
    // every `density`-th 64 KiB block carries data
    let mut data = vec![0u8; IMAGE_SIZE];
    for (i, block) in data.chunks_mut(64 * 1024).enumerate() {
        if density > 0 && i % density == 0 {
            block.fill((i % 255) as u8 + 1);
        }
    }
    data
}

/// Benchmark: sparse writer over images with different data density
fn bench_write_sparse(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_sparse");
    group.throughput(Throughput::Bytes(IMAGE_SIZE as u64));

    for density in [1usize, 8, 0] {
        let data = image(density);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        group.bench_with_input(BenchmarkId::from_parameter(density), &data, |b, data| {
            b.iter(|| {
                let mut out = std::fs::File::create(&path).unwrap();
                let written = write_sparse(&mut Cursor::new(black_box(data)), &mut out).unwrap();
                black_box(written);
            });
        });
    }
    group.finish();
}

/// Benchmark: pull with every part already cached
fn bench_warm_pull(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish_image("vmkeeper/bench", "latest", &image(4), 2 * 1024 * 1024, PublishOptions::default());
    let puller = Puller::new(registry, tmp.path(), "vmkeeper", 4);

    rt.block_on(async {
        puller.pull("bench", &CancelToken::new()).await.unwrap();
    });

    let reference = ImageReference::parse("bench").unwrap();
    let mut group = c.benchmark_group("pull");
    group.throughput(Throughput::Bytes(IMAGE_SIZE as u64));
    group.sample_size(20);
    group.bench_function("warm_cache", |b| {
        b.iter(|| {
            rt.block_on(async {
                // dropping the record forces reassembly; blobs stay cached
                puller.index().remove(&reference).await.unwrap();
                let record = puller.pull("bench", &CancelToken::new()).await.unwrap();
                black_box(record);
            });
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write_sparse, bench_warm_pull);
criterion_main!(benches);
