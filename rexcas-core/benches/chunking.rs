//! Benchmarks for digesting, chunking and reassembly
//!
//! Run with: cargo bench --package rexcas-core --bench chunking

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rexcas_core::{Chunker, Digest, Reassembler};
use std::io::Write;

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Benchmark in-memory digests at various sizes
fn bench_digest_content(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest_content");

    for size in [
        1024,                  // 1 KB
        64 * 1024,             // 64 KB
        1024 * 1024,           // 1 MB
        16 * 1024 * 1024,      // 16 MB
    ] {
        let data = generate_data(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("from_content", format_size(size)),
            &data,
            |b, data| b.iter(|| Digest::from_content(black_box(data))),
        );
    }

    group.finish();
}

/// Benchmark file digests (mmap + rayon for large files)
fn bench_digest_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest_file");

    for size in [
        64 * 1024,             // 64 KB
        4 * 1024 * 1024,       // 4 MB
        64 * 1024 * 1024,      // 64 MB
    ] {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&generate_data(size)).unwrap();
        file.flush().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("from_file", format_size(size)),
            file.path(),
            |b, path| b.iter(|| Digest::from_file(black_box(path)).unwrap()),
        );
    }

    group.finish();
}

/// Benchmark chunking a 16 MB blob at several chunk sizes
fn bench_chunk(c: &mut Criterion) {
    let data = Bytes::from(generate_data(16 * 1024 * 1024));

    let mut group = c.benchmark_group("chunk_16MB");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for chunk_size in [64 * 1024, 1024 * 1024, 4 * 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::new("memory", format_size(chunk_size)),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let chunker = Chunker::for_source(data.clone(), chunk_size).unwrap();
                    chunker.map(|c| c.unwrap().len()).sum::<usize>()
                })
            },
        );
    }

    group.finish();
}

/// Benchmark chunk + verified reassembly
fn bench_roundtrip(c: &mut Criterion) {
    let data = generate_data(16 * 1024 * 1024);
    let digest = Digest::from_content(&data);
    let source = Bytes::from(data);

    let mut group = c.benchmark_group("roundtrip_16MB");
    group.throughput(Throughput::Bytes(source.len() as u64));

    group.bench_function("1MB_chunks", |b| {
        b.iter(|| {
            let chunker = Chunker::for_source(source.clone(), 1024 * 1024).unwrap();
            let mut reassembler = Reassembler::new(Vec::with_capacity(source.len()), digest.size());
            for chunk in chunker {
                reassembler.push(&chunk.unwrap()).unwrap();
            }
            reassembler.finish_verified(black_box(&digest)).unwrap()
        })
    });

    group.finish();
}

/// Format size for display
fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{}MB", bytes / (1024 * 1024))
    } else if bytes >= 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{}B", bytes)
    }
}

criterion_group!(
    benches,
    bench_digest_content,
    bench_digest_file,
    bench_chunk,
    bench_roundtrip,
);
criterion_main!(benches);
