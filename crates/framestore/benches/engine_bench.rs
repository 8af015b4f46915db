//! Benchmarks for the framestore engine.
//!
//! Run with: cargo bench --package framestore
//!
//! ## Benchmark Categories
//!
//! - **Append**: single-producer write path, including rollover
//! - **Range Read**: catalog query plus block scans through the callback
//! - **Iterator**: full forward traversal and timestamp seeks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use framestore::{allocate, FrameIterator, Reader, Writer};
use tempfile::TempDir;

const PAYLOAD_LEN: usize = 4096;
const PREPARED_FRAMES: i64 = 10_000;

fn prepared_store() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.nts");
    allocate(&path, 4 * 1024 * 1024, 64).unwrap();

    let writer = Writer::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("bench", "").unwrap();
    let payload = vec![0x5au8; PAYLOAD_LEN];
    for ts in 1..=PREPARED_FRAMES {
        writer.write(&mut ctx, &payload, ts, 0).unwrap();
    }
    drop(ctx);
    (dir, path)
}

fn bench_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("append.nts");
    allocate(&path, 4 * 1024 * 1024, 16).unwrap();

    let writer = Writer::open(&path, true).unwrap();
    let mut ctx = writer.create_write_context("append", "").unwrap();
    let payload = vec![0xa5u8; PAYLOAD_LEN];
    let mut ts = 0i64;

    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));
    group.bench_function("write_4k", |b| {
        b.iter(|| {
            ts += 1;
            writer
                .write(&mut ctx, black_box(&payload), ts, 0)
                .unwrap();
        })
    });
    group.finish();
}

fn bench_range_read(c: &mut Criterion) {
    let (_dir, path) = prepared_store();
    let reader = Reader::open(&path).unwrap();

    let mut group = c.benchmark_group("range_read");
    group.throughput(Throughput::Bytes(PREPARED_FRAMES as u64 * PAYLOAD_LEN as u64));
    group.bench_function("read_10k_frames", |b| {
        b.iter(|| {
            let mut total = 0usize;
            reader
                .read("bench", 0, i64::MAX, |frame| total += frame.payload.len())
                .unwrap();
            black_box(total)
        })
    });
    group.finish();
}

fn bench_iterator_scan(c: &mut Criterion) {
    let (_dir, path) = prepared_store();

    c.bench_function("iterator_scan_10k", |b| {
        b.iter(|| {
            let mut it = FrameIterator::open(&path, "bench").unwrap();
            let mut frames = 0u64;
            while it.valid() {
                black_box(it.current().unwrap().timestamp);
                it.next().unwrap();
                frames += 1;
            }
            frames
        })
    });
}

fn bench_iterator_find(c: &mut Criterion) {
    let (_dir, path) = prepared_store();
    let mut it = FrameIterator::open(&path, "bench").unwrap();
    let mut target = 1i64;

    c.bench_function("iterator_find", |b| {
        b.iter(|| {
            target = (target * 7919 + 13) % PREPARED_FRAMES + 1;
            it.find(black_box(target)).unwrap();
            black_box(it.current().map(|frame| frame.timestamp))
        })
    });
}

criterion_group!(
    benches,
    bench_append,
    bench_range_read,
    bench_iterator_scan,
    bench_iterator_find
);
criterion_main!(benches);
