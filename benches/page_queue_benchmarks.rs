/// Page queue benchmarks
///
/// 1. push + flush + recycle cycle at several write sizes
/// 2. frame header encode/decode
/// 3. incremental frame reassembly over fragmented input

use std::collections::VecDeque;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagewire::{FrameDecoder, PacketHeader, PageQueue};
use rand::Rng;

const PAGE_SIZE: usize = 4096;

/// Writes, hands every page off, recycles them as the worker would
fn bench_push_flush_recycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_queue_cycle");

    for size in [64usize, 1024, 4096, 16 * 1024] {
        let data = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            let mut queue = PageQueue::new(PAGE_SIZE, 8, 64).unwrap();
            let recycler = queue.recycler();
            let mut pending = VecDeque::new();

            b.iter(|| {
                queue.push(black_box(data)).unwrap();
                queue.flush();
                queue.drain_into(&mut pending);
                for page in pending.drain(..) {
                    recycler.recycle(page);
                }
            })
        });
    }

    group.finish();
}

/// Many small writes coalescing into pages
fn bench_small_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("small_writes");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("1000x16B", |b| {
        let mut queue = PageQueue::new(PAGE_SIZE, 8, 64).unwrap();
        let chunk = [7u8; 16];
        let mut pending = VecDeque::new();

        b.iter(|| {
            for _ in 0..1000 {
                queue.push(black_box(&chunk)).unwrap();
            }
            queue.flush();
            queue.drain_into(&mut pending);
            for page in pending.drain(..) {
                queue.recycle(page);
            }
        })
    });

    group.finish();
}

fn bench_header_codec(c: &mut Criterion) {
    let header = PacketHeader::data(PAGE_SIZE).unwrap();
    let encoded = header.encode();

    c.bench_function("header_encode", |b| b.iter(|| black_box(header).encode()));
    c.bench_function("header_decode", |b| {
        b.iter(|| PacketHeader::decode(black_box(&encoded)).unwrap())
    });
}

/// Frames of random length fed to the decoder in random-size fragments
fn bench_frame_reassembly(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let mut wire = Vec::new();
    for _ in 0..256 {
        let len = rng.gen_range(1..=PAGE_SIZE);
        wire.extend_from_slice(&PacketHeader::data(len).unwrap().encode());
        wire.extend(std::iter::repeat(0xCDu8).take(len));
    }

    let mut fragments = Vec::new();
    let mut offset = 0;
    while offset < wire.len() {
        let len = rng.gen_range(1..=1500).min(wire.len() - offset);
        fragments.push(&wire[offset..offset + len]);
        offset += len;
    }

    let mut group = c.benchmark_group("frame_reassembly");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("256_frames_fragmented", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut count = 0;
            for fragment in &fragments {
                count += decoder.push(fragment).unwrap().len();
            }
            black_box(count)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_push_flush_recycle,
    bench_small_writes,
    bench_header_codec,
    bench_frame_reassembly
);
criterion_main!(benches);
