use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use leakwatch::aggregate::outstanding::OutstandingTracker;
use leakwatch::aggregate::topk;
use leakwatch::resolve::StackResolver;
use leakwatch::tracer::event::Symbol;
use leakwatch::tracer::memory::MemoryTables;
use leakwatch::tracer::parse::{parse_alloc_info, ALLOC_INFO_SIZE};
use leakwatch::tracer::stats::ScanStats;

const RECORDS: u64 = 100_000;
const STACKS: u64 = 2_000;
const FRAMES_PER_STACK: u64 = 8;

/// 100k live allocations spread over 2k stacks, every frame symbolized.
fn build_tables() -> Arc<MemoryTables> {
    let t = Arc::new(MemoryTables::new());

    for stack in 0..STACKS {
        let addrs: Vec<u64> = (0..FRAMES_PER_STACK)
            .map(|f| 0x40_0000 + stack * 0x100 + f * 0x10)
            .collect();
        for &addr in &addrs {
            t.insert_symbol(
                addr,
                Symbol::new(format!("fn_{addr:x}"))
                    .with_module("bench")
                    .with_offset(addr & 0xf),
            );
        }
        t.insert_stack(stack as i64, addrs);
    }

    for i in 0..RECORDS {
        let stack = (i * 7919) % STACKS;
        let size = 16 + (i % 64) * 16;
        t.record_alloc_at(0x1000_0000 + i * 0x40, size, stack as i64, i);
    }
    t.set_now_ns(RECORDS * 2);

    t
}

fn bench_parse_alloc_info(c: &mut Criterion) {
    let mut raw = [0u8; ALLOC_INFO_SIZE];
    raw[..8].copy_from_slice(&4096u64.to_le_bytes());
    raw[8..16].copy_from_slice(&123_456_789u64.to_le_bytes());
    raw[16..].copy_from_slice(&42i64.to_le_bytes());

    c.bench_function("parse/alloc_info", |b| {
        b.iter(|| parse_alloc_info(black_box(0xdead_beef), black_box(&raw)).expect("parse"))
    });
}

fn bench_outstanding(c: &mut Criterion) {
    let t = build_tables();
    let resolver = StackResolver::new(t.clone(), t.clone(), 1);
    let tracker = OutstandingTracker::new(t, resolver, 0, 10);
    let stats = ScanStats::new();

    c.bench_function("outstanding/collect_100k_records", |b| {
        b.iter(|| {
            let top = tracker.collect(black_box(&stats));
            black_box(top.len())
        })
    });
}

fn bench_topk(c: &mut Criterion) {
    let items: Vec<(u64, i64)> = (0..50_000u64)
        .map(|i| (i, ((i * 2_654_435_761) % 1_000_003) as i64))
        .collect();

    c.bench_function("topk/select_10_of_50k", |b| {
        b.iter(|| {
            let top = topk::select(black_box(items.clone()), |(_, k)| *k, 10);
            black_box(top.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_alloc_info(c);
    bench_outstanding(c);
    bench_topk(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
