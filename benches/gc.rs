//! GC collection benchmarks
//!
//! Allocation followed by collection, collection with varying
//! survivor ratios and tracing of deep structures.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use sweepheap::{Member, Persistent, StackState, SweepingType, ThreadHeap, Trace, Visitor};

struct Node {
    value: u64,
    next: Option<Member<Node>>,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.next.trace(visitor);
    }
}

fn allocate_nodes(heap: &ThreadHeap, n: usize) -> Vec<Member<Node>> {
    (0..n)
        .map(|i| {
            heap.allocate(Node {
                value: i as u64,
                next: None,
            })
        })
        .collect()
}

/// Allocate objects then collect with no survivors
fn bench_alloc_then_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_alloc_then_collect");

    for count in [256, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let heap = ThreadHeap::new();
                black_box(allocate_nodes(&heap, count));
                heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager);
            });
        });
    }
    group.finish();
}

/// Collect with a varying percentage of rooted objects
fn bench_collect_with_survivors(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_collect_with_survivors");

    let total = 1024;
    for survivor_pct in [0, 25, 50, 75, 100] {
        group.bench_with_input(BenchmarkId::new("pct", survivor_pct), &survivor_pct, |b, &pct| {
            b.iter(|| {
                let heap = ThreadHeap::new();
                let nodes = allocate_nodes(&heap, total);
                let keep = total * pct / 100;
                let roots: Vec<Persistent<Node>> = nodes.iter().take(keep).map(|n| heap.persistent(*n)).collect();
                heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager);
                black_box(roots.len())
            });
        });
    }
    group.finish();
}

/// Mark a long list, exercising the fallback from recursive tracing
/// to the marking stack
fn bench_mark_deep_list(c: &mut Criterion) {
    let heap = ThreadHeap::new();
    let mut head = None;
    for i in 0..100_000 {
        head = Some(heap.allocate(Node { value: i, next: head }));
    }
    let _root = head.map(|h| heap.persistent(h));

    c.bench_function("gc_mark_deep_list", |b| {
        b.iter(|| heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager))
    });
}

criterion_group!(
    benches,
    bench_alloc_then_collect,
    bench_collect_with_survivors,
    bench_mark_deep_list
);
criterion_main!(benches);
