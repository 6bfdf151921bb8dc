//! Allocation benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sweepheap::memory::gcinfo::GcInfoTable;
use sweepheap::{Member, StackState, SweepingType, ThreadHeap, Trace, Visitor};

struct Cons {
    head: u64,
    tail: Option<Member<Cons>>,
}

impl Trace for Cons {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.tail.trace(visitor);
    }
}

struct Blob([u64; 64]);

impl Trace for Blob {
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}

/// Allocate a list of `n` cells
fn alloc_list(heap: &ThreadHeap, n: usize) -> Option<Member<Cons>> {
    let mut tail = None;
    for i in 0..n {
        tail = Some(heap.allocate(Cons {
            head: i as u64,
            tail,
        }));
    }
    tail
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let heap = ThreadHeap::new();

    let blob_index = GcInfoTable::global().index_for::<Blob>();

    // nothing is rooted so the threshold-driven collections keep the
    // heap small
    c.bench_function("alloc_small", |b| {
        b.iter(|| {
            let cell = heap.allocate(Cons { head: 1, tail: None });
            heap.collect_if_needed();
            cell
        })
    });
    c.bench_function("alloc_512_bytes", |b| {
        b.iter(|| {
            let blob = heap.allocate(Blob([0; 64]));
            heap.collect_if_needed();
            blob
        })
    });
    c.bench_function("alloc_large_object", |b| {
        b.iter(|| {
            let payload = heap.allocate_raw(black_box(128 * 1024), blob_index);
            heap.collect_if_needed();
            payload
        })
    });

    let mut group = c.benchmark_group("alloc_into_swept_pages");
    for count in [1024, 8192] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let heap = ThreadHeap::new();
                alloc_list(&heap, count);
                heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Lazy);
                // all garbage: lazy sweep hands pages back as we go
                black_box(alloc_list(&heap, count))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
