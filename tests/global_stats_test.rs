//! Process-wide counters
//!
//! Kept in a binary of its own: the totals cover every heap in the
//! process, so no other test may allocate concurrently.
use sweepheap::memory::stats;
use sweepheap::{StackState, SweepingType, ThreadHeap, Trace, Visitor};

struct Leaf(u64);

impl Trace for Leaf {
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}

#[test]
pub fn test_global_counters_follow_heap_lifetime() {
    let start = stats::global();
    let heap = ThreadHeap::new();

    let kept = heap.allocate(Leaf(0));
    let _root = heap.persistent(kept);
    for i in 1..100 {
        heap.allocate(Leaf(i));
    }
    let allocated = stats::global();
    assert_eq!(allocated.allocated_object_bytes - start.allocated_object_bytes, 100 * 16);
    assert_eq!(allocated.estimated_live_bytes - start.estimated_live_bytes, 100 * 16);
    assert!(allocated.allocated_space > start.allocated_space);

    heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager);
    let collected = stats::global();
    assert_eq!(collected.allocated_object_bytes - start.allocated_object_bytes, 16);
    assert_eq!(collected.marked_object_bytes - start.marked_object_bytes, 16);
    assert_eq!(collected.estimated_live_bytes - start.estimated_live_bytes, 16);
    assert_eq!(collected.collections, start.collections + 1);
    assert_eq!(unsafe { kept.as_ref() }.0, 0);

    drop(heap);
    let dropped = stats::global();
    assert_eq!(dropped.allocated_object_bytes, start.allocated_object_bytes);
    assert_eq!(dropped.allocated_space, start.allocated_space);
    assert_eq!(dropped.marked_object_bytes, start.marked_object_bytes);
    assert_eq!(dropped.estimated_live_bytes, start.estimated_live_bytes);
}
