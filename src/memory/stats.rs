//! Allocation and collection counters
//!
//! Each heap keeps its own counters and also feeds a set of
//! process-wide totals, readable from any thread for diagnostics.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::time::Duration;

/// Bytes of objects allocated across all heaps (headers included)
pub static ALLOCATED_OBJECT_BYTES: AtomicUsize = AtomicUsize::new(0);
/// Bytes of page memory in use across all heaps
pub static ALLOCATED_SPACE: AtomicUsize = AtomicUsize::new(0);
/// Bytes of objects marked by the most recent cycle of each heap
pub static MARKED_OBJECT_BYTES: AtomicUsize = AtomicUsize::new(0);
/// Bytes allocated by each heap since its most recent cycle
pub static ALLOCATED_SINCE_GC: AtomicUsize = AtomicUsize::new(0);
/// Completed collection cycles across all heaps
pub static COLLECTIONS: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the process-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalStats {
    pub allocated_object_bytes: usize,
    pub allocated_space: usize,
    pub marked_object_bytes: usize,
    /// Marked bytes plus everything allocated since
    pub estimated_live_bytes: usize,
    pub collections: u64,
}

/// Current process-wide totals
pub fn global() -> GlobalStats {
    let marked_object_bytes = MARKED_OBJECT_BYTES.load(Relaxed);
    GlobalStats {
        allocated_object_bytes: ALLOCATED_OBJECT_BYTES.load(Relaxed),
        allocated_space: ALLOCATED_SPACE.load(Relaxed),
        marked_object_bytes,
        estimated_live_bytes: marked_object_bytes + ALLOCATED_SINCE_GC.load(Relaxed),
        collections: COLLECTIONS.load(Relaxed),
    }
}

/// Per-heap counters. Single-threaded, like the heap that owns them.
#[derive(Debug, Default)]
pub struct HeapCounters {
    allocated_object_bytes: Cell<usize>,
    allocated_space: Cell<usize>,
    allocated_since_gc: Cell<usize>,
    marked_bytes: Cell<usize>,
    collections: Cell<u64>,
    mark_time: Cell<Duration>,
    sweep_time: Cell<Duration>,
}

impl HeapCounters {
    pub fn increase_allocated_object_bytes(&self, bytes: usize) {
        self.allocated_object_bytes
            .set(self.allocated_object_bytes.get() + bytes);
        self.allocated_since_gc
            .set(self.allocated_since_gc.get() + bytes);
        ALLOCATED_OBJECT_BYTES.fetch_add(bytes, Relaxed);
        ALLOCATED_SINCE_GC.fetch_add(bytes, Relaxed);
    }

    pub fn decrease_allocated_object_bytes(&self, bytes: usize) {
        debug_assert!(bytes <= self.allocated_object_bytes.get());
        self.allocated_object_bytes
            .set(self.allocated_object_bytes.get().saturating_sub(bytes));
        ALLOCATED_OBJECT_BYTES.fetch_sub(bytes, Relaxed);
    }

    pub fn increase_allocated_space(&self, bytes: usize) {
        self.allocated_space.set(self.allocated_space.get() + bytes);
        ALLOCATED_SPACE.fetch_add(bytes, Relaxed);
    }

    pub fn decrease_allocated_space(&self, bytes: usize) {
        debug_assert!(bytes <= self.allocated_space.get());
        self.allocated_space
            .set(self.allocated_space.get().saturating_sub(bytes));
        ALLOCATED_SPACE.fetch_sub(bytes, Relaxed);
    }

    /// Record the result of a marking phase and restart the
    /// allocation clock
    pub fn record_marking(&self, marked_bytes: usize, elapsed: Duration) {
        let previous = self.marked_bytes.replace(marked_bytes);
        MARKED_OBJECT_BYTES.fetch_sub(previous, Relaxed);
        MARKED_OBJECT_BYTES.fetch_add(marked_bytes, Relaxed);
        ALLOCATED_SINCE_GC.fetch_sub(self.allocated_since_gc.take(), Relaxed);
        self.collections.set(self.collections.get() + 1);
        COLLECTIONS.fetch_add(1, Relaxed);
        self.mark_time.set(self.mark_time.get() + elapsed);
    }

    pub fn record_sweep_time(&self, elapsed: Duration) {
        self.sweep_time.set(self.sweep_time.get() + elapsed);
    }

    /// Remove this heap's contribution from the process totals
    pub fn detach(&self) {
        ALLOCATED_OBJECT_BYTES.fetch_sub(self.allocated_object_bytes.take(), Relaxed);
        ALLOCATED_SPACE.fetch_sub(self.allocated_space.take(), Relaxed);
        MARKED_OBJECT_BYTES.fetch_sub(self.marked_bytes.take(), Relaxed);
        ALLOCATED_SINCE_GC.fetch_sub(self.allocated_since_gc.take(), Relaxed);
    }

    pub fn allocated_object_bytes(&self) -> usize {
        self.allocated_object_bytes.get()
    }

    pub fn allocated_space(&self) -> usize {
        self.allocated_space.get()
    }

    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc.get()
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.get()
    }

    /// Live bytes as of the last marking plus everything allocated
    /// since
    pub fn estimated_live_bytes(&self) -> usize {
        self.marked_bytes.get() + self.allocated_since_gc.get()
    }

    pub fn collections(&self) -> u64 {
        self.collections.get()
    }

    pub fn mark_time(&self) -> Duration {
        self.mark_time.get()
    }

    pub fn sweep_time(&self) -> Duration {
        self.sweep_time.get()
    }
}

/// Snapshot of a heap's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Swept normal pages
    pub normal_pages: usize,
    /// Normal pages awaiting a lazy sweep
    pub unswept_pages: usize,
    /// Large object pages, swept or not
    pub large_pages: usize,
    /// Empty pages held for reuse
    pub pooled_pages: usize,
    /// Bytes of allocated objects, headers included
    pub allocated_object_bytes: usize,
    /// Bytes of page memory held
    pub allocated_space: usize,
    /// Bytes marked by the last cycle
    pub marked_bytes: usize,
    pub estimated_live_bytes: usize,
    /// Bytes on the normal arenas' free lists
    pub free_list_bytes: usize,
    pub collections: u64,
    /// Time spent marking (with `gc-telemetry`)
    pub mark_time: Duration,
    /// Time spent sweeping (with `gc-telemetry`)
    pub sweep_time: Duration,
}
