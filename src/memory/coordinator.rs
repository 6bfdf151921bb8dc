//! Process-wide coordination of thread heaps
//!
//! Every `ThreadHeap` registers here for an id, which is stamped into
//! the headers of its pages so a visitor can tell its own objects
//! from other heaps'. Collection cycles take the cycle lock so only
//! one is ever in flight in the process.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug)]
struct Registry {
    next_id: u32,
    heaps: BTreeSet<u32>,
}

pub struct GcCoordinator {
    registry: Mutex<Registry>,
    cycle: Mutex<()>,
    cycles_completed: AtomicU64,
}

lazy_static! {
    static ref GC_COORDINATOR: GcCoordinator = GcCoordinator::new();
}

/// Held for the duration of a collection cycle
pub struct CycleGuard<'a> {
    coordinator: &'a GcCoordinator,
    heap_id: u32,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .cycles_completed
            .fetch_add(1, Ordering::Relaxed);
        log::trace!("heap {} released the cycle lock", self.heap_id);
    }
}

impl GcCoordinator {
    fn new() -> Self {
        GcCoordinator {
            registry: Mutex::new(Registry {
                next_id: 1,
                heaps: BTreeSet::new(),
            }),
            cycle: Mutex::new(()),
            cycles_completed: AtomicU64::new(0),
        }
    }

    pub fn global() -> &'static GcCoordinator {
        &GC_COORDINATOR
    }

    /// Hand out a fresh heap id. Ids are never reused.
    pub fn register_heap(&self) -> u32 {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id = match id.checked_add(1) {
            Some(next) => next,
            None => crate::fatal!("heap ids exhausted"),
        };
        registry.heaps.insert(id);
        log::debug!("heap {} registered", id);
        id
    }

    pub fn unregister_heap(&self, id: u32) {
        if self.registry.lock().heaps.remove(&id) {
            log::debug!("heap {} unregistered", id);
        }
    }

    /// Number of heaps currently alive
    pub fn heap_count(&self) -> usize {
        self.registry.lock().heaps.len()
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.registry.lock().heaps.contains(&id)
    }

    /// Block until no other cycle is in flight, then hold the cycle
    /// lock until the guard is dropped
    pub fn begin_cycle(&self, heap_id: u32) -> CycleGuard<'_> {
        let lock = self.cycle.lock();
        log::trace!("heap {} holds the cycle lock", heap_id);
        CycleGuard {
            coordinator: self,
            heap_id,
            _lock: lock,
        }
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_registration() {
        let coordinator = GcCoordinator::new();
        let a = coordinator.register_heap();
        let b = coordinator.register_heap();
        assert_ne!(a, b);
        assert!(a > 0);
        assert_eq!(coordinator.heap_count(), 2);
        coordinator.unregister_heap(a);
        assert!(!coordinator.is_registered(a));
        assert!(coordinator.is_registered(b));
    }

    #[test]
    pub fn test_cycles_counted() {
        let coordinator = GcCoordinator::new();
        {
            let _guard = coordinator.begin_cycle(1);
        }
        let _guard = coordinator.begin_cycle(2);
        assert_eq!(coordinator.cycles_completed(), 1);
    }
}
