//! The thread heap
//!
//! A `ThreadHeap` owns the arenas of one mutator thread together with
//! the collector state, the roots and the counters. All allocation
//! and collection on the thread goes through it.
//!
//! The heap is neither `Send` nor `Sync`. Re-entering it from a
//! finalizer or from a trace method is a fatal error.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt::{self, Debug};
use std::mem::{align_of, size_of};
use std::ptr;
use std::rc::Rc;

use super::address::{Address, ALLOCATION_GRANULARITY, LARGE_OBJECT_SIZE_THRESHOLD, MAX_HEAP_OBJECT_SIZE};
use super::arena::{
    allocation_size, arena_index_for_size, ArenaContext, LargeObjectArena, NormalPageArena, PagePool,
    NORMAL_ARENA_COUNT,
};
use super::classifier::{AddressClassifier, PageRef};
use super::collect::{mark_heap, telemetry, CollectorContext, GcPhase};
use super::coordinator::GcCoordinator;
use super::freelist::FREE_LIST_ENTRY_SIZE;
use super::gcinfo::GcInfoTable;
use super::header::{ObjectHeader, HEADER_MAGIC, HEADER_SIZE};
use super::page::{finalize_object, page_header_from_object};
use super::persistent::{Persistent, PersistentRegion};
use super::stack::{scan_stack, RootProvider, StackState};
use super::stats::{HeapCounters, HeapStats};
use super::visitor::{GarbageCollected, Member, Visitor};
use crate::config::{HeapConfig, SweepingType};
use crate::error::HeapError;

/// Bytes of each page's payload included in a heap dump
const DUMP_BYTES: usize = 64;

/// Handle for removing a registered root provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootProviderHandle(usize);

/// Allocation state
struct HeapState {
    arenas: [NormalPageArena; NORMAL_ARENA_COUNT],
    large: LargeObjectArena,
    pool: PagePool,
    classifier: AddressClassifier,
}

impl HeapState {
    fn new(config: &HeapConfig) -> Self {
        HeapState {
            arenas: std::array::from_fn(NormalPageArena::new),
            large: LargeObjectArena::new(),
            pool: PagePool::new(config.page_pool_capacity),
            classifier: AddressClassifier::new(),
        }
    }

    fn has_unswept_pages(&self) -> bool {
        self.large.has_unswept_pages() || self.arenas.iter().any(|a| a.has_unswept_pages())
    }
}

impl Debug for HeapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for arena in &self.arenas {
            writeln!(f, "{:?}", arena)?;
        }
        writeln!(f, "large objects:")?;
        write!(f, "{:?}", self.large)?;
        writeln!(f, "pooled pages: {}", self.pool.len())
    }
}

pub struct ThreadHeap {
    id: u32,
    state: UnsafeCell<HeapState>,
    context: UnsafeCell<CollectorContext>,
    counters: HeapCounters,
    persistents: Rc<PersistentRegion>,
    root_providers: RefCell<Vec<(RootProviderHandle, Box<dyn RootProvider>)>>,
    next_provider: Cell<usize>,
    stack_base: Cell<Option<Address>>,
    config: HeapConfig,
    /// Set while the heap is running sweeps, finalizers or marking
    busy: Cell<bool>,
    /// The last marking left unreachable objects whose finalizers
    /// have not run yet
    pending_finalization: Cell<bool>,
}

impl Default for ThreadHeap {
    fn default() -> Self {
        ThreadHeap::new()
    }
}

impl ThreadHeap {
    /// A heap with the default configuration and any overrides from
    /// the environment
    pub fn new() -> Self {
        ThreadHeap::with_config(HeapConfig::from_env())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let mut context = CollectorContext::new();
        context.init();
        let id = GcCoordinator::global().register_heap();
        ThreadHeap {
            id,
            state: UnsafeCell::new(HeapState::new(&config)),
            context: UnsafeCell::new(context),
            counters: HeapCounters::default(),
            persistents: PersistentRegion::new(),
            root_providers: RefCell::new(vec![]),
            next_provider: Cell::new(0),
            stack_base: Cell::new(None),
            config,
            busy: Cell::new(false),
            pending_finalization: Cell::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn phase(&self) -> GcPhase {
        self.context().phase()
    }

    fn context(&self) -> &CollectorContext {
        unsafe { &*self.context.get() }
    }

    /// Exclusive access to the allocation state for the duration of
    /// `f`. Sweeping and finalizers may run inside.
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut [NormalPageArena; NORMAL_ARENA_COUNT], &mut LargeObjectArena, &mut ArenaContext<'_>) -> R,
    ) -> R {
        if self.busy.replace(true) {
            crate::fatal!("heap {} re-entered from a finalizer or trace method", self.id);
        }
        // SAFETY: the busy flag guarantees no other borrow of the
        // state is live
        let state = unsafe { &mut *self.state.get() };
        let HeapState {
            arenas,
            large,
            pool,
            classifier,
        } = state;
        let mut ctx = ArenaContext {
            heap_id: self.id,
            pool,
            classifier,
            counters: &self.counters,
            zap: self.config.zap_freed_memory,
        };
        let result = f(arenas, large, &mut ctx);
        self.busy.set(false);
        result
    }

    fn check_allocation_allowed(&self) {
        if !self.context().is_allocation_allowed() {
            crate::fatal!("allocation on heap {} during {:?}", self.id, self.phase());
        }
    }

    /// Allocate `payload_size` uninitialised bytes for an object of
    /// the type registered at `gc_info_index`
    pub fn try_allocate_raw(&self, payload_size: usize, gc_info_index: u32) -> Result<Address, HeapError> {
        self.check_allocation_allowed();
        if payload_size > MAX_HEAP_OBJECT_SIZE {
            return Err(HeapError::InvalidAllocationSize {
                requested: payload_size,
                max: MAX_HEAP_OBJECT_SIZE,
            });
        }

        self.finalize_unreachable();
        let size = allocation_size(payload_size);
        let payload = self.with_state(|arenas, large, ctx| {
            if size >= LARGE_OBJECT_SIZE_THRESHOLD {
                large.allocate(payload_size, gc_info_index, ctx)
            } else {
                arenas[arena_index_for_size(size)].allocate(size, gc_info_index, ctx)
            }
        })?;
        self.finish_cycle_if_swept();
        Ok(payload)
    }

    /// As `try_allocate_raw` but failure is fatal
    pub fn allocate_raw(&self, payload_size: usize, gc_info_index: u32) -> Address {
        match self.try_allocate_raw(payload_size, gc_info_index) {
            Ok(payload) => payload,
            Err(e) => crate::fatal!("heap {}: {}", self.id, e),
        }
    }

    /// Move `value` onto the heap
    pub fn try_allocate<T: GarbageCollected>(&self, value: T) -> Result<Member<T>, HeapError> {
        if align_of::<T>() > ALLOCATION_GRANULARITY {
            crate::fatal!(
                "{} needs alignment {}, heap objects are aligned to {}",
                std::any::type_name::<T>(),
                align_of::<T>(),
                ALLOCATION_GRANULARITY
            );
        }
        let index = GcInfoTable::global().index_for::<T>();
        let payload = self.try_allocate_raw(size_of::<T>(), index)?;
        unsafe {
            ptr::write(payload.as_mut_ptr::<T>(), value);
            Ok(Member::from_payload(payload))
        }
    }

    pub fn allocate<T: GarbageCollected>(&self, value: T) -> Member<T> {
        match self.try_allocate(value) {
            Ok(member) => member,
            Err(e) => crate::fatal!("heap {}: {}", self.id, e),
        }
    }

    /// The header of an allocated object of this heap
    pub fn header_for(&self, payload: Address) -> Result<&ObjectHeader, HeapError> {
        let header = self.with_state(|_, _, ctx| Self::find_own_header(ctx.classifier, payload))?;
        Ok(header)
    }

    fn find_own_header<'a>(classifier: &AddressClassifier, payload: Address) -> Result<&'a mut ObjectHeader, HeapError> {
        let not_ours = HeapError::NotHeapObject(payload);
        if !payload.is_aligned(ALLOCATION_GRANULARITY) {
            return Err(not_ours);
        }
        let valid = match classifier.classify(payload) {
            Some(PageRef::Normal(page)) => unsafe { page.as_ref() }.contains(payload.sub(HEADER_SIZE)),
            Some(PageRef::Large(page)) => unsafe { page.as_ref() }.payload() == payload,
            None => false,
        };
        if !valid {
            return Err(not_ours);
        }
        let candidate = unsafe { &*payload.sub(HEADER_SIZE).as_ptr::<ObjectHeader>() };
        if candidate.magic() != HEADER_MAGIC || candidate.is_free() || candidate.is_dead() {
            return Err(not_ours);
        }
        // unmarked objects on a page awaiting sweep are garbage
        let page = unsafe { page_header_from_object(candidate.address()) };
        if !page.is_swept() && !candidate.is_marked() {
            return Err(not_ours);
        }
        Ok(unsafe { ObjectHeader::from_payload(payload) })
    }

    /// Whether the address lies in a page of this heap
    pub fn contains(&self, address: Address) -> bool {
        self.with_state(|_, _, ctx| ctx.classifier.classify(address).is_some())
    }

    /// Finalize and release an object now rather than at the next
    /// collection
    ///
    /// The caller guarantees nothing will use the object again.
    pub fn promptly_free(&self, payload: Address) -> Result<(), HeapError> {
        self.check_allocation_allowed();
        self.with_state(|arenas, large, ctx| {
            let header = Self::find_own_header(ctx.classifier, payload)?;
            finalize_object(header);
            if header.is_large_object() {
                large.promptly_free(payload, ctx);
            } else {
                let arena_index = unsafe { page_header_from_object(header.address()) }.arena_index();
                arenas[arena_index].promptly_free(header, ctx);
            }
            Ok::<(), HeapError>(())
        })
    }

    /// Resize an object, moving it if it cannot be resized in place
    ///
    /// A size of zero frees the object and returns `None`. Types with
    /// a finalizer are refused: the finalizer belongs to the original
    /// allocation.
    pub fn reallocate(&self, payload: Address, new_payload_size: usize) -> Result<Option<Address>, HeapError> {
        self.check_allocation_allowed();
        let (gc_info_index, size, old_payload_size) = {
            let header = self.header_for(payload)?;
            (header.gc_info_index(), header.size(), header.payload_size())
        };
        let info = GcInfoTable::global().lookup(gc_info_index);
        if info.has_finalizer() {
            return Err(HeapError::ReallocateFinalizable { type_name: info.name });
        }
        if new_payload_size == 0 {
            self.promptly_free(payload)?;
            return Ok(None);
        }
        if new_payload_size > MAX_HEAP_OBJECT_SIZE {
            return Err(HeapError::InvalidAllocationSize {
                requested: new_payload_size,
                max: MAX_HEAP_OBJECT_SIZE,
            });
        }

        let new_size = allocation_size(new_payload_size);
        let is_large = size == 0;
        if !is_large && new_size == size {
            return Ok(Some(payload));
        }
        if !is_large && new_size < size && new_size >= FREE_LIST_ENTRY_SIZE {
            self.with_state(|arenas, _, ctx| {
                let header = unsafe { ObjectHeader::from_payload(payload) };
                let arena_index = unsafe { page_header_from_object(header.address()) }.arena_index();
                arenas[arena_index].shrink_object(header, new_size, ctx);
            });
            return Ok(Some(payload));
        }

        let moved = self.try_allocate_raw(new_payload_size, gc_info_index)?;
        unsafe {
            ptr::copy_nonoverlapping(
                payload.as_ptr::<u8>(),
                moved.as_mut_ptr::<u8>(),
                old_payload_size.min(new_payload_size),
            )
        };
        self.promptly_free(payload)?;
        Ok(Some(moved))
    }

    /// Create a root handle for `target`
    pub fn persistent<T: GarbageCollected>(&self, target: Member<T>) -> Persistent<T> {
        Persistent::new(&self.persistents, Some(target))
    }

    /// Create an empty root handle
    pub fn empty_persistent<T: GarbageCollected>(&self) -> Persistent<T> {
        Persistent::new(&self.persistents, None)
    }

    pub fn add_root_provider(&self, provider: impl RootProvider + 'static) -> RootProviderHandle {
        let handle = RootProviderHandle(self.next_provider.get());
        self.next_provider.set(handle.0 + 1);
        self.root_providers
            .borrow_mut()
            .push((handle, Box::new(provider)));
        handle
    }

    pub fn remove_root_provider(&self, handle: RootProviderHandle) -> bool {
        let mut providers = self.root_providers.borrow_mut();
        let before = providers.len();
        providers.retain(|(h, _)| *h != handle);
        providers.len() != before
    }

    /// Record the base (highest address) of the mutator's stack for
    /// conservative scanning
    pub fn set_stack_base(&self, base: Address) {
        self.stack_base.set(Some(base));
    }

    fn trace_roots(&self, visitor: &mut Visitor<'_>, stack_state: StackState) {
        self.persistents.trace(visitor);
        for (_, provider) in self.root_providers.borrow().iter() {
            provider.trace_roots(visitor);
        }
        if stack_state == StackState::MayContainHeapPointers {
            match self.stack_base.get() {
                Some(base) => {
                    scan_stack(visitor, base);
                }
                None => log::warn!("heap {}: stack scan requested but no stack base set", self.id),
            }
        }
    }

    /// Run a full collection cycle
    ///
    /// Any sweep left from the previous cycle is completed first.
    /// With lazy sweeping the cycle returns once marking is done and
    /// pages are swept as allocation needs them.
    pub fn collect_garbage(&self, stack_state: StackState, sweeping: SweepingType) {
        self.complete_sweep();
        let _cycle = GcCoordinator::global().begin_cycle(self.id);
        log::debug!(
            "heap {}: collection {} starting, {} bytes allocated",
            self.id,
            self.counters.collections() + 1,
            self.counters.allocated_object_bytes()
        );

        self.with_state(|arenas, large, ctx| {
            for arena in arenas.iter_mut() {
                arena.make_consistent_for_gc(ctx.zap);
            }
            large.make_consistent_for_gc();
        });

        if self.busy.replace(true) {
            crate::fatal!("heap {} collected from a finalizer or trace method", self.id);
        }
        // SAFETY: the busy flag keeps every other path away from the
        // state and context while marking runs
        let summary = {
            let state = unsafe { &*self.state.get() };
            let context = unsafe { &mut *self.context.get() };
            mark_heap(context, &state.classifier, self.id, &self.config, |visitor| {
                self.trace_roots(visitor, stack_state)
            })
        };
        self.busy.set(false);
        self.pending_finalization.set(true);

        self.counters
            .record_marking(summary.marked_bytes, summary.mark_time);
        log::debug!(
            "heap {}: marked {} objects ({} bytes)",
            self.id,
            summary.marked_objects,
            summary.marked_bytes
        );

        if sweeping == SweepingType::Eager {
            self.complete_sweep();
        } else {
            self.finish_cycle_if_swept();
        }

        if self.config.dump_heap {
            self.dump();
        }
    }

    /// Sweep every page still waiting for a lazy sweep
    pub fn complete_sweep(&self) {
        if self.phase() != GcPhase::Sweeping {
            return;
        }
        self.finalize_unreachable();
        let clock = telemetry::start();
        self.with_state(|arenas, large, ctx| {
            for arena in arenas.iter_mut() {
                arena.complete_sweep(ctx);
            }
            large.complete_sweep(ctx);
        });
        self.counters.record_sweep_time(telemetry::elapsed(clock));
        self.finish_cycle_if_swept();
    }

    /// Run the finalizers of every object the last marking found
    /// unreachable
    ///
    /// This happens in one pass over all unswept pages before any of
    /// their memory is reused, so a finalizer can still ask about any
    /// other object of the cycle through `is_heap_object_alive`.
    fn finalize_unreachable(&self) {
        if !self.pending_finalization.replace(false) {
            return;
        }
        let finalized = self.with_state(|arenas, large, _| {
            arenas.iter().map(|arena| arena.finalize_unswept()).sum::<usize>() + large.finalize_unswept()
        });
        log::debug!("heap {}: finalized {} unreachable objects", self.id, finalized);
    }

    fn finish_cycle_if_swept(&self) {
        if self.phase() != GcPhase::Sweeping {
            return;
        }
        let state = unsafe { &*self.state.get() };
        if !state.has_unswept_pages() {
            self.pending_finalization.set(false);
            unsafe { &mut *self.context.get() }.finish_cycle();
            log::debug!(
                "heap {}: sweep complete, {} bytes allocated",
                self.id,
                self.counters.allocated_object_bytes()
            );
        }
    }

    /// Rebuild the free lists merging neighbouring free regions
    pub fn coalesce(&self) {
        self.complete_sweep();
        self.with_state(|arenas, _, ctx| {
            for arena in arenas.iter_mut() {
                arena.coalesce(ctx.zap);
            }
        });
    }

    /// Whether enough has been allocated since the last cycle to
    /// warrant another
    pub fn should_collect(&self) -> bool {
        self.counters.allocated_since_gc() >= self.config.gc_threshold_bytes
    }

    /// Run a precise collection if the allocation threshold has been
    /// passed. Returns whether one ran.
    pub fn collect_if_needed(&self) -> bool {
        if self.should_collect() {
            self.collect_garbage(StackState::NoHeapPointers, self.config.sweeping);
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> HeapStats {
        let counters = &self.counters;
        self.with_state(|arenas, large, ctx| HeapStats {
            normal_pages: arenas.iter().map(|a| a.page_count()).sum(),
            unswept_pages: arenas.iter().map(|a| a.unswept_page_count()).sum(),
            large_pages: large.page_count(),
            pooled_pages: ctx.pool.len(),
            allocated_object_bytes: counters.allocated_object_bytes(),
            allocated_space: counters.allocated_space(),
            marked_bytes: counters.marked_bytes(),
            estimated_live_bytes: counters.estimated_live_bytes(),
            free_list_bytes: arenas.iter().map(|a| a.free_list().free_bytes()).sum(),
            collections: counters.collections(),
            mark_time: counters.mark_time(),
            sweep_time: counters.sweep_time(),
        })
    }

    fn dump(&self) {
        let state = unsafe { &*self.state.get() };
        log::trace!("heap {}:\n{:?}", self.id, state);
        for arena in &state.arenas {
            for page in arena.pages() {
                log::trace!("{:?}\n{}", page, page.dump(DUMP_BYTES));
            }
        }
    }
}

impl Debug for ThreadHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = unsafe { &*self.state.get() };
        writeln!(f, "heap {} ({:?})", self.id, self.phase())?;
        write!(f, "{:?}", state)
    }
}

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        self.complete_sweep();
        self.with_state(|arenas, large, ctx| {
            for arena in arenas.iter_mut() {
                arena.finalize_and_release_all(ctx);
            }
            large.finalize_and_release_all(ctx);
            ctx.pool.clear();
        });
        self.persistents.heap_terminated();
        GcCoordinator::global().unregister_heap(self.id);
        self.counters.detach();
        self.context.get_mut().shutdown();
        log::debug!("heap {} terminated", self.id);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::visitor::{Trace, WeakMember};

    struct Leaf(u64);

    impl Trace for Leaf {
        fn trace(&self, _visitor: &mut Visitor<'_>) {}
    }

    struct Ref<T>(Member<T>);

    impl<T: GarbageCollected> Trace for Ref<T> {
        fn trace(&self, visitor: &mut Visitor<'_>) {
            visitor.trace(&self.0);
        }
    }

    struct Chain {
        next: Option<Member<Chain>>,
    }

    impl Trace for Chain {
        fn trace(&self, visitor: &mut Visitor<'_>) {
            self.next.trace(visitor);
        }
    }

    struct Watcher {
        weak: WeakMember<Leaf>,
    }

    impl Trace for Watcher {
        fn trace(&self, visitor: &mut Visitor<'_>) {
            self.weak.trace(visitor);
        }
    }

    thread_local! {
        static MARKING_STACK_AT_CALLBACK: Cell<Option<usize>> = Cell::new(None);
    }

    /// Reaches its target only from a post-marking callback
    struct Deferred {
        target: Member<Leaf>,
    }

    impl Trace for Deferred {
        fn trace(&self, visitor: &mut Visitor<'_>) {
            visitor.register_post_marking_callback(Address::from_ref(self), trace_deferred_target);
        }
    }

    fn trace_deferred_target(visitor: &mut Visitor<'_>, object: Address) {
        let pending = visitor.context().marking_stack_len();
        MARKING_STACK_AT_CALLBACK.with(|seen| seen.set(Some(pending)));
        let deferred = unsafe { &*object.as_ptr::<Deferred>() };
        visitor.trace(&deferred.target);
    }

    #[test]
    pub fn test_allocation_header_size() {
        let heap = ThreadHeap::new();
        for size in [0usize, 1, 7, 8, 24, 100, 1000, 40_000] {
            let index = GcInfoTable::global().index_for::<Leaf>();
            let payload = heap.allocate_raw(size, index);
            assert!(payload.is_aligned(8));
            let header = heap.header_for(payload).unwrap();
            assert!(header.payload_size() >= size);
            assert!(header.payload_size() < size.max(8) + ALLOCATION_GRANULARITY);
        }
    }

    #[test]
    pub fn test_oversized_request_rejected() {
        let heap = ThreadHeap::new();
        let index = GcInfoTable::global().index_for::<Leaf>();
        assert_eq!(
            heap.try_allocate_raw(MAX_HEAP_OBJECT_SIZE + 1, index),
            Err(HeapError::InvalidAllocationSize {
                requested: MAX_HEAP_OBJECT_SIZE + 1,
                max: MAX_HEAP_OBJECT_SIZE
            })
        );
    }

    #[test]
    pub fn test_header_for_foreign_address() {
        let heap = ThreadHeap::new();
        let local = 0u64;
        let address = Address::from_ref(&local);
        assert_eq!(heap.header_for(address).err(), Some(HeapError::NotHeapObject(address)));
        assert!(!heap.contains(address));
    }

    #[test]
    pub fn test_unrooted_objects_collected() {
        let heap = ThreadHeap::new();
        let kept = heap.allocate(Leaf(1));
        let _root = heap.persistent(kept);
        for i in 0..100 {
            heap.allocate(Leaf(i));
        }
        heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager);
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.stats().allocated_object_bytes, 16);
        assert_eq!(unsafe { kept.as_ref() }.0, 1);
    }

    #[test]
    pub fn test_lazy_sweep_finishes_cycle() {
        let heap = ThreadHeap::new();
        heap.allocate(Leaf(0));
        heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Lazy);
        assert_eq!(heap.phase(), GcPhase::Sweeping);
        assert_eq!(heap.stats().unswept_pages, 1);
        heap.complete_sweep();
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.stats().unswept_pages, 0);
    }

    #[test]
    pub fn test_post_marking_callback_runs_after_marking_stack_drains() {
        // every object goes through the marking stack
        let heap = ThreadHeap::with_config(HeapConfig::default().with_recursion_limit(0));
        let mut head = None;
        for _ in 0..50 {
            head = Some(heap.allocate(Chain { next: head }));
        }
        let _chain = heap.persistent(head.unwrap());
        let target = heap.allocate(Leaf(7));
        let deferred = heap.allocate(Deferred { target });
        let _deferred_root = heap.persistent(deferred);
        let watcher = heap.allocate(Watcher {
            weak: WeakMember::new(target),
        });
        let _watcher_root = heap.persistent(watcher);

        heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager);

        assert_eq!(MARKING_STACK_AT_CALLBACK.with(|seen| seen.get()), Some(0));
        // marked before weak processing, so the weak slot survives
        assert_eq!(unsafe { watcher.as_ref() }.weak.get(), Some(target));
        assert_eq!(heap.header_for(target.payload()).unwrap().payload_size(), 8);
        assert_eq!(unsafe { target.as_ref() }.0, 7);
    }

    #[test]
    pub fn test_header_for_rejects_garbage_awaiting_sweep() {
        let heap = ThreadHeap::new();
        let kept = heap.allocate(Leaf(1));
        let _root = heap.persistent(kept);
        let garbage = heap.allocate(Leaf(2));

        heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Lazy);
        assert_eq!(heap.phase(), GcPhase::Sweeping);
        assert_eq!(
            heap.header_for(garbage.payload()).err(),
            Some(HeapError::NotHeapObject(garbage.payload()))
        );
        assert!(heap.header_for(kept.payload()).is_ok());

        heap.complete_sweep();
        assert!(heap.header_for(garbage.payload()).is_err());
        assert!(heap.header_for(kept.payload()).is_ok());
    }

    #[test]
    pub fn test_foreign_objects_traced_once() {
        let heap = ThreadHeap::new();
        let other = ThreadHeap::new();
        let x = heap.allocate(Leaf(3));
        let y = other.allocate(Ref(x));
        let first = heap.allocate(Ref(y));
        let second = heap.allocate(Ref(y));
        let _roots = (heap.persistent(first), heap.persistent(second));

        heap.collect_garbage(StackState::NoHeapPointers, SweepingType::Eager);

        assert_eq!(heap.context().foreign_objects_visited(), 1);
        assert!(heap.header_for(x.payload()).is_ok());
        assert!(!other.header_for(y.payload()).unwrap().is_marked());
        assert_eq!(heap.stats().allocated_object_bytes, 3 * 16);
    }
}
