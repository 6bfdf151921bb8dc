//! Arenas: the pages of one kind and the allocation over them
//!
//! A normal arena allocates by bumping a pointer through the current
//! allocation area and, when that runs out, from its free list.
//! Failing that it lazily sweeps pages left unswept by the last
//! marking phase and finally takes a fresh page.
//!
//! Every page is on exactly one of an arena's two lists: `pages`
//! (swept, safe to allocate into) or `unswept`.

use std::fmt;
use std::ptr;

use super::address::{round_up, Address, ALLOCATION_GRANULARITY, BLINK_PAGE_SIZE};
use super::block::PageMemory;
use super::classifier::{AddressClassifier, PageRef};
use super::freelist::{write_filler, FreeList, FREE_LIST_ENTRY_SIZE};
use super::header::{ObjectHeader, HEADER_SIZE};
use super::lob::LargeObjectPage;
use super::page::{page_header_from_object, NormalPage, SweepOutcome};
use super::stats::HeapCounters;
use crate::error::HeapError;

/// Number of size-segregated normal arenas
pub const NORMAL_ARENA_COUNT: usize = 4;

/// Allocation size (header included) for a payload of `payload_size`
pub fn allocation_size(payload_size: usize) -> usize {
    round_up(payload_size + HEADER_SIZE, ALLOCATION_GRANULARITY).max(FREE_LIST_ENTRY_SIZE)
}

/// Normal arena serving an allocation size
pub fn arena_index_for_size(size: usize) -> usize {
    match size {
        0..=16 => 0,
        17..=32 => 1,
        33..=64 => 2,
        _ => 3,
    }
}

/// Empty normal pages kept for reuse instead of returning them to
/// the OS
#[derive(Debug, Default)]
pub struct PagePool {
    pages: Vec<PageMemory>,
    capacity: usize,
}

impl PagePool {
    pub fn new(capacity: usize) -> Self {
        PagePool {
            pages: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn take(&mut self) -> Option<PageMemory> {
        self.pages.pop()
    }

    /// Keep the memory if there is room, otherwise drop it. Returns
    /// whether it was pooled.
    pub fn give(&mut self, memory: PageMemory) -> bool {
        if self.pages.len() < self.capacity {
            self.pages.push(memory);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Everything outside an arena that acquiring or releasing a page
/// touches
pub struct ArenaContext<'a> {
    pub heap_id: u32,
    pub pool: &'a mut PagePool,
    pub classifier: &'a mut AddressClassifier,
    pub counters: &'a HeapCounters,
    pub zap: bool,
}

pub struct NormalPageArena {
    index: usize,
    pages: Vec<Box<NormalPage>>,
    unswept: Vec<Box<NormalPage>>,
    free_list: FreeList,
    /// Start of the bump allocation area
    current: Address,
    /// Bytes left in the bump allocation area
    remaining: usize,
}

impl NormalPageArena {
    pub fn new(index: usize) -> Self {
        NormalPageArena {
            index,
            pages: vec![],
            unswept: vec![],
            free_list: FreeList::new(),
            current: Address::NULL,
            remaining: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Allocate `size` bytes (header included, already rounded) and
    /// return the payload address
    #[inline]
    pub fn allocate(
        &mut self,
        size: usize,
        gc_info_index: u32,
        ctx: &mut ArenaContext<'_>,
    ) -> Result<Address, HeapError> {
        debug_assert!(size >= FREE_LIST_ENTRY_SIZE && size % ALLOCATION_GRANULARITY == 0);
        if size <= self.remaining {
            return Ok(self.bump(size, gc_info_index, ctx.counters));
        }
        self.out_of_line_allocate(size, gc_info_index, ctx)
    }

    fn bump(&mut self, size: usize, gc_info_index: u32, counters: &HeapCounters) -> Address {
        let address = self.current;
        unsafe { ptr::write(address.as_mut_ptr::<ObjectHeader>(), ObjectHeader::new(size, gc_info_index)) };
        self.current = address.add(size);
        self.remaining -= size;
        counters.increase_allocated_object_bytes(size);
        address.add(HEADER_SIZE)
    }

    fn out_of_line_allocate(
        &mut self,
        size: usize,
        gc_info_index: u32,
        ctx: &mut ArenaContext<'_>,
    ) -> Result<Address, HeapError> {
        self.retire_bump_area(ctx.zap);

        loop {
            if let Some(payload) = self.allocate_from_free_list(size, gc_info_index, ctx.counters) {
                return Ok(payload);
            }
            if !self.sweep_unswept_page(ctx) {
                break;
            }
        }

        self.allocate_page(ctx)?;
        Ok(self.bump(size, gc_info_index, ctx.counters))
    }

    fn allocate_from_free_list(
        &mut self,
        size: usize,
        gc_info_index: u32,
        counters: &HeapCounters,
    ) -> Option<Address> {
        let (address, entry_size) = self.free_list.allocate(size)?;
        let remainder = entry_size - size;
        if remainder >= FREE_LIST_ENTRY_SIZE {
            unsafe { self.free_list.add_to_free_list(address.add(size), remainder, false) };
        } else if remainder > 0 {
            unsafe { write_filler(address.add(size), remainder, false) };
        }
        unsafe { ptr::write(address.as_mut_ptr::<ObjectHeader>(), ObjectHeader::new(size, gc_info_index)) };
        counters.increase_allocated_object_bytes(size);
        Some(address.add(HEADER_SIZE))
    }

    /// Give the rest of the bump area back to the free list so the
    /// page is walkable
    pub fn retire_bump_area(&mut self, zap: bool) {
        if self.remaining > 0 {
            unsafe { self.free_list.add_to_free_list(self.current, self.remaining, zap) };
        }
        self.current = Address::NULL;
        self.remaining = 0;
    }

    fn allocate_page(&mut self, ctx: &mut ArenaContext<'_>) -> Result<(), HeapError> {
        let memory = match ctx.pool.take() {
            Some(memory) => {
                if ctx.zap {
                    memory.clear_writable();
                }
                memory
            }
            None => PageMemory::allocate_normal().map_err(|_| HeapError::OutOfMemory {
                requested: BLINK_PAGE_SIZE,
                allocated_space: ctx.counters.allocated_space(),
            })?,
        };
        let page = NormalPage::new(memory, self.index, ctx.heap_id);
        ctx.classifier
            .add_region(page.base(), page.memory().end(), PageRef::normal(&page));
        ctx.counters.increase_allocated_space(BLINK_PAGE_SIZE);
        log::trace!("arena {}: new page {:?}", self.index, page.base());

        self.current = page.payload_start();
        self.remaining = page.payload_size();
        self.pages.push(page);
        Ok(())
    }

    fn release_page(&mut self, page: Box<NormalPage>, ctx: &mut ArenaContext<'_>) {
        ctx.classifier.remove_region(page.base());
        ctx.counters.decrease_allocated_space(BLINK_PAGE_SIZE);
        let base = page.base();
        if ctx.pool.give(page.into_memory()) {
            log::trace!("arena {}: page {:?} pooled", self.index, base);
        } else {
            log::trace!("arena {}: page {:?} released", self.index, base);
        }
    }

    /// Sweep one unswept page, if there is one
    pub fn sweep_unswept_page(&mut self, ctx: &mut ArenaContext<'_>) -> bool {
        let page = match self.unswept.pop() {
            Some(page) => page,
            None => return false,
        };
        let outcome = page.sweep(&mut self.free_list, ctx.zap);
        ctx.counters.decrease_allocated_object_bytes(outcome.freed_bytes);
        if outcome.empty {
            self.release_page(page, ctx);
        } else {
            self.pages.push(page);
        }
        true
    }

    /// Sweep every remaining unswept page
    pub fn complete_sweep(&mut self, ctx: &mut ArenaContext<'_>) {
        while self.sweep_unswept_page(ctx) {}
    }

    pub fn has_unswept_pages(&self) -> bool {
        !self.unswept.is_empty()
    }

    /// Finalize the unreachable objects of every unswept page without
    /// reclaiming any memory
    pub fn finalize_unswept(&self) -> usize {
        self.unswept.iter().map(|page| page.finalize_unreachable()).sum()
    }

    /// Prepare for marking: retire the bump area, forget the free
    /// list and move every page to the unswept list
    pub fn make_consistent_for_gc(&mut self, zap: bool) {
        debug_assert!(self.unswept.is_empty(), "previous sweep not complete");
        self.retire_bump_area(zap);
        self.free_list.clear();
        for page in self.pages.drain(..) {
            page.header().set_swept(false);
            page.invalidate_object_start_bitmap();
            self.unswept.push(page);
        }
    }

    /// Rebuild the free list merging adjacent free regions
    pub fn coalesce(&mut self, zap: bool) {
        self.retire_bump_area(zap);
        self.free_list.clear();
        for page in &self.pages {
            page.coalesce(&mut self.free_list, zap);
        }
        log::trace!(
            "arena {}: coalesced, {} bytes free",
            self.index,
            self.free_list.free_bytes()
        );
    }

    /// Release an object's memory immediately
    ///
    /// The caller has already run the finalizer. Memory at the end of
    /// the bump area is given back to it. On a page still awaiting
    /// sweep the object only becomes a free region, as memory there
    /// must not be reused before the page is swept.
    pub fn promptly_free(&mut self, header: &mut ObjectHeader, ctx: &mut ArenaContext<'_>) {
        let address = header.address();
        let size = header.size();
        let page = unsafe { page_header_from_object(address) };

        if address.add(size) == self.current {
            self.current = address;
            self.remaining += size;
            // stale pointers to the object must not find a live header
            unsafe { write_filler(address, size, ctx.zap) };
        } else if page.is_swept() {
            unsafe { self.free_list.add_to_free_list(address, size, ctx.zap) };
        } else {
            unsafe { write_filler(address, size, ctx.zap) };
        }
        ctx.counters.decrease_allocated_object_bytes(size);
    }

    /// Shrink an object in place to `new_size` bytes (header
    /// included), returning the tail to the arena
    pub fn shrink_object(&mut self, header: &mut ObjectHeader, new_size: usize, ctx: &mut ArenaContext<'_>) {
        let size = header.size();
        debug_assert!(new_size >= FREE_LIST_ENTRY_SIZE && new_size < size);
        let tail = header.address().add(new_size);
        let tail_size = size - new_size;
        let page = unsafe { page_header_from_object(header.address()) };
        header.set_size(new_size);

        if tail.add(tail_size) == self.current {
            self.current = tail;
            self.remaining += tail_size;
        } else if page.is_swept() {
            unsafe { self.free_list.add_to_free_list(tail, tail_size, ctx.zap) };
        } else {
            unsafe { write_filler(tail, tail_size, ctx.zap) };
        }
        ctx.counters.decrease_allocated_object_bytes(tail_size);
    }

    /// Finalize every object and release every page, for heap
    /// termination
    pub fn finalize_and_release_all(&mut self, ctx: &mut ArenaContext<'_>) {
        self.retire_bump_area(false);
        self.free_list.clear();
        let pages: Vec<_> = self.pages.drain(..).chain(self.unswept.drain(..)).collect();
        for page in &pages {
            page.finalize_all();
        }
        for page in pages {
            ctx.classifier.remove_region(page.base());
            ctx.counters.decrease_allocated_space(BLINK_PAGE_SIZE);
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn unswept_page_count(&self) -> usize {
        self.unswept.len()
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn pages(&self) -> impl Iterator<Item = &NormalPage> {
        self.pages.iter().chain(self.unswept.iter()).map(|p| p.as_ref())
    }
}

impl fmt::Debug for NormalPageArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "arena {} (bump {:?} +{})", self.index, self.current, self.remaining)?;
        for page in &self.pages {
            writeln!(f, "(Sw) {:?}", page)?;
        }
        for page in &self.unswept {
            writeln!(f, "(Un) {:?}", page)?;
        }
        write!(f, "{:?}", self.free_list)
    }
}

/// The arena of pages each holding a single large object
#[derive(Default)]
pub struct LargeObjectArena {
    pages: Vec<Box<LargeObjectPage>>,
    unswept: Vec<Box<LargeObjectPage>>,
}

impl LargeObjectArena {
    pub fn new() -> Self {
        LargeObjectArena::default()
    }

    /// Allocate a dedicated page for a payload of `payload_size`
    pub fn allocate(
        &mut self,
        payload_size: usize,
        gc_info_index: u32,
        ctx: &mut ArenaContext<'_>,
    ) -> Result<Address, HeapError> {
        // Reclaim dead large objects before asking for more memory
        self.lazy_sweep(payload_size, ctx);

        let page = LargeObjectPage::new(payload_size, gc_info_index, ctx.heap_id).map_err(|_| {
            HeapError::OutOfMemory {
                requested: LargeObjectPage::page_size_for(payload_size),
                allocated_space: ctx.counters.allocated_space(),
            }
        })?;
        ctx.classifier
            .add_region(page.base(), page.memory().end(), PageRef::large(&page));
        ctx.counters.increase_allocated_space(page.size());
        ctx.counters.increase_allocated_object_bytes(page.object_size());
        log::trace!("large page {:?} of {} bytes", page.base(), page.size());

        let payload = page.payload();
        self.pages.push(page);
        Ok(payload)
    }

    fn release_page(&mut self, page: Box<LargeObjectPage>, ctx: &mut ArenaContext<'_>) {
        ctx.classifier.remove_region(page.base());
        ctx.counters.decrease_allocated_space(page.size());
        log::trace!("large page {:?} released", page.base());
    }

    fn sweep_page(&mut self, page: Box<LargeObjectPage>, ctx: &mut ArenaContext<'_>) -> SweepOutcome {
        let outcome = page.sweep();
        ctx.counters.decrease_allocated_object_bytes(outcome.freed_bytes);
        if outcome.empty {
            self.release_page(page, ctx);
        } else {
            self.pages.push(page);
        }
        outcome
    }

    /// Sweep unswept pages until at least `bytes` have been freed
    pub fn lazy_sweep(&mut self, bytes: usize, ctx: &mut ArenaContext<'_>) {
        let mut freed = 0;
        while freed < bytes {
            match self.unswept.pop() {
                Some(page) => freed += self.sweep_page(page, ctx).freed_bytes,
                None => break,
            }
        }
    }

    pub fn complete_sweep(&mut self, ctx: &mut ArenaContext<'_>) {
        while let Some(page) = self.unswept.pop() {
            self.sweep_page(page, ctx);
        }
    }

    pub fn has_unswept_pages(&self) -> bool {
        !self.unswept.is_empty()
    }

    pub fn finalize_unswept(&self) -> usize {
        self.unswept
            .iter()
            .filter(|page| page.finalize_if_unreachable())
            .count()
    }

    pub fn make_consistent_for_gc(&mut self) {
        debug_assert!(self.unswept.is_empty(), "previous sweep not complete");
        for page in self.pages.drain(..) {
            page.header().set_swept(false);
            self.unswept.push(page);
        }
    }

    /// Release the page holding `payload` once its finalizer has run
    pub fn promptly_free(&mut self, payload: Address, ctx: &mut ArenaContext<'_>) -> bool {
        let position = |pages: &Vec<Box<LargeObjectPage>>| pages.iter().position(|p| p.payload() == payload);
        let page = if let Some(i) = position(&self.pages) {
            self.pages.swap_remove(i)
        } else if let Some(i) = position(&self.unswept) {
            self.unswept.swap_remove(i)
        } else {
            return false;
        };
        let header = page.object_header();
        if header.is_marked() {
            header.unmark();
        }
        header.mark_dead();
        ctx.counters.decrease_allocated_object_bytes(page.object_size());
        self.release_page(page, ctx);
        true
    }

    pub fn finalize_and_release_all(&mut self, ctx: &mut ArenaContext<'_>) {
        let pages: Vec<_> = self.pages.drain(..).chain(self.unswept.drain(..)).collect();
        for page in &pages {
            page.finalize();
        }
        for page in pages {
            self.release_page(page, ctx);
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len() + self.unswept.len()
    }

    pub fn pages(&self) -> impl Iterator<Item = &LargeObjectPage> {
        self.pages.iter().chain(self.unswept.iter()).map(|p| p.as_ref())
    }
}

impl fmt::Debug for LargeObjectArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for page in &self.pages {
            writeln!(f, "(Sw) {:?}", page)?;
        }
        for page in &self.unswept {
            writeln!(f, "(Un) {:?}", page)?;
        }
        Ok(())
    }
}
