//! Normal pages
//!
//! A normal page is one `BLINK_PAGE_SIZE` reservation holding many
//! small objects. Its first bytes after the leading guard are an
//! in-band `PageHeader` so that the page owning any object can be
//! found by masking the object's address. The payload after the
//! page header is always walkable: it is completely tiled by object
//! headers, live or free.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem::size_of;
use std::ptr;

use bitmaps::Bitmap;
use pretty_hex::pretty_hex;

use super::address::{round_up, Address, ALLOCATION_GRANULARITY, BLINK_PAGE_SIZE, GUARD_SIZE};
use super::block::PageMemory;
use super::freelist::FreeList;
use super::gcinfo::GcInfoTable;
use super::header::ObjectHeader;

const PAGE_MAGIC: u32 = 0x5a6e_9e01;

const SWEPT_FLAG: u8 = 0b01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Normal = 1,
    Large = 2,
}

/// Metadata written at the start of every page's usable span
#[repr(C)]
pub struct PageHeader {
    magic: u32,
    kind: PageKind,
    arena_index: u8,
    flags: Cell<u8>,
    _reserved: u8,
    heap_id: u32,
    _pad: u32,
    /// Payload size of the single object on a large page
    large_payload_size: usize,
}

/// Bytes reserved for the page header ahead of the first object
pub const PAGE_HEADER_SIZE: usize = round_up(size_of::<PageHeader>(), ALLOCATION_GRANULARITY);

/// Usable bytes on a normal page
pub const NORMAL_PAGE_PAYLOAD_SIZE: usize = BLINK_PAGE_SIZE - 2 * GUARD_SIZE - PAGE_HEADER_SIZE;

/// Find the page header for an object header address
///
/// # Safety
///
/// `object` must lie within the first `BLINK_PAGE_SIZE` bytes of a
/// live page reservation.
pub unsafe fn page_header_from_object<'a>(object: Address) -> &'a PageHeader {
    let page = &*object.page_base().add(GUARD_SIZE).as_ptr::<PageHeader>();
    debug_assert_eq!(page.magic, PAGE_MAGIC, "no page header for {:?}", object);
    page
}

impl PageHeader {
    /// Write a fresh page header into the start of `memory`
    ///
    /// # Safety
    ///
    /// The memory's writable span must not be in use.
    pub(crate) unsafe fn init<'a>(
        memory: &PageMemory,
        kind: PageKind,
        arena_index: u8,
        heap_id: u32,
        large_payload_size: usize,
    ) -> &'a PageHeader {
        let at = memory.writable_start().as_mut_ptr::<PageHeader>();
        ptr::write(
            at,
            PageHeader {
                magic: PAGE_MAGIC,
                kind,
                arena_index,
                flags: Cell::new(SWEPT_FLAG),
                _reserved: 0,
                heap_id,
                _pad: 0,
                large_payload_size,
            },
        );
        &*at
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    pub fn arena_index(&self) -> usize {
        self.arena_index as usize
    }

    pub fn heap_id(&self) -> u32 {
        self.heap_id
    }

    pub fn large_payload_size(&self) -> usize {
        debug_assert!(self.is_large());
        self.large_payload_size
    }

    /// Whether the page has been swept since the last marking phase
    pub fn is_swept(&self) -> bool {
        self.flags.get() & SWEPT_FLAG != 0
    }

    pub fn set_swept(&self, swept: bool) {
        let flags = self.flags.get();
        self.flags
            .set(if swept { flags | SWEPT_FLAG } else { flags & !SWEPT_FLAG });
    }

    pub fn address(&self) -> Address {
        Address::from_ref(self)
    }

    /// First byte after the page header
    pub fn payload_start(&self) -> Address {
        self.address().add(PAGE_HEADER_SIZE)
    }
}

impl fmt::Debug for PageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHeader")
            .field("kind", &self.kind)
            .field("arena", &self.arena_index)
            .field("heap", &self.heap_id)
            .field("swept", &self.is_swept())
            .finish()
    }
}

/// Run an object's finalizer, if its type has one
pub(crate) fn finalize_object(header: &ObjectHeader) {
    let info = GcInfoTable::global().lookup(header.gc_info_index());
    if let Some(finalize) = info.finalize {
        finalize(header.payload(), header.payload_size());
    }
}

const BITMAP_CHUNK_BITS: usize = 1024;
const BITMAP_CHUNKS: usize = BLINK_PAGE_SIZE / ALLOCATION_GRANULARITY / BITMAP_CHUNK_BITS;

/// One bit per allocation granule, set where an object header starts
pub struct ObjectStartBitmap {
    start: Address,
    chunks: [Bitmap<BITMAP_CHUNK_BITS>; BITMAP_CHUNKS],
}

impl ObjectStartBitmap {
    pub fn new(start: Address) -> Self {
        ObjectStartBitmap {
            start,
            chunks: std::array::from_fn(|_| Bitmap::new()),
        }
    }

    fn cell(&self, address: Address) -> (usize, usize) {
        let cell = address.offset_from(self.start) / ALLOCATION_GRANULARITY;
        (cell / BITMAP_CHUNK_BITS, cell % BITMAP_CHUNK_BITS)
    }

    pub fn set(&mut self, header: Address) {
        let (chunk, bit) = self.cell(header);
        self.chunks[chunk].set(bit, true);
    }

    pub fn is_set(&self, header: Address) -> bool {
        let (chunk, bit) = self.cell(header);
        self.chunks[chunk].get(bit)
    }

    /// Nearest object start at or below `address`
    pub fn find_header(&self, address: Address) -> Option<Address> {
        if address < self.start {
            return None;
        }
        let (mut chunk, mut bit) = self.cell(address);
        loop {
            if !self.chunks[chunk].is_empty() {
                loop {
                    if self.chunks[chunk].get(bit) {
                        let cell = chunk * BITMAP_CHUNK_BITS + bit;
                        return Some(self.start.add(cell * ALLOCATION_GRANULARITY));
                    }
                    if bit == 0 {
                        break;
                    }
                    bit -= 1;
                }
            }
            if chunk == 0 {
                return None;
            }
            chunk -= 1;
            bit = BITMAP_CHUNK_BITS - 1;
        }
    }
}

/// Walks the object headers tiling a span of a page
pub struct HeaderIter<'a> {
    cursor: Address,
    end: Address,
    _page: std::marker::PhantomData<&'a NormalPage>,
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = &'a mut ObjectHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        let header = unsafe { &mut *self.cursor.as_mut_ptr::<ObjectHeader>() };
        header.check();
        let size = header.size();
        if size == 0 {
            crate::fatal!("zero sized header on normal page at {:?}", self.cursor);
        }
        self.cursor = self.cursor.add(size);
        Some(header)
    }
}

/// What sweeping a page found
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Bytes of objects found unreachable
    pub freed_bytes: usize,
    /// Bytes of objects that survived
    pub live_bytes: usize,
    /// No object survived: the page can be released
    pub empty: bool,
}

/// A page holding many small objects
pub struct NormalPage {
    memory: PageMemory,
    object_start_bitmap: RefCell<Option<Box<ObjectStartBitmap>>>,
}

impl NormalPage {
    /// Lay a page out in `memory`, its payload a single free region
    pub fn new(memory: PageMemory, arena_index: usize, heap_id: u32) -> Box<Self> {
        debug_assert_eq!(memory.size(), BLINK_PAGE_SIZE);
        let page = Box::new(NormalPage {
            memory,
            object_start_bitmap: RefCell::new(None),
        });
        unsafe {
            PageHeader::init(&page.memory, PageKind::Normal, arena_index as u8, heap_id, 0);
            ptr::write(
                page.payload_start().as_mut_ptr::<ObjectHeader>(),
                ObjectHeader::new_free(NORMAL_PAGE_PAYLOAD_SIZE),
            );
        }
        page
    }

    /// Give up the page, returning its memory for reuse
    pub fn into_memory(self: Box<Self>) -> PageMemory {
        self.memory
    }

    pub fn header(&self) -> &PageHeader {
        unsafe { &*self.memory.writable_start().as_ptr::<PageHeader>() }
    }

    pub fn base(&self) -> Address {
        self.memory.base()
    }

    pub fn memory(&self) -> &PageMemory {
        &self.memory
    }

    pub fn payload_start(&self) -> Address {
        self.memory.writable_start().add(PAGE_HEADER_SIZE)
    }

    pub fn payload_end(&self) -> Address {
        self.memory.writable_end()
    }

    pub fn payload_size(&self) -> usize {
        NORMAL_PAGE_PAYLOAD_SIZE
    }

    /// Whether the address lies in the object payload area
    pub fn contains(&self, address: Address) -> bool {
        self.payload_start() <= address && address < self.payload_end()
    }

    /// Walk every header on the page
    ///
    /// The page must be walkable: no bump allocation area may be
    /// active on it.
    pub fn headers(&self) -> HeaderIter<'_> {
        HeaderIter {
            cursor: self.payload_start(),
            end: self.payload_end(),
            _page: std::marker::PhantomData,
        }
    }

    /// Number of allocated (non-free) objects
    pub fn object_count(&self) -> usize {
        self.headers().filter(|h| !h.is_free()).count()
    }

    /// Run the finalizer of every unmarked object and flag it dead,
    /// leaving its header in place. Returns the number finalized.
    pub fn finalize_unreachable(&self) -> usize {
        let mut finalized = 0;
        for header in self.headers() {
            if !header.is_free() && !header.is_marked() && !header.is_dead() {
                finalize_object(header);
                header.mark_dead();
                finalized += 1;
            }
        }
        finalized
    }

    /// Reclaim unmarked objects
    ///
    /// Unmarked objects not yet finalized are finalized first.
    /// Survivors are unmarked ready for the next cycle and runs of
    /// adjacent dead or free memory are merged onto the free list. An
    /// empty page is left untouched for the arena to release.
    pub fn sweep(&self, free_list: &mut FreeList, zap: bool) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        self.finalize_unreachable();
        for header in self.headers() {
            if header.is_free() {
                continue;
            }
            if header.is_marked() {
                outcome.live_bytes += header.size();
            } else {
                outcome.freed_bytes += header.size();
            }
        }

        if outcome.live_bytes == 0 {
            outcome.empty = true;
            return outcome;
        }

        let mut run_start: Option<Address> = None;
        for header in self.headers() {
            let address = header.address();
            if header.is_free() || header.is_dead() {
                run_start.get_or_insert(address);
                continue;
            }
            if let Some(start) = run_start.take() {
                unsafe { free_list.add_to_free_list(start, address.offset_from(start), zap) };
            }
            header.unmark();
            header.clear_aux();
        }
        if let Some(start) = run_start {
            let end = self.payload_end();
            unsafe { free_list.add_to_free_list(start, end.offset_from(start), zap) };
        }

        self.header().set_swept(true);
        self.invalidate_object_start_bitmap();
        outcome
    }

    /// Rebuild the free list from a swept page without touching
    /// live objects: adjacent free regions are merged.
    pub fn coalesce(&self, free_list: &mut FreeList, zap: bool) {
        let mut run_start: Option<Address> = None;
        for header in self.headers() {
            let address = header.address();
            if header.is_free() {
                run_start.get_or_insert(address);
            } else if let Some(start) = run_start.take() {
                unsafe { free_list.add_to_free_list(start, address.offset_from(start), zap) };
            }
        }
        if let Some(start) = run_start {
            let end = self.payload_end();
            unsafe { free_list.add_to_free_list(start, end.offset_from(start), zap) };
        }
        self.invalidate_object_start_bitmap();
    }

    /// Run the finalizer of every object still on the page
    pub fn finalize_all(&self) {
        for header in self.headers() {
            if !header.is_free() && !header.is_dead() {
                finalize_object(header);
                header.mark_dead();
            }
        }
    }

    pub fn invalidate_object_start_bitmap(&self) {
        self.object_start_bitmap.replace(None);
    }

    fn populate_object_start_bitmap(&self) -> Box<ObjectStartBitmap> {
        let mut bitmap = Box::new(ObjectStartBitmap::new(self.payload_start()));
        for header in self.headers() {
            bitmap.set(header.address());
        }
        bitmap
    }

    /// Find the allocated object containing an arbitrary interior
    /// address, if there is one
    ///
    /// Only valid while no allocation happens on the page, i.e.
    /// during marking.
    pub fn find_header_from_address(&self, address: Address) -> Option<&mut ObjectHeader> {
        if !self.contains(address) {
            return None;
        }
        let mut cache = self.object_start_bitmap.borrow_mut();
        let bitmap = cache.get_or_insert_with(|| self.populate_object_start_bitmap());
        let start = bitmap.find_header(address)?;
        let header = unsafe { &mut *start.as_mut_ptr::<ObjectHeader>() };
        if header.is_free() || address >= start.add(header.size()) {
            None
        } else {
            Some(header)
        }
    }

    /// Hex dump of the start of the payload
    pub fn dump(&self, bytes: usize) -> String {
        let len = bytes.min(self.payload_size());
        let slice = unsafe { std::slice::from_raw_parts(self.payload_start().as_ptr::<u8>(), len) };
        pretty_hex(&slice)
    }
}

impl fmt::Debug for NormalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "normal page {:?} {:?}", self.base(), self.header())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::gcinfo::{GcInfo, GcInfoTable};
    use crate::memory::header::HEADER_SIZE;
    use crate::memory::visitor::Visitor;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn noop_trace(_visitor: &mut Visitor<'_>, _payload: Address) {}

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    fn count_finalize(_payload: Address, _size: usize) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    fn plain_index() -> u32 {
        static SLOT: AtomicU32 = AtomicU32::new(0);
        GcInfoTable::global().assign_type_index(&SLOT, GcInfo::from_callbacks("page-plain", noop_trace, None))
    }

    fn finalized_index() -> u32 {
        static SLOT: AtomicU32 = AtomicU32::new(0);
        GcInfoTable::global().assign_type_index(
            &SLOT,
            GcInfo::from_callbacks("page-finalized", noop_trace, Some(count_finalize)),
        )
    }

    /// Lay out objects of `sizes` at the start of a fresh page
    fn page_with(sizes: &[(usize, u32)]) -> (Box<NormalPage>, Vec<Address>) {
        let page = NormalPage::new(PageMemory::allocate_normal().unwrap(), 1, 99);
        let mut cursor = page.payload_start();
        let mut payloads = vec![];
        for (size, index) in sizes {
            unsafe { ptr::write(cursor.as_mut_ptr::<ObjectHeader>(), ObjectHeader::new(*size, *index)) };
            payloads.push(cursor.add(HEADER_SIZE));
            cursor = cursor.add(*size);
        }
        let rest = page.payload_end().offset_from(cursor);
        unsafe { ptr::write(cursor.as_mut_ptr::<ObjectHeader>(), ObjectHeader::new_free(rest)) };
        (page, payloads)
    }

    fn header(payload: Address) -> &'static mut ObjectHeader {
        unsafe { ObjectHeader::from_payload(payload) }
    }

    #[test]
    pub fn test_page_header_from_object() {
        let (page, payloads) = page_with(&[(32, plain_index())]);
        let found = unsafe { page_header_from_object(header(payloads[0]).address()) };
        assert_eq!(found.address(), page.header().address());
        assert_eq!(found.heap_id(), 99);
        assert_eq!(found.arena_index(), 1);
        assert_eq!(found.kind(), PageKind::Normal);
        assert!(found.is_swept());
    }

    #[test]
    pub fn test_fresh_page_is_one_free_region() {
        let page = NormalPage::new(PageMemory::allocate_normal().unwrap(), 0, 1);
        let headers: Vec<_> = page.headers().map(|h| (h.is_free(), h.size())).collect();
        assert_eq!(headers, vec![(true, NORMAL_PAGE_PAYLOAD_SIZE)]);
    }

    #[test]
    pub fn test_sweep_coalesces_and_unmarks() {
        let plain = plain_index();
        let (page, payloads) = page_with(&[(32, plain), (32, plain), (32, plain), (64, plain)]);
        header(payloads[1]).mark();
        page.header().set_swept(false);

        let mut free_list = FreeList::new();
        let outcome = page.sweep(&mut free_list, true);
        assert_eq!(outcome.live_bytes, 32);
        assert_eq!(outcome.freed_bytes, 128);
        assert!(!outcome.empty);
        assert!(page.header().is_swept());
        assert!(!header(payloads[1]).is_marked());

        // one entry before the survivor, one merged run after it
        let mut sizes: Vec<usize> = free_list.entries().map(|(_, _, s)| s).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![32, NORMAL_PAGE_PAYLOAD_SIZE - 64]);
        assert_eq!(page.object_count(), 1);
    }

    #[test]
    pub fn test_sweep_runs_finalizers_once() {
        let fin = finalized_index();
        let (page, payloads) = page_with(&[(32, fin), (32, fin), (32, fin)]);
        header(payloads[0]).mark();
        let before = FINALIZED.load(Ordering::SeqCst);
        let mut free_list = FreeList::new();
        page.sweep(&mut free_list, false);
        assert!(FINALIZED.load(Ordering::SeqCst) >= before + 2);

        // a second sweep with nothing marked frees the survivor only
        let before = FINALIZED.load(Ordering::SeqCst);
        let outcome = page.sweep(&mut FreeList::new(), false);
        assert!(outcome.empty);
        assert!(FINALIZED.load(Ordering::SeqCst) >= before + 1);
    }

    #[test]
    pub fn test_empty_page_reported() {
        let plain = plain_index();
        let (page, _) = page_with(&[(32, plain), (48, plain)]);
        let outcome = page.sweep(&mut FreeList::new(), false);
        assert!(outcome.empty);
        assert_eq!(outcome.freed_bytes, 80);
    }

    #[test]
    pub fn test_find_header_from_interior_address() {
        let plain = plain_index();
        let (page, payloads) = page_with(&[(32, plain), (64, plain)]);
        let found = page.find_header_from_address(payloads[1].add(40)).unwrap();
        assert_eq!(found.payload(), payloads[1]);
        let found = page.find_header_from_address(payloads[0]).unwrap();
        assert_eq!(found.payload(), payloads[0]);
        // free tail of the page
        assert!(page.find_header_from_address(payloads[1].add(200)).is_none());
        // page header
        assert!(page.find_header_from_address(page.header().address()).is_none());
    }

    #[test]
    pub fn test_object_start_bitmap() {
        let start = Address::new(BLINK_PAGE_SIZE * 4);
        let mut bitmap = ObjectStartBitmap::new(start);
        assert_eq!(bitmap.find_header(start.add(4000)), None);
        bitmap.set(start.add(16));
        bitmap.set(start.add(9000));
        assert!(bitmap.is_set(start.add(16)));
        assert_eq!(bitmap.find_header(start.add(16)), Some(start.add(16)));
        assert_eq!(bitmap.find_header(start.add(8999)), Some(start.add(16)));
        assert_eq!(bitmap.find_header(start.add(100_000)), Some(start.add(9000)));
        assert_eq!(bitmap.find_header(start.add(8)), None);
    }
}
