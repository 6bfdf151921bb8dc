//! A large object allocation
//!
//! A page that contains a single object and header. Unlike a normal
//! page it is sized to the object, rounded up to whole OS pages,
//! and is never split or placed on a free list.

use std::fmt;
use std::ptr;

use super::address::{round_up, Address, ALLOCATION_GRANULARITY, GUARD_SIZE, OS_PAGE_SIZE};
use super::block::{BlockError, PageMemory};
use super::header::{ObjectHeader, HEADER_SIZE};
use super::page::{finalize_object, PageHeader, PageKind, SweepOutcome, PAGE_HEADER_SIZE};

/// Arena index recorded in the page header of every large page
pub const LARGE_OBJECT_ARENA_INDEX: usize = 4;

/// A page containing one large object
pub struct LargeObjectPage {
    memory: PageMemory,
}

impl LargeObjectPage {
    /// Reservation size needed for a payload of `payload_size` bytes
    pub fn page_size_for(payload_size: usize) -> usize {
        round_up(GUARD_SIZE + PAGE_HEADER_SIZE + HEADER_SIZE + payload_size, OS_PAGE_SIZE) + GUARD_SIZE
    }

    /// Create a page holding a fresh, unmarked object of the given
    /// type with room for `payload_size` bytes
    pub fn new(payload_size: usize, gc_info_index: u32, heap_id: u32) -> Result<Box<Self>, BlockError> {
        let payload_size = round_up(payload_size, ALLOCATION_GRANULARITY);
        let memory = PageMemory::allocate(Self::page_size_for(payload_size))?;

        if cfg!(debug_assertions) {
            // Fill memory with 0xff to aid debugging
            unsafe {
                ptr::write_bytes(
                    memory.writable_start().as_mut_ptr::<u8>(),
                    0xff,
                    memory.writable_size(),
                )
            };
        }

        let page = Box::new(LargeObjectPage { memory });
        // SAFETY: the header and object header both fit in the
        // writable span, which was sized for them above
        unsafe {
            PageHeader::init(
                &page.memory,
                PageKind::Large,
                LARGE_OBJECT_ARENA_INDEX as u8,
                heap_id,
                payload_size,
            );
            ptr::write(
                page.object_address().as_mut_ptr::<ObjectHeader>(),
                ObjectHeader::new(0, gc_info_index),
            );
        }
        Ok(page)
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

    /// Size of the whole reservation
    pub fn size(&self) -> usize {
        self.memory.size()
    }

    fn object_address(&self) -> Address {
        self.memory.writable_start().add(PAGE_HEADER_SIZE)
    }

    pub fn object_header(&self) -> &mut ObjectHeader {
        unsafe { &mut *self.object_address().as_mut_ptr::<ObjectHeader>() }
    }

    pub fn payload(&self) -> Address {
        self.object_address().add(HEADER_SIZE)
    }

    pub fn payload_size(&self) -> usize {
        self.header().large_payload_size()
    }

    /// Bytes the object occupies, header included
    pub fn object_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    /// Whether the address lies in the object, header included
    pub fn contains(&self, address: Address) -> bool {
        self.object_address() <= address && address < self.payload().add(self.payload_size())
    }

    /// Finalize the object if it was not marked, otherwise unmark it
    /// ready for the next cycle
    pub fn sweep(&self) -> SweepOutcome {
        let header = self.object_header();
        self.header().set_swept(true);
        if header.is_marked() {
            header.unmark();
            header.clear_aux();
            SweepOutcome {
                freed_bytes: 0,
                live_bytes: self.object_size(),
                empty: false,
            }
        } else {
            if !header.is_dead() {
                finalize_object(header);
                header.mark_dead();
            }
            SweepOutcome {
                freed_bytes: self.object_size(),
                live_bytes: 0,
                empty: true,
            }
        }
    }

    /// Run the finalizer of an unmarked object, keeping its memory
    pub fn finalize_if_unreachable(&self) -> bool {
        let header = self.object_header();
        if header.is_marked() || header.is_dead() {
            return false;
        }
        finalize_object(header);
        header.mark_dead();
        true
    }

    /// Run the object's finalizer unless it already ran
    pub fn finalize(&self) {
        let header = self.object_header();
        if !header.is_dead() {
            finalize_object(header);
            header.mark_dead();
        }
    }
}

impl fmt::Debug for LargeObjectPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "large page {:?} ({} bytes, payload {}) {:?}",
            self.base(),
            self.size(),
            self.payload_size(),
            self.header()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address::BLINK_PAGE_SIZE;
    use crate::memory::gcinfo::{GcInfo, GcInfoTable};
    use crate::memory::page::page_header_from_object;
    use crate::memory::visitor::Visitor;
    use std::sync::atomic::AtomicU32;

    fn noop_trace(_visitor: &mut Visitor<'_>, _payload: Address) {}

    fn index() -> u32 {
        static SLOT: AtomicU32 = AtomicU32::new(0);
        GcInfoTable::global().assign_type_index(&SLOT, GcInfo::from_callbacks("lob-test", noop_trace, None))
    }

    #[test]
    fn test_page_size_rounds_to_os_pages() {
        let size = LargeObjectPage::page_size_for(2 * 1024 * 1024);
        assert_eq!(size % OS_PAGE_SIZE, 0);
        assert!(size >= 2 * 1024 * 1024 + 2 * GUARD_SIZE);
        assert!(size < 2 * 1024 * 1024 + 2 * GUARD_SIZE + OS_PAGE_SIZE);
    }

    #[test]
    fn test_two_megabyte_object() {
        let page = LargeObjectPage::new(2 * 1024 * 1024, index(), 3).unwrap();
        assert!(page.base().is_aligned(BLINK_PAGE_SIZE));
        assert_eq!(page.payload_size(), 2 * 1024 * 1024);
        assert!(page.object_header().is_large_object());
        assert_eq!(page.object_header().payload_size(), 2 * 1024 * 1024);
        assert!(page.contains(page.payload().add(2 * 1024 * 1024 - 1)));
        assert!(!page.contains(page.payload().add(2 * 1024 * 1024)));

        let found = unsafe { page_header_from_object(page.object_header().address()) };
        assert!(found.is_large());
        assert_eq!(found.heap_id(), 3);
    }

    #[test]
    fn test_sweep() {
        let page = LargeObjectPage::new(100_000, index(), 3).unwrap();
        page.header().set_swept(false);
        page.object_header().mark();
        let outcome = page.sweep();
        assert!(!outcome.empty);
        assert!(page.header().is_swept());
        assert!(!page.object_header().is_marked());

        let outcome = page.sweep();
        assert!(outcome.empty);
        assert!(page.object_header().is_dead());
    }
}
