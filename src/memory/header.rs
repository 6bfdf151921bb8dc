//! Header for all heap objects
//!
//! Every allocation, live or free, begins with an `ObjectHeader`.
//! The header is two 32-bit words: a packed encoding of the
//! allocation's metadata and a magic value used to catch stale or
//! corrupted pointers in debug builds.
//!
//! Bit layout of the encoded word:
//!
//! | bits    | field                                         |
//! |---------|-----------------------------------------------|
//! | 0       | mark bit                                      |
//! | 1       | freed bit (set on free-list entries)          |
//! | 2       | dead bit (unreached, finalized, not reclaimed)|
//! | 3       | auxiliary bit for external scanners           |
//! | 4..18   | allocation size / granularity (0 = large)     |
//! | 18..32  | gc info index (0 = free-list entry)           |

use std::mem::size_of;

use super::address::{Address, ALLOCATION_GRANULARITY, ALLOCATION_MASK};
use super::page::page_header_from_object;

const MARK_BIT: u32 = 1 << 0;
const FREED_BIT: u32 = 1 << 1;
const DEAD_BIT: u32 = 1 << 2;
const AUX_BIT: u32 = 1 << 3;

const SIZE_SHIFT: u32 = 4;
const SIZE_BITS: u32 = 14;
const SIZE_FIELD_MASK: u32 = ((1 << SIZE_BITS) - 1) << SIZE_SHIFT;

const GC_INFO_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;
const GC_INFO_BITS: u32 = 14;
const GC_INFO_FIELD_MASK: u32 = ((1 << GC_INFO_BITS) - 1) << GC_INFO_SHIFT;

/// Exclusive upper bound on gc info indices that fit in a header
pub const GC_INFO_INDEX_LIMIT: u32 = 1 << GC_INFO_BITS;

/// Largest size encodable in a header. Anything bigger lives on a
/// large object page and stores a size of zero.
pub const MAX_ENCODED_SIZE: usize = ((1 << SIZE_BITS) - 1) * ALLOCATION_GRANULARITY;

/// Expected value of every header's magic word
pub const HEADER_MAGIC: u32 = 0x0c0d_e247;

/// Size in bytes of an object header
pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();

#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    encoded: u32,
    magic: u32,
}

const _: () = assert!(size_of::<ObjectHeader>() == 8);
const _: () = assert!(HEADER_SIZE % ALLOCATION_GRANULARITY == 0);

impl ObjectHeader {
    /// Header for a freshly allocated, unmarked object. `size`
    /// includes the header; zero means "large object".
    pub fn new(size: usize, gc_info_index: u32) -> Self {
        debug_assert!(gc_info_index > 0 && gc_info_index < GC_INFO_INDEX_LIMIT);
        ObjectHeader {
            encoded: Self::encode_size(size) | (gc_info_index << GC_INFO_SHIFT),
            magic: HEADER_MAGIC,
        }
    }

    /// Header for a free region of `size` bytes
    pub fn new_free(size: usize) -> Self {
        ObjectHeader {
            encoded: Self::encode_size(size) | FREED_BIT,
            magic: HEADER_MAGIC,
        }
    }

    fn encode_size(size: usize) -> u32 {
        debug_assert!(size & ALLOCATION_MASK == 0);
        debug_assert!(size <= MAX_ENCODED_SIZE);
        ((size / ALLOCATION_GRANULARITY) as u32) << SIZE_SHIFT
    }

    /// Recover the header for an object from its payload address
    ///
    /// # Safety
    ///
    /// `payload` must be the payload address of a heap allocation.
    pub unsafe fn from_payload<'a>(payload: Address) -> &'a mut ObjectHeader {
        let header = &mut *payload.sub(HEADER_SIZE).as_mut_ptr::<ObjectHeader>();
        header.check();
        header
    }

    pub fn address(&self) -> Address {
        Address::from_ref(self)
    }

    pub fn payload(&self) -> Address {
        self.address().add(HEADER_SIZE)
    }

    /// Allocation size including header, zero for large objects
    pub fn size(&self) -> usize {
        (((self.encoded & SIZE_FIELD_MASK) >> SIZE_SHIFT) as usize) * ALLOCATION_GRANULARITY
    }

    pub fn set_size(&mut self, size: usize) {
        self.encoded = (self.encoded & !SIZE_FIELD_MASK) | Self::encode_size(size);
    }

    pub fn is_large_object(&self) -> bool {
        self.size() == 0
    }

    /// Size of the payload. Large objects keep their real size on
    /// the page.
    pub fn payload_size(&self) -> usize {
        if self.is_large_object() {
            unsafe { page_header_from_object(self.address()).large_payload_size() }
        } else {
            self.size() - HEADER_SIZE
        }
    }

    /// Bytes the object occupies, header included
    pub fn allocated_size(&self) -> usize {
        if self.is_large_object() {
            HEADER_SIZE + self.payload_size()
        } else {
            self.size()
        }
    }

    pub fn gc_info_index(&self) -> u32 {
        (self.encoded & GC_INFO_FIELD_MASK) >> GC_INFO_SHIFT
    }

    /// Free-list entries and fillers have no gc info
    pub fn is_free(&self) -> bool {
        self.gc_info_index() == 0
    }

    pub fn is_freed(&self) -> bool {
        self.encoded & FREED_BIT != 0
    }

    pub fn is_marked(&self) -> bool {
        self.encoded & MARK_BIT != 0
    }

    /// Set the mark bit. Marking an object twice in a cycle is a bug
    /// in the caller.
    pub fn mark(&mut self) {
        debug_assert!(!self.is_free());
        debug_assert!(!self.is_marked(), "object {:?} marked twice", self.payload());
        self.encoded |= MARK_BIT;
    }

    /// Mark if not already marked, returning whether this call did so
    pub fn try_mark(&mut self) -> bool {
        if self.is_marked() {
            false
        } else {
            self.mark();
            true
        }
    }

    pub fn unmark(&mut self) {
        debug_assert!(self.is_marked());
        self.encoded &= !MARK_BIT;
    }

    pub fn is_dead(&self) -> bool {
        self.encoded & DEAD_BIT != 0
    }

    /// Record that the object was found unreachable and finalized
    pub fn mark_dead(&mut self) {
        debug_assert!(!self.is_marked());
        self.encoded |= DEAD_BIT;
    }

    pub fn is_aux(&self) -> bool {
        self.encoded & AUX_BIT != 0
    }

    pub fn set_aux(&mut self) {
        self.encoded |= AUX_BIT;
    }

    pub fn clear_aux(&mut self) {
        self.encoded &= !AUX_BIT;
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Verify the magic word in debug builds
    pub fn check(&self) {
        if cfg!(debug_assertions) && self.magic != HEADER_MAGIC {
            crate::fatal!(
                "heap corruption: bad header magic {:#x} at {:?}",
                self.magic,
                self.address()
            );
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_expected_header_size() {
        // encoded: ff ff ff ff magic: ff ff ff ff
        assert_eq!(size_of::<ObjectHeader>(), 8);
    }

    #[test]
    pub fn test_field_packing() {
        let mut header = ObjectHeader::new(48, 1234);
        assert_eq!(header.size(), 48);
        assert_eq!(header.payload_size(), 40);
        assert_eq!(header.gc_info_index(), 1234);
        assert!(!header.is_free());
        assert!(!header.is_marked());

        header.mark();
        header.set_aux();
        assert!(header.is_marked());
        assert!(header.is_aux());
        assert_eq!(header.size(), 48);
        assert_eq!(header.gc_info_index(), 1234);

        header.unmark();
        header.clear_aux();
        assert!(!header.is_marked());
        assert!(!header.is_aux());
    }

    #[test]
    pub fn test_max_fields() {
        let header = ObjectHeader::new(MAX_ENCODED_SIZE, GC_INFO_INDEX_LIMIT - 1);
        assert_eq!(header.size(), MAX_ENCODED_SIZE);
        assert_eq!(header.gc_info_index(), GC_INFO_INDEX_LIMIT - 1);
    }

    #[test]
    pub fn test_free_header() {
        let mut header = ObjectHeader::new_free(4096);
        assert!(header.is_free());
        assert!(header.is_freed());
        assert_eq!(header.size(), 4096);
        header.set_size(64);
        assert_eq!(header.size(), 64);
        assert!(header.is_free());
    }

    #[test]
    pub fn test_try_mark_is_idempotent() {
        let mut header = ObjectHeader::new(16, 7);
        assert!(header.try_mark());
        assert!(!header.try_mark());
        assert!(header.is_marked());
    }

    #[test]
    pub fn test_dead_bit() {
        let mut header = ObjectHeader::new(16, 7);
        header.mark_dead();
        assert!(header.is_dead());
        assert!(!header.is_free());
    }
}
