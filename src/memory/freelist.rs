//! Free lists of reclaimed memory
//!
//! A free-list entry is an object header with gc info index 0
//! followed by an intrusive next pointer. Entries are bucketed by
//! `floor(log2(size))` so every entry in bucket `n` is at least `2^n`
//! bytes and less than `2^(n+1)`.

use std::mem::size_of;
use std::ptr::{self, NonNull};

use super::address::{Address, ALLOCATION_GRANULARITY, BLINK_PAGE_SIZE_LOG2};
use super::header::{ObjectHeader, HEADER_SIZE};

/// Number of buckets; a page's payload is always under 2^17 bytes
pub const BUCKET_COUNT: usize = BLINK_PAGE_SIZE_LOG2 + 1;

/// Byte used to zap freed memory in debug builds
pub const ZAP_VALUE: u8 = 0x2a;

/// Smallest region that can be linked onto a free list. Anything
/// smaller is left as a filler header.
pub const FREE_LIST_ENTRY_SIZE: usize = size_of::<FreeListEntry>();

#[repr(C)]
#[derive(Debug)]
pub struct FreeListEntry {
    header: ObjectHeader,
    next: Option<NonNull<FreeListEntry>>,
}

const _: () = assert!(FREE_LIST_ENTRY_SIZE == 2 * HEADER_SIZE);

impl FreeListEntry {
    pub fn address(&self) -> Address {
        Address::from_ref(self)
    }

    pub fn size(&self) -> usize {
        self.header.size()
    }

    pub fn next(&self) -> Option<NonNull<FreeListEntry>> {
        self.next
    }
}

/// Bucket holding entries of `size` bytes
pub fn bucket_index_for_size(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// Write a free header over `size` bytes at `address` without
/// linking it anywhere. Used for slivers too small for the list and
/// to keep pages walkable.
///
/// # Safety
///
/// The region must be writable heap memory not in use by any object.
pub unsafe fn write_filler(address: Address, size: usize, zap: bool) {
    debug_assert!(size >= HEADER_SIZE);
    if zap {
        ptr::write_bytes(address.add(HEADER_SIZE).as_mut_ptr::<u8>(), ZAP_VALUE, size - HEADER_SIZE);
    }
    ptr::write(address.as_mut_ptr::<ObjectHeader>(), ObjectHeader::new_free(size));
}

pub struct FreeList {
    buckets: [Option<NonNull<FreeListEntry>>; BUCKET_COUNT],
    /// Highest bucket that may be non-empty
    biggest_index: Option<usize>,
    /// Bytes currently linked onto the list
    free_bytes: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            buckets: [None; BUCKET_COUNT],
            biggest_index: None,
            free_bytes: 0,
        }
    }

    /// Forget every entry. The memory itself is untouched.
    pub fn clear(&mut self) {
        self.buckets = [None; BUCKET_COUNT];
        self.biggest_index = None;
        self.free_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.biggest_index.is_none()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Turn `size` bytes at `address` into a free region, linking it
    /// onto the appropriate bucket if it is big enough to be reused.
    ///
    /// # Safety
    ///
    /// The region must be writable heap memory not in use by any
    /// object, inside a single page.
    pub unsafe fn add_to_free_list(&mut self, address: Address, size: usize, zap: bool) {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        if size < FREE_LIST_ENTRY_SIZE {
            write_filler(address, size, zap);
            return;
        }

        if zap {
            ptr::write_bytes(
                address.add(FREE_LIST_ENTRY_SIZE).as_mut_ptr::<u8>(),
                ZAP_VALUE,
                size - FREE_LIST_ENTRY_SIZE,
            );
        }

        let index = bucket_index_for_size(size);
        let entry = address.as_mut_ptr::<FreeListEntry>();
        ptr::write(
            entry,
            FreeListEntry {
                header: ObjectHeader::new_free(size),
                next: self.buckets[index],
            },
        );
        self.buckets[index] = NonNull::new(entry);
        self.biggest_index = Some(self.biggest_index.map_or(index, |b| b.max(index)));
        self.free_bytes += size;
    }

    /// Take an entry of at least `size` bytes off the list
    ///
    /// The smallest bucket that might hold a fit is scanned first-fit;
    /// failing that, the head of any larger bucket fits by
    /// construction.
    pub fn allocate(&mut self, size: usize) -> Option<(Address, usize)> {
        let biggest = self.biggest_index?;
        let first = bucket_index_for_size(size);
        if first > biggest {
            return None;
        }

        if let Some(found) = self.take_first_fit(first, size) {
            return Some(found);
        }

        for index in (first + 1)..=biggest {
            if let Some(entry) = self.buckets[index] {
                let entry = unsafe { entry.as_ref() };
                self.buckets[index] = entry.next;
                return Some(self.took(entry));
            }
        }

        self.recompute_biggest();
        None
    }

    fn take_first_fit(&mut self, index: usize, size: usize) -> Option<(Address, usize)> {
        let mut prev: Option<NonNull<FreeListEntry>> = None;
        let mut cursor = self.buckets[index];
        while let Some(entry) = cursor {
            let entry = unsafe { &mut *entry.as_ptr() };
            if entry.size() >= size {
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = entry.next },
                    None => self.buckets[index] = entry.next,
                }
                return Some(self.took(entry));
            }
            prev = cursor;
            cursor = entry.next;
        }
        None
    }

    fn took(&mut self, entry: &FreeListEntry) -> (Address, usize) {
        let size = entry.size();
        self.free_bytes -= size;
        self.recompute_biggest();
        (entry.address(), size)
    }

    fn recompute_biggest(&mut self) {
        self.biggest_index = self.buckets.iter().rposition(|b| b.is_some());
    }

    /// Iterate over (bucket, entry address, entry size)
    pub fn entries(&self) -> impl Iterator<Item = (usize, Address, usize)> + '_ {
        self.buckets.iter().enumerate().flat_map(|(index, head)| {
            let mut cursor = *head;
            std::iter::from_fn(move || {
                let entry = unsafe { cursor?.as_ref() };
                cursor = entry.next;
                Some((index, entry.address(), entry.size()))
            })
        })
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, head) in self.buckets.iter().enumerate() {
            if head.is_some() {
                let count = self.entries().filter(|(b, _, _)| *b == index).count();
                writeln!(f, "  bucket {index:>2} (>= {:>6}): {count} entries", 1usize << index)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Scratch memory standing in for a page payload
    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    #[test]
    pub fn test_bucket_index() {
        assert_eq!(bucket_index_for_size(16), 4);
        assert_eq!(bucket_index_for_size(31), 4);
        assert_eq!(bucket_index_for_size(32), 5);
        assert_eq!(bucket_index_for_size(4096), 12);
    }

    #[test]
    pub fn test_bucket_invariant() {
        let mut memory = scratch(4096);
        let base = Address::from_ptr(memory.as_mut_ptr());
        let mut list = FreeList::new();

        let mut offset = 0;
        for size in [16, 24, 40, 64, 72, 200, 1024, 1032, 8192] {
            unsafe { list.add_to_free_list(base.add(offset), size, true) };
            offset += size;
        }

        for (bucket, _, size) in list.entries() {
            assert!(size >= 1 << bucket);
            assert!(size < 1 << (bucket + 1));
        }
        assert_eq!(list.free_bytes(), offset);
    }

    #[test]
    pub fn test_filler_not_linked() {
        let mut memory = scratch(4);
        let base = Address::from_ptr(memory.as_mut_ptr());
        let mut list = FreeList::new();
        unsafe { list.add_to_free_list(base, 8, true) };
        assert!(list.is_empty());
        let header = unsafe { &*base.as_ptr::<ObjectHeader>() };
        assert!(header.is_free());
        assert_eq!(header.size(), 8);
    }

    #[test]
    pub fn test_first_fit_in_bucket() {
        let mut memory = scratch(64);
        let base = Address::from_ptr(memory.as_mut_ptr());
        let mut list = FreeList::new();
        unsafe {
            list.add_to_free_list(base, 40, false);
            list.add_to_free_list(base.add(40), 56, false);
        }
        // both in bucket 5; 56 was pushed last so is scanned first
        let (addr, size) = list.allocate(48).unwrap();
        assert_eq!(addr, base.add(40));
        assert_eq!(size, 56);
        let (addr, size) = list.allocate(40).unwrap();
        assert_eq!(addr, base);
        assert_eq!(size, 40);
        assert!(list.allocate(16).is_none());
        assert!(list.is_empty());
    }

    #[test]
    pub fn test_falls_through_to_larger_bucket() {
        let mut memory = scratch(128);
        let base = Address::from_ptr(memory.as_mut_ptr());
        let mut list = FreeList::new();
        unsafe {
            list.add_to_free_list(base, 40, false);
            list.add_to_free_list(base.add(40), 512, false);
        }
        let (addr, size) = list.allocate(48).unwrap();
        assert_eq!(addr, base.add(40));
        assert_eq!(size, 512);
        assert_eq!(list.free_bytes(), 40);
    }

    #[test]
    pub fn test_request_beyond_biggest() {
        let mut memory = scratch(16);
        let base = Address::from_ptr(memory.as_mut_ptr());
        let mut list = FreeList::new();
        unsafe { list.add_to_free_list(base, 64, false) };
        assert!(list.allocate(128).is_none());
        assert_eq!(list.free_bytes(), 64);
    }
}
