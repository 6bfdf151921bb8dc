//! Page memory acquired from the OS
//!
//! Every page, normal or large, is a reservation aligned to
//! `BLINK_PAGE_SIZE` with a guard region at either end of the usable
//! span. In debug builds the guards are filled with a known pattern
//! and verified when the memory is returned.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use super::address::{Address, BLINK_PAGE_SIZE, GUARD_SIZE, OS_PAGE_SIZE};

/// Fill byte for guard regions in debug builds
const GUARD_PATTERN: u8 = 0xfd;

/// A page-aligned reservation of memory with guard regions
#[derive(Debug, PartialEq)]
pub struct PageMemory {
    /// Pointer to the start of the reservation
    ptr: NonNull<u8>,
    /// Size of the reservation, guards included
    size: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockError {
    BadSize,
    OOM,
}

impl PageMemory {
    /// Reserve `size` bytes. The size must be a whole number of OS
    /// pages with room for both guards.
    pub fn allocate(size: usize) -> Result<Self, BlockError> {
        if size % OS_PAGE_SIZE != 0 || size <= 2 * GUARD_SIZE {
            return Err(BlockError::BadSize);
        }
        let memory = PageMemory {
            ptr: Self::alloc_block(size)?,
            size,
        };
        if cfg!(debug_assertions) {
            memory.fill_guards();
        }
        Ok(memory)
    }

    /// Reserve one normal page
    pub fn allocate_normal() -> Result<Self, BlockError> {
        Self::allocate(BLINK_PAGE_SIZE)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn base(&self) -> Address {
        Address::from_ptr(self.ptr.as_ptr())
    }

    pub fn end(&self) -> Address {
        self.base().add(self.size)
    }

    /// First byte after the leading guard
    pub fn writable_start(&self) -> Address {
        self.base().add(GUARD_SIZE)
    }

    /// First byte of the trailing guard
    pub fn writable_end(&self) -> Address {
        self.end().sub(GUARD_SIZE)
    }

    pub fn writable_size(&self) -> usize {
        self.size - 2 * GUARD_SIZE
    }

    /// Whether the address lies anywhere in the reservation
    pub fn contains(&self, address: Address) -> bool {
        self.base() <= address && address < self.end()
    }

    /// Whether the address lies in the usable span
    pub fn writable_contains(&self, address: Address) -> bool {
        self.writable_start() <= address && address < self.writable_end()
    }

    /// Clear the usable span so a pooled page starts clean
    pub fn clear_writable(&self) {
        unsafe {
            std::ptr::write_bytes(
                self.writable_start().as_mut_ptr::<u8>(),
                0,
                self.writable_size(),
            )
        }
    }

    fn guards(&self) -> [&mut [u8]; 2] {
        // SAFETY: both guards lie inside the reservation and are never
        // handed out to the allocator
        unsafe {
            [
                std::slice::from_raw_parts_mut(self.base().as_mut_ptr::<u8>(), GUARD_SIZE),
                std::slice::from_raw_parts_mut(self.writable_end().as_mut_ptr::<u8>(), GUARD_SIZE),
            ]
        }
    }

    fn fill_guards(&self) {
        for guard in self.guards() {
            guard.fill(GUARD_PATTERN);
        }
    }

    /// Check that nothing has written into the guard regions
    pub fn guards_intact(&self) -> bool {
        self.guards()
            .iter()
            .all(|guard| guard.iter().all(|b| *b == GUARD_PATTERN))
    }

    fn layout(size: usize) -> Layout {
        // SAFETY: BLINK_PAGE_SIZE is a non-zero power of two and sizes
        // are checked to be page multiples
        unsafe { Layout::from_size_align_unchecked(size, BLINK_PAGE_SIZE) }
    }

    fn alloc_block(size: usize) -> Result<NonNull<u8>, BlockError> {
        unsafe {
            let ptr = alloc(Self::layout(size));
            NonNull::new(ptr).ok_or(BlockError::OOM)
        }
    }
}

impl Drop for PageMemory {
    fn drop(&mut self) {
        if cfg!(debug_assertions) && !self.guards_intact() {
            crate::fatal!("guard region overwritten on page at {:?}", self.base());
        }
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.size)) }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_bad_size() {
        assert_eq!(PageMemory::allocate(999), Err(BlockError::BadSize));
        assert_eq!(PageMemory::allocate(2 * GUARD_SIZE), Err(BlockError::BadSize));
    }

    #[test]
    fn test_normal_page_alignment() {
        let memory = PageMemory::allocate_normal().unwrap();
        assert!(memory.base().is_aligned(BLINK_PAGE_SIZE));
        assert_eq!(memory.writable_size(), BLINK_PAGE_SIZE - 2 * GUARD_SIZE);
        assert_eq!(memory.writable_start().page_base(), memory.base());
        assert!(memory.guards_intact() || !cfg!(debug_assertions));
    }

    #[test]
    fn test_large_reservation() {
        let memory = PageMemory::allocate(3 * BLINK_PAGE_SIZE + OS_PAGE_SIZE).unwrap();
        assert!(memory.base().is_aligned(BLINK_PAGE_SIZE));
        assert!(memory.contains(memory.writable_end()));
        assert!(!memory.writable_contains(memory.writable_end()));
        assert!(!memory.contains(memory.end()));
    }
}
