//! Raw addresses and the heap's layout constants
//!
//! Every page is carved out of a `BLINK_PAGE_SIZE`-aligned block of
//! memory so that the owning page of any object header can be found
//! by masking.

use std::fmt;
use std::ptr::NonNull;

/// Log2 of the size of a normal page (128K)
pub const BLINK_PAGE_SIZE_LOG2: usize = 17;
/// Size of a normal page and alignment of every page
pub const BLINK_PAGE_SIZE: usize = 1 << BLINK_PAGE_SIZE_LOG2;
/// Mask to find the page-aligned base of an address
pub const BLINK_PAGE_BASE_MASK: usize = !(BLINK_PAGE_SIZE - 1);

/// Granularity the underlying system maps memory in
pub const OS_PAGE_SIZE: usize = 4096;

/// Guard regions sit immediately before and after every payload
pub const GUARD_SIZE: usize = OS_PAGE_SIZE;

/// All allocation sizes are a multiple of this
pub const ALLOCATION_GRANULARITY: usize = 8;
/// Mask for the sub-granularity bits of a size
pub const ALLOCATION_MASK: usize = ALLOCATION_GRANULARITY - 1;

/// Allocations at least this size (header included) get a dedicated
/// large object page
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = BLINK_PAGE_SIZE / 2;

/// Largest single object the heap will hand out
pub const MAX_HEAP_OBJECT_SIZE: usize = 1 << 27;

/// Round `size` up to a multiple of `align` (a power of two)
pub const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// An untyped machine address inside (or perhaps outside) the heap
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(addr: usize) -> Self {
        Address(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    pub fn from_ref<T>(r: &T) -> Self {
        Address(r as *const T as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn as_non_null<T>(self) -> Option<NonNull<T>> {
        NonNull::new(self.as_mut_ptr())
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, bytes: usize) -> Self {
        Address(self.0 + bytes)
    }

    pub const fn sub(self, bytes: usize) -> Self {
        Address(self.0 - bytes)
    }

    /// Bytes from `base` up to this address
    pub const fn offset_from(self, base: Address) -> usize {
        debug_assert!(self.0 >= base.0);
        self.0 - base.0
    }

    pub const fn align_down(self, align: usize) -> Self {
        Address(self.0 & !(align - 1))
    }

    pub const fn align_up(self, align: usize) -> Self {
        Address(round_up(self.0, align))
    }

    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Base of the blink page containing this address
    pub const fn page_base(self) -> Self {
        Address(self.0 & BLINK_PAGE_BASE_MASK)
    }
}

impl<T> From<NonNull<T>> for Address {
    fn from(ptr: NonNull<T>) -> Self {
        Address(ptr.as_ptr() as usize)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_round_up() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(24, 8), 24);
        assert_eq!(round_up(4097, OS_PAGE_SIZE), 8192);
    }

    #[test]
    pub fn test_page_base() {
        let addr = Address::new(3 * BLINK_PAGE_SIZE + 1234);
        assert_eq!(addr.page_base(), Address::new(3 * BLINK_PAGE_SIZE));
        assert!(addr.page_base().is_aligned(BLINK_PAGE_SIZE));
        assert_eq!(addr.offset_from(addr.page_base()), 1234);
    }
}
