//! Root providers and conservative stack scanning
//!
//! Precise roots come from persistent handles and from any number of
//! registered `RootProvider`s. Optionally the mutator's stack can be
//! scanned conservatively: every aligned word between the current
//! stack pointer and the registered stack base is treated as a
//! candidate pointer and checked against the address classifier.

use std::mem::size_of;
use std::ptr;

use super::address::Address;
use super::visitor::Visitor;

/// Whether the collection must consider the native stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// Only precise roots are traced
    NoHeapPointers,
    /// The stack is scanned conservatively as well
    MayContainHeapPointers,
}

/// Supplies roots to each marking phase
pub trait RootProvider {
    fn trace_roots(&self, visitor: &mut Visitor<'_>);
}

impl<F> RootProvider for F
where
    F: Fn(&mut Visitor<'_>),
{
    fn trace_roots(&self, visitor: &mut Visitor<'_>) {
        self(visitor)
    }
}

/// Check each word as a possible heap pointer. Returns the number of
/// objects found.
pub fn scan_words(visitor: &mut Visitor<'_>, words: &[usize]) -> usize {
    words
        .iter()
        .filter(|word| visitor.check_and_mark_pointer(Address::new(**word)))
        .count()
}

/// Scan the stack of the current thread from here up to `base`
///
/// The stack is assumed to grow down. Frames of this function and its
/// callees sit below the scanned range, so anything the caller holds
/// in its own frame or above is seen.
#[inline(never)]
pub fn scan_stack(visitor: &mut Visitor<'_>, base: Address) -> usize {
    let marker = 0usize;
    let top = Address::from_ref(std::hint::black_box(&marker)).align_up(size_of::<usize>());
    if top >= base {
        log::warn!("stack base {:?} is below the current stack pointer {:?}", base, top);
        return 0;
    }

    let mut found = 0;
    let mut cursor = top;
    while cursor < base {
        let word = unsafe { ptr::read_volatile(cursor.as_ptr::<usize>()) };
        if visitor.check_and_mark_pointer(Address::new(word)) {
            found += 1;
        }
        cursor = cursor.add(size_of::<usize>());
    }
    log::trace!("stack scan {:?}..{:?} found {} objects", top, base, found);
    found
}

/// An address near the top of the caller's frame, suitable as a scan
/// base for callees
#[inline(always)]
pub fn current_stack_address() -> Address {
    let marker = 0usize;
    Address::from_ref(std::hint::black_box(&marker))
}
