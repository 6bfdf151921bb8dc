//! Heap errors
use thiserror::Error;

use crate::memory::address::Address;

/// Recoverable failures reported to the embedder
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory acquiring {requested} bytes ({allocated_space} bytes of pages in use)")]
    OutOfMemory {
        requested: usize,
        allocated_space: usize,
    },
    #[error("allocation of {requested} bytes exceeds the maximum object size of {max} bytes")]
    InvalidAllocationSize { requested: usize, max: usize },
    #[error("cannot reallocate {type_name}: type has a finalizer")]
    ReallocateFinalizable { type_name: &'static str },
    #[error("{0} is not an object on this heap")]
    NotHeapObject(Address),
}

/// Log a message and abort the process
///
/// Used where carrying on would mean running over a corrupted heap or
/// a broken collector invariant.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        eprintln!("sweepheap fatal: {}", format_args!($($arg)+));
        std::process::abort()
    }};
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_messages() {
        let e = HeapError::InvalidAllocationSize {
            requested: 1 << 30,
            max: 1 << 27,
        };
        assert_eq!(
            e.to_string(),
            "allocation of 1073741824 bytes exceeds the maximum object size of 134217728 bytes"
        );
        assert_eq!(
            HeapError::NotHeapObject(Address::new(0x10)).to_string(),
            "0x10 is not an object on this heap"
        );
    }
}
