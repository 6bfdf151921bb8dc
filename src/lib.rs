//! A thread-local, precise mark-sweep heap
//!
//! Objects live on size-segregated pages owned by a `ThreadHeap`.
//! Types opt in by implementing `Trace`. A collection marks
//! everything reachable from the heap's roots and sweeps the rest,
//! running finalizers for types with drop glue.
extern crate thiserror;
#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod error;
pub mod memory;

pub use config::{HeapConfig, SweepingType};
pub use error::HeapError;
pub use memory::address::Address;
pub use memory::collect::GcPhase;
pub use memory::ephemeron::EphemeronMap;
pub use memory::heap::{RootProviderHandle, ThreadHeap};
pub use memory::persistent::Persistent;
pub use memory::stack::{RootProvider, StackState};
pub use memory::stats::HeapStats;
pub use memory::visitor::{is_heap_object_alive, GarbageCollected, LivenessBroker, Member, Trace, Visitor, WeakMember};
