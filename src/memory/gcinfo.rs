//! GcInfo is the static, per-type part of every heap object: how to
//! trace it and how to finalize it.
//!
//! Each type is assigned a small integer index on first use. The
//! index is what an object's header records. Indices are stable for
//! the lifetime of the process and index 0 is never assigned.

use std::any::{type_name, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::needs_drop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::OnceLock;

use bitflags::bitflags;
use parking_lot::Mutex;

use super::address::Address;
use super::header::GC_INFO_INDEX_LIMIT;
use super::visitor::{GarbageCollected, LivenessBroker, Visitor};

/// Trace the object whose payload starts at the address
pub type TraceCallback = fn(&mut Visitor<'_>, Address);

/// Finalize the object at the payload address with the given
/// payload size
pub type FinalizeCallback = fn(Address, usize);

/// Inspect liveness after marking, e.g. to clear weak references
pub type WeakCallback = fn(&LivenessBroker, Address);

bitflags! {
    pub struct GcInfoFlags: u8 {
        const HAS_FINALIZER = 0b0001;
        const TRACE_EAGERLY = 0b0010;
    }
}

/// Type descriptor recorded once per heap-managed type
#[derive(Clone, Copy)]
pub struct GcInfo {
    pub trace: TraceCallback,
    pub finalize: Option<FinalizeCallback>,
    pub flags: GcInfoFlags,
    pub name: &'static str,
}

impl std::fmt::Debug for GcInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcInfo")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

fn trace_trampoline<T: GarbageCollected>(visitor: &mut Visitor<'_>, payload: Address) {
    let object = unsafe { &*payload.as_ptr::<T>() };
    object.trace(visitor);
}

fn finalize_trampoline<T: GarbageCollected>(payload: Address, _size: usize) {
    unsafe { ptr::drop_in_place(payload.as_mut_ptr::<T>()) }
}

impl GcInfo {
    /// Descriptor for a Rust type: tracing goes through `Trace` and
    /// finalization runs `Drop` if the type has drop glue.
    pub fn of<T: GarbageCollected>() -> Self {
        let mut flags = GcInfoFlags::empty();
        let finalize = if needs_drop::<T>() {
            flags |= GcInfoFlags::HAS_FINALIZER;
            Some(finalize_trampoline::<T> as FinalizeCallback)
        } else {
            None
        };
        if T::TRACE_EAGERLY {
            flags |= GcInfoFlags::TRACE_EAGERLY;
        }
        GcInfo {
            trace: trace_trampoline::<T>,
            finalize,
            flags,
            name: type_name::<T>(),
        }
    }

    /// Descriptor built from raw callbacks for untyped consumers
    pub fn from_callbacks(
        name: &'static str,
        trace: TraceCallback,
        finalize: Option<FinalizeCallback>,
    ) -> Self {
        let mut flags = GcInfoFlags::TRACE_EAGERLY;
        if finalize.is_some() {
            flags |= GcInfoFlags::HAS_FINALIZER;
        }
        GcInfo {
            trace,
            finalize,
            flags,
            name,
        }
    }

    pub fn has_finalizer(&self) -> bool {
        self.flags.contains(GcInfoFlags::HAS_FINALIZER)
    }

    pub fn trace_eagerly(&self) -> bool {
        self.flags.contains(GcInfoFlags::TRACE_EAGERLY)
    }
}

const CHUNK_SIZE: usize = 256;
const CHUNK_COUNT: usize = GC_INFO_INDEX_LIMIT as usize / CHUNK_SIZE;

type Chunk = [OnceLock<GcInfo>; CHUNK_SIZE];

/// Process-wide, append-only table of type descriptors
///
/// The table grows a chunk at a time under the assignment lock.
/// Chunks are never freed or moved so lookups need no lock.
pub struct GcInfoTable {
    chunks: [AtomicPtr<Chunk>; CHUNK_COUNT],
    /// Next index to hand out (high water mark)
    next_index: Mutex<u32>,
    /// Slots for Rust types, keyed by TypeId
    type_slots: Mutex<HashMap<TypeId, &'static AtomicU32>>,
}

lazy_static! {
    static ref GC_INFO_TABLE: GcInfoTable = GcInfoTable::new();
}

thread_local! {
    static TYPE_INDEX_CACHE: RefCell<HashMap<TypeId, u32>> = RefCell::new(HashMap::new());
}

impl GcInfoTable {
    fn new() -> Self {
        GcInfoTable {
            chunks: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next_index: Mutex::new(1),
            type_slots: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide table
    pub fn global() -> &'static GcInfoTable {
        &GC_INFO_TABLE
    }

    /// Assign an index for the descriptor whose per-type slot is
    /// `slot`. Idempotent: once the slot holds an index it is
    /// returned without locking.
    pub fn assign_type_index(&self, slot: &AtomicU32, info: GcInfo) -> u32 {
        let index = slot.load(Ordering::Acquire);
        if index != 0 {
            return index;
        }

        let mut next = self.next_index.lock();
        let index = slot.load(Ordering::Acquire);
        if index != 0 {
            return index;
        }

        let index = *next;
        if index >= GC_INFO_INDEX_LIMIT {
            crate::fatal!(
                "type descriptor table exhausted ({} types) registering {}",
                GC_INFO_INDEX_LIMIT - 1,
                info.name
            );
        }

        let chunk = self.ensure_chunk(index as usize / CHUNK_SIZE);
        if chunk[index as usize % CHUNK_SIZE].set(info).is_err() {
            crate::fatal!("type descriptor slot {} assigned twice", index);
        }
        *next += 1;
        slot.store(index, Ordering::Release);
        log::trace!("gc info {} assigned to {}", index, info.name);
        index
    }

    /// Index for a Rust type, assigned on first use
    pub fn index_for<T: GarbageCollected>(&self) -> u32 {
        let type_id = TypeId::of::<T>();
        if let Some(index) = TYPE_INDEX_CACHE.with(|cache| cache.borrow().get(&type_id).copied()) {
            return index;
        }

        let slot: &'static AtomicU32 = *self
            .type_slots
            .lock()
            .entry(type_id)
            .or_insert_with(|| Box::leak(Box::new(AtomicU32::new(0))));
        let index = self.assign_type_index(slot, GcInfo::of::<T>());

        TYPE_INDEX_CACHE.with(|cache| cache.borrow_mut().insert(type_id, index));
        index
    }

    /// Look up the descriptor for an assigned index
    pub fn lookup(&self, index: u32) -> &'static GcInfo {
        debug_assert!(index != 0, "gc info index 0 is reserved for free-list entries");
        if index == 0 || index >= GC_INFO_INDEX_LIMIT {
            crate::fatal!("gc info index {} out of range", index);
        }
        let chunk = self.chunks[index as usize / CHUNK_SIZE].load(Ordering::Acquire);
        if chunk.is_null() {
            crate::fatal!("gc info index {} was never assigned", index);
        }
        // Chunks are leaked on creation so the reference is 'static
        let chunk: &'static Chunk = unsafe { &*chunk };
        match chunk[index as usize % CHUNK_SIZE].get() {
            Some(info) => info,
            None => crate::fatal!("gc info index {} was never assigned", index),
        }
    }

    /// Number of indices handed out so far
    pub fn len(&self) -> usize {
        (*self.next_index.lock() - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Must be called with the assignment lock held
    fn ensure_chunk(&self, chunk_index: usize) -> &'static Chunk {
        let existing = self.chunks[chunk_index].load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let chunk: *mut Chunk = Box::into_raw(Box::new(std::array::from_fn(|_| OnceLock::new())));
        self.chunks[chunk_index].store(chunk, Ordering::Release);
        unsafe { &*chunk }
    }
}
