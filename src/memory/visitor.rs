//! The tracing protocol
//!
//! A type opts into the heap by implementing `Trace`: its `trace`
//! method hands every strong reference it holds (a `Member`) to the
//! visitor and every weak one (a `WeakMember`) to the visitor's weak
//! processing. The collector calls `trace` through the type's
//! `GcInfo` once the object is found reachable.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::address::Address;
use super::classifier::AddressClassifier;
use super::collect::CollectorContext;
use super::gcinfo::{GcInfoTable, TraceCallback, WeakCallback};
use super::guard::RecursionGuard;
use super::header::{ObjectHeader, HEADER_SIZE};
use super::page::page_header_from_object;

/// Anything that may hold references to heap objects
pub trait Trace {
    /// Whether the collector may trace objects of this type
    /// recursively when it finds them. Types that head long chains
    /// can opt out and always go through the marking stack.
    const TRACE_EAGERLY: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>);
}

/// Types that can be allocated on the heap
pub trait GarbageCollected: Trace + 'static {}

impl<T: Trace + 'static> GarbageCollected for T {}

/// A strong reference to a heap object
pub struct Member<T> {
    ptr: NonNull<T>,
}

impl<T> Clone for Member<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Member<T> {}

impl<T> PartialEq for Member<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Member<T> {}

impl<T> Hash for Member<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state)
    }
}

impl<T> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({:p})", self.ptr)
    }
}

impl<T> Member<T> {
    /// # Safety
    ///
    /// `payload` must be the payload of a live heap object of type `T`.
    pub unsafe fn from_payload(payload: Address) -> Self {
        Member {
            ptr: NonNull::new_unchecked(payload.as_mut_ptr()),
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    pub fn payload(&self) -> Address {
        Address::from(self.ptr)
    }

    /// Borrow the object
    ///
    /// # Safety
    ///
    /// The object must still be alive: reachable from a root since
    /// the last collection, or allocated since.
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        &*self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// As for `as_ref`.
    pub unsafe fn header<'a>(&self) -> &'a ObjectHeader {
        ObjectHeader::from_payload(self.payload())
    }
}

/// A reference that does not keep its target alive and is cleared
/// when the target dies
pub struct WeakMember<T> {
    ptr: Cell<Option<NonNull<T>>>,
    _marker: PhantomData<T>,
}

impl<T> Default for WeakMember<T> {
    fn default() -> Self {
        WeakMember::empty()
    }
}

impl<T> fmt::Debug for WeakMember<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr.get() {
            Some(ptr) => write!(f, "WeakMember({:p})", ptr),
            None => write!(f, "WeakMember(null)"),
        }
    }
}

impl<T> WeakMember<T> {
    pub fn new(target: Member<T>) -> Self {
        WeakMember {
            ptr: Cell::new(Some(target.ptr)),
            _marker: PhantomData,
        }
    }

    pub fn empty() -> Self {
        WeakMember {
            ptr: Cell::new(None),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> Option<Member<T>> {
        self.ptr.get().map(|ptr| Member { ptr })
    }

    pub fn set(&self, target: Option<Member<T>>) {
        self.ptr.set(target.map(|m| m.ptr));
    }

    pub fn clear(&self) {
        self.ptr.set(None);
    }

    pub fn is_set(&self) -> bool {
        self.ptr.get().is_some()
    }
}

fn clear_dead_weak_member<T: GarbageCollected>(broker: &LivenessBroker, slot: Address) {
    let weak = unsafe { &*slot.as_ptr::<WeakMember<T>>() };
    if let Some(target) = weak.get() {
        if !broker.is_alive(&target) {
            weak.clear();
        }
    }
}

/// Whether a heap object is alive, usable at any time outside
/// marking, including from finalizers
///
/// On a page not yet swept since the last marking only marked
/// objects are alive. On a swept page every allocated object is.
/// Finalizers of a cycle all run before any memory is reused, so
/// from a finalizer any object of the heap may be asked about.
pub fn is_heap_object_alive(payload: Address) -> bool {
    let page = unsafe { page_header_from_object(payload.sub(HEADER_SIZE)) };
    let header = unsafe { ObjectHeader::from_payload(payload) };
    if !page.is_swept() {
        return header.is_marked();
    }
    !header.is_free() && !header.is_dead()
}

/// Liveness queries during weak processing
pub struct LivenessBroker {
    heap_id: u32,
}

impl LivenessBroker {
    pub(crate) fn new(heap_id: u32) -> Self {
        LivenessBroker { heap_id }
    }

    /// Objects on other heaps are never collected by this heap's
    /// cycle, so they count as alive
    pub fn is_heap_object_alive(&self, payload: Address) -> bool {
        let header = unsafe { ObjectHeader::from_payload(payload) };
        let page = unsafe { page_header_from_object(header.address()) };
        page.heap_id() != self.heap_id || header.is_marked()
    }

    pub fn is_alive<T>(&self, member: &Member<T>) -> bool {
        self.is_heap_object_alive(member.payload())
    }
}

/// Passed to every `trace` method during marking
pub struct Visitor<'a> {
    context: &'a mut CollectorContext,
    classifier: &'a AddressClassifier,
    heap_id: u32,
    guard: RecursionGuard,
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(
        context: &'a mut CollectorContext,
        classifier: &'a AddressClassifier,
        heap_id: u32,
        guard: RecursionGuard,
    ) -> Self {
        Visitor {
            context,
            classifier,
            heap_id,
            guard,
        }
    }

    pub fn heap_id(&self) -> u32 {
        self.heap_id
    }

    pub(crate) fn context(&mut self) -> &mut CollectorContext {
        &mut *self.context
    }

    /// Trace a strong reference
    pub fn trace<T: GarbageCollected>(&mut self, member: &Member<T>) {
        self.trace_payload(member.payload());
    }

    /// Trace the object at `payload` using its registered descriptor
    pub fn trace_payload(&mut self, payload: Address) {
        let header = unsafe { ObjectHeader::from_payload(payload) };
        let info = GcInfoTable::global().lookup(header.gc_info_index());
        self.mark(header, info.trace);
    }

    /// Trace a weak reference: the slot is cleared after marking if
    /// its target was not otherwise reached
    pub fn trace_weak<T: GarbageCollected>(&mut self, weak: &WeakMember<T>) {
        if weak.is_set() {
            self.register_weak_members(Address::from_ref(weak), clear_dead_weak_member::<T>);
        }
    }

    /// Mark an object and schedule or perform its tracing
    ///
    /// A no-op for objects already marked in this cycle. Objects of
    /// another heap are traced through, once per cycle, but their
    /// mark bits are left alone.
    pub fn mark(&mut self, header: &mut ObjectHeader, trace: TraceCallback) {
        if self.is_foreign(header) {
            if self.context.visit_foreign(header.payload()) {
                self.trace_or_defer(header, trace);
            }
            return;
        }
        if !header.try_mark() {
            return;
        }
        self.context.record_marked(header.allocated_size());
        self.trace_or_defer(header, trace);
    }

    fn trace_or_defer(&mut self, header: &ObjectHeader, trace: TraceCallback) {
        let eager = GcInfoTable::global()
            .lookup(header.gc_info_index())
            .trace_eagerly();
        if eager && self.guard.is_safe_to_recurse() {
            self.guard.enter();
            trace(self, header.payload());
            self.guard.leave();
        } else {
            self.context.push_marking(header.payload(), trace);
        }
    }

    fn is_foreign(&self, header: &ObjectHeader) -> bool {
        unsafe { page_header_from_object(header.address()) }.heap_id() != self.heap_id
    }

    /// Run `callback` on `object` once marking has finished
    pub fn register_weak_members(&mut self, object: Address, callback: WeakCallback) {
        self.context.push_weak_callback(object, callback);
    }

    /// Register an ephemeron table. `iterate` is called repeatedly
    /// until marking reaches a fixed point and should trace the
    /// values of entries whose keys are alive. `done` runs during
    /// weak processing to drop entries with dead keys.
    pub fn register_weak_table(&mut self, table: Address, iterate: TraceCallback, done: WeakCallback) {
        self.context.push_ephemeron_table(table, iterate, done);
    }

    /// Run `callback` on `object` after the marking stack has drained
    pub fn register_post_marking_callback(&mut self, object: Address, callback: TraceCallback) {
        self.context.push_post_marking(object, callback);
    }

    /// Whether the object has been reached so far in this cycle
    pub fn is_heap_object_alive(&self, payload: Address) -> bool {
        let header = unsafe { ObjectHeader::from_payload(payload) };
        self.is_foreign(header) || header.is_marked()
    }

    pub fn is_alive<T>(&self, member: &Member<T>) -> bool {
        self.is_heap_object_alive(member.payload())
    }

    /// Treat an arbitrary word as a possible pointer into the heap
    ///
    /// If it points anywhere inside an allocated object the object is
    /// marked (and flagged as conservatively found). Returns whether
    /// an object was found.
    pub fn check_and_mark_pointer(&mut self, address: Address) -> bool {
        let page = match self.classifier.classify(address) {
            Some(page) => page,
            None => return false,
        };
        match unsafe { page.find_header(address) } {
            Some(header) => {
                header.set_aux();
                let info = GcInfoTable::global().lookup(header.gc_info_index());
                self.mark(header, info.trace);
                true
            }
            None => false,
        }
    }
}

macro_rules! leaf_trace {
    ($($t:ty),*) => {
        $(
            impl Trace for $t {
                fn trace(&self, _visitor: &mut Visitor<'_>) {}
            }
        )*
    };
}

leaf_trace!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
    f32,
    f64,
    String,
    &'static str
);

impl<T: GarbageCollected> Trace for Member<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.trace(self);
    }
}

impl<T: GarbageCollected> Trace for WeakMember<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.trace_weak(self);
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for value in self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for Box<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        (**self).trace(visitor);
    }
}

impl<T: Trace + Copy> Trace for Cell<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.get().trace(visitor);
    }
}

impl<T: Trace> Trace for RefCell<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.borrow().trace(visitor);
    }
}

impl<A: Trace, B: Trace> Trace for (A, B) {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.0.trace(visitor);
        self.1.trace(visitor);
    }
}
