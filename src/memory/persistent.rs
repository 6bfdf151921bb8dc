//! Persistent handles: explicit roots
//!
//! A `Persistent` keeps its target alive across collections for as
//! long as the handle exists, independent of any stack scanning.
//! Handles register a slot in their heap's region and free it when
//! dropped.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::address::Address;
use super::visitor::{GarbageCollected, Member, Visitor};

/// The slots of every persistent handle of one heap
#[derive(Debug)]
pub struct PersistentRegion {
    nodes: RefCell<Vec<Option<Address>>>,
    free_slots: RefCell<Vec<usize>>,
    heap_alive: Cell<bool>,
}

impl PersistentRegion {
    pub fn new() -> Rc<Self> {
        Rc::new(PersistentRegion {
            nodes: RefCell::new(vec![]),
            free_slots: RefCell::new(vec![]),
            heap_alive: Cell::new(true),
        })
    }

    fn allocate_slot(&self, target: Option<Address>) -> usize {
        let mut nodes = self.nodes.borrow_mut();
        match self.free_slots.borrow_mut().pop() {
            Some(slot) => {
                nodes[slot] = target;
                slot
            }
            None => {
                nodes.push(target);
                nodes.len() - 1
            }
        }
    }

    fn free_slot(&self, slot: usize) {
        self.nodes.borrow_mut()[slot] = None;
        self.free_slots.borrow_mut().push(slot);
    }

    fn get(&self, slot: usize) -> Option<Address> {
        if self.heap_alive.get() {
            self.nodes.borrow()[slot]
        } else {
            None
        }
    }

    fn set(&self, slot: usize, target: Option<Address>) {
        self.nodes.borrow_mut()[slot] = target;
    }

    /// Mark every object held by a live handle
    pub fn trace(&self, visitor: &mut Visitor<'_>) {
        // tracing may run arbitrary trace methods, so never hold the
        // borrow across them
        let targets: Vec<Address> = self.nodes.borrow().iter().flatten().copied().collect();
        for target in targets {
            visitor.trace_payload(target);
        }
    }

    /// The owning heap has gone: every handle now reads as empty
    pub fn heap_terminated(&self) {
        self.heap_alive.set(false);
        self.nodes.borrow_mut().iter_mut().for_each(|n| *n = None);
    }

    pub fn is_heap_alive(&self) -> bool {
        self.heap_alive.get()
    }

    /// Number of handles currently holding a target
    pub fn len(&self) -> usize {
        self.nodes.borrow().iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A root reference to a heap object
pub struct Persistent<T> {
    region: Rc<PersistentRegion>,
    slot: usize,
    _marker: PhantomData<Member<T>>,
}

impl<T: GarbageCollected> Persistent<T> {
    pub(crate) fn new(region: &Rc<PersistentRegion>, target: Option<Member<T>>) -> Self {
        let slot = region.allocate_slot(target.map(|m| m.payload()));
        Persistent {
            region: region.clone(),
            slot,
            _marker: PhantomData,
        }
    }

    /// The target, or `None` if cleared or the heap has been dropped
    pub fn get(&self) -> Option<Member<T>> {
        self.region
            .get(self.slot)
            .map(|payload| unsafe { Member::from_payload(payload) })
    }

    pub fn set(&self, target: Option<Member<T>>) {
        if self.region.is_heap_alive() {
            self.region.set(self.slot, target.map(|m| m.payload()));
        }
    }

    pub fn clear(&self) {
        self.region.set(self.slot, None);
    }

    pub fn is_heap_alive(&self) -> bool {
        self.region.is_heap_alive()
    }
}

impl<T: GarbageCollected> Clone for Persistent<T> {
    fn clone(&self) -> Self {
        Persistent::new(&self.region, self.get())
    }
}

impl<T> Drop for Persistent<T> {
    fn drop(&mut self) {
        self.region.free_slot(self.slot);
    }
}

impl<T> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region.get(self.slot) {
            Some(payload) => write!(f, "Persistent({:?})", payload),
            None => write!(f, "Persistent(null)"),
        }
    }
}
