//! Weak-keyed maps
//!
//! An `EphemeronMap` holds each value only for as long as its key is
//! reachable from elsewhere. Because a value may itself be what keeps
//! another map's key alive, the collector iterates all registered
//! tables until marking stops making progress.

use std::cell::RefCell;
use std::fmt;

use super::address::Address;
use super::visitor::{GarbageCollected, LivenessBroker, Member, Trace, Visitor};

pub struct EphemeronMap<K, V> {
    entries: RefCell<Vec<(Member<K>, Member<V>)>>,
}

impl<K, V> Default for EphemeronMap<K, V> {
    fn default() -> Self {
        EphemeronMap {
            entries: RefCell::new(vec![]),
        }
    }
}

impl<K, V> fmt::Debug for EphemeronMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.borrow().iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl<K: GarbageCollected, V: GarbageCollected> EphemeronMap<K, V> {
    pub fn new() -> Self {
        EphemeronMap::default()
    }

    /// Insert or replace the value for `key`, returning the old value
    pub fn insert(&self, key: Member<K>, value: Member<V>) -> Option<Member<V>> {
        let mut entries = self.entries.borrow_mut();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &Member<K>) -> Option<Member<V>> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn remove(&self, key: &Member<K>) -> Option<Member<V>> {
        let mut entries = self.entries.borrow_mut();
        let position = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.swap_remove(position).1)
    }

    pub fn contains_key(&self, key: &Member<K>) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

fn trace_live_entries<K: GarbageCollected, V: GarbageCollected>(visitor: &mut Visitor<'_>, table: Address) {
    let map = unsafe { &*table.as_ptr::<EphemeronMap<K, V>>() };
    let live: Vec<Member<V>> = map
        .entries
        .borrow()
        .iter()
        .filter(|(key, _)| visitor.is_alive(key))
        .map(|(_, value)| *value)
        .collect();
    for value in &live {
        visitor.trace(value);
    }
}

fn drop_dead_entries<K: GarbageCollected, V: GarbageCollected>(broker: &LivenessBroker, table: Address) {
    let map = unsafe { &*table.as_ptr::<EphemeronMap<K, V>>() };
    map.entries.borrow_mut().retain(|(key, _)| broker.is_alive(key));
}

impl<K: GarbageCollected, V: GarbageCollected> Trace for EphemeronMap<K, V> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        if !self.is_empty() {
            visitor.register_weak_table(
                Address::from_ref(self),
                trace_live_entries::<K, V>,
                drop_dead_entries::<K, V>,
            );
        }
    }
}
