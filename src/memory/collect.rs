//! Collector support
//!
//! The collector context owns the work lists of a marking cycle: the
//! marking stack of objects still to be traced, callbacks deferred
//! until marking is otherwise complete, weak callbacks and registered
//! ephemeron tables. It also tracks which phase the heap is in.
//!
//! A cycle runs Idle → Marking → WeakProcessing → Sweeping → Idle and
//! cannot be abandoned once marking begins.

use std::collections::HashSet;
use std::time::Duration;

use super::address::Address;
use super::classifier::AddressClassifier;
use super::gcinfo::{TraceCallback, WeakCallback};
use super::guard::RecursionGuard;
use super::visitor::{LivenessBroker, Visitor};
use crate::config::HeapConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
    WeakProcessing,
    Sweeping,
}

#[derive(Clone, Copy)]
struct EphemeronTable {
    table: Address,
    iterate: TraceCallback,
    done: WeakCallback,
}

/// Work lists and phase of a heap's collector
pub struct CollectorContext {
    phase: GcPhase,
    initialized: bool,
    marking_stack: Vec<(Address, TraceCallback)>,
    post_marking_stack: Vec<(Address, TraceCallback)>,
    weak_callback_stack: Vec<(Address, WeakCallback)>,
    ephemeron_tables: Vec<EphemeronTable>,
    /// Objects of other heaps traced through this cycle
    foreign_visited: HashSet<Address>,
    marked_bytes: usize,
    marked_objects: usize,
}

impl Default for CollectorContext {
    fn default() -> Self {
        CollectorContext::new()
    }
}

impl std::fmt::Debug for CollectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorContext")
            .field("phase", &self.phase)
            .field("marking", &self.marking_stack.len())
            .field("post_marking", &self.post_marking_stack.len())
            .field("weak", &self.weak_callback_stack.len())
            .field("ephemerons", &self.ephemeron_tables.len())
            .finish()
    }
}

impl CollectorContext {
    pub fn new() -> Self {
        CollectorContext {
            phase: GcPhase::Idle,
            initialized: false,
            marking_stack: vec![],
            post_marking_stack: vec![],
            weak_callback_stack: vec![],
            ephemeron_tables: vec![],
            foreign_visited: HashSet::new(),
            marked_bytes: 0,
            marked_objects: 0,
        }
    }

    /// Prepare the work lists for use
    pub fn init(&mut self) {
        debug_assert!(!self.initialized);
        self.marking_stack.reserve(512);
        self.initialized = true;
        self.phase = GcPhase::Idle;
    }

    /// Release the work lists. The context must be idle.
    pub fn shutdown(&mut self) {
        if self.phase != GcPhase::Idle {
            crate::fatal!("collector shut down during {:?}", self.phase);
        }
        self.check_drained();
        self.marking_stack = vec![];
        self.post_marking_stack = vec![];
        self.weak_callback_stack = vec![];
        self.ephemeron_tables = vec![];
        self.foreign_visited = HashSet::new();
        self.initialized = false;
    }

    /// Clear per-cycle state ready for a new marking phase
    pub fn reset(&mut self) {
        self.check_drained();
        self.foreign_visited.clear();
        self.marked_bytes = 0;
        self.marked_objects = 0;
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocation is forbidden while the object graph is being traced
    pub fn is_allocation_allowed(&self) -> bool {
        matches!(self.phase, GcPhase::Idle | GcPhase::Sweeping)
    }

    fn transition(&mut self, from: GcPhase, to: GcPhase) {
        if !self.initialized {
            crate::fatal!("collector used before init");
        }
        if self.phase != from {
            crate::fatal!("bad collector transition {:?} -> {:?} from {:?}", from, to, self.phase);
        }
        log::trace!("gc phase {:?} -> {:?}", from, to);
        self.phase = to;
    }

    pub fn begin_marking(&mut self) {
        self.transition(GcPhase::Idle, GcPhase::Marking);
        self.reset();
    }

    pub fn enter_weak_processing(&mut self) {
        if !self.marking_stack.is_empty() || !self.post_marking_stack.is_empty() {
            crate::fatal!("weak processing started with marking work outstanding: {:?}", self);
        }
        self.transition(GcPhase::Marking, GcPhase::WeakProcessing);
    }

    pub fn enter_sweeping(&mut self) {
        self.transition(GcPhase::WeakProcessing, GcPhase::Sweeping);
        self.check_drained();
    }

    /// Complete the cycle once every page has been swept
    pub fn finish_cycle(&mut self) {
        self.transition(GcPhase::Sweeping, GcPhase::Idle);
        self.check_drained();
    }

    fn check_drained(&self) {
        if self.has_pending_work() {
            crate::fatal!("collector work left over at end of cycle: {:?}", self);
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !(self.marking_stack.is_empty()
            && self.post_marking_stack.is_empty()
            && self.weak_callback_stack.is_empty()
            && self.ephemeron_tables.is_empty())
    }

    pub(crate) fn record_marked(&mut self, bytes: usize) {
        self.marked_bytes += bytes;
        self.marked_objects += 1;
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    /// Record a visit to another heap's object, returning whether it
    /// is the first this cycle
    pub(crate) fn visit_foreign(&mut self, object: Address) -> bool {
        self.foreign_visited.insert(object)
    }

    pub fn foreign_objects_visited(&self) -> usize {
        self.foreign_visited.len()
    }

    pub fn marking_stack_len(&self) -> usize {
        self.marking_stack.len()
    }

    pub(crate) fn push_marking(&mut self, object: Address, trace: TraceCallback) {
        debug_assert_eq!(self.phase, GcPhase::Marking);
        self.marking_stack.push((object, trace));
    }

    fn pop_marking(&mut self) -> Option<(Address, TraceCallback)> {
        self.marking_stack.pop()
    }

    pub(crate) fn push_post_marking(&mut self, object: Address, callback: TraceCallback) {
        debug_assert_eq!(self.phase, GcPhase::Marking);
        self.post_marking_stack.push((object, callback));
    }

    pub(crate) fn push_weak_callback(&mut self, object: Address, callback: WeakCallback) {
        debug_assert_eq!(self.phase, GcPhase::Marking);
        self.weak_callback_stack.push((object, callback));
    }

    pub(crate) fn push_ephemeron_table(&mut self, table: Address, iterate: TraceCallback, done: WeakCallback) {
        debug_assert_eq!(self.phase, GcPhase::Marking);
        self.ephemeron_tables.push(EphemeronTable { table, iterate, done });
    }
}

fn drain_marking_stack(visitor: &mut Visitor<'_>) {
    while let Some((object, trace)) = visitor.context().pop_marking() {
        trace(visitor, object);
    }
}

/// Run one round of every registered ephemeron table's iteration.
/// Tables registered during the round are included.
fn iterate_ephemerons(visitor: &mut Visitor<'_>) {
    let mut index = 0;
    while let Some(table) = visitor.context().ephemeron_tables.get(index).copied() {
        (table.iterate)(visitor, table.table);
        index += 1;
    }
}

/// Trace everything reachable from what has been marked so far
///
/// Ephemeron tables are iterated to a fixed point: a round that
/// marks nothing new ends the iteration. Post-marking callbacks run
/// only once the marking stack is empty and may themselves produce
/// more marking work.
pub fn mark_transitive_closure(visitor: &mut Visitor<'_>) {
    loop {
        drain_marking_stack(visitor);

        let before = visitor.context().marked_objects();
        iterate_ephemerons(visitor);
        drain_marking_stack(visitor);
        if visitor.context().marked_objects() != before {
            continue;
        }

        match visitor.context().post_marking_stack.pop() {
            Some((object, callback)) => callback(visitor, object),
            None => break,
        }
    }
}

/// Run weak callbacks: ephemeron tables drop dead entries and weak
/// slots to dead objects are cleared
pub fn process_weak_references(context: &mut CollectorContext, broker: &LivenessBroker) {
    debug_assert_eq!(context.phase, GcPhase::WeakProcessing);
    for table in std::mem::take(&mut context.ephemeron_tables) {
        (table.done)(broker, table.table);
    }
    while let Some((object, callback)) = context.weak_callback_stack.pop() {
        callback(broker, object);
    }
}

/// What a marking phase found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkingSummary {
    pub marked_bytes: usize,
    pub marked_objects: usize,
    pub mark_time: Duration,
}

/// Run the marking and weak processing phases of a cycle
///
/// `trace_roots` is handed the visitor to mark the heap's roots. On
/// return the context is in the sweeping phase and every reachable
/// object of this heap is marked.
pub fn mark_heap(
    context: &mut CollectorContext,
    classifier: &AddressClassifier,
    heap_id: u32,
    config: &HeapConfig,
    trace_roots: impl FnOnce(&mut Visitor<'_>),
) -> MarkingSummary {
    let clock = telemetry::start();
    context.begin_marking();

    {
        let guard = RecursionGuard::new(config.recursion_limit, config.native_stack_budget);
        let mut visitor = Visitor::new(context, classifier, heap_id, guard);
        trace_roots(&mut visitor);
        mark_transitive_closure(&mut visitor);
    }

    context.enter_weak_processing();
    process_weak_references(context, &LivenessBroker::new(heap_id));
    context.enter_sweeping();

    MarkingSummary {
        marked_bytes: context.marked_bytes(),
        marked_objects: context.marked_objects(),
        mark_time: telemetry::elapsed(clock),
    }
}

/// Phase timing, compiled in with the `gc-telemetry` feature
pub(crate) mod telemetry {
    use std::time::Duration;

    #[cfg(feature = "gc-telemetry")]
    pub type Clock = std::time::Instant;
    #[cfg(not(feature = "gc-telemetry"))]
    pub type Clock = ();

    #[cfg(feature = "gc-telemetry")]
    pub fn start() -> Clock {
        std::time::Instant::now()
    }

    #[cfg(not(feature = "gc-telemetry"))]
    pub fn start() -> Clock {}

    #[cfg(feature = "gc-telemetry")]
    pub fn elapsed(clock: Clock) -> Duration {
        clock.elapsed()
    }

    #[cfg(not(feature = "gc-telemetry"))]
    pub fn elapsed(_clock: Clock) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_phase_transitions() {
        let mut context = CollectorContext::new();
        context.init();
        assert_eq!(context.phase(), GcPhase::Idle);
        assert!(context.is_allocation_allowed());

        context.begin_marking();
        assert!(!context.is_allocation_allowed());
        context.enter_weak_processing();
        assert_eq!(context.phase(), GcPhase::WeakProcessing);
        assert!(!context.is_allocation_allowed());
        context.enter_sweeping();
        assert!(context.is_allocation_allowed());
        context.finish_cycle();
        assert_eq!(context.phase(), GcPhase::Idle);

        context.shutdown();
        assert!(!context.is_initialized());
    }

    #[test]
    pub fn test_mark_empty_heap() {
        let mut context = CollectorContext::new();
        context.init();
        let classifier = AddressClassifier::new();
        let mut roots_traced = false;
        let summary = mark_heap(&mut context, &classifier, 0, &HeapConfig::default(), |_| {
            roots_traced = true
        });
        assert!(roots_traced);
        assert_eq!(summary.marked_objects, 0);
        assert_eq!(context.phase(), GcPhase::Sweeping);
        context.finish_cycle();
    }
}
