// ============================================================================
// filament - Derived Signals
// Lazily memoized computations over other nodes
// ============================================================================
//
// A derived is BOTH a source (it can be read and has consumers) AND a
// reaction (it has dependencies and re-executes). The dual nature is what
// lets MAYBE_DIRTY validation recurse through derived dependencies without
// knowing their value types.
//
// Deriveds created under an active effect are owned by it and destroyed
// with it. Deriveds with no owner carry UNOWNED | DISCONNECTED: while
// disconnected their reads are validated by polling dependency clocks, and
// the first read under a tracking consumer connects them to the push
// side of the graph.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::RuntimeError;
use crate::core::types::{default_equals, AnyReaction, AnySource, EqualsFn};
use crate::primitives::effect::register_derived_with_active_effect;
use crate::reactivity::tracking::{install_dependencies, set_source_status, track_read};

// =============================================================================
// DERIVED INNER
// =============================================================================

/// The record behind a derived signal.
///
/// `value` of None is the uninitialized sentinel: such a node is treated
/// as dirty regardless of its status bits.
pub struct DerivedInner<T> {
    /// Flags bitmask (DERIVED | SOURCE | status + ownership)
    flags: Cell<u32>,

    /// The producer
    producer: RefCell<Option<Box<dyn Fn() -> T>>>,

    /// Memoized value (None = uninitialized sentinel)
    value: RefCell<Option<T>>,

    /// Equality predicate deciding whether a recompute propagates
    equals: EqualsFn<T>,

    /// Write clock - stamped when the value changes
    write_version: Cell<u32>,

    /// Read clock - dedupes repeated reads within one execution
    read_version: Cell<u32>,

    /// Write clock observed at the end of the last recompute
    run_version: Cell<u32>,

    /// Consumers reading from this derived (source side)
    consumers: RefCell<Vec<Weak<dyn AnyReaction>>>,

    /// Nodes this derived reads from (reaction side)
    deps: RefCell<Vec<Rc<dyn AnySource>>>,

    /// Weak self-reference bridging the two trait views
    self_ref: RefCell<Option<Weak<DerivedInner<T>>>>,
}

impl<T> DerivedInner<T> {
    pub fn new<F>(producer: F) -> Rc<Self>
    where
        F: Fn() -> T + 'static,
        T: PartialEq,
    {
        Self::new_with_equals(producer, default_equals)
    }

    pub fn new_with_equals<F>(producer: F, equals: EqualsFn<T>) -> Rc<Self>
    where
        F: Fn() -> T + 'static,
    {
        let inner = Rc::new(Self {
            // Dirty until the first computation
            flags: Cell::new(DERIVED | SOURCE | DIRTY),
            producer: RefCell::new(Some(Box::new(producer))),
            value: RefCell::new(None),
            equals,
            write_version: Cell::new(0),
            read_version: Cell::new(0),
            run_version: Cell::new(0),
            consumers: RefCell::new(Vec::new()),
            deps: RefCell::new(Vec::new()),
            self_ref: RefCell::new(None),
        });

        *inner.self_ref.borrow_mut() = Some(Rc::downgrade(&inner));

        inner
    }

    /// The memoized value, when one exists.
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.borrow().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Execute the producer and memoize. Returns true when the value
    /// changed under this derived's equality.
    pub fn compute(&self) -> bool
    where
        T: Clone,
    {
        let new_value = {
            let producer_ref = self.producer.borrow();
            match producer_ref.as_ref() {
                Some(producer) => producer(),
                None => return false, // destroyed mid-flight
            }
        };

        let changed = {
            let current = self.value.borrow();
            match current.as_ref() {
                Some(v) => !(self.equals)(v, &new_value),
                None => true,
            }
        };

        if changed {
            *self.value.borrow_mut() = Some(new_value);
            with_context(|ctx| {
                self.write_version.set(ctx.increment_write_version());
            });
        }

        changed
    }

    /// Drop the producer and dependency edges, keeping the memoized value
    /// for reads that race destruction.
    pub(crate) fn teardown(&self) {
        *self.producer.borrow_mut() = None;
        self.deps.borrow_mut().clear();
        self.consumers.borrow_mut().clear();
    }
}

// =============================================================================
// AnySource for DerivedInner
// =============================================================================

impl<T: 'static + Clone> AnySource for DerivedInner<T> {
    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }

    fn write_version(&self) -> u32 {
        self.write_version.get()
    }

    fn set_write_version(&self, version: u32) {
        self.write_version.set(version);
    }

    fn read_version(&self) -> u32 {
        self.read_version.get()
    }

    fn set_read_version(&self, version: u32) {
        self.read_version.set(version);
    }

    fn consumer_count(&self) -> usize {
        self.consumers.borrow().len()
    }

    fn add_consumer(&self, consumer: Weak<dyn AnyReaction>) {
        self.consumers.borrow_mut().push(consumer);
    }

    fn sweep_dead_consumers(&self) {
        self.consumers.borrow_mut().retain(|w| w.strong_count() > 0);
    }

    fn for_each_consumer(&self, f: &mut dyn FnMut(Rc<dyn AnyReaction>) -> bool) {
        let consumers = self.consumers.borrow();
        for weak in consumers.iter() {
            if let Some(rc) = weak.upgrade() {
                if !f(rc) {
                    break;
                }
            }
        }
    }

    fn remove_consumer(&self, consumer: &Rc<dyn AnyReaction>) {
        let consumer_ptr = Rc::as_ptr(consumer) as *const ();
        self.consumers.borrow_mut().retain(|weak| {
            if let Some(rc) = weak.upgrade() {
                Rc::as_ptr(&rc) as *const () != consumer_ptr
            } else {
                false
            }
        });
    }

    fn clear_consumers(&self) {
        self.consumers.borrow_mut().clear();
    }

    fn is_uninitialized(&self) -> bool {
        self.value.borrow().is_none()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_derived_reaction(&self) -> Option<Rc<dyn AnyReaction>> {
        self.self_ref
            .borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|rc| rc as Rc<dyn AnyReaction>)
    }
}

// =============================================================================
// AnyReaction for DerivedInner
// =============================================================================

impl<T: 'static + Clone> AnyReaction for DerivedInner<T> {
    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }

    fn run_version(&self) -> u32 {
        self.run_version.get()
    }

    fn set_run_version(&self, version: u32) {
        self.run_version.set(version);
    }

    fn dep_count(&self) -> usize {
        self.deps.borrow().len()
    }

    fn dep_at(&self, index: usize) -> Option<Rc<dyn AnySource>> {
        self.deps.borrow().get(index).cloned()
    }

    fn add_dep(&self, source: Rc<dyn AnySource>) {
        self.deps.borrow_mut().push(source);
    }

    fn clear_deps(&self) {
        self.deps.borrow_mut().clear();
    }

    fn remove_deps_from(&self, start: usize) {
        self.deps.borrow_mut().truncate(start);
    }

    fn for_each_dep(&self, f: &mut dyn FnMut(&Rc<dyn AnySource>) -> bool) {
        for dep in self.deps.borrow().iter() {
            if !f(dep) {
                break;
            }
        }
    }

    fn remove_dep(&self, source: &Rc<dyn AnySource>) {
        let source_ptr = Rc::as_ptr(source) as *const ();
        self.deps
            .borrow_mut()
            .retain(|dep| Rc::as_ptr(dep) as *const () != source_ptr);
    }

    fn update(&self) -> bool {
        self.compute()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_derived_source(&self) -> Option<Rc<dyn AnySource>> {
        self.self_ref
            .borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|rc| rc as Rc<dyn AnySource>)
    }
}

// =============================================================================
// DERIVED<T> WRAPPER
// =============================================================================

/// A derived signal: a memoized value recomputed lazily when its
/// dependencies change.
///
/// # Example
/// ```
/// use filament::{source, derived};
///
/// let count = source(1);
/// let count2 = count.clone();
/// let doubled = derived(move || count2.get() * 2);
/// assert_eq!(doubled.get(), 2);
///
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
#[derive(Clone)]
pub struct Derived<T> {
    inner: Rc<DerivedInner<T>>,
}

impl<T: 'static + Clone> Derived<T> {
    pub(crate) fn from_inner(inner: Rc<DerivedInner<T>>) -> Self {
        Self { inner }
    }

    /// Get the derived's value, validating staleness first and registering
    /// a dependency when read inside an active consumer.
    ///
    /// A destroyed derived answers with its last memoized value; reading a
    /// destroyed derived that never computed aborts.
    pub fn get(&self) -> T {
        match self.try_get() {
            Some(value) => value,
            None => panic!("{}", RuntimeError::AccessAfterDestroy),
        }
    }

    /// Like [`get`], answering None for a destroyed, never-computed
    /// derived.
    ///
    /// [`get`]: Derived::get
    pub fn try_get(&self) -> Option<T> {
        let source = self.inner.clone() as Rc<dyn AnySource>;

        if (AnySource::flags(&*self.inner) & DESTROYED) != 0 {
            return self.inner.value();
        }

        update_derived_chain(source.clone());

        // First read under a tracking consumer pulls a disconnected derived
        // back onto the push side of the graph.
        let flags = source.flags();
        if (flags & UNOWNED) != 0
            && (flags & DISCONNECTED) != 0
            && crate::core::context::is_tracking()
        {
            connect_derived(&source);
        }

        track_read(source);

        self.inner.value()
    }

    pub fn inner(&self) -> &Rc<DerivedInner<T>> {
        &self.inner
    }

    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone() as Rc<dyn AnySource>
    }

    pub fn as_any_reaction(&self) -> Rc<dyn AnyReaction> {
        self.inner.clone() as Rc<dyn AnyReaction>
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Create a derived signal.
///
/// Lazy: the producer only runs when the derived is read and stale.
/// Created under an active effect, the derived is owned by that effect and
/// destroyed with it; otherwise it is unowned and validated by polling.
pub fn derived<T, F>(producer: F) -> Derived<T>
where
    T: 'static + Clone + PartialEq,
    F: Fn() -> T + 'static,
{
    derived_with_equals(producer, default_equals)
}

/// Create a derived with a custom equality predicate.
pub fn derived_with_equals<T, F>(producer: F, equals: EqualsFn<T>) -> Derived<T>
where
    T: 'static + Clone,
    F: Fn() -> T + 'static,
{
    let inner = DerivedInner::new_with_equals(producer, equals);
    let source = inner.clone() as Rc<dyn AnySource>;

    if !register_derived_with_active_effect(&source) {
        source.set_flags(source.flags() | UNOWNED | DISCONNECTED);
    }

    Derived::from_inner(inner)
}

// =============================================================================
// VALIDATION CHAIN
// =============================================================================

/// Whether a node must be validated before its value can be trusted.
fn needs_validation(source: &Rc<dyn AnySource>) -> bool {
    let flags = source.flags();
    if (flags & (DIRTY | MAYBE_DIRTY)) != 0 {
        return true;
    }
    // Disconnected unowned deriveds never see push invalidation: poll.
    (flags & UNOWNED) != 0 && (flags & DISCONNECTED) != 0
}

/// Whether some dependency's write clock outran the derived's run clock.
fn deps_outran_run_clock(source: &Rc<dyn AnySource>) -> bool {
    let Some(reaction) = source.as_derived_reaction() else {
        return false;
    };
    let run_version = reaction.run_version();

    let mut outran = false;
    reaction.for_each_dep(&mut |dep| {
        if dep.write_version() > run_version {
            outran = true;
            false
        } else {
            true
        }
    });
    outran
}

/// Validate a derived and everything it transitively depends on.
///
/// Stale deriveds in the dependency closure are collected breadth-first,
/// then resolved deepest-first so every validation sees current dependency
/// clocks: DIRTY (or uninitialized) nodes recompute unconditionally,
/// MAYBE_DIRTY nodes recompute only when a dependency clock outran their
/// run clock, and nodes whose dependencies all held still are marked CLEAN
/// without running - that is what keeps the diamond glitch-free.
pub fn update_derived_chain(target: Rc<dyn AnySource>) {
    if !needs_validation(&target) {
        return;
    }

    let mut chain: Vec<Rc<dyn AnySource>> = vec![target.clone()];
    let mut visited: Vec<*const ()> = vec![Rc::as_ptr(&target) as *const ()];
    let mut idx = 0;

    while idx < chain.len() {
        let current = chain[idx].clone();
        idx += 1;

        if let Some(reaction) = current.as_derived_reaction() {
            let mut found: Vec<Rc<dyn AnySource>> = Vec::new();
            reaction.for_each_dep(&mut |dep| {
                if (dep.flags() & DERIVED) != 0 && needs_validation(dep) {
                    let dep_ptr = Rc::as_ptr(dep) as *const ();
                    if !visited.contains(&dep_ptr) {
                        found.push(dep.clone());
                        visited.push(dep_ptr);
                    }
                }
                true
            });
            chain.extend(found);
        }
    }

    for i in (0..chain.len()).rev() {
        let current = &chain[i];
        let flags = current.flags();

        if (flags & DESTROYED) != 0 {
            continue;
        }

        let polling = (flags & UNOWNED) != 0 && (flags & DISCONNECTED) != 0;
        let must_recompute = (flags & DIRTY) != 0
            || current.is_uninitialized()
            || (((flags & MAYBE_DIRTY) != 0 || polling) && deps_outran_run_clock(current));

        if must_recompute {
            update_derived(current);
        } else if (flags & MAYBE_DIRTY) != 0 {
            set_source_status(&**current, CLEAN);
        }
    }
}

/// Recompute one derived under a fresh capture cycle.
fn update_derived(source: &Rc<dyn AnySource>) {
    let Some(reaction) = source.as_derived_reaction() else {
        return;
    };

    // Restores the consumer stack and scratch state on every exit path,
    // producer panics included.
    struct ExecutionGuard {
        reaction: Rc<dyn AnyReaction>,
        prev_reaction: Option<Weak<dyn AnyReaction>>,
        prev_new_deps: Vec<Rc<dyn AnySource>>,
        prev_skipped: usize,
        prev_read_version: u32,
    }

    impl Drop for ExecutionGuard {
        fn drop(&mut self) {
            self.reaction
                .set_flags(self.reaction.flags() & !REACTION_IS_UPDATING);
            with_context(|ctx| {
                ctx.set_active_reaction(self.prev_reaction.take());
                ctx.swap_new_deps(std::mem::take(&mut self.prev_new_deps));
                ctx.set_skipped_deps(self.prev_skipped);
                ctx.set_read_version(self.prev_read_version);
            });
        }
    }

    let guard = with_context(|ctx| {
        let prev_reaction = ctx.set_active_reaction(Some(Rc::downgrade(&reaction)));
        let prev_new_deps = ctx.swap_new_deps(Vec::new());
        let prev_skipped = ctx.set_skipped_deps(0);
        let prev_read_version = ctx.get_read_version();
        ctx.increment_read_version();
        ExecutionGuard {
            reaction: reaction.clone(),
            prev_reaction,
            prev_new_deps,
            prev_skipped,
            prev_read_version,
        }
    });

    reaction.set_flags(reaction.flags() | REACTION_IS_UPDATING);

    let _changed = reaction.update();

    reaction.set_flags(reaction.flags() & !REACTION_IS_UPDATING);

    let skipped = with_context(|ctx| ctx.get_skipped_deps());
    install_dependencies(reaction.clone(), skipped);

    reaction.set_run_version(with_context(|ctx| ctx.get_write_version()));
    set_source_status(&**source, CLEAN);

    drop(guard);
}

/// Reconnect a disconnected unowned derived: register back-edges for its
/// current dependencies so push invalidation reaches it again.
fn connect_derived(source: &Rc<dyn AnySource>) {
    let Some(reaction) = source.as_derived_reaction() else {
        return;
    };

    let deps: Vec<Rc<dyn AnySource>> = {
        let mut collected = Vec::new();
        reaction.for_each_dep(&mut |dep| {
            collected.push(dep.clone());
            true
        });
        collected
    };

    for dep in &deps {
        dep.add_consumer(Rc::downgrade(&reaction));

        let dep_flags = dep.flags();
        if (dep_flags & DERIVED) != 0
            && (dep_flags & UNOWNED) != 0
            && (dep_flags & DISCONNECTED) != 0
        {
            connect_derived(dep);
        }
    }

    source.set_flags(source.flags() & !DISCONNECTED);
}

/// Destroy a derived: unlink both edge directions, then mark DESTROYED.
/// The memoized value survives for late readers.
pub(crate) fn destroy_derived(source: &Rc<dyn AnySource>) {
    if (source.flags() & DESTROYED) != 0 {
        return;
    }

    if let Some(reaction) = source.as_derived_reaction() {
        crate::reactivity::tracking::remove_reactions(reaction, 0);
    }
    source.clear_consumers();
    source.set_flags(source.flags() | DESTROYED);
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::signal::source;
    use std::cell::Cell;

    #[test]
    fn derived_basic() {
        let d = derived(|| 42);
        assert_eq!(d.get(), 42);
    }

    #[test]
    fn derived_tracks_source() {
        let count = source(1);
        let doubled = derived({
            let count = count.clone();
            move || count.get() * 2
        });

        assert_eq!(doubled.get(), 2);
        count.set(5);
        assert_eq!(doubled.get(), 10);
    }

    #[test]
    fn derived_memoizes() {
        let computes = Rc::new(Cell::new(0));
        let d = derived({
            let computes = computes.clone();
            move || {
                computes.set(computes.get() + 1);
                42
            }
        });

        assert_eq!(d.get(), 42);
        assert_eq!(d.get(), 42);
        assert_eq!(computes.get(), 1);
    }

    #[test]
    fn derived_is_both_source_and_reaction() {
        let d = derived(|| 42);

        let as_source = d.as_any_source();
        assert!(as_source.flags() & DERIVED != 0);
        assert!(as_source.flags() & SOURCE != 0);
        assert!(as_source.as_derived_reaction().is_some());

        let as_reaction = d.as_any_reaction();
        assert!(as_reaction.as_derived_source().is_some());
    }

    #[test]
    fn top_level_derived_is_unowned() {
        let d = derived(|| 1);
        let flags = d.as_any_source().flags();
        assert_ne!(flags & UNOWNED, 0);
        assert_ne!(flags & DISCONNECTED, 0);
    }

    #[test]
    fn derived_chain_propagates() {
        let a = source(1);
        let b = derived({
            let a = a.clone();
            move || a.get() * 2
        });
        let c = derived({
            let b = b.clone();
            move || b.get() + 10
        });

        assert_eq!(c.get(), 12);
        a.set(5);
        assert_eq!(c.get(), 20);
    }

    #[test]
    fn unchanged_intermediate_blocks_recompute() {
        // a -> b -> c where b's output is insensitive to small changes of a:
        // c must not recompute when b revalidates without changing.
        let computes_c = Rc::new(Cell::new(0));

        let a = source(0);
        let b = derived({
            let a = a.clone();
            move || if a.get() < 10 { 0 } else { 1 }
        });
        let c = derived({
            let b = b.clone();
            let computes_c = computes_c.clone();
            move || {
                computes_c.set(computes_c.get() + 1);
                b.get() * 100
            }
        });

        assert_eq!(c.get(), 0);
        assert_eq!(computes_c.get(), 1);

        a.set(5);
        assert_eq!(c.get(), 0);
        assert_eq!(computes_c.get(), 1, "b did not change, c must not rerun");

        a.set(15);
        assert_eq!(c.get(), 100);
        assert_eq!(computes_c.get(), 2);
    }

    #[test]
    fn diamond_recomputes_each_node_once() {
        let computes_d = Rc::new(Cell::new(0));

        let a = source(1);
        let b = derived({
            let a = a.clone();
            move || a.get() + 10
        });
        let c = derived({
            let a = a.clone();
            move || a.get() * 10
        });
        let d = derived({
            let b = b.clone();
            let c = c.clone();
            let computes_d = computes_d.clone();
            move || {
                computes_d.set(computes_d.get() + 1);
                b.get() + c.get()
            }
        });

        assert_eq!(d.get(), 21);
        assert_eq!(computes_d.get(), 1);

        a.set(2);
        assert_eq!(d.get(), 32);
        assert_eq!(computes_d.get(), 2, "one recompute for both stale inputs");
    }

    #[test]
    fn destroyed_derived_keeps_last_value() {
        let a = source(1);
        let d = derived({
            let a = a.clone();
            move || a.get() * 2
        });
        assert_eq!(d.get(), 2);

        destroy_derived(&d.as_any_source());

        assert!(d.as_any_source().is_destroyed());
        assert_eq!(d.get(), 2, "late reads see the memoized value");
    }

    #[test]
    fn destroyed_uncomputed_derived_answers_none() {
        let d = derived(|| 42);
        destroy_derived(&d.as_any_source());
        assert_eq!(d.try_get(), None);
    }

    #[test]
    fn custom_equality_suppresses_propagation() {
        #[derive(Clone, PartialEq)]
        struct P {
            x: i32,
            y: i32,
        }

        let a = source(0);
        let d = derived_with_equals(
            {
                let a = a.clone();
                move || P { x: a.get() % 2, y: 0 }
            },
            |p, q| p.x == q.x,
        );

        assert_eq!(d.get().x, 0);
        a.set(2); // parity unchanged
        assert_eq!(d.get().x, 0);
        a.set(3);
        assert_eq!(d.get().x, 1);
    }
}
