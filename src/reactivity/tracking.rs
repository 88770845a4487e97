// ============================================================================
// filament - Dependency Tracking
// Read capture, dirtiness propagation and the mutation guard
// ============================================================================
//
// The borrow discipline throughout this module is "collect-then-mutate":
// consumer and dependency lists live in RefCells, so every walk first
// collects the edge targets into a scratch Vec (releasing the borrow) and
// only then mutates flags or edges.
// ============================================================================

use std::rc::Rc;

use tracing::trace;

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::RuntimeError;
use crate::core::types::{AnyReaction, AnySource};
use crate::primitives::component::is_strict_mode;

// =============================================================================
// TRACK READ - Register a dependency when a node is read
// =============================================================================

/// Track a read of a source, registering it as a dependency of the active
/// consumer.
///
/// Called by `Signal::get` / `Derived::get` after the value is produced.
///
/// Within a running execution the previous dependency list is consulted at
/// the cursor position first: when the execution reads the same nodes in the
/// same order (the common case), the existing edges are kept untouched and
/// only the cursor advances. Reads that diverge accumulate into the scratch
/// list, deduplicated by stamping each node's read clock.
pub fn track_read(source: Rc<dyn AnySource>) {
    with_context(|ctx| {
        // Read recording (capture_reads / invalidation helpers) and the
        // last-read capture for `expose` see every read, tracked or not.
        if let Some(recorded) = ctx.recorded_reads.borrow_mut().as_mut() {
            let ptr = Rc::as_ptr(&source) as *const ();
            if !recorded.iter().any(|s| Rc::as_ptr(s) as *const () == ptr) {
                recorded.push(source.clone());
            }
        }
        if ctx.capture_last_read.get() {
            *ctx.last_read.borrow_mut() = Some(source.clone());
        }

        if !ctx.has_active_reaction() || ctx.is_untracking() {
            return;
        }

        let reaction = match ctx.get_active_reaction().and_then(|w| w.upgrade()) {
            Some(r) => r,
            None => return,
        };

        if (reaction.flags() & REACTION_IS_UPDATING) != 0 {
            let read_version = ctx.get_read_version();

            // Already captured in this execution
            if source.read_version() == read_version {
                return;
            }

            // Cursor fast path: same node, same position as the previous run
            if ctx.new_dep_count() == 0 {
                let cursor = ctx.get_skipped_deps();
                if let Some(prev) = reaction.dep_at(cursor) {
                    if Rc::as_ptr(&prev) as *const () == Rc::as_ptr(&source) as *const () {
                        ctx.increment_skipped_deps();
                        source.set_read_version(read_version);
                        return;
                    }
                }
            }

            source.set_read_version(read_version);
            ctx.add_new_dep(source.clone());
        } else {
            // Outside an update cycle (e.g. a late read through a retained
            // closure): wire both edges directly.
            reaction.add_dep(source.clone());
            source.add_consumer(Rc::downgrade(&reaction));
        }
    });
}

// =============================================================================
// MUTATION GUARD
// =============================================================================

/// Check whether a write is permitted right now.
///
/// In strict mode a write while the active consumer is a derived fails;
/// legacy mode permits it (coarse invalidation is available through
/// `invalidate_inner_signals`).
pub fn validate_write() -> Result<(), RuntimeError> {
    with_context(|ctx| {
        if let Some(reaction) = ctx.get_active_reaction().and_then(|w| w.upgrade()) {
            if (reaction.flags() & DERIVED) != 0 && is_strict_mode() {
                return Err(RuntimeError::MutationDuringDerivation);
            }
        }
        Ok(())
    })
}

/// Notify the graph that a source's value changed.
///
/// Marks direct consumers DIRTY (scheduling the effects among them),
/// cascades MAYBE_DIRTY through derived consumers, and records the
/// self-invalidation edge case: a write during an effect's first execution
/// to a source the effect has just read, before the consumer edge exists.
pub fn notify_write(source: Rc<dyn AnySource>) {
    with_context(|ctx| {
        if let Some(reaction) = ctx.get_active_reaction().and_then(|w| w.upgrade()) {
            let flags = reaction.flags();
            if (flags & EFFECT) != 0
                && (flags & REACTION_IS_UPDATING) != 0
                && source.consumer_count() == 0
                && source.read_version() == ctx.get_read_version()
            {
                ctx.add_untracked_write(source.clone());
            }
        }
    });

    mark_reactions(source, DIRTY);
}

// =============================================================================
// MARK REACTIONS - Propagate staleness through the graph
// =============================================================================

/// Mark the consumers of a source with the given status.
///
/// Direct consumers take the status as given (DIRTY on a write); consumers
/// reached through deriveds take MAYBE_DIRTY. Propagation stops at nodes
/// that are already marked - their own consumers were handled when they
/// were first marked. Effects are scheduled on their first marking.
///
/// Iterative with an explicit stack: deep derived chains must not overflow
/// the call stack.
pub fn mark_reactions(source: Rc<dyn AnySource>, status: u32) {
    let mut effects_to_schedule: Vec<Rc<dyn AnyReaction>> = Vec::new();

    let mut stack: Vec<(Rc<dyn AnySource>, u32)> = vec![(source, status)];

    while let Some((current, current_status)) = stack.pop() {
        current.sweep_dead_consumers();

        let consumers: Vec<Rc<dyn AnyReaction>> = {
            let mut collected = Vec::new();
            current.for_each_consumer(&mut |consumer| {
                collected.push(consumer);
                true
            });
            collected
        };

        for consumer in consumers {
            let flags = consumer.flags();

            if (flags & DESTROYED) != 0 {
                continue;
            }

            let already_marked = (flags & (DIRTY | MAYBE_DIRTY)) != 0;

            // A DIRTY marking may upgrade MAYBE_DIRTY, never the reverse
            if current_status == DIRTY {
                if (flags & DIRTY) == 0 {
                    set_reaction_status(&*consumer, DIRTY);
                }
            } else if !already_marked {
                set_reaction_status(&*consumer, MAYBE_DIRTY);
            }

            if already_marked {
                continue;
            }

            if (flags & DERIVED) != 0 {
                if let Some(derived_source) = consumer.as_derived_source() {
                    stack.push((derived_source, MAYBE_DIRTY));
                }
            } else if (flags & EFFECT) != 0 {
                effects_to_schedule.push(consumer);
            }
        }
    }

    for effect in effects_to_schedule {
        crate::reactivity::scheduling::schedule_effect(effect);
    }
}

// =============================================================================
// STATUS HELPERS
// =============================================================================

/// Replace the status bits of a reaction
pub fn set_reaction_status(target: &dyn AnyReaction, status: u32) {
    target.set_flags((target.flags() & STATUS_MASK) | status);
}

/// Replace the status bits of a source
pub fn set_source_status(target: &dyn AnySource, status: u32) {
    target.set_flags((target.flags() & STATUS_MASK) | status);
}

// =============================================================================
// CHECK DIRTINESS - Validate a possibly-stale reaction
// =============================================================================

/// Decide whether a reaction really needs to re-execute.
///
/// DIRTY answers immediately. MAYBE_DIRTY walks the dependency list in
/// first-read order: derived dependencies are validated (and lazily
/// recomputed) first so their write clocks are current, then any dependency
/// whose write clock outruns the reaction's run clock forces re-execution.
/// When no dependency changed, the reaction is marked CLEAN without running.
pub fn check_dirtiness(reaction: &Rc<dyn AnyReaction>) -> bool {
    let flags = reaction.flags();

    if (flags & DIRTY) != 0 {
        return true;
    }

    if (flags & MAYBE_DIRTY) == 0 {
        return false;
    }

    let deps: Vec<Rc<dyn AnySource>> = {
        let mut collected = Vec::new();
        reaction.for_each_dep(&mut |dep| {
            collected.push(dep.clone());
            true
        });
        collected
    };

    let run_version = reaction.run_version();

    for dep in deps {
        if (dep.flags() & DERIVED) != 0 {
            crate::primitives::derived::update_derived_chain(dep.clone());
        }

        if dep.write_version() > run_version {
            reaction.mark_dirty();
            return true;
        }
    }

    reaction.mark_clean();
    false
}

// =============================================================================
// REMOVE REACTIONS - Unlink a reaction from stale dependencies
// =============================================================================

/// Remove a reaction from its dependencies starting at the given index and
/// truncate the dependency list there.
///
/// An unowned derived orphaned by the removal (consumer count drops to
/// zero) is disconnected from its own dependencies, recursing through any
/// unowned dependencies that become orphans in turn.
pub fn remove_reactions(reaction: Rc<dyn AnyReaction>, start: usize) {
    let stale: Vec<Rc<dyn AnySource>> = {
        let mut collected = Vec::new();
        let mut idx = 0;
        reaction.for_each_dep(&mut |dep| {
            if idx >= start {
                collected.push(dep.clone());
            }
            idx += 1;
            true
        });
        collected
    };

    reaction.remove_deps_from(start);

    for dep in stale {
        dep.remove_consumer(&reaction);

        let dep_flags = dep.flags();
        if (dep_flags & DERIVED) != 0
            && (dep_flags & UNOWNED) != 0
            && (dep_flags & DISCONNECTED) == 0
            && dep.consumer_count() == 0
        {
            disconnect_unowned_derived(&dep);
        }
    }
}

/// Prune an orphaned unowned derived from the graph.
///
/// Its dependency list is torn down (which may orphan further unowned
/// deriveds) and it is left DIRTY so a future read through a new consumer
/// recomputes and re-registers from scratch.
fn disconnect_unowned_derived(source: &Rc<dyn AnySource>) {
    trace!("disconnecting orphaned unowned derived");
    source.set_flags(source.flags() | DISCONNECTED);
    source.mark_dirty();

    if let Some(reaction) = source.as_derived_reaction() {
        remove_reactions(reaction, 0);
    }
}

// =============================================================================
// INSTALL DEPENDENCIES - Swap in the freshly captured list
// =============================================================================

/// Wire up dependencies after a reaction has executed.
///
/// The first `skipped` entries of the previous list were re-read in order
/// and stay untouched. Everything past the cursor is unlinked, and the
/// scratch list is spliced in with back-edges registered - except for
/// unowned deriveds, whose reads bypass consumer registration so orphaned
/// graph fragments cannot leak.
pub fn install_dependencies(reaction: Rc<dyn AnyReaction>, skipped: usize) {
    let new_deps = with_context(|ctx| ctx.swap_new_deps(Vec::new()));

    if new_deps.is_empty() {
        // Cursor stopped short: the tail was not re-read
        if skipped < reaction.dep_count() {
            remove_reactions(reaction.clone(), skipped);
        }
        return;
    }

    remove_reactions(reaction.clone(), skipped);

    // A disconnected unowned derived stays off the push side of the graph;
    // once connected, its recomputes register back-edges like anyone else.
    let flags = reaction.flags();
    let skip_back_edges =
        reaction.is_derived() && (flags & UNOWNED) != 0 && (flags & DISCONNECTED) != 0;

    for dep in &new_deps {
        reaction.add_dep(dep.clone());
        if !skip_back_edges {
            dep.add_consumer(Rc::downgrade(&reaction));
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::with_context;
    use crate::core::types::SourceInner;
    use std::any::Any;
    use std::cell::{Cell, RefCell};

    // =========================================================================
    // Mock reaction for exercising the tracking paths in isolation
    // =========================================================================

    struct MockReaction {
        flags: Cell<u32>,
        run_version: Cell<u32>,
        deps: RefCell<Vec<Rc<dyn AnySource>>>,
    }

    impl MockReaction {
        fn new() -> Self {
            Self {
                flags: Cell::new(EFFECT | CLEAN),
                run_version: Cell::new(0),
                deps: RefCell::new(Vec::new()),
            }
        }
    }

    impl AnyReaction for MockReaction {
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
            false
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_derived_source(&self) -> Option<Rc<dyn AnySource>> {
            None
        }
    }

    fn with_active_reaction<R>(reaction: &Rc<dyn AnyReaction>, f: impl FnOnce() -> R) -> R {
        with_context(|ctx| ctx.set_active_reaction(Some(Rc::downgrade(reaction))));
        let result = f();
        with_context(|ctx| ctx.set_active_reaction(None));
        result
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[test]
    fn track_read_outside_reaction_does_nothing() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        track_read(source.clone());
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn track_read_registers_both_edges() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        with_active_reaction(&reaction, || track_read(source.clone()));

        assert_eq!(reaction.dep_count(), 1);
        assert_eq!(source.consumer_count(), 1);
    }

    #[test]
    fn track_read_while_untracking_does_not_register() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        with_context(|ctx| {
            ctx.set_active_reaction(Some(Rc::downgrade(&reaction)));
            ctx.set_untracking(true);
        });

        track_read(source.clone());

        with_context(|ctx| {
            ctx.set_active_reaction(None);
            ctx.set_untracking(false);
        });

        assert_eq!(reaction.dep_count(), 0);
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn repeated_reads_dedupe_within_one_execution() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        reaction.set_flags(reaction.flags() | REACTION_IS_UPDATING);

        with_context(|ctx| {
            ctx.set_active_reaction(Some(Rc::downgrade(&reaction)));
            ctx.increment_read_version();
            ctx.set_skipped_deps(0);
        });

        track_read(source.clone());
        track_read(source.clone());

        with_context(|ctx| {
            assert_eq!(ctx.new_dep_count(), 1);
            ctx.set_active_reaction(None);
            ctx.swap_new_deps(Vec::new());
        });
    }

    #[test]
    fn cursor_advances_over_unchanged_prefix() {
        let a: Rc<dyn AnySource> = Rc::new(SourceInner::new(1));
        let b: Rc<dyn AnySource> = Rc::new(SourceInner::new(2));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        // Previous run captured [a, b]
        reaction.add_dep(a.clone());
        reaction.add_dep(b.clone());

        reaction.set_flags(reaction.flags() | REACTION_IS_UPDATING);

        with_context(|ctx| {
            ctx.set_active_reaction(Some(Rc::downgrade(&reaction)));
            ctx.increment_read_version();
            ctx.set_skipped_deps(0);
        });

        // Re-reading a then b in the same order only moves the cursor
        track_read(a.clone());
        track_read(b.clone());

        with_context(|ctx| {
            assert_eq!(ctx.get_skipped_deps(), 2);
            assert_eq!(ctx.new_dep_count(), 0);
            ctx.set_active_reaction(None);
            ctx.set_skipped_deps(0);
        });
    }

    #[test]
    fn divergent_read_lands_in_scratch_list() {
        let a: Rc<dyn AnySource> = Rc::new(SourceInner::new(1));
        let c: Rc<dyn AnySource> = Rc::new(SourceInner::new(3));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        reaction.add_dep(a.clone());
        reaction.set_flags(reaction.flags() | REACTION_IS_UPDATING);

        with_context(|ctx| {
            ctx.set_active_reaction(Some(Rc::downgrade(&reaction)));
            ctx.increment_read_version();
            ctx.set_skipped_deps(0);
        });

        // First read differs from the previous first dependency
        track_read(c.clone());

        with_context(|ctx| {
            assert_eq!(ctx.get_skipped_deps(), 0);
            assert_eq!(ctx.new_dep_count(), 1);
            ctx.set_active_reaction(None);
            ctx.swap_new_deps(Vec::new());
            ctx.set_skipped_deps(0);
        });
    }

    #[test]
    fn mark_reactions_marks_direct_consumers_dirty() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        source.add_consumer(Rc::downgrade(&reaction));

        assert!(reaction.is_clean());
        mark_reactions(source.clone(), DIRTY);
        assert!(reaction.is_dirty());
    }

    #[test]
    fn mark_reactions_never_downgrades_dirty() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        reaction.mark_dirty();
        source.add_consumer(Rc::downgrade(&reaction));

        mark_reactions(source.clone(), MAYBE_DIRTY);

        assert!(reaction.is_dirty());
        assert!(!reaction.is_maybe_dirty());
    }

    #[test]
    fn mark_reactions_upgrades_maybe_dirty_to_dirty() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        reaction.mark_maybe_dirty();
        source.add_consumer(Rc::downgrade(&reaction));

        mark_reactions(source.clone(), DIRTY);

        assert!(reaction.is_dirty());
    }

    #[test]
    fn mark_reactions_skips_destroyed_consumers() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        reaction.set_flags(reaction.flags() | DESTROYED);
        source.add_consumer(Rc::downgrade(&reaction));

        mark_reactions(source.clone(), DIRTY);

        assert!(!reaction.is_dirty());
    }

    #[test]
    fn check_dirtiness_validates_with_run_clock() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        reaction.add_dep(source.clone());
        reaction.set_run_version(5);

        // Dependency unchanged since the last run: cleans without executing
        source.set_write_version(3);
        reaction.mark_maybe_dirty();
        assert!(!check_dirtiness(&reaction));
        assert!(reaction.is_clean());

        // Dependency outran the run clock: really dirty
        source.set_write_version(9);
        reaction.mark_maybe_dirty();
        assert!(check_dirtiness(&reaction));
        assert!(reaction.is_dirty());
    }

    #[test]
    fn remove_reactions_truncates_and_unlinks() {
        let s1: Rc<dyn AnySource> = Rc::new(SourceInner::new(1));
        let s2: Rc<dyn AnySource> = Rc::new(SourceInner::new(2));
        let s3: Rc<dyn AnySource> = Rc::new(SourceInner::new(3));
        let reaction: Rc<dyn AnyReaction> = Rc::new(MockReaction::new());

        for s in [&s1, &s2, &s3] {
            reaction.add_dep(s.clone());
            s.add_consumer(Rc::downgrade(&reaction));
        }

        remove_reactions(reaction.clone(), 1);

        assert_eq!(reaction.dep_count(), 1);
        assert_eq!(s1.consumer_count(), 1);
        assert_eq!(s2.consumer_count(), 0);
        assert_eq!(s3.consumer_count(), 0);
    }

    #[test]
    fn validate_write_ok_outside_derivation() {
        assert!(validate_write().is_ok());
    }

    #[test]
    fn borrow_safety_with_many_consumers() {
        let source: Rc<dyn AnySource> = Rc::new(SourceInner::new(42));
        let reactions: Vec<Rc<dyn AnyReaction>> =
            (0..5).map(|_| Rc::new(MockReaction::new()) as Rc<dyn AnyReaction>).collect();

        for r in &reactions {
            source.add_consumer(Rc::downgrade(r));
        }

        mark_reactions(source.clone(), DIRTY);

        for r in &reactions {
            assert!(r.is_dirty());
        }
    }
}
