// ============================================================================
// filament - Read Capture Helpers
// untrack, read recording, exposure of the last-read node
// ============================================================================

use std::rc::Rc;

use crate::core::constants::{DERIVED, DIRTY};
use crate::core::context::with_context;
use crate::core::types::AnySource;
use crate::reactivity::tracking::mark_reactions;

// =============================================================================
// UNTRACK
// =============================================================================

/// Read nodes without registering dependencies.
///
/// # Example
///
/// ```
/// use filament::{source, managed_effect, untrack, flush_now};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = source(1);
/// let b = source(2);
/// let runs = Rc::new(Cell::new(0));
///
/// let a2 = a.clone();
/// let b2 = b.clone();
/// let runs2 = runs.clone();
/// let _effect = managed_effect(move || {
///     let _ = a2.get();
///     let _ = untrack(|| b2.get());
///     runs2.set(runs2.get() + 1);
/// });
/// flush_now();
/// assert_eq!(runs.get(), 1);
///
/// a.set(10); // tracked - the effect re-runs
/// flush_now();
/// assert_eq!(runs.get(), 2);
///
/// b.set(20); // untracked - nothing happens
/// flush_now();
/// assert_eq!(runs.get(), 2);
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_context(|ctx| ctx.set_untracking(true));

    struct UntrackGuard {
        prev: bool,
    }

    impl Drop for UntrackGuard {
        fn drop(&mut self) {
            with_context(|ctx| ctx.set_untracking(self.prev));
        }
    }

    let _guard = UntrackGuard { prev };
    f()
}

/// Alias for `untrack` - "peek" at a value without depending on it.
pub fn peek<T>(f: impl FnOnce() -> T) -> T {
    untrack(f)
}

// =============================================================================
// CAPTURE READS
// =============================================================================

/// Run `f` and collect every node it reads, deduplicated by identity.
///
/// Reads are collected whether or not they register as dependencies, so
/// this also sees reads under `untrack`. Used by the legacy invalidation
/// helper and available to embedders building their own.
pub fn capture_reads(f: impl FnOnce()) -> Vec<Rc<dyn AnySource>> {
    struct RecordGuard {
        prev: Option<Vec<Rc<dyn AnySource>>>,
    }

    impl Drop for RecordGuard {
        fn drop(&mut self) {
            let prev = self.prev.take();
            with_context(|ctx| ctx.recorded_reads.replace(prev));
        }
    }

    let prev = with_context(|ctx| ctx.recorded_reads.replace(Some(Vec::new())));
    let guard = RecordGuard { prev };

    f();

    let recorded = with_context(|ctx| ctx.recorded_reads.take());
    drop(guard);

    recorded.unwrap_or_default()
}

/// Legacy coarse propagation: re-notify every plain source read by `f`.
///
/// Object-valued sources mutated in place keep their identity, so equality
/// never reports a change; self-setting each recorded source forces the
/// write path anyway. Deriveds among the reads are skipped - they follow
/// from their sources.
pub fn invalidate_inner_signals(f: impl FnOnce()) {
    let recorded = capture_reads(f);

    for source in recorded {
        if (source.flags() & DERIVED) != 0 {
            continue;
        }
        let version = with_context(|ctx| ctx.increment_write_version());
        source.set_write_version(version);
        mark_reactions(source, DIRTY);
    }
}

// =============================================================================
// EXPOSE
// =============================================================================

/// Result of [`expose`]: either the produced value or the node that was
/// read last while producing it.
pub enum Exposed<T> {
    /// `f` read no node; here is its value
    Value(T),
    /// The node read last during `f`
    Node(Rc<dyn AnySource>),
}

impl<T> Exposed<T> {
    pub fn is_node(&self) -> bool {
        matches!(self, Exposed::Node(_))
    }
}

/// Run `f`, remembering which node it read last.
///
/// Compiler-emitted accessors use this duality: when the accessor body is a
/// bare node read, the caller gets the node itself and can wire it
/// directly; otherwise it gets the computed value.
pub fn expose<T>(f: impl FnOnce() -> T) -> Exposed<T> {
    struct CaptureGuard {
        prev: bool,
    }

    impl Drop for CaptureGuard {
        fn drop(&mut self) {
            with_context(|ctx| {
                ctx.capture_last_read.set(self.prev);
                ctx.last_read.borrow_mut().take();
            });
        }
    }

    let prev = with_context(|ctx| {
        let prev = ctx.capture_last_read.replace(true);
        *ctx.last_read.borrow_mut() = None;
        prev
    });

    let guard = CaptureGuard { prev };
    let value = f();
    let node = with_context(|ctx| ctx.last_read.borrow_mut().take());
    drop(guard);

    match node {
        Some(node) => Exposed::Node(node),
        None => Exposed::Value(value),
    }
}

// =============================================================================
// TESTS
// =============================================================================
