// ============================================================================
// filament - Reactive Context
// Thread-local state shared by tracking, scheduling and validation
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::types::{AnyReaction, AnySource};

/// Default bound on effects drained per flush before the runtime declares
/// an infinite update loop.
pub const DEFAULT_MAX_FLUSH_DEPTH: u32 = 100;

// =============================================================================
// REACTIVE CONTEXT
// =============================================================================

/// Thread-local reactive context holding all global runtime state.
///
/// Single-threaded by construction: every field is single-writer and every
/// nested execution saves and restores what it touches, so the consumer
/// stack unwinds cleanly even when a producer panics.
pub struct ReactiveContext {
    // =========================================================================
    // CONSUMER TRACKING
    // =========================================================================
    /// Currently executing consumer (effect or derived)
    pub active_reaction: RefCell<Option<Weak<dyn AnyReaction>>>,

    /// Currently executing effect (owner for nodes created inside it)
    pub active_effect: RefCell<Option<Weak<dyn AnyReaction>>>,

    /// Whether reads are currently exempt from dependency registration
    pub untracking: Cell<bool>,

    // =========================================================================
    // CLOCKS
    // =========================================================================
    /// Global write clock - ticks on every propagating write
    pub write_version: Cell<u32>,

    /// The executing producer's read clock (saved and restored around
    /// nested executions)
    pub read_version: Cell<u32>,

    /// Monotone counter backing the read clock, so no two executions ever
    /// share a cycle id
    pub read_clock: Cell<u32>,

    // =========================================================================
    // DEPENDENCY CAPTURE (scratch state of the running execution)
    // =========================================================================
    /// Dependencies newly captured by the current execution
    pub new_deps: RefCell<Vec<Rc<dyn AnySource>>>,

    /// Cursor into the previous dependency list: how many leading entries
    /// were re-read in the same order and can be kept as-is
    pub skipped_deps: Cell<usize>,

    /// Sources written during the current effect execution before their
    /// consumer edges exist (closes the self-invalidation loop)
    pub untracked_writes: RefCell<Vec<Rc<dyn AnySource>>>,

    // =========================================================================
    // SCHEDULER
    // =========================================================================
    /// Pre- and render-phase effects awaiting the next flush
    pub queued_pre_and_render: RefCell<Vec<Rc<dyn AnyReaction>>>,

    /// Normal effects awaiting the next flush
    pub queued_effects: RefCell<Vec<Rc<dyn AnyReaction>>>,

    /// Whether a flush microtask is already enqueued with the host
    pub microtask_scheduled: Cell<bool>,

    /// Whether the scheduler is in synchronous mode (inside flush_now)
    pub sync_flush: Cell<bool>,

    /// Effects drained since the queues were last empty
    pub flush_count: Cell<u32>,

    /// Configurable bound for `flush_count`
    pub max_flush_depth: Cell<u32>,

    // =========================================================================
    // READ RECORDING (invalidation helpers, expose)
    // =========================================================================
    /// When Some, every read is appended here (capture_reads)
    pub recorded_reads: RefCell<Option<Vec<Rc<dyn AnySource>>>>,

    /// When set, the most recent read is remembered for `expose`
    pub capture_last_read: Cell<bool>,

    /// The node read most recently while capture was on
    pub last_read: RefCell<Option<Rc<dyn AnySource>>>,
}

impl ReactiveContext {
    pub fn new() -> Self {
        Self {
            active_reaction: RefCell::new(None),
            active_effect: RefCell::new(None),
            untracking: Cell::new(false),
            write_version: Cell::new(1),
            read_version: Cell::new(0),
            read_clock: Cell::new(0),
            new_deps: RefCell::new(Vec::new()),
            skipped_deps: Cell::new(0),
            untracked_writes: RefCell::new(Vec::new()),
            queued_pre_and_render: RefCell::new(Vec::new()),
            queued_effects: RefCell::new(Vec::new()),
            microtask_scheduled: Cell::new(false),
            sync_flush: Cell::new(false),
            flush_count: Cell::new(0),
            max_flush_depth: Cell::new(DEFAULT_MAX_FLUSH_DEPTH),
            recorded_reads: RefCell::new(None),
            capture_last_read: Cell::new(false),
            last_read: RefCell::new(None),
        }
    }

    // =========================================================================
    // CONSUMER TRACKING
    // =========================================================================

    /// Set the active consumer, returning the previous one
    pub fn set_active_reaction(
        &self,
        reaction: Option<Weak<dyn AnyReaction>>,
    ) -> Option<Weak<dyn AnyReaction>> {
        self.active_reaction.replace(reaction)
    }

    pub fn get_active_reaction(&self) -> Option<Weak<dyn AnyReaction>> {
        self.active_reaction.borrow().clone()
    }

    pub fn has_active_reaction(&self) -> bool {
        self.active_reaction.borrow().is_some()
    }

    /// Set the active effect, returning the previous one
    pub fn set_active_effect(
        &self,
        effect: Option<Weak<dyn AnyReaction>>,
    ) -> Option<Weak<dyn AnyReaction>> {
        self.active_effect.replace(effect)
    }

    pub fn get_active_effect(&self) -> Option<Weak<dyn AnyReaction>> {
        self.active_effect.borrow().clone()
    }

    /// Set untracking mode, returning the previous value
    pub fn set_untracking(&self, value: bool) -> bool {
        self.untracking.replace(value)
    }

    pub fn is_untracking(&self) -> bool {
        self.untracking.get()
    }

    // =========================================================================
    // CLOCKS
    // =========================================================================

    /// Tick the write clock and return the new value
    pub fn increment_write_version(&self) -> u32 {
        let v = self.write_version.get().wrapping_add(1).max(1);
        self.write_version.set(v);
        v
    }

    pub fn get_write_version(&self) -> u32 {
        self.write_version.get()
    }

    /// Start a fresh read cycle and make it the active one. The backing
    /// counter is monotone (wrapping back to 1 at the top of the range, never
    /// revisiting 0), so a restored outer execution can never collide with a
    /// nested one.
    pub fn increment_read_version(&self) -> u32 {
        let next = if self.read_clock.get() == u32::MAX {
            1
        } else {
            self.read_clock.get() + 1
        };
        self.read_clock.set(next);
        self.read_version.set(next);
        next
    }

    /// The active execution's read clock
    pub fn get_read_version(&self) -> u32 {
        self.read_version.get()
    }

    /// Restore a saved read clock (after a nested execution), returning the
    /// one that was active.
    pub fn set_read_version(&self, version: u32) -> u32 {
        self.read_version.replace(version)
    }

    // =========================================================================
    // DEPENDENCY CAPTURE
    // =========================================================================

    /// Swap out the scratch dependency list, returning the old one
    pub fn swap_new_deps(&self, deps: Vec<Rc<dyn AnySource>>) -> Vec<Rc<dyn AnySource>> {
        self.new_deps.replace(deps)
    }

    pub fn add_new_dep(&self, source: Rc<dyn AnySource>) {
        self.new_deps.borrow_mut().push(source);
    }

    pub fn new_dep_count(&self) -> usize {
        self.new_deps.borrow().len()
    }

    /// Set the capture cursor, returning the previous position
    pub fn set_skipped_deps(&self, count: usize) -> usize {
        self.skipped_deps.replace(count)
    }

    pub fn get_skipped_deps(&self) -> usize {
        self.skipped_deps.get()
    }

    pub fn increment_skipped_deps(&self) {
        self.skipped_deps.set(self.skipped_deps.get() + 1);
    }

    pub fn add_untracked_write(&self, source: Rc<dyn AnySource>) {
        self.untracked_writes.borrow_mut().push(source);
    }

    pub fn take_untracked_writes(&self) -> Vec<Rc<dyn AnySource>> {
        self.untracked_writes.replace(Vec::new())
    }

    // =========================================================================
    // SCHEDULER
    // =========================================================================

    /// Both effect queues are empty
    pub fn queues_empty(&self) -> bool {
        self.queued_pre_and_render.borrow().is_empty() && self.queued_effects.borrow().is_empty()
    }

    /// Set synchronous-flush mode, returning the previous mode
    pub fn set_sync_flush(&self, value: bool) -> bool {
        self.sync_flush.replace(value)
    }

    pub fn is_sync_flush(&self) -> bool {
        self.sync_flush.get()
    }
}

impl Default for ReactiveContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// THREAD-LOCAL ACCESS
// =============================================================================

thread_local! {
    static CONTEXT: ReactiveContext = ReactiveContext::new();
}

/// Access the thread-local reactive context.
pub fn with_context<R>(f: impl FnOnce(&ReactiveContext) -> R) -> R {
    CONTEXT.with(f)
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Whether reads are currently being registered as dependencies
pub fn is_tracking() -> bool {
    with_context(|ctx| ctx.has_active_reaction() && !ctx.is_untracking())
}

/// Whether we're inside an `untrack` block
pub fn is_untracking() -> bool {
    with_context(|ctx| ctx.is_untracking())
}

/// Current global write clock
pub fn write_version() -> u32 {
    with_context(|ctx| ctx.get_write_version())
}

/// Current global read clock
pub fn read_version() -> u32 {
    with_context(|ctx| ctx.get_read_version())
}

/// Set the bound on effects drained per flush (default 100).
pub fn set_max_flush_depth(limit: u32) {
    with_context(|ctx| ctx.max_flush_depth.set(limit.max(1)));
}

/// Current bound on effects drained per flush
pub fn max_flush_depth() -> u32 {
    with_context(|ctx| ctx.max_flush_depth.get())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_creation() {
        with_context(|ctx| {
            assert_eq!(ctx.get_write_version(), 1);
            assert!(!ctx.has_active_reaction());
            assert!(!ctx.is_untracking());
            assert!(ctx.queues_empty());
            assert!(!ctx.is_sync_flush());
        });
    }

    #[test]
    fn clocks_tick() {
        with_context(|ctx| {
            let w0 = ctx.get_write_version();
            assert_eq!(ctx.increment_write_version(), w0 + 1);
            assert_eq!(ctx.increment_write_version(), w0 + 2);

            let r0 = ctx.get_read_version();
            assert_eq!(ctx.increment_read_version(), r0 + 1);
        });
    }

    #[test]
    fn read_clock_wraps_to_one() {
        with_context(|ctx| {
            ctx.read_clock.set(u32::MAX);
            assert_eq!(ctx.increment_read_version(), 1);
        });
    }

    #[test]
    fn nested_read_cycles_never_collide() {
        with_context(|ctx| {
            let outer = ctx.increment_read_version();

            // A nested execution opens its own cycle, then restores ours
            let inner = ctx.increment_read_version();
            assert_ne!(outer, inner);
            ctx.set_read_version(outer);
            assert_eq!(ctx.get_read_version(), outer);

            // The next cycle is fresh even after the restore
            let next = ctx.increment_read_version();
            assert_ne!(next, outer);
            assert_ne!(next, inner);
        });
    }

    #[test]
    fn untracking_save_restore() {
        with_context(|ctx| {
            assert!(!ctx.is_untracking());

            let prev = ctx.set_untracking(true);
            assert!(!prev);
            assert!(ctx.is_untracking());

            let prev = ctx.set_untracking(false);
            assert!(prev);
            assert!(!ctx.is_untracking());
        });
    }

    #[test]
    fn capture_cursor() {
        with_context(|ctx| {
            let saved = ctx.set_skipped_deps(0);

            ctx.increment_skipped_deps();
            ctx.increment_skipped_deps();
            assert_eq!(ctx.get_skipped_deps(), 2);

            assert_eq!(ctx.set_skipped_deps(saved), 2);
        });
    }

    #[test]
    fn flush_depth_configurable() {
        let saved = max_flush_depth();
        set_max_flush_depth(7);
        assert_eq!(max_flush_depth(), 7);
        // A bound of zero would make every flush fail immediately
        set_max_flush_depth(0);
        assert_eq!(max_flush_depth(), 1);
        set_max_flush_depth(saved);
    }

    #[test]
    fn sync_flush_save_restore() {
        with_context(|ctx| {
            assert!(!ctx.is_sync_flush());
            let prev = ctx.set_sync_flush(true);
            assert!(!prev);
            assert!(ctx.is_sync_flush());
            ctx.set_sync_flush(prev);
            assert!(!ctx.is_sync_flush());
        });
    }
}
