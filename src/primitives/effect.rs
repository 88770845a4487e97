// ============================================================================
// filament - Effects
// Side-effecting reactions in four scheduling flavors
// ============================================================================
//
// Effects re-run when their dependencies change. They own what is created
// inside them: child effects hang off sibling links, deriveds off a child
// list, and destruction cascades through both before teardown closures run.
//
// Flavors:
// - pre_effect      runs before render effects of the same context
// - render_effect   where UI-building collaborators mount their work
// - effect          user-visible "after render" side effects
// - sync_effect     runs inline with the triggering write, never queued
//
// The managed_* constructors skip parent ownership (MANAGED bit) and are
// the only constructors legal outside any component context.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::RuntimeError;
use crate::core::types::{AnyReaction, AnySource};
use crate::primitives::component::{current_component, ComponentFrame};
use crate::primitives::derived::destroy_derived;
use crate::reactivity::scheduling::schedule_effect;
use crate::reactivity::tracking::{remove_reactions, set_reaction_status};

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// Opaque UI-block pointer threaded through render effects
pub type Block = Rc<dyn Any>;

/// Teardown closure, run on destruction and before each re-execution
pub type TeardownFn = Box<dyn FnOnce()>;

/// Effect producer - may return a teardown for its execution
pub type EffectFn = Box<dyn FnMut() -> Option<TeardownFn>>;

// =============================================================================
// EFFECT INNER
// =============================================================================

/// The record behind an effect.
///
/// Implements AnyReaction only: nothing depends on an effect.
pub struct EffectInner {
    /// Flags bitmask
    flags: Cell<u32>,

    /// Write clock observed at the end of the last execution
    run_version: Cell<u32>,

    /// The producer
    func: RefCell<Option<EffectFn>>,

    /// Nodes this effect reads (first-read order)
    deps: RefCell<Vec<Rc<dyn AnySource>>>,

    /// Teardown closures, run in registration order
    teardowns: RefCell<Vec<TeardownFn>>,

    // =========================================================================
    // Ownership tree
    // =========================================================================
    /// Parent effect
    parent: RefCell<Option<Weak<EffectInner>>>,

    /// First child (strong; the sibling chain keeps children alive)
    first_child: RefCell<Option<Rc<EffectInner>>>,

    /// Last child (weak to avoid cycles)
    last_child: RefCell<Option<Weak<EffectInner>>>,

    /// Previous sibling (weak)
    prev_sibling: RefCell<Option<Weak<EffectInner>>>,

    /// Next sibling (strong)
    next_sibling: RefCell<Option<Rc<EffectInner>>>,

    /// Deriveds created during this effect's executions, destroyed with it
    deriveds: RefCell<Vec<Rc<dyn AnySource>>>,

    // =========================================================================
    // Collaborator back-pointers
    // =========================================================================
    /// UI block active when this effect was created
    owning_block: RefCell<Option<Block>>,

    /// Component frame active when this effect was created
    owning_context: RefCell<Option<Weak<ComponentFrame>>>,

    /// Weak self-reference bridging &self to Rc<Self>
    self_weak: RefCell<Weak<EffectInner>>,
}

impl EffectInner {
    /// Create an effect record. Starts DIRTY so its first flush runs it.
    pub fn new(effect_type: u32, func: Option<EffectFn>) -> Rc<Self> {
        let effect = Rc::new(Self {
            flags: Cell::new(effect_type | DIRTY),
            run_version: Cell::new(0),
            func: RefCell::new(func),
            deps: RefCell::new(Vec::new()),
            teardowns: RefCell::new(Vec::new()),
            parent: RefCell::new(None),
            first_child: RefCell::new(None),
            last_child: RefCell::new(None),
            prev_sibling: RefCell::new(None),
            next_sibling: RefCell::new(None),
            deriveds: RefCell::new(Vec::new()),
            owning_block: RefCell::new(None),
            owning_context: RefCell::new(None),
            self_weak: RefCell::new(Weak::new()),
        });

        *effect.self_weak.borrow_mut() = Rc::downgrade(&effect);

        effect
    }

    pub fn as_weak_reaction(&self) -> Weak<dyn AnyReaction> {
        if let Some(rc) = self.self_weak.borrow().upgrade() {
            Rc::downgrade(&(rc as Rc<dyn AnyReaction>))
        } else {
            Weak::<EffectInner>::new() as Weak<dyn AnyReaction>
        }
    }

    pub(crate) fn upgrade_self(&self) -> Option<Rc<EffectInner>> {
        self.self_weak.borrow().upgrade()
    }

    pub fn parent(&self) -> Option<Rc<EffectInner>> {
        self.parent.borrow().as_ref().and_then(|w| w.upgrade())
    }

    pub fn set_parent(&self, parent: Option<Weak<EffectInner>>) {
        *self.parent.borrow_mut() = parent;
    }

    pub fn first_child(&self) -> Option<Rc<EffectInner>> {
        self.first_child.borrow().clone()
    }

    pub fn last_child(&self) -> Option<Rc<EffectInner>> {
        self.last_child.borrow().as_ref().and_then(|w| w.upgrade())
    }

    /// The component frame this effect was created under, if still alive.
    pub fn owning_context(&self) -> Option<Rc<ComponentFrame>> {
        self.owning_context.borrow().as_ref().and_then(|w| w.upgrade())
    }

    pub(crate) fn set_owning_context(&self, frame: Option<&Rc<ComponentFrame>>) {
        *self.owning_context.borrow_mut() = frame.map(Rc::downgrade);
    }

    pub fn owning_block(&self) -> Option<Block> {
        self.owning_block.borrow().clone()
    }

    pub fn set_owning_block(&self, block: Block) {
        *self.owning_block.borrow_mut() = Some(block);
    }

    /// Append a teardown closure, run in registration order on destruction
    /// and before the next execution.
    pub fn push_teardown(&self, teardown: TeardownFn) {
        self.teardowns.borrow_mut().push(teardown);
    }

    pub(crate) fn adopt_derived(&self, source: Rc<dyn AnySource>) {
        self.deriveds.borrow_mut().push(source);
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        // Last-resort teardown for effects dropped without destroy_effect.
        // Resuming a panic inside drop would abort, so failures are trapped
        // and swallowed here.
        let teardowns: Vec<TeardownFn> = self.teardowns.borrow_mut().drain(..).collect();
        for teardown in teardowns {
            let _ = catch_unwind(AssertUnwindSafe(teardown));
        }
    }
}

// =============================================================================
// AnyReaction IMPLEMENTATION
// =============================================================================

impl AnyReaction for EffectInner {
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
        if (self.flags.get() & DESTROYED) != 0 {
            return false;
        }

        if let Some(rc_self) = self.self_weak.borrow().upgrade() {
            update_effect(&rc_self);
        }

        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_derived_source(&self) -> Option<Rc<dyn AnySource>> {
        None
    }
}

// =============================================================================
// EFFECT HANDLE
// =============================================================================

/// Public handle to an effect.
///
/// Dropping the last handle to an unowned effect destroys it; owned effects
/// live with their parent regardless of handles.
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    pub(crate) fn from_inner(inner: Rc<EffectInner>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Rc<EffectInner> {
        &self.inner
    }

    pub fn is_destroyed(&self) -> bool {
        (self.inner.flags.get() & DESTROYED) != 0
    }

    /// Destroy this effect: children and owned deriveds cascade, teardown
    /// closures run in order, edges unlink.
    pub fn dispose(&self) {
        destroy_effect(self.inner.clone(), true);
    }

    /// Register a teardown closure on this effect.
    pub fn on_teardown(&self, f: impl FnOnce() + 'static) {
        self.inner.push_teardown(Box::new(f));
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // A parented effect is held strongly through the sibling chain, so
        // count == 1 means nothing else keeps it alive.
        if Rc::strong_count(&self.inner) == 1 && (self.inner.flags.get() & DESTROYED) == 0 {
            self.dispose();
        }
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// =============================================================================
// OWNERSHIP TREE MAINTENANCE
// =============================================================================

/// Append an effect to its parent's child list
pub(crate) fn push_effect(effect: &Rc<EffectInner>, parent: &Rc<EffectInner>) {
    match parent.last_child() {
        None => {
            *parent.first_child.borrow_mut() = Some(effect.clone());
            *parent.last_child.borrow_mut() = Some(Rc::downgrade(effect));
        }
        Some(last) => {
            *last.next_sibling.borrow_mut() = Some(effect.clone());
            *effect.prev_sibling.borrow_mut() = Some(Rc::downgrade(&last));
            *parent.last_child.borrow_mut() = Some(Rc::downgrade(effect));
        }
    }
}

/// Remove an effect from its parent's child list
fn unlink_effect(effect: &Rc<EffectInner>) {
    let prev = effect.prev_sibling.borrow().as_ref().and_then(|w| w.upgrade());
    let next = effect.next_sibling.borrow().clone();

    if let Some(ref prev_rc) = prev {
        *prev_rc.next_sibling.borrow_mut() = next.clone();
    }

    if let Some(ref next_rc) = next {
        *next_rc.prev_sibling.borrow_mut() = prev.as_ref().map(Rc::downgrade);
    }

    if let Some(parent) = effect.parent() {
        let is_first = parent
            .first_child
            .borrow()
            .as_ref()
            .is_some_and(|first| Rc::ptr_eq(first, effect));
        if is_first {
            *parent.first_child.borrow_mut() = next.clone();
        }

        let is_last = parent
            .last_child
            .borrow()
            .as_ref()
            .and_then(|w| w.upgrade())
            .is_some_and(|last| Rc::ptr_eq(&last, effect));
        if is_last {
            *parent.last_child.borrow_mut() = prev.as_ref().map(Rc::downgrade);
        }
    }

    *effect.prev_sibling.borrow_mut() = None;
    *effect.next_sibling.borrow_mut() = None;
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// Run an effect's teardown closures in registration order.
///
/// Best-effort: a panicking closure does not stop the ones after it. The
/// first captured panic is resumed once every closure has run.
pub(crate) fn execute_teardowns(effect: &EffectInner) {
    let teardowns: Vec<TeardownFn> = effect.teardowns.borrow_mut().drain(..).collect();
    if teardowns.is_empty() {
        return;
    }

    let mut first_panic: Option<Box<dyn Any + Send>> = None;
    for teardown in teardowns {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(teardown)) {
            first_panic.get_or_insert(payload);
        }
    }

    if let Some(payload) = first_panic {
        resume_unwind(payload);
    }
}

// =============================================================================
// DESTRUCTION
// =============================================================================

/// Destroy all children of an effect (effects and owned deriveds alike).
pub(crate) fn destroy_effect_children(effect: &Rc<EffectInner>) {
    let mut child = effect.first_child.borrow_mut().take();
    *effect.last_child.borrow_mut() = None;

    // Detach the whole chain first: a teardown that unlinks a sibling must
    // not invalidate the traversal.
    let mut children = Vec::new();
    while let Some(c) = child {
        child = c.next_sibling.borrow_mut().take();
        *c.prev_sibling.borrow_mut() = None;
        children.push(c);
    }

    for child_rc in children {
        destroy_effect(child_rc, false);
    }

    let deriveds: Vec<Rc<dyn AnySource>> = effect.deriveds.borrow_mut().drain(..).collect();
    for derived in deriveds {
        destroy_derived(&derived);
    }
}

/// Destroy an effect and everything it owns.
pub fn destroy_effect(effect: Rc<EffectInner>, remove_from_parent: bool) {
    if (effect.flags.get() & DESTROYED) != 0 {
        return;
    }

    trace!("destroying effect");

    destroy_effect_children(&effect);

    remove_reactions(effect.clone() as Rc<dyn AnyReaction>, 0);

    effect.set_flags(effect.flags() | DESTROYED);

    execute_teardowns(&effect);

    if remove_from_parent && effect.parent().is_some() {
        unlink_effect(&effect);
    }

    *effect.parent.borrow_mut() = None;
    *effect.func.borrow_mut() = None;
    effect.deps.borrow_mut().clear();
    *effect.owning_block.borrow_mut() = None;
    *effect.first_child.borrow_mut() = None;
    *effect.last_child.borrow_mut() = None;
    *effect.prev_sibling.borrow_mut() = None;
    *effect.next_sibling.borrow_mut() = None;
}

// =============================================================================
// INERT MARKING
// =============================================================================

/// Pause or resume an effect subtree.
///
/// A paused effect is skipped at schedule and drain time even when its
/// dependencies dirty it. Un-pausing an effect that is no longer CLEAN
/// schedules it so the missed work happens.
pub fn mark_subtree_inert(effect: &Effect, inert: bool) {
    set_subtree_inert(effect.inner(), inert);
}

pub(crate) fn set_subtree_inert(effect: &Rc<EffectInner>, inert: bool) {
    let flags = effect.flags.get();

    if inert {
        effect.set_flags(flags | INERT);
    } else {
        effect.set_flags(flags & !INERT);
        if (flags & (DIRTY | MAYBE_DIRTY)) != 0 && (flags & DESTROYED) == 0 {
            schedule_effect(effect.clone() as Rc<dyn AnyReaction>);
        }
    }

    let mut child = effect.first_child();
    while let Some(c) = child {
        set_subtree_inert(&c, inert);
        child = c.next_sibling.borrow().clone();
    }
}

// =============================================================================
// UPDATE EFFECT - One execution
// =============================================================================

/// Execute an effect under dependency capture.
///
/// Before the producer runs, everything the previous execution created is
/// destroyed and its teardowns run. Afterwards, the dependency list is
/// swapped, the run clock stamped, and any self-write recorded during the
/// run reschedules the effect.
pub fn update_effect(effect: &Rc<EffectInner>) {
    if (effect.flags.get() & DESTROYED) != 0 {
        return;
    }

    set_reaction_status(&**effect, CLEAN);

    destroy_effect_children(effect);
    execute_teardowns(effect);

    struct ExecutionGuard {
        effect: Rc<EffectInner>,
        prev_reaction: Option<Weak<dyn AnyReaction>>,
        prev_effect: Option<Weak<dyn AnyReaction>>,
        prev_new_deps: Vec<Rc<dyn AnySource>>,
        prev_skipped: usize,
        prev_untracked: Vec<Rc<dyn AnySource>>,
        prev_read_version: u32,
    }

    impl Drop for ExecutionGuard {
        fn drop(&mut self) {
            self.effect
                .set_flags(self.effect.flags() & !REACTION_IS_UPDATING);
            with_context(|ctx| {
                ctx.set_active_reaction(self.prev_reaction.take());
                ctx.set_active_effect(self.prev_effect.take());
                ctx.swap_new_deps(std::mem::take(&mut self.prev_new_deps));
                ctx.set_skipped_deps(self.prev_skipped);
                ctx.untracked_writes
                    .replace(std::mem::take(&mut self.prev_untracked));
                ctx.set_read_version(self.prev_read_version);
            });
        }
    }

    let guard = with_context(|ctx| {
        let prev_reaction = ctx.set_active_reaction(Some(effect.as_weak_reaction()));
        let prev_effect = ctx.set_active_effect(Some(effect.as_weak_reaction()));
        let prev_new_deps = ctx.swap_new_deps(Vec::new());
        let prev_skipped = ctx.set_skipped_deps(0);
        let prev_untracked = ctx.untracked_writes.replace(Vec::new());
        let prev_read_version = ctx.get_read_version();
        ctx.increment_read_version();
        ExecutionGuard {
            effect: effect.clone(),
            prev_reaction,
            prev_effect,
            prev_new_deps,
            prev_skipped,
            prev_untracked,
            prev_read_version,
        }
    });

    effect.set_flags(effect.flags() | REACTION_IS_UPDATING);

    let teardown = {
        let mut func_borrow = effect.func.borrow_mut();
        match func_borrow.as_mut() {
            Some(func) => func(),
            None => None,
        }
    };

    effect.set_flags(effect.flags() & !REACTION_IS_UPDATING);

    let skipped = with_context(|ctx| ctx.get_skipped_deps());
    crate::reactivity::tracking::install_dependencies(
        effect.clone() as Rc<dyn AnyReaction>,
        skipped,
    );

    effect.set_run_version(with_context(|ctx| ctx.get_write_version()));
    effect.set_flags(effect.flags() | EFFECT_RAN);

    if let Some(teardown) = teardown {
        effect.push_teardown(teardown);
    }

    // A write to a source this execution also read, made before the
    // consumer edge existed, would be lost: reschedule ourselves.
    let untracked = with_context(|ctx| ctx.take_untracked_writes());
    drop(guard);

    if !untracked.is_empty() {
        let wrote_own_dep = untracked.iter().any(|written| {
            let written_ptr = Rc::as_ptr(written) as *const ();
            let mut found = false;
            effect.for_each_dep(&mut |dep| {
                if Rc::as_ptr(dep) as *const () == written_ptr {
                    found = true;
                    false
                } else {
                    true
                }
            });
            found
        });

        if wrote_own_dep {
            effect.mark_dirty();
            schedule_effect(effect.clone() as Rc<dyn AnyReaction>);
        }
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Create a user effect that re-runs when its dependencies change.
///
/// Requires an active component context or parent effect; top-level code
/// uses [`managed_effect`]. Effects created during component init are
/// deferred until the component mounts.
///
/// # Example
///
/// ```
/// use filament::{source, managed_effect, flush_now};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let count = source(0);
/// let seen = Rc::new(Cell::new(-1));
///
/// let count2 = count.clone();
/// let seen2 = seen.clone();
/// let _effect = managed_effect(move || {
///     seen2.set(count2.get());
/// });
///
/// flush_now();
/// assert_eq!(seen.get(), 0);
///
/// count.set(7);
/// flush_now();
/// assert_eq!(seen.get(), 7);
/// ```
pub fn effect<F>(mut f: F) -> Effect
where
    F: FnMut() + 'static,
{
    effect_with_teardown(move || {
        f();
        None
    })
}

/// Create a user effect whose producer may return a teardown closure,
/// run before each re-execution and on destruction.
pub fn effect_with_teardown<F>(f: F) -> Effect
where
    F: FnMut() -> Option<TeardownFn> + 'static,
{
    Effect::from_inner(create_effect(EFFECT, Box::new(f), true))
}

/// Create a pre effect: runs in the same flush as render effects, ahead of
/// them, with local drains keeping one context's pre work settled before
/// its render work.
pub fn pre_effect<F>(mut f: F) -> Effect
where
    F: FnMut() + 'static,
{
    Effect::from_inner(create_effect(EFFECT | PRE_EFFECT, Box::new(move || {
        f();
        None
    }), true))
}

/// Create a render effect. The producer receives the owning block, when
/// one was given.
pub fn render_effect<F>(mut f: F, block: Option<Block>) -> Effect
where
    F: FnMut(Option<&Block>) + 'static,
{
    let block_for_producer = block.clone();
    let inner = create_effect(
        EFFECT | RENDER_EFFECT,
        Box::new(move || {
            f(block_for_producer.as_ref());
            None
        }),
        true,
    );
    if let Some(block) = block {
        inner.set_owning_block(block);
    }
    Effect::from_inner(inner)
}

/// Create a sync effect: it executes immediately, and re-executes inline
/// with every write that dirties it, before the write returns.
pub fn sync_effect<F>(mut f: F) -> Effect
where
    F: FnMut() + 'static,
{
    Effect::from_inner(create_effect(EFFECT | SYNC_EFFECT, Box::new(move || {
        f();
        None
    }), true))
}

/// Create an effect managed by the caller: legal outside any component
/// context, never auto-owned by a parent effect.
pub fn managed_effect<F>(mut f: F) -> Effect
where
    F: FnMut() + 'static,
{
    Effect::from_inner(create_effect(EFFECT | MANAGED, Box::new(move || {
        f();
        None
    }), false))
}

/// Managed variant of [`render_effect`].
pub fn managed_render_effect<F>(mut f: F, block: Option<Block>) -> Effect
where
    F: FnMut(Option<&Block>) + 'static,
{
    let block_for_producer = block.clone();
    let inner = create_effect(
        EFFECT | RENDER_EFFECT | MANAGED,
        Box::new(move || {
            f(block_for_producer.as_ref());
            None
        }),
        false,
    );
    if let Some(block) = block {
        inner.set_owning_block(block);
    }
    Effect::from_inner(inner)
}

/// Register a teardown closure on an effect from the outside.
pub fn push_teardown(effect: &Effect, f: impl FnOnce() + 'static) {
    effect.inner().push_teardown(Box::new(f));
}

// =============================================================================
// CREATE EFFECT (internal)
// =============================================================================

/// The effect the runtime is currently executing, as a concrete record.
pub(crate) fn current_effect_inner() -> Option<Rc<EffectInner>> {
    with_context(|ctx| ctx.get_active_effect())
        .and_then(|w| w.upgrade())
        .and_then(|reaction| {
            reaction
                .as_any()
                .downcast_ref::<EffectInner>()
                .and_then(|e| e.upgrade_self())
        })
}

/// Adopt a freshly created derived into the executing effect, when one
/// exists. Answers whether ownership was taken.
pub(crate) fn register_derived_with_active_effect(source: &Rc<dyn AnySource>) -> bool {
    match current_effect_inner() {
        Some(effect) => {
            effect.adopt_derived(source.clone());
            true
        }
        None => false,
    }
}

fn create_effect(effect_type: u32, func: EffectFn, own_by_parent: bool) -> Rc<EffectInner> {
    let effect = EffectInner::new(effect_type, Some(func));

    let frame = current_component();
    effect.set_owning_context(frame.as_ref());

    let parent = current_effect_inner();

    if (effect_type & MANAGED) == 0 && parent.is_none() && frame.is_none() {
        panic!("{}", RuntimeError::EffectOutsideInit);
    }

    if own_by_parent {
        if let Some(ref parent_effect) = parent {
            effect.set_parent(Some(Rc::downgrade(parent_effect)));
            push_effect(&effect, parent_effect);
        }
    }

    if (effect_type & SYNC_EFFECT) != 0 {
        // Sync effects run inline, including their first execution
        update_effect(&effect);
        return effect;
    }

    // Plain user effects created during component init wait for mount
    let defer = (effect_type & (PRE_AND_RENDER | MANAGED)) == 0
        && parent.is_none()
        && frame.as_ref().is_some_and(|f| !f.is_mounted());

    if defer {
        if let Some(frame) = frame {
            frame.defer_effect(effect.clone());
            return effect;
        }
    }

    schedule_effect(effect.clone() as Rc<dyn AnyReaction>);

    effect
}

// =============================================================================
// TESTS
// =============================================================================
