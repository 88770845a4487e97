// ============================================================================
// filament - Effect Scheduling
// Phase-ordered queues drained by a microtask or a synchronous flush
// ============================================================================
//
// Effects come in four flavors. Pre and render effects share one queue and
// run to quiescence before any normal effect; sync effects are never queued
// and run inline with the triggering write. The first schedule after an
// empty state hands one flush callback to the host's microtask primitive;
// everything scheduled while that flush drains joins the same pass.
//
// Stale queue entries (destroyed, inert, or no longer dirty) are dropped at
// drain time. That is also what coalesces duplicate schedules: an effect
// runs once per DIRTY -> CLEAN transition, not once per schedule call.
// ============================================================================

use std::rc::Rc;

use tracing::trace;

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::RuntimeError;
use crate::core::host;
use crate::core::types::AnyReaction;
use crate::primitives::component::ComponentFrame;
use crate::primitives::effect::EffectInner;
use crate::reactivity::tracking::check_dirtiness;

// =============================================================================
// SCHEDULE EFFECT
// =============================================================================

/// Schedule an effect for execution.
///
/// Sync effects run immediately. Pre and render effects join the
/// pre-and-render queue, normal effects the normal queue; the first
/// schedule after an empty state enqueues the flush microtask.
pub fn schedule_effect(reaction: Rc<dyn AnyReaction>) {
    let flags = reaction.flags();

    if (flags & (DESTROYED | INERT)) != 0 {
        return;
    }

    if (flags & SYNC_EFFECT) != 0 {
        run_sync_inline(&reaction);
        return;
    }

    let needs_microtask = with_context(|ctx| {
        if (flags & PRE_AND_RENDER) != 0 {
            ctx.queued_pre_and_render.borrow_mut().push(reaction.clone());
        } else {
            ctx.queued_effects.borrow_mut().push(reaction.clone());
        }

        if !ctx.is_sync_flush() && !ctx.microtask_scheduled.get() {
            ctx.microtask_scheduled.set(true);
            true
        } else {
            false
        }
    });

    if needs_microtask {
        trace!("enqueueing flush microtask");
        host::enqueue_microtask(Box::new(flush_microtask));
    }
}

/// Run a sync effect inline with the write that dirtied it.
///
/// Recursion through sync effects is bounded by the same configurable
/// depth as the flush loop.
fn run_sync_inline(reaction: &Rc<dyn AnyReaction>) {
    if !check_dirtiness(reaction) {
        return;
    }

    bump_flush_count_or_abort();
    reaction.update();
    with_context(|ctx| {
        let count = ctx.flush_count.get();
        ctx.flush_count.set(count.saturating_sub(1));
    });
}

// =============================================================================
// FLUSH LOOP
// =============================================================================

/// The callback handed to the host's microtask primitive.
fn flush_microtask() {
    flush_queues();

    // After-update callbacks may have scheduled more work after the drain
    // ended; hand the host a fresh microtask rather than stranding it.
    let reschedule = with_context(|ctx| {
        ctx.microtask_scheduled.set(false);
        if ctx.queues_empty() {
            false
        } else {
            ctx.microtask_scheduled.set(true);
            true
        }
    });

    if reschedule {
        host::enqueue_microtask(Box::new(flush_microtask));
    }
}

/// Drain both queues in phase order until quiescent.
///
/// The pre-and-render queue is consulted before every pop, so pre/render
/// effects scheduled while a normal effect runs still come first. Component
/// frames touched by pre/render effects get their before-update callbacks
/// on first touch and their after-update callbacks once the drain ends.
fn flush_queues() {
    let mut touched_frames: Vec<Rc<ComponentFrame>> = Vec::new();

    loop {
        let next = with_context(|ctx| {
            let mut pre = ctx.queued_pre_and_render.borrow_mut();
            if !pre.is_empty() {
                return Some(pre.remove(0));
            }
            drop(pre);

            let mut normal = ctx.queued_effects.borrow_mut();
            if !normal.is_empty() {
                Some(normal.remove(0))
            } else {
                None
            }
        });

        let Some(reaction) = next else { break };

        run_drained(&reaction, &mut touched_frames);
    }

    with_context(|ctx| ctx.flush_count.set(0));

    for frame in touched_frames {
        frame.run_after_update();
    }
}

/// Run one queue entry, dropping stale ones.
fn run_drained(reaction: &Rc<dyn AnyReaction>, touched_frames: &mut Vec<Rc<ComponentFrame>>) {
    let flags = reaction.flags();

    if (flags & (DESTROYED | INERT)) != 0 {
        return;
    }

    if !check_dirtiness(reaction) {
        return;
    }

    if (flags & PRE_AND_RENDER) != 0 {
        if let Some(frame) = effect_frame(reaction) {
            let seen = touched_frames
                .iter()
                .any(|f| Rc::ptr_eq(f, &frame));
            if !seen {
                frame.run_before_update();
                touched_frames.push(frame);
            }
        }
    }

    bump_flush_count_or_abort();
    reaction.update();

    // A finished pre effect drains pending pre-and-render work of its own
    // component context before the loop moves on, so reactive statements
    // settle once per flush.
    if (flags & PRE_EFFECT) != 0 {
        flush_local_pre_effects(reaction, touched_frames);
    }
}

/// Drain pre-and-render entries that belong to the same component context
/// as the given effect, leaving other entries queued.
fn flush_local_pre_effects(
    reaction: &Rc<dyn AnyReaction>,
    touched_frames: &mut Vec<Rc<ComponentFrame>>,
) {
    let Some(frame) = effect_frame(reaction) else {
        return;
    };

    loop {
        let local = with_context(|ctx| {
            let mut pre = ctx.queued_pre_and_render.borrow_mut();
            let position = pre.iter().position(|queued| {
                effect_frame(queued).is_some_and(|f| Rc::ptr_eq(&f, &frame))
            });
            position.map(|idx| pre.remove(idx))
        });

        let Some(local_reaction) = local else { break };
        run_drained(&local_reaction, touched_frames);
    }
}

/// The component frame an effect was created under, if any.
fn effect_frame(reaction: &Rc<dyn AnyReaction>) -> Option<Rc<ComponentFrame>> {
    reaction
        .as_any()
        .downcast_ref::<EffectInner>()
        .and_then(|effect| effect.owning_context())
}

/// Count one drained effect, aborting past the configured bound.
///
/// On abort the counter and microtask flag reset so the next write can
/// flush normally; queued entries are left as-is.
fn bump_flush_count_or_abort() {
    with_context(|ctx| {
        let count = ctx.flush_count.get() + 1;
        ctx.flush_count.set(count);

        let limit = ctx.max_flush_depth.get();
        if count > limit {
            ctx.flush_count.set(0);
            ctx.microtask_scheduled.set(false);
            panic!("{}", RuntimeError::UpdateDepthExceeded { limit });
        }
    });
}

// =============================================================================
// SYNCHRONOUS FLUSH
// =============================================================================

/// Restores the scheduler mode on every exit path, panicking included.
struct SyncModeGuard {
    prev: bool,
}

impl Drop for SyncModeGuard {
    fn drop(&mut self) {
        with_context(|ctx| ctx.set_sync_flush(self.prev));
    }
}

/// Drain both queues to quiescence right now, without waiting for the
/// microtask.
pub fn flush_now() {
    let prev = with_context(|ctx| ctx.set_sync_flush(true));
    let _guard = SyncModeGuard { prev };

    flush_queues();
    while !with_context(|ctx| ctx.queues_empty()) {
        flush_queues();
    }

    host::run_tasks();
}

/// Flush, run `f`, then keep flushing until both queues are quiescent.
/// Pending deferred host tasks drain before the previous mode is restored.
pub fn flush_now_with<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_context(|ctx| ctx.set_sync_flush(true));
    let _guard = SyncModeGuard { prev };

    flush_queues();
    let result = f();
    flush_queues();
    while !with_context(|ctx| ctx.queues_empty()) {
        flush_queues();
    }

    host::run_tasks();
    result
}

/// Run the pending flush microtask (and anything else the default host
/// queue holds). Under an installed microtask driver the host loop runs the
/// flush instead and this is a no-op.
pub fn tick() {
    host::run_microtasks();
}

// =============================================================================
// TESTS
// =============================================================================
