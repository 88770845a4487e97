// ============================================================================
// filament - A Fine-Grained Reactive Runtime
// ============================================================================
//
// A push/pull signal graph: dependencies are captured at read time, staleness
// propagates lazily through a CLEAN / MAYBE_DIRTY / DIRTY lattice, and
// side-effecting work drains through a microtask-driven flush loop in phase
// order (pre, render, normal; sync effects run inline with the write).
//
// The runtime knows nothing of markup or UI trees. Collaborators thread
// opaque block pointers through render effects and bracket component bodies
// with push/pop; everything else is nodes and edges.
// ============================================================================

pub mod core;
pub mod primitives;
pub mod reactivity;

// Re-export the core surface at the crate root
pub use crate::core::constants;
pub use crate::core::context::{
    is_tracking, is_untracking, max_flush_depth, read_version, set_max_flush_depth, with_context,
    write_version, ReactiveContext,
};
pub use crate::core::error::RuntimeError;
pub use crate::core::host::{
    clear_drivers, run_microtasks, run_tasks, set_microtask_driver, set_task_driver, HostTask,
};
pub use crate::core::types::{default_equals, AnyReaction, AnySource, EqualsFn, SourceInner};

// Primitives
pub use crate::primitives::component::{
    after_update, before_update, current_component, get_context, is_immutable, is_strict_mode,
    pop, push, set_context, ComponentFrame,
};
pub use crate::primitives::derived::{
    derived, derived_with_equals, update_derived_chain, Derived, DerivedInner,
};
pub use crate::primitives::effect::{
    destroy_effect, effect, effect_with_teardown, managed_effect, managed_render_effect,
    mark_subtree_inert, pre_effect, push_teardown, render_effect, sync_effect, update_effect,
    Block, Effect, EffectFn, EffectInner, TeardownFn,
};
pub use crate::primitives::selector::{selector, Selector};
pub use crate::primitives::signal::{
    decrement, decrement_pre, increment, increment_pre, is_node, mutable_source, source,
    source_with_equals, Signal,
};
pub use crate::primitives::store::{
    bridge_store, bridge_store_set, is_store, unsubscribe_on_teardown, Store, StoreRegistry,
};

// Reactivity
pub use crate::reactivity::capture::{
    capture_reads, expose, invalidate_inner_signals, peek, untrack, Exposed,
};
pub use crate::reactivity::equality::{
    always_equals, equals, never_equals, object_equals, safe_equal_f32, safe_equal_f64,
    safe_not_equal_f32, safe_not_equal_f64,
};
pub use crate::reactivity::scheduling::{flush_now, flush_now_with, tick};
pub use crate::reactivity::tracking::{check_dirtiness, mark_reactions, notify_write, track_read};

// =============================================================================
// TESTS
// =============================================================================
