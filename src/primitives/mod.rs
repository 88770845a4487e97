// ============================================================================
// filament - Primitives Module
// Sources, deriveds, effects, component frames, selector and store bridge
// ============================================================================

pub mod component;
pub mod derived;
pub mod effect;
pub mod selector;
pub mod signal;
pub mod store;

pub use component::{
    after_update, before_update, current_component, get_context, is_immutable, is_strict_mode,
    pop, push, set_context, ComponentFrame,
};
pub use derived::{derived, derived_with_equals, update_derived_chain, Derived, DerivedInner};
pub use effect::{
    destroy_effect, effect, effect_with_teardown, managed_effect, managed_render_effect,
    mark_subtree_inert, pre_effect, push_teardown, render_effect, sync_effect, update_effect,
    Block, Effect, EffectFn, EffectInner, TeardownFn,
};
pub use selector::{selector, Selector};
pub use signal::{
    decrement, decrement_pre, increment, increment_pre, is_node, mutable_source, source,
    source_with_equals, Signal,
};
pub use store::{
    bridge_store, bridge_store_set, is_store, unsubscribe_on_teardown, Store, StoreRegistry,
};
