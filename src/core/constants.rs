// ============================================================================
// filament - Constants
// Flag bits carried by every node in the reactive graph
// ============================================================================

// =============================================================================
// ROLE FLAGS
// =============================================================================

/// Node is a source (leaf value set by user code)
pub const SOURCE: u32 = 1 << 0;

/// Node is a derived (memoized computation over other nodes)
pub const DERIVED: u32 = 1 << 1;

/// Node is an effect (producer runs for side effects)
pub const EFFECT: u32 = 1 << 2;

/// Effect runs in the pre phase, before render effects of the same context
pub const PRE_EFFECT: u32 = 1 << 3;

/// Effect runs in the render phase (UI-building work mounts here)
pub const RENDER_EFFECT: u32 = 1 << 4;

/// Effect runs synchronously, inline with the triggering write
pub const SYNC_EFFECT: u32 = 1 << 5;

// =============================================================================
// OWNERSHIP FLAGS
// =============================================================================

/// Node is managed externally - the parent effect will not auto-own it
pub const MANAGED: u32 = 1 << 6;

/// Derived was created with no owning effect
pub const UNOWNED: u32 = 1 << 7;

/// Unowned derived lost its last consumer and was pruned from the graph
pub const DISCONNECTED: u32 = 1 << 8;

// =============================================================================
// STATUS FLAGS (mutually exclusive)
// =============================================================================

/// Known current
pub const CLEAN: u32 = 1 << 9;

/// Certainly stale - must re-execute
pub const DIRTY: u32 = 1 << 10;

/// Possibly stale - dependencies must be validated before re-executing
pub const MAYBE_DIRTY: u32 = 1 << 11;

// =============================================================================
// LIFECYCLE FLAGS
// =============================================================================

/// Reaction's producer is currently executing
pub const REACTION_IS_UPDATING: u32 = 1 << 12;

/// Node has been destroyed (terminal)
pub const DESTROYED: u32 = 1 << 13;

/// Subtree is paused - scheduling suppressed until un-inerted
pub const INERT: u32 = 1 << 14;

/// Effect has executed at least once
pub const EFFECT_RAN: u32 = 1 << 15;

// =============================================================================
// MASKS
// =============================================================================

/// Mask to clear all status bits (CLEAN, DIRTY, MAYBE_DIRTY)
pub const STATUS_MASK: u32 = !(CLEAN | DIRTY | MAYBE_DIRTY);

/// Effects that drain through the pre-and-render queue
pub const PRE_AND_RENDER: u32 = PRE_EFFECT | RENDER_EFFECT;

// =============================================================================
// TESTS
// =============================================================================
