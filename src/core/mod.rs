// ============================================================================
// filament - Core Module
// Flag bits, node traits, errors, thread-local context and host hooks
// ============================================================================

pub mod constants;
pub mod context;
pub mod error;
pub mod host;
pub mod types;

pub use constants::*;
pub use context::{
    is_tracking, is_untracking, max_flush_depth, read_version, set_max_flush_depth, with_context,
    write_version, ReactiveContext,
};
pub use error::RuntimeError;
pub use host::{
    clear_drivers, run_microtasks, run_tasks, set_microtask_driver, set_task_driver, HostTask,
};
pub use types::{default_equals, AnyReaction, AnySource, EqualsFn, SourceInner};
