// ============================================================================
// filament - Host Loop Hooks
// Microtask and deferred-task primitives supplied by the embedder
// ============================================================================
//
// The runtime needs two things from its host loop: a microtask primitive
// ("run after the current synchronous code, before the next turn") and a
// deferred-task primitive ("run in a future turn"). Both are pluggable.
// The default drivers queue into thread-local lists that `run_microtasks`
// and `run_tasks` drain, which is what a host without its own loop (tests,
// plain binaries) uses via `tick()`.
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;

/// A unit of work handed to the host loop
pub type HostTask = Box<dyn FnOnce()>;

/// Hook that delivers a task to the host's loop
pub type HostDriver = Rc<dyn Fn(HostTask)>;

thread_local! {
    static MICROTASK_DRIVER: RefCell<Option<HostDriver>> = const { RefCell::new(None) };
    static TASK_DRIVER: RefCell<Option<HostDriver>> = const { RefCell::new(None) };

    static MICROTASK_QUEUE: RefCell<Vec<HostTask>> = const { RefCell::new(Vec::new()) };
    static TASK_QUEUE: RefCell<Vec<HostTask>> = const { RefCell::new(Vec::new()) };
}

// =============================================================================
// DRIVER INSTALLATION
// =============================================================================

/// Install the host's microtask primitive. Pass the task straight to the
/// embedding loop; the runtime never calls it re-entrantly.
pub fn set_microtask_driver(driver: impl Fn(HostTask) + 'static) {
    MICROTASK_DRIVER.with(|d| *d.borrow_mut() = Some(Rc::new(driver)));
}

/// Install the host's deferred-task primitive (a future-turn hook).
pub fn set_task_driver(driver: impl Fn(HostTask) + 'static) {
    TASK_DRIVER.with(|d| *d.borrow_mut() = Some(Rc::new(driver)));
}

/// Remove both drivers, falling back to the internal queues.
pub fn clear_drivers() {
    MICROTASK_DRIVER.with(|d| *d.borrow_mut() = None);
    TASK_DRIVER.with(|d| *d.borrow_mut() = None);
}

// =============================================================================
// ENQUEUEING
// =============================================================================

/// Hand a task to the microtask primitive.
pub(crate) fn enqueue_microtask(task: HostTask) {
    let driver = MICROTASK_DRIVER.with(|d| d.borrow().clone());
    match driver {
        Some(driver) => driver(task),
        None => MICROTASK_QUEUE.with(|q| q.borrow_mut().push(task)),
    }
}

/// Hand a task to the deferred-task primitive.
pub(crate) fn enqueue_task(task: HostTask) {
    let driver = TASK_DRIVER.with(|d| d.borrow().clone());
    match driver {
        Some(driver) => driver(task),
        None => TASK_QUEUE.with(|q| q.borrow_mut().push(task)),
    }
}

// =============================================================================
// DEFAULT DRAINS
// =============================================================================

/// Run every microtask in the internal queue, including ones enqueued while
/// draining. No-op under an installed driver.
pub fn run_microtasks() {
    loop {
        let batch: Vec<HostTask> = MICROTASK_QUEUE.with(|q| q.borrow_mut().drain(..).collect());
        if batch.is_empty() {
            break;
        }
        for task in batch {
            task();
        }
    }
}

/// Run every deferred task in the internal queue. No-op under an installed
/// driver.
pub fn run_tasks() {
    loop {
        let batch: Vec<HostTask> = TASK_QUEUE.with(|q| q.borrow_mut().drain(..).collect());
        if batch.is_empty() {
            break;
        }
        for task in batch {
            task();
        }
    }
}

/// Whether the internal microtask queue holds pending work.
pub fn has_pending_microtasks() -> bool {
    MICROTASK_QUEUE.with(|q| !q.borrow().is_empty())
}

// =============================================================================
// TESTS
// =============================================================================
