// ============================================================================
// filament - Source Signals
// The writable leaf node of the reactive graph
// ============================================================================

use std::any::Any;
use std::rc::Rc;

use crate::core::context::with_context;
use crate::core::error::RuntimeError;
use crate::core::types::{AnySource, EqualsFn, SourceInner};
use crate::primitives::component::is_immutable;
use crate::reactivity::capture::untrack;
use crate::reactivity::equality::object_equals;
use crate::reactivity::scheduling::flush_now;
use crate::reactivity::tracking::{notify_write, track_read, validate_write};

// =============================================================================
// SIGNAL<T> - The public source handle
// =============================================================================

/// A writable reactive source holding a value of type T.
///
/// Reads inside an executing effect or derived register the source as a
/// dependency; writes that pass the equality check invalidate consumers
/// and schedule the effects among them.
///
/// # Example
///
/// ```
/// use filament::source;
///
/// let count = source(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
#[derive(Clone)]
pub struct Signal<T> {
    inner: Rc<SourceInner<T>>,
}

impl<T> Signal<T> {
    pub fn new(value: T) -> Self
    where
        T: PartialEq + 'static,
    {
        Self {
            inner: Rc::new(SourceInner::new(value)),
        }
    }

    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self
    where
        T: 'static,
    {
        Self {
            inner: Rc::new(SourceInner::new_with_equals(value, equals)),
        }
    }

    /// Get the current value (cloning), registering a dependency when read
    /// inside an active consumer.
    pub fn get(&self) -> T
    where
        T: Clone + 'static,
    {
        track_read(self.inner.clone() as Rc<dyn AnySource>);
        self.inner.get()
    }

    /// Borrow the current value through a closure, avoiding the clone.
    ///
    /// # Example
    ///
    /// ```
    /// use filament::source;
    ///
    /// let items = source(vec![1, 2, 3]);
    /// let sum = items.with(|v| v.iter().sum::<i32>());
    /// assert_eq!(sum, 6);
    /// ```
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R
    where
        T: 'static,
    {
        track_read(self.inner.clone() as Rc<dyn AnySource>);
        self.inner.with(f)
    }

    /// Set the value. Returns true when the write propagated.
    ///
    /// Aborts on a strict-mode write during a derivation; use [`try_set`]
    /// where that is a recoverable condition.
    ///
    /// [`try_set`]: Signal::try_set
    pub fn set(&self, value: T) -> bool
    where
        T: 'static,
    {
        match self.try_set(value) {
            Ok(changed) => changed,
            Err(err) => panic!("{err}"),
        }
    }

    /// Set the value, failing instead of aborting when the mutation guard
    /// rejects the write.
    pub fn try_set(&self, value: T) -> Result<bool, RuntimeError>
    where
        T: 'static,
    {
        validate_write()?;
        Ok(self.set_unchecked(value))
    }

    /// Set the value and synchronously flush the resulting effect work
    /// before returning.
    pub fn set_sync(&self, value: T) -> bool
    where
        T: 'static,
    {
        let changed = self.set(value);
        flush_now();
        changed
    }

    /// Set the value with mutation validation bypassed. The store bridge
    /// writes observer values through here.
    pub(crate) fn set_unchecked(&self, value: T) -> bool
    where
        T: 'static,
    {
        let changed = self.inner.set(value);
        if changed {
            let version = with_context(|ctx| ctx.increment_write_version());
            self.inner.set_write_version(version);
            notify_write(self.inner.clone() as Rc<dyn AnySource>);
        }
        changed
    }

    /// Mutate the value in place. In-place mutation defeats the equality
    /// check, so consumers are invalidated whenever any exist.
    ///
    /// # Example
    ///
    /// ```
    /// use filament::source;
    ///
    /// let count = source(0);
    /// count.update(|n| *n += 1);
    /// assert_eq!(count.get(), 1);
    /// ```
    pub fn update(&self, f: impl FnOnce(&mut T))
    where
        T: 'static,
    {
        if let Err(err) = validate_write() {
            panic!("{err}");
        }

        let had_consumers = self.inner.update(f);
        if had_consumers {
            let version = with_context(|ctx| ctx.increment_write_version());
            self.inner.set_write_version(version);
            notify_write(self.inner.clone() as Rc<dyn AnySource>);
        }
    }

    /// The record behind this handle, for graph-level operations.
    pub fn inner(&self) -> &Rc<SourceInner<T>> {
        &self.inner
    }

    /// Type-erased view for heterogeneous storage.
    pub fn as_any_source(&self) -> Rc<dyn AnySource>
    where
        T: 'static,
    {
        self.inner.clone()
    }
}

impl<T: std::fmt::Debug + Clone + 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("value", &self.get()).finish()
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Create a source signal.
///
/// # Example
///
/// ```
/// use filament::source;
///
/// let count = source(0);
/// count.set(42);
/// assert_eq!(count.get(), 42);
/// ```
pub fn source<T>(value: T) -> Signal<T>
where
    T: PartialEq + 'static,
{
    Signal::new(value)
}

/// Create a source with a custom equality predicate.
///
/// # Example
///
/// ```
/// use filament::source_with_equals;
///
/// // Every write propagates, even of an equal value
/// let always = source_with_equals(0, |_, _| false);
/// assert!(always.set(0));
/// ```
pub fn source_with_equals<T>(value: T, equals: EqualsFn<T>) -> Signal<T>
where
    T: 'static,
{
    Signal::new_with_equals(value, equals)
}

/// Create a source for an object value that may be mutated in place.
///
/// Unless the owning component promises immutability, every write
/// propagates: identity comparison would swallow in-place changes.
pub fn mutable_source<T>(value: T) -> Signal<T>
where
    T: PartialEq + 'static,
{
    Signal::new_with_equals(value, object_equals(is_immutable()))
}

// =============================================================================
// NUMERIC HELPERS
// =============================================================================
//
// Compiler-emitted code for `x++` / `--x` style expressions lands here.
// The read is untracked so an increment inside an effect does not make the
// effect depend on the counter it is bumping.
// =============================================================================

/// Post-increment: add one, return the previous value.
pub fn increment<T>(signal: &Signal<T>) -> T
where
    T: Copy + std::ops::Add<Output = T> + From<u8> + 'static,
{
    let current = untrack(|| signal.get());
    signal.set(current + T::from(1u8));
    current
}

/// Pre-increment: add one, return the new value.
pub fn increment_pre<T>(signal: &Signal<T>) -> T
where
    T: Copy + std::ops::Add<Output = T> + From<u8> + 'static,
{
    let next = untrack(|| signal.get()) + T::from(1u8);
    signal.set(next);
    next
}

/// Post-decrement: subtract one, return the previous value.
pub fn decrement<T>(signal: &Signal<T>) -> T
where
    T: Copy + std::ops::Sub<Output = T> + From<u8> + 'static,
{
    let current = untrack(|| signal.get());
    signal.set(current - T::from(1u8));
    current
}

/// Pre-decrement: subtract one, return the new value.
pub fn decrement_pre<T>(signal: &Signal<T>) -> T
where
    T: Copy + std::ops::Sub<Output = T> + From<u8> + 'static,
{
    let next = untrack(|| signal.get()) - T::from(1u8);
    signal.set(next);
    next
}

// =============================================================================
// NODE PROBE
// =============================================================================

/// Whether a type-erased value is a reactive node handle.
///
/// Compiler-emitted glue passes graph handles around as `Rc<dyn AnySource>`
/// behind `dyn Any`; this answers "is this one of ours".
pub fn is_node(value: &dyn Any) -> bool {
    value.is::<Rc<dyn AnySource>>()
}

// =============================================================================
// TESTS
// =============================================================================
