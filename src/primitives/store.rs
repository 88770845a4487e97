// ============================================================================
// filament - External Store Bridge
// Adapts a subscribe/set contract into the signal graph
// ============================================================================
//
// An external store knows nothing of this runtime; it exposes subscribe
// (observer in, unsubscribe closure out) and set. The bridge keeps one
// record per (component, store-name): an internal signal the observer
// writes into with mutation validation bypassed, the last observed value,
// and the live unsubscriber. Component teardown unsubscribes everything
// and destroys the signals; late reads see the preserved last value.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::core::constants::DESTROYED;
use crate::primitives::signal::{source, Signal};

// =============================================================================
// STORE CONTRACT
// =============================================================================

/// The contract an external store satisfies.
///
/// `subscribe` must call the observer with the current value on
/// subscription and on every subsequent change, and return a closure that
/// cancels the subscription. `set` is optional; read-only stores keep the
/// default no-op.
pub trait Store<T> {
    fn subscribe(&self, observer: Box<dyn Fn(&T)>) -> Box<dyn FnOnce()>;

    fn set(&self, _value: T) {}
}

/// Whether a type-erased value is a store handle for T.
pub fn is_store<T: 'static>(value: &dyn Any) -> bool {
    value.is::<Rc<dyn Store<T>>>()
}

/// Write through to the store and hand the value back, for compiler-emitted
/// assignment expressions.
pub fn bridge_store_set<T: Clone>(store: &Rc<dyn Store<T>>, value: T) -> T {
    store.set(value.clone());
    value
}

// =============================================================================
// RECORDS
// =============================================================================

struct StoreRecord<T: 'static> {
    store: Rc<dyn Store<T>>,
    signal: Signal<Option<T>>,
    last_value: Rc<RefCell<Option<T>>>,
    unsubscribe: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// Type-erased record operations needed by teardown and lookup.
trait AnyStoreRecord {
    fn unsubscribe(&self);
    fn destroy_signal(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<T: Clone + PartialEq + 'static> AnyStoreRecord for StoreRecord<T> {
    fn unsubscribe(&self) {
        if let Some(unsubscribe) = self.unsubscribe.borrow_mut().take() {
            unsubscribe();
        }
    }

    fn destroy_signal(&self) {
        let inner = self.signal.as_any_source();
        inner.clear_consumers();
        inner.set_flags(inner.flags() | DESTROYED);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: Clone + PartialEq + 'static> StoreRecord<T> {
    fn new(store: Rc<dyn Store<T>>) -> Rc<Self> {
        let record = Rc::new(Self {
            store,
            signal: source(None::<T>),
            last_value: Rc::new(RefCell::new(None)),
            unsubscribe: RefCell::new(None),
        });
        record.subscribe_current();
        record
    }

    fn subscribe_current(&self) {
        let signal = self.signal.clone();
        let last_value = self.last_value.clone();

        let unsubscribe = self.store.subscribe(Box::new(move |value: &T| {
            *last_value.borrow_mut() = Some(value.clone());
            // Observer writes bypass the mutation guard: the store decides
            // when its subscribers hear about changes.
            signal.set_unchecked(Some(value.clone()));
        }));

        *self.unsubscribe.borrow_mut() = Some(unsubscribe);
    }

    fn is_same_store(&self, store: &Rc<dyn Store<T>>) -> bool {
        Rc::as_ptr(&self.store) as *const () == Rc::as_ptr(store) as *const ()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Per-component container of store bridge records.
pub struct StoreRegistry {
    records: RefCell<HashMap<String, Rc<dyn AnyStoreRecord>>>,
    torn_down: Cell<bool>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            records: RefCell::new(HashMap::new()),
            torn_down: Cell::new(false),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a store value through the graph.
///
/// The first read for a name subscribes; the observer keeps the internal
/// signal current, so the read registers an ordinary dependency. Binding a
/// different store under the same name unsubscribes the old one and
/// resubscribes. After teardown the preserved last value answers instead
/// of the uninitialized sentinel.
///
/// Returns None only for a store that never called its observer.
pub fn bridge_store<T: Clone + PartialEq + 'static>(
    store: Rc<dyn Store<T>>,
    name: &str,
    registry: &StoreRegistry,
) -> Option<T> {
    if registry.torn_down.get() {
        let records = registry.records.borrow();
        return records
            .get(name)
            .and_then(|record| record.as_any().downcast_ref::<StoreRecord<T>>())
            .and_then(|record| record.last_value.borrow().clone());
    }

    let record: Rc<dyn AnyStoreRecord> = {
        let mut records = registry.records.borrow_mut();

        match records.get(name).cloned() {
            Some(record)
                if record
                    .as_any()
                    .downcast_ref::<StoreRecord<T>>()
                    .is_some_and(|typed| typed.is_same_store(&store)) =>
            {
                record
            }
            stale => {
                if let Some(old) = stale {
                    debug!(name, "rebinding store record to a new store");
                    old.unsubscribe();
                } else {
                    debug!(name, "first read subscribes to store");
                }
                let fresh: Rc<dyn AnyStoreRecord> = StoreRecord::new(store);
                records.insert(name.to_string(), fresh.clone());
                fresh
            }
        }
    };

    let typed = record.as_any().downcast_ref::<StoreRecord<T>>()?;
    typed.signal.get()
}

/// Tear the registry down: unsubscribe every record and destroy the
/// internal signals, preserving each last value for late readers.
pub fn unsubscribe_on_teardown(registry: &StoreRegistry) {
    if registry.torn_down.replace(true) {
        return;
    }

    let records: Vec<Rc<dyn AnyStoreRecord>> =
        registry.records.borrow().values().cloned().collect();

    for record in records {
        record.unsubscribe();
        record.destroy_signal();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::effect::managed_effect;
    use crate::reactivity::scheduling::flush_now;

    /// Minimal writable store for exercising the bridge.
    struct TestStore<T> {
        value: RefCell<T>,
        observers: Rc<RefCell<Vec<Rc<dyn Fn(&T)>>>>,
    }

    impl<T: Clone + 'static> TestStore<T> {
        fn new(value: T) -> Rc<Self> {
            Rc::new(Self {
                value: RefCell::new(value),
                observers: Rc::new(RefCell::new(Vec::new())),
            })
        }

        fn observer_count(&self) -> usize {
            self.observers.borrow().len()
        }
    }

    impl<T: Clone + 'static> Store<T> for TestStore<T> {
        fn subscribe(&self, observer: Box<dyn Fn(&T)>) -> Box<dyn FnOnce()> {
            let observer: Rc<dyn Fn(&T)> = Rc::from(observer);
            observer(&self.value.borrow());
            self.observers.borrow_mut().push(observer.clone());

            let observers = self.observers.clone();
            let target = Rc::as_ptr(&observer);
            Box::new(move || {
                let mut list = observers.borrow_mut();
                if let Some(idx) = list.iter().position(|o| std::ptr::eq(Rc::as_ptr(o), target))
                {
                    list.swap_remove(idx);
                }
            })
        }

        fn set(&self, value: T) {
            *self.value.borrow_mut() = value.clone();
            let observers: Vec<Rc<dyn Fn(&T)>> = self.observers.borrow().clone();
            for observer in observers {
                observer(&value);
            }
        }
    }

    #[test]
    fn first_read_subscribes_and_returns_current_value() {
        let registry = StoreRegistry::new();
        let store = TestStore::new(10);

        let value = bridge_store(store.clone() as Rc<dyn Store<i32>>, "count", &registry);
        assert_eq!(value, Some(10));
        assert_eq!(store.observer_count(), 1);

        // Second read reuses the subscription
        let value = bridge_store(store.clone() as Rc<dyn Store<i32>>, "count", &registry);
        assert_eq!(value, Some(10));
        assert_eq!(store.observer_count(), 1);
    }

    #[test]
    fn store_updates_flow_into_the_graph() {
        use std::cell::Cell;

        let registry = Rc::new(StoreRegistry::new());
        let store = TestStore::new(1);
        let seen = Rc::new(Cell::new(0));

        let registry2 = registry.clone();
        let store2 = store.clone();
        let seen2 = seen.clone();
        let _effect = managed_effect(move || {
            if let Some(v) =
                bridge_store(store2.clone() as Rc<dyn Store<i32>>, "count", &registry2)
            {
                seen2.set(v);
            }
        });

        flush_now();
        assert_eq!(seen.get(), 1);

        store.set(5);
        flush_now();
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn rebinding_a_name_swaps_the_subscription() {
        let registry = StoreRegistry::new();
        let first = TestStore::new(1);
        let second = TestStore::new(2);

        assert_eq!(
            bridge_store(first.clone() as Rc<dyn Store<i32>>, "n", &registry),
            Some(1)
        );
        assert_eq!(first.observer_count(), 1);

        assert_eq!(
            bridge_store(second.clone() as Rc<dyn Store<i32>>, "n", &registry),
            Some(2)
        );
        assert_eq!(first.observer_count(), 0, "old subscription cancelled");
        assert_eq!(second.observer_count(), 1);
    }

    #[test]
    fn teardown_unsubscribes_and_preserves_last_value() {
        let registry = StoreRegistry::new();
        let store = TestStore::new(7);

        assert_eq!(
            bridge_store(store.clone() as Rc<dyn Store<i32>>, "n", &registry),
            Some(7)
        );

        unsubscribe_on_teardown(&registry);
        assert_eq!(store.observer_count(), 0);

        // Reads after teardown answer with the preserved value
        assert_eq!(
            bridge_store(store.clone() as Rc<dyn Store<i32>>, "n", &registry),
            Some(7)
        );

        // And do not resubscribe
        assert_eq!(store.observer_count(), 0);
    }

    #[test]
    fn bridge_store_set_writes_through() {
        let store = TestStore::new(0);
        let as_store: Rc<dyn Store<i32>> = store.clone();

        let value = bridge_store_set(&as_store, 9);
        assert_eq!(value, 9);
        assert_eq!(*store.value.borrow(), 9);
    }

    #[test]
    fn observer_write_bypasses_strict_guard() {
        // A subscription made while a derived computes fires the observer
        // inline; the bridge's unchecked write must not trip the guard.
        let store = TestStore::new(1);

        let d = crate::primitives::derived::derived({
            let store = store.clone();
            move || {
                let local = StoreRegistry::new();
                bridge_store(store.clone() as Rc<dyn Store<i32>>, "n", &local).unwrap_or(0)
            }
        });

        assert_eq!(d.get(), 1);
    }

    #[test]
    fn is_store_probe() {
        let store = TestStore::new(1);
        let erased: Rc<dyn Store<i32>> = store;
        let boxed: Box<dyn Any> = Box::new(erased);
        assert!(is_store::<i32>(&*boxed));
        assert!(!is_store::<String>(&*boxed));
    }
}
