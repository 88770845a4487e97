// ============================================================================
// filament - Selector
// O(1) "is this the active key?" membership over per-key consumer sets
// ============================================================================
//
// A naive "am I selected?" effect per list item makes every selection
// change O(N): each item's effect depends on the whole selection source.
// The selector inverts the bookkeeping: consumers register under the key
// they asked about, and a selection change marks only the consumers of the
// outgoing and incoming keys.
// ============================================================================

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::rc::{Rc, Weak};

use crate::core::constants::{DESTROYED, EFFECT, MAYBE_DIRTY};
use crate::core::context::with_context;
use crate::core::types::AnyReaction;
use crate::reactivity::scheduling::schedule_effect;
use crate::reactivity::tracking::mark_reactions;

// =============================================================================
// SUBSCRIBER ENTRY
// =============================================================================

/// One consumer registered under a key, identity-hashed through its weak
/// pointer so dead entries never resurrect.
#[derive(Clone)]
struct SubscriberEntry {
    consumer: Weak<dyn AnyReaction>,
}

impl PartialEq for SubscriberEntry {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.consumer, &other.consumer)
    }
}

impl Eq for SubscriberEntry {}

impl Hash for SubscriberEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Weak::as_ptr(&self.consumer) as *const ()).hash(state);
    }
}

// =============================================================================
// SELECTOR
// =============================================================================

struct SelectorInner<K> {
    /// The currently selected key
    active_key: RefCell<Option<K>>,

    /// key -> consumers that asked `is(key)`
    subscribers: RefCell<HashMap<K, HashSet<SubscriberEntry>>>,
}

/// Tracks one "active key" and answers membership in O(1) per change.
///
/// # Example
///
/// ```
/// use filament::{selector, managed_effect, flush_now};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let selected = selector(Some(1));
///
/// let runs = Rc::new(Cell::new(0));
/// let selected2 = selected.clone();
/// let runs2 = runs.clone();
/// let _item = managed_effect(move || {
///     let _ = selected2.is(&2);
///     runs2.set(runs2.get() + 1);
/// });
/// flush_now();
/// assert_eq!(runs.get(), 1);
///
/// // 2 is neither the outgoing nor the incoming key: the item stays put
/// selected.set(3);
/// flush_now();
/// assert_eq!(runs.get(), 1);
///
/// // 2 becomes the active key: the item re-runs
/// selected.set(2);
/// flush_now();
/// assert_eq!(runs.get(), 2);
/// ```
pub struct Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    inner: Rc<SelectorInner<K>>,
}

impl<K> Clone for Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Create a selector, optionally pre-selecting a key.
pub fn selector<K>(initial_key: Option<K>) -> Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    Selector {
        inner: Rc::new(SelectorInner {
            active_key: RefCell::new(initial_key),
            subscribers: RefCell::new(HashMap::new()),
        }),
    }
}

impl<K> Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    /// Whether `key` is the active key. Inside an executing consumer this
    /// registers the consumer under `key`, so only transitions touching
    /// `key` will dirty it.
    pub fn is(&self, key: &K) -> bool {
        with_context(|ctx| {
            if ctx.is_untracking() {
                return;
            }
            if let Some(consumer) = ctx.get_active_reaction() {
                if let Some(reaction) = consumer.upgrade() {
                    if (reaction.flags() & DESTROYED) == 0 {
                        let mut subscribers = self.inner.subscribers.borrow_mut();
                        subscribers
                            .entry(key.clone())
                            .or_default()
                            .insert(SubscriberEntry {
                                consumer: Rc::downgrade(&reaction),
                            });
                    }
                }
            }
        });

        self.inner.active_key.borrow().as_ref() == Some(key)
    }

    /// The active key right now (not a tracked read).
    pub fn active_key(&self) -> Option<K> {
        self.inner.active_key.borrow().clone()
    }

    /// Select a key. Exactly the consumer sets of the outgoing and the
    /// incoming key are marked dirty and their effects scheduled.
    pub fn set(&self, key: K) {
        self.set_active(Some(key));
    }

    /// Clear the selection, dirtying only the outgoing key's consumers.
    pub fn clear(&self) {
        self.set_active(None);
    }

    fn set_active(&self, new_key: Option<K>) {
        let old_key = self.inner.active_key.replace(new_key.clone());
        if old_key == new_key {
            return;
        }

        let mut dirty: Vec<Rc<dyn AnyReaction>> = Vec::new();

        {
            let mut subscribers = self.inner.subscribers.borrow_mut();

            for key in [old_key.as_ref(), new_key.as_ref()].into_iter().flatten() {
                if let Some(set) = subscribers.get_mut(key) {
                    // Sweep dead and destroyed entries while collecting
                    set.retain(|entry| match entry.consumer.upgrade() {
                        Some(reaction) if (reaction.flags() & DESTROYED) == 0 => {
                            dirty.push(reaction);
                            true
                        }
                        _ => false,
                    });

                    if set.is_empty() {
                        subscribers.remove(key);
                    }
                }
            }
        }

        for reaction in dirty {
            reaction.mark_dirty();

            if let Some(derived_source) = reaction.as_derived_source() {
                mark_reactions(derived_source, MAYBE_DIRTY);
            } else if (reaction.flags() & EFFECT) != 0 {
                schedule_effect(reaction);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, key: &K) -> usize {
        self.inner
            .subscribers
            .borrow()
            .get(key)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

// =============================================================================
// TESTS
// =============================================================================
