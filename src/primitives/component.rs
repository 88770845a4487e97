// ============================================================================
// filament - Component Context
// Per-component frames threading ownership, modes and lifecycle hooks
// ============================================================================
//
// Compiler-emitted component bodies bracket themselves with push/pop. The
// frame carries the component's props, its mutation-validation mode, the
// lazily inherited context map, lifecycle callbacks, deferred user effects
// (created during init, scheduled at mount) and the component's store
// registry.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::primitives::effect::EffectInner;
use crate::primitives::store::StoreRegistry;
use crate::reactivity::scheduling::schedule_effect;

// =============================================================================
// COMPONENT FRAME
// =============================================================================

/// One frame of the component context stack.
pub struct ComponentFrame {
    /// Component props, opaque to the runtime
    props: RefCell<Option<Rc<dyn Any>>>,

    /// Enclosing frame
    parent: RefCell<Option<Rc<ComponentFrame>>>,

    /// Keyed context, lazily copied from the parent on first write
    context_map: RefCell<Option<HashMap<String, Rc<dyn Any>>>>,

    /// Component promises not to mutate object values in place
    immutable: Cell<bool>,

    /// Strict mutation validation (forbid writes during derivation)
    runes: Cell<bool>,

    /// Set at pop; deferred effects schedule then
    mounted: Cell<bool>,

    /// User effects created during init, awaiting mount
    deferred_effects: RefCell<Vec<Rc<EffectInner>>>,

    /// Callbacks run before this component's render work in a flush
    before_update: RefCell<Vec<Box<dyn FnMut()>>>,

    /// Callbacks run after a flush that touched this component
    after_update: RefCell<Vec<Box<dyn FnMut()>>>,

    /// Accessor object handed to pop, opaque to the runtime
    accessors: RefCell<Option<Rc<dyn Any>>>,

    /// Store bridge records of this component
    stores: StoreRegistry,
}

impl ComponentFrame {
    fn new(props: Option<Rc<dyn Any>>, runes: bool, immutable: bool) -> Rc<Self> {
        Rc::new(Self {
            props: RefCell::new(props),
            parent: RefCell::new(None),
            context_map: RefCell::new(None),
            immutable: Cell::new(immutable),
            runes: Cell::new(runes),
            mounted: Cell::new(false),
            deferred_effects: RefCell::new(Vec::new()),
            before_update: RefCell::new(Vec::new()),
            after_update: RefCell::new(Vec::new()),
            accessors: RefCell::new(None),
            stores: StoreRegistry::new(),
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.get()
    }

    pub fn is_runes(&self) -> bool {
        self.runes.get()
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.get()
    }

    pub fn props(&self) -> Option<Rc<dyn Any>> {
        self.props.borrow().clone()
    }

    pub fn accessors(&self) -> Option<Rc<dyn Any>> {
        self.accessors.borrow().clone()
    }

    pub fn parent(&self) -> Option<Rc<ComponentFrame>> {
        self.parent.borrow().clone()
    }

    /// The component's store bridge records.
    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Park a user effect until the component mounts.
    pub(crate) fn defer_effect(&self, effect: Rc<EffectInner>) {
        self.deferred_effects.borrow_mut().push(effect);
    }

    /// Run the before-update callbacks (first render-phase touch of a flush).
    pub(crate) fn run_before_update(&self) {
        let mut callbacks = self.before_update.borrow_mut();
        for callback in callbacks.iter_mut() {
            callback();
        }
    }

    /// Run the after-update callbacks (flush that touched this component
    /// finished draining).
    pub(crate) fn run_after_update(&self) {
        let mut callbacks = self.after_update.borrow_mut();
        for callback in callbacks.iter_mut() {
            callback();
        }
    }

    /// Look a context key up through the frame chain.
    fn lookup_context(&self, key: &str) -> Option<Rc<dyn Any>> {
        if let Some(map) = self.context_map.borrow().as_ref() {
            if let Some(value) = map.get(key) {
                return Some(value.clone());
            }
        }
        self.parent.borrow().as_ref().and_then(|p| p.lookup_context(key))
    }

    /// Write a context key on this frame, copying the inherited map first.
    fn insert_context(&self, key: String, value: Rc<dyn Any>) {
        let mut map = self.context_map.borrow_mut();
        if map.is_none() {
            let inherited = self
                .parent
                .borrow()
                .as_ref()
                .and_then(|p| p.effective_context_map())
                .unwrap_or_default();
            *map = Some(inherited);
        }
        if let Some(map) = map.as_mut() {
            map.insert(key, value);
        }
    }

    fn effective_context_map(&self) -> Option<HashMap<String, Rc<dyn Any>>> {
        if let Some(map) = self.context_map.borrow().as_ref() {
            return Some(map.clone());
        }
        self.parent
            .borrow()
            .as_ref()
            .and_then(|p| p.effective_context_map())
    }
}

// =============================================================================
// THE STACK
// =============================================================================

thread_local! {
    static CURRENT: RefCell<Option<Rc<ComponentFrame>>> = const { RefCell::new(None) };
}

/// The innermost component frame, if any.
pub fn current_component() -> Option<Rc<ComponentFrame>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Whether the mutation guard is strict right now. Strict is the default
/// when no component frame is active.
pub fn is_strict_mode() -> bool {
    current_component().map(|f| f.is_runes()).unwrap_or(true)
}

/// Whether the current component promises immutability.
pub fn is_immutable() -> bool {
    current_component().map(|f| f.is_immutable()).unwrap_or(false)
}

/// Open a component frame.
///
/// `runes` selects strict mutation validation; `immutable` lets
/// object-valued sources rely on equality instead of always propagating.
pub fn push(props: Option<Rc<dyn Any>>, runes: bool, immutable: bool) -> Rc<ComponentFrame> {
    let frame = ComponentFrame::new(props, runes, immutable);
    CURRENT.with(|c| {
        let mut current = c.borrow_mut();
        *frame.parent.borrow_mut() = current.clone();
        *current = Some(frame.clone());
    });
    frame
}

/// Close the current component frame: record accessors, mark mounted,
/// schedule the effects deferred during init, restore the parent frame.
///
/// Returns the closed frame - the embedder keeps it alive for as long as
/// the component lives.
pub fn pop(accessors: Option<Rc<dyn Any>>) -> Option<Rc<ComponentFrame>> {
    let frame = CURRENT.with(|c| {
        let mut current = c.borrow_mut();
        let frame = current.take();
        if let Some(ref frame) = frame {
            *current = frame.parent.borrow().clone();
        }
        frame
    })?;

    *frame.accessors.borrow_mut() = accessors;
    frame.mounted.set(true);

    let deferred: Vec<Rc<EffectInner>> = frame.deferred_effects.borrow_mut().drain(..).collect();
    for effect in deferred {
        schedule_effect(effect);
    }

    Some(frame)
}

// =============================================================================
// KEYED CONTEXT
// =============================================================================

/// Store a value in the current component's context map.
pub fn set_context(key: impl Into<String>, value: Rc<dyn Any>) {
    if let Some(frame) = current_component() {
        frame.insert_context(key.into(), value);
    }
}

/// Fetch a typed value from the context chain.
pub fn get_context<T: 'static>(key: &str) -> Option<Rc<T>> {
    current_component()?
        .lookup_context(key)
        .and_then(|value| value.downcast::<T>().ok())
}

// =============================================================================
// LIFECYCLE CALLBACKS
// =============================================================================

/// Run a callback before the current component's render work each flush.
pub fn before_update(f: impl FnMut() + 'static) {
    if let Some(frame) = current_component() {
        frame.before_update.borrow_mut().push(Box::new(f));
    }
}

/// Run a callback after each flush that touched the current component.
pub fn after_update(f: impl FnMut() + 'static) {
    if let Some(frame) = current_component() {
        frame.after_update.borrow_mut().push(Box::new(f));
    }
}

// =============================================================================
// TESTS
// =============================================================================
