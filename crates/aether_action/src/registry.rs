use {
    crate::{Action, ActionTrigger},
    alloc::rc::{Rc, Weak},
    core::{
        cell::{Cell, RefCell},
        fmt,
    },
};

#[derive(Default)]
pub(crate) struct Slot {
    action: RefCell<Option<Weak<dyn Action>>>,
    finished: Cell<bool>,
}

impl Slot {
    pub(crate) fn action(&self) -> Option<Rc<dyn Action>> {
        self.action.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }
}

/// Handle to an action's slot in an [`ActionRegistry`].
///
/// The slot lives for as long as any index to it is alive. This is held by the
/// action itself and by every [`ActionView`] of it, so that a view never points
/// to a slot which has been reused.
///
/// [`ActionView`]: crate::ActionView
#[derive(Clone)]
pub struct ActionIndex(Rc<Slot>);

impl fmt::Debug for ActionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionIndex")
            .field("alive", &self.is_alive())
            .field("finished", &self.0.finished.get())
            .finish()
    }
}

impl PartialEq for ActionIndex {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ActionIndex {}

impl ActionIndex {
    /// Returns `true` if the action in this slot has not been dropped yet.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.action().is_some()
    }

    pub(crate) fn set_action(&self, action: Weak<dyn Action>) {
        *self.0.action.borrow_mut() = Some(action);
    }

    pub(crate) fn set_finished(&self) {
        self.0.finished.set(true);
    }

    pub(crate) fn clear(&self) {
        // the action is being dropped, so the weak could no longer be upgraded
        // anyway, but release the allocation early
        if let Ok(mut action) = self.0.action.try_borrow_mut() {
            *action = None;
        }
    }
}

/// Ordered set of the actions which a processor updates.
///
/// Cloning a registry gives another handle to the same set.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    slots: Rc<RefCell<Vec<Weak<Slot>>>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self) -> ActionIndex {
        let slot = Rc::new(Slot::default());
        self.slots.borrow_mut().push(Rc::downgrade(&slot));
        ActionIndex(slot)
    }

    /// Number of slots which are still referenced by an action or a view.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut slots = self.slots.borrow_mut();
        slots.retain(|slot| slot.strong_count() > 0);
        slots.len()
    }

    /// Returns `true` if no slots are referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes strong references to all live slots, in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<Rc<Slot>> {
        let mut slots = self.slots.borrow_mut();
        slots.retain(|slot| slot.strong_count() > 0);
        slots.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Registry and trigger pair which new actions register themselves into.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    registry: ActionRegistry,
    trigger: ActionTrigger,
}

impl ActionContext {
    /// Creates a context from an existing registry and trigger.
    #[must_use]
    pub const fn new(registry: ActionRegistry, trigger: ActionTrigger) -> Self {
        Self { registry, trigger }
    }

    /// Gets the registry that actions spawned by this context are added to.
    #[must_use]
    pub const fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Gets the trigger used to wake up the processor.
    #[must_use]
    pub const fn trigger(&self) -> &ActionTrigger {
        &self.trigger
    }
}
