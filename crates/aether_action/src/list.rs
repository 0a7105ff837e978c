use {
    crate::{Action, ActionView, Subscription},
    alloc::rc::{Rc, Weak},
    core::{cell::RefCell, fmt},
};

struct Entry<A> {
    action: Rc<A>,
    _finished: Subscription,
}

type Entries<A> = Rc<RefCell<Vec<Entry<A>>>>;

/// Owns a set of actions, dropping each one once it finishes.
///
/// This is how components keep fire-and-forget actions alive: e.g. a gate
/// which must hand out a failed write action keeps it in a list until whoever
/// holds the view has seen the failure.
pub struct ActionList<A> {
    entries: Entries<A>,
}

impl<A> Default for ActionList<A> {
    fn default() -> Self {
        Self {
            entries: Rc::default(),
        }
    }
}

impl<A> fmt::Debug for ActionList<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionList")
            .field("len", &self.entries.borrow().len())
            .finish()
    }
}

impl<A: Action> ActionList<A> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `action` until it finishes.
    ///
    /// An already finished action is not stored, but the returned view is
    /// still valid for as long as the caller keeps the action alive.
    pub fn push(&self, action: Rc<A>) -> ActionView<A> {
        let view = ActionView::new(&action);
        if action.base().is_finished() {
            return view;
        }

        let entries = Rc::downgrade(&self.entries);
        let target = Rc::downgrade(&action);
        let finished = action
            .base()
            .finished_event()
            .subscribe(move |()| remove(&entries, &target));
        self.entries.borrow_mut().push(Entry {
            action,
            _finished: finished,
        });
        view
    }

    /// Number of actions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Returns `true` if no actions are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Gets the oldest held action.
    #[must_use]
    pub fn first(&self) -> Option<Rc<A>> {
        self.entries
            .borrow()
            .first()
            .map(|entry| entry.action.clone())
    }

    /// Gets strong references to all held actions, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Rc<A>> {
        self.entries
            .borrow()
            .iter()
            .map(|entry| entry.action.clone())
            .collect()
    }

    /// Drops the list's reference to `action`, if held.
    pub fn remove(&self, action: &Rc<A>) {
        remove(&Rc::downgrade(&self.entries), &Rc::downgrade(action));
    }

    /// Drops all held actions.
    pub fn clear(&self) {
        let entries = core::mem::take(&mut *self.entries.borrow_mut());
        drop(entries);
    }
}

fn remove<A>(entries: &Weak<RefCell<Vec<Entry<A>>>>, target: &Weak<A>) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let removed = {
        let mut entries = entries.borrow_mut();
        entries
            .iter()
            .position(|entry| Weak::ptr_eq(&Rc::downgrade(&entry.action), target))
            .map(|pos| entries.remove(pos))
    };
    // dropped outside of the borrow, since dropping an action may touch the list
    drop(removed);
}
