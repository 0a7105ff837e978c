use {
    crate::{Action, ActionIndex},
    alloc::rc::{Rc, Weak},
    core::fmt,
};

/// Non-owning handle to an action, which becomes empty once the action is
/// dropped.
///
/// A default view is empty from the start. Operations which reject their input
/// synchronously (e.g. because a buffer is full) return an empty view.
pub struct ActionView<A> {
    index: Option<ActionIndex>,
    action: Weak<A>,
}

impl<A> Default for ActionView<A> {
    fn default() -> Self {
        Self {
            index: None,
            action: Weak::new(),
        }
    }
}

impl<A> Clone for ActionView<A> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            action: self.action.clone(),
        }
    }
}

impl<A> fmt::Debug for ActionView<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionView")
            .field("alive", &(self.action.strong_count() > 0))
            .finish()
    }
}

impl<A: Action> From<&Rc<A>> for ActionView<A> {
    fn from(action: &Rc<A>) -> Self {
        Self::new(action)
    }
}

impl<A: Action> ActionView<A> {
    /// Creates a view of `action`.
    #[must_use]
    pub fn new(action: &Rc<A>) -> Self {
        Self {
            index: Some(action.base().index().clone()),
            action: Rc::downgrade(action),
        }
    }

    /// Creates an empty view.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Gets the action if it is still alive.
    #[must_use]
    pub fn get(&self) -> Option<Rc<A>> {
        self.action.upgrade()
    }

    /// Returns `true` if the action is still alive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.action.strong_count() > 0
    }

    /// Returns `true` if this view has never pointed to an action.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.index.is_none()
    }

    /// Stops the action if it is still alive.
    pub fn stop(&self) {
        if let Some(action) = self.get() {
            action.stop();
        }
    }
}

impl<A> PartialEq for ActionView<A> {
    fn eq(&self, other: &Self) -> bool {
        self.action.ptr_eq(&other.action)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{ActionBase, ActionContext},
        web_time::Instant,
    };

    struct Idle {
        base: ActionBase<Self>,
    }

    impl Action for Idle {
        fn update(&self, now: Instant) -> Instant {
            now
        }

        fn base(&self) -> &ActionBase<Self> {
            &self.base
        }
    }

    #[test]
    fn view_empties_when_action_dropped() {
        let ctx = ActionContext::default();
        let action = ctx.spawn(|base| Idle { base });
        let view = ActionView::new(&action);
        assert!(view.get().is_some());

        drop(action);
        assert!(view.get().is_none());
        assert!(!view.is_valid());
        // the view still holds the slot
        assert_eq!(1, ctx.registry().len());

        drop(view);
        assert_eq!(0, ctx.registry().len());
    }

    #[test]
    fn default_view_is_empty() {
        let view = ActionView::<Idle>::default();
        assert!(view.is_empty());
        assert!(view.get().is_none());
        view.stop();
    }
}
