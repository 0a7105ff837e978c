use {
    crate::{Event, EventSubscriber},
    core::{cell::Cell, fmt},
};

/// Current state of an action plus a flag recording whether it changed since
/// the action last looked at it.
///
/// Actions typically [`StateMachine::set`] a state from an event handler, then
/// react to it in their next update via [`StateMachine::acquire`].
pub struct StateMachine<S> {
    state: Cell<S>,
    changed: Cell<bool>,
    changed_event: Event<S>,
}

impl<S: Copy + fmt::Debug> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state.get())
            .field("changed", &self.changed.get())
            .finish()
    }
}

impl<S: Copy + PartialEq + 'static> StateMachine<S> {
    /// Creates a state machine starting in `state`, unchanged.
    #[must_use]
    pub fn new(state: S) -> Self {
        Self {
            state: Cell::new(state),
            changed: Cell::new(false),
            changed_event: Event::new(),
        }
    }

    /// Gets the current state.
    #[must_use]
    pub fn get(&self) -> S {
        self.state.get()
    }

    /// Moves to `state`.
    ///
    /// If this differs from the current state, the machine is marked as
    /// changed and the changed event is emitted.
    pub fn set(&self, state: S) {
        if self.state.get() == state {
            return;
        }
        self.state.set(state);
        self.changed.set(true);
        self.changed_event.emit(&state);
    }

    /// Takes the changed flag, returning the current state if it was set.
    #[must_use]
    pub fn acquire(&self) -> Option<S> {
        self.changed.replace(false).then(|| self.state.get())
    }

    /// Event emitted with the new state on every change.
    #[must_use]
    pub fn changed_event(&self) -> EventSubscriber<S> {
        self.changed_event.subscriber()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::rc::Rc, core::cell::RefCell};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
    }

    #[test]
    fn acquire_takes_change_once() {
        let state = StateMachine::new(Light::Red);
        assert_eq!(None, state.acquire());

        state.set(Light::Green);
        assert_eq!(Some(Light::Green), state.acquire());
        assert_eq!(None, state.acquire());
        assert_eq!(Light::Green, state.get());
    }

    #[test]
    fn same_state_is_not_a_change() {
        let state = StateMachine::new(Light::Red);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _sub = state.changed_event().subscribe({
            let seen = seen.clone();
            move |s| seen.borrow_mut().push(*s)
        });

        state.set(Light::Red);
        state.set(Light::Green);
        state.set(Light::Green);
        assert_eq!(*seen.borrow(), [Light::Green]);
    }
}
