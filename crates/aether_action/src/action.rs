use {
    crate::{ActionContext, ActionIndex, Event, EventSubscriber},
    alloc::rc::{Rc, Weak},
    core::{cell::Cell, fmt},
    log::trace,
    web_time::Instant,
};

/// Unit of asynchronous work updated by an [`ActionProcessor`].
///
/// Actions are created through [`ActionContext::spawn`], which registers them
/// in the context's registry. The returned [`Rc`] is the owner: once it (and
/// every other strong reference) is dropped, the action disappears from the
/// registry and all of its [`ActionView`]s become empty.
///
/// Actions are updated through a shared reference, so any mutable state must
/// use interior mutability.
///
/// [`ActionProcessor`]: crate::ActionProcessor
/// [`ActionView`]: crate::ActionView
pub trait Action: 'static {
    /// Advances this action's state machine.
    ///
    /// Returns the next instant at which this action wants to be updated. An
    /// action with nothing scheduled returns `now`, and should use
    /// [`ActionBase::trigger`] to request an update when something changes.
    fn update(&self, now: Instant) -> Instant;

    /// Gets the shared state of this action.
    fn base(&self) -> &ActionBase<Self>
    where
        Self: Sized;

    /// Requests that this action stops.
    ///
    /// By default this finishes the action with a stop immediately.
    fn stop(&self)
    where
        Self: Sized,
    {
        self.base().stop();
    }
}

/// How an action finished, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActionStatus {
    /// Still being updated.
    #[default]
    Running,
    /// Finished successfully.
    Result,
    /// Finished with an error.
    Error,
    /// Was stopped before finishing.
    Stopped,
}

impl ActionStatus {
    /// Returns `true` if this is not [`ActionStatus::Running`].
    #[must_use]
    pub const fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// State shared by every action: registry slot, status, and outcome events.
pub struct ActionBase<A> {
    context: ActionContext,
    index: ActionIndex,
    this: Weak<A>,
    status: Cell<ActionStatus>,
    result_event: Event<A>,
    error_event: Event<A>,
    stop_event: Event<A>,
    finished_event: Event<()>,
}

impl<A> fmt::Debug for ActionBase<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionBase")
            .field("index", &self.index)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl<A> Drop for ActionBase<A> {
    fn drop(&mut self) {
        self.index.clear();
    }
}

impl<A: Action> ActionBase<A> {
    /// Gets the context this action was spawned in.
    #[must_use]
    pub const fn context(&self) -> &ActionContext {
        &self.context
    }

    /// Gets this action's registry slot.
    #[must_use]
    pub const fn index(&self) -> &ActionIndex {
        &self.index
    }

    /// Gets a weak reference to the action which owns this base.
    #[must_use]
    pub fn this(&self) -> Weak<A> {
        self.this.clone()
    }

    /// Gets how this action has finished so far.
    #[must_use]
    pub fn status(&self) -> ActionStatus {
        self.status.get()
    }

    /// Returns `true` if this action has finished in any way.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.get().is_finished()
    }

    /// Requests an update from the processor as soon as possible.
    pub fn trigger(&self) {
        self.context.trigger().trigger();
    }

    /// Finishes this action successfully.
    pub fn result(&self) {
        self.finish(ActionStatus::Result, &self.result_event);
    }

    /// Finishes this action with an error.
    pub fn error(&self) {
        self.finish(ActionStatus::Error, &self.error_event);
    }

    /// Finishes this action as stopped.
    pub fn stop(&self) {
        self.finish(ActionStatus::Stopped, &self.stop_event);
    }

    /// Emits a successful result without finishing, for actions which produce
    /// more than one result over their lifetime.
    pub fn result_repeat(&self) {
        if self.is_finished() {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.result_event.emit(&this);
        }
    }

    fn finish(&self, status: ActionStatus, event: &Event<A>) {
        if self.is_finished() {
            trace!("Ignoring {status:?} of already finished action");
            return;
        }
        self.status.set(status);
        self.index.set_finished();
        if let Some(this) = self.this.upgrade() {
            event.emit(&this);
        }
        self.finished_event.emit(&());
        self.trigger();
    }

    /// Event emitted with the action when it finishes successfully, or on
    /// every [`ActionBase::result_repeat`].
    #[must_use]
    pub fn result_event(&self) -> EventSubscriber<A> {
        self.result_event.subscriber()
    }

    /// Event emitted with the action when it finishes with an error.
    #[must_use]
    pub fn error_event(&self) -> EventSubscriber<A> {
        self.error_event.subscriber()
    }

    /// Event emitted with the action when it is stopped.
    #[must_use]
    pub fn stop_event(&self) -> EventSubscriber<A> {
        self.stop_event.subscriber()
    }

    /// Event emitted after any of the result, error, or stop events.
    #[must_use]
    pub fn finished_event(&self) -> EventSubscriber<()> {
        self.finished_event.subscriber()
    }
}

impl ActionContext {
    /// Creates and registers an action.
    ///
    /// `make` receives the [`ActionBase`] which the new action must return from
    /// [`Action::base`]. The processor is triggered so the action gets its
    /// first update.
    pub fn spawn<A: Action>(&self, make: impl FnOnce(ActionBase<A>) -> A) -> Rc<A> {
        let index = self.registry().insert();
        let action = Rc::new_cyclic(|this: &Weak<A>| {
            let erased: Weak<dyn Action> = this.clone();
            index.set_action(erased);
            make(ActionBase {
                context: self.clone(),
                index: index.clone(),
                this: this.clone(),
                status: Cell::new(ActionStatus::Running),
                result_event: Event::new(),
                error_event: Event::new(),
                stop_event: Event::new(),
                finished_event: Event::new(),
            })
        });
        self.trigger().trigger();
        action
    }
}
