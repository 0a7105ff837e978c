use {
    crate::WriteView,
    aether_action::{
        Action, ActionBase, ActionContext, ActionList, EventSubscriber, MultiSubscription,
        StateMachine, Subscription,
    },
    alloc::{boxed::Box, rc::Rc},
    core::{cell::RefCell, fmt},
    log::trace,
    web_time::Instant,
};

/// Progress of a [`StreamWriteAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteState {
    /// Accepted, but waiting before being passed on.
    Queued,
    /// Passed on, waiting for the lower layers to finish.
    InProgress,
    /// Written successfully.
    Done,
    /// Gave up waiting for the write to finish.
    Timeout,
    /// Stopped before it finished.
    Stopped,
    /// Could not be written.
    Failed,
    /// A lower layer failed in an unexpected way.
    Panic,
}

impl WriteState {
    /// Returns `true` if the write can no longer change state.
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }
}

/// Tracks one write through a gate pipeline.
///
/// Whoever accepts a write sets its [`WriteState`]; the action finishes on its
/// next update, mapping [`WriteState::Done`] to a result,
/// [`WriteState::Stopped`] to a stop, and every other final state to an error.
///
/// Gates which pass a write on usually [`follow`](StreamWriteAction::follow)
/// the write returned by the gate below them.
pub struct StreamWriteAction {
    base: ActionBase<Self>,
    state: StateMachine<WriteState>,
    on_stop: RefCell<Option<Box<dyn Fn()>>>,
    subscriptions: MultiSubscription,
}

impl fmt::Debug for StreamWriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriteAction")
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl StreamWriteAction {
    /// Creates a [`WriteState::Queued`] write.
    #[must_use]
    pub fn new(context: &ActionContext) -> Rc<Self> {
        Self::with_state(context, WriteState::Queued)
    }

    /// Creates a write in `state`.
    ///
    /// A final `state` finishes the action on its first update.
    #[must_use]
    pub fn with_state(context: &ActionContext, state: WriteState) -> Rc<Self> {
        let action = context.spawn(|base| Self {
            base,
            state: StateMachine::new(WriteState::Queued),
            on_stop: RefCell::new(None),
            subscriptions: MultiSubscription::new(),
        });
        action.state.set(state);
        action
    }

    /// Gets the current state.
    #[must_use]
    pub fn state(&self) -> WriteState {
        self.state.get()
    }

    /// Moves to `state`.
    ///
    /// Once a final state is reached, further changes are ignored.
    pub fn set_state(&self, state: WriteState) {
        let current = self.state.get();
        if current.is_final() {
            if current != state {
                trace!("Ignoring {state:?} of write which is already {current:?}");
            }
            return;
        }
        self.state.set(state);
        self.base.trigger();
    }

    /// Event emitted with the new state on every change.
    #[must_use]
    pub fn state_event(&self) -> EventSubscriber<WriteState> {
        self.state.changed_event()
    }

    /// Replaces what [`Action::stop`] does for this write.
    ///
    /// Without a handler, stopping marks the write [`WriteState::Stopped`].
    pub fn on_stop(&self, f: impl Fn() + 'static) {
        *self.on_stop.borrow_mut() = Some(Box::new(f));
    }

    /// Keeps `subscription` alive for as long as this write is.
    pub fn hold(&self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Mirrors the state of `other` from now on, and stops `other` when this
    /// write is stopped.
    ///
    /// Following an empty view fails this write.
    pub fn follow(self: &Rc<Self>, other: &WriteView) {
        let Some(other) = other.get() else {
            self.set_state(WriteState::Failed);
            return;
        };

        let this = Rc::downgrade(self);
        self.hold(other.state_event().subscribe(move |state| {
            if let Some(this) = this.upgrade() {
                this.set_state(*state);
            }
        }));
        let other_view = WriteView::new(&other);
        self.on_stop(move || other_view.stop());
        self.set_state(other.state());
    }
}

impl Action for StreamWriteAction {
    fn update(&self, now: Instant) -> Instant {
        match self.state.acquire() {
            Some(WriteState::Done) => self.base.result(),
            Some(WriteState::Stopped) => self.base.stop(),
            Some(WriteState::Timeout | WriteState::Failed | WriteState::Panic) => {
                self.base.error();
            }
            Some(WriteState::Queued | WriteState::InProgress) | None => {}
        }
        now
    }

    fn base(&self) -> &ActionBase<Self> {
        &self.base
    }

    fn stop(&self) {
        let on_stop = self.on_stop.borrow_mut().take();
        match on_stop {
            Some(on_stop) => on_stop(),
            None => self.set_state(WriteState::Stopped),
        }
    }
}

/// Owns writes handed out by a gate until they finish.
///
/// Used by gates which create their own [`StreamWriteAction`]s, e.g. to report
/// a write that failed before reaching the layer below.
#[derive(Debug, Default)]
pub struct WriteList {
    writes: ActionList<StreamWriteAction>,
}

impl WriteList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `write` alive until it finishes.
    pub fn push(&self, write: Rc<StreamWriteAction>) -> WriteView {
        self.writes.push(write)
    }

    /// Creates a write which is already in `state`.
    pub fn finished(&self, context: &ActionContext, state: WriteState) -> WriteView {
        self.push(StreamWriteAction::with_state(context, state))
    }

    /// Creates a write which follows `other`.
    pub fn follow(&self, context: &ActionContext, other: &WriteView) -> WriteView {
        let write = StreamWriteAction::with_state(context, WriteState::InProgress);
        write.follow(other);
        self.push(write)
    }

    /// Number of writes which have not finished yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns `true` if every write has finished.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
