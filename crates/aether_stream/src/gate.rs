use {
    crate::StreamWriteAction,
    aether_action::{ActionView, Event, EventSubscriber, MultiSubscription},
    alloc::rc::Rc,
    core::{cell::RefCell, fmt},
    log::warn,
    web_time::Instant,
};

/// Handle to a write made through [`Gate::write_in`].
///
/// An empty view means the write was dropped before it could be tracked.
pub type WriteView = ActionView<StreamWriteAction>;

/// Type-erased [`Gate`] with the given input and output types.
pub type DynGate<In, Out> = Rc<dyn Gate<In = In, Out = Out>>;

/// What a gate can currently accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamInfo {
    /// Largest single element the gate accepts.
    pub max_element_size: usize,
    /// Whether the gate is connected to something which moves data on.
    pub is_linked: bool,
    /// Whether a write would be accepted at all.
    pub is_writable: bool,
    /// Whether a write would be accepted without piling up in a buffer.
    pub is_soft_writable: bool,
}

impl StreamInfo {
    /// Info of a gate which is connected and accepts elements up to
    /// `max_element_size` without buffering.
    #[must_use]
    pub const fn open(max_element_size: usize) -> Self {
        Self {
            max_element_size,
            is_linked: true,
            is_writable: true,
            is_soft_writable: true,
        }
    }

    /// Takes `overhead` bytes off of the element size, for gates which add
    /// framing to every element.
    #[must_use]
    pub const fn with_overhead(self, overhead: usize) -> Self {
        Self {
            max_element_size: self.max_element_size.saturating_sub(overhead),
            ..self
        }
    }
}

/// Bidirectional element of a stream pipeline.
///
/// Data flows *down* into a gate through [`Gate::write_in`], and flows back
/// *up* out of it through [`Gate::out_data_event`]. Gates are composed by
/// linking the lower end of one to another gate with [`LinkOut::link_out`],
/// usually via [`tie!`] or [`TiedStream`].
///
/// [`tie!`]: crate::tie
/// [`TiedStream`]: crate::TiedStream
pub trait Gate: 'static {
    /// Type of element written into this gate.
    type In;
    /// Type of element read out of this gate.
    type Out;

    /// Writes `data` into this gate, returning a handle to track the write.
    fn write_in(&self, data: Self::In, now: Instant) -> WriteView;

    /// Event emitted with every element read out of this gate.
    fn out_data_event(&self) -> EventSubscriber<Self::Out>;

    /// Event emitted when this gate's [`StreamInfo`] may have changed.
    fn gate_update_event(&self) -> EventSubscriber<()>;

    /// Gets what this gate can currently accept.
    fn stream_info(&self) -> StreamInfo;
}

/// Gate which passes its writes on to another gate below it.
pub trait LinkOut {
    /// Type of element this gate writes downstream.
    type WriteIn;
    /// Type of element this gate reads from downstream.
    type ReadOut;

    /// Connects the lower end of this gate to `out`, replacing any previous
    /// link.
    fn link_out(&self, out: DynGate<Self::WriteIn, Self::ReadOut>);
}

/// Lower end of a gate: the linked downstream gate plus subscriptions to it.
///
/// Gates implement [`LinkOut`] by calling [`GateLink::link`] with a handler
/// for data read from downstream, and pass their writes on through
/// [`GateLink::write_out`]. Downstream gate updates are re-emitted on this
/// link's own [`GateLink::gate_update_event`].
pub struct GateLink<W, R> {
    out: RefCell<Option<DynGate<W, R>>>,
    subscriptions: MultiSubscription,
    gate_update_event: Rc<Event<()>>,
}

impl<W, R> Default for GateLink<W, R> {
    fn default() -> Self {
        Self {
            out: RefCell::new(None),
            subscriptions: MultiSubscription::new(),
            gate_update_event: Rc::new(Event::new()),
        }
    }
}

impl<W, R> fmt::Debug for GateLink<W, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateLink")
            .field("linked", &self.out.borrow().is_some())
            .finish_non_exhaustive()
    }
}

impl<W: 'static, R: 'static> GateLink<W, R> {
    /// Creates an unlinked lower end.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Links to `out`, calling `on_data` for everything read from it.
    pub fn link(&self, out: DynGate<W, R>, on_data: impl Fn(&R) + 'static) {
        self.link_with_update(out, on_data, || {});
    }

    /// Links to `out`, calling `on_data` for everything read from it and
    /// `on_update` on every downstream gate update, before it is re-emitted.
    ///
    /// `on_update` is also called once the link is in place.
    pub fn link_with_update(
        &self,
        out: DynGate<W, R>,
        on_data: impl Fn(&R) + 'static,
        on_update: impl Fn() + 'static,
    ) {
        self.subscriptions.reset();
        self.subscriptions
            .push(out.out_data_event().subscribe(on_data));
        let on_update = Rc::new(on_update);
        let update_event = Rc::downgrade(&self.gate_update_event);
        self.subscriptions.push(out.gate_update_event().subscribe({
            let on_update = on_update.clone();
            move |()| {
                on_update();
                if let Some(event) = update_event.upgrade() {
                    event.emit(&());
                }
            }
        }));
        *self.out.borrow_mut() = Some(out);

        on_update();
        self.gate_update_event.emit(&());
    }

    /// Drops the link, if any.
    pub fn unlink(&self) {
        self.subscriptions.reset();
        let out = self.out.borrow_mut().take();
        drop(out);
        self.gate_update_event.emit(&());
    }

    /// Gets the linked downstream gate.
    #[must_use]
    pub fn out(&self) -> Option<DynGate<W, R>> {
        self.out.borrow().clone()
    }

    /// Returns `true` if a downstream gate is linked.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.out.borrow().is_some()
    }

    /// Writes `data` to the downstream gate.
    ///
    /// Without a link, the data is dropped and the returned view is empty.
    pub fn write_out(&self, data: W, now: Instant) -> WriteView {
        // clone out so that the downstream gate may relink us while writing
        let Some(out) = self.out() else {
            warn!("Dropping write to an unlinked gate");
            return WriteView::empty();
        };
        out.write_in(data, now)
    }

    /// Gets the downstream gate's info, or the default (unlinked) info.
    #[must_use]
    pub fn stream_info(&self) -> StreamInfo {
        self.out().map_or_else(StreamInfo::default, |out| out.stream_info())
    }

    /// Event emitted after every downstream gate update.
    #[must_use]
    pub fn gate_update_event(&self) -> EventSubscriber<()> {
        self.gate_update_event.subscriber()
    }

    /// Emits a gate update without one coming from downstream.
    pub fn emit_update(&self) {
        self.gate_update_event.emit(&());
    }
}

/// Creates a handler which re-emits data on `event`, for gates which pass
/// reads through unchanged.
pub fn forward_to<T: 'static>(event: &Rc<Event<T>>) -> impl Fn(&T) + 'static {
    let event = Rc::downgrade(event);
    move |data| {
        if let Some(event) = event.upgrade() {
            event.emit(data);
        }
    }
}

/// Links a chain of gates, each one to the next.
///
/// Every argument is an [`Rc`] to a gate, and is evaluated more than once.
/// Every gate but the last must implement [`LinkOut`] with the types of the
/// gate after it.
///
/// ```rust,ignore
/// tie!(buffer, crypto, transport);
/// // same as
/// crypto.link_out(transport.clone());
/// buffer.link_out(crypto.clone());
/// ```
///
/// [`Rc`]: alloc::rc::Rc
#[macro_export]
macro_rules! tie {
    ($left:expr, $right:expr $(,)?) => {{
        let out: $crate::DynGate<_, _> = $right.clone();
        $crate::LinkOut::link_out(&*$left, out);
    }};
    ($left:expr, $right:expr, $($rest:expr),+ $(,)?) => {{
        $crate::tie!($right, $($rest),+);
        $crate::tie!($left, $right);
    }};
}
