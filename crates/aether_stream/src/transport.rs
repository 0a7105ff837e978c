//! Contract between pipelines and the transports which move their packets.
//!
//! Transports themselves live outside this crate. A pipeline reaches one
//! through a [`TransportWriteGate`] at its lower end.

use {
    crate::{Gate, StreamInfo, StreamWriteAction, WriteList, WriteState, WriteView},
    aether_action::{
        Action, ActionBase, ActionContext, ActionView, Event, EventSubscriber, MultiSubscription,
        StateMachine,
    },
    alloc::rc::Rc,
    bytes::Bytes,
    core::{cell::Cell, fmt},
    derive_more::{Display, Error},
    either::Either,
    log::{debug, warn},
    web_time::Instant,
};

/// Connection state of a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// [`Transport::connect`] has not been called.
    #[default]
    Disconnected,
    /// Waiting for the connection to be established.
    Connecting,
    /// Packets can be sent.
    Connected,
}

/// What a [`Transport`] can currently send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionInfo {
    /// Connection state.
    pub state: ConnectionState,
    /// Largest packet which can be sent.
    pub max_packet_size: usize,
}

/// Transport failed to establish or keep its connection.
#[derive(Debug, Display, Error)]
pub enum TransportError {
    /// Failed to connect.
    #[display("failed to connect: {_0}")]
    Connecting(#[error(not(source))] anyhow::Error),
    /// Established connection was lost.
    #[display("connection lost: {_0}")]
    Disconnected(#[error(not(source))] anyhow::Error),
}

/// Progress of a [`PacketSendAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketSendState {
    /// Waiting to be sent.
    Queued,
    /// Being sent.
    Sending,
    /// Handed to the network.
    Sent,
    /// Took too long to send.
    Timeout,
    /// Stopped before being sent.
    Stopped,
    /// Could not be sent.
    Failed,
}

impl PacketSendState {
    /// Gets the write state a stream write in this state should report.
    #[must_use]
    pub const fn write_state(self) -> WriteState {
        match self {
            Self::Queued => WriteState::Queued,
            Self::Sending => WriteState::InProgress,
            Self::Sent => WriteState::Done,
            Self::Timeout => WriteState::Timeout,
            Self::Stopped => WriteState::Stopped,
            Self::Failed => WriteState::Failed,
        }
    }

    /// Returns `true` if the send can no longer change state.
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Queued | Self::Sending)
    }
}

/// Tracks one packet handed to a [`Transport`].
///
/// The transport sets the state; the action finishes on its next update.
pub struct PacketSendAction {
    base: ActionBase<Self>,
    state: StateMachine<PacketSendState>,
}

impl fmt::Debug for PacketSendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSendAction")
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl PacketSendAction {
    /// Creates a send in `state`.
    #[must_use]
    pub fn new(context: &ActionContext, state: PacketSendState) -> Rc<Self> {
        let action = context.spawn(|base| Self {
            base,
            state: StateMachine::new(PacketSendState::Queued),
        });
        action.state.set(state);
        action
    }

    /// Gets the current state.
    #[must_use]
    pub fn state(&self) -> PacketSendState {
        self.state.get()
    }

    /// Moves to `state`, unless a final state was already reached.
    pub fn set_state(&self, state: PacketSendState) {
        if self.state.get().is_final() {
            return;
        }
        self.state.set(state);
        self.base.trigger();
    }

    /// Event emitted with the new state on every change.
    #[must_use]
    pub fn state_event(&self) -> EventSubscriber<PacketSendState> {
        self.state.changed_event()
    }
}

impl Action for PacketSendAction {
    fn update(&self, now: Instant) -> Instant {
        match self.state.acquire() {
            Some(PacketSendState::Sent) => self.base.result(),
            Some(PacketSendState::Stopped) => self.base.stop(),
            Some(PacketSendState::Timeout | PacketSendState::Failed) => self.base.error(),
            Some(PacketSendState::Queued | PacketSendState::Sending) | None => {}
        }
        now
    }

    fn base(&self) -> &ActionBase<Self> {
        &self.base
    }

    fn stop(&self) {
        self.set_state(PacketSendState::Stopped);
    }
}

/// Moves packets to and from a remote peer.
pub trait Transport: 'static {
    /// Starts connecting.
    fn connect(&self);

    /// Gets the current connection info.
    fn connection_info(&self) -> ConnectionInfo;

    /// Event emitted once the connection is established.
    fn connection_success_event(&self) -> EventSubscriber<()>;

    /// Event emitted when connecting fails or the connection is lost.
    fn connection_error_event(&self) -> EventSubscriber<TransportError>;

    /// Event emitted with every received packet and the time it arrived.
    fn receive_event(&self) -> EventSubscriber<(Bytes, Instant)>;

    /// Sends a packet.
    ///
    /// An empty view means the packet was dropped before it could be tracked.
    fn send(&self, data: Bytes, now: Instant) -> ActionView<PacketSendAction>;
}

impl<L: Transport, R: Transport> Transport for Either<L, R> {
    fn connect(&self) {
        either::for_both!(self, t => t.connect());
    }

    fn connection_info(&self) -> ConnectionInfo {
        either::for_both!(self, t => t.connection_info())
    }

    fn connection_success_event(&self) -> EventSubscriber<()> {
        either::for_both!(self, t => t.connection_success_event())
    }

    fn connection_error_event(&self) -> EventSubscriber<TransportError> {
        either::for_both!(self, t => t.connection_error_event())
    }

    fn receive_event(&self) -> EventSubscriber<(Bytes, Instant)> {
        either::for_both!(self, t => t.receive_event())
    }

    fn send(&self, data: Bytes, now: Instant) -> ActionView<PacketSendAction> {
        either::for_both!(self, t => t.send(data, now))
    }
}

/// Lower end of a pipeline, writing every element as one packet on a
/// [`Transport`].
///
/// The gate is linked and writable while the transport is connected, and
/// emits a gate update whenever that changes.
pub struct TransportWriteGate {
    context: ActionContext,
    transport: Rc<dyn Transport>,
    info: Rc<Cell<StreamInfo>>,
    out_data: Rc<Event<Bytes>>,
    gate_update: Rc<Event<()>>,
    subscriptions: MultiSubscription,
    writes: WriteList,
}

impl fmt::Debug for TransportWriteGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportWriteGate")
            .field("info", &self.info.get())
            .finish_non_exhaustive()
    }
}

fn info_of(connection: ConnectionInfo) -> StreamInfo {
    match connection.state {
        ConnectionState::Connected => StreamInfo::open(connection.max_packet_size),
        ConnectionState::Connecting | ConnectionState::Disconnected => StreamInfo::default(),
    }
}

impl TransportWriteGate {
    /// Creates a gate over `transport`.
    ///
    /// This does not connect the transport.
    #[must_use]
    pub fn new(context: &ActionContext, transport: Rc<dyn Transport>) -> Rc<Self> {
        let gate = Rc::new(Self {
            context: context.clone(),
            info: Rc::new(Cell::new(info_of(transport.connection_info()))),
            transport,
            out_data: Rc::new(Event::new()),
            gate_update: Rc::new(Event::new()),
            subscriptions: MultiSubscription::new(),
            writes: WriteList::new(),
        });

        let transport = Rc::downgrade(&gate.transport);
        let info = Rc::downgrade(&gate.info);
        let gate_update = Rc::downgrade(&gate.gate_update);
        gate.subscriptions
            .push(gate.transport.connection_success_event().subscribe({
                let (transport, info, gate_update) =
                    (transport.clone(), info.clone(), gate_update.clone());
                move |()| {
                    let (Some(transport), Some(info), Some(gate_update)) =
                        (transport.upgrade(), info.upgrade(), gate_update.upgrade())
                    else {
                        return;
                    };
                    let connection = transport.connection_info();
                    debug!(
                        "Transport connected, max packet size {}",
                        connection.max_packet_size
                    );
                    info.set(StreamInfo::open(connection.max_packet_size));
                    gate_update.emit(&());
                }
            }));
        gate.subscriptions
            .push(gate.transport.connection_error_event().subscribe(move |err| {
                let (Some(info), Some(gate_update)) = (info.upgrade(), gate_update.upgrade())
                else {
                    return;
                };
                warn!("Transport failed: {err}");
                info.set(StreamInfo::default());
                gate_update.emit(&());
            }));
        let out_data = Rc::downgrade(&gate.out_data);
        gate.subscriptions
            .push(gate.transport.receive_event().subscribe(move |(data, _)| {
                if let Some(out_data) = out_data.upgrade() {
                    out_data.emit(data);
                }
            }));
        gate
    }

    /// Gets the transport packets are sent on.
    #[must_use]
    pub const fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }
}

impl Gate for TransportWriteGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        let info = self.info.get();
        if !info.is_writable {
            warn!("Failing write of {} bytes, transport not connected", data.len());
            return self.writes.finished(&self.context, WriteState::Failed);
        }
        if data.len() > info.max_element_size {
            warn!(
                "Failing write of {} bytes, larger than max packet size {}",
                data.len(),
                info.max_element_size
            );
            return self.writes.finished(&self.context, WriteState::Failed);
        }

        let Some(packet) = self.transport.send(data, now).get() else {
            return self.writes.finished(&self.context, WriteState::Failed);
        };
        let write = StreamWriteAction::with_state(&self.context, packet.state().write_state());
        let target = Rc::downgrade(&write);
        write.hold(packet.state_event().subscribe(move |state: &PacketSendState| {
            if let Some(write) = target.upgrade() {
                write.set_state(state.write_state());
            }
        }));
        let packet_view = ActionView::new(&packet);
        write.on_stop(move || packet_view.stop());
        self.writes.push(write)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.gate_update.subscriber()
    }

    fn stream_info(&self) -> StreamInfo {
        self.info.get()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        aether_action::{ActionList, ActionProcessor},
        alloc::vec::Vec,
        assert_matches::assert_matches,
        core::cell::RefCell,
    };

    #[derive(Default)]
    struct MockTransport {
        context: ActionContext,
        info: Cell<ConnectionInfo>,
        success: Event<()>,
        error: Event<TransportError>,
        receive: Event<(Bytes, Instant)>,
        sent: RefCell<Vec<Bytes>>,
        sends: ActionList<PacketSendAction>,
    }

    impl MockTransport {
        fn new(context: &ActionContext) -> Self {
            Self {
                context: context.clone(),
                ..Default::default()
            }
        }
    }

    impl Transport for MockTransport {
        fn connect(&self) {
            self.info.set(ConnectionInfo {
                state: ConnectionState::Connected,
                max_packet_size: 64,
            });
            self.success.emit(&());
        }

        fn connection_info(&self) -> ConnectionInfo {
            self.info.get()
        }

        fn connection_success_event(&self) -> EventSubscriber<()> {
            self.success.subscriber()
        }

        fn connection_error_event(&self) -> EventSubscriber<TransportError> {
            self.error.subscriber()
        }

        fn receive_event(&self) -> EventSubscriber<(Bytes, Instant)> {
            self.receive.subscriber()
        }

        fn send(&self, data: Bytes, _: Instant) -> ActionView<PacketSendAction> {
            self.sent.borrow_mut().push(data);
            self.sends
                .push(PacketSendAction::new(&self.context, PacketSendState::Sending))
        }
    }

    #[test]
    fn writable_once_connected() {
        let processor = ActionProcessor::new();
        let transport = Rc::new(MockTransport::new(processor.context()));
        let gate = TransportWriteGate::new(processor.context(), transport.clone());

        let updates = Rc::new(Cell::new(0));
        let _sub = gate.gate_update_event().subscribe({
            let updates = updates.clone();
            move |()| updates.set(updates.get() + 1)
        });
        let early = gate.write_in(Bytes::from_static(b"early"), Instant::now());
        assert_matches!(early.get().map(|w| w.state()), Some(WriteState::Failed));

        transport.connect();
        assert_eq!(1, updates.get());
        assert_eq!(StreamInfo::open(64), gate.stream_info());

        transport.error.emit(&TransportError::Disconnected(anyhow::anyhow!("reset")));
        assert_eq!(2, updates.get());
        assert!(!gate.stream_info().is_writable);
    }

    #[test]
    fn write_follows_packet() {
        let processor = ActionProcessor::new();
        let transport = Rc::new(MockTransport::new(processor.context()));
        let gate = TransportWriteGate::new(processor.context(), transport.clone());
        transport.connect();

        let write = gate.write_in(Bytes::from_static(b"data"), Instant::now());
        assert_matches!(write.get().map(|w| w.state()), Some(WriteState::InProgress));
        assert_eq!(*transport.sent.borrow(), [Bytes::from_static(b"data")]);

        let packet = transport.sends.first().expect("packet was sent");
        packet.set_state(PacketSendState::Sent);
        assert_matches!(write.get().map(|w| w.state()), Some(WriteState::Done));

        let too_large = gate.write_in(Bytes::from(vec![0; 65]), Instant::now());
        assert_matches!(too_large.get().map(|w| w.state()), Some(WriteState::Failed));
    }

    #[test]
    fn stopping_write_stops_packet() {
        let processor = ActionProcessor::new();
        let transport = Rc::new(MockTransport::new(processor.context()));
        let gate = TransportWriteGate::new(processor.context(), transport.clone());
        transport.connect();

        let write = gate.write_in(Bytes::from_static(b"data"), Instant::now());
        write.stop();
        let packet = transport.sends.first().expect("packet was sent");
        assert_eq!(PacketSendState::Stopped, packet.state());
        assert_matches!(write.get().map(|w| w.state()), Some(WriteState::Stopped));
    }

    #[test]
    fn received_packets_are_read() {
        let processor = ActionProcessor::new();
        let transport = Rc::new(MockTransport::new(processor.context()));
        let gate = TransportWriteGate::new(processor.context(), transport.clone());

        let read = Rc::new(RefCell::new(Vec::new()));
        let _sub = gate.out_data_event().subscribe({
            let read = read.clone();
            move |data: &Bytes| read.borrow_mut().push(data.clone())
        });
        transport
            .receive
            .emit(&(Bytes::from_static(b"in"), Instant::now()));
        assert_eq!(*read.borrow(), [Bytes::from_static(b"in")]);
    }

    #[test]
    fn either_forwards_to_inner() {
        let processor = ActionProcessor::new();
        let transport: Either<MockTransport, MockTransport> =
            Either::Right(MockTransport::new(processor.context()));
        let gate = TransportWriteGate::new(processor.context(), Rc::new(transport));
        gate.transport().connect();
        assert!(gate.stream_info().is_writable);
    }
}
