//! Reliable, ordered byte stream on top of a lossy packet stream.
//!
//! A [`SafeStream`] sits above any gate which may drop or duplicate packets,
//! and below gates which need every write delivered exactly once, in order.
//! See [`aether_proto::safe_stream`] for the protocol itself.

mod data;
mod receiving;
mod sending;

pub use {data::*, receiving::*, sending::*};
use {
    crate::{
        DynGate, Gate, GateLink, LinkOut, StreamInfo, StreamWriteAction, WriteList, WriteState,
        WriteView,
    },
    aether_action::{Action, ActionContext, Event, EventSubscriber, MultiSubscription},
    aether_proto::{
        api::{Api, ApiParser, ProtocolContext},
        config::{ConfigError, SafeStreamConfig},
        ring::OffsetRange,
        safe_stream::SafeStreamApi,
    },
    alloc::rc::{Rc, Weak},
    bytes::Bytes,
    core::fmt,
    log::{debug, error, trace, warn},
    web_time::Instant,
};

/// Gate which turns the lossy packets of the gate below into a reliable,
/// ordered byte stream.
///
/// Every write is buffered by a [`SafeStreamSendingAction`] and finishes with
/// a result once the peer confirmed all of it. Packets read from downstream
/// are parsed as [`SafeStreamApi`] messages: data goes to a
/// [`SafeStreamReceivingAction`], which reads it out of this gate in order,
/// and confirmations and repeat requests go to the sender.
///
/// If the receiver gives up on missing data, the stream is broken and
/// [`SafeStream::error_event`] is emitted.
pub struct SafeStream {
    context: ActionContext,
    protocol: ProtocolContext,
    sending: Rc<SafeStreamSendingAction>,
    receiving: Rc<SafeStreamReceivingAction>,
    link: GateLink<Bytes, Bytes>,
    out_data: Event<Bytes>,
    error_event: Event<()>,
    writes: WriteList,
    packet_writes: MultiSubscription,
    subscriptions: MultiSubscription,
}

impl fmt::Debug for SafeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeStream")
            .field("sending", &self.sending)
            .field("receiving", &self.receiving)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl SafeStream {
    /// Creates an unlinked safe stream.
    ///
    /// # Errors
    ///
    /// Errors if `config` is not valid.
    pub fn new(context: &ActionContext, config: SafeStreamConfig) -> Result<Rc<Self>, ConfigError> {
        config.validate()?;
        let stream = Rc::new(Self {
            context: context.clone(),
            protocol: ProtocolContext::new(),
            sending: SafeStreamSendingAction::new(context, config),
            receiving: SafeStreamReceivingAction::new(context, config),
            link: GateLink::new(),
            out_data: Event::new(),
            error_event: Event::new(),
            writes: WriteList::new(),
            packet_writes: MultiSubscription::new(),
            subscriptions: MultiSubscription::new(),
        });

        let this = Rc::downgrade(&stream);
        stream
            .subscriptions
            .push(stream.sending.send_event().subscribe(move |message| {
                if let Some(this) = this.upgrade() {
                    this.write_data(message);
                }
            }));

        let this = Rc::downgrade(&stream);
        stream.subscriptions.push(
            stream
                .receiving
                .send_event()
                .subscribe(move |(packet, now)| {
                    if let Some(this) = this.upgrade() {
                        this.write_control(packet.clone(), *now);
                    }
                }),
        );

        let this = Rc::downgrade(&stream);
        stream
            .subscriptions
            .push(stream.receiving.receive_event().subscribe(move |data| {
                if let Some(this) = this.upgrade() {
                    this.out_data.emit(data);
                }
            }));

        let this = Rc::downgrade(&stream);
        stream
            .subscriptions
            .push(stream.receiving.base().error_event().subscribe(move |_| {
                error!("Safe stream broke, peer data is missing");
                if let Some(this) = this.upgrade() {
                    this.error_event.emit(&());
                }
            }));

        let this = Rc::downgrade(&stream);
        stream.subscriptions.push(
            stream
                .protocol
                .on_message::<SafeStreamApi>(move |message| {
                    if let Some(this) = this.upgrade() {
                        this.on_message(message);
                    }
                }),
        );
        Ok(stream)
    }

    /// Gets the sending half.
    #[must_use]
    pub const fn sending(&self) -> &Rc<SafeStreamSendingAction> {
        &self.sending
    }

    /// Gets the receiving half.
    #[must_use]
    pub const fn receiving(&self) -> &Rc<SafeStreamReceivingAction> {
        &self.receiving
    }

    /// Event emitted when the stream breaks because the peer's data could not
    /// be recovered.
    #[must_use]
    pub fn error_event(&self) -> EventSubscriber<()> {
        self.error_event.subscriber()
    }

    /// Asks the peer which offset it expects next.
    pub fn request_report(&self, now: Instant) -> WriteView {
        self.link.write_out(SafeStreamApi::RequestReport.pack(), now)
    }

    /// Tells the peer this side is closing.
    pub fn close(&self, now: Instant) -> WriteView {
        self.link.write_out(SafeStreamApi::Close.pack(), now)
    }

    fn write_data(&self, message: &DataMessage) {
        let write = self.link.write_out(message.message.pack(), message.time);
        let Some(write) = write.get() else {
            self.sending.report_write_error(message.range);
            return;
        };
        if report_write(&self.sending, message.range, write.state()) {
            return;
        }

        let sending = Rc::downgrade(&self.sending);
        let range = message.range;
        self.packet_writes
            .push(write.state_event().subscribe(move |state| {
                if let Some(sending) = sending.upgrade() {
                    report_write(&sending, range, *state);
                }
            }));
    }

    fn write_control(&self, packet: Bytes, now: Instant) {
        if self.link.write_out(packet, now).is_empty() {
            trace!("Control packet was not written");
        }
    }

    fn on_message(&self, message: &SafeStreamApi) {
        match message {
            SafeStreamApi::Confirm { offset } => self.sending.confirm(*offset),
            SafeStreamApi::RequestRepeat { offset } => self.sending.request_repeat(*offset),
            SafeStreamApi::Send { offset, data } => {
                self.receiving.receive_send(*offset, data.clone());
            }
            SafeStreamApi::Repeat {
                repeat_count,
                offset,
                data,
            } => {
                self.receiving
                    .receive_repeat(*offset, *repeat_count, data.clone());
            }
            SafeStreamApi::RequestReport => {
                let report = SafeStreamApi::PutReport {
                    offset: self.receiving.frontier(),
                };
                self.write_control(report.pack(), Instant::now());
            }
            SafeStreamApi::PutReport { offset } => {
                debug!("Peer expects offset {offset} next");
            }
            SafeStreamApi::Close => debug!("Peer closed the stream"),
        }
    }
}

/// Forwards a final write state to the sender, returning `true` if the state
/// was final.
fn report_write(sending: &SafeStreamSendingAction, range: OffsetRange, state: WriteState) -> bool {
    match state {
        WriteState::Queued | WriteState::InProgress => false,
        WriteState::Done => true,
        WriteState::Stopped => {
            sending.report_write_stopped(range);
            true
        }
        WriteState::Timeout | WriteState::Failed | WriteState::Panic => {
            sending.report_write_error(range);
            true
        }
    }
}

fn payload_write_state(state: SendingDataState) -> Option<WriteState> {
    match state {
        SendingDataState::Waiting | SendingDataState::Sending => None,
        SendingDataState::Done => Some(WriteState::Done),
        SendingDataState::Stopped => Some(WriteState::Stopped),
        SendingDataState::Failed => Some(WriteState::Failed),
    }
}

impl Gate for SafeStream {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, _: Instant) -> WriteView {
        let len = data.len();
        let payload = self.sending.send_data(data);
        let Some(payload_action) = payload.get() else {
            warn!("Failing write of {len} bytes which the sender rejected");
            return self.writes.finished(&self.context, WriteState::Failed);
        };

        let write = StreamWriteAction::with_state(&self.context, WriteState::InProgress);
        let target: Weak<StreamWriteAction> = Rc::downgrade(&write);
        write.hold(payload_action.state_event().subscribe(move |state| {
            let (Some(write), Some(state)) = (target.upgrade(), payload_write_state(*state)) else {
                return;
            };
            write.set_state(state);
        }));
        write.on_stop(move || payload.stop());
        self.writes.push(write)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        let out = self.link.stream_info();
        let capacity = self.sending.config().buffer_capacity;
        let free = capacity.saturating_sub(self.sending.buffered_size());
        StreamInfo {
            max_element_size: capacity,
            is_linked: out.is_linked,
            is_writable: true,
            is_soft_writable: out.is_writable && free > 0,
        }
    }
}

impl LinkOut for SafeStream {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let protocol = self.protocol.clone();
        let sending = Rc::downgrade(&self.sending);
        let out_info = Rc::downgrade(&out);
        self.link.link_with_update(
            out,
            move |packet: &Bytes| {
                if let Err(err) = ApiParser::new(packet.clone()).parse::<SafeStreamApi>(&protocol) {
                    warn!("Failed to parse packet as {}: {err}", SafeStreamApi::NAME);
                }
            },
            move || {
                let (Some(sending), Some(out)) = (sending.upgrade(), out_info.upgrade()) else {
                    return;
                };
                sending.set_max_data_size(out.stream_info().max_element_size);
            },
        );
    }
}
