use {
    super::{SendDataBuffer, SendingDataAction, SendingDataState},
    aether_action::{Action, ActionBase, ActionContext, ActionList, ActionView, Event, EventSubscriber},
    aether_proto::{
        config::SafeStreamConfig,
        ring::{OffsetRange, RingIndex},
        safe_stream::{SafeStreamApi, SendingChunkList},
    },
    alloc::rc::Rc,
    bytes::Bytes,
    core::{
        cell::{Cell, RefCell},
        fmt,
    },
    log::{debug, error, trace, warn},
    web_time::Instant,
};

/// Data message the sender wants written downstream.
#[derive(Debug, Clone)]
pub struct DataMessage {
    /// [`SafeStreamApi::Send`] or [`SafeStreamApi::Repeat`].
    pub message: SafeStreamApi,
    /// Offsets carried by the message.
    pub range: OffsetRange,
    /// When the message was created.
    pub time: Instant,
}

/// Sending half of a safe stream.
///
/// Payloads are buffered until the peer confirms them. On every update, as
/// much buffered data as the window allows is sliced into data messages and
/// emitted on [`SafeStreamSendingAction::send_event`]; the owner writes them
/// downstream and reports back if a write did not go through.
///
/// Data which stays unconfirmed for the wait confirm timeout is sent again,
/// as is data the peer asks to have repeated. Once a range has been repeated
/// more than the configured maximum, it is abandoned and its payloads fail.
/// The sender itself keeps running.
pub struct SafeStreamSendingAction {
    base: ActionBase<Self>,
    config: SafeStreamConfig,
    last_confirmed: Cell<RingIndex>,
    next_to_add: Cell<RingIndex>,
    last_sent: Cell<RingIndex>,
    max_data_size: Cell<usize>,
    buffer: RefCell<SendDataBuffer>,
    chunks: RefCell<SendingChunkList>,
    payloads: ActionList<SendingDataAction>,
    send_event: Event<DataMessage>,
}

impl fmt::Debug for SafeStreamSendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeStreamSendingAction")
            .field("last_confirmed", &self.last_confirmed.get())
            .field("last_sent", &self.last_sent.get())
            .field("next_to_add", &self.next_to_add.get())
            .field("max_data_size", &self.max_data_size.get())
            .field("in_flight", &self.chunks.borrow().len())
            .finish_non_exhaustive()
    }
}

impl SafeStreamSendingAction {
    /// Creates a sender with nothing buffered.
    ///
    /// `config` should already be [validated](SafeStreamConfig::validate).
    #[must_use]
    pub fn new(context: &ActionContext, config: SafeStreamConfig) -> Rc<Self> {
        context.spawn(|base| Self {
            base,
            config,
            last_confirmed: Cell::new(RingIndex(0)),
            next_to_add: Cell::new(RingIndex(0)),
            last_sent: Cell::new(RingIndex(0)),
            max_data_size: Cell::new(config.max_data_size),
            buffer: RefCell::new(SendDataBuffer::default()),
            chunks: RefCell::new(SendingChunkList::new()),
            payloads: ActionList::new(),
            send_event: Event::new(),
        })
    }

    /// Gets the configuration this sender was created with.
    #[must_use]
    pub const fn config(&self) -> &SafeStreamConfig {
        &self.config
    }

    /// Oldest offset which the peer has not confirmed.
    #[must_use]
    pub fn last_confirmed(&self) -> RingIndex {
        self.last_confirmed.get()
    }

    /// Offset the next buffered payload will start at.
    #[must_use]
    pub fn next_to_add(&self) -> RingIndex {
        self.next_to_add.get()
    }

    /// Offset the next data message will start at.
    #[must_use]
    pub fn last_sent(&self) -> RingIndex {
        self.last_sent.get()
    }

    /// Number of bytes between the oldest unconfirmed offset and the end of
    /// the buffer.
    #[must_use]
    pub fn buffered_size(&self) -> usize {
        usize::from(self.last_confirmed.get().distance(self.next_to_add.get()))
    }

    /// Number of bytes sent but not yet confirmed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        usize::from(self.last_confirmed.get().distance(self.last_sent.get()))
    }

    /// Largest number of bytes put in one data message.
    #[must_use]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size.get()
    }

    /// Event emitted with every data message which should be written.
    #[must_use]
    pub fn send_event(&self) -> EventSubscriber<DataMessage> {
        self.send_event.subscriber()
    }

    /// Buffers `data` for sending.
    ///
    /// Returns an empty view if `data` is empty, or if it does not fit in the
    /// buffer.
    pub fn send_data(&self, data: Bytes) -> ActionView<SendingDataAction> {
        if data.is_empty() {
            warn!("Rejecting empty payload");
            return ActionView::empty();
        }
        let buffered = self.buffered_size();
        if buffered + data.len() > self.config.buffer_capacity {
            warn!(
                "Rejecting payload of {} bytes, {buffered} / {} bytes buffered",
                data.len(),
                self.config.buffer_capacity
            );
            return ActionView::empty();
        }

        let begin = self.next_to_add.get();
        let len = data.len();
        let payload = SendingDataAction::new(self.base.context(), len, self.base.this());
        self.buffer
            .borrow_mut()
            .push(begin, data, payload.clone());
        self.next_to_add.set(begin.advance(len));
        trace!("Buffered {len} bytes at {begin}");
        self.base.trigger();
        self.payloads.push(payload)
    }

    /// Handles the peer confirming every offset up to and including `offset`.
    ///
    /// Confirmations outside of the window are ignored.
    pub fn confirm(&self, offset: RingIndex) {
        let origin = self.last_confirmed.get();
        let end = offset.clockwise(1);
        if origin.dist_to(end) <= 0 {
            trace!("Ignoring stale confirmation of {offset}");
            return;
        }
        let confirmed = usize::from(origin.distance(end));
        if confirmed > self.config.window_size || confirmed > self.buffered_size() {
            warn!(
                "Ignoring confirmation of {offset} outside of the window starting at {origin}"
            );
            return;
        }

        self.chunks.borrow_mut().remove_up_to(origin, end);
        let done = self.buffer.borrow_mut().confirm(origin, end);
        self.last_confirmed.set(end);
        if origin.distance(self.last_sent.get()) < origin.distance(end) {
            self.last_sent.set(end);
        }
        trace!("Peer confirmed up to {offset}, {} payloads done", done.len());
        for payload in done {
            payload.set_state(SendingDataState::Done);
        }
        self.base.trigger();
    }

    /// Handles the peer asking for everything from `offset` on to be sent
    /// again.
    pub fn request_repeat(&self, offset: RingIndex) {
        let origin = self.last_confirmed.get();
        if origin.distance(offset) >= origin.distance(self.last_sent.get()) {
            trace!("Ignoring repeat request for {offset} which was not sent");
            return;
        }
        debug!("Peer requested repeat from {offset}");
        self.last_sent.set(offset);
        self.base.trigger();
    }

    /// Reports that the write carrying `range` was stopped.
    pub fn report_write_stopped(&self, range: OffsetRange) {
        debug!("Write of {range:?} was stopped");
        self.drop_range(range, SendingDataState::Stopped);
    }

    /// Reports that the write carrying `range` failed.
    pub fn report_write_error(&self, range: OffsetRange) {
        warn!("Write of {range:?} failed");
        self.drop_range(range, SendingDataState::Failed);
    }

    /// Fits data messages into a downstream element size of
    /// `max_element_size`.
    pub fn set_max_data_size(&self, max_element_size: usize) {
        if max_element_size == 0 {
            return;
        }
        let overhead = SafeStreamApi::data_overhead(max_element_size);
        let size = max_element_size
            .saturating_sub(overhead)
            .min(self.config.max_data_size)
            .max(1);
        if self.max_data_size.replace(size) != size {
            debug!("Max data size is now {size}");
            self.base.trigger();
        }
    }

    pub(super) fn remove_unsent(&self, payload: &SendingDataAction) -> bool {
        let removed = self.buffer.borrow_mut().remove_compact(payload);
        let Some(len) = removed else {
            return false;
        };
        let shift = u16::try_from(len).expect("buffered payload should fit in the ring");
        self.next_to_add
            .set(self.next_to_add.get().counter_clockwise(shift));
        debug!("Removed unsent payload of {len} bytes");
        true
    }

    fn drop_range(&self, range: OffsetRange, state: SendingDataState) {
        let origin = self.last_confirmed.get();
        self.chunks.borrow_mut().remove(range);
        let removed = self.buffer.borrow_mut().remove_range(origin, range);
        for (payload_range, payload) in removed {
            self.chunks.borrow_mut().remove(payload_range);
            payload.set_state(state);
        }
        self.base.trigger();
    }

    fn rewind_timed_out(&self, now: Instant) {
        let front = self.chunks.borrow().front().copied();
        let Some(front) = front else {
            return;
        };
        if now < front.send_time + self.config.wait_confirm_timeout {
            return;
        }
        let origin = self.last_confirmed.get();
        if origin.distance(front.begin) < origin.distance(self.last_sent.get()) {
            debug!("No confirmation for {:?}, sending again", front.range());
            self.last_sent.set(front.begin);
        }
    }

    fn send_next(&self, now: Instant) -> bool {
        let origin = self.last_confirmed.get();
        let from = self.last_sent.get();
        let max = self.max_data_size.get();
        if from == self.next_to_add.get()
            || usize::from(origin.distance(from)) + max > self.config.window_size
        {
            return false;
        }

        let slice = self.buffer.borrow().slice(origin, from, max);
        let Some(slice) = slice else {
            self.last_sent.set(self.next_to_add.get());
            return false;
        };
        let range = slice.range;
        let repeat_count = self.chunks.borrow_mut().register(range, now);
        self.last_sent.set(range.end);

        if repeat_count > self.config.max_repeat_count {
            error!(
                "Abandoning {range:?} after {} repeats",
                self.config.max_repeat_count
            );
            self.drop_range(range, SendingDataState::Failed);
            return true;
        }

        for payload in &slice.actions {
            if payload.state() == SendingDataState::Waiting {
                payload.set_state(SendingDataState::Sending);
            }
        }
        let message = if repeat_count == 0 {
            SafeStreamApi::Send {
                offset: range.begin,
                data: slice.data,
            }
        } else {
            SafeStreamApi::Repeat {
                repeat_count,
                offset: range.begin,
                data: slice.data,
            }
        };
        trace!("Sending {range:?}, repeat {repeat_count}");
        self.send_event.emit(&DataMessage {
            message,
            range,
            time: now,
        });
        true
    }
}

impl Action for SafeStreamSendingAction {
    fn update(&self, now: Instant) -> Instant {
        self.rewind_timed_out(now);
        while self.send_next(now) {}

        let next = self
            .chunks
            .borrow()
            .front()
            .map(|front| front.send_time + self.config.wait_confirm_timeout);
        next.filter(|next| *next > now).unwrap_or(now)
    }

    fn base(&self) -> &ActionBase<Self> {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        aether_action::{ActionProcessor, ActionStatus, Subscription},
        alloc::vec::Vec,
        assert_matches::assert_matches,
    };

    fn config() -> SafeStreamConfig {
        SafeStreamConfig::default()
            .with_buffer_capacity(40)
            .with_window_size(20)
            .with_max_data_size(10)
            .with_max_repeat_count(2)
    }

    fn sent(sender: &SafeStreamSendingAction) -> (Rc<RefCell<Vec<DataMessage>>>, Subscription) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let sub = sender.send_event().subscribe({
            let sent = sent.clone();
            move |message: &DataMessage| sent.borrow_mut().push(message.clone())
        });
        (sent, sub)
    }

    fn ranges(sent: &RefCell<Vec<DataMessage>>) -> Vec<(u16, u16)> {
        sent.borrow()
            .iter()
            .map(|message| (message.range.begin.0, message.range.end.0))
            .collect()
    }

    #[test]
    fn rejects_payload_over_capacity() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        assert!(!sender.send_data(Bytes::from(vec![0; 30])).is_empty());
        assert!(sender.send_data(Bytes::from(vec![0; 11])).is_empty());
        assert!(sender.send_data(Bytes::new()).is_empty());
        assert_eq!(30, sender.buffered_size());
    }

    #[test]
    fn window_limits_in_flight() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (sent, _sub) = sent(&sender);
        let _payload = sender.send_data(Bytes::from(vec![1; 35]));

        let now = Instant::now();
        processor.update(now);
        assert_eq!(ranges(&sent), [(0, 10), (10, 20)]);
        assert_eq!(20, sender.in_flight());

        sender.confirm(RingIndex(9));
        processor.update(now);
        assert_eq!(ranges(&sent), [(0, 10), (10, 20), (20, 30)]);
    }

    #[test]
    fn confirmed_payloads_finish() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (_sent, _sub) = sent(&sender);
        let first = sender.send_data(Bytes::from_static(b"abcd"));
        let second = sender.send_data(Bytes::from_static(b"efgh"));
        processor.update(Instant::now());

        sender.confirm(RingIndex(5));
        let state = |view: &ActionView<SendingDataAction>| view.get().map(|p| p.state());
        assert_eq!(Some(SendingDataState::Done), state(&first));
        assert_eq!(Some(SendingDataState::Sending), state(&second));

        // stale and far away confirmations change nothing
        sender.confirm(RingIndex(5));
        sender.confirm(RingIndex(1000));
        assert_eq!(RingIndex(6), sender.last_confirmed());
    }

    #[test]
    fn timeout_repeats_then_abandons() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (sent, _sub) = sent(&sender);
        let payload = sender
            .send_data(Bytes::from_static(b"data"))
            .get()
            .expect("payload should be accepted");

        let mut now = Instant::now();
        for _ in 0..4 {
            processor.update(now);
            now += sender.config().wait_confirm_timeout;
        }

        let repeats = sent
            .borrow()
            .iter()
            .map(|message| match message.message {
                SafeStreamApi::Send { .. } => 0,
                SafeStreamApi::Repeat { repeat_count, .. } => repeat_count,
                _ => unreachable!(),
            })
            .collect::<Vec<_>>();
        assert_eq!(repeats, [0, 1, 2]);
        assert_eq!(SendingDataState::Failed, payload.state());
        assert_eq!(ActionStatus::Error, payload.base().status());
    }

    #[test]
    fn repeat_request_rewinds() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (sent, _sub) = sent(&sender);
        let _payload = sender.send_data(Bytes::from(vec![1; 20]));
        processor.update(Instant::now());

        sender.request_repeat(RingIndex(10));
        sender.request_repeat(RingIndex(30));
        processor.update(Instant::now());
        assert_eq!(ranges(&sent), [(0, 10), (10, 20), (10, 20)]);
    }

    #[test]
    fn stopping_unsent_payload_compacts() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (sent, _sub) = sent(&sender);
        let _a = sender.send_data(Bytes::from_static(b"aa"));
        let b = sender
            .send_data(Bytes::from_static(b"bb"))
            .get()
            .expect("payload should be accepted");
        let _c = sender.send_data(Bytes::from_static(b"cc"));

        b.stop();
        assert_eq!(RingIndex(4), sender.next_to_add());
        processor.update(Instant::now());
        let sent = sent.borrow();
        assert_matches!(
            &sent[0].message,
            SafeStreamApi::Send { data, .. } if &data[..] == b"aacc"
        );
        assert_eq!(ActionStatus::Stopped, b.base().status());
    }

    #[test]
    fn sending_payload_refuses_stop() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (_sent, _sub) = sent(&sender);
        let payload = sender.send_data(Bytes::from_static(b"abc"));
        processor.update(Instant::now());

        payload.stop();
        assert_eq!(
            Some(SendingDataState::Sending),
            payload.get().map(|p| p.state())
        );
    }

    #[test]
    fn failed_write_fails_payload() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        let (sent, _sub) = sent(&sender);
        let payload = sender.send_data(Bytes::from_static(b"abc"));
        processor.update(Instant::now());

        let range = sent.borrow()[0].range;
        sender.report_write_error(range);
        assert_eq!(
            Some(SendingDataState::Failed),
            payload.get().map(|p| p.state())
        );
        assert_eq!(0, sender.chunks.borrow().len());
    }

    #[test]
    fn max_data_size_follows_downstream() {
        let processor = ActionProcessor::new();
        let sender = SafeStreamSendingAction::new(processor.context(), config());
        sender.set_max_data_size(1024);
        assert_eq!(10, sender.max_data_size());
        sender.set_max_data_size(12);
        assert_eq!(12 - SafeStreamApi::data_overhead(12), sender.max_data_size());
    }
}
