use {
    aether_action::{Action, ActionBase, ActionContext, Event, EventSubscriber},
    aether_proto::{
        api::PacketBuilder,
        config::SafeStreamConfig,
        ring::RingIndex,
        safe_stream::{ReceivingChunk, ReceivingChunkList, SafeStreamApi},
    },
    alloc::{rc::Rc, vec::Vec},
    bytes::Bytes,
    core::{
        cell::{Cell, RefCell},
        fmt,
        time::Duration,
    },
    log::{debug, error, trace, warn},
    web_time::Instant,
};

#[derive(Debug, Clone, Copy)]
struct ExpectedChunk {
    offset: RingIndex,
    repeat_count: u16,
}

/// Receiving half of a safe stream.
///
/// Data messages may arrive in any order, and more than once. They are stored
/// until they join up with the delivery frontier, then emitted in order on
/// [`SafeStreamReceivingAction::receive_event`] and confirmed to the peer.
/// Holes in front of stored data are reported to the peer with repeat
/// requests.
///
/// Replies to the peer are batched into one packet per update and emitted on
/// [`SafeStreamReceivingAction::send_event`].
///
/// If a hole is still missing after the configured maximum number of repeat
/// requests, the action finishes with an error and ignores everything after.
pub struct SafeStreamReceivingAction {
    base: ActionBase<Self>,
    config: SafeStreamConfig,
    frontier: Cell<RingIndex>,
    chunks: RefCell<ReceivingChunkList>,
    expected: RefCell<Vec<ExpectedChunk>>,
    queued_confirm: Cell<Option<RingIndex>>,
    queued_repeats: RefCell<Vec<RingIndex>>,
    last_confirm_check: Cell<Option<Instant>>,
    last_repeat_check: Cell<Option<Instant>>,
    failed: Cell<bool>,
    receive_event: Event<Bytes>,
    send_event: Event<(Bytes, Instant)>,
}

impl fmt::Debug for SafeStreamReceivingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeStreamReceivingAction")
            .field("frontier", &self.frontier.get())
            .field("stored", &self.chunks.borrow().len())
            .field("failed", &self.failed.get())
            .finish_non_exhaustive()
    }
}

fn elapsed(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.is_none_or(|last| now >= last + interval)
}

impl SafeStreamReceivingAction {
    /// Creates a receiver expecting offset 0 next.
    #[must_use]
    pub fn new(context: &ActionContext, config: SafeStreamConfig) -> Rc<Self> {
        context.spawn(|base| Self {
            base,
            config,
            frontier: Cell::new(RingIndex(0)),
            chunks: RefCell::new(ReceivingChunkList::new()),
            expected: RefCell::new(Vec::new()),
            queued_confirm: Cell::new(None),
            queued_repeats: RefCell::new(Vec::new()),
            last_confirm_check: Cell::new(None),
            last_repeat_check: Cell::new(None),
            failed: Cell::new(false),
            receive_event: Event::new(),
            send_event: Event::new(),
        })
    }

    /// Next offset to be delivered.
    #[must_use]
    pub fn frontier(&self) -> RingIndex {
        self.frontier.get()
    }

    /// Number of chunks stored ahead of the frontier.
    #[must_use]
    pub fn stored_chunks(&self) -> usize {
        self.chunks.borrow().len()
    }

    /// Event emitted with data delivered in order.
    #[must_use]
    pub fn receive_event(&self) -> EventSubscriber<Bytes> {
        self.receive_event.subscriber()
    }

    /// Event emitted with packets of replies for the peer.
    #[must_use]
    pub fn send_event(&self) -> EventSubscriber<(Bytes, Instant)> {
        self.send_event.subscriber()
    }

    /// Handles a [`SafeStreamApi::Send`].
    pub fn receive_send(&self, offset: RingIndex, data: Bytes) {
        self.receive(offset, data, 0);
    }

    /// Handles a [`SafeStreamApi::Repeat`].
    pub fn receive_repeat(&self, offset: RingIndex, repeat_count: u16, data: Bytes) {
        self.receive(offset, data, repeat_count);
    }

    fn receive(&self, offset: RingIndex, data: Bytes, repeat_count: u16) {
        if self.base.is_finished() || data.is_empty() {
            return;
        }
        if data.len() > self.config.window_size {
            warn!(
                "Dropping {} bytes of data at {offset}, larger than the window of {}",
                data.len(),
                self.config.window_size
            );
            return;
        }
        let frontier = self.frontier.get();
        let end = offset.advance(data.len());

        if frontier.dist_to(end) <= 0 {
            if repeat_count == 0 {
                warn!("Dropping stale data at {offset}, already delivered up to {frontier}");
            } else {
                // our confirmation was lost, so the peer keeps repeating
                debug!("Confirming again after stale repeat of {offset}");
                self.queued_confirm.set(Some(frontier.counter_clockwise(1)));
                self.base.trigger();
            }
            return;
        }

        let (offset, data) = if frontier.dist_to(offset) < 0 {
            let skip = usize::from(offset.distance(frontier));
            (frontier, data.slice(skip..))
        } else {
            (offset, data)
        };
        if usize::from(frontier.distance(end)) > self.config.window_size {
            warn!("Dropping data at {offset} beyond the window starting at {frontier}");
            return;
        }

        let chunk = ReceivingChunk {
            offset,
            data,
            repeat_count,
        };
        if self.chunks.borrow_mut().add(frontier, chunk) {
            trace!("Stored data at {offset}, repeat {repeat_count}");
            self.base.trigger();
        } else {
            warn!("Dropping duplicate data at {offset}");
        }
    }

    fn check_completed_chains(&self, now: Instant) {
        if !elapsed(
            self.last_confirm_check.get(),
            self.config.send_confirm_timeout,
            now,
        ) {
            return;
        }
        let frontier = self.frontier.get();
        let Some(data) = self.chunks.borrow_mut().pop_completed(frontier) else {
            return;
        };

        let frontier = frontier.advance(data.len());
        self.frontier.set(frontier);
        self.expected
            .borrow_mut()
            .retain(|expected| frontier.dist_to(expected.offset) >= 0);
        self.last_confirm_check.set(Some(now));
        self.queued_confirm.set(Some(frontier.counter_clockwise(1)));
        trace!("Delivering {} bytes, frontier now {frontier}", data.len());
        self.receive_event.emit(&data);
    }

    fn check_missed_offset(&self, now: Instant) {
        if !elapsed(
            self.last_repeat_check.get(),
            self.config.send_repeat_timeout,
            now,
        ) {
            return;
        }
        let missing = self.chunks.borrow().missing(self.frontier.get());
        if missing.is_empty() {
            self.expected.borrow_mut().clear();
            return;
        }
        self.last_repeat_check.set(Some(now));

        let mut expected = self.expected.borrow_mut();
        let mut next = Vec::with_capacity(missing.len());
        for gap in missing {
            let repeat_count = expected
                .iter()
                .find(|expected| expected.offset == gap.begin)
                .map_or(0, |expected| expected.repeat_count)
                + 1;
            if repeat_count > self.config.max_repeat_count {
                error!(
                    "Data at {} still missing after {} repeat requests",
                    gap.begin, self.config.max_repeat_count
                );
                self.failed.set(true);
                return;
            }
            debug!("Requesting repeat of {gap:?}, attempt {repeat_count}");
            next.push(ExpectedChunk {
                offset: gap.begin,
                repeat_count,
            });
            self.queued_repeats.borrow_mut().push(gap.begin);
        }
        *expected = next;
    }

    fn make_response(&self, now: Instant) {
        let confirm = self.queued_confirm.take();
        let repeats = self.queued_repeats.take();
        if confirm.is_none() && repeats.is_empty() {
            return;
        }

        let mut packet = PacketBuilder::new();
        if let Some(offset) = confirm {
            packet.push(&SafeStreamApi::Confirm { offset });
        }
        for offset in repeats {
            packet.push(&SafeStreamApi::RequestRepeat { offset });
        }
        self.send_event.emit(&(packet.build(), now));
    }

    fn next_update(&self, now: Instant) -> Instant {
        let chunks = self.chunks.borrow();
        let Some(first) = chunks.iter().next() else {
            return now;
        };
        let deadline = if first.offset == self.frontier.get() {
            self.last_confirm_check
                .get()
                .map(|last| last + self.config.send_confirm_timeout)
        } else {
            self.last_repeat_check
                .get()
                .map(|last| last + self.config.send_repeat_timeout)
        };
        deadline.filter(|deadline| *deadline > now).unwrap_or(now)
    }
}

impl Action for SafeStreamReceivingAction {
    fn update(&self, now: Instant) -> Instant {
        self.check_completed_chains(now);
        self.check_missed_offset(now);
        if self.failed.get() {
            self.base.error();
            return now;
        }
        self.make_response(now);
        self.next_update(now)
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
        aether_proto::api::ApiParser,
    };

    fn config() -> SafeStreamConfig {
        SafeStreamConfig::default().with_max_repeat_count(2)
    }

    struct Harness {
        processor: ActionProcessor,
        receiver: Rc<SafeStreamReceivingAction>,
        delivered: Rc<RefCell<Vec<u8>>>,
        replies: Rc<RefCell<Vec<SafeStreamApi>>>,
        _subs: [Subscription; 2],
    }

    fn harness() -> Harness {
        let processor = ActionProcessor::new();
        let receiver = SafeStreamReceivingAction::new(processor.context(), config());
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let replies = Rc::new(RefCell::new(Vec::new()));
        let subs = [
            receiver.receive_event().subscribe({
                let delivered = delivered.clone();
                move |data: &Bytes| delivered.borrow_mut().extend_from_slice(data)
            }),
            receiver.send_event().subscribe({
                let replies = replies.clone();
                move |(packet, _): &(Bytes, Instant)| {
                    let messages = ApiParser::new(packet.clone())
                        .collect::<SafeStreamApi>()
                        .expect("reply should be valid");
                    replies.borrow_mut().extend(messages);
                }
            }),
        ];
        Harness {
            processor,
            receiver,
            delivered,
            replies,
            _subs: subs,
        }
    }

    #[test]
    fn joins_out_of_order_data() {
        let h = harness();
        let now = Instant::now();
        h.receiver
            .receive_send(RingIndex(3), Bytes::from_static(b"def"));
        h.processor.update(now);
        assert!(h.delivered.borrow().is_empty());
        assert_eq!(*h.replies.borrow(), [SafeStreamApi::RequestRepeat {
            offset: RingIndex(0)
        }]);

        h.receiver
            .receive_repeat(RingIndex(0), 1, Bytes::from_static(b"abc"));
        h.processor.update(now);
        assert_eq!(&b"abcdef"[..], &h.delivered.borrow()[..]);
        assert_eq!(RingIndex(6), h.receiver.frontier());
        assert_eq!(
            Some(&SafeStreamApi::Confirm {
                offset: RingIndex(5)
            }),
            h.replies.borrow().last()
        );
    }

    #[test]
    fn partly_delivered_data_is_trimmed() {
        let h = harness();
        let now = Instant::now();
        h.receiver
            .receive_send(RingIndex(0), Bytes::from_static(b"abc"));
        h.processor.update(now);
        h.receiver
            .receive_repeat(RingIndex(1), 1, Bytes::from_static(b"bcde"));
        h.processor
            .update(now + h.receiver.config.send_confirm_timeout);
        assert_eq!(&b"abcde"[..], &h.delivered.borrow()[..]);
    }

    #[test]
    fn stale_repeat_is_confirmed_again() {
        let h = harness();
        let now = Instant::now();
        h.receiver
            .receive_send(RingIndex(0), Bytes::from_static(b"abc"));
        h.processor.update(now);
        h.replies.borrow_mut().clear();

        h.receiver
            .receive_send(RingIndex(0), Bytes::from_static(b"abc"));
        h.processor.update(now);
        assert!(h.replies.borrow().is_empty());

        h.receiver
            .receive_repeat(RingIndex(0), 1, Bytes::from_static(b"abc"));
        h.processor.update(now);
        assert_eq!(*h.replies.borrow(), [SafeStreamApi::Confirm {
            offset: RingIndex(2)
        }]);
        assert_eq!(&b"abc"[..], &h.delivered.borrow()[..]);
    }

    #[test]
    fn data_beyond_window_is_dropped() {
        let h = harness();
        let far = h.receiver.config.window_size;
        h.receiver
            .receive_send(RingIndex(0).advance(far), Bytes::from_static(b"x"));
        assert_eq!(0, h.receiver.stored_chunks());
    }

    #[test]
    fn oversized_data_is_dropped() {
        let h = harness();
        h.receiver
            .receive_send(RingIndex(0), Bytes::from(vec![0; 70_000]));
        h.receiver
            .receive_repeat(RingIndex(0), 1, Bytes::from(vec![0; 70_000]));
        h.processor.update(Instant::now());
        assert_eq!(0, h.receiver.stored_chunks());
        assert!(h.delivered.borrow().is_empty());
        assert_eq!(RingIndex(0), h.receiver.frontier());
    }

    #[test]
    fn unfilled_hole_fails_receiver() {
        let h = harness();
        let mut now = Instant::now();
        h.receiver
            .receive_send(RingIndex(10), Bytes::from_static(b"late"));
        for _ in 0..3 {
            h.processor.update(now);
            now += h.receiver.config.send_repeat_timeout;
        }

        assert_eq!(ActionStatus::Error, h.receiver.base().status());
        let requests = h
            .replies
            .borrow()
            .iter()
            .filter(|message| matches!(message, SafeStreamApi::RequestRepeat { .. }))
            .count();
        assert_eq!(2, requests);
    }
}
