#![expect(missing_docs, reason = "testing")]
#![cfg(test)]

use {
    aether_action::{Action, ActionContext, ActionProcessor, ActionStatus, Event, EventSubscriber},
    aether_proto::config::SafeStreamConfig,
    aether_stream::{
        Gate, StreamInfo, WriteList, WriteState, WriteView, safe_stream::SafeStream, tie,
    },
    bytes::Bytes,
    core::{
        cell::{Cell, RefCell},
        time::Duration,
    },
    std::{collections::VecDeque, rc::Rc},
    web_time::Instant,
};

type Inbox = Rc<RefCell<VecDeque<(Instant, Bytes)>>>;

/// Delivery conditions of one direction of a simulated link.
struct Conditions {
    latency: Duration,
    /// Extra delay added to a packet, in steps of this, so later packets may
    /// overtake earlier ones.
    jitter: Duration,
    /// Every packet whose sequence number is a multiple of this arrives twice.
    duplicate_every: Option<usize>,
    /// Picks packets to lose by their 1-based sequence number.
    drop_if: Box<dyn Fn(usize) -> bool>,
}

impl Conditions {
    fn new(latency: Duration, drop_if: impl Fn(usize) -> bool + 'static) -> Self {
        Self {
            latency,
            jitter: Duration::ZERO,
            duplicate_every: None,
            drop_if: Box::new(drop_if),
        }
    }

    fn with_reordering(self, jitter: Duration, duplicate_every: usize) -> Self {
        Self {
            jitter,
            duplicate_every: Some(duplicate_every),
            ..self
        }
    }

    fn delay(&self, seq: usize) -> Duration {
        let steps = u32::try_from(seq * 7 % 5).expect("step count is below 5");
        self.latency + self.jitter * steps
    }
}

/// One end of a simulated link.
struct LinkEnd {
    context: ActionContext,
    conditions: Conditions,
    max_packet_size: usize,
    sent: Cell<usize>,
    dropped: Cell<usize>,
    duplicated: Cell<usize>,
    inbox: Inbox,
    peer_inbox: Inbox,
    out_data: Event<Bytes>,
    gate_update: Event<()>,
    writes: WriteList,
}

impl LinkEnd {
    fn pair(context: &ActionContext, a: Conditions, b: Conditions) -> (Rc<Self>, Rc<Self>) {
        let a_inbox = Inbox::default();
        let b_inbox = Inbox::default();
        let end = |inbox: &Inbox, peer_inbox: &Inbox, conditions: Conditions| {
            Rc::new(Self {
                context: context.clone(),
                conditions,
                max_packet_size: 1024,
                sent: Cell::new(0),
                dropped: Cell::new(0),
                duplicated: Cell::new(0),
                inbox: inbox.clone(),
                peer_inbox: peer_inbox.clone(),
                out_data: Event::new(),
                gate_update: Event::new(),
                writes: WriteList::new(),
            })
        };
        (end(&a_inbox, &b_inbox, a), end(&b_inbox, &a_inbox, b))
    }

    fn deliver(&self, arrival: Instant, data: Bytes) {
        let mut inbox = self.peer_inbox.borrow_mut();
        let pos = inbox.partition_point(|(at, _)| *at <= arrival);
        inbox.insert(pos, (arrival, data));
    }

    /// Reads out every packet which has arrived by `now`.
    fn pump(&self, now: Instant) {
        loop {
            let packet = {
                let mut inbox = self.inbox.borrow_mut();
                match inbox.front() {
                    Some((arrival, _)) if *arrival <= now => inbox.pop_front(),
                    _ => None,
                }
            };
            let Some((_, packet)) = packet else {
                break;
            };
            self.out_data.emit(&packet);
        }
    }
}

impl Gate for LinkEnd {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        let seq = self.sent.get() + 1;
        self.sent.set(seq);
        if (self.conditions.drop_if)(seq) {
            self.dropped.set(self.dropped.get() + 1);
            return self.writes.finished(&self.context, WriteState::Done);
        }
        let arrival = now + self.conditions.delay(seq);
        if self
            .conditions
            .duplicate_every
            .is_some_and(|every| seq % every == 0)
        {
            self.duplicated.set(self.duplicated.get() + 1);
            self.deliver(arrival + self.conditions.latency / 2, data.clone());
        }
        self.deliver(arrival, data);
        self.writes.finished(&self.context, WriteState::Done)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.gate_update.subscriber()
    }

    fn stream_info(&self) -> StreamInfo {
        StreamInfo::open(self.max_packet_size)
    }
}

fn collect(stream: &SafeStream) -> (Rc<RefCell<Vec<u8>>>, aether_action::Subscription) {
    let read = Rc::new(RefCell::new(Vec::new()));
    let sub = stream.out_data_event().subscribe({
        let read = read.clone();
        move |data: &Bytes| read.borrow_mut().extend_from_slice(data)
    });
    (read, sub)
}

struct Transfer {
    drained: bool,
    max_in_flight: usize,
}

/// Writes every message into `a`, then runs the link in 10 ms ticks until `b`
/// has read all of it and every write finished.
fn transfer(
    processor: &ActionProcessor,
    a: &SafeStream,
    a_end: &LinkEnd,
    b: &SafeStream,
    b_end: &LinkEnd,
    messages: &[Bytes],
) -> Transfer {
    let (read, _read_sub) = collect(b);
    let window_size = a.sending().config().window_size;

    let start = Instant::now();
    let results = Rc::new(Cell::new(0));
    let mut writes = Vec::new();
    let mut result_subs = Vec::new();
    for message in messages {
        let write = a
            .write_in(message.clone(), start)
            .get()
            .expect("write should be accepted");
        result_subs.push(write.base().result_event().subscribe({
            let results = results.clone();
            move |_| results.set(results.get() + 1)
        }));
        writes.push(write);
    }
    let expected = messages.concat();

    let mut now = start;
    let mut max_in_flight = 0;
    for _ in 0..1000 {
        a_end.pump(now);
        b_end.pump(now);
        processor.update(now);
        let in_flight = a.sending().in_flight();
        assert!(
            in_flight <= window_size,
            "{in_flight} bytes in flight, window is {window_size}"
        );
        max_in_flight = max_in_flight.max(in_flight);
        if results.get() == messages.len() && read.borrow().len() >= expected.len() {
            break;
        }
        now += Duration::from_millis(10);
    }

    // exactly once, in order
    assert_eq!(expected, *read.borrow());
    assert_eq!(messages.len(), results.get());
    for write in &writes {
        assert_eq!(ActionStatus::Result, write.base().status());
    }
    Transfer {
        drained: a.sending().buffered_size() == 0,
        max_in_flight,
    }
}

#[test]
fn lossy_link_delivers_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let processor = ActionProcessor::new();
    let config = SafeStreamConfig::default()
        .with_max_data_size(100)
        .with_wait_confirm_timeout(Duration::from_millis(400))
        .with_send_repeat_timeout(Duration::from_millis(400));

    // 100 ms each way plus up to 40 ms of jitter, every tenth packet lost and
    // every seventh one arriving twice
    let conditions = || {
        Conditions::new(Duration::from_millis(100), |seq| seq % 10 == 3)
            .with_reordering(Duration::from_millis(10), 7)
    };
    let (a_end, b_end) = LinkEnd::pair(processor.context(), conditions(), conditions());
    let a = SafeStream::new(processor.context(), config).expect("config should be valid");
    let b = SafeStream::new(processor.context(), config).expect("config should be valid");
    tie!(a, a_end);
    tie!(b, b_end);

    let messages = (0..9)
        .map(|i| Bytes::from(format!("message #{i}, ").repeat(8 + i)))
        .collect::<Vec<_>>();
    let outcome = transfer(&processor, &a, &a_end, &b, &b_end, &messages);

    assert!(outcome.drained);
    assert!(a_end.dropped.get() > 0);
    assert!(a_end.duplicated.get() > 0);
}

#[test]
fn default_timeouts_survive_loss_and_reordering() {
    let _ = env_logger::builder().is_test(true).try_init();
    let processor = ActionProcessor::new();
    let config = SafeStreamConfig::default().with_max_data_size(100);

    let conditions = || {
        Conditions::new(Duration::from_millis(100), |seq| seq % 10 == 3)
            .with_reordering(Duration::from_millis(10), 7)
    };
    let (a_end, b_end) = LinkEnd::pair(processor.context(), conditions(), conditions());
    let a = SafeStream::new(processor.context(), config).expect("config should be valid");
    let b = SafeStream::new(processor.context(), config).expect("config should be valid");
    tie!(a, a_end);
    tie!(b, b_end);

    // more than fits in the window at once
    let messages = (0..9u8)
        .map(|i| Bytes::from(vec![i; 2000]))
        .collect::<Vec<_>>();
    let outcome = transfer(&processor, &a, &a_end, &b, &b_end, &messages);

    assert!(outcome.drained);
    assert!(outcome.max_in_flight > config.window_size / 2);
    assert!(a_end.dropped.get() > 0);
    assert!(b_end.duplicated.get() > 0);
}

#[test]
fn unrecoverable_data_breaks_stream() {
    let _ = env_logger::builder().is_test(true).try_init();
    let processor = ActionProcessor::new();
    let config = SafeStreamConfig::default()
        .with_max_data_size(100)
        .with_max_repeat_count(2)
        .with_wait_confirm_timeout(Duration::from_millis(400))
        .with_send_repeat_timeout(Duration::from_millis(400));

    // the first slice never arrives, neither do any repeats of it
    let (a_end, b_end) = LinkEnd::pair(
        processor.context(),
        Conditions::new(Duration::from_millis(100), |seq| seq == 1 || seq > 3),
        Conditions::new(Duration::from_millis(100), |_| false),
    );
    let a = SafeStream::new(processor.context(), config).expect("config should be valid");
    let b = SafeStream::new(processor.context(), config).expect("config should be valid");
    tie!(a, a_end);
    tie!(b, b_end);
    let (read, _read_sub) = collect(&b);

    let broken = Rc::new(Cell::new(false));
    let _broken_sub = b.error_event().subscribe({
        let broken = broken.clone();
        move |()| broken.set(true)
    });

    let start = Instant::now();
    let write = a
        .write_in(Bytes::from(vec![1; 250]), start)
        .get()
        .expect("write should be accepted");

    let mut now = start;
    for _ in 0..300 {
        a_end.pump(now);
        b_end.pump(now);
        processor.update(now);
        now += Duration::from_millis(10);
    }

    assert!(broken.get());
    assert!(read.borrow().is_empty());
    assert_eq!(ActionStatus::Error, write.base().status());
}
