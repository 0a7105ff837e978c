use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteList, WriteState, WriteView},
    aether_action::{ActionContext, Event, EventSubscriber, MultiSubscription},
    aether_proto::{
        api::{Api, ApiParser, ChildData, ProtocolContext},
        stream_api::{StreamApi, StreamId},
    },
    alloc::{
        collections::BTreeMap,
        rc::{Rc, Weak},
        vec::Vec,
    },
    bytes::Bytes,
    core::{cell::RefCell, fmt},
    log::{debug, warn},
    web_time::Instant,
};

/// Demultiplexes one byte stream into many [`StreamApiGate`]s.
///
/// Every element read from downstream is parsed as [`StreamApi`] messages, and
/// the child data of each [`StreamApi::Stream`] is read out of the sub-stream
/// with the matching [`StreamId`]. A message for an id which has no sub-stream
/// yet creates one, announced on [`SplitterGate::new_stream_event`] before the
/// data is delivered.
///
/// Writes to a sub-stream are wrapped in [`StreamApi::Stream`] messages and
/// written to the splitter's downstream gate.
pub struct SplitterGate {
    this: Weak<Self>,
    context: ActionContext,
    protocol: ProtocolContext,
    link: GateLink<Bytes, Bytes>,
    streams: RefCell<BTreeMap<StreamId, Rc<StreamApiGate>>>,
    new_stream_event: Event<Rc<StreamApiGate>>,
    subscriptions: MultiSubscription,
}

impl fmt::Debug for SplitterGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitterGate")
            .field("streams", &self.streams.borrow().keys())
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl SplitterGate {
    /// Creates an unlinked splitter with no sub-streams.
    #[must_use]
    pub fn new(context: &ActionContext) -> Rc<Self> {
        Self::with_protocol(context, ProtocolContext::new())
    }

    /// Creates an unlinked splitter which dispatches parsed messages to
    /// `protocol`.
    #[must_use]
    pub fn with_protocol(context: &ActionContext, protocol: ProtocolContext) -> Rc<Self> {
        let splitter = Rc::new_cyclic(|this: &Weak<Self>| Self {
            this: this.clone(),
            context: context.clone(),
            protocol,
            link: GateLink::new(),
            streams: RefCell::new(BTreeMap::new()),
            new_stream_event: Event::new(),
            subscriptions: MultiSubscription::new(),
        });

        let this = Rc::downgrade(&splitter);
        splitter
            .subscriptions
            .push(splitter.protocol.on_message::<StreamApi>(move |message| {
                if let Some(this) = this.upgrade() {
                    this.on_message(message);
                }
            }));
        splitter
    }

    /// Gets the context parsed messages are dispatched to.
    #[must_use]
    pub const fn protocol(&self) -> &ProtocolContext {
        &self.protocol
    }

    /// Event emitted with every sub-stream created by a read.
    #[must_use]
    pub fn new_stream_event(&self) -> EventSubscriber<Rc<StreamApiGate>> {
        self.new_stream_event.subscriber()
    }

    /// Number of open sub-streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.borrow().len()
    }

    /// Gets the sub-stream for `id`, if open.
    #[must_use]
    pub fn stream(&self, id: StreamId) -> Option<Rc<StreamApiGate>> {
        self.streams.borrow().get(&id).cloned()
    }

    /// Gets or opens the sub-stream for `id`.
    ///
    /// Opening a stream this way does not emit a new stream event.
    pub fn register_stream(&self, id: StreamId) -> Rc<StreamApiGate> {
        self.streams
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| {
                debug!("Opening stream {id}");
                Rc::new(StreamApiGate::new(id, &self.context, self.this.clone()))
            })
            .clone()
    }

    /// Closes the sub-stream for `id`.
    ///
    /// Returns `false` if it was not open.
    pub fn close_stream(&self, id: StreamId) -> bool {
        let stream = self.streams.borrow_mut().remove(&id);
        match stream {
            Some(stream) => {
                debug!("Closed stream {id}");
                stream.gate_update_event.emit(&());
                true
            }
            None => false,
        }
    }

    fn on_message(&self, message: &StreamApi) {
        let StreamApi::Stream {
            stream_id,
            child_data,
        } = message;

        let stream = self.stream(*stream_id).unwrap_or_else(|| {
            let stream = self.register_stream(*stream_id);
            self.new_stream_event.emit(&stream);
            stream
        });
        stream.out_data.emit(&child_data.to_bytes());
    }

    fn on_update(&self) {
        let streams = self.streams.borrow().values().cloned().collect::<Vec<_>>();
        for stream in streams {
            stream.gate_update_event.emit(&());
        }
    }
}

impl LinkOut for SplitterGate {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let protocol = self.protocol.clone();
        let this = self.this.clone();
        self.link.link_with_update(
            out,
            move |packet: &Bytes| {
                if let Err(err) = ApiParser::new(packet.clone()).parse::<StreamApi>(&protocol) {
                    warn!("Failed to parse packet as {}: {err}", StreamApi::NAME);
                }
            },
            move || {
                if let Some(this) = this.upgrade() {
                    this.on_update();
                }
            },
        );
    }
}

/// One logical stream of a [`SplitterGate`].
///
/// Writes to a closed stream fail.
pub struct StreamApiGate {
    id: StreamId,
    context: ActionContext,
    splitter: Weak<SplitterGate>,
    writes: WriteList,
    out_data: Event<Bytes>,
    gate_update_event: Event<()>,
}

impl fmt::Debug for StreamApiGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamApiGate")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl StreamApiGate {
    fn new(id: StreamId, context: &ActionContext, splitter: Weak<SplitterGate>) -> Self {
        Self {
            id,
            context: context.clone(),
            splitter,
            writes: WriteList::new(),
            out_data: Event::new(),
            gate_update_event: Event::new(),
        }
    }

    /// Gets the id of this stream.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// Returns `true` if this stream is still open in its splitter.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.splitter
            .upgrade()
            .and_then(|splitter| splitter.stream(self.id))
            .is_some_and(|stream| core::ptr::eq(&*stream, self))
    }
}

impl Gate for StreamApiGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        let Some(splitter) = self.splitter.upgrade().filter(|_| self.is_open()) else {
            warn!("Failing write to closed stream {}", self.id);
            return self.writes.finished(&self.context, WriteState::Failed);
        };
        let message = StreamApi::Stream {
            stream_id: self.id,
            child_data: ChildData::Bytes(data),
        };
        splitter.link.write_out(message.pack(), now)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.gate_update_event.subscriber()
    }

    fn stream_info(&self) -> StreamInfo {
        if !self.is_open() {
            return StreamInfo::default();
        }
        self.splitter.upgrade().map_or_else(StreamInfo::default, |splitter| {
            let info = splitter.link.stream_info();
            info.with_overhead(StreamApi::overhead(info.max_element_size))
        })
    }
}
