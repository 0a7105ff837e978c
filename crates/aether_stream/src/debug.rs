use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteView},
    aether_action::{Event, EventSubscriber},
    alloc::{rc::Rc, string::String},
    bytes::Bytes,
    log::debug,
    web_time::Instant,
};

/// Logs every buffer passing through in either direction.
#[derive(Debug)]
pub struct DebugGate {
    name: String,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Bytes>>,
}

impl DebugGate {
    /// Creates a gate which tags its log lines with `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
        })
    }
}

impl Gate for DebugGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        debug!("[{}] write {} bytes: {data:x}", self.name, data.len());
        self.link.write_out(data, now)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        self.link.stream_info()
    }
}

impl LinkOut for DebugGate {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let name = self.name.clone();
        let out_data = Rc::downgrade(&self.out_data);
        self.link.link(out, move |data: &Bytes| {
            debug!("[{name}] read {} bytes: {data:x}", data.len());
            if let Some(out_data) = out_data.upgrade() {
                out_data.emit(data);
            }
        });
        debug!("[{}] linked", self.name);
    }
}
