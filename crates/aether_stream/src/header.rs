use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteView, forward_to},
    aether_action::{Event, EventSubscriber},
    alloc::rc::Rc,
    bytes::{Bytes, BytesMut},
    web_time::Instant,
};

/// Prefixes every write with a fixed header.
///
/// Reads pass through unchanged.
#[derive(Debug)]
pub struct AddHeaderGate {
    header: Bytes,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Bytes>>,
}

impl AddHeaderGate {
    /// Creates a gate which prefixes writes with `header`.
    #[must_use]
    pub fn new(header: Bytes) -> Rc<Self> {
        Rc::new(Self {
            header,
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
        })
    }

    /// Gets the header prefixed to writes.
    #[must_use]
    pub const fn header(&self) -> &Bytes {
        &self.header
    }
}

impl Gate for AddHeaderGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        let mut buf = BytesMut::with_capacity(self.header.len() + data.len());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&data);
        self.link.write_out(buf.freeze(), now)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        self.link.stream_info().with_overhead(self.header.len())
    }
}

impl LinkOut for AddHeaderGate {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        self.link.link(out, forward_to(&self.out_data));
    }
}
