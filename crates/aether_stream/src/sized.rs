use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteList, WriteState, WriteView},
    aether_action::{ActionContext, Event, EventSubscriber},
    aether_proto::api::put,
    alloc::{rc::Rc, vec::Vec},
    bytes::{Bytes, BytesMut},
    core::cell::RefCell,
    derive_more::{Display, Error},
    log::{trace, warn},
    octs::{BufTooShortOr, Read, VarInt},
    web_time::Instant,
};

/// Largest number of bytes [`SizedPacketGate`] adds to a packet.
pub const SIZED_PACKET_OVERHEAD: usize = 4;

/// Largest packet whose length prefix fits in [`SIZED_PACKET_OVERHEAD`] bytes.
pub const MAX_SIZED_PACKET_LEN: usize = (1 << 28) - 1;

/// Length prefix read by a [`DataPacketCollector`] is not valid.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum CollectError {
    /// Length prefix does not fit in a `usize`.
    #[display("length prefix too large")]
    LengthTooLarge,
    /// Length prefix is larger than the collector accepts.
    #[display("packet of {len} bytes is larger than {max}")]
    PacketTooLarge {
        /// Announced length.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },
}

/// Reassembles length-prefixed packets out of arbitrarily split fragments.
#[derive(Debug, Clone)]
pub struct DataPacketCollector {
    buf: BytesMut,
    max_packet_len: usize,
}

impl Default for DataPacketCollector {
    fn default() -> Self {
        Self::new(MAX_SIZED_PACKET_LEN)
    }
}

impl DataPacketCollector {
    /// Creates an empty collector which rejects packets longer than
    /// `max_packet_len`.
    #[must_use]
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_packet_len,
        }
    }

    /// Number of bytes received but not yet returned as a packet.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends a fragment.
    pub fn push(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
    }

    /// Takes the next complete packet, if one has been fully received.
    ///
    /// # Errors
    ///
    /// Errors if the next length prefix is invalid, after which the contents
    /// of the collector can't be trusted and should be [cleared].
    ///
    /// [cleared]: DataPacketCollector::clear
    pub fn next_packet(&mut self) -> Result<Option<Bytes>, CollectError> {
        let mut header = &self.buf[..];
        let len = match header.read::<VarInt<usize>>() {
            Ok(VarInt(len)) => len,
            Err(BufTooShortOr::TooShort) => return Ok(None),
            Err(BufTooShortOr::Or(_)) => return Err(CollectError::LengthTooLarge),
        };
        if len > self.max_packet_len {
            return Err(CollectError::PacketTooLarge {
                len,
                max: self.max_packet_len,
            });
        }

        let header_len = self.buf.len() - header.len();
        if header.len() < len {
            return Ok(None);
        }
        drop(self.buf.split_to(header_len));
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Drops everything received so far.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Frames packets over a byte stream which may split or join them, by
/// prefixing every write with its length.
///
/// Writes longer than the gate's max packet length fail, since the peer's
/// collector would reject them.
#[derive(Debug)]
pub struct SizedPacketGate {
    context: ActionContext,
    max_packet_len: usize,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Bytes>>,
    collector: Rc<RefCell<DataPacketCollector>>,
    writes: WriteList,
}

impl SizedPacketGate {
    /// Creates an unlinked gate accepting packets up to
    /// [`MAX_SIZED_PACKET_LEN`].
    #[must_use]
    pub fn new(context: &ActionContext) -> Rc<Self> {
        Self::with_max_packet_len(context, MAX_SIZED_PACKET_LEN)
    }

    /// Creates an unlinked gate which writes and reads packets up to
    /// `max_packet_len` bytes long.
    ///
    /// `max_packet_len` is clamped to [`MAX_SIZED_PACKET_LEN`].
    #[must_use]
    pub fn with_max_packet_len(context: &ActionContext, max_packet_len: usize) -> Rc<Self> {
        let max_packet_len = max_packet_len.min(MAX_SIZED_PACKET_LEN);
        Rc::new(Self {
            context: context.clone(),
            max_packet_len,
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
            collector: Rc::new(RefCell::new(DataPacketCollector::new(max_packet_len))),
            writes: WriteList::new(),
        })
    }

    /// Longest packet this gate writes or reads.
    #[must_use]
    pub const fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }
}

impl Gate for SizedPacketGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        if data.len() > self.max_packet_len {
            warn!(
                "Failing write of {} bytes, longer than {}",
                data.len(),
                self.max_packet_len
            );
            return self.writes.finished(&self.context, WriteState::Failed);
        }
        let mut buf = BytesMut::with_capacity(SIZED_PACKET_OVERHEAD + data.len());
        put(&mut buf, &VarInt(data.len()));
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
        let info = self.link.stream_info().with_overhead(SIZED_PACKET_OVERHEAD);
        StreamInfo {
            max_element_size: info.max_element_size.min(self.max_packet_len),
            ..info
        }
    }
}

impl LinkOut for SizedPacketGate {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let collector = self.collector.clone();
        let out_data = Rc::downgrade(&self.out_data);
        self.link.link(out, move |fragment: &Bytes| {
            let packets = {
                let mut collector = collector.borrow_mut();
                collector.push(fragment);
                let mut packets = Vec::new();
                loop {
                    match collector.next_packet() {
                        Ok(Some(packet)) => packets.push(packet),
                        Ok(None) => break,
                        Err(err) => {
                            warn!("Dropping {} buffered bytes: {err}", collector.buffered());
                            collector.clear();
                            break;
                        }
                    }
                }
                packets
            };
            trace!("Collected {} packets", packets.len());

            let Some(out_data) = out_data.upgrade() else {
                return;
            };
            for packet in &packets {
                out_data.emit(packet);
            }
        });
    }
}
