use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteList, WriteState, WriteView},
    aether_action::{ActionContext, Event, EventSubscriber},
    alloc::rc::Rc,
    bytes::{Bytes, BytesMut},
    core::{fmt, marker::PhantomData},
    log::warn,
    octs::{Decode, Encode, EncodeLen, Read},
    web_time::Instant,
};

/// Turns typed values into bytes on the way down, and bytes back into typed
/// values on the way up.
///
/// Writes are encoded as `In`; a write which fails to encode fails
/// immediately. Reads are decoded as `Out`; reads which fail to decode are
/// logged and dropped.
pub struct SerializeGate<In, Out> {
    context: ActionContext,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Out>>,
    writes: WriteList,
    _phantom: PhantomData<fn(In)>,
}

impl<In, Out> fmt::Debug for SerializeGate<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializeGate")
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl<In, Out> SerializeGate<In, Out>
where
    In: Encode + EncodeLen + 'static,
    In::Error: fmt::Debug,
    Out: Decode + 'static,
    Out::Error: fmt::Debug,
{
    /// Creates an unlinked gate.
    #[must_use]
    pub fn new(context: &ActionContext) -> Rc<Self> {
        Rc::new(Self {
            context: context.clone(),
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
            writes: WriteList::new(),
            _phantom: PhantomData,
        })
    }
}

impl<In, Out> Gate for SerializeGate<In, Out>
where
    In: Encode + EncodeLen + 'static,
    In::Error: fmt::Debug,
    Out: Decode + 'static,
    Out::Error: fmt::Debug,
{
    type In = In;
    type Out = Out;

    fn write_in(&self, data: In, now: Instant) -> WriteView {
        let mut buf = BytesMut::with_capacity(data.encode_len());
        if let Err(err) = data.encode(&mut buf) {
            warn!("Failed to encode write: {err:?}");
            return self.writes.finished(&self.context, WriteState::Failed);
        }
        self.link.write_out(buf.freeze(), now)
    }

    fn out_data_event(&self) -> EventSubscriber<Out> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        self.link.stream_info()
    }
}

impl<In, Out> LinkOut for SerializeGate<In, Out>
where
    Out: Decode + 'static,
    Out::Error: fmt::Debug,
{
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let out_data = Rc::downgrade(&self.out_data);
        self.link.link(out, move |data: &Bytes| {
            let mut src = data.clone();
            let value = match src.read::<Out>() {
                Ok(value) => value,
                Err(err) => {
                    warn!("Dropping read which failed to decode: {err:?}");
                    return;
                }
            };
            if !src.is_empty() {
                warn!("{} trailing bytes after decoded read", src.len());
            }
            if let Some(out_data) = out_data.upgrade() {
                out_data.emit(&value);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::EchoGate,
        aether_action::ActionProcessor,
        alloc::vec::Vec,
        core::cell::RefCell,
    };

    #[test]
    fn encodes_down_and_decodes_up() {
        let processor = ActionProcessor::new();
        let gate = SerializeGate::<u32, u32>::new(processor.context());
        let echo = EchoGate::new(processor.context(), 64);
        crate::tie!(gate, echo);

        let read = Rc::new(RefCell::new(Vec::new()));
        let _sub = gate.out_data_event().subscribe({
            let read = read.clone();
            move |value: &u32| read.borrow_mut().push(*value)
        });
        gate.write_in(0x0102_0304, Instant::now());

        assert_eq!(
            echo.written().iter().map(Bytes::len).collect::<Vec<_>>(),
            [4]
        );
        assert_eq!(*read.borrow(), [0x0102_0304]);
    }

    #[test]
    fn drops_undecodable_reads() {
        let processor = ActionProcessor::new();
        let gate = SerializeGate::<u32, u32>::new(processor.context());
        let echo = EchoGate::new(processor.context(), 64);
        crate::tie!(gate, echo);

        let read = Rc::new(RefCell::new(Vec::new()));
        let _sub = gate.out_data_event().subscribe({
            let read = read.clone();
            move |value: &u32| read.borrow_mut().push(*value)
        });
        echo.receive(Bytes::from_static(&[1, 2]));
        assert!(read.borrow().is_empty());
    }
}
