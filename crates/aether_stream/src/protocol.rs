//! Gates which speak an [`Api`] over a byte stream.

use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteView, forward_to},
    aether_action::{Event, EventSubscriber},
    aether_proto::api::{Api, ApiParser, ProtocolContext},
    alloc::{boxed::Box, rc::Rc},
    bytes::Bytes,
    core::{fmt, marker::PhantomData},
    log::warn,
    web_time::Instant,
};

/// Parses everything read from downstream as messages of `A`, dispatching
/// them to a [`ProtocolContext`].
///
/// Writes pass through unchanged, and nothing is read out of this gate.
pub struct ProtocolReadGate<A> {
    context: ProtocolContext,
    link: GateLink<Bytes, Bytes>,
    out_data: Event<Bytes>,
    _phantom: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for ProtocolReadGate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolReadGate")
            .field("context", &self.context)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl<A: Api> ProtocolReadGate<A> {
    /// Creates a gate which dispatches to `context`.
    #[must_use]
    pub fn new(context: ProtocolContext) -> Rc<Self> {
        Rc::new(Self {
            context,
            link: GateLink::new(),
            out_data: Event::new(),
            _phantom: PhantomData,
        })
    }

    /// Gets the context messages are dispatched to.
    #[must_use]
    pub const fn context(&self) -> &ProtocolContext {
        &self.context
    }
}

impl<A: Api> Gate for ProtocolReadGate<A> {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
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

impl<A: Api> LinkOut for ProtocolReadGate<A> {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let context = self.context.clone();
        self.link.link(out, move |packet: &Bytes| {
            if let Err(err) = ApiParser::new(packet.clone()).parse::<A>(&context) {
                warn!("Failed to parse packet as {}: {err}", A::NAME);
            }
        });
    }
}

/// Wraps every write in a message of `A`.
///
/// Reads pass through unchanged.
pub struct ProtocolWriteGate<A> {
    wrap: Box<dyn Fn(Bytes) -> A>,
    overhead: fn(usize) -> usize,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Bytes>>,
}

impl<A> fmt::Debug for ProtocolWriteGate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolWriteGate")
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl<A: Api> ProtocolWriteGate<A> {
    /// Creates a gate which packs every write as `wrap(data)`.
    ///
    /// `overhead(len)` gives how many bytes the message adds on top of `len`
    /// bytes of data.
    #[must_use]
    pub fn new(wrap: impl Fn(Bytes) -> A + 'static, overhead: fn(usize) -> usize) -> Rc<Self> {
        Rc::new(Self {
            wrap: Box::new(wrap),
            overhead,
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
        })
    }
}

impl<A: Api> Gate for ProtocolWriteGate<A> {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        let message = (self.wrap)(data);
        self.link.write_out(message.pack(), now)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        let info = self.link.stream_info();
        info.with_overhead((self.overhead)(info.max_element_size))
    }
}

impl<A: Api> LinkOut for ProtocolWriteGate<A> {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        self.link.link(out, forward_to(&self.out_data));
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::EchoGate,
        aether_action::ActionProcessor,
        aether_proto::{
            api::ChildData,
            stream_api::{StreamApi, StreamId},
        },
        core::cell::RefCell,
    };

    #[test]
    fn written_messages_are_dispatched_on_read() {
        let processor = ActionProcessor::new();
        let context = ProtocolContext::new();
        let read_gate = ProtocolReadGate::<StreamApi>::new(context.clone());
        let write_gate = ProtocolWriteGate::new(
            |data| StreamApi::Stream {
                stream_id: StreamId(9),
                child_data: ChildData::Bytes(data),
            },
            StreamApi::overhead,
        );
        let echo = EchoGate::new(processor.context(), 100);
        crate::tie!(write_gate, read_gate, echo);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let _sub = context.on_message::<StreamApi>({
            let seen = seen.clone();
            move |message| seen.borrow_mut().push(message.clone())
        });
        write_gate.write_in(Bytes::from_static(b"hi"), Instant::now());

        assert_eq!(*seen.borrow(), [StreamApi::Stream {
            stream_id: StreamId(9),
            child_data: ChildData::Bytes(Bytes::from_static(b"hi")),
        }]);
        assert_eq!(
            100 - StreamApi::overhead(100),
            write_gate.stream_info().max_element_size
        );
    }
}
