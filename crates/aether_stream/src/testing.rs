use {
    crate::{Gate, StreamInfo, WriteList, WriteState, WriteView},
    aether_action::{ActionContext, Event, EventSubscriber},
    alloc::{rc::Rc, vec::Vec},
    bytes::Bytes,
    core::cell::{Cell, RefCell},
    web_time::Instant,
};

/// Bottom of a test pipeline: records writes and, unless silenced, reads
/// every write straight back.
pub struct EchoGate {
    context: ActionContext,
    info: Cell<StreamInfo>,
    echo: Cell<bool>,
    written: RefCell<Vec<Bytes>>,
    out_data: Event<Bytes>,
    gate_update: Event<()>,
    writes: WriteList,
}

impl EchoGate {
    pub fn new(context: &ActionContext, max_element_size: usize) -> Rc<Self> {
        Rc::new(Self {
            context: context.clone(),
            info: Cell::new(StreamInfo::open(max_element_size)),
            echo: Cell::new(true),
            written: RefCell::new(Vec::new()),
            out_data: Event::new(),
            gate_update: Event::new(),
            writes: WriteList::new(),
        })
    }

    pub fn set_echo(&self, echo: bool) {
        self.echo.set(echo);
    }

    pub fn set_info(&self, info: StreamInfo) {
        self.info.set(info);
        self.gate_update.emit(&());
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.written.borrow().clone()
    }

    pub fn receive(&self, data: Bytes) {
        self.out_data.emit(&data);
    }
}

impl Gate for EchoGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, _: Instant) -> WriteView {
        if !self.info.get().is_writable {
            return self.writes.finished(&self.context, WriteState::Failed);
        }
        self.written.borrow_mut().push(data.clone());
        if self.echo.get() {
            self.out_data.emit(&data);
        }
        self.writes.finished(&self.context, WriteState::Done)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.gate_update.subscriber()
    }

    fn stream_info(&self) -> StreamInfo {
        self.info.get()
    }
}
