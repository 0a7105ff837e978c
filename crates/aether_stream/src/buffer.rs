use {
    crate::{
        DynGate, Gate, GateLink, LinkOut, StreamInfo, StreamWriteAction, WriteList, WriteState,
        WriteView, forward_to,
    },
    aether_action::{ActionContext, Event, EventSubscriber},
    alloc::{
        collections::VecDeque,
        rc::{Rc, Weak},
    },
    bytes::Bytes,
    core::cell::{Cell, RefCell},
    log::{debug, warn},
    web_time::Instant,
};

struct Queued {
    data: Bytes,
    write: Rc<StreamWriteAction>,
}

/// Holds writes back while the gate below can't take them, up to a byte limit.
///
/// Writes are queued while the downstream gate is unlinked or not writable,
/// and also while earlier writes are still queued, so that order is kept.
/// Queued writes are passed on, oldest first, whenever the downstream gate
/// updates and is writable again.
///
/// A write which would take the queue over its limit fails immediately.
pub struct BufferGate {
    context: ActionContext,
    this: Weak<Self>,
    max_size: usize,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Bytes>>,
    queue: RefCell<VecDeque<Queued>>,
    queued_size: Cell<usize>,
    draining: Cell<bool>,
    writes: WriteList,
}

impl core::fmt::Debug for BufferGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferGate")
            .field("max_size", &self.max_size)
            .field("queued", &self.queue.borrow().len())
            .field("queued_size", &self.queued_size.get())
            .finish_non_exhaustive()
    }
}

impl BufferGate {
    /// Default byte limit of the queue.
    pub const DEFAULT_MAX_SIZE: usize = 20 * 1024;

    /// Creates an unlinked gate with a limit of [`BufferGate::DEFAULT_MAX_SIZE`].
    #[must_use]
    pub fn new(context: &ActionContext) -> Rc<Self> {
        Self::with_max_size(context, Self::DEFAULT_MAX_SIZE)
    }

    /// Creates an unlinked gate which queues at most `max_size` bytes.
    #[must_use]
    pub fn with_max_size(context: &ActionContext, max_size: usize) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            context: context.clone(),
            this: this.clone(),
            max_size,
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
            queue: RefCell::new(VecDeque::new()),
            queued_size: Cell::new(0),
            draining: Cell::new(false),
            writes: WriteList::new(),
        })
    }

    /// Gets the byte limit of the queue.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of bytes currently queued.
    #[must_use]
    pub fn queued_size(&self) -> usize {
        self.queued_size.get()
    }

    /// Number of writes currently queued.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.borrow().len()
    }

    fn can_pass_on(&self) -> bool {
        let info = self.link.stream_info();
        info.is_linked && info.is_writable
    }

    fn drain(&self, now: Instant) {
        if self.draining.replace(true) {
            return;
        }
        while self.can_pass_on() {
            let Some(queued) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            self.queued_size
                .set(self.queued_size.get() - queued.data.len());
            let out = self.link.write_out(queued.data, now);
            queued.write.follow(&out);
        }
        self.draining.set(false);
    }

    fn unqueue(&self, write: &Rc<StreamWriteAction>) -> bool {
        let mut queue = self.queue.borrow_mut();
        let Some(pos) = queue
            .iter()
            .position(|queued| Rc::ptr_eq(&queued.write, write))
        else {
            return false;
        };
        if let Some(queued) = queue.remove(pos) {
            self.queued_size
                .set(self.queued_size.get() - queued.data.len());
        }
        true
    }
}

impl Gate for BufferGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        if self.queue.borrow().is_empty() && self.can_pass_on() {
            return self.link.write_out(data, now);
        }

        let queued_size = self.queued_size.get();
        if queued_size + data.len() > self.max_size {
            warn!(
                "Failing write of {} bytes, {queued_size} / {} bytes queued",
                data.len(),
                self.max_size
            );
            return self.writes.finished(&self.context, WriteState::Failed);
        }

        debug!("Queueing write of {} bytes", data.len());
        let write = StreamWriteAction::new(&self.context);
        let this = self.this.clone();
        let target = Rc::downgrade(&write);
        write.on_stop(move || {
            let (Some(this), Some(write)) = (this.upgrade(), target.upgrade()) else {
                return;
            };
            if this.unqueue(&write) {
                write.set_state(WriteState::Stopped);
            }
        });

        let was_soft_writable = queued_size < self.max_size;
        self.queued_size.set(queued_size + data.len());
        self.queue.borrow_mut().push_back(Queued {
            data,
            write: write.clone(),
        });
        if was_soft_writable && self.queued_size.get() >= self.max_size {
            self.link.emit_update();
        }
        self.writes.push(write)
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        let out = self.link.stream_info();
        let max_element_size = if out.is_linked {
            out.max_element_size.min(self.max_size)
        } else {
            self.max_size
        };
        StreamInfo {
            max_element_size,
            is_linked: out.is_linked,
            is_writable: true,
            is_soft_writable: self.queued_size.get() < self.max_size,
        }
    }
}

impl LinkOut for BufferGate {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let this = self.this.clone();
        self.link
            .link_with_update(out, forward_to(&self.out_data), move || {
                if let Some(this) = this.upgrade() {
                    this.drain(Instant::now());
                }
            });
    }
}
