use {
    super::{Api, RequestError, RequestId, ReturnResultApi},
    aether_action::{Event, Subscription},
    ahash::AHashMap,
    alloc::rc::Rc,
    bytes::Bytes,
    core::{
        any::{Any, TypeId},
        cell::{Cell, RefCell},
        fmt,
    },
    log::{debug, warn},
};

type ResultCallback = Box<dyn FnOnce(Result<Bytes, RequestError>)>;

#[derive(Default)]
struct Inner {
    handlers: RefCell<AHashMap<TypeId, Rc<dyn Any>>>,
    pending: RefCell<AHashMap<RequestId, ResultCallback>>,
    next_request_id: Cell<u32>,
}

/// Shared registry of message handlers for one protocol session.
///
/// Parsers [dispatch](ProtocolContext::dispatch) decoded messages here, keyed
/// by their [`Api`] type, and every component interested in an API subscribes
/// to it. Replies to requests are routed to the callback registered for their
/// [`RequestId`].
///
/// Cloning gives another handle to the same context.
#[derive(Clone, Default)]
pub struct ProtocolContext {
    inner: Rc<Inner>,
}

impl fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("apis", &self.inner.handlers.borrow().len())
            .field("pending_requests", &self.inner.pending.borrow().len())
            .finish()
    }
}

impl ProtocolContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn event<A: Api>(&self) -> Rc<Event<A>> {
        let erased = self
            .inner
            .handlers
            .borrow_mut()
            .entry(TypeId::of::<A>())
            .or_insert_with(|| Rc::new(Event::<A>::new()) as Rc<dyn Any>)
            .clone();
        Rc::downcast::<Event<A>>(erased)
            .unwrap_or_else(|_| unreachable!("handler event is keyed by its `TypeId`"))
    }

    /// Calls `f` for every message of `A` dispatched to this context.
    #[must_use = "dropping the subscription detaches the handler"]
    pub fn on_message<A: Api>(&self, f: impl Fn(&A) + 'static) -> Subscription {
        self.event::<A>().subscribe(f)
    }

    /// Passes `message` to every handler of `A`.
    pub fn dispatch<A: Api>(&self, message: &A) {
        // clone out the event so that handlers may subscribe while it emits
        let event = self.event::<A>();
        event.emit(message);
    }

    /// Allocates a fresh request id.
    pub fn new_request_id(&self) -> RequestId {
        let id = self.inner.next_request_id.get();
        self.inner.next_request_id.set(id.wrapping_add(1));
        RequestId(id)
    }

    /// Registers `f` to be called once with the reply to `request_id`.
    pub fn on_result(
        &self,
        request_id: RequestId,
        f: impl FnOnce(Result<Bytes, RequestError>) + 'static,
    ) {
        let old = self
            .inner
            .pending
            .borrow_mut()
            .insert(request_id, Box::new(f));
        if old.is_some() {
            warn!("Replaced pending callback for {request_id:?}");
        }
    }

    /// Forgets the callback for `request_id`, if any.
    pub fn cancel_request(&self, request_id: RequestId) {
        self.inner.pending.borrow_mut().remove(&request_id);
    }

    /// Number of requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Routes a reply to the callback waiting for it, then dispatches it to
    /// [`ReturnResultApi`] handlers.
    pub fn resolve(&self, reply: ReturnResultApi) {
        let request_id = reply.request_id();
        let callback = self.inner.pending.borrow_mut().remove(&request_id);
        self.dispatch(&reply);
        match callback {
            Some(callback) => callback(reply.into_result()),
            None => debug!("No callback waiting for {request_id:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::api::{ApiParser, PacketBuilder},
        crate::{ring::RingIndex, safe_stream::SafeStreamApi},
        core::cell::RefCell,
    };

    #[test]
    fn dispatches_by_api() {
        let context = ProtocolContext::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _sub = context.on_message::<SafeStreamApi>({
            let seen = seen.clone();
            move |message| seen.borrow_mut().push(message.clone())
        });

        let packet = PacketBuilder::new()
            .with(&SafeStreamApi::Confirm {
                offset: RingIndex(1),
            })
            .with(&SafeStreamApi::Close)
            .build();
        ApiParser::new(packet)
            .parse::<SafeStreamApi>(&context)
            .expect("valid packet");

        assert_eq!(
            *seen.borrow(),
            [
                SafeStreamApi::Confirm {
                    offset: RingIndex(1)
                },
                SafeStreamApi::Close,
            ]
        );
    }

    #[test]
    fn routes_replies_to_requests() {
        let context = ProtocolContext::new();
        let first = context.new_request_id();
        let second = context.new_request_id();
        assert_ne!(first, second);

        let got = Rc::new(RefCell::new(None));
        context.on_result(second, {
            let got = got.clone();
            move |result| *got.borrow_mut() = Some(result)
        });
        assert_eq!(1, context.pending_requests());

        let packet = PacketBuilder::new()
            .with(&SafeStreamApi::Close)
            .with(&ReturnResultApi::SendError {
                request_id: second,
                error_code: 3,
            })
            .build();
        ApiParser::new(packet)
            .parse::<SafeStreamApi>(&context)
            .expect("valid packet");

        assert_eq!(Some(Err(RequestError { code: 3 })), *got.borrow());
        assert_eq!(0, context.pending_requests());
    }
}
