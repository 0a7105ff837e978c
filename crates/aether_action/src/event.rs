//! Single-threaded publish/subscribe events.
//!
//! An [`Event`] is owned by whoever is allowed to [`Event::emit`] it. Anyone
//! else gets an [`EventSubscriber`], which can only attach handlers.
//!
//! Attaching a handler returns a [`Subscription`]. The handler stays attached
//! for as long as the [`Subscription`] is alive: the event itself only keeps
//! weak references to its handlers, and prunes dead ones after each emission.
//!
//! # Emission semantics
//!
//! [`Event::emit`] calls every handler which was attached *before* emission
//! started, in attachment order. Handlers attached during emission are not
//! called until the next emission, and handlers whose [`Subscription`] is
//! dropped during emission are skipped.

use {
    alloc::rc::{Rc, Weak},
    core::{
        cell::{Cell, RefCell},
        fmt,
    },
};

struct Handler<T> {
    callback: Box<dyn Fn(&T)>,
    event: Weak<RefCell<Vec<Weak<Handler<T>>>>>,
    once: Cell<bool>,
    alive: Cell<bool>,
}

trait ErasedHandler {
    fn set_once(&self);

    fn kill(&self);

    fn is_alive(&self) -> bool;
}

impl<T> ErasedHandler for Handler<T> {
    fn set_once(&self) {
        self.once.set(true);
    }

    fn kill(&self) {
        self.alive.set(false);
    }

    fn is_alive(&self) -> bool {
        self.alive.get() && self.event.strong_count() > 0
    }
}

type Handlers<T> = Rc<RefCell<Vec<Weak<Handler<T>>>>>;

/// Emitter side of a single-threaded event carrying values of type `T`.
///
/// Multi-argument events use a tuple as `T`.
pub struct Event<T> {
    handlers: Handlers<T>,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self {
            handlers: Rc::default(),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.handlers.borrow().len())
            .finish()
    }
}

impl<T: 'static> Event<T> {
    /// Creates an event with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle which can attach handlers to this event, but not emit
    /// it.
    #[must_use]
    pub fn subscriber(&self) -> EventSubscriber<T> {
        EventSubscriber {
            handlers: self.handlers.clone(),
        }
    }

    /// Attaches a handler to this event.
    ///
    /// See [`EventSubscriber::subscribe`].
    pub fn subscribe(&self, f: impl Fn(&T) + 'static) -> Subscription {
        subscribe(&self.handlers, f)
    }

    /// Calls all currently attached handlers with `value`.
    pub fn emit(&self, value: &T) {
        let snapshot = self
            .handlers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();

        for handler in snapshot {
            if !handler.alive.get() {
                continue;
            }
            if handler.once.get() {
                handler.alive.set(false);
            }
            (handler.callback)(value);
        }

        self.handlers
            .borrow_mut()
            .retain(|handler| handler.upgrade().is_some_and(|handler| handler.alive.get()));
    }

    /// Returns `true` if at least one live handler is attached.
    #[must_use]
    pub fn has_handlers(&self) -> bool {
        self.handlers
            .borrow()
            .iter()
            .any(|handler| handler.upgrade().is_some_and(|handler| handler.alive.get()))
    }
}

/// Subscribe-only handle to an [`Event`].
pub struct EventSubscriber<T> {
    handlers: Handlers<T>,
}

impl<T> Clone for EventSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<T> fmt::Debug for EventSubscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscriber").finish_non_exhaustive()
    }
}

impl<T: 'static> EventSubscriber<T> {
    /// Attaches a handler to the event.
    ///
    /// The handler is detached when the returned [`Subscription`] is dropped
    /// or [reset](Subscription::reset).
    #[must_use = "dropping the subscription detaches the handler"]
    pub fn subscribe(&self, f: impl Fn(&T) + 'static) -> Subscription {
        subscribe(&self.handlers, f)
    }
}

fn subscribe<T: 'static>(handlers: &Handlers<T>, f: impl Fn(&T) + 'static) -> Subscription {
    let handler = Rc::new(Handler {
        callback: Box::new(f),
        event: Rc::downgrade(handlers),
        once: Cell::new(false),
        alive: Cell::new(true),
    });
    handlers.borrow_mut().push(Rc::downgrade(&handler));
    let handler: Rc<dyn ErasedHandler> = handler;
    Subscription {
        handler: Some(handler),
    }
}

/// Keeps an event handler attached while alive.
#[derive(Default)]
pub struct Subscription {
    handler: Option<Rc<dyn ErasedHandler>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Subscription {
    /// Makes the handler detach itself after it is called once.
    #[must_use]
    pub fn once(self) -> Self {
        if let Some(handler) = &self.handler {
            handler.set_once();
        }
        self
    }

    /// Detaches the handler now.
    pub fn reset(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.kill();
        }
    }

    /// Returns `true` if the handler is still attached and may be called.
    ///
    /// This is `false` once the event itself has been dropped.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.handler.as_ref().is_some_and(|handler| handler.is_alive())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Owns any number of [`Subscription`]s at once.
///
/// Dead subscriptions (e.g. fired [`Subscription::once`] handlers) are cleaned
/// up whenever a new one is pushed.
#[derive(Debug, Default)]
pub struct MultiSubscription {
    subscriptions: RefCell<Vec<Subscription>>,
}

impl MultiSubscription {
    /// Creates an empty set of subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `subscription`.
    pub fn push(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.borrow_mut();
        subscriptions.retain(Subscription::is_alive);
        subscriptions.push(subscription);
    }

    /// Detaches all owned handlers.
    pub fn reset(&self) {
        // take first so that handler drops can't observe a borrowed cell
        let subscriptions = core::mem::take(&mut *self.subscriptions.borrow_mut());
        drop(subscriptions);
    }

    /// Number of live subscriptions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions
            .borrow()
            .iter()
            .filter(|subscription| subscription.is_alive())
            .count()
    }

    /// Returns `true` if no live subscriptions are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
