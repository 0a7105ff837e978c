use {
    crate::{Action, ActionBase, ActionContext},
    alloc::rc::Rc,
    core::cell::Cell,
    web_time::Instant,
};

/// Action which reports a result every time it is notified, from inside the
/// processor's update.
///
/// Useful for deferring work out of an event handler into the next tick.
#[derive(Debug)]
pub struct NotifyAction {
    base: ActionBase<Self>,
    notified: Cell<bool>,
    failed: Cell<bool>,
}

impl NotifyAction {
    /// Creates and registers a new notify action.
    #[must_use]
    pub fn new(context: &ActionContext) -> Rc<Self> {
        context.spawn(|base| Self {
            base,
            notified: Cell::new(false),
            failed: Cell::new(false),
        })
    }

    /// Makes the next update emit a result.
    pub fn notify(&self) {
        self.notified.set(true);
        self.base.trigger();
    }

    /// Makes the next update finish this action with an error.
    pub fn failed(&self) {
        self.failed.set(true);
        self.base.trigger();
    }
}

impl Action for NotifyAction {
    fn update(&self, now: Instant) -> Instant {
        if self.failed.get() {
            self.base.error();
        } else if self.notified.replace(false) {
            self.base.result_repeat();
        }
        now
    }

    fn base(&self) -> &ActionBase<Self> {
        &self.base
    }
}
