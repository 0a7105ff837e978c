use {
    crate::{ActionContext, ActionRegistry, ActionTrigger},
    web_time::Instant,
};

/// Drives every action registered in its context.
///
/// The usual loop is:
///
/// ```no_run
/// # use aether_action::ActionProcessor;
/// # use web_time::Instant;
/// let processor = ActionProcessor::new();
/// loop {
///     let next = processor.update(Instant::now());
///     processor.trigger().wait_until(next);
/// }
/// ```
///
/// [`ActionProcessor::update`] never blocks.
#[derive(Debug, Default)]
pub struct ActionProcessor {
    context: ActionContext,
}

impl ActionProcessor {
    /// Creates a processor with a fresh registry and trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a processor driving the actions of an existing context.
    #[must_use]
    pub const fn with_context(context: ActionContext) -> Self {
        Self { context }
    }

    /// Gets the context which new actions should be spawned in.
    #[must_use]
    pub const fn context(&self) -> &ActionContext {
        &self.context
    }

    /// Gets the registry of actions driven by this processor.
    #[must_use]
    pub const fn registry(&self) -> &ActionRegistry {
        self.context.registry()
    }

    /// Gets the trigger which wakes this processor up.
    #[must_use]
    pub const fn trigger(&self) -> &ActionTrigger {
        self.context.trigger()
    }

    /// Updates every live, unfinished action once.
    ///
    /// Actions are visited in registration order. Actions registered during
    /// this call are first updated on the next call.
    ///
    /// Returns the earliest deadline requested by any action, or `now` if no
    /// action requested one.
    pub fn update(&self, now: Instant) -> Instant {
        let mut next_update = now;
        for slot in self.registry().snapshot() {
            if slot.is_finished() {
                continue;
            }
            let Some(action) = slot.action() else {
                continue;
            };
            let new_time = action.update(now);
            next_update = select_next_update(new_time, now, next_update);
        }
        next_update
    }
}

/// Folds an action's requested update time into the processor's running
/// deadline.
///
/// - a future `new_time` wins over the running deadline if it is earlier, or if
///   no deadline has been chosen yet (`next_update == current_time`)
/// - a past or present `new_time` keeps the running deadline, clamped to no
///   earlier than `current_time`
///
/// # Example
///
/// ```
/// # use aether_action::select_next_update;
/// # use core::time::Duration;
/// # use web_time::Instant;
/// let now = Instant::now();
/// let soon = now + Duration::from_millis(10);
/// let later = now + Duration::from_millis(50);
///
/// assert_eq!(later, select_next_update(later, now, now));
/// assert_eq!(soon, select_next_update(soon, now, later));
/// assert_eq!(soon, select_next_update(now, now, soon));
/// ```
#[must_use]
pub fn select_next_update(new_time: Instant, current_time: Instant, next_update: Instant) -> Instant {
    if new_time > current_time {
        if next_update == current_time {
            new_time
        } else {
            new_time.min(next_update)
        }
    } else {
        next_update.max(current_time)
    }
}
