use {
    core::time::Duration,
    std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    web_time::Instant,
};

#[derive(Debug, Default)]
struct SyncObject {
    triggered: Mutex<bool>,
    cond: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared wakeup condition used to interrupt a processor which is waiting for
/// its next update.
///
/// Cloning a trigger gives another handle to the same condition, so this can be
/// handed to background threads which need to wake the processor up.
///
/// Calling [`ActionTrigger::trigger`] any number of times before a
/// [`ActionTrigger::wait`] produces exactly one wakeup.
#[derive(Debug, Clone, Default)]
pub struct ActionTrigger {
    sync: Arc<Mutex<Arc<SyncObject>>>,
}

impl ActionTrigger {
    /// Creates a new untriggered trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sync_object(&self) -> Arc<SyncObject> {
        lock(&self.sync).clone()
    }

    /// Wakes up whoever is waiting on this trigger, or makes the next wait
    /// return immediately.
    pub fn trigger(&self) {
        let sync = self.sync_object();
        *lock(&sync.triggered) = true;
        sync.cond.notify_all();
    }

    /// Returns `true` if the trigger fired and nobody has waited on it yet.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *lock(&self.sync_object().triggered)
    }

    /// Blocks the current thread until the trigger fires, then resets it.
    pub fn wait(&self) {
        let sync = self.sync_object();
        let mut triggered = sync
            .cond
            .wait_while(lock(&sync.triggered), |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *triggered = false;
    }

    /// Blocks the current thread until the trigger fires or `deadline` passes.
    ///
    /// Returns `true` if the trigger fired, and `false` on timeout.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.wait_for(timeout)
    }

    /// Blocks the current thread until the trigger fires or `timeout` elapses.
    ///
    /// Returns `true` if the trigger fired, and `false` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let sync = self.sync_object();
        let (mut triggered, _) = sync
            .cond
            .wait_timeout_while(lock(&sync.triggered), timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        core::mem::replace(&mut *triggered, false)
    }

    /// Makes this trigger (and every clone of it) share the wait state of
    /// `other`.
    ///
    /// After merging, triggering either one wakes a waiter on either one. A
    /// pending trigger on `self` is carried over to `other`.
    ///
    /// A thread already waiting on `self` is woken up, since it is parked on
    /// the wait state being replaced.
    pub fn merge(&self, other: &Self) {
        if Arc::ptr_eq(&self.sync, &other.sync) {
            return;
        }
        let target = other.sync_object();
        let old = core::mem::replace(&mut *lock(&self.sync), target.clone());
        if Arc::ptr_eq(&old, &target) {
            return;
        }
        let pending = core::mem::replace(&mut *lock(&old.triggered), true);
        old.cond.notify_all();
        if pending {
            *lock(&target.triggered) = true;
            target.cond.notify_all();
        }
    }
}
