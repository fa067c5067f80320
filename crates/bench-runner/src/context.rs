use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct State {
    stopping: bool,
    forced: bool,
    active: BTreeSet<String>,
    peak_active: usize,
}

/// Run-wide coordination shared by the scheduler, workers, and the signal
/// handler: the bounded set of active tests plus the stop flags. One condvar
/// wakes both slot waiters and sleepers in retry delays.
#[derive(Debug)]
pub struct OrchestratorContext {
    capacity: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl OrchestratorContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a slot is free, then marks `test_id` active. Returns false
    /// without taking a slot once a stop was requested.
    pub fn admit(&self, test_id: &str) -> bool {
        let guard = self.lock();
        let mut guard = self
            .cond
            .wait_while(guard, |s| !s.stopping && s.active.len() >= self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
        if guard.stopping {
            return false;
        }
        guard.active.insert(test_id.to_string());
        guard.peak_active = guard.peak_active.max(guard.active.len());
        debug!(test = test_id, active = guard.active.len(), "slot taken");
        true
    }

    pub fn vacate(&self, test_id: &str) {
        let mut guard = self.lock();
        if guard.active.remove(test_id) {
            debug!(test = test_id, active = guard.active.len(), "slot released");
        }
        drop(guard);
        self.cond.notify_all();
    }

    /// Sleeps for `delay` unless a stop is requested first. Returns true when
    /// the full delay elapsed.
    pub fn wait(&self, delay: Duration) -> bool {
        self.wait_until(delay, |s| s.stopping)
    }

    /// Like `wait`, but only a forced shutdown cuts it short. Used while
    /// releasing resources, which should still complete on a normal stop.
    pub fn wait_unless_forced(&self, delay: Duration) -> bool {
        self.wait_until(delay, |s| s.forced)
    }

    fn wait_until(&self, delay: Duration, interrupted: impl Fn(&State) -> bool) -> bool {
        let deadline = Instant::now() + delay;
        let mut guard = self.lock();
        loop {
            if interrupted(&guard) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            guard = self
                .cond
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn request_stop(&self) {
        let mut guard = self.lock();
        if !guard.stopping {
            info!(active = guard.active.len(), "stop requested; draining active tests");
        }
        guard.stopping = true;
        drop(guard);
        self.cond.notify_all();
    }

    /// Second-stage stop: also abandons resource release retries.
    pub fn force(&self) {
        let mut guard = self.lock();
        guard.stopping = true;
        guard.forced = true;
        drop(guard);
        self.cond.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    pub fn is_forced(&self) -> bool {
        self.lock().forced
    }

    pub fn active(&self) -> Vec<String> {
        self.lock().active.iter().cloned().collect()
    }

    pub fn peak_active(&self) -> usize {
        self.lock().peak_active
    }
}
