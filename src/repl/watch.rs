//! Shard-wide wake primitive for long-polling readers.
//!
//! Waiters block on a condition variable guarded by the tracked maximum and
//! re-test `max > after` on every wake, so a burst of advances collapses into
//! one wake and a waiter that arrives late never sleeps past a satisfied
//! predicate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::core::TaskId;

use super::cancel::{CancelListener, CancelToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The maximum moved above the waiter's position.
    Advanced(TaskId),
    TimedOut,
    Cancelled,
    /// The watch was closed because its owner is stopping.
    Closed,
}

#[derive(Debug)]
struct WatchState {
    max: TaskId,
    closed: bool,
}

#[derive(Debug)]
pub struct MaxTaskWatch {
    // Mirror of `state.max` for lock-free reads; written only under the lock.
    max: AtomicU64,
    state: Mutex<WatchState>,
    cond: Condvar,
}

impl MaxTaskWatch {
    pub fn new(initial: TaskId) -> Self {
        Self {
            max: AtomicU64::new(initial.get()),
            state: Mutex::new(WatchState {
                max: initial,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn current(&self) -> TaskId {
        TaskId::new(self.max.load(Ordering::Acquire))
    }

    /// Raises the maximum to `candidate`. Returns `false` (and wakes no one)
    /// when `candidate` does not exceed the current maximum.
    pub fn advance(&self, candidate: TaskId) -> bool {
        let mut state = self.state.lock().expect("max task watch lock poisoned");
        if candidate <= state.max {
            return false;
        }
        state.max = candidate;
        self.max.store(candidate.get(), Ordering::Release);
        drop(state);
        self.cond.notify_all();
        true
    }

    pub fn close(&self) {
        let mut state = self.state.lock().expect("max task watch lock poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .expect("max task watch lock poisoned")
            .closed
    }

    /// Blocks until the maximum exceeds `after`, `deadline` passes, `cancel`
    /// fires or the watch closes.
    pub fn wait_above(
        self: &Arc<Self>,
        after: TaskId,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> WaitOutcome {
        let listener: Arc<dyn CancelListener> = self.clone();
        let _registration = cancel.register(Arc::downgrade(&listener));

        let mut state = self.state.lock().expect("max task watch lock poisoned");
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if state.max > after {
                return WaitOutcome::Advanced(state.max);
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("max task watch lock poisoned");
            state = next;
        }
    }
}

impl CancelListener for MaxTaskWatch {
    fn on_cancel(&self) {
        // Taking the lock orders this wake after the waiter's flag check.
        let _state = self.state.lock().expect("max task watch lock poisoned");
        self.cond.notify_all();
    }
}
