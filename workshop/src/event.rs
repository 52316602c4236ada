//! A settable flag threads can wait on.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cloneable boolean flag with a timed wait.
///
/// Stations use one for the running signal and one for termination; the
/// workflow heartbeat waits on one between ticks.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    /// A fresh, unset event.
    pub fn new() -> Self {
        Event::default()
    }

    /// Sets the flag and wakes all waiters.
    pub fn set(&self) {
        let (lock, cond) = &*self.inner;
        *lock.lock().expect("event lock") = true;
        cond.notify_all();
    }

    /// Clears the flag.
    pub fn clear(&self) {
        let (lock, _) = &*self.inner;
        *lock.lock().expect("event lock") = false;
    }

    /// Current flag state.
    pub fn is_set(&self) -> bool {
        *self.inner.0.lock().expect("event lock")
    }

    /// Waits until the flag is set.
    pub fn wait(&self) {
        let (lock, cond) = &*self.inner;
        let mut guard = lock.lock().expect("event lock");
        while !*guard {
            guard = cond.wait(guard).expect("event lock");
        }
    }

    /// Waits until the flag is set or `timeout` elapses; returns the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cond) = &*self.inner;
        let guard = lock.lock().expect("event lock");
        if *guard {
            return true;
        }
        let (guard, _) = cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .expect("event lock");
        *guard
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}
