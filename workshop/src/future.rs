//! Single-assignment result cells shared between producers and consumers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{FutureError, WorkError};
use crate::value::Value;

/// Lifecycle of a [`Future`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FutureState {
    /// Not yet picked up by a producer.
    Pending,
    /// A producer is working on it.
    Running,
    /// Cancelled before a producer picked it up.
    Cancelled,
    /// Completed, successfully or not.
    Finished,
}

enum Cell {
    Pending,
    Running,
    Cancelled,
    Finished(Result<Value, WorkError>),
}

impl Cell {
    fn state(&self) -> FutureState {
        match self {
            Cell::Pending => FutureState::Pending,
            Cell::Running => FutureState::Running,
            Cell::Cancelled => FutureState::Cancelled,
            Cell::Finished(_) => FutureState::Finished,
        }
    }
}

type Callback = Box<dyn FnOnce(&Future) + Send>;

struct Inner {
    cell: Mutex<Cell>,
    cond: Condvar,
    callbacks: Mutex<Vec<Callback>>,
}

/// A cheaply cloneable handle on a single-assignment result cell.
///
/// At most one of [`set_result`](Future::set_result) and
/// [`set_failure`](Future::set_failure) may ever succeed; results and failures
/// are mutually exclusive. Done-callbacks fire exactly once, when the state
/// first becomes finished or cancelled.
#[derive(Clone)]
pub struct Future {
    inner: Arc<Inner>,
}

impl Default for Future {
    fn default() -> Self {
        Future::new()
    }
}

impl Future {
    /// A fresh, pending future.
    pub fn new() -> Self {
        Future {
            inner: Arc::new(Inner {
                cell: Mutex::new(Cell::Pending),
                cond: Condvar::new(),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FutureState {
        self.inner.cell.lock().expect("future lock").state()
    }

    /// True once finished or cancelled.
    pub fn is_done(&self) -> bool {
        matches!(
            self.state(),
            FutureState::Finished | FutureState::Cancelled
        )
    }

    /// Marks the pending future as picked up by a producer.
    ///
    /// Returns false when the future is cancelled or already further along.
    pub fn set_running(&self) -> bool {
        let mut cell = self.inner.cell.lock().expect("future lock");
        match *cell {
            Cell::Pending => {
                *cell = Cell::Running;
                true
            }
            _ => false,
        }
    }

    /// Stores the successful result.
    pub fn set_result(&self, value: Value) -> Result<(), FutureError> {
        self.finish(Ok(value))
    }

    /// Stores the failure.
    pub fn set_failure(&self, error: WorkError) -> Result<(), FutureError> {
        self.finish(Err(error))
    }

    fn finish(&self, outcome: Result<Value, WorkError>) -> Result<(), FutureError> {
        {
            let mut cell = self.inner.cell.lock().expect("future lock");
            match *cell {
                Cell::Pending | Cell::Running => *cell = Cell::Finished(outcome),
                Cell::Cancelled | Cell::Finished(_) => return Err(FutureError::Sealed),
            }
        }
        self.inner.cond.notify_all();
        self.run_callbacks();
        Ok(())
    }

    /// Cancels the future; succeeds only while still pending.
    pub fn cancel(&self) -> bool {
        {
            let mut cell = self.inner.cell.lock().expect("future lock");
            match *cell {
                Cell::Pending => *cell = Cell::Cancelled,
                _ => return false,
            }
        }
        self.inner.cond.notify_all();
        self.run_callbacks();
        true
    }

    /// Blocks until done, then returns the value or re-raises the failure.
    ///
    /// `timeout` of `None` waits indefinitely.
    pub fn result(&self, timeout: Option<Duration>) -> Result<Value, FutureError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cell = self.inner.cell.lock().expect("future lock");
        loop {
            match &*cell {
                Cell::Finished(Ok(value)) => return Ok(value.clone()),
                Cell::Finished(Err(error)) => return Err(FutureError::Failed(error.clone())),
                Cell::Cancelled => return Err(FutureError::Cancelled),
                Cell::Pending | Cell::Running => {}
            }
            cell = match deadline {
                None => self.inner.cond.wait(cell).expect("future lock"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FutureError::TimedOut);
                    }
                    let (cell, result) = self
                        .inner
                        .cond
                        .wait_timeout(cell, deadline - now)
                        .expect("future lock");
                    if result.timed_out() && !matches!(&*cell, Cell::Finished(_) | Cell::Cancelled)
                    {
                        return Err(FutureError::TimedOut);
                    }
                    cell
                }
            };
        }
    }

    /// The stored failure, if the future finished with one.
    pub fn failure(&self) -> Option<WorkError> {
        match &*self.inner.cell.lock().expect("future lock") {
            Cell::Finished(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Registers `callback` to run when the future becomes done.
    ///
    /// Fires immediately when already done. Panics inside callbacks are
    /// contained and logged, never propagated to the completing thread.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Future) + Send + 'static,
    {
        let run_now = {
            let cell = self.inner.cell.lock().expect("future lock");
            matches!(&*cell, Cell::Finished(_) | Cell::Cancelled)
        };
        if run_now {
            Future::invoke_callback(self, Box::new(callback));
        } else {
            self.inner
                .callbacks
                .lock()
                .expect("callback lock")
                .push(Box::new(callback));
        }
    }

    fn run_callbacks(&self) {
        let callbacks: Vec<Callback> = {
            let mut guard = self.inner.callbacks.lock().expect("callback lock");
            guard.drain(..).collect()
        };
        for callback in callbacks {
            Future::invoke_callback(self, callback);
        }
    }

    fn invoke_callback(future: &Future, callback: Callback) {
        if catch_unwind(AssertUnwindSafe(|| callback(future))).is_err() {
            tracing::warn!("done-callback panicked; ignoring");
        }
    }
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future").field("state", &self.state()).finish()
    }
}
