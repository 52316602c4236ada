//! Error taxonomy for the workshop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by workers, routing, and station plumbing.
///
/// The type is cloneable and serializable so a failure can be stored in a
/// future, re-read by several waiters, and carried across a process boundary.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum WorkError {
    /// A type or value violation at the public surface.
    #[error("invalid argument: {0}")]
    Argument(String),
    /// No registered station hosts a worker of the named class.
    #[error("no station registered for worker class `{0}`")]
    WorkerNotFound(String),
    /// The worker class does not define the requested instruction.
    #[error("worker class `{class}` does not define instruction `{method}`")]
    UnknownInstruction {
        /// Worker class id.
        class: String,
        /// Requested method id.
        method: String,
    },
    /// A mail for one class reached a workbench hosting another.
    #[error("instruction for class `{expected}` reached a `{found}` workbench")]
    ClassMismatch {
        /// Class named by the instruction.
        expected: String,
        /// Class of the hosting worker.
        found: String,
    },
    /// String-sentinel instructions are reserved for future signaling.
    #[error("reserved signal instruction `{0}` is not routable")]
    ReservedSignal(String),
    /// The worker instance could not be constructed.
    #[error("worker construction failed: {0}")]
    Construction(String),
    /// A fatal failure observed by a workbench (panic or poisoned loop).
    #[error("worker runtime failure: {0}")]
    Runtime(String),
    /// An application-level failure raised by a worker instruction.
    #[error("{0}")]
    Instruction(String),
    /// A message was built outside any workbench context.
    #[error("no workbench context on this thread; route the message through a workshop")]
    NoContext,
    /// The station is not in a state that allows the requested transition.
    #[error("station cannot {0} in its current state")]
    StationState(String),
    /// Serialization or framing failure on a process-station connection.
    #[error("wire failure: {0}")]
    Wire(String),
}

impl WorkError {
    /// Convenience constructor for the most common worker-side error.
    pub fn unknown_instruction(class: &str, method: &str) -> Self {
        WorkError::UnknownInstruction {
            class: class.to_string(),
            method: method.to_string(),
        }
    }
}

/// Failures observed by a future's consumer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FutureError {
    /// The future was cancelled before it ran.
    #[error("future was cancelled")]
    Cancelled,
    /// The timed wait elapsed before completion.
    #[error("timed out waiting for future")]
    TimedOut,
    /// A second completion was attempted.
    #[error("future already completed")]
    Sealed,
    /// The producing side failed; the original error is attached.
    #[error(transparent)]
    Failed(#[from] WorkError),
}
