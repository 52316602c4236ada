//! Atelier is a task-and-actor runtime built from two tightly coupled halves.
//!
//! **Workflow scheduling**: named [`Task`]s with declared `after`
//! dependencies enter a [`DependencyChain`]; [`Workflow::run`] dispatches
//! them to a [`HybridPoolExecutor`] level by level, eagerly on completion, or
//! both, honoring an independent/dependent worker split.
//!
//! **The actor workshop**: the [`workshop`] crate's registry of named workers
//! on dedicated thread- or process-backed stations, routed by a supervisor.
//! Both halves share the same building blocks: mailboxes, futures, instance
//! creators.
//!
//! # Examples
//!
//! ```
//! use atelier::{Task, Value, Workflow};
//!
//! let mut workflow = Workflow::new().with_workers(2);
//! workflow
//!     .add(Task::new("a", |_| Ok(Value::Int(20))))
//!     .unwrap();
//! workflow
//!     .add(
//!         Task::new("b", |args| {
//!             let base = args.get(0).and_then(Value::as_int).unwrap_or(0);
//!             Ok(Value::Int(base + 22))
//!         })
//!         .with_args([Workflow::p("a")])
//!         .after(["a"]),
//!     )
//!     .unwrap();
//!
//! let result = workflow.run().unwrap().expect("non-empty workflow");
//! assert_eq!(result.get("b").unwrap(), Some(Value::Int(42)));
//! ```

#![forbid(missing_docs)]

pub mod executor;
pub mod task;
pub mod workflow;

/// Re-export of the dependency-chain crate.
pub use atelier_chain as chain;
/// Re-export of the actor-workshop crate.
pub use atelier_workshop as workshop;

pub use crate::chain::{ChainError, DependencyChain, Priority};
pub use crate::executor::{ExecutorConfig, HybridPoolExecutor, WorkMode};
pub use crate::task::{Coercion, OnError, Placeholder, Task, TaskArg};
pub use crate::workflow::{Heartbeat, Workflow, WorkflowError, WorkflowMode, WorkflowResult};
pub use crate::workshop::{
    Args, Future, FutureError, Instruction, Message, Value, WorkError, Workshop,
};
