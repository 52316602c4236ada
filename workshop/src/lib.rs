//! An actor workshop: named workers on dedicated execution stations.
//!
//! Each registered worker runs on its own [`Station`](station::Station), an
//! OS thread or a child process, where a [`Workbench`](workbench::Workbench)
//! drains the worker's inbox one mail at a time. Mails carry a tagged
//! [`Instruction`](instruction::Instruction), an argument bundle, and
//! optionally a [`Future`](future::Future) for the result. A
//! [`Supervisor`](supervisor::Supervisor), itself a worker on its own
//! station, routes mail from the outside in, and between workers across
//! stations.
//!
//! # Examples
//!
//! ```
//! use atelier_workshop::prelude::*;
//!
//! struct Echo;
//!
//! impl WorkerClass for Echo {
//!     const CLASS: &'static str = "echo";
//! }
//!
//! impl Worker for Echo {
//!     fn class(&self) -> &'static str {
//!         Self::CLASS
//!     }
//!
//!     fn dispatch(
//!         &mut self,
//!         method: &str,
//!         args: Args,
//!         _ctx: &WorkbenchContext,
//!     ) -> Result<Value, WorkError> {
//!         match method {
//!             "say" => Ok(args.pos.first().cloned().unwrap_or(Value::Unit)),
//!             _ => Err(WorkError::unknown_instruction(Self::CLASS, method)),
//!         }
//!     }
//! }
//!
//! let mut workshop = Workshop::new();
//! workshop.register::<Echo, _>(|| Echo).unwrap();
//! workshop.start().unwrap();
//!
//! let message = Message::new(Instruction::of::<Echo>("say"))
//!     .params(Args::positional([Value::from("hi")]))
//!     .unwrap();
//! let future = workshop.submit(message).unwrap();
//! assert_eq!(future.result(None).unwrap(), Value::from("hi"));
//! workshop.stop();
//! ```

pub mod creator;
pub mod custodian;
pub mod error;
pub mod event;
pub mod future;
pub mod instruction;
pub mod mail;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod station;
pub mod supervisor;
pub mod value;
pub mod wire;
pub mod workbench;
pub mod worker;
pub mod workshop;

pub use crate::creator::Creator;
pub use crate::error::{FutureError, WorkError};
pub use crate::event::Event;
pub use crate::future::Future;
pub use crate::instruction::Instruction;
pub use crate::mail::{Contact, Mail, MailMeta, MailTrace};
pub use crate::mailbox::{Mailbox, Packet};
pub use crate::message::Message;
pub use crate::value::{Args, Value};
pub use crate::workbench::WorkbenchContext;
pub use crate::worker::{Worker, WorkerClass};
pub use crate::workshop::{WorkerOptions, Workshop};

/// The names most programs need, in one import.
pub mod prelude {
    pub use crate::creator::Creator;
    pub use crate::error::{FutureError, WorkError};
    pub use crate::future::Future;
    pub use crate::instruction::Instruction;
    pub use crate::message::Message;
    pub use crate::value::{Args, Value};
    pub use crate::workbench::WorkbenchContext;
    pub use crate::worker::{Worker, WorkerClass};
    pub use crate::workshop::{WorkerOptions, Workshop};
}
