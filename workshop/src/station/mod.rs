//! Execution hosts: each station runs one workbench on a thread or process.

pub mod process;
pub mod thread;

use std::sync::Arc;
use std::time::Duration;

use crate::event::Event;
use crate::mail::Mail;
use crate::mailbox::{Mailbox, Packet};

pub use process::ProcessStation;
pub use thread::ThreadStation;

/// Lifecycle of a station. Restart from `Stopped` is not supported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StationState {
    /// Constructed, never started.
    Initial,
    /// `start` has returned.
    Started,
    /// `stop` has completed.
    Stopped,
}

/// The shutdown handles of a station, shared with the lifecycle custodian.
///
/// Setting the event and posting the pill is everything an emergency stop
/// needs; joining remains the owner's job.
#[derive(Clone, Debug)]
pub struct StopHook {
    /// The station's terminate event.
    pub terminate: Event,
    /// The station's inbox, for the poison pill.
    pub inbox: Mailbox,
}

impl StopHook {
    /// Requests shutdown without waiting for it.
    pub fn trip(&self) {
        self.terminate.set();
        self.inbox.put(Packet::Terminate);
    }
}

/// An execution host owning one workbench and its worker.
pub trait Station: Send {
    /// Installs the mailboxes, builds the workbench, and launches its run
    /// loop; returns immediately.
    fn start(&mut self) -> Result<(), crate::error::WorkError>;

    /// Posts the poison pill and joins; idempotent.
    fn stop(&mut self);

    /// Reflects the workbench's running event.
    fn is_running(&self) -> bool;

    /// Enqueues a mail onto the station inbox.
    fn send(&self, mail: Mail);

    /// Pops the next outbox packet, waiting at most `timeout`.
    fn recv(&self, timeout: Duration) -> Option<Packet>;

    /// The hosted worker's class id, for routing.
    fn worker_class(&self) -> &str;

    /// The shutdown handles tracked by the lifecycle custodian.
    fn stop_hook(&self) -> Arc<StopHook>;
}
