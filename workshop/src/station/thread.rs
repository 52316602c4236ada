//! A station hosting its workbench on an OS thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::creator::Creator;
use crate::error::WorkError;
use crate::event::Event;
use crate::mail::Mail;
use crate::mailbox::{Mailbox, Packet};
use crate::station::{Station, StationState, StopHook};
use crate::workbench::{Workbench, WorkbenchSetup};
use crate::worker::Worker;

/// Runs a workbench on a dedicated thread of this process.
pub struct ThreadStation {
    workbench_creator: Creator<Box<dyn Workbench>>,
    worker_creator: Creator<Box<dyn Worker>>,
    worker_class: String,
    inbox: Mailbox,
    outbox: Mailbox,
    running: Event,
    terminate: Event,
    handle: Option<JoinHandle<()>>,
    state: StationState,
    hook: Arc<StopHook>,
}

impl ThreadStation {
    /// A station for `worker_class`, with the workbench and worker recipes.
    pub fn new(
        workbench_creator: Creator<Box<dyn Workbench>>,
        worker_creator: Creator<Box<dyn Worker>>,
        worker_class: impl Into<String>,
    ) -> Self {
        let inbox = Mailbox::new();
        let terminate = Event::new();
        let hook = Arc::new(StopHook {
            terminate: terminate.clone(),
            inbox: inbox.clone(),
        });
        ThreadStation {
            workbench_creator,
            worker_creator,
            worker_class: worker_class.into(),
            inbox,
            outbox: Mailbox::new(),
            running: Event::new(),
            terminate,
            handle: None,
            state: StationState::Initial,
            hook,
        }
    }

    /// The outbox the supervisor polls for worker-emitted mail.
    pub fn outbox(&self) -> &Mailbox {
        &self.outbox
    }

    /// Blocks until the workbench signals readiness or `timeout` elapses.
    pub fn wait_running(&self, timeout: Duration) -> bool {
        self.running.wait_timeout(timeout)
    }
}

impl Station for ThreadStation {
    fn start(&mut self) -> Result<(), WorkError> {
        if self.state != StationState::Initial {
            return Err(WorkError::StationState("start".to_string()));
        }
        let mut workbench = self.workbench_creator.create()?;
        let setup = WorkbenchSetup {
            worker_creator: self.worker_creator.clone(),
            inbox: self.inbox.clone(),
            outbox: self.outbox.clone(),
            running: self.running.clone(),
            terminate: self.terminate.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("station-{}", self.worker_class))
            .spawn(move || workbench.run(setup))
            .map_err(|error| WorkError::Runtime(error.to_string()))?;
        self.handle = Some(handle);
        self.state = StationState::Started;
        debug!(class = %self.worker_class, "thread station started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.state != StationState::Started {
            return;
        }
        self.inbox.put(Packet::Terminate);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.state = StationState::Stopped;
        debug!(class = %self.worker_class, "thread station stopped");
    }

    fn is_running(&self) -> bool {
        self.running.is_set()
    }

    fn send(&self, mail: Mail) {
        self.inbox.put_mail(mail);
    }

    fn recv(&self, timeout: Duration) -> Option<Packet> {
        if timeout.is_zero() {
            self.outbox.try_get()
        } else {
            self.outbox.get(timeout)
        }
    }

    fn worker_class(&self) -> &str {
        &self.worker_class
    }

    fn stop_hook(&self) -> Arc<StopHook> {
        Arc::clone(&self.hook)
    }
}

impl Drop for ThreadStation {
    fn drop(&mut self) {
        self.stop();
    }
}
