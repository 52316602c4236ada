//! The message-processing loops that drive a worker on its station.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::creator::Creator;
use crate::error::WorkError;
use crate::event::Event;
use crate::mail::{complete, Contact, Mail};
use crate::mailbox::{Mailbox, Packet};
use crate::worker::Worker;

/// How long one inbox poll may block before the loop re-checks termination.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

thread_local! {
    static CURRENT: RefCell<Option<WorkbenchContext>> = const { RefCell::new(None) };
}

/// The execution context a workbench installs around worker code.
///
/// It knows the worker's contact and the station outbox, and is discoverable
/// from anywhere on the invoking thread via [`WorkbenchContext::current`],
/// which is how a message built inside a worker finds its way out.
#[derive(Clone, Debug)]
pub struct WorkbenchContext {
    contact: Contact,
    outbox: Mailbox,
}

impl WorkbenchContext {
    /// A context for `contact`, posting onto `outbox`.
    pub fn new(contact: Contact, outbox: Mailbox) -> Self {
        WorkbenchContext { contact, outbox }
    }

    /// The hosted worker's contact.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Posts a mail onto the station outbox for the supervisor to route.
    pub fn post(&self, mail: Mail) {
        self.outbox.put_mail(mail);
    }

    /// Escalates a fatal failure to whoever polls the station outbox.
    pub fn fail(&self, error: WorkError) {
        self.outbox.put(Packet::Failure(error));
    }

    /// The context of the worker the calling thread is executing for, if any.
    pub fn current() -> Option<WorkbenchContext> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Installs `self` as the thread's current context until the guard drops.
    pub(crate) fn activate(&self) -> ContextGuard {
        let previous = CURRENT.with(|cell| cell.borrow_mut().replace(self.clone()));
        ContextGuard { previous }
    }
}

/// Restores the previously active context on drop.
pub(crate) struct ContextGuard {
    previous: Option<WorkbenchContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Everything a workbench needs to run: who to build, where mail comes from
/// and goes, and the lifecycle flags shared with the owning station.
pub struct WorkbenchSetup {
    /// Builds the hosted worker.
    pub worker_creator: Creator<Box<dyn Worker>>,
    /// Mail in.
    pub inbox: Mailbox,
    /// Mail and failures out.
    pub outbox: Mailbox,
    /// Set while the loop is live.
    pub running: Event,
    /// Set by the station to request shutdown.
    pub terminate: Event,
}

/// A single-worker message-processing loop.
pub trait Workbench: Send {
    /// Consumes the inbox until terminated. Does not return early on per-mail
    /// failures; only construction failures and panics end the loop.
    fn run(&mut self, setup: WorkbenchSetup);
}

/// The sequential workbench: one mail at a time, in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopWorkbench;

impl Workbench for LoopWorkbench {
    fn run(&mut self, setup: WorkbenchSetup) {
        let mut worker = match setup.worker_creator.create() {
            Ok(worker) => worker,
            Err(error) => {
                setup
                    .outbox
                    .put(Packet::Failure(WorkError::Construction(error.to_string())));
                return;
            }
        };
        let context = WorkbenchContext::new(Contact::class(worker.class().to_string()), setup.outbox.clone());
        setup.running.set();
        debug!(class = worker.class(), "workbench running");

        if let Err(fatal) = drive(&mut *worker, &context, &setup) {
            setup.outbox.put(Packet::Failure(fatal));
        }

        // Best effort: whatever is still queued gets a response.
        while let Some(packet) = setup.inbox.try_get() {
            if let Packet::Mail(mail) = packet {
                let _ = invoke(&mut *worker, &context, mail);
            }
        }
        worker.exit();
        setup.running.clear();
        debug!(class = worker.class(), "workbench stopped");
    }
}

/// The loop body shared by start-up hooks and the mail pump. Returns the
/// fatal error that ended the loop, if any.
fn drive(
    worker: &mut dyn Worker,
    context: &WorkbenchContext,
    setup: &WorkbenchSetup,
) -> Result<(), WorkError> {
    {
        let _guard = context.activate();
        worker.post_init(context)?;
        worker.enter()?;
    }
    loop {
        if setup.terminate.is_set() {
            return Ok(());
        }
        {
            let _guard = context.activate();
            worker.tick(context);
        }
        match setup.inbox.get(POLL_INTERVAL) {
            None => continue,
            Some(Packet::Terminate) => return Ok(()),
            Some(Packet::Failure(error)) => {
                return Err(WorkError::Runtime(error.to_string()));
            }
            Some(Packet::Mail(mail)) => invoke(worker, context, mail)?,
        }
    }
}

/// Handles one mail. Per-mail errors land on the mail future and keep the
/// loop alive. A panic is recorded on the future and then ends the loop:
/// the analogue of a system-level failure that must not be swallowed.
fn invoke(
    worker: &mut dyn Worker,
    context: &WorkbenchContext,
    mail: Mail,
) -> Result<(), WorkError> {
    trace!(instruction = %mail.instruction, "handling mail");
    let future = mail.future.clone();
    let _guard = context.activate();
    match catch_unwind(AssertUnwindSafe(|| worker.handle(mail, context))) {
        Ok(()) => Ok(()),
        Err(payload) => {
            let reason = panic_text(payload.as_ref());
            let fatal = WorkError::Runtime(format!("worker panicked: {reason}"));
            complete(future.as_ref(), Err(fatal.clone()));
            Err(fatal)
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "non-string panic payload"
    }
}

/// A workbench that permits intra-worker concurrency: several dispatcher
/// threads pull from the inbox and serialize on the worker behind a lock, so
/// slow instruction bodies overlap their waiting.
#[derive(Clone, Copy, Debug)]
pub struct ConcurrentLoopWorkbench {
    threads: usize,
}

impl Default for ConcurrentLoopWorkbench {
    fn default() -> Self {
        ConcurrentLoopWorkbench { threads: 2 }
    }
}

impl ConcurrentLoopWorkbench {
    /// A concurrent loop with `threads` dispatchers (at least one).
    pub fn new(threads: usize) -> Self {
        ConcurrentLoopWorkbench {
            threads: threads.max(1),
        }
    }
}

impl Workbench for ConcurrentLoopWorkbench {
    fn run(&mut self, setup: WorkbenchSetup) {
        let worker = match setup.worker_creator.create() {
            Ok(worker) => worker,
            Err(error) => {
                setup
                    .outbox
                    .put(Packet::Failure(WorkError::Construction(error.to_string())));
                return;
            }
        };
        let class = worker.class();
        let context = WorkbenchContext::new(Contact::class(class.to_string()), setup.outbox.clone());
        let worker = Arc::new(Mutex::new(worker));

        {
            let mut guard = worker.lock().expect("worker lock");
            let _active = context.activate();
            if let Err(error) = guard.post_init(&context).and_then(|()| guard.enter()) {
                setup.outbox.put(Packet::Failure(error));
                return;
            }
        }
        setup.running.set();
        debug!(class, threads = self.threads, "concurrent workbench running");

        let mut handles = Vec::with_capacity(self.threads);
        for index in 0..self.threads {
            let worker = Arc::clone(&worker);
            let context = context.clone();
            let inbox = setup.inbox.clone();
            let outbox = setup.outbox.clone();
            let terminate = setup.terminate.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("{class}-bench-{index}"))
                    .spawn(move || loop {
                        if terminate.is_set() {
                            return;
                        }
                        match inbox.get(POLL_INTERVAL) {
                            None => continue,
                            Some(Packet::Terminate) => {
                                // Re-post so sibling dispatchers see it too.
                                inbox.put(Packet::Terminate);
                                return;
                            }
                            Some(Packet::Failure(error)) => {
                                outbox.put(Packet::Failure(WorkError::Runtime(error.to_string())));
                                terminate.set();
                                return;
                            }
                            Some(Packet::Mail(mail)) => {
                                let mut guard = worker.lock().expect("worker lock");
                                if let Err(fatal) = invoke(&mut **guard, &context, mail) {
                                    drop(guard);
                                    outbox.put(Packet::Failure(fatal));
                                    terminate.set();
                                    return;
                                }
                            }
                        }
                    })
                    .expect("spawn workbench dispatcher"),
            );
        }
        for handle in handles {
            let _ = handle.join();
        }
        worker.lock().expect("worker lock").exit();
        setup.running.clear();
        debug!(class, "concurrent workbench stopped");
    }
}
