//! A station hosting its workbench in a child process.
//!
//! The parent spawns a child of the current executable with the connection
//! address in the environment; the child calls [`bootstrap_from_env`] early
//! in `main`, connects back over loopback TCP, rebuilds the worker from the
//! spawn registry, and runs an ordinary loop workbench. Mails and futures
//! cross the boundary as [`Frame`]s; see [`crate::wire`] for the format and
//! the future-id discipline.

use std::collections::HashMap;
use std::env;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::WorkError;
use crate::event::Event;
use crate::future::Future;
use crate::mail::Mail;
use crate::mailbox::{Mailbox, Packet};
use crate::station::{Station, StationState, StopHook};
use crate::wire::{read_frame, write_frame, Frame, WireMail};
use crate::workbench::{LoopWorkbench, Workbench, WorkbenchSetup};
use crate::worker::WorkerSpawnSpec;

/// Environment variable carrying the parent's loopback address to the child.
pub const STATION_ADDR_ENV: &str = "ATELIER_STATION_ADDR";

/// How long the parent waits for the child to connect and report ready.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process start strategies accepted by the station registry.
///
/// Rust has no safe in-process `fork`; every kind starts a fresh child of the
/// current executable, and the kind is retained for registry compatibility.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpawnKind {
    /// Fresh child process.
    Spawn,
    /// Accepted alias of `Spawn`.
    Fork,
    /// Accepted alias of `Spawn`.
    ForkServer,
}

/// Runs a workbench in a child process, bridged over a wire connection.
///
/// The parent-side pending map keyed by future id is the future-proxy
/// manager: a submitted mail leaves its future here and travels with the id;
/// the child's completion frame resolves it.
pub struct ProcessStation {
    spawn_spec: WorkerSpawnSpec,
    kind: SpawnKind,
    inbox: Mailbox,
    outbox: Mailbox,
    running: Event,
    terminate: Event,
    pending: Arc<Mutex<HashMap<u64, Future>>>,
    next_future: Arc<AtomicU64>,
    child: Option<Child>,
    threads: Vec<JoinHandle<()>>,
    state: StationState,
    hook: Arc<StopHook>,
}

impl ProcessStation {
    /// A station that will host a worker built from `spawn_spec`.
    pub fn new(spawn_spec: WorkerSpawnSpec, kind: SpawnKind) -> Self {
        let inbox = Mailbox::new();
        let terminate = Event::new();
        let hook = Arc::new(StopHook {
            terminate: terminate.clone(),
            inbox: inbox.clone(),
        });
        ProcessStation {
            spawn_spec,
            kind,
            inbox,
            outbox: Mailbox::new(),
            running: Event::new(),
            terminate,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_future: Arc::new(AtomicU64::new(1)),
            child: None,
            threads: Vec::new(),
            state: StationState::Initial,
            hook,
        }
    }

    fn accept_child(listener: &TcpListener, child: &mut Child) -> Result<TcpStream, WorkError> {
        listener
            .set_nonblocking(true)
            .map_err(|error| WorkError::Wire(error.to_string()))?;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .and_then(|()| stream.set_nodelay(true))
                        .map_err(|error| WorkError::Wire(error.to_string()))?;
                    return Ok(stream);
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(WorkError::Construction(format!(
                            "station child exited during handshake: {status}"
                        )));
                    }
                    if Instant::now() >= deadline {
                        return Err(WorkError::Construction(
                            "station child never connected".into(),
                        ));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(error) => return Err(WorkError::Wire(error.to_string())),
            }
        }
    }
}

impl Station for ProcessStation {
    fn start(&mut self) -> Result<(), WorkError> {
        if self.state != StationState::Initial {
            return Err(WorkError::StationState("start".to_string()));
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|error| WorkError::Wire(error.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|error| WorkError::Wire(error.to_string()))?;
        let exe = env::current_exe().map_err(|error| WorkError::Construction(error.to_string()))?;

        // The child must not inherit a user-installed interrupt handler
        // mid-spawn; the mask is restored immediately after.
        let mut child = with_signals_masked(|| {
            Command::new(&exe)
                .env(STATION_ADDR_ENV, addr.to_string())
                .spawn()
        })
        .map_err(|error| WorkError::Construction(error.to_string()))?;
        debug!(kind = ?self.kind, class = %self.spawn_spec.class, pid = child.id(), "spawned station child");

        let mut stream = match Self::accept_child(&listener, &mut child) {
            Ok(stream) => stream,
            Err(error) => {
                let _ = child.kill();
                return Err(error);
            }
        };
        write_frame(&mut stream, &Frame::Spawn(self.spawn_spec.clone()))?;
        match read_frame(&mut stream)? {
            Frame::Hello { class } if class == self.spawn_spec.class => {}
            Frame::Failure(error) => {
                let _ = child.kill();
                return Err(error);
            }
            other => {
                let _ = child.kill();
                return Err(WorkError::Wire(format!("unexpected handshake frame {other:?}")));
            }
        }
        self.running.set();
        self.child = Some(child);

        let (out_tx, out_rx): (Sender<Frame>, Receiver<Frame>) = unbounded();

        // Writer: the only thread touching the send half of the stream.
        let mut write_stream = stream
            .try_clone()
            .map_err(|error| WorkError::Wire(error.to_string()))?;
        self.threads.push(
            thread::Builder::new()
                .name("station-writer".into())
                .spawn(move || {
                    while let Ok(frame) = out_rx.recv() {
                        let last = matches!(frame, Frame::Terminate);
                        if let Err(error) = write_frame(&mut write_stream, &frame) {
                            warn!(%error, "station writer failed");
                            return;
                        }
                        if last {
                            return;
                        }
                    }
                })
                .expect("spawn station writer"),
        );

        // Pump: inbox packets become wire frames; submitted futures park in
        // the pending map under a fresh id.
        let inbox = self.inbox.clone();
        let terminate = self.terminate.clone();
        let pending = Arc::clone(&self.pending);
        let next_future = Arc::clone(&self.next_future);
        let pump_tx = out_tx.clone();
        self.threads.push(
            thread::Builder::new()
                .name("station-pump".into())
                .spawn(move || loop {
                    if terminate.is_set() {
                        let _ = pump_tx.send(Frame::Terminate);
                        return;
                    }
                    match inbox.get(POLL_INTERVAL) {
                        None => continue,
                        Some(Packet::Terminate) => {
                            let _ = pump_tx.send(Frame::Terminate);
                            return;
                        }
                        Some(Packet::Failure(error)) => {
                            warn!(%error, "failure packet on a process-station inbox");
                        }
                        Some(Packet::Mail(mail)) => {
                            let future_id = mail.future.as_ref().map(|future| {
                                let id = next_future.fetch_add(1, Ordering::Relaxed);
                                pending
                                    .lock()
                                    .expect("pending futures lock")
                                    .insert(id, future.clone());
                                id
                            });
                            let _ = pump_tx.send(Frame::Mail(WireMail::from_mail(&mail, future_id)));
                        }
                    }
                })
                .expect("spawn station pump"),
        );

        // Reader: completions resolve parked futures; emitted mails surface
        // on the outbox with a proxy future that answers back over the wire.
        let outbox = self.outbox.clone();
        let running = self.running.clone();
        let terminate = self.terminate.clone();
        let pending = Arc::clone(&self.pending);
        self.threads.push(
            thread::Builder::new()
                .name("station-reader".into())
                .spawn(move || loop {
                    match read_frame(&mut stream) {
                        Ok(Frame::Completion { future, outcome }) => {
                            let parked = pending
                                .lock()
                                .expect("pending futures lock")
                                .remove(&future);
                            match (parked, outcome) {
                                (Some(parked), Ok(value)) => {
                                    let _ = parked.set_result(value);
                                }
                                (Some(parked), Err(error)) => {
                                    let _ = parked.set_failure(error);
                                }
                                (None, _) => warn!(future, "completion for unknown future"),
                            }
                        }
                        Ok(Frame::Emitted(wire_mail)) => {
                            outbox.put_mail(proxy_mail(wire_mail, &out_tx));
                        }
                        Ok(Frame::Failure(error)) => {
                            outbox.put(Packet::Failure(error));
                        }
                        Ok(Frame::Terminate) => {
                            running.clear();
                            return;
                        }
                        Ok(other) => warn!(?other, "unexpected frame from station child"),
                        Err(error) => {
                            if !terminate.is_set() {
                                outbox.put(Packet::Failure(error));
                            }
                            running.clear();
                            return;
                        }
                    }
                })
                .expect("spawn station reader"),
        );

        self.state = StationState::Started;
        Ok(())
    }

    fn stop(&mut self) {
        if self.state != StationState::Started {
            return;
        }
        self.inbox.put(Packet::Terminate);
        self.terminate.set();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(20))
                    }
                    _ => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        self.running.clear();
        self.state = StationState::Stopped;
        debug!(class = %self.spawn_spec.class, "process station stopped");
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
        &self.spawn_spec.class
    }

    fn stop_hook(&self) -> Arc<StopHook> {
        Arc::clone(&self.hook)
    }
}

impl Drop for ProcessStation {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Rehydrates an emitted wire mail with a proxy future that forwards its
/// resolution back over the connection.
fn proxy_mail(wire_mail: WireMail, out_tx: &Sender<Frame>) -> Mail {
    let WireMail {
        instruction,
        args,
        future,
        meta,
    } = wire_mail;
    let future = future.map(|id| {
        let proxy = Future::new();
        let out_tx = out_tx.clone();
        proxy.add_done_callback(move |done| {
            let outcome = match done.result(Some(Duration::ZERO)) {
                Ok(value) => Ok(value),
                Err(crate::error::FutureError::Failed(error)) => Err(error),
                Err(other) => Err(WorkError::Runtime(other.to_string())),
            };
            let _ = out_tx.send(Frame::Completion {
                future: id,
                outcome,
            });
        });
        proxy
    });
    Mail {
        instruction,
        args,
        future,
        meta,
    }
}

/// Runs the child side of a process station when the spawn environment is
/// present, then exits the process; returns `false` in an ordinary process.
///
/// Host binaries that use process stations call this at the very top of
/// `main`, after registering their spawnable worker classes.
pub fn bootstrap_from_env() -> bool {
    let addr = match env::var(STATION_ADDR_ENV) {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    let code = match run_child(&addr) {
        Ok(()) => 0,
        Err(error) => {
            warn!(%error, "station child failed");
            1
        }
    };
    std::process::exit(code);
}

/// The child side of a process-station connection: connect to `addr`, build
/// the worker the parent asks for, and pump frames until terminated.
///
/// [`bootstrap_from_env`] wraps this; it is public for hosts that manage
/// their own child entry point (and for exercising the wire protocol).
pub fn run_child(addr: &str) -> Result<(), WorkError> {
    let mut stream =
        TcpStream::connect(addr).map_err(|error| WorkError::Wire(error.to_string()))?;
    stream
        .set_nodelay(true)
        .map_err(|error| WorkError::Wire(error.to_string()))?;

    let spec = match read_frame(&mut stream)? {
        Frame::Spawn(spec) => spec,
        other => {
            return Err(WorkError::Wire(format!(
                "expected spawn frame, got {other:?}"
            )))
        }
    };
    let (out_tx, out_rx): (Sender<Frame>, Receiver<Frame>) = unbounded();
    let worker = match spec.create() {
        Ok(worker) => worker,
        Err(error) => {
            write_frame(&mut stream, &Frame::Failure(error.clone()))?;
            return Err(error);
        }
    };

    let inbox = Mailbox::new();
    let outbox = Mailbox::new();
    let running = Event::new();
    let terminate = Event::new();

    // The workbench rebuilds nothing: the worker is handed over whole.
    let cell = Mutex::new(Some(worker));
    let worker_creator = crate::creator::Creator::try_new(move || {
        cell.lock()
            .expect("worker cell lock")
            .take()
            .ok_or_else(|| WorkError::Construction("station worker already taken".into()))
    });
    let setup = WorkbenchSetup {
        worker_creator,
        inbox: inbox.clone(),
        outbox: outbox.clone(),
        running: running.clone(),
        terminate: terminate.clone(),
    };
    let bench = thread::Builder::new()
        .name("child-workbench".into())
        .spawn(move || LoopWorkbench.run(setup))
        .map_err(|error| WorkError::Runtime(error.to_string()))?;

    if !running.wait_timeout(HANDSHAKE_TIMEOUT) {
        return Err(WorkError::Construction(
            "child workbench never signalled readiness".into(),
        ));
    }

    // Writer thread owns the send half.
    let mut write_stream = stream
        .try_clone()
        .map_err(|error| WorkError::Wire(error.to_string()))?;
    let writer = thread::Builder::new()
        .name("child-writer".into())
        .spawn(move || {
            while let Ok(frame) = out_rx.recv() {
                let last = matches!(frame, Frame::Terminate);
                if write_frame(&mut write_stream, &frame).is_err() || last {
                    return;
                }
            }
        })
        .map_err(|error| WorkError::Runtime(error.to_string()))?;
    out_tx
        .send(Frame::Hello {
            class: spec.class.clone(),
        })
        .map_err(|error| WorkError::Wire(error.to_string()))?;

    // Outbox pump: worker emissions and fatal failures travel up.
    let child_pending: Arc<Mutex<HashMap<u64, Future>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(1));
    let pump = {
        let outbox = outbox.clone();
        let out_tx = out_tx.clone();
        let terminate = terminate.clone();
        let child_pending = Arc::clone(&child_pending);
        let next_id = Arc::clone(&next_id);
        thread::Builder::new()
            .name("child-pump".into())
            .spawn(move || loop {
                if terminate.is_set() && outbox.is_empty() {
                    return;
                }
                match outbox.get(POLL_INTERVAL) {
                    None => continue,
                    Some(Packet::Terminate) => return,
                    Some(Packet::Failure(error)) => {
                        let _ = out_tx.send(Frame::Failure(error));
                    }
                    Some(Packet::Mail(mail)) => {
                        let future_id = mail.future.as_ref().map(|future| {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            child_pending
                                .lock()
                                .expect("child pending lock")
                                .insert(id, future.clone());
                            id
                        });
                        let _ = out_tx.send(Frame::Emitted(WireMail::from_mail(&mail, future_id)));
                    }
                }
            })
            .map_err(|error| WorkError::Runtime(error.to_string()))?
    };

    // Reader loop on this thread: parent mails in, completions for the
    // worker's own submissions back to their futures.
    loop {
        match read_frame(&mut stream) {
            Ok(Frame::Mail(wire_mail)) => {
                inbox.put_mail(proxy_mail(wire_mail, &out_tx));
            }
            Ok(Frame::Completion { future, outcome }) => {
                let parked = child_pending
                    .lock()
                    .expect("child pending lock")
                    .remove(&future);
                match (parked, outcome) {
                    (Some(parked), Ok(value)) => {
                        let _ = parked.set_result(value);
                    }
                    (Some(parked), Err(error)) => {
                        let _ = parked.set_failure(error);
                    }
                    (None, _) => warn!(future, "completion for unknown child future"),
                }
            }
            Ok(Frame::Terminate) | Err(_) => break,
            Ok(other) => warn!(?other, "unexpected frame from station parent"),
        }
    }

    inbox.put(Packet::Terminate);
    let _ = bench.join();
    terminate.set();
    let _ = pump.join();
    let _ = out_tx.send(Frame::Terminate);
    let _ = writer.join();
    Ok(())
}

#[cfg(unix)]
fn with_signals_masked<T>(body: impl FnOnce() -> T) -> T {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        let mut previous: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut previous);
        let result = body();
        libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut());
        result
    }
}

#[cfg(not(unix))]
fn with_signals_masked<T>(body: impl FnOnce() -> T) -> T {
    body()
}
