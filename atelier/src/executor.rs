//! A mixed thread/process pool producing futures for submitted work.
//!
//! The thread lane grows on demand: a manager thread watches the backlog and
//! spawns workers up to the cap; workers retire themselves after an idle
//! timeout or a work budget and the manager respawns them as needed. The
//! process lane hosts *registered* jobs on process stations: closures cannot
//! cross a process boundary, so process work is named and carries only
//! serializable arguments.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use atelier_workshop::creator::Creator;
use atelier_workshop::event::Event;
use atelier_workshop::instruction::Instruction;
use atelier_workshop::mail::Mail;
use atelier_workshop::station::process::SpawnKind;
use atelier_workshop::station::{ProcessStation, Station};
use atelier_workshop::value::{Args, Value};
use atelier_workshop::worker::{Worker, WorkerClass, WorkerSpawnSpec};
use atelier_workshop::workbench::WorkbenchContext;
use atelier_workshop::{Future, WorkError};

/// Which lane a submission runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkMode {
    /// A worker thread of this process.
    Thread,
    /// A process-station child.
    Process,
}

/// Tuning knobs for the pool.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Cap on concurrently live thread workers.
    pub max_thread_workers: usize,
    /// Grow the pool with the backlog instead of spawning the cap upfront.
    pub incremental: bool,
    /// A worker with nothing to do for this long retires.
    pub idle_timeout: Duration,
    /// How long a worker blocks on the queue per attempt.
    pub wait_timeout: Duration,
    /// Work items a worker executes before it is recycled.
    pub max_work_count: usize,
    /// Total failures a worker tolerates before recycling; `None` = unlimited.
    pub max_err_count: Option<usize>,
    /// Consecutive failures a worker tolerates; `None` = unlimited.
    pub max_cons_err_count: Option<usize>,
    /// Process stations in the process lane; zero disables the lane.
    pub process_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        ExecutorConfig {
            max_thread_workers: (cpus + 4).min(32),
            incremental: true,
            idle_timeout: Duration::from_secs(60),
            wait_timeout: Duration::from_millis(100),
            max_work_count: 12,
            max_err_count: Some(3),
            max_cons_err_count: None,
            process_workers: 0,
        }
    }
}

impl ExecutorConfig {
    /// A config capped at `workers` thread workers.
    pub fn with_workers(workers: usize) -> Self {
        ExecutorConfig {
            max_thread_workers: workers.max(1),
            ..ExecutorConfig::default()
        }
    }
}

/// A unit of thread-lane work.
type Job = Box<dyn FnOnce() -> Result<Value, WorkError> + Send>;

struct WorkItem {
    name: String,
    job: Job,
}

enum Outcome {
    Done(Result<Value, WorkError>),
    /// Carries the final outcome of the work that broke the error budget.
    FailedRestart(Result<Value, WorkError>),
}

struct Response {
    worker: u64,
    work: Option<String>,
    outcome: Option<Outcome>,
    action: Action,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Action {
    Completed,
    Restart,
    IdleClose,
    Close,
}

enum Directive {
    Close,
}

struct WorkerHandle {
    directive_tx: Sender<Directive>,
    idle: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct ThreadLane {
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    response_tx: Sender<Response>,
    response_rx: Receiver<Response>,
    futures: Mutex<HashMap<String, Future>>,
    manager: Mutex<Option<JoinHandle<()>>>,
    stop: Event,
    next_worker: AtomicU64,
}

/// Submits callables to thread workers and registered jobs to process
/// stations, producing a [`Future`] per submission.
pub struct HybridPoolExecutor {
    config: ExecutorConfig,
    lane: Arc<ThreadLane>,
    next_work: AtomicU64,
    process_stations: Mutex<Vec<ProcessStation>>,
    round_robin: AtomicUsize,
}

impl HybridPoolExecutor {
    /// A pool with default tuning.
    pub fn new() -> Self {
        HybridPoolExecutor::with_config(ExecutorConfig::default())
    }

    /// A pool with explicit tuning.
    pub fn with_config(config: ExecutorConfig) -> Self {
        let (work_tx, work_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        HybridPoolExecutor {
            config,
            lane: Arc::new(ThreadLane {
                work_tx,
                work_rx,
                response_tx,
                response_rx,
                futures: Mutex::new(HashMap::new()),
                manager: Mutex::new(None),
                stop: Event::new(),
                next_worker: AtomicU64::new(0),
            }),
            next_work: AtomicU64::new(0),
            process_stations: Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Submits a callable to the thread lane.
    pub fn submit<F>(&self, job: F, name: Option<String>) -> Result<Future, WorkError>
    where
        F: FnOnce() -> Result<Value, WorkError> + Send + 'static,
    {
        if self.lane.stop.is_set() {
            return Err(WorkError::StationState("submit".to_string()));
        }
        let name = name.unwrap_or_else(|| {
            format!("work-{}", self.next_work.fetch_add(1, Ordering::Relaxed))
        });
        let future = Future::new();
        {
            let mut futures = self.lane.futures.lock().expect("futures lock");
            if futures.contains_key(&name) {
                return Err(WorkError::Argument(format!("work name `{name}` exists")));
            }
            futures.insert(name.clone(), future.clone());
        }
        self.lane.work_tx.send(WorkItem {
            name,
            job: Box::new(job),
        })
        .expect("thread lane holds its own receiver");
        self.ensure_manager();
        Ok(future)
    }

    /// Submits a registered job by name.
    ///
    /// `Process` mode routes to a process station (spinning the lane up on
    /// first use); `Thread` mode resolves the job locally and runs it on the
    /// thread lane.
    pub fn submit_registered(
        &self,
        job: &str,
        args: Args,
        mode: WorkMode,
    ) -> Result<Future, WorkError> {
        match mode {
            WorkMode::Thread => {
                let job_fn = lookup_job(job)?;
                self.submit(move || job_fn(args), None)
            }
            WorkMode::Process => {
                if self.config.process_workers == 0 {
                    return Err(WorkError::Argument(
                        "process lane is disabled (process_workers = 0)".into(),
                    ));
                }
                self.ensure_process_lane()?;
                let stations = self.process_stations.lock().expect("process lane lock");
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % stations.len();
                let future = Future::new();
                let mail = Mail::new(
                    Instruction::method(JobWorker::CLASS, job.to_string()),
                    args,
                )
                .with_future(future.clone());
                stations[index].send(mail);
                Ok(future)
            }
        }
    }

    fn ensure_manager(&self) {
        let mut manager = self.lane.manager.lock().expect("manager lock");
        if manager.is_some() {
            return;
        }
        let lane = Arc::clone(&self.lane);
        let config = self.config.clone();
        *manager = Some(
            thread::Builder::new()
                .name("pool-manager".into())
                .spawn(move || manager_loop(lane, config))
                .expect("spawn pool manager"),
        );
    }

    fn ensure_process_lane(&self) -> Result<(), WorkError> {
        let mut stations = self.process_stations.lock().expect("process lane lock");
        if !stations.is_empty() {
            return Ok(());
        }
        for _ in 0..self.config.process_workers {
            let mut station =
                ProcessStation::new(WorkerSpawnSpec::of::<JobWorker>(Args::new()), SpawnKind::Spawn);
            station.start()?;
            stations.push(station);
        }
        debug!(workers = stations.len(), "process lane started");
        Ok(())
    }

    /// Stops the manager, the thread workers, and the process lane; joins
    /// them all. Idempotent.
    pub fn shutdown(&self) {
        self.lane.stop.set();
        if let Some(manager) = self.lane.manager.lock().expect("manager lock").take() {
            let _ = manager.join();
        }
        for station in self.process_stations.lock().expect("process lane lock").iter_mut() {
            station.stop();
        }
    }
}

impl Default for HybridPoolExecutor {
    fn default() -> Self {
        HybridPoolExecutor::new()
    }
}

impl Drop for HybridPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn manager_loop(lane: Arc<ThreadLane>, config: ExecutorConfig) {
    let mut workers: HashMap<u64, WorkerHandle> = HashMap::new();
    loop {
        if lane.stop.is_set() {
            break;
        }
        adjust_workers(&lane, &config, &mut workers);
        let response = match lane.response_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(response) => response,
            Err(_) => continue,
        };
        handle_response(&lane, &config, &mut workers, response);
        // Drain whatever else is queued, bounded per tick.
        for _ in 0..16 {
            match lane.response_rx.try_recv() {
                Ok(response) => handle_response(&lane, &config, &mut workers, response),
                Err(_) => break,
            }
        }
    }
    for handle in workers.values() {
        let _ = handle.directive_tx.send(Directive::Close);
    }
    for (_, handle) in workers.drain() {
        let _ = handle.join.join();
    }
    // Results that raced the shutdown still land on their futures.
    while let Ok(response) = lane.response_rx.try_recv() {
        if let (Some(work), Some(outcome)) = (&response.work, response.outcome) {
            if let Some(future) = lane.futures.lock().expect("futures lock").remove(work) {
                let (Outcome::Done(result) | Outcome::FailedRestart(result)) = outcome;
                match result {
                    Ok(value) => {
                        let _ = future.set_result(value);
                    }
                    Err(error) => {
                        let _ = future.set_failure(error);
                    }
                }
            }
        }
    }
    // Anything never picked up fails deterministically.
    let stranded: Vec<Future> = lane
        .futures
        .lock()
        .expect("futures lock")
        .drain()
        .map(|(_, future)| future)
        .collect();
    for future in stranded {
        let _ = future.set_failure(WorkError::Runtime("executor shut down".into()));
    }
}

fn adjust_workers(
    lane: &Arc<ThreadLane>,
    config: &ExecutorConfig,
    workers: &mut HashMap<u64, WorkerHandle>,
) {
    if workers.len() >= config.max_thread_workers {
        return;
    }
    let wanted = if config.incremental {
        let idle = workers
            .values()
            .filter(|handle| handle.idle.load(Ordering::Relaxed))
            .count();
        lane.work_rx.len().saturating_sub(idle)
    } else {
        config.max_thread_workers - workers.len()
    };
    let budget = config.max_thread_workers - workers.len();
    for _ in 0..wanted.min(budget) {
        let id = lane.next_worker.fetch_add(1, Ordering::Relaxed);
        spawn_worker(lane, config, workers, id);
    }
}

fn spawn_worker(
    lane: &Arc<ThreadLane>,
    config: &ExecutorConfig,
    workers: &mut HashMap<u64, WorkerHandle>,
    id: u64,
) {
    let (directive_tx, directive_rx) = unbounded();
    let idle = Arc::new(AtomicBool::new(true));
    let work_rx = lane.work_rx.clone();
    let response_tx = lane.response_tx.clone();
    let worker_idle = Arc::clone(&idle);
    let config = config.clone();
    debug!(worker = id, "spawning pool worker");
    let join = thread::Builder::new()
        .name(format!("pool-worker-{id}"))
        .spawn(move || worker_loop(id, config, work_rx, directive_rx, response_tx, worker_idle))
        .expect("spawn pool worker");
    workers.insert(
        id,
        WorkerHandle {
            directive_tx,
            idle,
            join,
        },
    );
}

fn handle_response(
    lane: &Arc<ThreadLane>,
    config: &ExecutorConfig,
    workers: &mut HashMap<u64, WorkerHandle>,
    response: Response,
) {
    if let (Some(work), Some(outcome)) = (&response.work, response.outcome) {
        let future = lane.futures.lock().expect("futures lock").remove(work);
        let (Outcome::Done(result) | Outcome::FailedRestart(result)) = outcome;
        if let Some(future) = future {
            match result {
                Ok(value) => {
                    let _ = future.set_result(value);
                }
                Err(error) => {
                    let _ = future.set_failure(error);
                }
            }
        }
    }
    match response.action {
        Action::Completed => {}
        Action::Restart => {
            if let Some(handle) = workers.remove(&response.worker) {
                let _ = handle.join.join();
            }
            spawn_worker(lane, config, workers, response.worker);
        }
        Action::IdleClose | Action::Close => {
            if let Some(handle) = workers.remove(&response.worker) {
                let _ = handle.join.join();
            }
        }
    }
}

fn worker_loop(
    id: u64,
    config: ExecutorConfig,
    work_rx: Receiver<WorkItem>,
    directive_rx: Receiver<Directive>,
    response_tx: Sender<Response>,
    idle: Arc<AtomicBool>,
) {
    let mut work_count = 0usize;
    let mut err_count = 0usize;
    let mut cons_err_count = 0usize;
    let mut idle_tick = Instant::now();
    loop {
        if idle_tick.elapsed() > config.idle_timeout {
            debug!(worker = id, "pool worker idle timeout");
            let _ = response_tx.send(Response {
                worker: id,
                work: None,
                outcome: None,
                action: Action::IdleClose,
            });
            return;
        }
        if directive_rx.try_recv().is_ok() {
            let _ = response_tx.send(Response {
                worker: id,
                work: None,
                outcome: None,
                action: Action::Close,
            });
            return;
        }
        let item = match work_rx.recv_timeout(config.wait_timeout) {
            Ok(item) => item,
            Err(_) => continue,
        };
        idle.store(false, Ordering::Relaxed);
        let result = match catch_unwind(AssertUnwindSafe(item.job)) {
            Ok(result) => result,
            Err(_) => Err(WorkError::Runtime("pool job panicked".into())),
        };
        let failed = result.is_err();
        work_count += 1;
        if failed {
            err_count += 1;
            cons_err_count += 1;
        } else {
            cons_err_count = 0;
        }
        idle.store(true, Ordering::Relaxed);
        idle_tick = Instant::now();

        let over_err_budget = config.max_err_count.is_some_and(|max| err_count > max)
            || config
                .max_cons_err_count
                .is_some_and(|max| cons_err_count > max);
        if over_err_budget {
            warn!(worker = id, "pool worker exceeded its error budget; recycling");
            let _ = response_tx.send(Response {
                worker: id,
                work: Some(item.name),
                outcome: Some(Outcome::FailedRestart(result)),
                action: Action::Restart,
            });
            return;
        }
        let _ = response_tx.send(Response {
            worker: id,
            work: Some(item.name),
            outcome: Some(Outcome::Done(result)),
            action: Action::Completed,
        });
        if work_count >= config.max_work_count {
            let _ = response_tx.send(Response {
                worker: id,
                work: None,
                outcome: None,
                action: Action::Restart,
            });
            return;
        }
    }
}

/// Executes registered jobs by name inside process-lane children.
pub struct JobWorker;

impl WorkerClass for JobWorker {
    const CLASS: &'static str = "pool-job";
}

impl Worker for JobWorker {
    fn class(&self) -> &'static str {
        Self::CLASS
    }

    fn dispatch(
        &mut self,
        method: &str,
        args: Args,
        _ctx: &WorkbenchContext,
    ) -> Result<Value, WorkError> {
        lookup_job(method)?(args)
    }
}

/// A named, serializable-argument job runnable on either lane.
pub type JobFn = fn(Args) -> Result<Value, WorkError>;

fn job_registry() -> &'static Mutex<HashMap<&'static str, JobFn>> {
    static JOBS: OnceLock<Mutex<HashMap<&'static str, JobFn>>> = OnceLock::new();
    JOBS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a job for [`HybridPoolExecutor::submit_registered`].
///
/// Binaries using the process lane must also register [`JobWorker`] as
/// spawnable and register the same jobs before calling the station bootstrap,
/// so children can resolve them.
pub fn register_job(name: &'static str, job: JobFn) {
    job_registry().lock().expect("job registry lock").insert(name, job);
}

/// Makes [`JobWorker`] constructible inside station children.
pub fn register_job_worker_spawnable() {
    atelier_workshop::worker::register_spawnable(JobWorker::CLASS, |_args| Ok(Box::new(JobWorker)));
}

fn lookup_job(name: &str) -> Result<JobFn, WorkError> {
    job_registry()
        .lock()
        .expect("job registry lock")
        .get(name)
        .copied()
        .ok_or_else(|| WorkError::Argument(format!("unknown job `{name}`")))
}

/// Allows a creator-driven station to host a [`JobWorker`] in-process.
pub fn job_worker_creator() -> Creator<Box<dyn Worker>> {
    Creator::new(|| Box::new(JobWorker) as Box<dyn Worker>)
}
