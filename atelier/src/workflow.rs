//! The dependency-aware workflow scheduler.
//!
//! Tasks enter a [`DependencyChain`] keyed by name; a run dispatches them to
//! the pool level by level (`bfs`), eagerly on completion (`dfs`), or both at
//! once (`mix`), under an independent/dependent worker split. Each loop
//! iteration is a heartbeat: harvest ready futures, run the optional handler,
//! wait out the interval.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use atelier_chain::{ChainError, DependencyChain};
use atelier_workshop::event::Event;
use atelier_workshop::value::Value;
use atelier_workshop::{FutureError, WorkError};

use crate::executor::{ExecutorConfig, HybridPoolExecutor};
use crate::task::{Placeholder, Task};

/// Dispatch strategy for dependent tasks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum WorkflowMode {
    /// DFS on completions plus BFS bookkeeping, together.
    #[default]
    Mix,
    /// Level by level; a level must finish before the next is dispatched.
    Bfs,
    /// Eagerly enqueue successors whose predecessors are all done.
    Dfs,
}

/// The optional per-iteration callback.
#[derive(Clone)]
pub enum Heartbeat {
    /// A free callable (bound arguments live in its captures).
    Call(Arc<dyn Fn() + Send + Sync>),
    /// A nested workflow whose `run` is invoked synchronously.
    Nested(Arc<Mutex<Workflow>>),
}

/// Scheduler-level failures.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum WorkflowError {
    /// Cyclic, missing, or invalid-dependency items present before a run.
    #[error("invalid task(s) exist: {0:?}")]
    InvalidItems(BTreeSet<String>),
    /// A second task with the same name.
    #[error("task `{0}` already exists")]
    DuplicateTask(String),
    /// No task with this name.
    #[error("task `{0}` not found")]
    UnknownTask(String),
    /// The task has no future yet.
    #[error("task `{0}` has not been invoked")]
    TaskNotInvoked(String),
    /// The task's callable failed and the policy said raise.
    #[error("task `{name}` failed")]
    TaskFailed {
        /// The failing task.
        name: String,
        /// The underlying failure.
        #[source]
        source: FutureError,
    },
    /// `run_detached` while the previous detached run is still going.
    #[error("workflow is still running detached")]
    StillRunning,
    /// `join` without a detached run.
    #[error("workflow is not running detached")]
    NotDetached,
    /// `join` with a timeout that elapsed.
    #[error("timed out joining the detached run")]
    JoinTimedOut,
    /// The detached run thread panicked.
    #[error("detached run panicked")]
    DetachedPanicked,
    /// The heartbeat handler may only be installed once.
    #[error("heartbeat handler was already set")]
    HeartbeatSetTwice,
    /// A chain-integrity failure.
    #[error(transparent)]
    Chain(#[from] ChainError<String>),
    /// A pool or workshop failure.
    #[error(transparent)]
    Work(#[from] WorkError),
}

type TaskMap = BTreeMap<String, Arc<Task>>;

/// Everything one run needs, detached from `&mut self` so a background
/// thread can own it. Tasks are shared, so the result view stays live.
struct RunPlan {
    mode: WorkflowMode,
    workers: usize,
    executor: Option<Arc<HybridPoolExecutor>>,
    chain: DependencyChain<String>,
    tasks: TaskMap,
    n_ind: usize,
    n_dep: usize,
    interval: Duration,
    heartbeat: Option<Heartbeat>,
}

/// A dependency-aware task scheduler over a hybrid pool.
pub struct Workflow {
    mode: WorkflowMode,
    workers: usize,
    executor: Option<Arc<HybridPoolExecutor>>,
    chain: DependencyChain<String>,
    tasks: TaskMap,
    independent_ratio: f64,
    interval: Duration,
    heartbeat: Option<Heartbeat>,
    detached: Option<(JoinHandle<Result<(), WorkflowError>>, Event)>,
}

impl Default for Workflow {
    fn default() -> Self {
        Workflow::new()
    }
}

impl Workflow {
    /// A workflow with mix mode, one worker per available core, a 0.25
    /// independent ratio, and a 100 ms wait interval.
    pub fn new() -> Self {
        Workflow {
            mode: WorkflowMode::Mix,
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            executor: None,
            chain: DependencyChain::new(),
            tasks: BTreeMap::new(),
            independent_ratio: 0.25,
            interval: Duration::from_millis(100),
            heartbeat: None,
            detached: None,
        }
    }

    /// Sets the dispatch mode.
    pub fn with_mode(mut self, mode: WorkflowMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the worker count (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Supplies an executor instead of a per-run pool.
    pub fn with_executor(mut self, executor: Arc<HybridPoolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Supplies a pre-populated dependency chain.
    pub fn with_chain(mut self, chain: DependencyChain<String>) -> Self {
        self.chain = chain;
        self
    }

    /// Sets the independent-worker ratio, clamped to `[0.05, 1.0]`.
    pub fn with_independent_ratio(mut self, ratio: f64) -> Self {
        self.independent_ratio = ratio.clamp(0.05, 1.0);
        self
    }

    /// Sets the heartbeat wait interval, at least one microsecond.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_micros(1));
        self
    }

    /// Installs the heartbeat handler; installing twice is an error.
    pub fn set_heartbeat(&mut self, heartbeat: Heartbeat) -> Result<(), WorkflowError> {
        if self.heartbeat.is_some() {
            return Err(WorkflowError::HeartbeatSetTwice);
        }
        self.heartbeat = Some(heartbeat);
        Ok(())
    }

    /// A placeholder for the named task's result.
    pub fn p(name: impl Into<String>) -> Placeholder {
        Placeholder::new(name)
    }

    /// Adds a task; its name and `after` set go into the chain.
    pub fn add(&mut self, task: Task) -> Result<(), WorkflowError> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(WorkflowError::DuplicateTask(name));
        }
        self.chain
            .add(name.clone(), task.predecessors().iter().cloned())?;
        self.tasks.insert(name, Arc::new(task));
        Ok(())
    }

    /// Removes a task and its edges.
    pub fn remove(&mut self, name: &str) -> Result<(), WorkflowError> {
        self.chain.remove(&name.to_string())?;
        self.tasks
            .remove(name)
            .ok_or_else(|| WorkflowError::UnknownTask(name.to_string()))?;
        Ok(())
    }

    /// Removes a task, re-parenting its successors onto its predecessors.
    pub fn ignore(&mut self, name: &str) -> Result<(), WorkflowError> {
        self.chain.ignore(&name.to_string())?;
        self.tasks
            .remove(name)
            .ok_or_else(|| WorkflowError::UnknownTask(name.to_string()))?;
        Ok(())
    }

    /// Number of tasks.
    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    /// A shared handle on the named task.
    pub fn task(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    /// Items in an error state.
    pub fn invalid_items(&self) -> BTreeSet<String> {
        self.chain.invalid_items()
    }

    /// Items with no edges.
    pub fn independent_items(&self) -> BTreeSet<String> {
        self.chain.independent_items()
    }

    /// Items scheduled by the dependent strategy.
    pub fn dependent_items(&self) -> BTreeSet<String> {
        self.chain.dependent_items()
    }

    fn reset_tasks(&mut self) {
        for task in self.tasks.values() {
            task.reset();
        }
    }

    fn make_plan(&self) -> RunPlan {
        let n_ind = (self.workers as f64 * self.independent_ratio).ceil() as usize;
        let n_ind = n_ind.min(self.workers).max(1);
        RunPlan {
            mode: self.mode,
            workers: self.workers,
            executor: self.executor.clone(),
            chain: self.chain.clone(),
            tasks: self.tasks.clone(),
            n_ind,
            n_dep: self.workers - n_ind,
            interval: self.interval,
            heartbeat: self.heartbeat.clone(),
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = self.chain.invalid_items();
        if !invalid.is_empty() {
            return Err(WorkflowError::InvalidItems(invalid));
        }
        Ok(())
    }

    /// Runs to completion in the calling thread.
    ///
    /// An empty workflow yields `Ok(None)`. A finished workflow re-runs from
    /// scratch: all tasks reset to uninvoked before dispatch.
    pub fn run(&mut self) -> Result<Option<WorkflowResult>, WorkflowError> {
        self.validate()?;
        if self.tasks.is_empty() {
            return Ok(None);
        }
        if WorkflowResult::new(self.tasks.clone()).ready(None)? {
            self.reset_tasks();
        }
        let result = WorkflowResult::new(self.tasks.clone());
        run_plan(self.make_plan())?;
        Ok(Some(result))
    }

    /// Launches the run on a background thread and returns the live view.
    pub fn run_detached(&mut self) -> Result<WorkflowResult, WorkflowError> {
        self.validate()?;
        if self
            .detached
            .as_ref()
            .is_some_and(|(_, done)| !done.is_set())
        {
            return Err(WorkflowError::StillRunning);
        }
        if self.detached.is_some() {
            self.join(None)?;
        }
        if WorkflowResult::new(self.tasks.clone()).ready(None)? {
            self.reset_tasks();
        }
        let result = WorkflowResult::new(self.tasks.clone());
        let plan = self.make_plan();
        let done = Event::new();
        let finished = done.clone();
        let handle = thread::Builder::new()
            .name("workflow-run".into())
            .spawn(move || {
                let outcome = run_plan(plan);
                finished.set();
                outcome
            })
            .map_err(|error| WorkflowError::Work(WorkError::Runtime(error.to_string())))?;
        self.detached = Some((handle, done));
        Ok(result)
    }

    /// Waits for the detached run; a bounded wait with `Some(timeout)`.
    ///
    /// Does not cancel in-flight tasks on timeout; the run keeps going and
    /// can be joined again.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<(), WorkflowError> {
        let (handle, done) = self.detached.take().ok_or(WorkflowError::NotDetached)?;
        let finished = match timeout {
            Some(timeout) => done.wait_timeout(timeout),
            None => {
                done.wait();
                true
            }
        };
        if !finished {
            self.detached = Some((handle, done));
            return Err(WorkflowError::JoinTimedOut);
        }
        handle.join().map_err(|_| WorkflowError::DetachedPanicked)?
    }
}

/// Per-task and overall completion view over a run's shared tasks.
pub struct WorkflowResult {
    tasks: TaskMap,
    done: Mutex<BTreeSet<String>>,
    all_done: Mutex<bool>,
}

impl std::fmt::Debug for WorkflowResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowResult")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkflowResult {
    fn new(tasks: TaskMap) -> Self {
        WorkflowResult {
            tasks,
            done: Mutex::new(BTreeSet::new()),
            all_done: Mutex::new(false),
        }
    }

    /// Whether `name` (or, with `None`, every task) has completed.
    pub fn ready(&self, name: Option<&str>) -> Result<bool, WorkflowError> {
        if let Some(name) = name {
            if !self.tasks.contains_key(name) {
                return Err(WorkflowError::UnknownTask(name.to_string()));
            }
        }
        if *self.all_done.lock().expect("result lock") {
            return Ok(true);
        }
        let mut done = self.done.lock().expect("result lock");
        if let Some(name) = name {
            if done.contains(name) {
                return Ok(true);
            }
        }
        for (task_name, task) in &self.tasks {
            if done.contains(task_name) {
                continue;
            }
            if task.ready() {
                done.insert(task_name.clone());
            } else if name.is_none() {
                return Ok(false);
            }
        }
        if done.len() == self.tasks.len() {
            *self.all_done.lock().expect("result lock") = true;
            return Ok(true);
        }
        Ok(name.is_some_and(|name| done.contains(name)))
    }

    /// The named task's result, or `None` while it is not ready.
    pub fn get(&self, name: &str) -> Result<Option<Value>, WorkflowError> {
        if self.ready(Some(name))? {
            let task = &self.tasks[name];
            return task.get().map(Some);
        }
        Ok(None)
    }

    /// Results of every ready task.
    pub fn get_all(&self) -> Result<BTreeMap<String, Value>, WorkflowError> {
        let mut all = BTreeMap::new();
        for (name, task) in &self.tasks {
            if self.ready(Some(name))? {
                all.insert(name.clone(), task.get()?);
            }
        }
        Ok(all)
    }
}

fn run_plan(plan: RunPlan) -> Result<(), WorkflowError> {
    if plan.workers == 1 && plan.executor.is_none() && plan.heartbeat.is_none() {
        return run_single(&plan);
    }
    run_parallel(&plan)
}

fn run_parallel(plan: &RunPlan) -> Result<(), WorkflowError> {
    let owned = match &plan.executor {
        Some(_) => None,
        None => Some(HybridPoolExecutor::with_config(ExecutorConfig::with_workers(
            plan.workers,
        ))),
    };
    let executor: &HybridPoolExecutor = match &plan.executor {
        Some(executor) => executor,
        None => owned.as_ref().expect("owned executor"),
    };
    debug!(mode = ?plan.mode, workers = plan.workers, tasks = plan.tasks.len(), "workflow run");
    let outcome = if plan.chain.levels() == 0 {
        run_simple(executor, plan)
    } else {
        match plan.mode {
            WorkflowMode::Mix => run_mix(executor, plan),
            WorkflowMode::Bfs => run_bfs(executor, plan),
            WorkflowMode::Dfs => run_dfs(executor, plan),
        }
    };
    if let Some(owned) = owned {
        owned.shutdown();
    }
    outcome
}

/// One scheduler tick's tail: harvest ready futures into `done` (feeding the
/// DFS analyze set), run the handler, wait out the interval.
fn heartbeat(
    event: &Event,
    interval: Duration,
    tasks: &TaskMap,
    done: &mut BTreeSet<String>,
    mut analyze: Option<&mut BTreeSet<String>>,
    handler: Option<&Heartbeat>,
) -> Result<(), WorkflowError> {
    for (name, task) in tasks {
        if done.contains(name) || !task.ready() {
            continue;
        }
        task.get()?;
        done.insert(name.clone());
        if let Some(analyze) = analyze.as_deref_mut() {
            analyze.insert(name.clone());
        }
    }
    match handler {
        Some(Heartbeat::Call(call)) => call(),
        Some(Heartbeat::Nested(workflow)) => {
            workflow.lock().expect("nested workflow lock").run()?;
        }
        None => {}
    }
    event.wait_timeout(interval);
    Ok(())
}

fn dispatch(
    executor: &HybridPoolExecutor,
    tasks: &TaskMap,
    task: &Arc<Task>,
) -> Result<(), WorkflowError> {
    let call = task.fill_placeholders(tasks)?;
    let func = task.func();
    let future = executor.submit(move || func(call), Some(format!("task-{}", task.name())))?;
    task.assign(future);
    Ok(())
}

/// Dispatches independents against the independent quota, or all of them
/// once the remaining dependents fit inside the dependent quota.
fn apply_ind(
    executor: &HybridPoolExecutor,
    tasks: &TaskMap,
    ind_set: &BTreeSet<String>,
    dep_set: &BTreeSet<String>,
    done: &BTreeSet<String>,
    ind_running: &mut BTreeSet<String>,
    n_dep: usize,
    n_ind: usize,
) -> Result<(), WorkflowError> {
    if ind_set.iter().all(|name| done.contains(name)) {
        return Ok(());
    }
    ind_running.retain(|name| !done.contains(name));
    let remaining_dep = dep_set.iter().filter(|name| !done.contains(*name)).count();
    let run_all = remaining_dep <= n_dep;
    if ind_running.len() < n_ind {
        for name in ind_set {
            let task = &tasks[name];
            if task.invoked() {
                continue;
            }
            dispatch(executor, tasks, task)?;
            ind_running.insert(name.clone());
            if run_all {
                continue;
            }
            if ind_running.len() >= n_ind {
                break;
            }
        }
    }
    Ok(())
}

fn apply_bfs(
    executor: &HybridPoolExecutor,
    chain: &DependencyChain<String>,
    tasks: &TaskMap,
    level_tasks: BTreeSet<String>,
    done: &BTreeSet<String>,
    curr_level: u64,
    n_levels: u64,
) -> Result<(u64, BTreeSet<String>), WorkflowError> {
    if level_tasks.iter().all(|name| done.contains(name)) {
        if curr_level + 1 < n_levels {
            let next = curr_level + 1;
            return Ok((next, chain.get_level(next as i64)?));
        }
        return Ok((curr_level, level_tasks));
    }
    for name in &level_tasks {
        let task = &tasks[name];
        if !task.invoked() {
            dispatch(executor, tasks, task)?;
        }
    }
    Ok((curr_level, level_tasks))
}

/// For every freshly completed item, dispatch each successor whose
/// predecessors are all done.
fn apply_dfs(
    executor: &HybridPoolExecutor,
    chain: &DependencyChain<String>,
    tasks: &TaskMap,
    done: &BTreeSet<String>,
    analyze: &mut BTreeSet<String>,
) -> Result<(), WorkflowError> {
    let items: Vec<String> = analyze.iter().cloned().collect();
    for item in items {
        for succ in chain.sub_of(&item, false, false)? {
            let task = &tasks[&succ];
            if !task.invoked()
                && chain
                    .sup_of(&succ, false)?
                    .iter()
                    .all(|pred| done.contains(pred))
            {
                dispatch(executor, tasks, task)?;
            }
        }
    }
    analyze.clear();
    Ok(())
}

/// The recursive DFS step: before dispatching a successor, climb across its
/// other not-yet-invoked predecessors so shared ancestors are not skipped.
fn apply_dfs_recv(
    executor: &HybridPoolExecutor,
    chain: &DependencyChain<String>,
    tasks: &TaskMap,
    done: &BTreeSet<String>,
    visit: &mut BTreeSet<String>,
    name: &String,
) -> Result<(), WorkflowError> {
    for succ in chain.sub_of(name, false, false)? {
        let task = &tasks[&succ];
        if task.invoked() {
            continue;
        }
        let preds = chain.sup_of(&succ, false)?;
        for pred in &preds {
            if pred == name || visit.contains(pred) {
                continue;
            }
            if tasks[pred].invoked() {
                continue;
            }
            visit.insert(pred.clone());
            for grand in chain.sup_of(pred, false)? {
                apply_dfs_recv(executor, chain, tasks, done, visit, &grand)?;
            }
        }
        if preds.iter().all(|pred| done.contains(pred)) {
            dispatch(executor, tasks, task)?;
        }
    }
    Ok(())
}

/// All-independent workloads: everything in flight at once, subject only to
/// the pool's worker cap.
fn run_simple(executor: &HybridPoolExecutor, plan: &RunPlan) -> Result<(), WorkflowError> {
    let total = plan.tasks.len();
    let mut done = BTreeSet::new();
    let event = Event::new();
    for task in plan.tasks.values() {
        dispatch(executor, &plan.tasks, task)?;
    }
    while done.len() != total {
        heartbeat(
            &event,
            plan.interval,
            &plan.tasks,
            &mut done,
            None,
            plan.heartbeat.as_ref(),
        )?;
    }
    Ok(())
}

fn run_bfs(executor: &HybridPoolExecutor, plan: &RunPlan) -> Result<(), WorkflowError> {
    let total = plan.chain.len();
    let mut done = BTreeSet::new();
    let ind_set = plan.chain.independent_items();
    let dep_set = plan.chain.dependent_items();
    let n_levels = plan.chain.levels();
    let mut curr_level = 0u64;
    let mut level_tasks = plan.chain.get_level(0)?;
    let mut ind_running = BTreeSet::new();
    let event = Event::new();

    while done.len() != total {
        apply_ind(
            executor,
            &plan.tasks,
            &ind_set,
            &dep_set,
            &done,
            &mut ind_running,
            plan.n_dep,
            plan.n_ind,
        )?;
        (curr_level, level_tasks) = apply_bfs(
            executor,
            &plan.chain,
            &plan.tasks,
            level_tasks,
            &done,
            curr_level,
            n_levels,
        )?;
        heartbeat(
            &event,
            plan.interval,
            &plan.tasks,
            &mut done,
            None,
            plan.heartbeat.as_ref(),
        )?;
    }
    Ok(())
}

fn run_dfs(executor: &HybridPoolExecutor, plan: &RunPlan) -> Result<(), WorkflowError> {
    let total = plan.chain.len();
    let mut done = BTreeSet::new();
    let ind_set = plan.chain.independent_items();
    let dep_set = plan.chain.dependent_items();
    let mut ind_running = BTreeSet::new();
    let mut analyze = BTreeSet::new();
    let mut visit = BTreeSet::new();
    let event = Event::new();

    for name in plan.chain.get_level(0)? {
        dispatch(executor, &plan.tasks, &plan.tasks[&name])?;
    }
    while done.len() != total {
        apply_ind(
            executor,
            &plan.tasks,
            &ind_set,
            &dep_set,
            &done,
            &mut ind_running,
            plan.n_dep,
            plan.n_ind,
        )?;
        let items: Vec<String> = analyze.iter().cloned().collect();
        for item in &items {
            apply_dfs_recv(executor, &plan.chain, &plan.tasks, &done, &mut visit, item)?;
        }
        visit.clear();
        analyze.clear();
        heartbeat(
            &event,
            plan.interval,
            &plan.tasks,
            &mut done,
            Some(&mut analyze),
            plan.heartbeat.as_ref(),
        )?;
    }
    Ok(())
}

fn run_mix(executor: &HybridPoolExecutor, plan: &RunPlan) -> Result<(), WorkflowError> {
    let total = plan.chain.len();
    let mut done = BTreeSet::new();
    let ind_set = plan.chain.independent_items();
    let dep_set = plan.chain.dependent_items();
    let n_levels = plan.chain.levels();
    let mut curr_level = 0u64;
    let mut level_tasks = plan.chain.get_level(0)?;
    let mut ind_running = BTreeSet::new();
    let mut analyze = BTreeSet::new();
    let event = Event::new();

    while done.len() != total {
        apply_ind(
            executor,
            &plan.tasks,
            &ind_set,
            &dep_set,
            &done,
            &mut ind_running,
            plan.n_dep,
            plan.n_ind,
        )?;
        apply_dfs(executor, &plan.chain, &plan.tasks, &done, &mut analyze)?;
        (curr_level, level_tasks) = apply_bfs(
            executor,
            &plan.chain,
            &plan.tasks,
            level_tasks,
            &done,
            curr_level,
            n_levels,
        )?;
        heartbeat(
            &event,
            plan.interval,
            &plan.tasks,
            &mut done,
            Some(&mut analyze),
            plan.heartbeat.as_ref(),
        )?;
    }
    Ok(())
}

/// First the independents, then every level in order, substituting
/// placeholders immediately before each call, all in the caller's thread.
fn run_single(plan: &RunPlan) -> Result<(), WorkflowError> {
    for name in plan.chain.independent_items() {
        let task = &plan.tasks[&name];
        let call = task.fill_placeholders(&plan.tasks)?;
        task.run_local(call)?;
    }
    for level in plan.chain.level_items().collect::<Vec<_>>() {
        for name in level {
            let task = &plan.tasks[&name];
            if !task.invoked() {
                let call = task.fill_placeholders(&plan.tasks)?;
                task.run_local(call)?;
            }
        }
    }
    Ok(())
}
