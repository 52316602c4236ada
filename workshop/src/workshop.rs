//! The public facade: register workers, start the supervisor, send messages.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::creator::Creator;
use crate::custodian::Custodian;
use crate::error::WorkError;
use crate::future::Future;
use crate::mailbox::Packet;
use crate::message::Message;
use crate::registry::{
    builtin_stations, builtin_workbenches, Registry, StationBuilder, StationPlan,
    WorkbenchBuilder,
};
use crate::station::{Station, ThreadStation};
use crate::supervisor::{Supervisor, WorkerSpec};
use crate::value::Args;
use crate::workbench::{LoopWorkbench, Workbench};
use crate::worker::{Worker, WorkerClass, WorkerSpawnSpec};

/// How long `start` waits for the supervisor loop to come up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-registration options.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Globally unique worker id; derived from the class when absent.
    pub id: Option<String>,
    /// Optional display name.
    pub name: Option<String>,
    /// Station kind, resolved against the station registry.
    pub station: String,
    /// Workbench kind, resolved against the workbench registry.
    pub workbench: String,
    /// Construction arguments shipped to process-station children.
    pub spawn_args: Args,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            id: None,
            name: None,
            station: "thread".into(),
            workbench: "loop".into(),
            spawn_args: Args::new(),
        }
    }
}

/// A supervisor worker on its own station, plus the registrations it manages.
///
/// Dropping a workshop stops it; the custodian trips any station the normal
/// shutdown path missed.
pub struct Workshop {
    station_registry: Registry<StationBuilder>,
    workbench_registry: Registry<WorkbenchBuilder>,
    specs: Vec<WorkerSpec>,
    ids: BTreeSet<String>,
    next_index: u64,
    station: Option<ThreadStation>,
    custodian: Custodian,
}

impl Default for Workshop {
    fn default() -> Self {
        Workshop::new()
    }
}

impl Workshop {
    /// A workshop with the built-in station and workbench kinds in scope.
    pub fn new() -> Self {
        Workshop {
            station_registry: Registry::scoped(Arc::new(builtin_stations())),
            workbench_registry: Registry::scoped(Arc::new(builtin_workbenches())),
            specs: Vec::new(),
            ids: BTreeSet::new(),
            next_index: 0,
            station: None,
            custodian: Custodian::new(),
        }
    }

    /// The workshop-scoped station registry, for adds/overrides/excludes.
    pub fn station_registry(&mut self) -> &mut Registry<StationBuilder> {
        &mut self.station_registry
    }

    /// The workshop-scoped workbench registry.
    pub fn workbench_registry(&mut self) -> &mut Registry<WorkbenchBuilder> {
        &mut self.workbench_registry
    }

    /// Registers worker class `W` with default options.
    pub fn register<W, F>(&mut self, build: F) -> Result<String, WorkError>
    where
        W: Worker + WorkerClass,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.register_with(WorkerOptions::default(), build)
    }

    /// Registers worker class `W`, choosing station and workbench kinds.
    ///
    /// Registration happens before `start`; the supervisor creates and starts
    /// every registered station during its own post-init.
    pub fn register_with<W, F>(
        &mut self,
        options: WorkerOptions,
        build: F,
    ) -> Result<String, WorkError>
    where
        W: Worker + WorkerClass,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.register_creator::<W>(
            options,
            Creator::new(move || Box::new(build()) as Box<dyn Worker>),
        )
    }

    /// Registers worker class `W` from an instance creator, which may fail at
    /// construction time; the failure surfaces through the station outbox.
    pub fn register_creator<W>(
        &mut self,
        options: WorkerOptions,
        creator: Creator<Box<dyn Worker>>,
    ) -> Result<String, WorkError>
    where
        W: WorkerClass,
    {
        if self.station.is_some() {
            return Err(WorkError::StationState("register".to_string()));
        }
        let id = match options.id {
            Some(id) if id.is_empty() => {
                return Err(WorkError::Argument("worker id must not be empty".into()))
            }
            Some(id) => id,
            None => {
                self.next_index += 1;
                format!("{}-{}", W::CLASS, self.next_index)
            }
        };
        if !self.ids.insert(id.clone()) {
            return Err(WorkError::Argument(format!("duplicate worker id `{id}`")));
        }
        let workbench_builder = self
            .workbench_registry
            .lookup(&options.workbench)
            .ok_or_else(|| {
                WorkError::Argument(format!("unknown workbench kind `{}`", options.workbench))
            })?;
        let station_builder = self.station_registry.lookup(&options.station).ok_or_else(
            || WorkError::Argument(format!("unknown station kind `{}`", options.station)),
        )?;

        let plan = StationPlan {
            worker_class: W::CLASS.to_string(),
            workbench_creator: Creator::new(move || workbench_builder()),
            worker_creator: creator,
            spawn_spec: WorkerSpawnSpec::of::<W>(options.spawn_args),
        };
        let station_creator = Creator::try_new(move || station_builder(plan.clone()));
        self.specs.push(WorkerSpec {
            id: id.clone(),
            name: options.name,
            station_creator,
        });
        debug!(%id, class = W::CLASS, "registered worker");
        Ok(id)
    }

    /// Starts the supervisor station and, through it, every worker station.
    pub fn start(&mut self) -> Result<(), WorkError> {
        if self.station.is_some() {
            return Err(WorkError::StationState("start".to_string()));
        }
        let specs = self.specs.clone();
        let custodian = self.custodian.clone();
        let worker_creator = Creator::new(move || {
            Box::new(Supervisor::new(specs.clone(), custodian.clone())) as Box<dyn Worker>
        });
        let workbench_creator = Creator::new(|| Box::new(LoopWorkbench) as Box<dyn Workbench>);
        let mut station =
            ThreadStation::new(workbench_creator, worker_creator, Supervisor::CLASS);
        station.start()?;
        self.custodian.track(&station.stop_hook());
        if !station.wait_running(STARTUP_TIMEOUT) {
            if let Some(Packet::Failure(error)) = station.recv(Duration::ZERO) {
                return Err(error);
            }
            return Err(WorkError::Runtime(
                "supervisor never signalled readiness".into(),
            ));
        }
        self.station = Some(station);
        Ok(())
    }

    /// True while the supervisor loop is live.
    pub fn is_running(&self) -> bool {
        self.station
            .as_ref()
            .is_some_and(|station| station.is_running())
    }

    /// Sends a message in from the outside and returns the result future.
    pub fn submit(&self, message: Message) -> Result<Future, WorkError> {
        let station = self
            .station
            .as_ref()
            .ok_or(WorkError::StationState("submit".to_string()))?;
        let future = Future::new();
        for mail in message.into_mails(None, Some(future.clone()))? {
            station.send(mail);
        }
        Ok(future)
    }

    /// Sends a message in from the outside, fire-and-forget.
    pub fn emit(&self, message: Message) -> Result<(), WorkError> {
        let station = self
            .station
            .as_ref()
            .ok_or(WorkError::StationState("emit".to_string()))?;
        for mail in message.into_mails(None, None)? {
            station.send(mail);
        }
        Ok(())
    }

    /// The next fatal failure escalated by the supervisor, if one is queued.
    pub fn failure(&self) -> Option<WorkError> {
        let station = self.station.as_ref()?;
        while let Some(packet) = station.recv(Duration::ZERO) {
            if let Packet::Failure(error) = packet {
                return Some(error);
            }
        }
        None
    }

    /// Stops the supervisor station, which stops every worker station, and
    /// trips anything the custodian still tracks. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut station) = self.station.take() {
            station.stop();
        }
        self.custodian.stop_all();
    }
}

impl Drop for Workshop {
    fn drop(&mut self) {
        self.stop();
    }
}
