//! The routing worker that owns every other worker's station.

use std::time::Duration;

use tracing::{debug, error, trace};

use crate::creator::Creator;
use crate::custodian::Custodian;
use crate::error::WorkError;
use crate::instruction::Instruction;
use crate::mail::{complete, Mail};
use crate::mailbox::Packet;
use crate::station::Station;
use crate::value::{Args, Value};
use crate::workbench::WorkbenchContext;
use crate::worker::{Worker, WorkerClass};

/// One registration: a globally unique worker id, an optional display name,
/// and the recipe for the station that will host the worker.
#[derive(Clone)]
pub struct WorkerSpec {
    /// Globally unique worker id.
    pub id: String,
    /// Optional display name.
    pub name: Option<String>,
    /// Builds the worker's station.
    pub station_creator: Creator<Box<dyn Station>>,
}

/// The worker at the center of a workshop.
///
/// On post-init it creates and starts one station per registration; per mail
/// it either executes its own instructions or forwards to the station whose
/// worker class matches; each tick it drains every station's outbox and
/// re-routes what workers emitted; on exit it stops everything.
pub struct Supervisor {
    specs: Vec<WorkerSpec>,
    stations: Vec<(String, Box<dyn Station>)>,
    custodian: Custodian,
}

impl Supervisor {
    /// A supervisor for the given registrations.
    pub fn new(specs: Vec<WorkerSpec>, custodian: Custodian) -> Self {
        Supervisor {
            specs,
            stations: Vec::new(),
            custodian,
        }
    }

    /// Forwards `mail` to the first (or, for notify-all, every) station whose
    /// worker class owns the instruction.
    fn route(&mut self, class: String, mail: Mail) {
        trace!(%class, notify_all = mail.meta.notify_all, "routing mail");
        if mail.meta.notify_all {
            if mail.future.is_some() {
                complete(
                    mail.future.as_ref(),
                    Err(WorkError::Argument(
                        "notify-all mails cannot carry a future".into(),
                    )),
                );
                return;
            }
            let mut delivered = false;
            for (_, station) in &self.stations {
                if station.worker_class() == class {
                    station.send(mail.clone());
                    delivered = true;
                }
            }
            if !delivered {
                debug!(%class, "notify-all mail matched no station");
            }
            return;
        }
        match self
            .stations
            .iter()
            .find(|(_, station)| station.worker_class() == class)
        {
            Some((_, station)) => station.send(mail),
            None => complete(mail.future.as_ref(), Err(WorkError::WorkerNotFound(class))),
        }
    }
}

impl WorkerClass for Supervisor {
    const CLASS: &'static str = "supervisor";
}

impl Worker for Supervisor {
    fn class(&self) -> &'static str {
        Self::CLASS
    }

    fn dispatch(
        &mut self,
        method: &str,
        args: Args,
        _ctx: &WorkbenchContext,
    ) -> Result<Value, WorkError> {
        match method {
            "worker_ids" => Ok(Value::List(
                self.stations
                    .iter()
                    .map(|(id, _)| Value::Str(id.clone()))
                    .collect(),
            )),
            "station_running" => {
                let id = args
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| WorkError::Argument("expected a worker id".into()))?;
                let station = self
                    .stations
                    .iter()
                    .find(|(station_id, _)| station_id == id)
                    .ok_or_else(|| WorkError::WorkerNotFound(id.to_string()))?;
                Ok(Value::Bool(station.1.is_running()))
            }
            _ => Err(WorkError::unknown_instruction(Self::CLASS, method)),
        }
    }

    fn handle(&mut self, mail: Mail, ctx: &WorkbenchContext) {
        match &mail.instruction {
            Instruction::Signal(name) => {
                let name = name.clone().into_owned();
                complete(mail.future.as_ref(), Err(WorkError::ReservedSignal(name)));
            }
            Instruction::Method { class, method } if class.as_ref() == Self::CLASS => {
                let method = method.clone().into_owned();
                let outcome = self.dispatch(&method, mail.args, ctx);
                complete(mail.future.as_ref(), outcome);
            }
            Instruction::Method { class, .. } => {
                let class = class.clone().into_owned();
                self.route(class, mail);
            }
        }
    }

    fn post_init(&mut self, _ctx: &WorkbenchContext) -> Result<(), WorkError> {
        let specs = std::mem::take(&mut self.specs);
        for spec in specs {
            let mut station = spec.station_creator.create()?;
            station.start()?;
            self.custodian.track(&station.stop_hook());
            debug!(id = %spec.id, class = station.worker_class(), "worker station started");
            self.stations.push((spec.id, station));
        }
        Ok(())
    }

    fn tick(&mut self, ctx: &WorkbenchContext) {
        // Visit every station each tick; FIFO within each outbox.
        let mut gathered = Vec::new();
        for (id, station) in &self.stations {
            while let Some(packet) = station.recv(Duration::ZERO) {
                gathered.push((id.clone(), packet));
            }
        }
        for (id, packet) in gathered {
            match packet {
                Packet::Mail(mail) => self.handle(mail, ctx),
                Packet::Failure(failure) => {
                    error!(worker = %id, %failure, "worker station failed");
                    ctx.fail(failure);
                }
                Packet::Terminate => {}
            }
        }
    }

    fn exit(&mut self) {
        for (id, station) in self.stations.iter_mut() {
            debug!(worker = %id, "stopping worker station");
            station.stop();
        }
        self.stations.clear();
    }
}
