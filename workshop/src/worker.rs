//! The worker trait and the process-side worker spawn registry.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::WorkError;
use crate::instruction::Instruction;
use crate::mail::{complete, Mail};
use crate::value::{Args, Value};
use crate::workbench::WorkbenchContext;

/// Associates a worker type with its globally unique class id.
pub trait WorkerClass {
    /// The class id embedded in instructions and used for routing.
    const CLASS: &'static str;
}

/// A message-driven actor hosted by a workbench.
///
/// Implementations match on the method id in [`dispatch`](Worker::dispatch);
/// everything else has workable defaults. Workers never share memory with
/// each other; all inter-worker communication goes through mail.
pub trait Worker: Send + 'static {
    /// The class id, echoed through the vtable for routing checks.
    fn class(&self) -> &'static str;

    /// Executes one instruction method.
    fn dispatch(
        &mut self,
        method: &str,
        args: Args,
        ctx: &WorkbenchContext,
    ) -> Result<Value, WorkError>;

    /// Full-mail entry point. The default rejects reserved signals, requires
    /// the instruction to belong to this worker's class, and completes the
    /// mail future with the dispatch outcome. The supervisor overrides this
    /// to route instead of execute.
    fn handle(&mut self, mail: Mail, ctx: &WorkbenchContext) {
        let Mail {
            instruction,
            args,
            future,
            ..
        } = mail;
        match instruction {
            Instruction::Signal(name) => {
                complete(
                    future.as_ref(),
                    Err(WorkError::ReservedSignal(name.into_owned())),
                );
            }
            Instruction::Method { class, method } => {
                if class != self.class() {
                    complete(
                        future.as_ref(),
                        Err(WorkError::ClassMismatch {
                            expected: class.into_owned(),
                            found: self.class().to_string(),
                        }),
                    );
                } else {
                    let outcome = self.dispatch(&method, args, ctx);
                    complete(future.as_ref(), outcome);
                }
            }
        }
    }

    /// Runs once after construction, before the first mail.
    fn post_init(&mut self, _ctx: &WorkbenchContext) -> Result<(), WorkError> {
        Ok(())
    }

    /// Scoped-acquire hook entered before the mail loop.
    fn enter(&mut self) -> Result<(), WorkError> {
        Ok(())
    }

    /// Called on every loop iteration, before the inbox is polled.
    fn tick(&mut self, _ctx: &WorkbenchContext) {}

    /// Scoped-release hook, runs on the way out of the loop.
    fn exit(&mut self) {}
}

/// A serializable worker construction request: the class id plus bound
/// arguments. This is the form a process station sends to its child, which
/// resolves it against the spawn registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSpawnSpec {
    /// Worker class id.
    pub class: String,
    /// Construction arguments.
    pub args: Args,
}

impl WorkerSpawnSpec {
    /// A spec for class `W` with `args`.
    pub fn of<W: WorkerClass>(args: Args) -> Self {
        WorkerSpawnSpec {
            class: W::CLASS.to_string(),
            args,
        }
    }

    /// Builds the worker from the spawn registry of this process.
    pub fn create(&self) -> Result<Box<dyn Worker>, WorkError> {
        let spawner = spawn_registry()
            .lock()
            .expect("spawn registry lock")
            .get(self.class.as_str())
            .copied()
            .ok_or_else(|| WorkError::WorkerNotFound(self.class.clone()))?;
        spawner(self.args.clone())
    }
}

/// Builds a boxed worker from construction arguments.
pub type SpawnFn = fn(Args) -> Result<Box<dyn Worker>, WorkError>;

fn spawn_registry() -> &'static Mutex<HashMap<&'static str, SpawnFn>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, SpawnFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a worker class for construction inside process-station children.
///
/// Both the parent and the child executable must register the same classes
/// before stations start; the child does so before calling
/// [`bootstrap_from_env`](crate::station::process::bootstrap_from_env).
pub fn register_spawnable(class: &'static str, spawn: SpawnFn) {
    spawn_registry()
        .lock()
        .expect("spawn registry lock")
        .insert(class, spawn);
}
