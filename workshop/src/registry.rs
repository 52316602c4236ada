//! Hierarchical registries of station and workbench kinds.
//!
//! A per-workshop scope may add entries, override entries of the built-in
//! scope, or exclude them; lookups walk the scope chain.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::creator::Creator;
use crate::error::WorkError;
use crate::station::process::SpawnKind;
use crate::station::{ProcessStation, Station, ThreadStation};
use crate::workbench::{ConcurrentLoopWorkbench, LoopWorkbench, Workbench};
use crate::worker::{Worker, WorkerSpawnSpec};

/// A scoped name→value registry.
#[derive(Clone)]
pub struct Registry<T: Clone> {
    parent: Option<Arc<Registry<T>>>,
    entries: BTreeMap<String, T>,
    excluded: BTreeSet<String>,
}

impl<T: Clone> Registry<T> {
    /// A root scope with no entries.
    pub fn root() -> Self {
        Registry {
            parent: None,
            entries: BTreeMap::new(),
            excluded: BTreeSet::new(),
        }
    }

    /// A child scope over `parent`.
    pub fn scoped(parent: Arc<Registry<T>>) -> Self {
        Registry {
            parent: Some(parent),
            entries: BTreeMap::new(),
            excluded: BTreeSet::new(),
        }
    }

    /// Adds or overrides an entry in this scope.
    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        self.excluded.remove(&name);
        self.entries.insert(name, value);
    }

    /// Hides `name`, including any parent-scope entry.
    pub fn exclude(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.entries.remove(&name);
        self.excluded.insert(name);
    }

    /// Resolves `name` through the scope chain.
    pub fn lookup(&self, name: &str) -> Option<T> {
        if self.excluded.contains(name) {
            return None;
        }
        if let Some(value) = self.entries.get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(name))
    }
}

/// Everything a station builder needs to assemble one station.
#[derive(Clone)]
pub struct StationPlan {
    /// Class id of the hosted worker.
    pub worker_class: String,
    /// Builds the workbench that will drive the worker.
    pub workbench_creator: Creator<Box<dyn Workbench>>,
    /// Builds the worker, for in-process stations.
    pub worker_creator: Creator<Box<dyn Worker>>,
    /// Serializable construction request, for process stations.
    pub spawn_spec: WorkerSpawnSpec,
}

/// Builds a station from a plan.
pub type StationBuilder =
    Arc<dyn Fn(StationPlan) -> Result<Box<dyn Station>, WorkError> + Send + Sync>;

/// Builds a workbench.
pub type WorkbenchBuilder = Arc<dyn Fn() -> Box<dyn Workbench> + Send + Sync>;

fn process_builder(kind: SpawnKind) -> StationBuilder {
    Arc::new(move |plan: StationPlan| {
        Ok(Box::new(ProcessStation::new(plan.spawn_spec, kind)) as Box<dyn Station>)
    })
}

/// The built-in station kinds: `thread`, `process`, `fork`, `forkserver`,
/// `spawn`.
pub fn builtin_stations() -> Registry<StationBuilder> {
    let mut registry = Registry::root();
    registry.insert(
        "thread",
        Arc::new(|plan: StationPlan| {
            Ok(Box::new(ThreadStation::new(
                plan.workbench_creator,
                plan.worker_creator,
                plan.worker_class,
            )) as Box<dyn Station>)
        }) as StationBuilder,
    );
    registry.insert("process", process_builder(SpawnKind::Spawn));
    registry.insert("spawn", process_builder(SpawnKind::Spawn));
    registry.insert("fork", process_builder(SpawnKind::Fork));
    registry.insert("forkserver", process_builder(SpawnKind::ForkServer));
    registry
}

/// The built-in workbench kinds: `loop` and `concurrent-loop`.
pub fn builtin_workbenches() -> Registry<WorkbenchBuilder> {
    let mut registry = Registry::root();
    registry.insert(
        "loop",
        Arc::new(|| Box::new(LoopWorkbench) as Box<dyn Workbench>) as WorkbenchBuilder,
    );
    registry.insert(
        "concurrent-loop",
        Arc::new(|| Box::new(ConcurrentLoopWorkbench::default()) as Box<dyn Workbench>)
            as WorkbenchBuilder,
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_lookup_overrides_and_excludes() {
        let mut root = Registry::root();
        root.insert("a", 1);
        root.insert("b", 2);
        let root = Arc::new(root);

        let mut scope = Registry::scoped(Arc::clone(&root));
        scope.insert("a", 10);
        scope.exclude("b");
        scope.insert("c", 3);

        assert_eq!(scope.lookup("a"), Some(10));
        assert_eq!(scope.lookup("b"), None);
        assert_eq!(scope.lookup("c"), Some(3));
        assert_eq!(root.lookup("b"), Some(2));
    }

    #[test]
    fn builtin_kinds_resolve() {
        let stations = builtin_stations();
        for kind in ["thread", "process", "fork", "forkserver", "spawn"] {
            assert!(stations.lookup(kind).is_some(), "{kind} missing");
        }
        assert!(stations.lookup("local").is_none());
        let workbenches = builtin_workbenches();
        assert!(workbenches.lookup("loop").is_some());
        assert!(workbenches.lookup("concurrent-loop").is_some());
    }
}
