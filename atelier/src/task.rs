//! Task descriptors, placeholders, and argument substitution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use atelier_workshop::value::{Args, Value};
use atelier_workshop::{Future, WorkError};

use crate::workflow::WorkflowError;

/// The callable payload of a task.
pub type TaskFn = Arc<dyn Fn(Args) -> Result<Value, WorkError> + Send + Sync>;

/// Transforms a placeholder's resolved value before substitution.
pub type HandlerFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Computes a coerced value from the failure (bound extras live in the
/// closure's captures).
pub type CoerceFn = Arc<dyn Fn(&WorkflowError, Option<&Value>) -> Value + Send + Sync>;

/// A deferred reference to another task's result, substituted into the
/// arguments right before the task runs.
#[derive(Clone)]
pub struct Placeholder {
    name: String,
    handler: Option<HandlerFn>,
}

impl Placeholder {
    /// Refers to the result of the task called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Placeholder {
            name: name.into(),
            handler: None,
        }
    }

    /// Applies `handler` to the resolved value before substitution.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// The referenced task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: Value) -> Value {
        match &self.handler {
            Some(handler) => handler(value),
            None => value,
        }
    }
}

impl std::fmt::Debug for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Placeholder({:?})", self.name)
    }
}

/// An argument template: a literal, a placeholder, or a container of
/// templates. Substitution recurses into exactly these container shapes.
#[derive(Clone, Debug)]
pub enum TaskArg {
    /// A literal value, passed through untouched.
    Value(Value),
    /// Replaced by the referenced task's result.
    Placeholder(Placeholder),
    /// An ordered sequence of templates.
    List(Vec<TaskArg>),
    /// A fixed-shape sequence of templates.
    Tuple(Vec<TaskArg>),
    /// A unique collection of templates; duplicates collapse after
    /// substitution.
    Set(Vec<TaskArg>),
    /// A string-keyed mapping of templates.
    Map(BTreeMap<String, TaskArg>),
}

impl From<Value> for TaskArg {
    fn from(value: Value) -> Self {
        TaskArg::Value(value)
    }
}

impl From<Placeholder> for TaskArg {
    fn from(placeholder: Placeholder) -> Self {
        TaskArg::Placeholder(placeholder)
    }
}

impl TaskArg {
    /// Substitutes placeholders using `resolve`, preserving the concrete
    /// container type at every level.
    fn fill(
        &self,
        resolve: &dyn Fn(&str) -> Result<Value, WorkflowError>,
    ) -> Result<Value, WorkflowError> {
        match self {
            TaskArg::Value(value) => Ok(value.clone()),
            TaskArg::Placeholder(placeholder) => {
                Ok(placeholder.apply(resolve(placeholder.name())?))
            }
            TaskArg::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.fill(resolve))
                    .collect::<Result<_, _>>()?,
            )),
            TaskArg::Tuple(items) => Ok(Value::Tuple(
                items
                    .iter()
                    .map(|item| item.fill(resolve))
                    .collect::<Result<_, _>>()?,
            )),
            TaskArg::Set(items) => Ok(Value::Set(
                items
                    .iter()
                    .map(|item| item.fill(resolve))
                    .collect::<Result<_, _>>()?,
            )),
            TaskArg::Map(entries) => {
                let mut filled = BTreeMap::new();
                for (key, template) in entries {
                    filled.insert(key.clone(), template.fill(resolve)?);
                }
                Ok(Value::Map(filled))
            }
        }
    }
}

/// What to do when a task's callable fails.
#[derive(Clone)]
pub enum OnError {
    /// Wrap the failure, naming the task, and re-raise.
    Raise,
    /// Swallow the failure and yield unit.
    Ignore,
    /// Replace the failure with a coerced value.
    Coerce(Coercion),
}

/// The coercion applied under [`OnError::Coerce`].
#[derive(Clone)]
pub enum Coercion {
    /// Yield this value verbatim.
    Value(Value),
    /// Call with `(failure, partial_result)` and yield the return value.
    Call(CoerceFn),
}

enum Run {
    Defined,
    Invoked {
        future: Future,
    },
    Got {
        outcome: Result<Value, WorkflowError>,
    },
}

/// A named unit of work with declared predecessors and an error policy.
///
/// Lifecycle is monotonic: defined → invoked (future assigned) → ready →
/// got (outcome cached). All mutation is interior, so tasks are shared
/// freely between the scheduler, detached runs, and result views.
pub struct Task {
    name: String,
    func: TaskFn,
    args: Vec<TaskArg>,
    kwargs: BTreeMap<String, TaskArg>,
    after: BTreeSet<String>,
    on_error: OnError,
    run: Mutex<Run>,
}

impl Task {
    /// A task called `name` executing `func`.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Args) -> Result<Value, WorkError> + Send + Sync + 'static,
    {
        Task {
            name: name.into(),
            func: Arc::new(func),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            after: BTreeSet::new(),
            on_error: OnError::Raise,
            run: Mutex::new(Run::Defined),
        }
    }

    /// Sets the positional argument templates.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<TaskArg>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one keyword argument template.
    pub fn with_kwarg(mut self, key: impl Into<String>, arg: impl Into<TaskArg>) -> Self {
        self.kwargs.insert(key.into(), arg.into());
        self
    }

    /// Declares the tasks this one comes after.
    pub fn after<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the error policy.
    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// The task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared predecessors.
    pub fn predecessors(&self) -> &BTreeSet<String> {
        &self.after
    }

    /// True once a future has been assigned (or the task ran locally).
    pub fn invoked(&self) -> bool {
        !matches!(*self.run.lock().expect("task lock"), Run::Defined)
    }

    /// True once the result is available.
    pub fn ready(&self) -> bool {
        match &*self.run.lock().expect("task lock") {
            Run::Defined => false,
            Run::Invoked { future } => future.is_done(),
            Run::Got { .. } => true,
        }
    }

    /// Resolves every placeholder in the argument templates against the
    /// sibling `tasks`, producing the concrete call arguments.
    pub(crate) fn fill_placeholders(
        &self,
        tasks: &BTreeMap<String, Arc<Task>>,
    ) -> Result<Args, WorkflowError> {
        let resolve = |name: &str| -> Result<Value, WorkflowError> {
            tasks
                .get(name)
                .ok_or_else(|| WorkflowError::UnknownTask(name.to_string()))?
                .get()
        };
        let mut call = Args::new();
        for template in &self.args {
            call.pos.push(template.fill(&resolve)?);
        }
        for (key, template) in &self.kwargs {
            call.kw.insert(key.clone(), template.fill(&resolve)?);
        }
        Ok(call)
    }

    /// The callable, for dispatching.
    pub(crate) fn func(&self) -> TaskFn {
        Arc::clone(&self.func)
    }

    /// Records the future produced by the pool.
    pub(crate) fn assign(&self, future: Future) {
        let mut run = self.run.lock().expect("task lock");
        if matches!(*run, Run::Defined) {
            *run = Run::Invoked { future };
        }
    }

    /// Blocks on the future and applies the error policy; the outcome is
    /// cached, so repeated calls are cheap and consistent.
    pub fn get(&self) -> Result<Value, WorkflowError> {
        let future = {
            match &*self.run.lock().expect("task lock") {
                Run::Defined => {
                    return Err(WorkflowError::TaskNotInvoked(self.name.clone()));
                }
                Run::Invoked { future } => future.clone(),
                Run::Got { outcome } => return outcome.clone(),
            }
        };
        let outcome = match future.result(None) {
            Ok(value) => Ok(value),
            Err(error) => self.apply_policy(WorkflowError::TaskFailed {
                name: self.name.clone(),
                source: error,
            }),
        };
        *self.run.lock().expect("task lock") = Run::Got {
            outcome: outcome.clone(),
        };
        outcome
    }

    /// Runs the callable in the calling thread with `call` arguments, then
    /// caches the policy-adjusted outcome. The single-worker fallback path,
    /// also usable directly when no pool is wanted at all.
    pub fn run_local(&self, call: Args) -> Result<Value, WorkflowError> {
        let outcome = match (self.func)(call) {
            Ok(value) => Ok(value),
            Err(error) => self.apply_policy(WorkflowError::TaskFailed {
                name: self.name.clone(),
                source: atelier_workshop::FutureError::Failed(error),
            }),
        };
        *self.run.lock().expect("task lock") = Run::Got {
            outcome: outcome.clone(),
        };
        outcome
    }

    fn apply_policy(&self, failure: WorkflowError) -> Result<Value, WorkflowError> {
        match &self.on_error {
            OnError::Raise => Err(failure),
            OnError::Ignore => Ok(Value::Unit),
            OnError::Coerce(Coercion::Value(value)) => Ok(value.clone()),
            OnError::Coerce(Coercion::Call(coerce)) => Ok(coerce(&failure, None)),
        }
    }

    /// Forgets any run state, returning the task to `defined`.
    pub(crate) fn reset(&self) {
        *self.run.lock().expect("task lock") = Run::Defined;
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("invoked", &self.invoked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fill_recurses_into_containers() {
        let results = resolver(&[("a", Value::from("A"))]);
        let resolve = |name: &str| -> Result<Value, WorkflowError> {
            results
                .get(name)
                .cloned()
                .ok_or_else(|| WorkflowError::UnknownTask(name.into()))
        };
        let template = TaskArg::List(vec![
            TaskArg::Value(Value::Int(1)),
            TaskArg::Tuple(vec![TaskArg::Placeholder(Placeholder::new("a"))]),
            TaskArg::Map(BTreeMap::from([(
                "k".to_string(),
                TaskArg::Placeholder(Placeholder::new("a")),
            )])),
        ]);
        let filled = template.fill(&resolve).unwrap();
        assert_eq!(
            filled,
            Value::List(vec![
                Value::Int(1),
                Value::Tuple(vec![Value::from("A")]),
                Value::Map(BTreeMap::from([("k".to_string(), Value::from("A"))])),
            ])
        );
    }

    #[test]
    fn placeholder_handler_applies() {
        let placeholder = Placeholder::new("a").with_handler(|value| match value {
            Value::Str(s) => Value::Str(s.to_uppercase()),
            other => other,
        });
        let resolve =
            |_: &str| -> Result<Value, WorkflowError> { Ok(Value::from("hello")) };
        let filled = TaskArg::Placeholder(placeholder).fill(&resolve).unwrap();
        assert_eq!(filled, Value::from("HELLO"));
    }

    #[test]
    fn set_template_collapses_duplicates() {
        let resolve = |_: &str| -> Result<Value, WorkflowError> { Ok(Value::Int(1)) };
        let template = TaskArg::Set(vec![
            TaskArg::Placeholder(Placeholder::new("a")),
            TaskArg::Value(Value::Int(1)),
        ]);
        match template.fill(&resolve).unwrap() {
            Value::Set(set) => assert_eq!(set.len(), 1),
            other => panic!("expected a set, got {other:?}"),
        }
    }
}
