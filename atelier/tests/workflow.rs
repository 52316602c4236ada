//! Workflow scheduling end to end: placeholders, error policies, modes,
//! re-runs, and detached runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atelier::task::{Coercion, OnError, Placeholder};
use atelier::{
    Heartbeat, Task, Value, WorkError, Workflow, WorkflowError, WorkflowMode,
};

fn quick(value: &'static str) -> impl Fn(atelier::Args) -> Result<Value, WorkError> {
    move |_| Ok(Value::from(value))
}

#[test]
fn empty_workflow_runs_to_nothing() {
    let mut workflow = Workflow::new();
    assert!(workflow.run().unwrap().is_none());
}

#[test]
fn placeholder_substitution_reaches_nested_containers() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow.add(Task::new("a", |_| Ok(Value::from("A")))).unwrap();
    workflow
        .add(
            Task::new("b", |args| {
                // args.0 is ["A", ["A", 1]]: the placeholder resolved at both
                // nesting depths, already upper-cased by the handler.
                Ok(args.get(0).cloned().unwrap_or(Value::Unit))
            })
            .with_args([atelier::TaskArg::List(vec![
                Placeholder::new("a")
                    .with_handler(|value| match value {
                        Value::Str(s) => Value::Str(s.to_uppercase()),
                        other => other,
                    })
                    .into(),
                atelier::TaskArg::List(vec![
                    Placeholder::new("a").into(),
                    Value::Int(1).into(),
                ]),
            ])])
            .after(["a"]),
        )
        .unwrap();

    let result = workflow.run().unwrap().unwrap();
    assert_eq!(
        result.get("b").unwrap(),
        Some(Value::List(vec![
            Value::from("A"),
            Value::List(vec![Value::from("A"), Value::Int(1)]),
        ]))
    );
}

#[test]
fn placeholders_work_on_the_single_thread_fallback() {
    let mut workflow = Workflow::new().with_workers(1);
    workflow.add(Task::new("a", |_| Ok(Value::Int(20)))).unwrap();
    workflow
        .add(
            Task::new("b", |args| {
                let base = args.get(0).and_then(Value::as_int).unwrap_or(0);
                Ok(Value::Int(base + 22))
            })
            .with_args([Workflow::p("a")])
            .after(["a"]),
        )
        .unwrap();
    let result = workflow.run().unwrap().unwrap();
    assert_eq!(result.get("b").unwrap(), Some(Value::Int(42)));
}

#[test]
fn coerce_policy_replaces_the_failure() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow
        .add(
            Task::new("t", |_| Err(WorkError::Instruction("broken".into())))
                .on_error(OnError::Coerce(Coercion::Call(Arc::new(|_failure, _partial| {
                    Value::from("fallback")
                })))),
        )
        .unwrap();
    let result = workflow.run().unwrap().unwrap();
    assert_eq!(result.get("t").unwrap(), Some(Value::from("fallback")));
}

#[test]
fn ignore_policy_yields_unit() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow
        .add(
            Task::new("t", |_| Err(WorkError::Instruction("broken".into())))
                .on_error(OnError::Ignore),
        )
        .unwrap();
    let result = workflow.run().unwrap().unwrap();
    assert_eq!(result.get("t").unwrap(), Some(Value::Unit));
}

#[test]
fn raise_policy_aborts_the_run() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow
        .add(Task::new("t", |_| Err(WorkError::Instruction("broken".into()))))
        .unwrap();
    match workflow.run() {
        Err(WorkflowError::TaskFailed { name, .. }) => assert_eq!(name, "t"),
        other => panic!("expected a task failure, got {other:?}"),
    }
}

#[test]
fn cyclic_workflows_refuse_to_run() {
    static RAN: AtomicUsize = AtomicUsize::new(0);
    let mut workflow = Workflow::new();
    workflow
        .add(
            Task::new("a", |_| {
                RAN.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            })
            .after(["c"]),
        )
        .unwrap();
    workflow
        .add(
            Task::new("b", |_| {
                RAN.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            })
            .after(["a"]),
        )
        .unwrap();
    workflow
        .add(
            Task::new("c", |_| {
                RAN.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            })
            .after(["b"]),
        )
        .unwrap();
    match workflow.run() {
        Err(WorkflowError::InvalidItems(items)) => {
            assert_eq!(items, ["a", "b", "c"].map(String::from).into_iter().collect())
        }
        other => panic!("expected invalid items, got {other:?}"),
    }
    assert_eq!(RAN.load(Ordering::SeqCst), 0, "no task may be dispatched");
}

#[test]
fn duplicate_task_names_are_rejected() {
    let mut workflow = Workflow::new();
    workflow.add(Task::new("t", quick("1"))).unwrap();
    assert!(matches!(
        workflow.add(Task::new("t", quick("2"))),
        Err(WorkflowError::DuplicateTask(_))
    ));
}

fn diamond_workflow(mode: WorkflowMode) -> Workflow {
    let mut workflow = Workflow::new().with_mode(mode).with_workers(4);
    workflow.add(Task::new("a", quick("a"))).unwrap();
    workflow
        .add(Task::new("b", quick("b")).after(["a"]))
        .unwrap();
    workflow
        .add(Task::new("c", quick("c")).after(["a"]))
        .unwrap();
    workflow
        .add(
            Task::new("d", |args| {
                let mut joined = String::new();
                for value in &args.pos {
                    if let Value::Str(s) = value {
                        joined.push_str(s);
                    }
                }
                Ok(Value::Str(joined))
            })
            .with_args([Workflow::p("b"), Workflow::p("c")])
            .after(["b", "c"]),
        )
        .unwrap();
    workflow.add(Task::new("lone", quick("lone"))).unwrap();
    workflow
}

#[test]
fn every_mode_produces_the_same_results() {
    let mut expected: Option<BTreeMap<String, Value>> = None;
    for mode in [WorkflowMode::Mix, WorkflowMode::Bfs, WorkflowMode::Dfs] {
        let mut workflow = diamond_workflow(mode);
        let result = workflow.run().unwrap().unwrap();
        let all = result.get_all().unwrap();
        assert_eq!(all.len(), 5, "{mode:?} left tasks behind");
        match &expected {
            None => expected = Some(all),
            Some(expected) => assert_eq!(&all, expected, "{mode:?} diverged"),
        }
    }
}

#[test]
fn rerun_resets_and_reproduces() {
    let mut workflow = diamond_workflow(WorkflowMode::Mix);
    let first = workflow.run().unwrap().unwrap().get_all().unwrap();
    let second = workflow.run().unwrap().unwrap().get_all().unwrap();
    assert_eq!(first, second);
}

#[test]
fn all_independent_workflows_take_the_simple_path() {
    let mut workflow = Workflow::new().with_workers(3);
    for i in 0..6i64 {
        let name = format!("ind-{i}");
        workflow
            .add(Task::new(name, move |_| Ok(Value::Int(i))))
            .unwrap();
    }
    let result = workflow.run().unwrap().unwrap();
    let all = result.get_all().unwrap();
    assert_eq!(all.len(), 6);
    assert_eq!(all["ind-3"], Value::Int(3));
}

#[test]
fn a_long_chain_executes_strictly_in_order() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut workflow = Workflow::new()
        .with_mode(WorkflowMode::Bfs)
        .with_workers(4)
        .with_interval(Duration::from_millis(5));
    let names = ["s0", "s1", "s2", "s3", "s4"];
    for (i, name) in names.iter().enumerate() {
        let order = Arc::clone(&order);
        let name_owned = name.to_string();
        let task = Task::new(*name, move |_| {
            order.lock().unwrap().push(name_owned.clone());
            Ok(Value::Unit)
        });
        let task = if i == 0 {
            task
        } else {
            task.after([names[i - 1]])
        };
        workflow.add(task).unwrap();
    }
    workflow.run().unwrap().unwrap();
    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, names.map(String::from).to_vec());
}

#[test]
fn heartbeat_handler_fires_each_iteration() {
    let beats = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&beats);
    let mut workflow = Workflow::new()
        .with_workers(2)
        .with_interval(Duration::from_millis(10));
    workflow
        .set_heartbeat(Heartbeat::Call(Arc::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    assert!(matches!(
        workflow.set_heartbeat(Heartbeat::Call(Arc::new(|| {}))),
        Err(WorkflowError::HeartbeatSetTwice)
    ));
    workflow
        .add(Task::new("slow", |_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Value::Unit)
        }))
        .unwrap();
    workflow.run().unwrap().unwrap();
    assert!(beats.load(Ordering::SeqCst) >= 1);
}

#[test]
fn nested_workflow_heartbeat_runs_synchronously() {
    let mut inner = Workflow::new().with_workers(1);
    let pulse = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&pulse);
    inner
        .add(Task::new("pulse", move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        }))
        .unwrap();

    let mut workflow = Workflow::new()
        .with_workers(2)
        .with_interval(Duration::from_millis(10));
    workflow
        .set_heartbeat(Heartbeat::Nested(Arc::new(Mutex::new(inner))))
        .unwrap();
    workflow
        .add(Task::new("outer", |_| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(Value::Unit)
        }))
        .unwrap();
    workflow.run().unwrap().unwrap();
    assert!(pulse.load(Ordering::SeqCst) >= 1);
}

#[test]
fn detached_runs_join_and_report() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow
        .add(Task::new("slow", |_| {
            std::thread::sleep(Duration::from_millis(120));
            Ok(Value::from("done"))
        }))
        .unwrap();
    assert!(matches!(
        workflow.join(None),
        Err(WorkflowError::NotDetached)
    ));

    let result = workflow.run_detached().unwrap();
    assert!(matches!(
        workflow.join(Some(Duration::from_millis(1))),
        Err(WorkflowError::JoinTimedOut)
    ));
    workflow.join(None).unwrap();
    assert!(result.ready(None).unwrap());
    assert_eq!(result.get("slow").unwrap(), Some(Value::from("done")));
}

#[test]
fn result_view_tracks_per_task_readiness() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow.add(Task::new("fast", quick("fast"))).unwrap();
    workflow
        .add(
            Task::new("slow", |_| {
                std::thread::sleep(Duration::from_millis(150));
                Ok(Value::from("slow"))
            })
            .after(["fast"]),
        )
        .unwrap();
    let result = workflow.run_detached().unwrap();
    assert!(result.get("missing").is_err());
    // Until the run finishes, a not-yet-ready task reads as `None`.
    let early = result.get("slow").unwrap();
    workflow.join(None).unwrap();
    assert!(early.is_none() || early == Some(Value::from("slow")));
    assert_eq!(result.get("slow").unwrap(), Some(Value::from("slow")));
    assert_eq!(result.get_all().unwrap().len(), 2);
}

#[test]
fn remove_and_ignore_update_scheduling() {
    let mut workflow = Workflow::new().with_workers(2);
    workflow.add(Task::new("a1", quick("a1"))).unwrap();
    workflow.add(Task::new("a2", quick("a2"))).unwrap();
    workflow
        .add(Task::new("b1", quick("b1")).after(["a1", "a2"]))
        .unwrap();
    workflow
        .add(Task::new("c1", quick("c1")).after(["b1", "a1"]))
        .unwrap();
    workflow
        .add(Task::new("c2", quick("c2")).after(["b1", "a2"]))
        .unwrap();

    workflow.ignore("b1").unwrap();
    assert!(workflow.invalid_items().is_empty());

    let result = workflow.run().unwrap().unwrap();
    let all = result.get_all().unwrap();
    assert_eq!(all.len(), 4);
    assert!(!all.contains_key("b1"));

    let mut workflow = Workflow::new();
    workflow.add(Task::new("x", quick("x"))).unwrap();
    workflow.add(Task::new("y", quick("y")).after(["x"])).unwrap();
    workflow.remove("y").unwrap();
    assert_eq!(workflow.size(), 1);
    let result = workflow.run().unwrap().unwrap();
    assert_eq!(result.get_all().unwrap().len(), 1);
}

#[test]
fn independent_quota_saturates_without_starving_dependents() {
    // Two workers with a full independent ratio still complete a mixed graph.
    let mut workflow = Workflow::new()
        .with_workers(2)
        .with_independent_ratio(1.0)
        .with_interval(Duration::from_millis(5));
    for i in 0..4i64 {
        workflow
            .add(Task::new(format!("ind-{i}"), move |_| Ok(Value::Int(i))))
            .unwrap();
    }
    workflow.add(Task::new("root", quick("root"))).unwrap();
    workflow
        .add(Task::new("leaf", quick("leaf")).after(["root"]))
        .unwrap();
    let result = workflow.run().unwrap().unwrap();
    assert_eq!(result.get_all().unwrap().len(), 6);
}
