//! Thread-lane pool behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use atelier::executor::{register_job, ExecutorConfig, HybridPoolExecutor, WorkMode};
use atelier::{FutureError, Value, WorkError};

#[test]
fn submissions_complete_with_their_own_results() {
    let executor = HybridPoolExecutor::with_config(ExecutorConfig::with_workers(4));
    let futures: Vec<_> = (0..20)
        .map(|i| executor.submit(move || Ok(Value::Int(i * i)), None).unwrap())
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        let i = i as i64;
        assert_eq!(
            future.result(Some(Duration::from_secs(10))).unwrap(),
            Value::Int(i * i)
        );
    }
    executor.shutdown();
}

#[test]
fn failures_land_on_the_future() {
    let executor = HybridPoolExecutor::with_config(ExecutorConfig::with_workers(2));
    let future = executor
        .submit(|| Err(WorkError::Instruction("nope".into())), None)
        .unwrap();
    assert_eq!(
        future.result(Some(Duration::from_secs(10))),
        Err(FutureError::Failed(WorkError::Instruction("nope".into())))
    );
    executor.shutdown();
}

#[test]
fn panicking_jobs_fail_cleanly() {
    let executor = HybridPoolExecutor::with_config(ExecutorConfig::with_workers(2));
    let future = executor.submit(|| panic!("job exploded"), None).unwrap();
    match future.result(Some(Duration::from_secs(10))) {
        Err(FutureError::Failed(WorkError::Runtime(_))) => {}
        other => panic!("expected a runtime failure, got {other:?}"),
    }
    // The pool keeps serving afterwards.
    let ok = executor.submit(|| Ok(Value::Int(1)), None).unwrap();
    assert_eq!(
        ok.result(Some(Duration::from_secs(10))).unwrap(),
        Value::Int(1)
    );
    executor.shutdown();
}

#[test]
fn workers_recycle_without_losing_work() {
    // A tiny work budget forces several recycles over 30 jobs.
    let config = ExecutorConfig {
        max_thread_workers: 2,
        max_work_count: 3,
        ..ExecutorConfig::default()
    };
    let executor = HybridPoolExecutor::with_config(config);
    let futures: Vec<_> = (0..30)
        .map(|i| executor.submit(move || Ok(Value::Int(i)), None).unwrap())
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(
            future.result(Some(Duration::from_secs(20))).unwrap(),
            Value::Int(i as i64)
        );
    }
    executor.shutdown();
}

#[test]
fn duplicate_work_names_are_rejected() {
    let executor = HybridPoolExecutor::with_config(ExecutorConfig::with_workers(1));
    let slow = executor
        .submit(
            || {
                std::thread::sleep(Duration::from_millis(100));
                Ok(Value::Unit)
            },
            Some("dup".into()),
        )
        .unwrap();
    assert!(matches!(
        executor.submit(|| Ok(Value::Unit), Some("dup".into())),
        Err(WorkError::Argument(_))
    ));
    slow.result(Some(Duration::from_secs(10))).unwrap();
    executor.shutdown();
}

#[test]
fn registered_jobs_run_on_the_thread_lane() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    register_job("bump", |args| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(args.get(0).cloned().unwrap_or(Value::Unit))
    });
    let executor = HybridPoolExecutor::with_config(ExecutorConfig::with_workers(2));
    let future = executor
        .submit_registered(
            "bump",
            atelier::Args::positional([Value::from("hi")]),
            WorkMode::Thread,
        )
        .unwrap();
    assert_eq!(
        future.result(Some(Duration::from_secs(10))).unwrap(),
        Value::from("hi")
    );
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert!(matches!(
        executor.submit_registered("no-such-job", atelier::Args::new(), WorkMode::Thread),
        Err(WorkError::Argument(_))
    ));
    executor.shutdown();
}

#[test]
fn disabled_process_lane_is_an_argument_error() {
    let executor = HybridPoolExecutor::new();
    assert!(matches!(
        executor.submit_registered("anything", atelier::Args::new(), WorkMode::Process),
        Err(WorkError::Argument(_))
    ));
    executor.shutdown();
}

#[test]
fn shutdown_is_idempotent_and_rejects_new_work() {
    let executor = HybridPoolExecutor::with_config(ExecutorConfig::with_workers(1));
    let future = executor.submit(|| Ok(Value::Unit), None).unwrap();
    future.result(Some(Duration::from_secs(10))).unwrap();
    executor.shutdown();
    executor.shutdown();
    assert!(executor.submit(|| Ok(Value::Unit), None).is_err());
}
