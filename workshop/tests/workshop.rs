//! End-to-end workshop behavior over thread stations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use atelier_workshop::mail::Contact;
use atelier_workshop::prelude::*;

type Log = Arc<Mutex<Vec<&'static str>>>;

struct One {
    log: Log,
}
struct Two {
    log: Log,
}
struct Three {
    log: Log,
}

impl WorkerClass for One {
    const CLASS: &'static str = "one";
}
impl WorkerClass for Two {
    const CLASS: &'static str = "two";
}
impl WorkerClass for Three {
    const CLASS: &'static str = "three";
}

impl Worker for One {
    fn class(&self) -> &'static str {
        Self::CLASS
    }
    fn dispatch(
        &mut self,
        method: &str,
        _args: Args,
        _ctx: &WorkbenchContext,
    ) -> Result<Value, WorkError> {
        match method {
            "greet" => {
                self.log.lock().unwrap().push("one");
                Message::new(Instruction::of::<Two>("greet")).emit()?;
                Ok(Value::from("one"))
            }
            _ => Err(WorkError::unknown_instruction(Self::CLASS, method)),
        }
    }
}

impl Worker for Two {
    fn class(&self) -> &'static str {
        Self::CLASS
    }
    fn dispatch(
        &mut self,
        method: &str,
        _args: Args,
        _ctx: &WorkbenchContext,
    ) -> Result<Value, WorkError> {
        match method {
            "greet" => {
                self.log.lock().unwrap().push("two");
                Message::new(Instruction::of::<Three>("greet")).emit()?;
                Ok(Value::from("two"))
            }
            _ => Err(WorkError::unknown_instruction(Self::CLASS, method)),
        }
    }
}

impl Worker for Three {
    fn class(&self) -> &'static str {
        Self::CLASS
    }
    fn dispatch(
        &mut self,
        method: &str,
        _args: Args,
        _ctx: &WorkbenchContext,
    ) -> Result<Value, WorkError> {
        match method {
            "greet" => {
                self.log.lock().unwrap().push("three");
                Ok(Value::from("three"))
            }
            _ => Err(WorkError::unknown_instruction(Self::CLASS, method)),
        }
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn mail_hops_across_stations_in_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut workshop = Workshop::new();
    let (l1, l2, l3) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
    workshop.register::<One, _>(move || One { log: l1.clone() }).unwrap();
    workshop.register::<Two, _>(move || Two { log: l2.clone() }).unwrap();
    workshop
        .register::<Three, _>(move || Three { log: l3.clone() })
        .unwrap();
    workshop.start().unwrap();

    let future = workshop
        .submit(Message::new(Instruction::of::<One>("greet")))
        .unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), Value::from("one"));

    assert!(
        wait_until(Duration::from_secs(5), || log.lock().unwrap().len() == 3),
        "emitted mail never reached every worker: {:?}",
        log.lock().unwrap()
    );
    assert_eq!(*log.lock().unwrap(), vec!["one", "two", "three"]);
    workshop.stop();
}

#[test]
fn unknown_class_fails_with_worker_not_found() {
    let mut workshop = Workshop::new();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l1 = Arc::clone(&log);
    workshop.register::<One, _>(move || One { log: l1.clone() }).unwrap();
    workshop.start().unwrap();

    let future = workshop
        .submit(Message::new(Instruction::method("nobody", "greet")))
        .unwrap();
    match future.result(Some(Duration::from_secs(5))) {
        Err(FutureError::Failed(WorkError::WorkerNotFound(class))) => {
            assert_eq!(class, "nobody")
        }
        other => panic!("expected worker-not-found, got {other:?}"),
    }
    workshop.stop();
}

#[test]
fn reserved_signal_is_rejected() {
    let mut workshop = Workshop::new();
    workshop.start().unwrap();
    let future = workshop
        .submit(Message::new(Instruction::signal("pause")))
        .unwrap();
    match future.result(Some(Duration::from_secs(5))) {
        Err(FutureError::Failed(WorkError::ReservedSignal(name))) => assert_eq!(name, "pause"),
        other => panic!("expected reserved-signal failure, got {other:?}"),
    }
    workshop.stop();
}

#[test]
fn supervisor_answers_its_own_instructions() {
    let mut workshop = Workshop::new();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l1 = Arc::clone(&log);
    let id = workshop
        .register::<One, _>(move || One { log: l1.clone() })
        .unwrap();
    workshop.start().unwrap();

    let future = workshop
        .submit(Message::new(Instruction::method("supervisor", "worker_ids")))
        .unwrap();
    let ids = future.result(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(ids, Value::List(vec![Value::Str(id.clone())]));

    let future = workshop
        .submit(
            Message::new(Instruction::method("supervisor", "station_running"))
                .params(Args::positional([Value::Str(id)]))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(
        future.result(Some(Duration::from_secs(5))).unwrap(),
        Value::Bool(true)
    );
    workshop.stop();
}

#[test]
fn worker_errors_reach_the_future_and_keep_the_loop_alive() {
    let mut workshop = Workshop::new();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l1 = Arc::clone(&log);
    workshop.register::<One, _>(move || One { log: l1.clone() }).unwrap();
    workshop.start().unwrap();

    let bad = workshop
        .submit(Message::new(Instruction::of::<One>("no_such_method")))
        .unwrap();
    match bad.result(Some(Duration::from_secs(5))) {
        Err(FutureError::Failed(WorkError::UnknownInstruction { class, method })) => {
            assert_eq!(class, "one");
            assert_eq!(method, "no_such_method");
        }
        other => panic!("expected unknown-instruction, got {other:?}"),
    }

    // The same worker still serves afterwards.
    let good = workshop
        .submit(Message::new(Instruction::of::<One>("greet")))
        .unwrap();
    assert_eq!(
        good.result(Some(Duration::from_secs(5))).unwrap(),
        Value::from("one")
    );
    workshop.stop();
}

#[test]
fn construction_failure_surfaces_through_the_outbox() {
    struct Broken;
    impl WorkerClass for Broken {
        const CLASS: &'static str = "broken";
    }

    let mut workshop = Workshop::new();
    workshop
        .register_creator::<Broken>(
            WorkerOptions::default(),
            Creator::try_new(|| Err(WorkError::Construction("missing credentials".into()))),
        )
        .unwrap();
    workshop.start().unwrap();

    let mut seen = None;
    assert!(wait_until(Duration::from_secs(5), || {
        seen = workshop.failure();
        seen.is_some()
    }));
    match seen {
        Some(WorkError::Construction(reason)) => assert!(reason.contains("missing credentials")),
        other => panic!("expected a construction failure, got {other:?}"),
    }
    workshop.stop();
}

#[test]
fn duplicate_worker_ids_are_rejected() {
    let mut workshop = Workshop::new();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2) = (Arc::clone(&log), Arc::clone(&log));
    let options = WorkerOptions {
        id: Some("fixed".into()),
        ..WorkerOptions::default()
    };
    workshop
        .register_with::<One, _>(options.clone(), move || One { log: l1.clone() })
        .unwrap();
    let again = workshop.register_with::<Two, _>(options, move || Two { log: l2.clone() });
    assert!(matches!(again, Err(WorkError::Argument(_))));
}

#[test]
fn notify_all_reaches_every_matching_station() {
    static HITS: AtomicUsize = AtomicUsize::new(0);

    struct Counter;
    impl WorkerClass for Counter {
        const CLASS: &'static str = "counter";
    }
    impl Worker for Counter {
        fn class(&self) -> &'static str {
            Self::CLASS
        }
        fn dispatch(
            &mut self,
            method: &str,
            _args: Args,
            _ctx: &WorkbenchContext,
        ) -> Result<Value, WorkError> {
            match method {
                "bump" => {
                    HITS.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Unit)
                }
                _ => Err(WorkError::unknown_instruction(Self::CLASS, method)),
            }
        }
    }

    let mut workshop = Workshop::new();
    let options_a = WorkerOptions {
        id: Some("counter-a".into()),
        ..WorkerOptions::default()
    };
    let options_b = WorkerOptions {
        id: Some("counter-b".into()),
        ..WorkerOptions::default()
    };
    workshop.register_with::<Counter, _>(options_a, || Counter).unwrap();
    workshop.register_with::<Counter, _>(options_b, || Counter).unwrap();
    workshop.start().unwrap();

    workshop
        .emit(
            Message::new(Instruction::of::<Counter>("bump"))
                .to(Contact::class(Counter::CLASS))
                .notify_all(),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        HITS.load(Ordering::SeqCst) == 2
    }));
    workshop.stop();
}

#[test]
fn concurrent_loop_workbench_serves_mails() {
    let mut workshop = Workshop::new();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l3 = Arc::clone(&log);
    let options = WorkerOptions {
        workbench: "concurrent-loop".into(),
        ..WorkerOptions::default()
    };
    workshop
        .register_with::<Three, _>(options, move || Three { log: l3.clone() })
        .unwrap();
    workshop.start().unwrap();

    let first = workshop
        .submit(Message::new(Instruction::of::<Three>("greet")))
        .unwrap();
    let second = workshop
        .submit(Message::new(Instruction::of::<Three>("greet")))
        .unwrap();
    first.result(Some(Duration::from_secs(5))).unwrap();
    second.result(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
    workshop.stop();
}

#[test]
fn queued_mail_is_drained_on_stop() {
    let mut workshop = Workshop::new();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l3 = Arc::clone(&log);
    workshop
        .register::<Three, _>(move || Three { log: l3.clone() })
        .unwrap();
    workshop.start().unwrap();

    let futures: Vec<_> = (0..4)
        .map(|_| {
            workshop
                .submit(Message::new(Instruction::of::<Three>("greet")))
                .unwrap()
        })
        .collect();
    workshop.stop();
    for future in futures {
        assert_eq!(
            future.result(Some(Duration::from_secs(1))).unwrap(),
            Value::from("three")
        );
    }
}

#[test]
fn stopped_stations_do_not_restart() {
    use atelier_workshop::station::{Station, ThreadStation};
    use atelier_workshop::workbench::{LoopWorkbench, Workbench};

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l1 = Arc::clone(&log);
    let mut station = ThreadStation::new(
        Creator::new(|| Box::new(LoopWorkbench) as Box<dyn Workbench>),
        Creator::new(move || Box::new(One { log: l1.clone() }) as Box<dyn Worker>),
        One::CLASS,
    );
    station.start().unwrap();
    assert!(station.wait_running(Duration::from_secs(5)));
    station.stop();
    assert!(!station.is_running());
    station.stop();
    assert!(matches!(
        station.start(),
        Err(WorkError::StationState(ref s)) if s == "start"
    ));
}

#[test]
fn mismatched_instruction_class_is_refused_by_the_workbench() {
    use atelier_workshop::mail::Mail;
    use atelier_workshop::station::{Station, ThreadStation};
    use atelier_workshop::workbench::{LoopWorkbench, Workbench};

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l1 = Arc::clone(&log);
    let mut station = ThreadStation::new(
        Creator::new(|| Box::new(LoopWorkbench) as Box<dyn Workbench>),
        Creator::new(move || Box::new(One { log: l1.clone() }) as Box<dyn Worker>),
        One::CLASS,
    );
    station.start().unwrap();

    let future = Future::new();
    station.send(Mail::new(Instruction::of::<Two>("greet"), Args::new()).with_future(future.clone()));
    match future.result(Some(Duration::from_secs(5))) {
        Err(FutureError::Failed(WorkError::ClassMismatch { expected, found })) => {
            assert_eq!(expected, "two");
            assert_eq!(found, "one");
        }
        other => panic!("expected class mismatch, got {other:?}"),
    }
    assert!(log.lock().unwrap().is_empty());
    station.stop();
}
