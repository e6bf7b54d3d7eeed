//! Integration tests for the scheduler core: spawn/defer/delay dispatch,
//! await and cancel protocols, driven through a virtual clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use corun_core::{
    Executor, Outcome, PhasePlan, SchedError, Scheduler, SchedulerConfig, Status, Value,
    VirtualClock,
};

fn started(plan: PhasePlan) -> (Arc<Scheduler>, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new());
    let sched = Scheduler::new(clock.clone(), SchedulerConfig { phases: plan });
    sched.start(2).expect("Failed to start scheduler");
    (sched, clock)
}

fn single() -> (Arc<Scheduler>, Arc<VirtualClock>) {
    started(PhasePlan::single())
}

fn counting(counter: &Arc<AtomicUsize>) -> Executor {
    let counter = counter.clone();
    Executor::new(move |_scope, _args| {
        counter.fetch_add(1, Ordering::SeqCst);
        Vec::new()
    })
}

fn doubling() -> Executor {
    Executor::new(|_scope, args| {
        args.iter()
            .map(|v| Value::int(v.as_int().unwrap_or(0) * 2))
            .collect()
    })
}

#[test]
fn test_spawn_runs_immediately_and_captures_result() {
    let (sched, _clock) = single();

    let proc = sched.spawn(
        Executor::new(|_scope, args| vec![args[0].clone(), Value::nil(), Value::str("x")]),
        vec![Value::int(42)],
    );

    assert_eq!(proc.status(), Status::Done);

    // Awaiting a terminal process returns immediately, preserving order and
    // nil gaps up to the recorded arity.
    let (outcome, values) = sched.await_on(&proc, None);
    assert_eq!(outcome, Outcome::Done);
    assert_eq!(values, vec![Value::int(42), Value::nil(), Value::str("x")]);

    sched.shutdown().unwrap();
}

#[test]
fn test_defer_runs_on_next_tick() {
    let (sched, clock) = single();
    let counter = Arc::new(AtomicUsize::new(0));

    let proc = sched.defer(counting(&counter), Vec::new());
    assert_eq!(proc.status(), Status::Ready);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    clock.tick();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(proc.status(), Status::Done);

    sched.shutdown().unwrap();
}

#[test]
fn test_defer_during_drain_runs_on_following_tick() {
    let (sched, clock) = single();
    let inner = Arc::new(AtomicUsize::new(0));

    let inner_exec = counting(&inner);
    sched.defer(
        Executor::new(move |scope, _args| {
            scope.defer(inner_exec.clone(), Vec::new());
            Vec::new()
        }),
        Vec::new(),
    );

    // Tick T runs the outer executor; the work it defers must not re-enter
    // the same drain.
    clock.tick();
    assert_eq!(inner.load(Ordering::SeqCst), 0);

    clock.tick();
    assert_eq!(inner.load(Ordering::SeqCst), 1);

    sched.shutdown().unwrap();
}

#[test]
fn test_fast_defer_runs_on_next_tick() {
    let (sched, clock) = single();
    let counter = Arc::new(AtomicUsize::new(0));

    sched.fast_defer(counting(&counter), Vec::new());
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    clock.tick();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    sched.shutdown().unwrap();
}

#[test]
fn test_zero_delay_still_waits_for_heartbeat() {
    let plan = PhasePlan::new(
        vec!["step".to_string(), "render".to_string(), "heartbeat".to_string()],
        2,
    )
    .unwrap();
    let (sched, clock) = started(plan);
    let counter = Arc::new(AtomicUsize::new(0));

    sched.delay(0.0, counting(&counter), Vec::new());
    clock.advance(0.001);

    clock.tick(); // step
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    clock.tick(); // render
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    clock.tick(); // heartbeat: promoted to the deferred queue
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    clock.tick(); // next cycle: runs
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    sched.shutdown().unwrap();
}

#[test]
fn test_delay_respects_wake_time() {
    let (sched, clock) = single();
    let counter = Arc::new(AtomicUsize::new(0));

    sched.delay(5.0, counting(&counter), Vec::new());

    clock.advance(1.0);
    clock.cycle(3);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    clock.advance(5.0);
    clock.cycle(2); // heartbeat promotes, following tick runs
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    sched.shutdown().unwrap();
}

#[test]
fn test_cancel_ready_never_runs() {
    let (sched, clock) = single();
    let counter = Arc::new(AtomicUsize::new(0));

    let proc = sched.defer(counting(&counter), Vec::new());
    sched.cancel(&proc).unwrap();
    assert_eq!(proc.status(), Status::Cancelled);

    clock.cycle(2);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Cancelling a terminal process is a reported no-op.
    assert!(matches!(
        sched.cancel(&proc),
        Err(SchedError::InvalidState { .. })
    ));

    sched.shutdown().unwrap();
}

#[test]
fn test_cancel_active_awaiters_observe_cancelled() {
    let (sched, clock) = single();
    let post = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(None));

    // A parks awaiting a gate that is never scheduled.
    let gate = sched.create(Executor::new(|_scope, _args| Vec::new()));
    let post2 = post.clone();
    let gate2 = gate.clone();
    let a = sched.spawn(
        Executor::new(move |scope, _args| {
            let _ = scope.await_on(&gate2, None);
            post2.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }),
        Vec::new(),
    );
    assert_eq!(a.status(), Status::Active);

    // B parks awaiting A.
    let observed2 = observed.clone();
    let a2 = a.clone();
    sched.spawn(
        Executor::new(move |scope, _args| {
            let (outcome, _values) = scope.await_on(&a2, None);
            *observed2.lock().unwrap() = Some(outcome);
            Vec::new()
        }),
        Vec::new(),
    );

    sched.cancel(&a).unwrap();
    assert_eq!(a.status(), Status::Cancelled);

    // Awaiter resumption is asynchronous, delivered on the next tick.
    assert_eq!(*observed.lock().unwrap(), None);
    clock.tick();
    assert_eq!(*observed.lock().unwrap(), Some(Outcome::Cancelled));

    // The torn-down context never resumes past its suspension point.
    clock.cycle(2);
    assert_eq!(post.load(Ordering::SeqCst), 0);

    // Future awaiters observe the same outcome, immediately.
    let (outcome, values) = sched.await_on(&a, None);
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(values.is_empty());

    sched.shutdown().unwrap();
}

#[test]
fn test_awaiters_resume_in_registration_order() {
    let (sched, clock) = single();
    let order = Arc::new(Mutex::new(Vec::new()));

    let gate = sched.defer(
        Executor::new(|_scope, _args| vec![Value::int(7)]),
        Vec::new(),
    );

    for tag in [1i64, 2, 3] {
        let order = order.clone();
        let gate = gate.clone();
        sched.spawn(
            Executor::new(move |scope, _args| {
                let (_outcome, values) = scope.await_on(&gate, None);
                order.lock().unwrap().push((tag, values[0].clone()));
                Vec::new()
            }),
            Vec::new(),
        );
    }

    clock.tick();
    let order = order.lock().unwrap();
    assert_eq!(
        *order,
        vec![
            (1, Value::int(7)),
            (2, Value::int(7)),
            (3, Value::int(7)),
        ]
    );

    sched.shutdown().unwrap();
}

#[test]
fn test_await_timeout_expires_as_cancelled() {
    let (sched, clock) = single();
    let observed = Arc::new(Mutex::new(None));

    let gate = sched.create(Executor::new(|_scope, _args| Vec::new()));
    let observed2 = observed.clone();
    let gate2 = gate.clone();
    let a = sched.spawn(
        Executor::new(move |scope, _args| {
            let (outcome, _values) = scope.await_on(&gate2, Some(1.0));
            *observed2.lock().unwrap() = Some(outcome);
            Vec::new()
        }),
        Vec::new(),
    );
    assert_eq!(a.status(), Status::Active);

    clock.advance(2.0);
    clock.cycle(2); // heartbeat promotes the timeout entry, next tick fires it

    assert_eq!(*observed.lock().unwrap(), Some(Outcome::Cancelled));
    assert_eq!(a.status(), Status::Done); // the awaiting executor resumed and finished
    assert_eq!(gate.status(), Status::Ready);

    sched.shutdown().unwrap();
}

#[test]
fn test_completion_wins_over_pending_timeout() {
    let (sched, clock) = single();
    let observed = Arc::new(Mutex::new(None));

    let gate = sched.delay(
        1.0,
        Executor::new(|_scope, _args| vec![Value::int(9)]),
        Vec::new(),
    );
    let observed2 = observed.clone();
    let gate2 = gate.clone();
    sched.spawn(
        Executor::new(move |scope, _args| {
            let result = scope.await_on(&gate2, Some(50.0));
            *observed2.lock().unwrap() = Some(result);
            Vec::new()
        }),
        Vec::new(),
    );

    clock.advance(2.0);
    clock.cycle(2);
    assert_eq!(
        *observed.lock().unwrap(),
        Some((Outcome::Done, vec![Value::int(9)]))
    );

    // The stale timeout entry eventually fires as a no-op.
    clock.advance(60.0);
    clock.cycle(2);
    assert_eq!(gate.status(), Status::Done);

    sched.shutdown().unwrap();
}

#[test]
fn test_host_await_with_timeout() {
    let (sched, clock) = single();

    let gate = sched.create(Executor::new(|_scope, _args| Vec::new()));

    let ticker = {
        let clock = clock.clone();
        thread::spawn(move || {
            for _ in 0..5 {
                thread::sleep(Duration::from_millis(10));
                clock.advance(1.0);
                clock.tick();
            }
        })
    };

    let (outcome, values) = sched.await_on(&gate, Some(1.0));
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(values.is_empty());

    ticker.join().unwrap();
    sched.shutdown().unwrap();
}

#[test]
fn test_chain_continuation_goes_through_deferred_queue() {
    let (sched, clock) = single();

    let gate = sched.defer(
        Executor::new(|_scope, _args| vec![Value::int(1)]),
        Vec::new(),
    );
    let gate2 = gate.clone();
    let p = sched.spawn(
        Executor::new(move |scope, _args| {
            let (_outcome, values) = scope.await_on(&gate2, None);
            vec![Value::int(values[0].as_int().unwrap() + 1)]
        }),
        Vec::new(),
    );
    let q = sched.push(
        &p,
        Executor::new(|_scope, args| vec![Value::int(args[0].as_int().unwrap() + 10)]),
    );

    clock.tick(); // gate completes, p resumes and completes, q is deferred
    assert_eq!(p.status(), Status::Done);
    assert_eq!(q.status(), Status::Ready);

    clock.tick(); // q runs with p's result
    assert_eq!(q.status(), Status::Done);
    assert_eq!(q.result().unwrap(), vec![Value::int(12)]);

    sched.shutdown().unwrap();
}

#[test]
fn test_spawn_await_matches_direct_invocation() {
    let (sched, _clock) = single();

    // Fast-spawn the same pure computation and capture its direct results.
    let direct = Arc::new(Mutex::new(None));
    let direct2 = direct.clone();
    sched.fast_spawn(
        Executor::new(move |_scope, args| {
            let out: Vec<Value> = args
                .iter()
                .map(|v| Value::int(v.as_int().unwrap_or(0) * 2))
                .collect();
            *direct2.lock().unwrap() = Some(out.clone());
            out
        }),
        vec![Value::int(21), Value::int(4)],
    );
    let direct = direct.lock().unwrap().clone().unwrap();

    let proc = sched.spawn(doubling(), vec![Value::int(21), Value::int(4)]);
    let (outcome, values) = sched.await_on(&proc, None);

    assert_eq!(outcome, Outcome::Done);
    assert_eq!(values, direct);
    assert_eq!(values, vec![Value::int(42), Value::int(8)]);

    sched.shutdown().unwrap();
}

#[test]
fn test_create_then_defer_existing_process() {
    let (sched, clock) = single();
    let counter = Arc::new(AtomicUsize::new(0));

    let proc = sched.create(counting(&counter));
    assert_eq!(proc.status(), Status::Ready);

    clock.cycle(2);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    sched.defer(&proc, Vec::new());
    clock.tick();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(sched.status(&proc), Status::Done);

    sched.shutdown().unwrap();
}

#[test]
fn test_independent_scheduler_instances() {
    let (sched1, clock1) = single();
    let (sched2, clock2) = single();
    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));

    sched1.defer(counting(&c1), Vec::new());
    sched2.defer(counting(&c2), Vec::new());

    clock1.tick();
    assert_eq!(c1.load(Ordering::SeqCst), 1);
    assert_eq!(c2.load(Ordering::SeqCst), 0);

    clock2.tick();
    assert_eq!(c2.load(Ordering::SeqCst), 1);

    sched1.shutdown().unwrap();
    sched2.shutdown().unwrap();
}
