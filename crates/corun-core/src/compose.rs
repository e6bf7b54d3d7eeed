//! Combinators built on the scheduling primitives
//!
//! Everything here is an ordinary executor run through the normal process
//! machinery: chaining, retrying, protected calls and wait-for-N-of-M
//! grouping require no scheduler support beyond what `Scope` exposes.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::bounded;

use crate::context::{resume_rendezvous, TeardownToken};
use crate::process::{Executor, Outcome, Status, UpdateHook};
use crate::value::Value;

/// Compose `execs` into a single executor that runs the stages left to
/// right, each stage's result sequence becoming the next stage's arguments.
/// The composed executor resolves to the final stage's results, or to an
/// empty sequence if the chain is cancelled.
pub fn chain(execs: Vec<Executor>) -> Executor {
    Executor::new(move |scope, args| {
        let Some(first) = execs.first() else {
            return args;
        };
        let head = scope.defer(first.clone(), args);
        let mut tail = head;
        for exec in &execs[1..] {
            tail = scope.push(&tail, exec.clone());
        }
        let (outcome, values) = scope.await_on(&tail, None);
        match outcome {
            Outcome::Done => values,
            Outcome::Cancelled => Vec::new(),
        }
    })
}

/// Re-invoke `exec` up to `count` times, treating a truthy first return
/// value as success and stopping early on it. With `delay_seconds` set, the
/// executor sleeps between attempts. The final attempt's full result
/// sequence is returned regardless of the success flag.
pub fn retry(count: u32, delay_seconds: Option<f64>, exec: Executor) -> Executor {
    let count = count.max(1);
    Executor::new(move |scope, args| {
        let mut last = Vec::new();
        for attempt in 1..=count {
            last = exec.call(scope, args.clone());
            if last.first().is_some_and(Value::is_truthy) {
                break;
            }
            if attempt < count {
                if let Some(seconds) = delay_seconds {
                    scope.wait(seconds);
                }
            }
        }
        last
    })
}

/// Invoke `exec`, containing any panic it raises. The composed executor
/// returns `[Bool(ok), ...]`: on success the executor's results follow the
/// flag; on failure the failure payload is passed to `handler` (whose
/// results follow the flag) or appended directly when no handler is given.
/// Context teardown is never contained.
pub fn pcall(exec: Executor, handler: Option<Executor>) -> Executor {
    Executor::new(move |scope, args| {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| exec.call(scope, args.clone())));
        match attempt {
            Ok(mut values) => {
                let mut out = vec![Value::bool(true)];
                out.append(&mut values);
                out
            }
            Err(payload) => {
                if payload.downcast_ref::<TeardownToken>().is_some() {
                    panic::resume_unwind(payload);
                }
                let failure = Value::str(panic_message(payload.as_ref()));
                let mut out = vec![Value::bool(false)];
                match &handler {
                    Some(handler) => out.append(&mut handler.call(scope, vec![failure])),
                    None => out.push(failure),
                }
                out
            }
        }
    })
}

/// Run `execs` as children of the composed executor's own process and park
/// until `count` of them complete (default: all, clamped to `[0, n]`), then
/// tear down any still-active sibling. Resolves to
/// `[Bool(true), Int(completed)]`, or `[Bool(false)]` if the group parent is
/// itself cancelled while parked.
pub fn all(execs: Vec<Executor>, count: Option<usize>) -> Executor {
    Executor::new(move |scope, _args| {
        let target = count.unwrap_or(execs.len()).min(execs.len());
        let (tx, rx) = bounded(1);
        let done = Arc::new(AtomicUsize::new(0));

        let hook: UpdateHook = {
            let tx = tx.clone();
            let done = done.clone();
            Arc::new(move |_parent, _child| {
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                if finished == target {
                    resume_rendezvous(&tx, Outcome::Done, Vec::new());
                }
            })
        };

        let children = scope.adopt(hook, Vec::new(), &execs);

        if target > 0 {
            let (outcome, _) = scope.park_on(rx, tx);
            if outcome == Outcome::Cancelled {
                return vec![Value::bool(false)];
            }
        }

        // The threshold is met; abandoned siblings never complete.
        for child in &children {
            if matches!(child.status(), Status::Ready | Status::Active) {
                let _ = scope.cancel(child);
            }
        }

        vec![
            Value::bool(true),
            Value::int(done.load(Ordering::SeqCst) as i64),
        ]
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
