//! Pooled execution contexts and their driver loops
//!
//! A context is a reusable suspendable execution unit: a dedicated thread
//! parked on a resume channel, running a fixed driver loop. Every resumption
//! is a rendezvous: the resumer blocks on a baton channel until the context
//! finishes its assignment or suspends, so exactly one context body executes
//! at any instant. This realizes cooperative scheduling on top of a
//! multi-threaded runtime without ever running two process bodies at once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::process::{FastProcess, Outcome, Process, Status};
use crate::scheduler::queue::Job;
use crate::scheduler::Scheduler;
use crate::scope::Scope;
use crate::value::Values;

/// Unique identifier for a Context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    fn new() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

/// Which pool a context belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Managed,
    Fast,
}

/// Control message delivered to an idle context.
pub(crate) enum Resume {
    /// The proceed token: run this assignment.
    Proceed(Assignment),
    /// Exit the driver loop without running anything.
    Retire,
}

/// One unit of work handed to a context, with the resumer's baton.
pub(crate) struct Assignment {
    pub job: Job,
    /// The resumer blocks on the other end until the context hands control
    /// back by finishing or suspending.
    pub baton: Sender<Handoff>,
}

/// Control returning to a resumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// The assignment ran to completion (or the context was destroyed).
    Finished,
    /// The occupying executor suspended; the context will be woken later.
    Suspended,
}

/// Message waking a suspended caller.
pub(crate) enum WakeMsg {
    /// Continue with an await outcome; carries the new baton.
    Resume {
        outcome: Outcome,
        values: Values,
        baton: Sender<Handoff>,
    },
    /// Abandon the suspended execution; the context is being destroyed.
    Teardown { ack: Option<Sender<()>> },
}

/// Panic payload used to unwind a torn-down context. The process-wide panic
/// hook stays silent for it; every `catch_unwind` in the crate re-raises it.
pub(crate) struct TeardownToken {
    pub ack: Option<Sender<()>>,
}

static PANIC_SILENCER: Lazy<()> = Lazy::new(|| {
    let prev = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if info.payload().downcast_ref::<TeardownToken>().is_none() {
            prev(info);
        }
    }));
});

/// Install the teardown-aware panic hook. Idempotent.
pub(crate) fn install_panic_silencer() {
    Lazy::force(&PANIC_SILENCER);
}

/// Send a wake message to a suspended caller and block until it hands
/// control back. A dead receiver (torn down or departed host thread) is
/// skipped silently.
pub(crate) fn resume_rendezvous(reply: &Sender<WakeMsg>, outcome: Outcome, values: Values) {
    let (baton_tx, baton_rx) = bounded(1);
    let msg = WakeMsg::Resume {
        outcome,
        values,
        baton: baton_tx,
    };
    if reply.send(msg).is_ok() {
        let _ = baton_rx.recv();
    }
}

/// A reusable suspendable execution unit.
pub(crate) struct Context {
    id: ContextId,
    kind: PoolKind,
    resume_tx: Sender<Resume>,
    /// Wake channel of the suspension the occupying executor is currently
    /// parked in; `None` while running or idle.
    wake: Mutex<Option<Sender<WakeMsg>>>,
    /// Baton to whoever most recently resumed this context.
    baton: Mutex<Option<Sender<Handoff>>>,
}

impl Context {
    /// Create a context and start its driver thread.
    fn spawn(sched: Arc<Scheduler>, kind: PoolKind) -> Arc<Self> {
        let (resume_tx, resume_rx) = unbounded();
        let ctx = Arc::new(Context {
            id: ContextId::new(),
            kind,
            resume_tx,
            wake: Mutex::new(None),
            baton: Mutex::new(None),
        });

        let thread_ctx = ctx.clone();
        thread::Builder::new()
            .name(format!("corun-ctx-{}", ctx.id.as_u64()))
            .spawn(move || drive(sched, thread_ctx, resume_rx))
            .expect("Failed to spawn context thread");

        ctx
    }

    /// Hand an assignment to the idle context.
    pub(crate) fn resume(&self, assignment: Assignment) {
        let _ = self.resume_tx.send(Resume::Proceed(assignment));
    }

    /// Ask an idle context to exit its driver loop.
    pub(crate) fn retire(&self) {
        let _ = self.resume_tx.send(Resume::Retire);
    }

    /// Destroy a suspended context: wake it with a teardown message and wait
    /// for the unwind to complete. A context that is not suspended has no
    /// wake channel and is left alone (the driver destroys it on exit).
    pub(crate) fn teardown(&self) {
        let wake = self.wake.lock().take();
        if let Some(tx) = wake {
            let (ack_tx, ack_rx) = bounded(1);
            if tx
                .send(WakeMsg::Teardown {
                    ack: Some(ack_tx),
                })
                .is_ok()
            {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Record the baton of the party that just resumed this context.
    pub(crate) fn set_baton(&self, baton: Sender<Handoff>) {
        *self.baton.lock() = Some(baton);
    }

    /// Take the current baton, if any.
    pub(crate) fn take_baton(&self) -> Option<Sender<Handoff>> {
        self.baton.lock().take()
    }

    /// Register the wake channel of an in-progress suspension.
    pub(crate) fn set_wake(&self, wake: Sender<WakeMsg>) {
        *self.wake.lock() = Some(wake);
    }

    /// Clear the wake channel after a normal resumption.
    pub(crate) fn clear_wake(&self) {
        *self.wake.lock() = None;
    }
}

/// Pool of idle contexts, with a hot just-released slot.
pub(crate) struct ContextPool {
    kind: PoolKind,
    /// The context that most recently finished, kept warm so back-to-back
    /// spawns on one tick skip the pool round-trip.
    hot: Mutex<Option<Arc<Context>>>,
    idle: Mutex<Vec<Arc<Context>>>,
    /// Every context ever created for this pool and still alive; lets
    /// shutdown retire idle contexts and tear down suspended ones.
    live: Mutex<FxHashMap<u64, Weak<Context>>>,
}

impl ContextPool {
    pub(crate) fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            hot: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
            live: Mutex::new(FxHashMap::default()),
        }
    }

    /// Acquire a context: hot slot, then pool, then a fresh thread.
    pub(crate) fn acquire(&self, sched: &Arc<Scheduler>) -> Arc<Context> {
        if let Some(ctx) = self.hot.lock().take() {
            return ctx;
        }
        if let Some(ctx) = self.idle.lock().pop() {
            return ctx;
        }
        let ctx = Context::spawn(sched.clone(), self.kind);
        trace!(context = ctx.id.as_u64(), kind = ?self.kind, "pool grew");
        self.live
            .lock()
            .insert(ctx.id.as_u64(), Arc::downgrade(&ctx));
        ctx
    }

    /// Return a finished context to the pool.
    pub(crate) fn release(&self, ctx: Arc<Context>) {
        let mut hot = self.hot.lock();
        if hot.is_none() {
            *hot = Some(ctx);
        } else {
            self.idle.lock().push(ctx);
        }
    }

    /// Pre-spawn `count` idle contexts.
    pub(crate) fn preallocate(&self, sched: &Arc<Scheduler>, count: usize) {
        let mut idle = self.idle.lock();
        let mut live = self.live.lock();
        for _ in 0..count {
            let ctx = Context::spawn(sched.clone(), self.kind);
            live.insert(ctx.id.as_u64(), Arc::downgrade(&ctx));
            idle.push(ctx);
        }
    }

    /// Drop a destroyed context from the live registry.
    pub(crate) fn forget(&self, id: ContextId) {
        self.live.lock().remove(&id.as_u64());
    }

    /// Retire every pooled context and tear down any suspended one.
    /// Full-teardown path; only called from scheduler shutdown.
    pub(crate) fn retire_all(&self) {
        if let Some(ctx) = self.hot.lock().take() {
            ctx.retire();
        }
        for ctx in self.idle.lock().drain(..) {
            ctx.retire();
        }
        let live: Vec<_> = self.live.lock().values().filter_map(Weak::upgrade).collect();
        for ctx in live {
            ctx.teardown();
            ctx.retire();
        }
    }
}

/// How a driver step ended.
enum RunExit {
    /// Normal completion; the context goes back to the pool.
    Completed,
    /// The context was torn down or self-cancelled; its execution state is
    /// not safe to reuse, so the thread exits instead of re-pooling.
    Destroyed,
}

/// Driver loop run by every pooled context thread.
fn drive(sched: Arc<Scheduler>, ctx: Arc<Context>, resume_rx: Receiver<Resume>) {
    while let Ok(msg) = resume_rx.recv() {
        let assignment = match msg {
            Resume::Proceed(a) => a,
            Resume::Retire => break,
        };
        ctx.set_baton(assignment.baton);

        let exit = match assignment.job {
            Job::Managed(proc) => run_managed(&sched, &ctx, proc),
            Job::Fast(fp) => run_fast(&sched, &ctx, fp),
        };

        match exit {
            RunExit::Completed => {
                let baton = ctx.take_baton();
                sched.pool(ctx.kind).release(ctx.clone());
                if let Some(baton) = baton {
                    let _ = baton.send(Handoff::Finished);
                }
            }
            RunExit::Destroyed => {
                let baton = ctx.take_baton();
                if let Some(baton) = baton {
                    let _ = baton.send(Handoff::Finished);
                }
                break;
            }
        }
    }
    sched.pool(ctx.kind).forget(ctx.id);
    trace!(context = ctx.id.as_u64(), "context destroyed");
}

/// Run one managed process to completion on this context.
fn run_managed(sched: &Arc<Scheduler>, ctx: &Arc<Context>, proc: Arc<Process>) -> RunExit {
    let args = {
        let mut st = proc.state();
        if st.status != Status::Ready {
            // Cancelled while queued; nothing to run.
            return RunExit::Completed;
        }
        st.status = Status::Active;
        st.context = Some(ctx.clone());
        st.pending_args.take().unwrap_or_default()
    };

    let executor = proc.executor().clone();
    let mut scope = Scope::new(sched.clone(), ctx.clone(), Some(proc.clone()));
    match panic::catch_unwind(AssertUnwindSafe(|| executor.call(&mut scope, args))) {
        Ok(values) => finish(sched, &proc, values),
        Err(payload) => unwound(payload),
    }
}

/// Run one fast process: executor then self-release, no bookkeeping.
fn run_fast(sched: &Arc<Scheduler>, ctx: &Arc<Context>, fp: FastProcess) -> RunExit {
    let FastProcess { executor, args } = fp;
    let mut scope = Scope::new(sched.clone(), ctx.clone(), None);
    match panic::catch_unwind(AssertUnwindSafe(|| executor.call(&mut scope, args))) {
        Ok(_) => RunExit::Completed,
        Err(payload) => unwound(payload),
    }
}

/// Classify an unwind out of an executor.
fn unwound(payload: Box<dyn Any + Send>) -> RunExit {
    match payload.downcast::<TeardownToken>() {
        Ok(token) => {
            if let Some(ack) = token.ack {
                let _ = ack.send(());
            }
            RunExit::Destroyed
        }
        // An executor fault is the host's responsibility; let it propagate.
        Err(other) => panic::resume_unwind(other),
    }
}

/// Completion bookkeeping for a managed process: capture the result, resume
/// awaiters FIFO, schedule the chained successor, notify the group parent.
fn finish(sched: &Arc<Scheduler>, proc: &Arc<Process>, values: Values) -> RunExit {
    let (awaiters, next, parent) = {
        let mut st = proc.state();
        if st.status == Status::Cancelled {
            // Cancelled from inside its own executor; nothing to record and
            // the context must not be reused.
            st.context = None;
            return RunExit::Destroyed;
        }
        st.status = Status::Done;
        st.result = Some(values.clone());
        st.context = None;
        (
            std::mem::take(&mut st.awaiters),
            st.next.take(),
            st.parent.clone(),
        )
    };

    for awaiter in awaiters {
        let won = awaiter
            .timeout_guard
            .as_ref()
            .map_or(true, |g| !g.swap(true, Ordering::SeqCst));
        if won {
            resume_rendezvous(&awaiter.reply, Outcome::Done, values.clone());
        }
    }

    if let Some(next) = next {
        next.state().pending_args = Some(values.clone());
        sched.enqueue_deferred(Job::Managed(next));
    }

    if let Some(parent) = parent.and_then(|w| w.upgrade()) {
        let hook = parent.state().group.as_ref().map(|g| g.update.clone());
        if let Some(hook) = hook {
            hook(&parent, proc);
        }
    }

    RunExit::Completed
}
