//! The scheduler: pools, queues, phase plan and the public operation surface
//!
//! All scheduler state lives in one explicit object with a controlled
//! `start`/`shutdown` lifecycle; multiple independent instances can coexist,
//! which the test suites rely on. Operations that hand control to a context
//! (spawn, chain-onto-done, cancel teardown and the dispatch loop itself)
//! serialize on a single control lock, so at most one context body runs at
//! any instant.

mod dispatch;
pub(crate) mod queue;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::ClockRef;
use crate::context::{
    install_panic_silencer, resume_rendezvous, Assignment, ContextPool, PoolKind, WakeMsg,
};
use crate::process::{
    Awaiter, Executor, FastProcess, GroupState, Outcome, Process, Status, Target, UpdateHook,
};
use crate::value::Values;
use crate::{SchedError, SchedResult};

use queue::{DelayedEntry, DelayedQueue, Job};

/// Ordered, cyclically repeating tick phases with one distinguished
/// heartbeat phase.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    names: Vec<String>,
    heartbeat: usize,
}

impl PhasePlan {
    /// Build a phase plan; `heartbeat` must index into `names`.
    pub fn new(names: Vec<String>, heartbeat: usize) -> SchedResult<Self> {
        if names.is_empty() || heartbeat >= names.len() {
            return Err(SchedError::InvalidPhasePlan {
                heartbeat,
                phases: names.len(),
            });
        }
        Ok(Self { names, heartbeat })
    }

    /// The minimal plan: a single phase that is also the heartbeat.
    pub fn single() -> Self {
        Self {
            names: vec!["heartbeat".to_string()],
            heartbeat: 0,
        }
    }

    /// Number of phases per cycle.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// A phase plan is never empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of the heartbeat phase.
    pub fn heartbeat_index(&self) -> usize {
        self.heartbeat
    }

    /// Name of the phase at `index`.
    pub fn name(&self, index: usize) -> &str {
        &self.names[index % self.names.len()]
    }
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self::single()
    }
}

/// Scheduler construction options.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// The host's tick phase ordering.
    pub phases: PhasePlan,
}

/// Outcome of registering an awaiter.
pub(crate) enum AwaitSetup {
    /// The process was already terminal; no suspension happened.
    Immediate(Outcome, Values),
    /// The caller is registered and must park on `rx`; `wake` is the same
    /// channel's sender, to be installed as the context's wake slot.
    Parked {
        rx: crossbeam::channel::Receiver<WakeMsg>,
        wake: Sender<WakeMsg>,
    },
}

/// A cooperative process scheduler over pooled execution contexts.
pub struct Scheduler {
    clock: ClockRef,
    plan: PhasePlan,
    running: AtomicBool,
    phase_index: AtomicUsize,
    /// Held by whoever currently drives context execution.
    run_lock: Mutex<()>,
    deferred: Mutex<VecDeque<Job>>,
    delayed: Mutex<DelayedQueue>,
    managed: ContextPool,
    fast: ContextPool,
    /// Per-request epsilon so same-tick delays never coalesce to one wake
    /// time.
    delay_seq: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl Scheduler {
    /// Create a scheduler over the given clock. The dispatch loop does not
    /// run until [`start`] is called.
    ///
    /// [`start`]: Scheduler::start
    pub fn new(clock: ClockRef, config: SchedulerConfig) -> Arc<Self> {
        install_panic_silencer();
        Arc::new(Self {
            clock,
            plan: config.phases,
            running: AtomicBool::new(false),
            phase_index: AtomicUsize::new(0),
            run_lock: Mutex::new(()),
            deferred: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(DelayedQueue::new()),
            managed: ContextPool::new(PoolKind::Managed),
            fast: ContextPool::new(PoolKind::Fast),
            delay_seq: AtomicU64::new(0),
            dispatch: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        })
    }

    /// The configured phase plan.
    pub fn phases(&self) -> &PhasePlan {
        &self.plan
    }

    /// Name of the phase the next tick will run.
    pub fn current_phase(&self) -> &str {
        self.plan.name(self.phase_index.load(Ordering::Relaxed))
    }

    /// Start the dispatch loop, preallocating `preallocate` managed
    /// contexts. Starting a running scheduler is a reported no-op.
    pub fn start(self: &Arc<Self>, preallocate: usize) -> SchedResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("start called on a running scheduler");
            return Err(SchedError::AlreadyRunning);
        }
        self.managed.preallocate(self, preallocate);

        let (shutdown_tx, shutdown_rx) = bounded(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let ticks = self.clock.ticks();
        let sched = self.clone();
        let handle = thread::Builder::new()
            .name("corun-dispatch".to_string())
            .spawn(move || dispatch::dispatch_loop(sched, ticks, shutdown_rx))
            .expect("Failed to spawn dispatch thread");
        *self.dispatch.lock() = Some(handle);

        debug!(phases = self.plan.len(), preallocate, "scheduler started");
        Ok(())
    }

    /// Stop the dispatch loop and destroy every pooled or suspended
    /// context. Shutting down a stopped scheduler is a reported no-op.
    pub fn shutdown(&self) -> SchedResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("shutdown called on a stopped scheduler");
            return Err(SchedError::NotRunning);
        }
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.dispatch.lock().take() {
            let _ = handle.join();
        }
        self.managed.retire_all();
        self.fast.retire_all();
        debug!("scheduler stopped");
        Ok(())
    }

    /// Create a process without scheduling it.
    pub fn create(&self, executor: Executor) -> Arc<Process> {
        Process::new(executor)
    }

    /// Spawn a process and run it immediately. Returns once the executor has
    /// completed or suspended for the first time.
    pub fn spawn(self: &Arc<Self>, executor: Executor, args: Values) -> Arc<Process> {
        let _control = self.run_lock.lock();
        let proc = Process::new(executor);
        proc.state().pending_args = Some(args);
        self.start_now(&proc);
        proc
    }

    /// Run a fast process immediately, fire-and-forget.
    pub fn fast_spawn(self: &Arc<Self>, executor: Executor, args: Values) {
        let _control = self.run_lock.lock();
        self.start_fast_now(executor, args);
    }

    /// Schedule work for the next tick.
    pub fn defer(self: &Arc<Self>, target: impl Into<Target>, args: Values) -> Arc<Process> {
        self.defer_inner(target.into(), args)
    }

    /// Schedule a fast process for the next tick, fire-and-forget.
    pub fn fast_defer(self: &Arc<Self>, executor: Executor, args: Values) {
        self.fast_defer_inner(executor, args);
    }

    /// Schedule work for the first heartbeat at or after `seconds` from now.
    pub fn delay(
        self: &Arc<Self>,
        seconds: f64,
        target: impl Into<Target>,
        args: Values,
    ) -> Arc<Process> {
        self.delay_inner(seconds, target.into(), args)
    }

    /// Schedule a fast process for the first heartbeat at or after `seconds`
    /// from now, fire-and-forget.
    pub fn fast_delay(self: &Arc<Self>, seconds: f64, executor: Executor, args: Values) {
        self.fast_delay_inner(seconds, executor, args);
    }

    /// Block the calling host thread until `proc` completes or is
    /// cancelled, optionally bounded by a timeout in seconds. Returns
    /// immediately if `proc` is already terminal.
    ///
    /// Must not be called from inside an executor; use
    /// [`Scope::await_on`](crate::scope::Scope::await_on) there.
    pub fn await_on(self: &Arc<Self>, proc: &Arc<Process>, timeout: Option<f64>) -> (Outcome, Values) {
        match self.register_awaiter(proc, timeout) {
            AwaitSetup::Immediate(outcome, values) => (outcome, values),
            AwaitSetup::Parked { rx, .. } => match rx.recv() {
                // Dropping the message releases the baton to the resumer.
                Ok(WakeMsg::Resume {
                    outcome, values, ..
                }) => (outcome, values),
                Ok(WakeMsg::Teardown { .. }) | Err(_) => (Outcome::Cancelled, Vec::new()),
            },
        }
    }

    /// Cancel a process. Legal from `Ready` or `Active`; cancelling a
    /// terminal process is a reported no-op.
    pub fn cancel(self: &Arc<Self>, proc: &Arc<Process>) -> SchedResult<()> {
        let _control = self.run_lock.lock();
        self.cancel_inner(proc)
    }

    /// Chain `executor` after `proc`: the process's result sequence becomes
    /// the continuation's arguments. Chaining onto a `Done` process spawns
    /// the continuation immediately; onto `Cancelled`, an already-cancelled
    /// stub is returned.
    pub fn push(self: &Arc<Self>, proc: &Arc<Process>, executor: Executor) -> Arc<Process> {
        let _control = self.run_lock.lock();
        self.push_inner(proc, executor)
    }

    /// Spawn `executor` as a group parent over one child process per entry
    /// in `children`. Children are deferred to the next tick and each
    /// completion invokes `update` on the completing child's context.
    pub fn parent(
        self: &Arc<Self>,
        executor: Executor,
        update: UpdateHook,
        fields: Values,
        children: Vec<Executor>,
        args: Values,
    ) -> Arc<Process> {
        let _control = self.run_lock.lock();
        let parent = Process::new(executor);
        parent.state().group = Some(GroupState { update, fields });

        for exec in children {
            let child = Process::new(exec);
            {
                let mut st = child.state();
                st.parent = Some(Arc::downgrade(&parent));
                st.pending_args = Some(Vec::new());
            }
            parent.state().children.push(child.clone());
            self.enqueue_deferred(Job::Managed(child));
        }

        parent.state().pending_args = Some(args);
        self.start_now(&parent);
        parent
    }

    /// Current status of a process.
    pub fn status(&self, proc: &Arc<Process>) -> Status {
        proc.status()
    }

    // -- internal operation surface, shared with `Scope` -------------------

    pub(crate) fn pool(&self, kind: PoolKind) -> &ContextPool {
        match kind {
            PoolKind::Managed => &self.managed,
            PoolKind::Fast => &self.fast,
        }
    }

    /// Run a managed process on a pooled context, blocking until it finishes
    /// or suspends. Caller must hold control (the run lock or a scope).
    pub(crate) fn start_now(self: &Arc<Self>, proc: &Arc<Process>) {
        let ctx = self.managed.acquire(self);
        let (baton_tx, baton_rx) = bounded(1);
        ctx.resume(Assignment {
            job: Job::Managed(proc.clone()),
            baton: baton_tx,
        });
        let _ = baton_rx.recv();
    }

    /// Run a fast process on a pooled context, blocking until it finishes or
    /// suspends.
    pub(crate) fn start_fast_now(self: &Arc<Self>, executor: Executor, args: Values) {
        let ctx = self.fast.acquire(self);
        let (baton_tx, baton_rx) = bounded(1);
        ctx.resume(Assignment {
            job: Job::Fast(FastProcess::new(executor, args)),
            baton: baton_tx,
        });
        let _ = baton_rx.recv();
    }

    pub(crate) fn enqueue_deferred(&self, job: Job) {
        if let Job::Managed(proc) = &job {
            proc.state().queued = true;
        }
        self.deferred.lock().push_back(job);
    }

    pub(crate) fn defer_inner(self: &Arc<Self>, target: Target, args: Values) -> Arc<Process> {
        let proc = match target {
            Target::Exec(executor) => Process::new(executor),
            Target::Proc(proc) => proc,
        };
        {
            let mut st = proc.state();
            if st.status != Status::Ready {
                warn!(process = %proc.id(), status = ?st.status, "defer on a non-ready process");
                return proc.clone();
            }
            if st.queued {
                warn!(process = %proc.id(), "defer on an already queued process");
                return proc.clone();
            }
            st.pending_args = Some(args);
        }
        self.enqueue_deferred(Job::Managed(proc.clone()));
        proc
    }

    pub(crate) fn fast_defer_inner(&self, executor: Executor, args: Values) {
        self.enqueue_deferred(Job::Fast(FastProcess::new(executor, args)));
    }

    pub(crate) fn delay_inner(
        self: &Arc<Self>,
        seconds: f64,
        target: Target,
        args: Values,
    ) -> Arc<Process> {
        let proc = match target {
            Target::Exec(executor) => Process::new(executor),
            Target::Proc(proc) => proc,
        };
        let wake = self.wake_time_for(seconds);
        {
            let mut st = proc.state();
            if st.status != Status::Ready {
                warn!(process = %proc.id(), status = ?st.status, "delay on a non-ready process");
                return proc.clone();
            }
            if st.queued {
                warn!(process = %proc.id(), "delay on an already queued process");
                return proc.clone();
            }
            st.pending_args = Some(args);
            st.wake_time = Some(wake);
            st.queued = true;
        }
        self.delayed.lock().insert(DelayedEntry {
            wake,
            job: Job::Managed(proc.clone()),
        });
        proc
    }

    pub(crate) fn fast_delay_inner(&self, seconds: f64, executor: Executor, args: Values) {
        let wake = self.wake_time_for(seconds);
        self.delayed.lock().insert(DelayedEntry {
            wake,
            job: Job::Fast(FastProcess::new(executor, args)),
        });
    }

    fn wake_time_for(&self, seconds: f64) -> Instant {
        let seconds = if seconds.is_finite() && seconds >= 0.0 {
            seconds
        } else {
            warn!(seconds, "malformed delay; clamping to zero");
            0.0
        };
        let epsilon = self.delay_seq.fetch_add(1, Ordering::Relaxed);
        self.clock.now() + Duration::from_secs_f64(seconds) + Duration::from_nanos(epsilon)
    }

    /// Check a process's state and either return its terminal outcome or
    /// register a new awaiter, arming the timeout entry if one is requested.
    pub(crate) fn register_awaiter(
        self: &Arc<Self>,
        proc: &Arc<Process>,
        timeout: Option<f64>,
    ) -> AwaitSetup {
        let timeout = timeout.and_then(|t| {
            if t.is_finite() && t >= 0.0 {
                Some(t)
            } else {
                warn!(timeout = t, "malformed await timeout; ignoring");
                None
            }
        });

        let (tx, rx) = bounded(1);
        let guard = timeout.map(|_| Arc::new(AtomicBool::new(false)));
        {
            let mut st = proc.state();
            match st.status {
                Status::Done => {
                    return AwaitSetup::Immediate(
                        Outcome::Done,
                        st.result.clone().unwrap_or_default(),
                    )
                }
                Status::Cancelled => return AwaitSetup::Immediate(Outcome::Cancelled, Vec::new()),
                Status::Ready | Status::Active => st.awaiters.push(Awaiter {
                    reply: tx.clone(),
                    timeout_guard: guard.clone(),
                }),
            }
        }
        if let (Some(seconds), Some(guard)) = (timeout, guard) {
            self.schedule_await_timeout(seconds, guard, tx.clone());
        }
        AwaitSetup::Parked { rx, wake: tx }
    }

    /// Arm a delayed fast process that force-resumes an awaiter with a
    /// `Cancelled` outcome. The entry is a no-op once `guard` is claimed:
    /// completion and timeout mutually cancel, and whichever fires first
    /// wins.
    fn schedule_await_timeout(
        &self,
        seconds: f64,
        guard: Arc<AtomicBool>,
        reply: Sender<WakeMsg>,
    ) {
        let executor = Executor::new(move |_scope, _args| {
            if !guard.swap(true, Ordering::SeqCst) {
                resume_rendezvous(&reply, Outcome::Cancelled, Vec::new());
            }
            Vec::new()
        });
        self.fast_delay_inner(seconds, executor, Vec::new());
    }

    pub(crate) fn cancel_inner(self: &Arc<Self>, proc: &Arc<Process>) -> SchedResult<()> {
        let (awaiters, next, context) = {
            let mut st = proc.state();
            match st.status {
                Status::Done | Status::Cancelled => {
                    warn!(process = %proc.id(), status = ?st.status, "cancel on a terminal process");
                    return Err(SchedError::InvalidState {
                        op: "cancel",
                        status: st.status,
                    });
                }
                Status::Ready | Status::Active => {}
            }
            st.status = Status::Cancelled;
            st.pending_args = None;
            st.wake_time = None;
            (
                std::mem::take(&mut st.awaiters),
                st.next.take(),
                st.context.take(),
            )
        };

        // Awaiters resume asynchronously, never inline in the cancelling
        // call, so the canceller's own stack is not re-entered.
        for Awaiter {
            reply,
            timeout_guard,
        } in awaiters
        {
            let deliver = Executor::new(move |_scope, _args| {
                let won = timeout_guard
                    .as_ref()
                    .map_or(true, |g| !g.swap(true, Ordering::SeqCst));
                if won {
                    resume_rendezvous(&reply, Outcome::Cancelled, Vec::new());
                }
                Vec::new()
            });
            self.enqueue_deferred(Job::Fast(FastProcess::new(deliver, Vec::new())));
        }

        if let Some(next) = next {
            let _ = self.cancel_inner(&next);
        }

        if let Some(context) = context {
            // The occupied context's execution state is unknown; destroy it
            // rather than returning it to the pool.
            context.teardown();
        }

        Ok(())
    }

    pub(crate) fn push_inner(self: &Arc<Self>, proc: &Arc<Process>, executor: Executor) -> Arc<Process> {
        let link = Process::new(executor);

        enum Attach {
            Chained,
            SpawnNow(Values),
            CancelledStub,
        }

        let attach = {
            let st = proc.state();
            match st.status {
                Status::Done => Attach::SpawnNow(st.result.clone().unwrap_or_default()),
                Status::Cancelled => Attach::CancelledStub,
                Status::Ready | Status::Active => Attach::Chained,
            }
        };

        match attach {
            Attach::Chained => {
                // Attach at the tail of the next-chain.
                let mut cur = proc.clone();
                loop {
                    let next = {
                        let mut st = cur.state();
                        match &st.next {
                            None => {
                                st.next = Some(link.clone());
                                None
                            }
                            Some(next) => Some(next.clone()),
                        }
                    };
                    match next {
                        None => break,
                        Some(next) => cur = next,
                    }
                }
            }
            Attach::SpawnNow(result) => {
                link.state().pending_args = Some(result);
                self.start_now(&link);
            }
            Attach::CancelledStub => {
                link.state().status = Status::Cancelled;
            }
        }
        link
    }
}
