//! Execution scope handed to every executor
//!
//! A [`Scope`] is the explicit handle to the context an executor is running
//! on, plus its scheduler. Executors schedule further work and suspend
//! through it; calling the blocking [`Scheduler`] surface from inside an
//! executor would deadlock against the dispatch loop, so everything an
//! executor needs is mirrored here in a re-entrancy-safe form.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

use std::panic::panic_any;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::warn;

use crate::context::{Context, Handoff, TeardownToken, WakeMsg};
use crate::process::{Executor, GroupState, Outcome, Process, Status, Target, UpdateHook};
use crate::scheduler::queue::Job;
use crate::scheduler::{AwaitSetup, Scheduler};
use crate::value::Values;
use crate::SchedResult;

/// The current execution context of a running executor.
pub struct Scope {
    sched: Arc<Scheduler>,
    ctx: Arc<Context>,
    proc: Option<Arc<Process>>,
}

impl Scope {
    pub(crate) fn new(sched: Arc<Scheduler>, ctx: Arc<Context>, proc: Option<Arc<Process>>) -> Self {
        Self { sched, ctx, proc }
    }

    /// The scheduler this executor runs under.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The process this executor is running as; `None` for fast processes.
    pub fn process(&self) -> Option<&Arc<Process>> {
        self.proc.as_ref()
    }

    /// Spawn a managed process and run it now, ahead of this executor's own
    /// continuation.
    pub fn spawn(&self, executor: Executor, args: Values) -> Arc<Process> {
        let proc = self.sched.create(executor);
        proc.state().pending_args = Some(args);
        self.sched.start_now(&proc);
        proc
    }

    /// Run a fast process now, fire-and-forget.
    pub fn fast_spawn(&self, executor: Executor, args: Values) {
        self.sched.start_fast_now(executor, args);
    }

    /// Schedule work for the next tick.
    pub fn defer(&self, target: impl Into<Target>, args: Values) -> Arc<Process> {
        self.sched.defer_inner(target.into(), args)
    }

    /// Schedule a fast process for the next tick.
    pub fn fast_defer(&self, executor: Executor, args: Values) {
        self.sched.fast_defer_inner(executor, args);
    }

    /// Schedule work for the first heartbeat at or after `seconds` from now.
    pub fn delay(&self, seconds: f64, target: impl Into<Target>, args: Values) -> Arc<Process> {
        self.sched.delay_inner(seconds, target.into(), args)
    }

    /// Schedule a fast process for the first heartbeat at or after `seconds`
    /// from now.
    pub fn fast_delay(&self, seconds: f64, executor: Executor, args: Values) {
        self.sched.fast_delay_inner(seconds, executor, args);
    }

    /// Chain a continuation onto a process.
    pub fn push(&self, proc: &Arc<Process>, executor: Executor) -> Arc<Process> {
        self.sched.push_inner(proc, executor)
    }

    /// Cancel a process. Cancelling a terminal process is a reported no-op.
    pub fn cancel(&self, proc: &Arc<Process>) -> SchedResult<()> {
        self.sched.cancel_inner(proc)
    }

    /// Current status of a process.
    pub fn status(&self, proc: &Arc<Process>) -> Status {
        proc.status()
    }

    /// Suspend until `proc` completes or is cancelled, optionally bounded by
    /// a timeout in seconds. Returns immediately if `proc` is already
    /// terminal. A timed-out await resolves as `Cancelled`; completion wins
    /// over a timeout that has not fired yet.
    pub fn await_on(&mut self, proc: &Arc<Process>, timeout: Option<f64>) -> (Outcome, Values) {
        match self.sched.register_awaiter(proc, timeout) {
            AwaitSetup::Immediate(outcome, values) => (outcome, values),
            AwaitSetup::Parked { rx, wake } => self.park_on(rx, wake),
        }
    }

    /// Suspend for `seconds` (scheduler time): a delayed no-op process is
    /// scheduled and awaited.
    pub fn wait(&mut self, seconds: f64) {
        let nap = self
            .sched
            .delay_inner(seconds, Target::Exec(noop()), Vec::new());
        let _ = self.await_on(&nap, None);
    }

    /// Turn the current process into a group parent: attach the update hook
    /// and user fields, then create and defer one child per executor, each
    /// carrying a weak back-reference to this process. Returns the children
    /// in order. No-op with a warning on fast processes.
    pub fn adopt(&self, update: UpdateHook, fields: Values, execs: &[Executor]) -> Vec<Arc<Process>> {
        let Some(me) = self.proc.clone() else {
            warn!("adopt called from a fast process; ignoring");
            return Vec::new();
        };
        me.state().group = Some(GroupState { update, fields });

        let mut children = Vec::with_capacity(execs.len());
        for exec in execs {
            let child = self.sched.create(exec.clone());
            {
                let mut st = child.state();
                st.parent = Some(Arc::downgrade(&me));
                st.pending_args = Some(Vec::new());
            }
            me.state().children.push(child.clone());
            self.sched.enqueue_deferred(Job::Managed(child.clone()));
            children.push(child);
        }
        children
    }

    /// Park this context on a wake channel: hand the baton back to the
    /// resumer and block until woken. A teardown wake unwinds the context.
    pub(crate) fn park_on(
        &mut self,
        rx: Receiver<WakeMsg>,
        wake: Sender<WakeMsg>,
    ) -> (Outcome, Values) {
        self.ctx.set_wake(wake);
        if let Some(baton) = self.ctx.take_baton() {
            let _ = baton.send(Handoff::Suspended);
        }
        match rx.recv() {
            Ok(WakeMsg::Resume {
                outcome,
                values,
                baton,
            }) => {
                self.ctx.clear_wake();
                self.ctx.set_baton(baton);
                (outcome, values)
            }
            Ok(WakeMsg::Teardown { ack }) => panic_any(TeardownToken { ack }),
            // The wake channel died with the scheduler; unwind quietly.
            Err(_) => panic_any(TeardownToken { ack: None }),
        }
    }
}

fn noop() -> Executor {
    Executor::new(|_scope, _args| Vec::new())
}
