//! Per-tick dispatch loop
//!
//! One iteration per environment tick, in a fixed order: drain the deferred
//! queue completely, promote due delayed work on the heartbeat phase, then
//! advance the cyclic phase index. The deferred queue is swapped before the
//! drain, so work deferred during the drain lands on the next tick instead
//! of re-entering the current pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use crossbeam::select;
use tracing::trace;

use crate::clock::Tick;
use crate::process::Status;
use crate::scheduler::queue::Job;
use crate::scheduler::Scheduler;

/// Body of the dispatch thread: runs ticks until shut down or the clock
/// stream closes.
pub(crate) fn dispatch_loop(sched: Arc<Scheduler>, ticks: Receiver<Tick>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticks) -> msg => match msg {
                Ok(tick) => sched.run_tick(tick),
                Err(_) => break,
            },
        }
    }
    trace!("dispatch loop stopped");
}

impl Scheduler {
    /// Process one tick of the current phase.
    pub(crate) fn run_tick(self: &Arc<Self>, tick: Tick) {
        let _control = self.run_lock.lock();

        let index = self.phase_index.load(Ordering::Relaxed);
        let heartbeat = index == self.plan.heartbeat_index();
        trace!(phase = self.plan.name(index), elapsed = ?tick.elapsed, "tick");

        // 1. Drain the deferred queue, swapped out first.
        let batch = std::mem::take(&mut *self.deferred.lock());
        for job in batch {
            self.run_job(job);
        }

        // 2. Promote due delayed work on the heartbeat.
        if heartbeat {
            let now = self.clock.now();
            let due = {
                let mut delayed = self.delayed.lock();
                let due = delayed.drain_due(now);
                if !due.is_empty() {
                    trace!(promoted = due.len(), waiting = delayed.len(), "delayed work");
                }
                due
            };
            let mut deferred = self.deferred.lock();
            for job in due {
                if let Job::Managed(proc) = &job {
                    proc.state().wake_time = None;
                }
                deferred.push_back(job);
            }
        }

        // 3. Advance the phase index.
        self.phase_index
            .store((index + 1) % self.plan.len(), Ordering::Relaxed);

        if let Some(done) = tick.done {
            let _ = done.send(());
        }
    }

    fn run_job(self: &Arc<Self>, job: Job) {
        match job {
            Job::Managed(proc) => {
                {
                    let mut st = proc.state();
                    st.queued = false;
                    if st.status != Status::Ready {
                        // Cancelled while queued; the entry is stale.
                        return;
                    }
                }
                self.start_now(&proc);
            }
            Job::Fast(fp) => self.start_fast_now(fp.executor, fp.args),
        }
    }
}
