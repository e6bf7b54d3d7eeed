//! Deferred and delayed work queues
//!
//! Two scheduling granularities without a timer wheel: the deferred queue
//! holds work for the very next tick, the delayed queue holds work for the
//! first heartbeat at or after an absolute wake time. The delayed queue is a
//! plain vector kept sorted lazily: a dirty flag is set when an insertion
//! violates the existing order and one full sort runs before the next scan,
//! which amortizes sort cost under bursty scheduling.

use std::sync::Arc;
use std::time::Instant;

use crate::process::{FastProcess, Process};

/// One schedulable unit in a queue.
pub(crate) enum Job {
    /// A managed process; run only if still `Ready` when dequeued.
    Managed(Arc<Process>),
    /// A fast process; run unconditionally.
    Fast(FastProcess),
}

/// A delayed queue entry.
pub(crate) struct DelayedEntry {
    /// Absolute time at or after which the job becomes eligible.
    pub wake: Instant,
    pub job: Job,
}

/// Wake-time ordered queue with lazy re-sorting.
pub(crate) struct DelayedQueue {
    entries: Vec<DelayedEntry>,
    dirty: bool,
}

impl DelayedQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            dirty: false,
        }
    }

    /// Insert an entry, marking the queue dirty if order is violated.
    pub(crate) fn insert(&mut self, entry: DelayedEntry) {
        if let Some(last) = self.entries.last() {
            if last.wake > entry.wake {
                self.dirty = true;
            }
        }
        self.entries.push(entry);
    }

    /// Remove and return every job whose wake time has passed, re-sorting
    /// first if needed. Equal wake times keep insertion order.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<Job> {
        if self.dirty {
            self.entries.sort_by_key(|e| e.wake);
            self.dirty = false;
        }
        let cut = self.entries.partition_point(|e| e.wake <= now);
        self.entries.drain(..cut).map(|e| e.job).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn is_dirty(&self) -> bool {
        self.dirty
    }
}
