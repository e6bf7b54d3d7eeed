//! Corun Core Runtime
//!
//! This crate provides a cooperative process scheduler including:
//! - Pooled, reusable execution contexts (managed and fast pools)
//! - Process state machine with await, cancel and chaining protocols
//! - Two-tier deferred/delayed dispatch driven by injected host ticks
//! - Composition combinators (chain, retry, protected call, groups)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod compose;
mod context;
pub mod process;
pub mod scheduler;
pub mod scope;
pub mod value;

pub use clock::{Clock, ClockRef, IntervalClock, Tick, VirtualClock};
pub use compose::{all, chain, pcall, retry};
pub use process::{Executor, Outcome, Process, ProcessId, Status, Target, UpdateHook};
pub use scheduler::{PhasePlan, Scheduler, SchedulerConfig};
pub use scope::Scope;
pub use value::{Value, Values};

/// Scheduler operation errors.
///
/// Misuse of the scheduler surface is never fatal: operations report the
/// mistake through one of these variants (and a warning diagnostic) and
/// leave the scheduler state untouched.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The process is in the wrong state for the requested operation.
    #[error("invalid state for {op}: process is {status:?}")]
    InvalidState {
        /// The operation that was attempted.
        op: &'static str,
        /// The process status at the time of the call.
        status: Status,
    },

    /// `start` called on a running scheduler.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// `shutdown` called on a stopped scheduler.
    #[error("scheduler is not running")]
    NotRunning,

    /// A phase plan with no phases or an out-of-range heartbeat index.
    #[error("invalid phase plan: heartbeat index {heartbeat} out of range for {phases} phases")]
    InvalidPhasePlan {
        /// The requested heartbeat index.
        heartbeat: usize,
        /// The number of phases supplied.
        phases: usize,
    },
}

/// Scheduler operation result.
pub type SchedResult<T> = Result<T, SchedError>;
