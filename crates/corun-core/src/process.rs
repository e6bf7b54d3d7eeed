//! Process records and execution state
//!
//! A [`Process`] is the managed, awaitable, cancellable unit of scheduled
//! work; a [`FastProcess`] is its fire-and-forget counterpart with no
//! bookkeeping at all. Process records are never reused after reaching a
//! terminal state; only execution contexts are recycled.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, MutexGuard};

use crate::context::{Context, WakeMsg};
use crate::scope::Scope;
use crate::value::Values;

/// Unique identifier for a Process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

impl ProcessId {
    /// Generate a new unique ProcessId.
    pub fn new() -> Self {
        ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// State of a Process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Created or queued, not yet running.
    Ready,
    /// Currently occupying an execution context.
    Active,
    /// Completed with a captured result sequence.
    Done,
    /// Cancelled before or during execution.
    Cancelled,
}

/// How an await resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The awaited process completed; its result sequence follows.
    Done,
    /// The awaited process was cancelled or the await timed out.
    Cancelled,
}

/// Executor function signature: a callable over value sequences.
pub type ExecFn = dyn Fn(&mut Scope, Values) -> Values + Send + Sync;

/// A shared, re-invokable executor.
#[derive(Clone)]
pub struct Executor(Arc<ExecFn>);

impl Executor {
    /// Wrap a closure as an executor.
    pub fn new(f: impl Fn(&mut Scope, Values) -> Values + Send + Sync + 'static) -> Self {
        Executor(Arc::new(f))
    }

    /// Invoke the executor.
    pub(crate) fn call(&self, scope: &mut Scope, args: Values) -> Values {
        (self.0)(scope, args)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Executor")
    }
}

/// Hook invoked on a group parent each time one of its children completes.
/// Receives the parent and the completed child.
pub type UpdateHook = Arc<dyn Fn(&Arc<Process>, &Arc<Process>) + Send + Sync>;

/// Group bookkeeping carried by parent processes.
pub(crate) struct GroupState {
    /// Completion hook, run on the completing child's context.
    pub update: UpdateHook,
    /// User payload attached at group creation.
    pub fields: Values,
}

/// A suspended caller blocked on a process's completion.
pub(crate) struct Awaiter {
    /// Reply channel; resuming sends a wake message here.
    pub reply: Sender<WakeMsg>,
    /// Shared flag arbitrating against this awaiter's timeout entry, if any.
    /// Whichever side swaps it to `true` first delivers the resumption.
    pub timeout_guard: Option<Arc<AtomicBool>>,
}

/// Mutable process state, guarded by the record's mutex.
pub(crate) struct ProcState {
    pub status: Status,
    /// Occupying context; present iff `status == Active`.
    pub context: Option<Arc<Context>>,
    /// Captured result sequence; present iff `status == Done`.
    pub result: Option<Values>,
    /// Suspended callers, resumed FIFO on completion or cancellation.
    pub awaiters: Vec<Awaiter>,
    /// Chained successor, started with this process's result as arguments.
    pub next: Option<Arc<Process>>,
    /// Group back-reference; never owning.
    pub parent: Option<Weak<Process>>,
    /// Child processes, group parents only.
    pub children: Vec<Arc<Process>>,
    /// Arguments applied when a deferred/delayed process is resumed.
    /// `None` (never assigned) is distinct from `Some(vec![])` (zero args).
    pub pending_args: Option<Values>,
    /// Absolute wake time, delayed processes only.
    pub wake_time: Option<Instant>,
    /// True while the process sits in the deferred or delayed queue.
    pub queued: bool,
    /// Group bookkeeping, parent processes only.
    pub group: Option<GroupState>,
}

/// A managed unit of scheduled work.
pub struct Process {
    id: ProcessId,
    executor: Executor,
    state: Mutex<ProcState>,
}

impl Process {
    /// Create a new process in the `Ready` state.
    pub(crate) fn new(executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            id: ProcessId::new(),
            executor,
            state: Mutex::new(ProcState {
                status: Status::Ready,
                context: None,
                result: None,
                awaiters: Vec::new(),
                next: None,
                parent: None,
                children: Vec::new(),
                pending_args: None,
                wake_time: None,
                queued: false,
                group: None,
            }),
        })
    }

    /// Get the process's unique ID.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Get the current status.
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// Get the captured result sequence, if the process is `Done`.
    pub fn result(&self) -> Option<Values> {
        self.state.lock().result.clone()
    }

    /// Absolute wake time of a delayed process; cleared on promotion.
    pub fn wake_time(&self) -> Option<Instant> {
        self.state.lock().wake_time
    }

    /// Get the user payload attached at group creation, for parents.
    pub fn group_fields(&self) -> Option<Values> {
        self.state.lock().group.as_ref().map(|g| g.fields.clone())
    }

    /// Get the ordered child processes, for group parents.
    pub fn children(&self) -> Vec<Arc<Process>> {
        self.state.lock().children.clone()
    }

    /// Get the executor this process runs.
    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Lock and access the mutable state.
    pub(crate) fn state(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// An unmanaged, fire-and-forget unit of scheduled work.
///
/// Carries only the executor and its argument sequence; there is no status,
/// no result capture, no awaiters and no cancellation support.
pub struct FastProcess {
    pub(crate) executor: Executor,
    pub(crate) args: Values,
}

impl FastProcess {
    /// Bundle an executor with its arguments.
    pub(crate) fn new(executor: Executor, args: Values) -> Self {
        Self { executor, args }
    }
}

/// What a scheduling operation accepts: a fresh executor or an existing
/// process. Dispatched once at the API boundary.
pub enum Target {
    /// Wrap the executor in a new process.
    Exec(Executor),
    /// Schedule an existing `Ready` process.
    Proc(Arc<Process>),
}

impl From<Executor> for Target {
    fn from(e: Executor) -> Self {
        Target::Exec(e)
    }
}

impl From<Arc<Process>> for Target {
    fn from(p: Arc<Process>) -> Self {
        Target::Proc(p)
    }
}

impl From<&Arc<Process>> for Target {
    fn from(p: &Arc<Process>) -> Self {
        Target::Proc(p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn noop() -> Executor {
        Executor::new(|_scope, _args| Vec::new())
    }

    #[test]
    fn test_process_id_uniqueness() {
        let id1 = ProcessId::new();
        let id2 = ProcessId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_process_creation() {
        let proc = Process::new(noop());

        assert_eq!(proc.status(), Status::Ready);
        assert!(proc.result().is_none());
        assert!(proc.children().is_empty());
        assert!(proc.group_fields().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let proc = Process::new(noop());

        proc.state().status = Status::Active;
        assert_eq!(proc.status(), Status::Active);

        {
            let mut st = proc.state();
            st.status = Status::Done;
            st.result = Some(vec![Value::int(7)]);
        }
        assert_eq!(proc.status(), Status::Done);
        assert_eq!(proc.result(), Some(vec![Value::int(7)]));
    }

    #[test]
    fn test_pending_args_absence_is_distinct_from_empty() {
        let proc = Process::new(noop());

        assert!(proc.state().pending_args.is_none());

        proc.state().pending_args = Some(Vec::new());
        assert_eq!(proc.state().pending_args.as_deref(), Some(&[] as &[Value]));
    }

    #[test]
    fn test_target_dispatch() {
        let proc = Process::new(noop());

        assert!(matches!(Target::from(noop()), Target::Exec(_)));
        assert!(matches!(Target::from(&proc), Target::Proc(_)));
    }
}
