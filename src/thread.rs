//! Kernel threads
//!
//! A thread is the unit of execution and scheduling identity. Its control
//! block carries the saved execution context - here a parked future, plus
//! the entry-point factory needed to build a fresh one for `clone` - the
//! return-value and errno slots, the owning process, the cancellation flag,
//! and the single `wchan` back-reference to whatever wait queue the thread
//! is currently blocked on.
//!
//! A live thread is always exactly one of: running, linked on some queue,
//! or exited awaiting reclamation. A thread in none of those places is lost
//! forever; the scheduler's run loop asserts this after every poll.

use crate::process::Pid;
use crate::queue::QueueId;
use crate::sched::Ctx;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// Index of a thread in the scheduler's thread arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Illegal state - never observable on a live thread
    NoState,
    /// Currently running, or on the run queue
    Run,
    /// Blocked for an indefinite amount of time
    Sleep,
    /// Blocked, but this sleep can be cancelled
    SleepCancellable,
    /// Has exited, waiting to be reclaimed
    Exited,
}

impl ThreadState {
    /// Check if the thread is blocked on a wait queue
    pub const fn is_sleeping(self) -> bool {
        matches!(self, Self::Sleep | Self::SleepCancellable)
    }

    /// Check if the thread has not yet exited
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Run | Self::Sleep | Self::SleepCancellable)
    }
}

impl std::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadState::NoState => write!(f, "NO_STATE"),
            ThreadState::Run => write!(f, "RUN"),
            ThreadState::Sleep => write!(f, "SLEEP"),
            ThreadState::SleepCancellable => write!(f, "SLEEP_CANCELLABLE"),
            ThreadState::Exited => write!(f, "EXITED"),
        }
    }
}

/// A parked thread body
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Entry-point factory: builds a thread body from the execution context and
/// the two creation arguments. Kept in the control block so `clone` can
/// allocate a fresh context for the same entry.
pub type ThreadFn = Rc<dyn Fn(Ctx, i64, i64) -> BoxFuture>;

/// Thread control block
pub(crate) struct Thread {
    pub(crate) state: ThreadState,
    /// Set by an external cancel request; consulted at cancellable
    /// suspension points
    pub(crate) cancelled: bool,
    /// The queue this thread is blocked on, or None when running
    pub(crate) wchan: Option<QueueId>,
    /// Return value slot; `cancel` and `exit` both store here
    pub(crate) retval: i64,
    /// Error number of the most recent failed operation
    pub(crate) errno: i32,
    /// The owning process
    pub(crate) proc: Pid,
    pub(crate) name: String,
    /// Entry-point factory and its arguments, retained for `clone`
    pub(crate) entry: ThreadFn,
    pub(crate) arg1: i64,
    pub(crate) arg2: i64,
    /// The saved execution context; None exactly while being polled
    pub(crate) continuation: Option<BoxFuture>,
}

impl Thread {
    pub(crate) fn new(proc: Pid, name: &str, entry: ThreadFn, arg1: i64, arg2: i64) -> Self {
        Self {
            state: ThreadState::Run,
            cancelled: false,
            wchan: None,
            retval: 0,
            errno: 0,
            proc,
            name: name.to_string(),
            entry,
            arg1,
            arg2,
            continuation: None,
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("cancelled", &self.cancelled)
            .field("wchan", &self.wchan)
            .field("retval", &self.retval)
            .field("proc", &self.proc)
            .finish_non_exhaustive()
    }
}

/// Thread creation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// The scheduler's thread capacity is exhausted
    LimitReached,
    /// The owning process does not exist or was torn down
    NoSuchProcess,
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadError::LimitReached => write!(f, "thread limit reached"),
            ThreadError::NoSuchProcess => write!(f, "no such process"),
        }
    }
}

impl std::error::Error for ThreadError {}
