//! Thread join/detach extension
//!
//! The optional reclamation handshake: `join` blocks until a target thread
//! exits and collects its return value exactly once; `detach` renounces the
//! handshake so the run loop reaps the thread the moment it exits. A thread
//! cannot be both detached and joined.
//!
//! All extension state lives in a side table keyed by thread id - the core
//! control block and state machine are identical with this module compiled
//! out. Join queues are allocated lazily, when the first joiner parks.

use crate::mutex::Interrupted;
use crate::queue::{QueueId, WaitQueue};
use crate::sched::{Ctx, Sched, SchedInner};
use crate::thread::{ThreadId, ThreadState};
use crate::trace::TraceCategory;
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Join/detach bookkeeping, outside the thread control block
pub(crate) struct JoinTable {
    /// Per-thread join queues, present once a joiner has parked
    joinq: HashMap<ThreadId, QueueId>,
    /// Threads that have been detached
    detached: HashSet<ThreadId>,
    /// Threads whose join is claimed by some waiter
    claimed: HashSet<ThreadId>,
}

impl JoinTable {
    pub(crate) fn new() -> Self {
        Self {
            joinq: HashMap::new(),
            detached: HashSet::new(),
            claimed: HashSet::new(),
        }
    }

    pub(crate) fn is_detached(&self, tid: ThreadId) -> bool {
        self.detached.contains(&tid)
    }

    /// Drop all extension state for a reclaimed thread
    pub(crate) fn forget(&mut self, tid: ThreadId, queues: &mut Slab<WaitQueue>) {
        if let Some(q) = self.joinq.remove(&tid) {
            let wq = queues.remove(q.0);
            debug_assert!(wq.is_empty(), "reaped {} with parked joiners", tid);
        }
        self.detached.remove(&tid);
        self.claimed.remove(&tid);
    }
}

/// Join/detach errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The target has been detached
    Detached,
    /// Another thread already claimed the join
    AlreadyJoined,
    /// A thread cannot join itself
    SelfJoin,
    /// The joiner was cancelled while waiting
    Interrupted,
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Detached => write!(f, "thread is detached"),
            JoinError::AlreadyJoined => write!(f, "thread is already being joined"),
            JoinError::SelfJoin => write!(f, "thread cannot join itself"),
            JoinError::Interrupted => write!(f, "interrupted while waiting"),
        }
    }
}

impl std::error::Error for JoinError {}

impl From<Interrupted> for JoinError {
    fn from(_: Interrupted) -> Self {
        JoinError::Interrupted
    }
}

impl SchedInner {
    /// Exit hook: move every parked joiner back to the run queue
    pub(crate) fn wake_joiners(&mut self, tid: ThreadId) {
        let Some(&q) = self.join.joinq.get(&tid) else {
            return;
        };
        while let Some(waiter) = self.queues[q.0].head() {
            self.wake(waiter);
        }
    }
}

impl Sched {
    /// Put a thread in the detached state: nobody may join it, and the
    /// run loop reaps it as soon as it has exited.
    pub fn detach(&self, tid: ThreadId) -> Result<(), JoinError> {
        let mut inner = self.inner().borrow_mut();
        let state = inner.thread(tid).state;
        if inner.join.claimed.contains(&tid) {
            return Err(JoinError::AlreadyJoined);
        }
        if !inner.join.detached.insert(tid) {
            return Err(JoinError::Detached);
        }
        inner.record(TraceCategory::Thread, "detach", None, Some(tid));
        if state == ThreadState::Exited {
            inner.reap(tid);
        }
        Ok(())
    }
}

impl Ctx {
    /// Wait for another thread to exit and collect its return value.
    ///
    /// The wait is cancellable. On success the target is reclaimed, so its
    /// return value is delivered exactly once; a second thread trying to
    /// join the same live target gets `AlreadyJoined`.
    pub fn join(&self, target: ThreadId) -> Join {
        Join {
            ctx: self.clone(),
            target,
            state: JoinState::Init,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Init,
    Parked,
    Done,
}

/// Future returned by [`Ctx::join`]
pub struct Join {
    ctx: Ctx,
    target: ThreadId,
    state: JoinState,
}

impl Future for Join {
    type Output = Result<i64, JoinError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<i64, JoinError>> {
        let this = self.get_mut();
        let tid = this.ctx.tid();
        let rc = this.ctx.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(tid, "join");
        match this.state {
            JoinState::Init => {
                this.state = JoinState::Done;
                if this.target == tid {
                    return Poll::Ready(Err(JoinError::SelfJoin));
                }
                let state = inner.thread(this.target).state;
                if inner.join.is_detached(this.target) {
                    return Poll::Ready(Err(JoinError::Detached));
                }
                if !inner.join.claimed.insert(this.target) {
                    return Poll::Ready(Err(JoinError::AlreadyJoined));
                }
                if state == ThreadState::Exited {
                    let retval = inner.thread(this.target).retval;
                    inner.reap(this.target);
                    return Poll::Ready(Ok(retval));
                }
                // Target still alive: park on its join queue until exit
                let q = match inner.join.joinq.get(&this.target) {
                    Some(&q) => q,
                    None => {
                        let q = QueueId(inner.queues.insert(WaitQueue::new()));
                        inner.join.joinq.insert(this.target, q);
                        q
                    }
                };
                inner.record(
                    TraceCategory::Thread,
                    "join-wait",
                    Some(format!("{}", this.target)),
                    Some(tid),
                );
                inner.sleep_current(tid, q, true);
                this.state = JoinState::Parked;
                Poll::Pending
            }
            JoinState::Parked => {
                this.state = JoinState::Done;
                if inner.thread(tid).cancelled {
                    // Give the claim back; the target stays joinable
                    inner.join.claimed.remove(&this.target);
                    return Poll::Ready(Err(JoinError::Interrupted));
                }
                // Woken by the target's exit
                let th = inner.thread(this.target);
                debug_assert_eq!(th.state, ThreadState::Exited);
                let retval = th.retval;
                inner.reap(this.target);
                Poll::Ready(Ok(retval))
            }
            JoinState::Done => panic!("join: future polled after completion"),
        }
    }
}
