//! Mutexes
//!
//! Binary mutual exclusion with FIFO fairness and an explicit cancellable
//! variant. A mutex is a holder reference plus one wait queue.
//!
//! Locking a free mutex claims it synchronously - no suspension, no
//! scheduler involvement. Locking a held mutex parks the caller on the
//! wait queue; it resumes only when `unlock` hands it ownership directly.
//! There is never an intervening free state during hand-off, so no third
//! thread can cut the line: acquisition order is exactly arrival order.
//!
//! Mutexes are only locked and unlocked from thread context, never from
//! the outside. Locking a mutex you already hold, or unlocking one you
//! don't, is a kernel bug and panics.

use crate::queue::{QueueId, WaitQueue};
use crate::sched::{Ctx, Sched, SchedInner};
use crate::thread::{ThreadId, ThreadState};
use crate::trace::TraceCategory;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Index of a mutex in the scheduler's mutex arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub usize);

impl std::fmt::Display for MutexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mutex({})", self.0)
    }
}

/// A mutex: current owner plus the queue of threads waiting for it.
///
/// `holder == None` iff the mutex is free. The holder is never also on
/// the wait queue.
pub(crate) struct Mutex {
    pub(crate) holder: Option<ThreadId>,
    pub(crate) waitq: QueueId,
}

/// A cancellable blocking operation was interrupted.
///
/// Reported by `mutex_lock_cancellable` (and `join`) when the caller was
/// cancelled while blocked. The mutex is guaranteed released before this
/// is reported; callers never hold the lock on the error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted while blocked")
    }
}

impl std::error::Error for Interrupted {}

impl Sched {
    /// Create a mutex: empty wait queue, no holder
    pub fn mutex_create(&self) -> MutexId {
        let mut inner = self.inner().borrow_mut();
        let waitq = QueueId(inner.queues.insert(WaitQueue::new()));
        let mid = MutexId(inner.mutexes.insert(Mutex {
            holder: None,
            waitq,
        }));
        inner.record(TraceCategory::Mutex, "create", Some(format!("{}", mid)), None);
        mid
    }

    /// Release a mutex's slots. The mutex must be free with no waiters.
    pub fn mutex_destroy(&self, m: MutexId) {
        let mut inner = self.inner().borrow_mut();
        let mx = inner.mutex(m);
        assert!(
            mx.holder.is_none(),
            "mutex_destroy: {} is held by {:?}",
            m,
            mx.holder
        );
        let waitq = mx.waitq;
        assert!(
            inner.queues[waitq.0].is_empty(),
            "mutex_destroy: {} still has waiters",
            m
        );
        inner.queues.remove(waitq.0);
        inner.mutexes.remove(m.0);
    }

    /// The thread currently holding the mutex, or None if free
    pub fn mutex_holder(&self, m: MutexId) -> Option<ThreadId> {
        self.inner().borrow().mutex(m).holder
    }

    /// Threads blocked on the mutex, longest-waiting first
    pub fn mutex_waiters(&self, m: MutexId) -> Vec<ThreadId> {
        let inner = self.inner().borrow();
        let waitq = inner.mutex(m).waitq;
        inner.queues[waitq.0].waiters()
    }
}

impl SchedInner {
    pub(crate) fn mutex(&self, m: MutexId) -> &Mutex {
        self.mutexes
            .get(m.0)
            .unwrap_or_else(|| panic!("no such mutex: {}", m))
    }

    pub(crate) fn mutex_mut(&mut self, m: MutexId) -> &mut Mutex {
        self.mutexes
            .get_mut(m.0)
            .unwrap_or_else(|| panic!("no such mutex: {}", m))
    }

    /// Claim the mutex if it is free. Self-lock is a kernel bug.
    fn try_claim(&mut self, m: MutexId, tid: ThreadId) -> bool {
        let mx = self.mutex_mut(m);
        assert!(
            mx.holder != Some(tid),
            "mutex_lock: {} already holds {}",
            tid,
            m
        );
        if mx.holder.is_none() {
            mx.holder = Some(tid);
            self.record(TraceCategory::Mutex, "claim", Some(format!("{}", m)), Some(tid));
            true
        } else {
            false
        }
    }

    /// Release the mutex held by `tid`, handing ownership to the head
    /// waiter if there is one. Never blocks.
    pub(crate) fn unlock_mutex(&mut self, m: MutexId, tid: ThreadId) {
        let waitq = {
            let mx = self.mutex_mut(m);
            assert!(
                mx.holder == Some(tid),
                "mutex_unlock: {} does not hold {}",
                tid,
                m
            );
            mx.waitq
        };
        match self.queues[waitq.0].pop() {
            None => {
                self.mutex_mut(m).holder = None;
                self.record(TraceCategory::Mutex, "release", Some(format!("{}", m)), Some(tid));
            }
            Some(next) => {
                // Ownership transfers directly; the mutex is never
                // observably free in between.
                self.mutex_mut(m).holder = Some(next);
                {
                    let th = self.thread_mut(next);
                    debug_assert!(th.state.is_sleeping());
                    debug_assert_eq!(th.wchan, Some(waitq));
                    th.wchan = None;
                    th.state = ThreadState::Run;
                }
                self.stats.handoffs += 1;
                self.stats.wakeups += 1;
                self.record(
                    TraceCategory::Mutex,
                    "handoff",
                    Some(format!("{} -> {}", m, next)),
                    Some(tid),
                );
                self.enqueue_runnable(next);
            }
        }
        debug_assert!(self.mutex(m).holder != Some(tid));
    }
}

impl Ctx {
    /// Acquire the mutex, blocking until it is granted.
    ///
    /// Returns a future that is ready on first poll when the mutex is
    /// free; otherwise the caller sleeps on the wait queue until `unlock`
    /// hands it ownership. On return the caller is always the holder.
    pub fn mutex_lock(&self, m: MutexId) -> Lock {
        Lock {
            ctx: self.clone(),
            mutex: m,
            state: LockState::Init,
        }
    }

    /// Acquire the mutex with a cancellable sleep.
    ///
    /// Identical to `mutex_lock` except that a cancelled caller reports
    /// `Interrupted` instead of holding the lock: if ownership was already
    /// handed over it is released first (grant-then-release), and if the
    /// cancellation pulled the caller off the wait queue before hand-off
    /// it never owns the mutex at all. Check the result before assuming
    /// the lock is held.
    pub fn mutex_lock_cancellable(&self, m: MutexId) -> LockCancellable {
        LockCancellable {
            ctx: self.clone(),
            mutex: m,
            state: LockState::Init,
        }
    }

    /// Release the mutex, waking the longest-waiting thread into
    /// ownership if any. Never blocks. On return the caller no longer
    /// holds the mutex.
    pub fn mutex_unlock(&self, m: MutexId) {
        let rc = self.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(self.tid, "mutex_unlock");
        inner.unlock_mutex(m, self.tid);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Init,
    Parked,
    Done,
}

/// Future returned by [`Ctx::mutex_lock`]
pub struct Lock {
    ctx: Ctx,
    mutex: MutexId,
    state: LockState,
}

impl Future for Lock {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let tid = this.ctx.tid();
        let rc = this.ctx.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(tid, "mutex_lock");
        match this.state {
            LockState::Init => {
                if inner.try_claim(this.mutex, tid) {
                    this.state = LockState::Done;
                    return Poll::Ready(());
                }
                let waitq = inner.mutex(this.mutex).waitq;
                inner.record(
                    TraceCategory::Mutex,
                    "block",
                    Some(format!("{}", this.mutex)),
                    Some(tid),
                );
                inner.sleep_current(tid, waitq, false);
                this.state = LockState::Parked;
                Poll::Pending
            }
            LockState::Parked => {
                // Only a hand-off wakes an uninterruptible waiter, so
                // ownership must already be ours.
                assert!(
                    inner.mutex(this.mutex).holder == Some(tid),
                    "mutex_lock: {} resumed without ownership of {}",
                    tid,
                    this.mutex
                );
                this.state = LockState::Done;
                Poll::Ready(())
            }
            LockState::Done => panic!("mutex_lock: future polled after completion"),
        }
    }
}

/// Future returned by [`Ctx::mutex_lock_cancellable`]
pub struct LockCancellable {
    ctx: Ctx,
    mutex: MutexId,
    state: LockState,
}

impl Future for LockCancellable {
    type Output = Result<(), Interrupted>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Interrupted>> {
        let this = self.get_mut();
        let tid = this.ctx.tid();
        let rc = this.ctx.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(tid, "mutex_lock_cancellable");
        match this.state {
            LockState::Init => {
                if inner.try_claim(this.mutex, tid) {
                    this.state = LockState::Done;
                    // Cancelled before ever sleeping: give the lock
                    // straight back and report the interruption.
                    if inner.thread(tid).cancelled {
                        inner.unlock_mutex(this.mutex, tid);
                        return Poll::Ready(Err(Interrupted));
                    }
                    return Poll::Ready(Ok(()));
                }
                let waitq = inner.mutex(this.mutex).waitq;
                inner.record(
                    TraceCategory::Mutex,
                    "block",
                    Some(format!("{}", this.mutex)),
                    Some(tid),
                );
                inner.sleep_current(tid, waitq, true);
                this.state = LockState::Parked;
                Poll::Pending
            }
            LockState::Parked => {
                this.state = LockState::Done;
                if inner.thread(tid).cancelled {
                    // Cancelled while blocked. If the hand-off won the
                    // race we own the mutex and must release it; if
                    // cancellation pulled us off the queue first we never
                    // owned it.
                    if inner.mutex(this.mutex).holder == Some(tid) {
                        inner.unlock_mutex(this.mutex, tid);
                    }
                    inner.record(
                        TraceCategory::Mutex,
                        "interrupted",
                        Some(format!("{}", this.mutex)),
                        Some(tid),
                    );
                    return Poll::Ready(Err(Interrupted));
                }
                assert!(
                    inner.mutex(this.mutex).holder == Some(tid),
                    "mutex_lock_cancellable: {} resumed without ownership of {}",
                    tid,
                    this.mutex
                );
                Poll::Ready(Ok(()))
            }
            LockState::Done => {
                panic!("mutex_lock_cancellable: future polled after completion")
            }
        }
    }
}
