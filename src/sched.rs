//! Cooperative scheduler and execution context
//!
//! One logical CPU, tick-based execution: each tick polls every thread that
//! was runnable when the tick started, once, in run-queue (FIFO) order. A
//! thread body is a future; blocking means the body parked itself on a wait
//! queue and returned `Pending`, and it is polled again only after something
//! explicitly makes it runnable - a mutex hand-off, a cancellation, an
//! external wakeup. There is no waker plumbing: the run queue *is* the
//! ready set.
//!
//! Every operation takes the scheduler's single `RefCell` borrow once,
//! mutates, and releases before any thread code runs again. That borrow
//! scope is this design's stand-in for the interrupts-disabled critical
//! section of a real kernel: a state check and the enqueue it guards can
//! never be separated by a suspension, so wakeups cannot be missed.
//!
//! The liveness rule - every thread is running, on some queue, or exited -
//! is checked after every poll, and a violation panics with the offender.

use crate::mutex::Mutex;
use crate::process::{Pid, Process, ProcessError};
use crate::queue::{QueueId, WaitQueue};
use crate::thread::{BoxFuture, Thread, ThreadError, ThreadFn, ThreadId, ThreadState};
use crate::trace::{TraceBuffer, TraceCategory, TraceEvent};
use futures::task::noop_waker;
use slab::Slab;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

#[cfg(feature = "join")]
use crate::join::JoinTable;

/// Default thread capacity
pub const DEFAULT_MAX_THREADS: usize = 1024;

/// Scheduler counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    /// Completed calls to `tick`
    pub ticks: u64,
    /// Thread polls performed
    pub polls: u64,
    /// Threads created (spawn and clone)
    pub spawns: u64,
    /// Threads that reached EXITED
    pub exits: u64,
    /// Voluntary suspensions (a thread parked itself)
    pub parks: u64,
    /// Voluntary reschedules
    pub yields: u64,
    /// Blocked threads moved back to the run queue
    pub wakeups: u64,
    /// Mutex ownership transfers to a waiter
    pub handoffs: u64,
    /// Cancel requests delivered
    pub cancellations: u64,
}

pub(crate) struct SchedInner {
    pub(crate) threads: Slab<Thread>,
    pub(crate) queues: Slab<WaitQueue>,
    pub(crate) mutexes: Slab<Mutex>,
    pub(crate) procs: HashMap<Pid, Process>,
    next_pid: u32,
    pub(crate) run_queue: VecDeque<ThreadId>,
    /// The thread being polled right now, if any
    pub(crate) current: Option<ThreadId>,
    max_threads: usize,
    /// Tick counter, used as the trace timestamp
    pub(crate) ticks: u64,
    pub(crate) trace: TraceBuffer,
    pub(crate) stats: SchedStats,
    #[cfg(feature = "join")]
    pub(crate) join: JoinTable,
}

impl SchedInner {
    fn new(max_threads: usize) -> Self {
        Self {
            threads: Slab::new(),
            queues: Slab::new(),
            mutexes: Slab::new(),
            procs: HashMap::new(),
            next_pid: 1,
            run_queue: VecDeque::new(),
            current: None,
            max_threads,
            ticks: 0,
            trace: TraceBuffer::new(),
            stats: SchedStats::default(),
            #[cfg(feature = "join")]
            join: JoinTable::new(),
        }
    }

    pub(crate) fn thread(&self, tid: ThreadId) -> &Thread {
        self.threads
            .get(tid.0)
            .unwrap_or_else(|| panic!("no such thread: {}", tid))
    }

    pub(crate) fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
        self.threads
            .get_mut(tid.0)
            .unwrap_or_else(|| panic!("no such thread: {}", tid))
    }

    /// Assert that `tid` is the thread the scheduler is polling right now.
    /// Thread-context operations are only legal from the running thread.
    pub(crate) fn assert_current(&self, tid: ThreadId, what: &str) {
        assert!(
            self.current == Some(tid),
            "{}: {} is not the running thread",
            what,
            tid
        );
    }

    pub(crate) fn record(
        &mut self,
        category: TraceCategory,
        name: &str,
        detail: Option<String>,
        tid: Option<ThreadId>,
    ) {
        if !self.trace.is_enabled() {
            return;
        }
        let mut event = match detail {
            Some(d) => TraceEvent::with_detail(self.ticks, category, name, d),
            None => TraceEvent::instant(self.ticks, category, name),
        };
        event.tid = tid;
        self.trace.record(event);
    }

    /// Push an unlinked RUN thread onto the run queue
    pub(crate) fn enqueue_runnable(&mut self, tid: ThreadId) {
        let th = self.thread(tid);
        assert!(
            th.state == ThreadState::Run,
            "make_runnable: {} is {}",
            tid,
            th.state
        );
        assert!(th.wchan.is_none(), "make_runnable: {} still linked", tid);
        debug_assert!(!self.run_queue.contains(&tid));
        self.run_queue.push_back(tid);
    }

    /// Park the running thread on a wait queue.
    ///
    /// State change and enqueue happen under the same borrow as whatever
    /// check led here; returning `Pending` afterwards is the switch.
    pub(crate) fn sleep_current(&mut self, tid: ThreadId, q: QueueId, cancellable: bool) {
        debug_assert_eq!(self.current, Some(tid));
        {
            let th = self.thread_mut(tid);
            assert!(th.wchan.is_none(), "sleep: {} already linked", tid);
            th.state = if cancellable {
                ThreadState::SleepCancellable
            } else {
                ThreadState::Sleep
            };
            th.wchan = Some(q);
        }
        self.queues[q.0].push(tid);
        self.stats.parks += 1;
        self.record(TraceCategory::Sched, "park", Some(format!("{}", q)), Some(tid));
    }

    /// Move a sleeping thread off its wait queue and back to the run queue
    pub(crate) fn wake(&mut self, tid: ThreadId) {
        let q = {
            let th = self.thread_mut(tid);
            assert!(th.state.is_sleeping(), "wake: {} is {}", tid, th.state);
            let q = th
                .wchan
                .take()
                .unwrap_or_else(|| panic!("wake: {} sleeping with no wait channel", tid));
            th.state = ThreadState::Run;
            q
        };
        let removed = self.queues[q.0].remove(tid);
        assert!(removed, "wake: {} not linked on {}", tid, q);
        self.stats.wakeups += 1;
        self.record(TraceCategory::Sched, "wake", Some(format!("{}", q)), Some(tid));
        self.enqueue_runnable(tid);
    }

    /// Transition a running thread to EXITED and signal join-waiters
    pub(crate) fn finish_thread(&mut self, tid: ThreadId) {
        {
            let th = self.thread_mut(tid);
            assert!(
                th.state == ThreadState::Run,
                "exit: {} is {}",
                tid,
                th.state
            );
            debug_assert!(th.wchan.is_none());
            th.state = ThreadState::Exited;
        }
        self.stats.exits += 1;
        let retval = self.thread(tid).retval;
        self.record(
            TraceCategory::Thread,
            "exit",
            Some(format!("retval={}", retval)),
            Some(tid),
        );
        #[cfg(feature = "join")]
        self.wake_joiners(tid);
    }

    /// Free an exited thread's slot and drop it from its process
    pub(crate) fn reap(&mut self, tid: ThreadId) {
        let pid = {
            let th = self.thread(tid);
            assert!(
                th.state == ThreadState::Exited,
                "destroy: {} is {}, not EXITED",
                tid,
                th.state
            );
            debug_assert!(th.wchan.is_none());
            th.proc
        };
        debug_assert!(!self.run_queue.contains(&tid));
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.threads.retain(|&t| t != tid);
        }
        #[cfg(feature = "join")]
        self.join.forget(tid, &mut self.queues);
        self.threads.remove(tid.0);
        self.record(TraceCategory::Thread, "reap", None, Some(tid));
    }

    fn spawn_thread(
        &mut self,
        sched: &Weak<RefCell<SchedInner>>,
        pid: Pid,
        name: &str,
        entry: ThreadFn,
        arg1: i64,
        arg2: i64,
    ) -> Result<ThreadId, ThreadError> {
        if !self.procs.contains_key(&pid) {
            return Err(ThreadError::NoSuchProcess);
        }
        if self.threads.len() >= self.max_threads {
            return Err(ThreadError::LimitReached);
        }
        let tid = ThreadId(self.threads.vacant_key());
        let ctx = Ctx {
            tid,
            sched: sched.clone(),
        };
        // Building the future does not run any of the body; async blocks
        // are inert until first polled by the run loop.
        let body = (entry)(ctx, arg1, arg2);
        let mut th = Thread::new(pid, name, entry, arg1, arg2);
        th.continuation = Some(body);
        let key = self.threads.insert(th);
        debug_assert_eq!(key, tid.0);
        let proc = self.procs.get_mut(&pid).expect("owner checked above");
        proc.threads.push(tid);
        self.stats.spawns += 1;
        self.record(
            TraceCategory::Thread,
            "spawn",
            Some(format!("{} {}", pid, name)),
            Some(tid),
        );
        self.enqueue_runnable(tid);
        Ok(tid)
    }
}

/// The scheduler: owns the thread, wait-queue, and mutex arenas, the
/// process table, and the FIFO run queue. Cheap to clone; clones share
/// the same state.
#[derive(Clone)]
pub struct Sched {
    inner: Rc<RefCell<SchedInner>>,
}

impl Sched {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_THREADS)
    }

    /// Create a scheduler with a custom thread capacity
    pub fn with_capacity(max_threads: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedInner::new(max_threads))),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<SchedInner>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<SchedInner>> {
        &self.inner
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Create a process to own threads
    pub fn spawn_process(&self, name: &str) -> Pid {
        let mut inner = self.inner.borrow_mut();
        let pid = Pid(inner.next_pid);
        inner.next_pid += 1;
        inner.procs.insert(pid, Process::new(pid, name));
        inner.record(TraceCategory::Process, "spawn", Some(name.to_string()), None);
        pid
    }

    /// Tear a process down. Refuses while any of its threads still
    /// occupies a slot - destroying a thread out from under a queue is
    /// exactly the lost-thread defect this core exists to prevent.
    pub fn teardown_process(&self, pid: Pid) -> Result<(), ProcessError> {
        let mut inner = self.inner.borrow_mut();
        let proc = inner.procs.get(&pid).ok_or(ProcessError::NotFound)?;
        if !proc.threads.is_empty() {
            return Err(ProcessError::HasLiveThreads);
        }
        let detail = format!("{} {}", proc.pid, proc.name);
        inner.procs.remove(&pid);
        inner.record(TraceCategory::Process, "teardown", Some(detail), None);
        Ok(())
    }

    /// Threads currently owned by a process
    pub fn process_threads(&self, pid: Pid) -> Vec<ThreadId> {
        let inner = self.inner.borrow();
        inner
            .procs
            .get(&pid)
            .map(|p| p.threads.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Thread lifecycle
    // ========================================================================

    /// Create a thread running `f(ctx, arg1, arg2)` inside process `pid`.
    ///
    /// The new thread starts in RUN on the run queue. Fails if the process
    /// is unknown or the thread capacity is exhausted; on failure no
    /// partial thread is left behind.
    pub fn spawn<F, Fut>(
        &self,
        pid: Pid,
        name: &str,
        f: F,
        arg1: i64,
        arg2: i64,
    ) -> Result<ThreadId, ThreadError>
    where
        F: Fn(Ctx, i64, i64) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let entry: ThreadFn =
            Rc::new(move |ctx, a1, a2| -> BoxFuture { Box::pin(f(ctx, a1, a2)) });
        self.spawn_entry(pid, name, entry, arg1, arg2)
    }

    /// `spawn` for an already-boxed entry factory
    pub fn spawn_entry(
        &self,
        pid: Pid,
        name: &str,
        entry: ThreadFn,
        arg1: i64,
        arg2: i64,
    ) -> Result<ThreadId, ThreadError> {
        let weak = Rc::downgrade(&self.inner);
        let mut inner = self.inner.borrow_mut();
        inner.spawn_thread(&weak, pid, name, entry, arg1, arg2)
    }

    /// Create an independent copy of a thread: same entry point and
    /// arguments, a freshly built continuation, retval/errno slots copied.
    /// The clone starts in RUN, unlinked, with cancellation cleared.
    pub fn clone_thread(&self, tid: ThreadId, pid: Pid) -> Result<ThreadId, ThreadError> {
        let weak = Rc::downgrade(&self.inner);
        let mut inner = self.inner.borrow_mut();
        let (entry, arg1, arg2, name, retval, errno) = {
            let th = inner.thread(tid);
            (
                th.entry.clone(),
                th.arg1,
                th.arg2,
                th.name.clone(),
                th.retval,
                th.errno,
            )
        };
        let new = inner.spawn_thread(&weak, pid, &name, entry, arg1, arg2)?;
        let th = inner.thread_mut(new);
        th.retval = retval;
        th.errno = errno;
        Ok(new)
    }

    /// Request cancellation of a thread and set its eventual return value.
    ///
    /// A cancellable sleeper is pulled off its wait queue and made runnable
    /// so it can observe the flag and unwind; an uninterruptible sleeper
    /// keeps sleeping and sees the flag at its next cancellable suspension
    /// point; a running thread just gets the flag set. Cancelling an
    /// already-exited thread does nothing.
    pub fn cancel(&self, tid: ThreadId, retval: i64) {
        let mut inner = self.inner.borrow_mut();
        let state = {
            let th = inner.thread_mut(tid);
            if th.state == ThreadState::Exited {
                return;
            }
            assert!(
                th.state != ThreadState::NoState,
                "cancel: {} has no state",
                tid
            );
            th.cancelled = true;
            th.retval = retval;
            th.state
        };
        inner.stats.cancellations += 1;
        inner.record(
            TraceCategory::Thread,
            "cancel",
            Some(format!("retval={}", retval)),
            Some(tid),
        );
        if state == ThreadState::SleepCancellable {
            inner.wake(tid);
        }
    }

    /// Free an exited thread's resources.
    ///
    /// An exited thread keeps its slot (and its readable retval) until it
    /// is destroyed here, joined, or - for detached threads - reaped by
    /// the run loop.
    pub fn destroy(&self, tid: ThreadId) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.current != Some(tid),
            "destroy: {} is executing",
            tid
        );
        inner.reap(tid);
    }

    /// Move a blocked thread into the runnable set.
    ///
    /// This is the external wakeup entry point; mutex hand-off and
    /// cancellation use the same path internally. Waking a thread that is
    /// not asleep is a contract violation.
    pub fn make_runnable(&self, tid: ThreadId) {
        let mut inner = self.inner.borrow_mut();
        inner.wake(tid);
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Run one tick: poll every thread that was runnable when the tick
    /// started, once, in FIFO order. Returns the number of polls.
    ///
    /// Threads made runnable during the tick (hand-offs, wakeups, spawns)
    /// run on the next tick.
    pub fn tick(&self) -> usize {
        let batch = {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.current.is_none(),
                "sched: tick re-entered from thread context"
            );
            inner.ticks += 1;
            inner.stats.ticks += 1;
            inner.run_queue.len()
        };

        let mut polled = 0;
        for _ in 0..batch {
            let (tid, mut body) = {
                let mut inner = self.inner.borrow_mut();
                let Some(tid) = inner.run_queue.pop_front() else {
                    break;
                };
                let th = inner.thread_mut(tid);
                debug_assert_eq!(th.state, ThreadState::Run);
                debug_assert!(th.wchan.is_none());
                let body = th
                    .continuation
                    .take()
                    .unwrap_or_else(|| panic!("sched: {} runnable without a continuation", tid));
                inner.current = Some(tid);
                (tid, body)
            };

            // The borrow is released here: the body is free to take it.
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            let result = body.as_mut().poll(&mut cx);

            let mut inner = self.inner.borrow_mut();
            inner.current = None;
            inner.stats.polls += 1;
            match result {
                Poll::Pending => {
                    {
                        let th = inner.thread_mut(tid);
                        assert!(
                            th.state != ThreadState::Exited,
                            "exit: {} suspended after exiting",
                            tid
                        );
                        th.continuation = Some(body);
                    }
                    let linked = inner.thread(tid).wchan.is_some();
                    let queued = inner.run_queue.contains(&tid);
                    assert!(
                        linked || queued,
                        "lost thread: {} is neither running, queued, nor exited",
                        tid
                    );
                }
                Poll::Ready(()) => {
                    if inner.thread(tid).state != ThreadState::Exited {
                        // Body returned without calling exit; the retval
                        // slot keeps whatever it holds.
                        inner.finish_thread(tid);
                    }
                    // An exited thread stays around until destroyed or
                    // joined; only detached threads are reaped here.
                    #[cfg(feature = "join")]
                    if inner.join.is_detached(tid) {
                        inner.reap(tid);
                    }
                }
            }
            polled += 1;
        }
        polled
    }

    /// Tick until the run queue drains. Threads still parked on wait
    /// queues when this returns are blocked, not lost; nothing here will
    /// invent a wakeup for them.
    pub fn run(&self) {
        while self.tick() > 0 {}
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// A thread's state; NO_STATE for a vacant or reclaimed slot
    pub fn state(&self, tid: ThreadId) -> ThreadState {
        let inner = self.inner.borrow();
        inner
            .threads
            .get(tid.0)
            .map(|t| t.state)
            .unwrap_or(ThreadState::NoState)
    }

    pub fn retval(&self, tid: ThreadId) -> i64 {
        self.inner.borrow().thread(tid).retval
    }

    pub fn errno(&self, tid: ThreadId) -> i32 {
        self.inner.borrow().thread(tid).errno
    }

    pub fn cancelled(&self, tid: ThreadId) -> bool {
        self.inner.borrow().thread(tid).cancelled
    }

    pub fn thread_name(&self, tid: ThreadId) -> String {
        self.inner.borrow().thread(tid).name.clone()
    }

    /// Number of occupied thread slots
    pub fn thread_count(&self) -> usize {
        self.inner.borrow().threads.len()
    }

    /// Number of threads on the run queue
    pub fn runnable_count(&self) -> usize {
        self.inner.borrow().run_queue.len()
    }

    /// Snapshot of the run queue, next-to-run first
    pub fn runnable(&self) -> Vec<ThreadId> {
        self.inner.borrow().run_queue.iter().copied().collect()
    }

    /// The thread being polled right now, if called from thread context
    pub fn current(&self) -> Option<ThreadId> {
        self.inner.borrow().current
    }

    pub fn stats(&self) -> SchedStats {
        self.inner.borrow().stats
    }

    /// Snapshot of the trace buffer, oldest first
    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.inner.borrow().trace.events()
    }

    pub fn set_trace_enabled(&self, enabled: bool) {
        self.inner.borrow_mut().trace.set_enabled(enabled);
    }
}

impl Default for Sched {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread execution context.
///
/// Handed to every thread body; carries the acting thread's identity and a
/// weak reference to its scheduler. Thread-context operations (exit, the
/// mutex protocol, join) are methods here, so the acting thread is always
/// explicit - there is no ambient current-thread pointer anywhere.
#[derive(Clone)]
pub struct Ctx {
    pub(crate) tid: ThreadId,
    pub(crate) sched: Weak<RefCell<SchedInner>>,
}

impl Ctx {
    /// The acting thread's id
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// A scheduler handle, for operations that are not thread-context
    /// bound (spawning, cancelling another thread)
    pub fn sched(&self) -> Sched {
        Sched::from_inner(self.upgrade())
    }

    pub(crate) fn upgrade(&self) -> Rc<RefCell<SchedInner>> {
        self.sched
            .upgrade()
            .expect("scheduler dropped while a thread is still running")
    }

    /// Terminate the calling thread: store the return value, transition to
    /// EXITED, and signal join-waiters. The body must return immediately
    /// afterwards; suspending again after exit is a contract violation.
    pub fn exit(&self, retval: i64) {
        let rc = self.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(self.tid, "exit");
        inner.thread_mut(self.tid).retval = retval;
        inner.finish_thread(self.tid);
    }

    /// Record an error number on the calling thread
    pub fn set_errno(&self, errno: i32) {
        let rc = self.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(self.tid, "set_errno");
        inner.thread_mut(self.tid).errno = errno;
    }

    /// Voluntarily reschedule: go to the back of the run queue and let
    /// every other runnable thread have a turn. The caller stays RUN the
    /// whole time - this is a reschedule, not a sleep.
    pub fn yield_now(&self) -> Yield {
        Yield {
            ctx: self.clone(),
            yielded: false,
        }
    }
}

/// Future returned by [`Ctx::yield_now`]
pub struct Yield {
    ctx: Ctx,
    yielded: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        let rc = this.ctx.upgrade();
        let mut inner = rc.borrow_mut();
        inner.assert_current(this.ctx.tid, "yield");
        inner.stats.yields += 1;
        inner.record(
            TraceCategory::Sched,
            "yield",
            None,
            Some(this.ctx.tid),
        );
        inner.enqueue_runnable(this.ctx.tid);
        this.yielded = true;
        Poll::Pending
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx").field("tid", &self.tid).finish()
    }
}
