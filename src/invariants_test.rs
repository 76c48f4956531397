//! Invariant tests
//!
//! Each test is named after the system-wide invariant it verifies, and the
//! doc comment states the invariant. These complement the per-module unit
//! tests: they check the properties that hold *across* threads, queues,
//! and mutexes, at tick boundaries where everything is quiescent.

#[cfg(test)]
mod thread_invariants {
    use crate::process::Pid;
    use crate::sched::Sched;
    use crate::thread::{ThreadId, ThreadState};

    fn boot() -> (Sched, Pid) {
        let sched = Sched::new();
        let pid = sched.spawn_process("invariants");
        (sched, pid)
    }

    /// T1: Liveness - at every tick boundary, every thread is on the run
    /// queue, linked on a wait queue, or exited. (The scheduler also
    /// enforces this with a panic; here we observe it from outside.)
    #[test]
    fn t1_every_thread_is_accounted_for() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();

        // One thread that holds the mutex across several reschedules, one
        // that blocks behind it, one that exits straight away.
        let spinner = sched
            .spawn(
                pid,
                "spinner",
                move |ctx, _, _| async move {
                    ctx.mutex_lock(m).await;
                    ctx.yield_now().await;
                    ctx.yield_now().await;
                    ctx.mutex_unlock(m);
                },
                0,
                0,
            )
            .unwrap();
        let blocker = sched
            .spawn(
                pid,
                "blocker",
                move |ctx, _, _| async move {
                    ctx.mutex_lock(m).await;
                    ctx.mutex_unlock(m);
                },
                0,
                0,
            )
            .unwrap();
        let sprinter = sched
            .spawn(pid, "sprinter", |_, _, _| async {}, 0, 0)
            .unwrap();

        let all = [spinner, blocker, sprinter];
        for _ in 0..6 {
            sched.tick();
            let runnable = sched.runnable();
            let waiters = sched.mutex_waiters(m);
            for tid in all {
                match sched.state(tid) {
                    ThreadState::Run => assert!(
                        runnable.contains(&tid),
                        "{} is RUN but not on the run queue",
                        tid
                    ),
                    ThreadState::Sleep | ThreadState::SleepCancellable => assert!(
                        waiters.contains(&tid),
                        "{} is sleeping but not on the wait queue",
                        tid
                    ),
                    ThreadState::Exited => {}
                    ThreadState::NoState => panic!("{} reports NO_STATE while live", tid),
                }
            }
        }

        for tid in all {
            assert_eq!(sched.state(tid), ThreadState::Exited);
        }
    }

    /// T2: NO_STATE is never observable on a live thread - only vacant
    /// slots report it.
    #[test]
    fn t2_no_state_only_for_vacant_slots() {
        let (sched, pid) = boot();
        assert_eq!(sched.state(ThreadId(0)), ThreadState::NoState);

        let tid = sched.spawn(pid, "live", |_, _, _| async {}, 0, 0).unwrap();
        assert_ne!(sched.state(tid), ThreadState::NoState);

        sched.run();
        sched.destroy(tid);
        assert_eq!(sched.state(tid), ThreadState::NoState);
    }

    /// T3: A created thread starts in RUN, on the run queue, linked to no
    /// wait queue, with cancellation clear.
    #[test]
    fn t3_created_threads_start_runnable() {
        let (sched, pid) = boot();
        let tid = sched.spawn(pid, "fresh", |_, _, _| async {}, 0, 0).unwrap();

        assert_eq!(sched.state(tid), ThreadState::Run);
        assert!(sched.runnable().contains(&tid));
        assert!(!sched.cancelled(tid));
        assert_eq!(sched.process_threads(pid), vec![tid]);
    }

    /// T4: EXITED is terminal - no later event moves a thread out of it.
    #[test]
    fn t4_exited_is_terminal() {
        let (sched, pid) = boot();
        let tid = sched
            .spawn(
                pid,
                "done",
                |ctx, _, _| async move {
                    ctx.exit(5);
                },
                0,
                0,
            )
            .unwrap();
        sched.run();
        assert_eq!(sched.state(tid), ThreadState::Exited);

        // A late cancel must not revive or requeue it
        sched.cancel(tid, -1);
        sched.run();
        assert_eq!(sched.state(tid), ThreadState::Exited);
        assert_eq!(sched.retval(tid), 5);
    }
}

#[cfg(test)]
mod mutex_invariants {
    use crate::process::Pid;
    use crate::sched::Sched;
    use crate::thread::ThreadState;
    use std::cell::Cell;
    use std::rc::Rc;

    fn boot() -> (Sched, Pid) {
        let sched = Sched::new();
        let pid = sched.spawn_process("invariants");
        (sched, pid)
    }

    /// M1: At most one thread holds a mutex at any instant - every thread
    /// inside the critical section observes itself as the holder.
    #[test]
    fn m1_at_most_one_holder() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();
        let inside = Rc::new(Cell::new(0u32));

        for i in 0..4 {
            let inside = inside.clone();
            sched
                .spawn(
                    pid,
                    &format!("worker-{}", i),
                    move |ctx, _, _| {
                        let inside = inside.clone();
                        async move {
                            ctx.mutex_lock(m).await;
                            assert_eq!(ctx.sched().mutex_holder(m), Some(ctx.tid()));
                            inside.set(inside.get() + 1);
                            assert_eq!(inside.get(), 1, "two threads in the critical section");
                            ctx.yield_now().await;
                            inside.set(inside.get() - 1);
                            ctx.mutex_unlock(m);
                        }
                    },
                    i,
                    0,
                )
                .unwrap();
        }
        sched.run();
        assert_eq!(sched.mutex_holder(m), None);
    }

    /// M2: The holder is never also linked on its own mutex's wait queue.
    #[test]
    fn m2_holder_is_never_a_waiter() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();

        for i in 0..4 {
            sched
                .spawn(
                    pid,
                    &format!("worker-{}", i),
                    move |ctx, _, _| async move {
                        ctx.mutex_lock(m).await;
                        ctx.yield_now().await;
                        ctx.mutex_unlock(m);
                    },
                    i,
                    0,
                )
                .unwrap();
        }

        for _ in 0..12 {
            sched.tick();
            if let Some(holder) = sched.mutex_holder(m) {
                assert!(
                    !sched.mutex_waiters(m).contains(&holder),
                    "{} holds the mutex and waits on it",
                    holder
                );
            }
        }
        assert_eq!(sched.mutex_holder(m), None);
    }

    /// M3: holder == None exactly when the mutex is free; a lock/unlock
    /// round trip restores the freshly initialized state.
    #[test]
    fn m3_free_means_no_holder() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();
        assert_eq!(sched.mutex_holder(m), None);
        assert!(sched.mutex_waiters(m).is_empty());

        sched
            .spawn(
                pid,
                "round-trip",
                move |ctx, _, _| async move {
                    ctx.mutex_lock(m).await;
                    ctx.mutex_unlock(m);
                },
                0,
                0,
            )
            .unwrap();
        sched.run();

        assert_eq!(sched.mutex_holder(m), None);
        assert!(sched.mutex_waiters(m).is_empty());
    }

    /// M4: Hand-off is atomic - ownership belongs to the head waiter the
    /// moment unlock returns, before the new holder has run a single
    /// instruction of its own.
    #[test]
    fn m4_handoff_has_no_free_window() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();
        let b_entered = Rc::new(Cell::new(false));
        let b_entered_clone = b_entered.clone();

        sched
            .spawn(
                pid,
                "a",
                move |ctx, _, _| async move {
                    ctx.mutex_lock(m).await;
                    ctx.yield_now().await;
                    ctx.mutex_unlock(m);
                },
                0,
                0,
            )
            .unwrap();
        let b = sched
            .spawn(
                pid,
                "b",
                move |ctx, _, _| {
                    let entered = b_entered_clone.clone();
                    async move {
                        ctx.mutex_lock(m).await;
                        entered.set(true);
                        ctx.mutex_unlock(m);
                    }
                },
                0,
                0,
            )
            .unwrap();

        // Tick 1: a claims and yields, b parks behind it
        sched.tick();
        assert_eq!(sched.mutex_waiters(m), vec![b]);

        // Tick 2: a unlocks. b has not resumed yet, but already owns the
        // mutex - there was no free window for anyone to steal.
        sched.tick();
        assert_eq!(sched.mutex_holder(m), Some(b));
        assert_eq!(sched.state(b), ThreadState::Run);
        assert!(!b_entered.get());

        sched.run();
        assert!(b_entered.get());
        assert_eq!(sched.mutex_holder(m), None);
    }
}

#[cfg(test)]
mod queue_invariants {
    use crate::process::Pid;
    use crate::sched::Sched;
    use crate::thread::ThreadState;

    fn boot() -> (Sched, Pid) {
        let sched = Sched::new();
        let pid = sched.spawn_process("invariants");
        (sched, pid)
    }

    /// Q1: The waiter count always equals the number of threads actually
    /// blocked on the queue, in arrival order.
    #[test]
    fn q1_count_matches_blocked_threads() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();

        sched
            .spawn(
                pid,
                "keeper",
                move |ctx, _, _| async move {
                    ctx.mutex_lock(m).await;
                },
                0,
                0,
            )
            .unwrap();

        let mut blocked = Vec::new();
        for i in 0..3 {
            let tid = sched
                .spawn(
                    pid,
                    &format!("waiter-{}", i),
                    move |ctx, _, _| async move {
                        ctx.mutex_lock(m).await;
                        ctx.mutex_unlock(m);
                    },
                    i,
                    0,
                )
                .unwrap();
            blocked.push(tid);
            sched.tick();
            assert_eq!(sched.mutex_waiters(m), blocked);
        }

        for &tid in &blocked {
            assert_eq!(sched.state(tid), ThreadState::Sleep);
        }
    }

    /// Q2: A cancelled cancellable sleeper leaves its wait queue at cancel
    /// time, not at wakeup time, and the other waiters keep their order.
    #[test]
    fn q2_cancel_unlinks_immediately() {
        let (sched, pid) = boot();
        let m = sched.mutex_create();

        sched
            .spawn(
                pid,
                "keeper",
                move |ctx, _, _| async move {
                    ctx.mutex_lock(m).await;
                },
                0,
                0,
            )
            .unwrap();

        let mut waiters = Vec::new();
        for i in 0..3 {
            let tid = sched
                .spawn(
                    pid,
                    &format!("waiter-{}", i),
                    move |ctx, _, _| async move {
                        let _ = ctx.mutex_lock_cancellable(m).await;
                    },
                    i,
                    0,
                )
                .unwrap();
            waiters.push(tid);
            sched.tick();
        }
        assert_eq!(sched.mutex_waiters(m), waiters);

        // Cancel the middle waiter: gone from the queue before any tick
        sched.cancel(waiters[1], -1);
        assert_eq!(sched.mutex_waiters(m), vec![waiters[0], waiters[2]]);
        assert_eq!(sched.state(waiters[1]), ThreadState::Run);
    }
}
