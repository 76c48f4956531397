//! kcore - kernel threads and blocking mutexes for a teaching mini-kernel
//!
//! The hard part of a kernel this size is not picking the next thread to
//! run, it is the bookkeeping around it: at every observable instant a
//! thread must be running, linked on exactly one queue, or exited awaiting
//! reclamation. A thread in none of those places is lost forever. This
//! crate is that bookkeeping - the thread control block and its state
//! machine, FIFO wait queues, and a blocking mutex that hands ownership
//! directly to the longest waiter - plus the cooperative scheduler that
//! makes it all observable.
//!
//! Design:
//! - Cooperative and deterministic: one logical CPU, tick-based run loop,
//!   thread bodies are futures parked and resumed at explicit suspension
//!   points. No wall clock, no preemption, same result every run.
//! - Slots, not pointers: threads, wait queues, and mutexes live in arenas
//!   and refer to each other by index, so a thread's "current queue" is one
//!   optional id the scheduler can check, not a raw link to chase.
//! - No ambient current thread: every thread-context operation is a method
//!   on the [`sched::Ctx`] handed to the thread body.
//! - Kernel bugs panic, kernel conditions return errors: locking a mutex
//!   you hold panics; being cancelled while blocked is an ordinary
//!   [`mutex::Interrupted`] result.

pub mod mutex;
pub mod process;
pub mod queue;
pub mod sched;
pub mod thread;
pub mod trace;

#[cfg(feature = "join")]
pub mod join;

#[cfg(test)]
mod invariants_test;

pub use mutex::{Interrupted, MutexId};
pub use process::{Pid, ProcessError};
pub use queue::QueueId;
pub use sched::{Ctx, Sched, SchedStats};
pub use thread::{ThreadError, ThreadId, ThreadState};

#[cfg(feature = "join")]
pub use join::JoinError;
