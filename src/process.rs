//! Process abstraction
//!
//! The core only needs the ownership boundary: a thread belongs to exactly
//! one process for its lifetime, the process keeps a permanent list of its
//! threads, and teardown must not destroy a process while any of its
//! threads still occupies a slot. Everything else a real process carries
//! (address space, descriptors, credentials) lives outside this crate.

use crate::thread::ThreadId;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// A process: the owner of one or more threads
pub(crate) struct Process {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    /// Permanent membership list; entries leave only when the thread's
    /// slot is reclaimed
    pub(crate) threads: Vec<ThreadId>,
}

impl Process {
    pub(crate) fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            threads: Vec::new(),
        }
    }
}

/// Process lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The process does not exist
    NotFound,
    /// Teardown attempted while threads still exist
    HasLiveThreads,
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::NotFound => write!(f, "no such process"),
            ProcessError::HasLiveThreads => {
                write!(f, "process still owns threads")
            }
        }
    }
}

impl std::error::Error for ProcessError {}
