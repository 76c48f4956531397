//! Instrumentation and tracing
//!
//! Lightweight event tracing for the thread and mutex core.
//!
//! Design:
//! - Ring buffer for recent events (bounded memory)
//! - Events are timestamped with the scheduler tick, not wall time -
//!   the core is deterministic and owns no clock
//! - Cheap enough to stay on in tests; can be disabled wholesale

use crate::thread::ThreadId;
use std::collections::VecDeque;

/// Maximum number of events to keep in the trace buffer
const TRACE_BUFFER_SIZE: usize = 1000;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCategory {
    /// Thread lifecycle (spawn, clone, cancel, exit, reap)
    Thread,
    /// Scheduler activity (park, wake, tick)
    Sched,
    /// Mutex protocol (claim, block, hand-off, release)
    Mutex,
    /// Process lifecycle
    Process,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Thread => write!(f, "THREAD"),
            TraceCategory::Sched => write!(f, "SCHED"),
            TraceCategory::Mutex => write!(f, "MUTEX"),
            TraceCategory::Process => write!(f, "PROCESS"),
        }
    }
}

/// A single trace event
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Scheduler tick at which the event was recorded
    pub tick: u64,
    /// Event category
    pub category: TraceCategory,
    /// Event name/type
    pub name: String,
    /// Optional details
    pub detail: Option<String>,
    /// Associated thread (if any)
    pub tid: Option<ThreadId>,
}

impl TraceEvent {
    /// Create a new instant event
    pub fn instant(tick: u64, category: TraceCategory, name: impl Into<String>) -> Self {
        Self {
            tick,
            category,
            name: name.into(),
            detail: None,
            tid: None,
        }
    }

    /// Create an event with details
    pub fn with_detail(
        tick: u64,
        category: TraceCategory,
        name: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            tick,
            category,
            name: name.into(),
            detail: Some(detail.into()),
            tid: None,
        }
    }

    /// Add the acting thread
    pub fn with_tid(mut self, tid: ThreadId) -> Self {
        self.tid = Some(tid);
        self
    }
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>6}] {} {}", self.tick, self.category, self.name)?;
        if let Some(tid) = self.tid {
            write!(f, " {}", tid)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Bounded ring buffer of recent trace events
#[derive(Debug)]
pub struct TraceBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    enabled: bool,
    /// Events discarded because the buffer was full
    dropped: u64,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::with_capacity(TRACE_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            enabled: true,
            dropped: 0,
        }
    }

    /// Record an event, evicting the oldest when full
    pub fn record(&mut self, event: TraceEvent) {
        if !self.enabled {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    /// Enable or disable recording
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshot of the buffered events, oldest first
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.iter().cloned().collect()
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.dropped = 0;
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
