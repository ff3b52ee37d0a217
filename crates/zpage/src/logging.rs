//! Allocation Logging and Telemetry
//!
//! Diagnostic text goes through the `log` facade. On top of that the
//! allocator records structured `AllocEvent`s in an `EventLog`, useful for:
//! - Performance analysis (stall durations, page latency)
//! - Debugging capacity changes
//! - Production monitoring (JSON output)
//!
//! Levels decide what is forwarded to `log`; the ring keeps every event:
//! - ERROR: capacity reduced, address space exhausted, out of memory
//! - WARN: unusual conditions
//! - INFO: heap initialization, allocation stalls
//! - DEBUG: uncommit
//! - TRACE: every page allocation

use crate::page::{PageAge, PageType};
use crate::util::to_mb;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for allocator events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Allocator event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocEvent {
    /// Heap reserved and primed
    HeapInitialized {
        partitions: usize,
        min_capacity: usize,
        initial_capacity: usize,
        max_capacity: usize,
        reserved: usize,
    },

    /// Page handed out
    PageAllocated {
        page_type: PageType,
        age: PageAge,
        size: usize,
        multi_partition: bool,
        duration_us: u64,
    },

    /// Blocking allocation finished waiting
    AllocationStall {
        page_type: PageType,
        size: usize,
        duration_ms: f64,
        satisfied: bool,
    },

    /// Allocation failed for good
    OutOfMemory {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    /// Commit failure lowered a partition's max capacity
    CapacityReduced {
        numa_id: usize,
        from: usize,
        to: usize,
    },

    /// Idle memory returned to the OS
    Uncommitted {
        numa_id: usize,
        bytes: usize,
        capacity: usize,
    },

    /// No virtual range available for a claim
    AddressSpaceExhausted { requested: usize },
}

/// Event log configuration
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Most verbose level forwarded to `log`; every event is recorded
    pub level: LogLevel,

    /// Forward events to the `log` facade
    pub console: bool,

    /// Render forwarded events as JSON
    pub json: bool,

    /// Prefix forwarded events with a wall-clock timestamp
    pub timestamps: bool,

    /// Number of events kept in memory
    pub capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
            capacity: 1024,
        }
    }
}

/// EventLog - bounded in-memory record of allocator events
pub struct EventLog {
    config: EventLogConfig,
    events: Mutex<VecDeque<(Instant, AllocEvent)>>,
    enabled: AtomicBool,
}

impl EventLog {
    /// Create new event log
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            config,
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record an event
    pub fn log(&self, event: AllocEvent) {
        if !self.is_enabled() {
            return;
        }

        if self.forwards(&event) {
            let level = Self::event_level(&event);
            log::log!(target: "zpage::events", level.into(), "{}", self.format(&event));
        }

        let mut events = self.events.lock();
        if events.len() == self.config.capacity {
            events.pop_front();
        }
        if self.config.capacity > 0 {
            events.push_back((Instant::now(), event));
        }
    }

    /// Whether `event` goes to the `log` facade as well
    fn forwards(&self, event: &AllocEvent) -> bool {
        self.config.console && Self::event_level(event) <= self.config.level
    }

    /// Get log level for event
    fn event_level(event: &AllocEvent) -> LogLevel {
        match event {
            AllocEvent::OutOfMemory { .. }
            | AllocEvent::CapacityReduced { .. }
            | AllocEvent::AddressSpaceExhausted { .. } => LogLevel::Error,
            AllocEvent::HeapInitialized { .. } | AllocEvent::AllocationStall { .. } => LogLevel::Info,
            AllocEvent::Uncommitted { .. } => LogLevel::Debug,
            AllocEvent::PageAllocated { .. } => LogLevel::Trace,
        }
    }

    /// Render an event as one line
    pub fn format(&self, event: &AllocEvent) -> String {
        let body = if self.config.json {
            serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
        } else {
            Self::format_human(event)
        };

        if self.config.timestamps {
            let now = chrono::Local::now();
            format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), body)
        } else {
            body
        }
    }

    /// Output in human-readable format
    fn format_human(event: &AllocEvent) -> String {
        match event {
            AllocEvent::HeapInitialized {
                partitions,
                min_capacity,
                initial_capacity,
                max_capacity,
                reserved,
            } => format!(
                "Heap initialized: {} partition(s), min {}M, initial {}M, max {}M, reserved {}M",
                partitions,
                to_mb(*min_capacity),
                to_mb(*initial_capacity),
                to_mb(*max_capacity),
                to_mb(*reserved)
            ),
            AllocEvent::PageAllocated {
                page_type,
                age,
                size,
                multi_partition,
                duration_us,
            } => format!(
                "Page allocated: {} {} {}M{} in {}us",
                page_type,
                age,
                to_mb(*size),
                if *multi_partition { " (multi-partition)" } else { "" },
                duration_us
            ),
            AllocEvent::AllocationStall {
                page_type,
                size,
                duration_ms,
                satisfied,
            } => format!(
                "Allocation Stall ({} {}M) {:.3}ms{}",
                page_type,
                to_mb(*size),
                duration_ms,
                if *satisfied { "" } else { ", failed" }
            ),
            AllocEvent::OutOfMemory {
                requested,
                used,
                capacity,
            } => format!(
                "Out Of Memory: requested {} bytes (used {}M, capacity {}M)",
                requested,
                to_mb(*used),
                to_mb(*capacity)
            ),
            AllocEvent::CapacityReduced { numa_id, from, to } => format!(
                "Partition {} max capacity lowered from {}M to {}M",
                numa_id,
                to_mb(*from),
                to_mb(*to)
            ),
            AllocEvent::Uncommitted {
                numa_id,
                bytes,
                capacity,
            } => format!(
                "Uncommitted {}M from partition {} (capacity {}M)",
                to_mb(*bytes),
                numa_id,
                to_mb(*capacity)
            ),
            AllocEvent::AddressSpaceExhausted { requested } => {
                format!("Address space exhausted: requested {} bytes", requested)
            }
        }
    }

    /// Get all events
    pub fn events(&self) -> Vec<(Instant, AllocEvent)> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events matching a predicate, oldest first
    pub fn find(&self, predicate: impl Fn(&AllocEvent) -> bool) -> Vec<AllocEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, event)| predicate(event))
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Get event count
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EventLogConfig::default())
    }
}
