//! Timer - Timing Utilities
//!
//! Measures page allocation latency and stall durations.

use std::time::{Duration, Instant};

/// Timer - wall-clock stopwatch
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start timing now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time measured from an earlier instant
    pub fn since(start: Instant) -> Self {
        Self { start }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
