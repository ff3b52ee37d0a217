//! Stats Module - Allocator Performance Monitoring
//!
//! Module ini mengumpulkan statistik allocator untuk:
//! - Performance tuning
//! - Production monitoring
//! - Debugging & profiling
//!
//! Metrics:
//! - Page allocations per type, multi-partition pages, undone pages
//! - Page allocation latency and allocation stalls
//! - Capacity reductions and uncommitted memory

pub mod histogram;
pub mod metrics;
pub mod timer;

pub use histogram::Histogram;
pub use metrics::{AllocatorMetrics, MetricValue};
pub use timer::Timer;

use crate::page::PageType;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// AllocationStats - lifetime counters of one page allocator
pub struct AllocationStats {
    small_pages: AtomicU64,
    medium_pages: AtomicU64,
    large_pages: AtomicU64,
    multi_partition_pages: AtomicU64,
    undone_pages: AtomicU64,
    allocated_bytes: AtomicUsize,

    /// Page allocation latency (microseconds)
    latency: Histogram,

    /// Stall durations (microseconds)
    stalls: Histogram,
    failed_stalls: AtomicU64,

    capacity_reductions: AtomicU64,
    uncommitted_bytes: AtomicUsize,

    start_time: Instant,
}

impl AllocationStats {
    pub fn new() -> Self {
        Self {
            small_pages: AtomicU64::new(0),
            medium_pages: AtomicU64::new(0),
            large_pages: AtomicU64::new(0),
            multi_partition_pages: AtomicU64::new(0),
            undone_pages: AtomicU64::new(0),
            allocated_bytes: AtomicUsize::new(0),
            latency: Histogram::new(),
            stalls: Histogram::new(),
            failed_stalls: AtomicU64::new(0),
            capacity_reductions: AtomicU64::new(0),
            uncommitted_bytes: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a successful page allocation
    ///
    /// Only mutator pages count towards `allocated_bytes`.
    pub fn record_page(
        &self,
        page_type: PageType,
        size: usize,
        multi_partition: bool,
        latency: Duration,
        mutator: bool,
    ) {
        let counter = match page_type {
            PageType::Small => &self.small_pages,
            PageType::Medium => &self.medium_pages,
            PageType::Large => &self.large_pages,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if multi_partition {
            self.multi_partition_pages.fetch_add(1, Ordering::Relaxed);
        }

        if mutator {
            self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        }
        self.latency.record(latency.as_micros() as u64);
    }

    /// Record the end of an allocation stall
    pub fn record_stall(&self, duration: Duration, satisfied: bool) {
        self.stalls.record(duration.as_micros() as u64);
        if !satisfied {
            self.failed_stalls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_undo(&self) {
        self.undone_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_reduction(&self) {
        self.capacity_reductions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uncommit(&self, bytes: usize) {
        self.uncommitted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn latency(&self) -> &Histogram {
        &self.latency
    }

    pub fn stalls(&self) -> &Histogram {
        &self.stalls
    }

    /// Point-in-time copy of all counters
    pub fn summary(&self) -> AllocationSummary {
        AllocationSummary {
            small_pages: self.small_pages.load(Ordering::Relaxed),
            medium_pages: self.medium_pages.load(Ordering::Relaxed),
            large_pages: self.large_pages.load(Ordering::Relaxed),
            multi_partition_pages: self.multi_partition_pages.load(Ordering::Relaxed),
            undone_pages: self.undone_pages.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            latency_p50_us: self.latency.p50(),
            latency_p99_us: self.latency.p99(),
            stalls: self.stalls.count(),
            failed_stalls: self.failed_stalls.load(Ordering::Relaxed),
            max_stall_ms: self.stalls.max() as f64 / 1000.0,
            capacity_reductions: self.capacity_reductions.load(Ordering::Relaxed),
            uncommitted_bytes: self.uncommitted_bytes.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Reset statistics
    pub fn reset(&self) {
        for counter in [
            &self.small_pages,
            &self.medium_pages,
            &self.large_pages,
            &self.multi_partition_pages,
            &self.undone_pages,
            &self.failed_stalls,
            &self.capacity_reductions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.allocated_bytes.store(0, Ordering::Relaxed);
        self.uncommitted_bytes.store(0, Ordering::Relaxed);
        self.latency.clear();
        self.stalls.clear();
    }
}

impl Default for AllocationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllocationSummary {
    pub small_pages: u64,
    pub medium_pages: u64,
    pub large_pages: u64,
    pub multi_partition_pages: u64,
    pub undone_pages: u64,
    /// Bytes handed out in pages, undone pages included
    pub allocated_bytes: usize,
    pub latency_p50_us: u64,
    pub latency_p99_us: u64,
    pub stalls: u64,
    /// Stalls that ended in out-of-memory
    pub failed_stalls: u64,
    pub max_stall_ms: f64,
    pub capacity_reductions: u64,
    pub uncommitted_bytes: usize,
    pub uptime_secs: u64,
}

impl AllocationSummary {
    pub fn pages(&self) -> u64 {
        self.small_pages + self.medium_pages + self.large_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_summary() {
        let stats = AllocationStats::new();
        stats.record_page(PageType::Small, 2 << 20, false, Duration::from_micros(10), true);
        stats.record_page(PageType::Medium, 4 << 20, false, Duration::from_micros(10), false);
        stats.record_page(PageType::Large, 8 << 20, true, Duration::from_micros(40), true);
        stats.record_stall(Duration::from_millis(2), false);
        stats.record_undo();

        let summary = stats.summary();
        assert_eq!(summary.pages(), 3);
        assert_eq!(summary.multi_partition_pages, 1);
        assert_eq!(summary.allocated_bytes, 10 << 20);
        assert_eq!(summary.stalls, 1);
        assert_eq!(summary.failed_stalls, 1);
        assert_eq!(summary.undone_pages, 1);
    }

    #[test]
    fn test_reset() {
        let stats = AllocationStats::new();
        stats.record_page(PageType::Medium, 4 << 20, false, Duration::ZERO, true);
        stats.record_uncommit(2 << 20);
        stats.reset();

        let summary = stats.summary();
        assert_eq!(summary.pages(), 0);
        assert_eq!(summary.uncommitted_bytes, 0);
    }
}
