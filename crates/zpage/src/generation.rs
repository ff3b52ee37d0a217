//! Generation Module - Young and Old Age Groups
//!
//! Two generations, fixed at compile time:
//! - **Young**: eden (mutator allocation) and survivor1..survivor14
//!   (relocation targets)
//! - **Old**: one relocation target for promoted objects
//!
//! Each generation has a cycle sequence number. A stalled allocation
//! remembers both numbers when it is created; if a number has moved on
//! since, the allocation has "seen" a cycle of that generation start.
//! The page allocator uses this to escalate from minor to major collection
//! and, finally, to out-of-memory.
//!
//! The collector itself is outside this crate. It is reached through the
//! `GcDriver` trait.

use crate::allocator::{EdenAllocator, PageAllocator, PageAllocatorStats, RelocationAllocator};
use crate::config::SURVIVOR_AGES;
use crate::page::{Page, PageAge};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Generation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationId {
    Young,
    Old,
}

impl GenerationId {
    pub const ALL: [GenerationId; 2] = [GenerationId::Young, GenerationId::Old];

    /// Dense index, for per-generation arrays
    pub fn index(&self) -> usize {
        match self {
            GenerationId::Young => 0,
            GenerationId::Old => 1,
        }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationId::Young => f.write_str("young"),
            GenerationId::Old => f.write_str("old"),
        }
    }
}

/// Cycle sequence numbers of both generations
#[derive(Debug, Default)]
pub struct CycleCounters {
    young: AtomicU32,
    old: AtomicU32,
}

impl CycleCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn young(&self) -> u32 {
        self.young.load(Ordering::Acquire)
    }

    pub fn old(&self) -> u32 {
        self.old.load(Ordering::Acquire)
    }

    pub fn get(&self, id: GenerationId) -> u32 {
        match id {
            GenerationId::Young => self.young(),
            GenerationId::Old => self.old(),
        }
    }

    /// Mark the start of a cycle; returns the new sequence number
    pub fn begin(&self, id: GenerationId) -> u32 {
        let counter = match id {
            GenerationId::Young => &self.young,
            GenerationId::Old => &self.old,
        };
        counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

/// Reason a collection is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// A blocking allocation could not claim capacity
    AllocationStall,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcCause::AllocationStall => f.write_str("Allocation Stall"),
        }
    }
}

/// Interface to the collector
///
/// Requests are asynchronous: the driver starts a cycle later, on its own
/// thread. They are never made while the page allocator lock is held.
pub trait GcDriver: Send + Sync {
    /// Collect the young generation
    fn request_minor(&self, cause: GcCause);

    /// Collect both generations
    fn request_major(&self, cause: GcCause);
}

/// Driver that only logs and counts requests
#[derive(Debug, Default)]
pub struct LoggingDriver {
    minor: AtomicU64,
    major: AtomicU64,
}

impl LoggingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minor_requests(&self) -> u64 {
        self.minor.load(Ordering::Relaxed)
    }

    pub fn major_requests(&self) -> u64 {
        self.major.load(Ordering::Relaxed)
    }
}

impl GcDriver for LoggingDriver {
    fn request_minor(&self, cause: GcCause) {
        self.minor.fetch_add(1, Ordering::Relaxed);
        log::info!("Minor collection requested ({})", cause);
    }

    fn request_major(&self, cause: GcCause) {
        self.major.fetch_add(1, Ordering::Relaxed);
        log::info!("Major collection requested ({})", cause);
    }
}

/// Young generation: eden plus one relocation target per survivor age
pub struct YoungGeneration {
    eden: EdenAllocator,
    survivors: Vec<RelocationAllocator>,
    page_allocator: Arc<PageAllocator>,
    cycles: Arc<CycleCounters>,
}

/// Old generation: the relocation target for promoted objects
pub struct OldGeneration {
    old: RelocationAllocator,
    page_allocator: Arc<PageAllocator>,
    cycles: Arc<CycleCounters>,
}

/// Generation - closed set of age groups
pub enum Generation {
    Young(YoungGeneration),
    Old(OldGeneration),
}

impl Generation {
    pub fn young(page_allocator: Arc<PageAllocator>, cycles: Arc<CycleCounters>) -> Self {
        Generation::Young(YoungGeneration {
            eden: EdenAllocator::new(page_allocator.clone()),
            survivors: (1..=SURVIVOR_AGES)
                .map(|n| RelocationAllocator::new(page_allocator.clone(), PageAge::survivor(n)))
                .collect(),
            page_allocator,
            cycles,
        })
    }

    pub fn old(page_allocator: Arc<PageAllocator>, cycles: Arc<CycleCounters>) -> Self {
        Generation::Old(OldGeneration {
            old: RelocationAllocator::new(page_allocator.clone(), PageAge::OLD),
            page_allocator,
            cycles,
        })
    }

    pub fn id(&self) -> GenerationId {
        match self {
            Generation::Young(_) => GenerationId::Young,
            Generation::Old(_) => GenerationId::Old,
        }
    }

    fn page_allocator(&self) -> &PageAllocator {
        match self {
            Generation::Young(young) => &young.page_allocator,
            Generation::Old(old) => &old.page_allocator,
        }
    }

    fn cycles(&self) -> &CycleCounters {
        match self {
            Generation::Young(young) => &young.cycles,
            Generation::Old(old) => &old.cycles,
        }
    }

    /// Current cycle sequence number
    pub fn seqnum(&self) -> u32 {
        self.cycles().get(self.id())
    }

    /// Eden allocator, young generation only
    pub fn eden(&self) -> Option<&EdenAllocator> {
        match self {
            Generation::Young(young) => Some(&young.eden),
            Generation::Old(_) => None,
        }
    }

    /// Relocation target for objects of `age`
    ///
    /// Eden is never a relocation target.
    pub fn relocation_allocator(&self, age: PageAge) -> Option<&RelocationAllocator> {
        match self {
            Generation::Young(young) if age.is_survivor() => young.survivors.get(age.index() - 1),
            Generation::Old(old) if age.is_old() => Some(&old.old),
            _ => None,
        }
    }

    /// Start a collection cycle of this generation
    ///
    /// Bumps the sequence number, resets the collection statistics and
    /// retires the shared pages of the generation's allocators. Must run at
    /// a safepoint.
    pub fn begin_cycle(&self) -> u32 {
        let seqnum = self.cycles().begin(self.id());
        self.page_allocator().reset_statistics(self.id());
        self.retire_pages();

        log::debug!("{} cycle {} started", self.id(), seqnum);
        seqnum
    }

    /// Reset every shared page slot of this generation's allocators
    pub fn retire_pages(&self) {
        match self {
            Generation::Young(young) => {
                young.eden.retire_pages();
                for survivor in &young.survivors {
                    survivor.retire_pages();
                }
            }
            Generation::Old(old) => old.old.retire_pages(),
        }
    }

    /// Hand every page allocated in this generation to the caller
    pub fn take_pages(&self) -> Vec<Page> {
        match self {
            Generation::Young(young) => {
                let mut pages = young.eden.take_pages();
                for survivor in &young.survivors {
                    pages.extend(survivor.take_pages());
                }
                pages
            }
            Generation::Old(old) => old.old.take_pages(),
        }
    }

    /// Return pages of this generation to the page allocator
    pub fn free_pages(&self, pages: Vec<Page>) {
        self.page_allocator().free_pages(self.id(), pages);
    }

    pub fn used(&self) -> usize {
        self.page_allocator().used_generation(self.id())
    }

    pub fn stats(&self) -> PageAllocatorStats {
        self.page_allocator().stats(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_counters() {
        let cycles = CycleCounters::new();
        assert_eq!(cycles.young(), 0);

        assert_eq!(cycles.begin(GenerationId::Young), 1);
        assert_eq!(cycles.begin(GenerationId::Young), 2);
        assert_eq!(cycles.get(GenerationId::Young), 2);
        assert_eq!(cycles.old(), 0);
    }

    #[test]
    fn test_generation_id() {
        assert_eq!(GenerationId::Young.index(), 0);
        assert_eq!(GenerationId::Old.index(), 1);
        assert_eq!(GenerationId::Old.to_string(), "old");
    }

    #[test]
    fn test_logging_driver_counts() {
        let driver = LoggingDriver::new();
        driver.request_minor(GcCause::AllocationStall);
        driver.request_major(GcCause::AllocationStall);
        driver.request_major(GcCause::AllocationStall);

        assert_eq!(driver.minor_requests(), 1);
        assert_eq!(driver.major_requests(), 2);
    }
}
