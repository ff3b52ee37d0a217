//! PageAllocation - one request for a page
//!
//! Lives for the duration of one `alloc_page` call. While the request
//! stalls, it is moved into the stall queue and comes back through the
//! result channel: `Some` when a free satisfied it, `None` when it was
//! failed by out-of-memory notification.

use super::memory_allocation::MemoryAllocation;
use crate::generation::CycleCounters;
use crate::page::{AllocationFlags, PageAge, PageType};
use crossbeam::channel::Sender;
use std::time::Instant;

/// Whole request claimed from one partition
#[derive(Debug, Clone)]
pub struct SinglePartitionAllocation {
    pub allocation: MemoryAllocation,
}

/// Request split across partitions, one claim per partition
///
/// Claims are kept in address order of the final page.
#[derive(Debug, Clone, Default)]
pub struct MultiPartitionAllocation {
    pub allocations: Vec<MemoryAllocation>,
}

impl MultiPartitionAllocation {
    pub fn size(&self) -> usize {
        self.allocations.iter().map(|a| a.size()).sum()
    }
}

/// Claim shape of a page allocation
#[derive(Debug, Clone)]
pub enum PartitionAllocation {
    Single(SinglePartitionAllocation),
    Multi(MultiPartitionAllocation),
}

#[derive(Debug)]
pub struct PageAllocation {
    pub page_type: PageType,
    pub size: usize,
    pub flags: AllocationFlags,
    pub age: PageAge,
    pub start: Instant,
    pub initiating_numa_id: usize,
    pub young_seqnum: u32,
    pub old_seqnum: u32,
    pub claim: PartitionAllocation,
}

impl PageAllocation {
    pub fn new(
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
        age: PageAge,
        initiating_numa_id: usize,
        cycles: &CycleCounters,
    ) -> Self {
        Self {
            page_type,
            size,
            flags,
            age,
            start: Instant::now(),
            initiating_numa_id,
            young_seqnum: cycles.young(),
            old_seqnum: cycles.old(),
            claim: PartitionAllocation::Single(SinglePartitionAllocation {
                allocation: MemoryAllocation::new(size),
            }),
        }
    }

    /// Drop the claim state before another attempt
    pub fn reset_for_retry(&mut self) {
        self.claim = PartitionAllocation::Single(SinglePartitionAllocation {
            allocation: MemoryAllocation::new(self.size),
        });
    }

    pub fn is_multi_partition(&self) -> bool {
        matches!(self.claim, PartitionAllocation::Multi(_))
    }

    pub fn set_single(&mut self, allocation: MemoryAllocation) {
        debug_assert_eq!(allocation.size(), self.size);
        self.claim = PartitionAllocation::Single(SinglePartitionAllocation { allocation });
    }

    pub fn set_multi(&mut self, multi: MultiPartitionAllocation) {
        debug_assert_eq!(multi.size(), self.size);
        self.claim = PartitionAllocation::Multi(multi);
    }

    /// The fast-medium path may settle for a smaller cached range
    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// A young cycle started since this request was made
    pub fn has_seen_young(&self, cycles: &CycleCounters) -> bool {
        self.young_seqnum != cycles.young()
    }

    /// An old cycle started since this request was made
    pub fn has_seen_old(&self, cycles: &CycleCounters) -> bool {
        self.old_seqnum != cycles.old()
    }
}

/// Entry of the stall queue
pub struct StalledAllocation {
    pub allocation: PageAllocation,
    pub result: Sender<Option<PageAllocation>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationId;

    #[test]
    fn test_seen_cycles() {
        let cycles = CycleCounters::new();
        let allocation = PageAllocation::new(
            PageType::Small,
            4096,
            AllocationFlags::new(),
            PageAge::EDEN,
            0,
            &cycles,
        );

        assert!(!allocation.has_seen_young(&cycles));
        cycles.begin(GenerationId::Young);
        assert!(allocation.has_seen_young(&cycles));
        assert!(!allocation.has_seen_old(&cycles));
    }

    #[test]
    fn test_reset_for_retry_back_to_single() {
        let cycles = CycleCounters::new();
        let mut allocation = PageAllocation::new(
            PageType::Large,
            8192,
            AllocationFlags::new(),
            PageAge::EDEN,
            0,
            &cycles,
        );
        allocation.set_multi(MultiPartitionAllocation {
            allocations: vec![MemoryAllocation::new(4096), MemoryAllocation::new(4096)],
        });
        assert!(allocation.is_multi_partition());

        allocation.reset_for_retry();
        match &allocation.claim {
            PartitionAllocation::Single(single) => assert_eq!(single.allocation.size(), 8192),
            PartitionAllocation::Multi(_) => panic!("expected a single-partition claim"),
        }
    }
}
