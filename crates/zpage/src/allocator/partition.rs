//! Partition - one NUMA node's share of the heap
//!
//! A partition owns:
//! - capacity counters (`capacity`, `used`, `claimed`, current max)
//! - a virtual address reservation
//! - a mapped cache of free committed memory (`PartitionState`)
//!
//! Conservation at quiescent points:
//! ```text
//! cache + used + claimed == capacity <= current_max_capacity <= max_capacity
//! ```
//!
//! The counters are atomics so they can be read without the lock, but every
//! mutation takes a `&mut PartitionState`, which only exists inside the page
//! allocator's global lock.

use super::memory_allocation::MemoryAllocation;
use crate::memory::{HeapMemory, MappedCache, VirtualMemory, VirtualMemoryManager};
use crate::util::constants::MB;
use crate::util::{percent_of, to_mb, Alignment};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Upper bound of one uncommit step
const UNCOMMIT_CHUNK_MAX: usize = 256 * MB;

/// Lock-protected part of a partition
#[derive(Debug, Default)]
pub struct PartitionState {
    pub cache: MappedCache,
    pub last_commit: Option<Instant>,
    pub last_uncommit: Option<Instant>,
}

/// Max capacity change after a commit failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReduction {
    pub numa_id: usize,
    pub from: usize,
    pub to: usize,
}

pub struct Partition {
    numa_id: usize,
    granule_size: usize,
    min_capacity: usize,
    max_capacity: usize,
    current_max_capacity: AtomicUsize,
    capacity: AtomicUsize,
    claimed: AtomicUsize,
    used: AtomicUsize,
    virtual_memory: VirtualMemoryManager,
}

impl Partition {
    pub fn new(
        numa_id: usize,
        granule_size: usize,
        min_capacity: usize,
        max_capacity: usize,
        reservation: VirtualMemory,
    ) -> Self {
        Self {
            numa_id,
            granule_size,
            min_capacity,
            max_capacity,
            current_max_capacity: AtomicUsize::new(max_capacity),
            capacity: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            virtual_memory: VirtualMemoryManager::new(reservation),
        }
    }

    pub fn numa_id(&self) -> usize {
        self.numa_id
    }

    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn current_max_capacity(&self) -> usize {
        self.current_max_capacity.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Capacity being uncommitted
    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Bytes a claim may still take
    pub fn available(&self) -> usize {
        self.current_max_capacity()
            .saturating_sub(self.used())
            .saturating_sub(self.claimed())
    }

    /// Grow capacity by up to `size`; returns the increase
    fn increase_capacity(&self, state: &mut PartitionState, size: usize) -> usize {
        let headroom = self.current_max_capacity() - self.capacity();
        let increased = size.min(headroom);

        if increased > 0 {
            self.capacity.fetch_add(increased, Ordering::Relaxed);
            state.last_commit = Some(Instant::now());
        }

        increased
    }

    /// Shrink capacity by `size`
    ///
    /// With `set_max_capacity` the ceiling drops to the new capacity, for
    /// good: the memory could not be committed.
    pub fn decrease_capacity(
        &self,
        _state: &mut PartitionState,
        size: usize,
        set_max_capacity: bool,
    ) -> Option<CapacityReduction> {
        let capacity = self.capacity.fetch_sub(size, Ordering::Relaxed) - size;

        if !set_max_capacity {
            return None;
        }

        let from = self.current_max_capacity.swap(capacity, Ordering::Relaxed);
        log::error!(
            "Forced to lower max partition ({}) capacity from {}M({:.0}%) to {}M({:.0}%)",
            self.numa_id,
            to_mb(from),
            percent_of(from, self.max_capacity),
            to_mb(capacity),
            percent_of(capacity, self.max_capacity)
        );

        Some(CapacityReduction {
            numa_id: self.numa_id,
            from,
            to: capacity,
        })
    }

    pub fn decrease_used(&self, _state: &mut PartitionState, size: usize) {
        self.used.fetch_sub(size, Ordering::Relaxed);
    }

    /// Claim `allocation.size()` bytes of capacity
    ///
    /// An exact contiguous cache hit satisfies the claim outright. Otherwise
    /// capacity grows as far as the ceiling allows and the rest is harvested
    /// from the cache in fragments.
    pub fn claim_capacity(&self, state: &mut PartitionState, allocation: &mut MemoryAllocation) -> bool {
        let size = allocation.size();
        if self.available() < size {
            return false;
        }

        if let Some(vmem) = state.cache.remove_contiguous(size) {
            allocation.set_satisfied_from_cache_vmem(vmem);
        } else {
            let increased = self.increase_capacity(state, size);
            allocation.set_increased_capacity(increased);

            if increased < size {
                let harvested = state
                    .cache
                    .remove_discontiguous(size - increased, allocation.partial_vmems_mut());
                allocation.set_harvested(harvested);
            }

            debug_assert_eq!(
                allocation.harvested() + allocation.increased_capacity(),
                size,
                "partition {} claimed the wrong amount",
                self.numa_id
            );
        }

        allocation.set_partition(self.numa_id);
        self.used.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Claim a power-of-two cached range in `[min_size, max_size]`
    ///
    /// Never grows capacity. The allocation's size becomes the range's.
    pub fn claim_capacity_fast_medium(
        &self,
        state: &mut PartitionState,
        allocation: &mut MemoryAllocation,
        min_size: usize,
        max_size: usize,
    ) -> bool {
        let Some(vmem) = state.cache.remove_contiguous_power_of_two(min_size, max_size) else {
            return false;
        };

        allocation.set_size(vmem.size());
        allocation.set_satisfied_from_cache_vmem(vmem);
        allocation.set_partition(self.numa_id);
        self.used.fetch_add(vmem.size(), Ordering::Relaxed);
        true
    }

    /// Return the memory of a freed page to the cache
    pub fn free_memory(&self, state: &mut PartitionState, vmem: VirtualMemory) {
        self.used.fetch_sub(vmem.size(), Ordering::Relaxed);
        state.cache.insert(vmem);
    }

    /// Undo a claim whose page was never built
    ///
    /// Mapped parts go back to the cache. Capacity that never got backed is
    /// dropped; after a commit failure the ceiling drops with it.
    pub fn free_memory_alloc_failed(
        &self,
        state: &mut PartitionState,
        allocation: &mut MemoryAllocation,
    ) -> Option<CapacityReduction> {
        let mut freed = 0;

        if let Some(vmem) = allocation.take_satisfied_from_cache_vmem() {
            freed += vmem.size();
            state.cache.insert(vmem);
        }

        for vmem in allocation.take_partial_vmems() {
            freed += vmem.size();
            state.cache.insert(vmem);
        }

        self.used.fetch_sub(allocation.size(), Ordering::Relaxed);

        let remaining = allocation.size() - freed;
        if remaining == 0 {
            return None;
        }

        self.decrease_capacity(state, remaining, allocation.commit_failed())
    }

    /// Claim fresh partition-local address space
    pub fn claim_virtual(&self, size: usize) -> Option<VirtualMemory> {
        self.virtual_memory.alloc_low_address(size)
    }

    pub fn free_virtual(&self, vmem: VirtualMemory) {
        self.virtual_memory.free(vmem);
    }

    /// Claim address space for a composed claim
    ///
    /// Harvested fragments are detached from their segments before their
    /// address space is released, then the segments move to the head of the
    /// lowest free range that fits the whole claim. Without harvested memory
    /// a fresh range is claimed. On failure every fragment gets its segments
    /// back and stays owned by `allocation`.
    pub fn claim_virtual_for(
        &self,
        memory: &HeapMemory,
        allocation: &mut MemoryAllocation,
    ) -> Option<VirtualMemory> {
        let size = allocation.size();

        if allocation.partial_vmems().is_empty() {
            return self.virtual_memory.alloc_low_address(size);
        }

        // The released fragments may be handed out again, even to our own
        // claim, so nothing in the granule map may point at them any more
        let detached: Vec<Vec<usize>> = allocation
            .partial_vmems()
            .iter()
            .map(|&fragment| {
                let segments = memory.take_segments(fragment);
                memory.unmap(fragment);
                segments
            })
            .collect();

        let Some(vmem) = self
            .virtual_memory
            .free_and_alloc_low(allocation.partial_vmems(), size)
        else {
            for (&fragment, segments) in allocation.partial_vmems().iter().zip(&detached) {
                memory.put_segments(fragment, segments);
                memory.map(fragment);
            }
            return None;
        };

        let mut offset = 0;
        for (fragment, segments) in allocation.take_partial_vmems().into_iter().zip(detached) {
            memory.put_segments(vmem.slice(offset, fragment.size()), &segments);
            offset += fragment.size();
        }
        debug_assert_eq!(offset, allocation.harvested());

        Some(vmem)
    }

    /// Attach physical segments of this partition to `vmem`
    pub fn claim_physical(&self, memory: &HeapMemory, vmem: VirtualMemory) -> bool {
        memory.claim_physical(self.numa_id, vmem)
    }

    /// Commit the segments behind `vmem`; returns committed bytes
    pub fn commit_physical(&self, memory: &HeapMemory, vmem: VirtualMemory) -> usize {
        memory.commit_physical(vmem)
    }

    pub fn free_physical(&self, memory: &HeapMemory, vmem: VirtualMemory) {
        memory.free_physical(vmem);
    }

    /// Commit, map and cache `size` bytes at startup
    ///
    /// Returns false if the memory could not be fully committed.
    pub fn prime(
        &self,
        state: &mut PartitionState,
        memory: &HeapMemory,
        workers: usize,
        size: usize,
        pretouch: bool,
    ) -> bool {
        if size == 0 {
            return true;
        }

        let increased = self.increase_capacity(state, size);
        debug_assert_eq!(increased, size);

        let Some(vmem) = self.claim_virtual(size) else {
            log::error!("Partition {} could not reserve {}M at startup", self.numa_id, to_mb(size));
            return false;
        };

        if !self.claim_physical(memory, vmem) {
            log::error!("Partition {} has no physical memory for {}M", self.numa_id, to_mb(size));
            return false;
        }

        let committed = self.commit_physical(memory, vmem);
        if committed < size {
            log::error!(
                "Partition {} committed only {}M of {}M at startup",
                self.numa_id,
                to_mb(committed),
                to_mb(size)
            );
            return false;
        }

        memory.map(vmem);
        if pretouch {
            memory.pretouch(vmem, workers);
        }

        state.cache.insert(vmem);
        true
    }

    /// Largest amount flushed in one uncommit step
    fn uncommit_chunk(&self) -> usize {
        let chunk = Alignment::align_down(self.current_max_capacity() / 128, self.granule_size);
        chunk.min(UNCOMMIT_CHUNK_MAX).max(self.granule_size)
    }

    /// Pick cached memory to uncommit and mark it claimed
    ///
    /// Only memory that stayed in the cache since the watermark was last
    /// reset qualifies, never below min capacity, and nothing at all while
    /// the last commit is younger than `delay`.
    pub fn begin_uncommit(&self, state: &mut PartitionState, delay: Duration) -> Vec<VirtualMemory> {
        let mut flushed = Vec::new();

        if let Some(last_commit) = state.last_commit {
            if last_commit.elapsed() < delay {
                return flushed;
            }
        }

        let limit = state
            .cache
            .min_size_watermark()
            .min(self.capacity().saturating_sub(self.min_capacity))
            .min(self.uncommit_chunk());
        let limit = Alignment::align_down(limit, self.granule_size);

        if limit == 0 {
            return flushed;
        }

        let size = state.cache.remove_for_uncommit(limit, &mut flushed);
        self.claimed.fetch_add(size, Ordering::Relaxed);
        flushed
    }

    /// Drop the capacity of memory uncommitted since `begin_uncommit`
    pub fn finish_uncommit(&self, state: &mut PartitionState, size: usize) {
        self.claimed.fetch_sub(size, Ordering::Relaxed);
        self.capacity.fetch_sub(size, Ordering::Relaxed);
        state.last_uncommit = Some(Instant::now());
    }

    pub fn snapshot(&self, state: &PartitionState) -> PartitionSnapshot {
        PartitionSnapshot {
            numa_id: self.numa_id,
            min_capacity: self.min_capacity,
            max_capacity: self.max_capacity,
            current_max_capacity: self.current_max_capacity(),
            capacity: self.capacity(),
            used: self.used(),
            claimed: self.claimed(),
            cached: state.cache.size(),
            available: self.available(),
        }
    }
}

/// Point-in-time view of a partition's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSnapshot {
    pub numa_id: usize,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub current_max_capacity: usize,
    pub capacity: usize,
    pub used: usize,
    pub claimed: usize,
    pub cached: usize,
    pub available: usize,
}
