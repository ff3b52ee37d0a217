//! PageAllocator - Claim, Commit and Map Pages
//!
//! Every page allocation goes through three ordered steps:
//!
//! ```text
//! claim capacity ──► claim virtual ──► claim + commit physical ──► map ──► Page
//!   (global lock)     (VM manager)       (physical manager)
//! ```
//!
//! Only capacity claiming runs under the global lock. Commit, map, unmap
//! and pre-touch always run outside it, so a failure after the claim is
//! rolled back by taking the lock again (`free_after_alloc_page_failed`).
//!
//! ## Capacity claiming
//!
//! 1. `fast_medium`: a power-of-two cached range from any partition
//! 2. round robin over partitions from the initiating NUMA node
//! 3. split over several partitions when their sum is large enough
//!
//! ## Stalling
//!
//! A blocking request that cannot be claimed joins a FIFO queue and the
//! caller waits on a channel. Every free retries the queue head first.
//! Collection cycles that start while a request waits move it towards
//! out-of-memory: after an old cycle has started and the collector reports
//! that all soft references are cleared, the request fails.

use super::memory_allocation::MemoryAllocation;
use super::page_allocation::{
    MultiPartitionAllocation, PageAllocation, PartitionAllocation, StalledAllocation,
};
use super::partition::{CapacityReduction, Partition, PartitionSnapshot, PartitionState};
use crate::config::AllocatorConfig;
use crate::error::{Result, ZError};
use crate::generation::{CycleCounters, GcCause, GcDriver, GenerationId};
use crate::logging::{AllocEvent, EventLog};
use crate::memory::{HeapMemory, PhysicalBacking, VirtualMemory};
use crate::page::{AllocationFlags, Page, PageAge, PagePartition, PageType, PartitionPart};
use crate::stats::{AllocationStats, Timer};
use crate::util::{to_mb, Alignment, AtomicUtils};
use crossbeam::channel::{self, Receiver, SendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Everything guarded by the global lock
struct AllocatorState {
    partitions: Vec<PartitionState>,
    stalled: VecDeque<StalledAllocation>,
}

/// Per-generation counters, reset when a cycle of that generation starts
#[derive(Default)]
struct CollectionStats {
    used_high: AtomicUsize,
    used_low: AtomicUsize,
    freed: AtomicUsize,
    promoted: AtomicUsize,
    compacted: AtomicUsize,
    allocation_stalls: AtomicU64,
}

/// Snapshot for heap sizing heuristics and monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageAllocatorStats {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub soft_max_capacity: usize,
    pub capacity: usize,
    pub used: usize,
    /// Highest `used` since the generation's cycle started
    pub used_high: usize,
    /// Lowest `used` since the generation's cycle started
    pub used_low: usize,
    pub used_generation: usize,
    pub freed: usize,
    pub promoted: usize,
    pub compacted: usize,
    pub allocation_stalls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcRequest {
    Minor,
    Major,
}

/// PageAllocator - hands out granule-aligned pages
pub struct PageAllocator {
    config: Arc<AllocatorConfig>,
    memory: HeapMemory,
    partitions: Box<[Partition]>,
    state: Mutex<AllocatorState>,
    used: AtomicUsize,
    used_generations: [AtomicUsize; 2],
    collection_stats: [CollectionStats; 2],
    cycles: Arc<CycleCounters>,
    driver: Arc<dyn GcDriver>,
    stats: AllocationStats,
    events: Arc<EventLog>,
}

/// Split `total` into `count` granule multiples, remainder to the first
fn distribute(total: usize, granule: usize, count: usize) -> Vec<usize> {
    let granules = total / granule;
    (0..count)
        .map(|i| (granules / count + usize::from(i < granules % count)) * granule)
        .collect()
}

impl PageAllocator {
    /// Reserve the heap, create the partitions and commit initial capacity
    pub fn new(
        config: Arc<AllocatorConfig>,
        driver: Arc<dyn GcDriver>,
        backing: Arc<dyn PhysicalBacking>,
        events: Arc<EventLog>,
        cycles: Arc<CycleCounters>,
    ) -> Result<Self> {
        config.validate()?;

        let count = config.partition_count();
        let granule = config.granule_size;
        let max = distribute(config.max_capacity, granule, count);
        let min = distribute(config.min_capacity, granule, count);
        let initial = distribute(config.initial_capacity, granule, count);

        let (memory, reservations) = HeapMemory::reserve(
            &max,
            granule,
            config.virtual_to_physical_ratio,
            config.multi_partition,
            backing,
        )?;

        let partitions: Box<[Partition]> = reservations
            .into_iter()
            .enumerate()
            .map(|(numa_id, reservation)| {
                Partition::new(numa_id, granule, min[numa_id], max[numa_id], reservation)
            })
            .collect();

        let mut states: Vec<PartitionState> = (0..count).map(|_| PartitionState::default()).collect();
        for (partition, state) in partitions.iter().zip(states.iter_mut()) {
            let size = initial[partition.numa_id()];
            if !partition.prime(state, &memory, config.workers(), size, config.always_pre_touch) {
                return Err(ZError::HeapInitialization(format!(
                    "Failed to commit {}M of initial capacity in partition {}",
                    to_mb(size),
                    partition.numa_id()
                )));
            }
        }

        log::info!(
            "Heap initialized: {} partition(s), min {}M, initial {}M, max {}M",
            count,
            to_mb(config.min_capacity),
            to_mb(config.initial_capacity),
            to_mb(config.max_capacity)
        );
        events.log(AllocEvent::HeapInitialized {
            partitions: count,
            min_capacity: config.min_capacity,
            initial_capacity: config.initial_capacity,
            max_capacity: config.max_capacity,
            reserved: memory.mapping().size(),
        });

        Ok(Self {
            config,
            memory,
            partitions,
            state: Mutex::new(AllocatorState {
                partitions: states,
                stalled: VecDeque::new(),
            }),
            used: AtomicUsize::new(0),
            used_generations: Default::default(),
            collection_stats: Default::default(),
            cycles,
            driver,
            stats: AllocationStats::new(),
            events,
        })
    }

    /// Allocate a page of `size` bytes
    ///
    /// Blocks while capacity is short unless `flags` is non-blocking.
    /// Returns None when the request fails; nothing it claimed is kept.
    pub fn alloc_page(
        &self,
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
        age: PageAge,
    ) -> Option<Page> {
        debug_assert!(size > 0 && Alignment::is_aligned(size, self.granule_size()));

        let numa_id = crate::numa::current_id(self.partitions.len());
        let allocation = PageAllocation::new(page_type, size, flags, age, numa_id, &self.cycles);
        let timer = Timer::since(allocation.start);

        let page = self.alloc_page_inner(allocation)?;

        let duration = timer.elapsed();
        self.stats.record_page(
            page_type,
            page.size(),
            page.is_multi_partition(),
            duration,
            !flags.gc_relocation(),
        );
        self.events.log(AllocEvent::PageAllocated {
            page_type,
            age,
            size: page.size(),
            multi_partition: page.is_multi_partition(),
            duration_us: duration.as_micros() as u64,
        });

        Some(page)
    }

    fn alloc_page_inner(&self, mut allocation: PageAllocation) -> Option<Page> {
        loop {
            allocation = self.claim_capacity_or_stall(allocation)?;

            let Some(vmem) = self.claim_virtual_memory(&mut allocation) else {
                self.address_space_exhausted(&mut allocation);
                return None;
            };

            if self.commit_and_map(&mut allocation, vmem) {
                return Some(self.create_page(&allocation, vmem));
            }

            // Capacity ceiling was lowered, try again
            self.free_after_alloc_page_failed(&mut allocation);
            allocation.reset_for_retry();
        }
    }

    fn claim_capacity_or_stall(&self, mut allocation: PageAllocation) -> Option<PageAllocation> {
        let page_type = allocation.page_type;
        let size = allocation.size;

        let receiver = {
            let mut state = self.state.lock();

            if self.claim_capacity(&mut state.partitions, &mut allocation) {
                self.increase_used(allocation.size);
                return Some(allocation);
            }

            if allocation.flags.non_blocking() {
                return None;
            }

            let (sender, receiver) = channel::bounded(1);
            state.stalled.push_back(StalledAllocation {
                allocation,
                result: sender,
            });
            for stats in &self.collection_stats {
                stats.allocation_stalls.fetch_add(1, Ordering::Relaxed);
            }
            receiver
        };

        self.alloc_page_stall(receiver, page_type, size)
    }

    fn alloc_page_stall(
        &self,
        receiver: Receiver<Option<PageAllocation>>,
        page_type: PageType,
        size: usize,
    ) -> Option<PageAllocation> {
        let timer = Timer::new();

        // Start a collection to free memory
        self.driver.request_minor(GcCause::AllocationStall);

        let result = receiver.recv().ok().flatten();
        let satisfied = result.is_some();

        self.stats.record_stall(timer.elapsed(), satisfied);
        log::info!("Allocation Stall ({} {}M) {:.3}ms", page_type, to_mb(size), timer.elapsed_ms());
        self.events.log(AllocEvent::AllocationStall {
            page_type,
            size,
            duration_ms: timer.elapsed_ms(),
            satisfied,
        });

        result
    }

    fn claim_capacity(&self, states: &mut [PartitionState], allocation: &mut PageAllocation) -> bool {
        let count = self.partitions.len();
        let start = allocation.initiating_numa_id;
        let order = (0..count).map(|i| (start + i) % count);

        if allocation.flags.fast_medium() {
            for numa_id in order {
                let mut claim = MemoryAllocation::new(allocation.size);
                if self.partitions[numa_id].claim_capacity_fast_medium(
                    &mut states[numa_id],
                    &mut claim,
                    self.config.page_size_medium_min,
                    self.config.page_size_medium_max,
                ) {
                    allocation.set_size(claim.size());
                    allocation.set_single(claim);
                    return true;
                }
            }
            return false;
        }

        for numa_id in order {
            let mut claim = MemoryAllocation::new(allocation.size);
            if self.partitions[numa_id].claim_capacity(&mut states[numa_id], &mut claim) {
                allocation.set_single(claim);
                return true;
            }
        }

        self.claim_capacity_multi_partition(states, allocation)
    }

    fn claim_capacity_multi_partition(
        &self,
        states: &mut [PartitionState],
        allocation: &mut PageAllocation,
    ) -> bool {
        if self.memory.multi_partition().is_none() {
            return false;
        }

        let Some(plan) = self.plan_multi_partition(allocation.size, allocation.initiating_numa_id) else {
            return false;
        };

        let mut multi = MultiPartitionAllocation::default();
        for (numa_id, size) in plan {
            let mut claim = MemoryAllocation::new(size);
            let claimed = self.partitions[numa_id].claim_capacity(&mut states[numa_id], &mut claim);
            debug_assert!(claimed, "partition {} refused a planned claim of {}", numa_id, size);
            multi.allocations.push(claim);
        }

        allocation.set_multi(multi);
        true
    }

    /// Share of `size` per partition, in round-robin order from `start`
    ///
    /// First an even granule-aligned split, then the remainder wherever
    /// there is room. None if all partitions together are too small.
    fn plan_multi_partition(&self, size: usize, start: usize) -> Option<Vec<(usize, usize)>> {
        let count = self.partitions.len();
        let available: Vec<usize> = self.partitions.iter().map(|p| p.available()).collect();
        if available.iter().sum::<usize>() < size {
            return None;
        }

        let order: Vec<usize> = (0..count).map(|i| (start + i) % count).collect();
        let split = Alignment::align_up(size / count, self.granule_size());
        let mut assigned = vec![0; count];
        let mut remaining = size;

        for &numa_id in &order {
            let share = split.min(remaining).min(available[numa_id]);
            assigned[numa_id] += share;
            remaining -= share;
        }

        for &numa_id in &order {
            if remaining == 0 {
                break;
            }
            let extra = remaining.min(available[numa_id] - assigned[numa_id]);
            assigned[numa_id] += extra;
            remaining -= extra;
        }

        debug_assert_eq!(remaining, 0);

        Some(
            order
                .into_iter()
                .filter(|&numa_id| assigned[numa_id] > 0)
                .map(|numa_id| (numa_id, assigned[numa_id]))
                .collect(),
        )
    }

    fn owner(&self, claim: &MemoryAllocation) -> &Partition {
        debug_assert!(claim.numa_id().is_some(), "claim has no partition");
        &self.partitions[claim.numa_id().unwrap_or_default()]
    }

    fn claim_virtual_memory(&self, allocation: &mut PageAllocation) -> Option<VirtualMemory> {
        match &mut allocation.claim {
            PartitionAllocation::Single(single) => {
                let claim = &mut single.allocation;
                if let Some(vmem) = claim.satisfied_from_cache_vmem() {
                    return Some(vmem);
                }
                self.owner(claim).claim_virtual_for(&self.memory, claim)
            }
            PartitionAllocation::Multi(multi) => self.claim_virtual_memory_multi(multi),
        }
    }

    /// Claim a multi-partition range and move every claim's mapped memory
    /// to the head of its part
    fn claim_virtual_memory_multi(&self, multi: &mut MultiPartitionAllocation) -> Option<VirtualMemory> {
        let vmem = self.memory.multi_partition()?.alloc_low_address(multi.size())?;

        let mut offset = 0;
        for claim in &mut multi.allocations {
            let partition = self.owner(claim);
            let part = vmem.slice(offset, claim.size());
            offset += claim.size();

            let mut fragments = Vec::new();
            if let Some(cached) = claim.take_satisfied_from_cache_vmem() {
                claim.set_harvested(cached.size());
                fragments.push(cached);
            }
            fragments.extend(claim.take_partial_vmems());

            let mut inner = 0;
            for fragment in fragments {
                let segments = self.memory.take_segments(fragment);
                self.memory.unmap(fragment);
                self.memory.put_segments(part.slice(inner, fragment.size()), &segments);
                partition.free_virtual(fragment);
                inner += fragment.size();
            }
        }

        Some(vmem)
    }

    fn address_space_exhausted(&self, allocation: &mut PageAllocation) {
        let size = allocation.size;

        log::error!("Out of address space: failed to claim {}M of virtual memory", to_mb(size));
        self.events.log(AllocEvent::AddressSpaceExhausted { requested: size });

        self.free_after_alloc_page_failed(allocation);

        if cfg!(debug_assertions) {
            panic!("Address space exhausted: requested {} bytes", size);
        }
    }

    /// Back the increased capacity of `claim` at `tail`
    ///
    /// Returns committed bytes. Segments that could not be committed are
    /// released again.
    fn commit_increased(&self, partition: &Partition, claim: &mut MemoryAllocation, tail: VirtualMemory) -> usize {
        if !partition.claim_physical(&self.memory, tail) {
            log::error!(
                "Partition {} has no free physical memory for {}M",
                partition.numa_id(),
                to_mb(tail.size())
            );
            claim.set_commit_failed();
            return 0;
        }

        let committed = partition.commit_physical(&self.memory, tail);
        claim.set_committed_capacity(committed);

        if committed < tail.size() {
            claim.set_commit_failed();
            partition.free_physical(&self.memory, tail.last_part(committed));
        }

        committed
    }

    fn commit_and_map(&self, allocation: &mut PageAllocation, vmem: VirtualMemory) -> bool {
        match &mut allocation.claim {
            PartitionAllocation::Single(single) => self.commit_and_map_single(&mut single.allocation, vmem),
            PartitionAllocation::Multi(multi) => self.commit_and_map_multi(multi, vmem),
        }
    }

    fn commit_and_map_single(&self, claim: &mut MemoryAllocation, vmem: VirtualMemory) -> bool {
        if claim.is_satisfied_from_cache() {
            // Already mapped
            return true;
        }

        let partition = self.owner(claim);
        let harvested = claim.harvested();
        let increased = claim.increased_capacity();

        let committed = if increased > 0 {
            self.commit_increased(partition, claim, vmem.last_part(harvested))
        } else {
            0
        };

        if committed == increased {
            self.memory.map(vmem);
            return true;
        }

        // Keep the mapped prefix for the cache, give back the rest
        let mapped = harvested + committed;
        if mapped > 0 {
            let prefix = vmem.first_part(mapped);
            self.memory.map(prefix);
            claim.partial_vmems_mut().push(prefix);
        }
        partition.free_virtual(vmem.last_part(mapped));

        false
    }

    fn commit_and_map_multi(&self, multi: &mut MultiPartitionAllocation, vmem: VirtualMemory) -> bool {
        let mut failed = false;
        let mut offset = 0;

        for claim in &mut multi.allocations {
            let part = vmem.slice(offset, claim.size());
            offset += claim.size();

            let increased = claim.increased_capacity();
            if increased > 0 {
                let partition = self.owner(claim);
                let tail = part.last_part(claim.harvested());
                if self.commit_increased(partition, claim, tail) < increased {
                    failed = true;
                }
            }
        }

        if !failed {
            self.memory.map(vmem);
            return true;
        }

        // The cache only holds partition-local memory: move every backed
        // prefix out of the multi-partition range
        offset = 0;
        for claim in &mut multi.allocations {
            let partition = self.owner(claim);
            let part = vmem.slice(offset, claim.size());
            offset += claim.size();

            let mapped = claim.harvested() + claim.committed_capacity();
            if mapped == 0 {
                continue;
            }

            let prefix = part.first_part(mapped);
            match partition.claim_virtual(mapped) {
                Some(local) => {
                    let segments = self.memory.take_segments(prefix);
                    self.memory.put_segments(local, &segments);
                    self.memory.map(local);
                    claim.partial_vmems_mut().push(local);
                }
                None => {
                    log::error!(
                        "Partition {} out of address space, uncommitting {}M",
                        partition.numa_id(),
                        to_mb(mapped)
                    );
                    self.memory.uncommit_physical(prefix);
                    self.memory.free_physical(prefix);
                }
            }
        }

        if let Some(manager) = self.memory.multi_partition() {
            manager.free(vmem);
        }

        false
    }

    fn create_page(&self, allocation: &PageAllocation, vmem: VirtualMemory) -> Page {
        let partition = match &allocation.claim {
            PartitionAllocation::Single(single) => {
                PagePartition::Single(self.owner(&single.allocation).numa_id())
            }
            PartitionAllocation::Multi(multi) => PagePartition::Multi(
                multi
                    .allocations
                    .iter()
                    .map(|claim| PartitionPart {
                        numa_id: self.owner(claim).numa_id(),
                        size: claim.size(),
                    })
                    .collect(),
            ),
        };

        self.increase_used_generation(allocation.age.generation_id(), allocation.size);

        Page::new(
            allocation.page_type,
            allocation.age,
            vmem,
            self.memory.address(vmem.start()),
            partition,
        )
    }

    /// Give back a claim that did not become a page
    fn release_claim(&self, states: &mut [PartitionState], allocation: &mut PageAllocation) {
        self.decrease_used(allocation.size);

        let claims: Vec<&mut MemoryAllocation> = match &mut allocation.claim {
            PartitionAllocation::Single(single) => vec![&mut single.allocation],
            PartitionAllocation::Multi(multi) => multi.allocations.iter_mut().collect(),
        };

        for claim in claims {
            let numa_id = self.owner(claim).numa_id();
            if let Some(reduction) =
                self.partitions[numa_id].free_memory_alloc_failed(&mut states[numa_id], claim)
            {
                self.capacity_reduced(reduction);
            }
        }
    }

    fn free_after_alloc_page_failed(&self, allocation: &mut PageAllocation) {
        let mut state = self.state.lock();
        self.release_claim(&mut state.partitions, allocation);
        self.satisfy_stalled(&mut state);
    }

    fn capacity_reduced(&self, reduction: CapacityReduction) {
        self.stats.record_capacity_reduction();
        self.events.log(AllocEvent::CapacityReduced {
            numa_id: reduction.numa_id,
            from: reduction.from,
            to: reduction.to,
        });
    }

    /// Claim capacity for stalled requests, oldest first
    fn satisfy_stalled(&self, state: &mut AllocatorState) {
        let AllocatorState { partitions, stalled } = state;

        while let Some(head) = stalled.front_mut() {
            if !self.claim_capacity(partitions, &mut head.allocation) {
                break;
            }
            self.increase_used(head.allocation.size);

            let Some(entry) = stalled.pop_front() else {
                break;
            };
            if let Err(SendError(Some(mut allocation))) = entry.result.send(Some(entry.allocation)) {
                log::warn!("Stalled allocation abandoned, releasing its claim");
                self.release_claim(partitions, &mut allocation);
            }
        }
    }

    /// Fail stalled requests made before the last old cycle started
    fn notify_out_of_memory(&self, stalled: &mut VecDeque<StalledAllocation>) {
        while let Some(head) = stalled.front() {
            if !head.allocation.has_seen_old(&self.cycles) {
                break;
            }
            if let Some(entry) = stalled.pop_front() {
                if entry.result.send(None).is_err() {
                    log::warn!("Stalled allocation abandoned before it was failed");
                }
            }
        }
    }

    /// Collection needed to help the oldest stalled request
    fn restart_gc(&self, stalled: &VecDeque<StalledAllocation>) -> Option<GcRequest> {
        let head = stalled.front()?;

        if head.allocation.has_seen_young(&self.cycles) {
            Some(GcRequest::Major)
        } else {
            Some(GcRequest::Minor)
        }
    }

    fn request_gc(&self, request: Option<GcRequest>) {
        match request {
            Some(GcRequest::Minor) => self.driver.request_minor(GcCause::AllocationStall),
            Some(GcRequest::Major) => self.driver.request_major(GcCause::AllocationStall),
            None => {}
        }
    }

    /// Called by the collector after a young cycle
    pub fn handle_alloc_stalling_for_young(&self) {
        let request = self.restart_gc(&self.state.lock().stalled);
        self.request_gc(request);
    }

    /// Called by the collector after an old cycle
    ///
    /// If all soft references were cleared, requests that already waited
    /// through an old cycle are failed as out of memory.
    pub fn handle_alloc_stalling_for_old(&self, cleared_all_soft_refs: bool) {
        let request = {
            let mut state = self.state.lock();
            if cleared_all_soft_refs {
                self.notify_out_of_memory(&mut state.stalled);
            }
            self.restart_gc(&state.stalled)
        };
        self.request_gc(request);
    }

    pub fn is_alloc_stalling(&self) -> bool {
        !self.state.lock().stalled.is_empty()
    }

    /// The oldest stalled request waited through a young cycle but not yet
    /// through an old one
    pub fn is_alloc_stalling_for_old(&self) -> bool {
        self.state.lock().stalled.front().is_some_and(|head| {
            head.allocation.has_seen_young(&self.cycles) && !head.allocation.has_seen_old(&self.cycles)
        })
    }

    pub fn stall_queue_len(&self) -> usize {
        self.state.lock().stalled.len()
    }

    /// Free a page allocated from this allocator
    pub fn free_page(&self, page: Page) {
        let generation = page.generation_id();
        self.free_pages_inner(vec![page], Some(generation));
    }

    /// Free pages reclaimed by a collection of `generation`
    pub fn free_pages(&self, generation: GenerationId, pages: Vec<Page>) {
        self.free_pages_inner(pages, Some(generation));
    }

    /// Free a page that was never published
    ///
    /// Not counted as freed memory.
    pub fn undo_alloc_page(&self, page: Page) {
        self.stats.record_undo();
        self.free_pages_inner(vec![page], None);
    }

    fn free_pages_inner(&self, pages: Vec<Page>, freed_by: Option<GenerationId>) {
        let mut to_cache = Vec::with_capacity(pages.len());
        let mut lost = Vec::new();

        for page in pages {
            let size = page.size();
            self.decrease_used_generation(page.generation_id(), size);
            if let Some(generation) = freed_by {
                self.collection_stats[generation.index()]
                    .freed
                    .fetch_add(size, Ordering::Relaxed);
            }

            match page.partition() {
                PagePartition::Single(numa_id) => to_cache.push((*numa_id, page.vmem())),
                PagePartition::Multi(parts) => {
                    self.remap_multi_partition(page.vmem(), parts, &mut to_cache, &mut lost)
                }
            }
        }

        let mut state = self.state.lock();
        let states = &mut state.partitions;

        for (numa_id, vmem) in to_cache {
            self.decrease_used(vmem.size());
            self.partitions[numa_id].free_memory(&mut states[numa_id], vmem);
        }

        for (numa_id, size) in lost {
            let partition = &self.partitions[numa_id];
            self.decrease_used(size);
            partition.decrease_used(&mut states[numa_id], size);
            partition.decrease_capacity(&mut states[numa_id], size, false);
        }

        self.satisfy_stalled(&mut state);
    }

    /// Move each part of a multi-partition page into its own partition
    fn remap_multi_partition(
        &self,
        vmem: VirtualMemory,
        parts: &[PartitionPart],
        to_cache: &mut Vec<(usize, VirtualMemory)>,
        lost: &mut Vec<(usize, usize)>,
    ) {
        let mut offset = 0;

        for part in parts {
            let sub = vmem.slice(offset, part.size);
            offset += part.size;

            match self.partitions[part.numa_id].claim_virtual(part.size) {
                Some(local) => {
                    self.memory.remap(sub, local);
                    to_cache.push((part.numa_id, local));
                }
                None => {
                    log::error!(
                        "Partition {} out of address space, uncommitting {}M of a freed page",
                        part.numa_id,
                        to_mb(part.size)
                    );
                    self.memory.unmap(sub);
                    self.memory.uncommit_physical(sub);
                    self.memory.free_physical(sub);
                    lost.push((part.numa_id, part.size));
                }
            }
        }

        if let Some(manager) = self.memory.multi_partition() {
            manager.free(vmem);
        }
    }

    /// Return idle cached memory of partition `numa_id` to the OS
    ///
    /// Returns the number of bytes uncommitted.
    pub fn uncommit(&self, numa_id: usize) -> usize {
        let partition = &self.partitions[numa_id];
        let delay = self.config.uncommit_delay;
        let mut total = 0;

        loop {
            let flushed = partition.begin_uncommit(&mut self.state.lock().partitions[numa_id], delay);
            if flushed.is_empty() {
                break;
            }

            let mut size = 0;
            for vmem in flushed {
                self.memory.unmap(vmem);
                self.memory.uncommit_physical(vmem);
                self.memory.free_physical(vmem);
                partition.free_virtual(vmem);
                size += vmem.size();
            }

            partition.finish_uncommit(&mut self.state.lock().partitions[numa_id], size);
            total += size;
        }

        self.state.lock().partitions[numa_id]
            .cache
            .reset_min_size_watermark();

        if total > 0 {
            self.stats.record_uncommit(total);
            log::debug!(
                "Uncommitted {}M from partition {} (capacity {}M)",
                to_mb(total),
                numa_id,
                to_mb(partition.capacity())
            );
            self.events.log(AllocEvent::Uncommitted {
                numa_id,
                bytes: total,
                capacity: partition.capacity(),
            });
        }

        total
    }

    fn increase_used(&self, size: usize) {
        let used = self.used.fetch_add(size, Ordering::Relaxed) + size;
        for stats in &self.collection_stats {
            AtomicUtils::fetch_max(&stats.used_high, used);
        }
    }

    fn decrease_used(&self, size: usize) {
        let used = self.used.fetch_sub(size, Ordering::Relaxed) - size;
        for stats in &self.collection_stats {
            AtomicUtils::fetch_min(&stats.used_low, used);
        }
    }

    fn increase_used_generation(&self, generation: GenerationId, size: usize) {
        self.used_generations[generation.index()].fetch_add(size, Ordering::Relaxed);
    }

    fn decrease_used_generation(&self, generation: GenerationId, size: usize) {
        self.used_generations[generation.index()].fetch_sub(size, Ordering::Relaxed);
    }

    /// Account `size` bytes moving from young to old
    pub fn promote_used(&self, size: usize) {
        self.decrease_used_generation(GenerationId::Young, size);
        self.increase_used_generation(GenerationId::Old, size);
        self.collection_stats[GenerationId::Young.index()]
            .promoted
            .fetch_add(size, Ordering::Relaxed);
    }

    pub fn increase_compacted(&self, generation: GenerationId, size: usize) {
        self.collection_stats[generation.index()]
            .compacted
            .fetch_add(size, Ordering::Relaxed);
    }

    /// Start a new statistics period for `generation`
    pub fn reset_statistics(&self, generation: GenerationId) {
        let _state = self.state.lock();
        let stats = &self.collection_stats[generation.index()];
        let used = self.used();

        stats.freed.store(0, Ordering::Relaxed);
        stats.promoted.store(0, Ordering::Relaxed);
        stats.compacted.store(0, Ordering::Relaxed);
        stats.allocation_stalls.store(0, Ordering::Relaxed);
        stats.used_high.store(used, Ordering::Relaxed);
        stats.used_low.store(used, Ordering::Relaxed);
    }

    pub fn stats(&self, generation: GenerationId) -> PageAllocatorStats {
        let _state = self.state.lock();
        let stats = &self.collection_stats[generation.index()];

        PageAllocatorStats {
            min_capacity: self.min_capacity(),
            max_capacity: self.max_capacity(),
            soft_max_capacity: self.soft_max_capacity(),
            capacity: self.capacity(),
            used: self.used(),
            used_high: stats.used_high.load(Ordering::Relaxed),
            used_low: stats.used_low.load(Ordering::Relaxed),
            used_generation: self.used_generation(generation),
            freed: stats.freed.load(Ordering::Relaxed),
            promoted: stats.promoted.load(Ordering::Relaxed),
            compacted: stats.compacted.load(Ordering::Relaxed),
            allocation_stalls: stats.allocation_stalls.load(Ordering::Relaxed),
        }
    }

    pub fn min_capacity(&self) -> usize {
        self.partitions.iter().map(|p| p.min_capacity()).sum()
    }

    pub fn max_capacity(&self) -> usize {
        self.partitions.iter().map(|p| p.max_capacity()).sum()
    }

    /// Max capacity left after commit failures
    pub fn current_max_capacity(&self) -> usize {
        self.partitions.iter().map(|p| p.current_max_capacity()).sum()
    }

    pub fn soft_max_capacity(&self) -> usize {
        self.config.soft_max_capacity.min(self.current_max_capacity())
    }

    pub fn capacity(&self) -> usize {
        self.partitions.iter().map(|p| p.capacity()).sum()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn used_generation(&self, generation: GenerationId) -> usize {
        self.used_generations[generation.index()].load(Ordering::Relaxed)
    }

    /// Committed capacity not in use
    pub fn unused(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.capacity().saturating_sub(p.used()).saturating_sub(p.claimed()))
            .sum()
    }

    /// Bytes committed in the physical layer
    pub fn committed(&self) -> usize {
        self.memory.physical().committed()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn granule_size(&self) -> usize {
        self.memory.granule_size()
    }

    pub fn partition_snapshots(&self) -> Vec<PartitionSnapshot> {
        let state = self.state.lock();
        self.partitions
            .iter()
            .zip(state.partitions.iter())
            .map(|(partition, state)| partition.snapshot(state))
            .collect()
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn alloc_stats(&self) -> &AllocationStats {
        &self.stats
    }

    /// Check the accounting invariants
    ///
    /// Only meaningful while no allocation or free is in flight.
    pub fn verify(&self) -> Result<()> {
        let state = self.state.lock();
        let mut used = 0;
        let mut capacity = 0;

        for (partition, partition_state) in self.partitions.iter().zip(state.partitions.iter()) {
            let snapshot = partition.snapshot(partition_state);

            if snapshot.used > snapshot.capacity
                || snapshot.capacity > snapshot.current_max_capacity
                || snapshot.current_max_capacity > snapshot.max_capacity
            {
                return Err(ZError::InvariantViolation(format!(
                    "partition {}: used {} capacity {} current max {} max {}",
                    snapshot.numa_id,
                    snapshot.used,
                    snapshot.capacity,
                    snapshot.current_max_capacity,
                    snapshot.max_capacity
                )));
            }

            if snapshot.cached + snapshot.used + snapshot.claimed != snapshot.capacity {
                return Err(ZError::InvariantViolation(format!(
                    "partition {}: cached {} + used {} + claimed {} != capacity {}",
                    snapshot.numa_id, snapshot.cached, snapshot.used, snapshot.claimed, snapshot.capacity
                )));
            }

            if let Some(vmem) = partition_state.cache.ranges().find(|&vmem| !self.memory.is_backed(vmem)) {
                return Err(ZError::InvariantViolation(format!(
                    "partition {}: cached {:?} has no physical memory",
                    snapshot.numa_id, vmem
                )));
            }

            used += snapshot.used;
            capacity += snapshot.capacity;
        }

        if used != self.used() {
            return Err(ZError::InvariantViolation(format!(
                "partitions use {} bytes, allocator counts {}",
                used,
                self.used()
            )));
        }

        let used_generations: usize = GenerationId::ALL.iter().map(|&id| self.used_generation(id)).sum();
        if used_generations != used {
            return Err(ZError::InvariantViolation(format!(
                "generations use {} bytes, partitions {}",
                used_generations, used
            )));
        }

        if self.committed() != capacity {
            return Err(ZError::InvariantViolation(format!(
                "{} bytes committed for a capacity of {}",
                self.committed(),
                capacity
            )));
        }

        if self.memory.physical().allocated() != capacity {
            return Err(ZError::InvariantViolation(format!(
                "{} bytes of physical segments for a capacity of {}",
                self.memory.physical().allocated(),
                capacity
            )));
        }

        if self.memory.mapping().mapped() != capacity {
            return Err(ZError::InvariantViolation(format!(
                "{} bytes mapped for a capacity of {}",
                self.memory.mapping().mapped(),
                capacity
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::LoggingDriver;
    use crate::memory::AnonymousBacking;
    use crate::util::constants::MB;

    const G: usize = 2 * MB;

    fn allocator(partitions: usize, max_granules: usize) -> PageAllocator {
        let config = AllocatorConfig {
            max_capacity: max_granules * G,
            soft_max_capacity: max_granules * G,
            min_capacity: 0,
            initial_capacity: 0,
            numa_partitions: Some(partitions),
            gc_threads: Some(1),
            ..Default::default()
        };

        PageAllocator::new(
            Arc::new(config),
            Arc::new(LoggingDriver::new()),
            Arc::new(AnonymousBacking),
            Arc::new(EventLog::default()),
            Arc::new(CycleCounters::new()),
        )
        .unwrap()
    }

    fn non_blocking() -> AllocationFlags {
        let mut flags = AllocationFlags::new();
        flags.set_non_blocking();
        flags
    }

    #[test]
    fn test_distribute() {
        assert_eq!(distribute(5 * G, G, 2), vec![3 * G, 2 * G]);
        assert_eq!(distribute(0, G, 3), vec![0, 0, 0]);
    }

    #[test]
    fn test_alloc_and_free_round_trip() {
        let allocator = allocator(1, 8);

        let page = allocator
            .alloc_page(PageType::Small, G, non_blocking(), PageAge::EDEN)
            .unwrap();
        assert_eq!(page.size(), G);
        assert_eq!(allocator.used(), G);
        assert_eq!(allocator.used_generation(GenerationId::Young), G);
        allocator.verify().unwrap();

        allocator.free_page(page);
        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.capacity(), G);
        allocator.verify().unwrap();
    }

    #[test]
    fn test_plan_even_split_then_remainder() {
        let allocator = allocator(2, 8);

        // 4G each, ask for 6G: 3G + 3G
        assert_eq!(
            allocator.plan_multi_partition(6 * G, 1),
            Some(vec![(1, 3 * G), (0, 3 * G)])
        );
        assert_eq!(allocator.plan_multi_partition(9 * G, 0), None);
    }

    #[test]
    fn test_restart_gc_escalates() {
        let allocator = allocator(1, 1);
        let cycles = allocator.cycles.clone();
        let (sender, _receiver) = channel::bounded(1);
        let mut stalled = VecDeque::new();
        stalled.push_back(StalledAllocation {
            allocation: PageAllocation::new(
                PageType::Small,
                G,
                AllocationFlags::new(),
                PageAge::EDEN,
                0,
                &cycles,
            ),
            result: sender,
        });

        assert_eq!(allocator.restart_gc(&stalled), Some(GcRequest::Minor));
        cycles.begin(GenerationId::Young);
        assert_eq!(allocator.restart_gc(&stalled), Some(GcRequest::Major));

        allocator.notify_out_of_memory(&mut stalled);
        assert_eq!(stalled.len(), 1);
        cycles.begin(GenerationId::Old);
        allocator.notify_out_of_memory(&mut stalled);
        assert!(stalled.is_empty());
    }

    #[test]
    fn test_out_of_memory_with_abandoned_waiter() {
        let allocator = allocator(1, 1);
        let cycles = allocator.cycles.clone();
        let mut stalled = VecDeque::new();

        for _ in 0..2 {
            let (sender, receiver) = channel::bounded(1);
            drop(receiver);
            stalled.push_back(StalledAllocation {
                allocation: PageAllocation::new(
                    PageType::Small,
                    G,
                    AllocationFlags::new(),
                    PageAge::EDEN,
                    0,
                    &cycles,
                ),
                result: sender,
            });
        }

        cycles.begin(GenerationId::Old);
        allocator.notify_out_of_memory(&mut stalled);

        assert!(stalled.is_empty());
        assert_eq!(allocator.used(), 0);
        allocator.verify().unwrap();
    }
}
