//! Physical Memory Manager - Granule Segments per Partition
//!
//! Physical memory is modelled as granule-sized segments. Each partition
//! owns a contiguous slice of the physical offset space, sized to its max
//! capacity, and hands segments out lowest-offset first.
//!
//! Lifecycle of a segment:
//! 1. `alloc` - taken from the partition free list (no memory behind it yet)
//! 2. `commit` - backing memory requested; may come up short
//! 3. `uncommit` - backing memory returned
//! 4. `free` - segment returned to the free list
//!
//! Committing goes through a `PhysicalBacking`. The default backing always
//! succeeds because the reserved anonymous mapping is faulted in lazily;
//! `LimitedBacking` caps the total so commit failure handling can be
//! exercised deterministically.

use super::range::{RangeList, VirtualMemory};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Source of physical memory behind committed segments
///
/// Both calls return the number of bytes actually processed, which may be
/// less than requested. They are never errors.
pub trait PhysicalBacking: Send + Sync {
    /// Commit `size` bytes at physical `offset`
    fn commit(&self, offset: usize, size: usize) -> usize;

    /// Uncommit `size` bytes at physical `offset`
    fn uncommit(&self, offset: usize, size: usize) -> usize;
}

/// Backing provided by the reserved anonymous mapping itself
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousBacking;

impl PhysicalBacking for AnonymousBacking {
    fn commit(&self, _offset: usize, size: usize) -> usize {
        size
    }

    fn uncommit(&self, _offset: usize, size: usize) -> usize {
        size
    }
}

/// Backing with a fixed budget of committable bytes
///
/// Commits beyond the budget come up short, the way a host running out of
/// memory would behave. Uncommitted bytes are credited back.
#[derive(Debug)]
pub struct LimitedBacking {
    limit: usize,
    committed: AtomicUsize,
}

impl LimitedBacking {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            committed: AtomicUsize::new(0),
        }
    }

    /// Bytes currently committed through this backing
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}

impl PhysicalBacking for LimitedBacking {
    fn commit(&self, _offset: usize, size: usize) -> usize {
        let mut current = self.committed.load(Ordering::Relaxed);

        loop {
            let granted = size.min(self.limit.saturating_sub(current));
            if granted == 0 {
                return 0;
            }

            match self.committed.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    fn uncommit(&self, _offset: usize, size: usize) -> usize {
        self.committed.fetch_sub(size, Ordering::AcqRel);
        size
    }
}

/// One partition's slice of the physical offset space
struct PhysicalPartition {
    range: VirtualMemory,
    free: Mutex<RangeList>,
}

/// PhysicalMemoryManager - segment allocation and commit accounting
pub struct PhysicalMemoryManager {
    granule_size: usize,
    partitions: Box<[PhysicalPartition]>,
    backing: Arc<dyn PhysicalBacking>,
    committed: AtomicUsize,
}

impl PhysicalMemoryManager {
    /// Create manager with one slice per partition of the given sizes
    pub fn new(partition_sizes: &[usize], granule_size: usize, backing: Arc<dyn PhysicalBacking>) -> Self {
        let mut offset = 0;
        let partitions = partition_sizes
            .iter()
            .map(|&size| {
                let range = VirtualMemory::new(offset, size);
                offset += size;
                PhysicalPartition {
                    range,
                    free: Mutex::new(RangeList::with_range(range)),
                }
            })
            .collect();

        Self {
            granule_size,
            partitions,
            backing,
            committed: AtomicUsize::new(0),
        }
    }

    /// Take `count` segments from partition `numa_id`
    ///
    /// Returns None, taking nothing, if the partition has fewer free segments.
    pub fn alloc(&self, numa_id: usize, count: usize) -> Option<Vec<usize>> {
        let mut free = self.partitions[numa_id].free.lock();
        if free.total() < count * self.granule_size {
            return None;
        }

        let mut segments = Vec::with_capacity(count);
        while segments.len() < count {
            let segment = free.remove_low(self.granule_size)?;
            segments.push(segment.start());
        }

        Some(segments)
    }

    /// Return segments to their partitions' free lists
    pub fn free(&self, segments: &[usize]) {
        for &segment in segments {
            match self.partition_of(segment) {
                Some(index) => self.partitions[index]
                    .free
                    .lock()
                    .insert(VirtualMemory::new(segment, self.granule_size)),
                None => log::error!("Segment {:#x} outside physical space", segment),
            }
        }
    }

    /// Commit segments in order, stopping at the first shortfall
    ///
    /// Returns committed bytes, always a whole number of granules covering
    /// a prefix of `segments`.
    pub fn commit(&self, segments: &[usize]) -> usize {
        let mut committed = 0;

        for run in self.runs(segments) {
            let done = self.backing.commit(run.start(), run.size());
            let whole = crate::util::Alignment::align_down(done, self.granule_size);

            if done > whole {
                // Partially committed granule is useless, hand it back
                self.backing.uncommit(run.start() + whole, done - whole);
            }

            committed += whole;
            if whole < run.size() {
                break;
            }
        }

        self.committed.fetch_add(committed, Ordering::Relaxed);
        committed
    }

    /// Uncommit all segments
    pub fn uncommit(&self, segments: &[usize]) -> usize {
        let mut uncommitted = 0;

        for run in self.runs(segments) {
            uncommitted += self.backing.uncommit(run.start(), run.size());
        }

        self.committed.fetch_sub(uncommitted, Ordering::Relaxed);
        uncommitted
    }

    /// Bytes currently committed
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    /// Bytes of segments handed out and not freed
    pub fn allocated(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.range.size() - p.free.lock().total())
            .sum()
    }

    /// Free bytes in partition `numa_id`
    pub fn free_size(&self, numa_id: usize) -> usize {
        self.partitions[numa_id].free.lock().total()
    }

    fn partition_of(&self, segment: usize) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| segment >= p.range.start() && segment < p.range.end())
    }

    /// Group consecutive segments into contiguous runs
    fn runs(&self, segments: &[usize]) -> Vec<VirtualMemory> {
        let mut runs: Vec<VirtualMemory> = Vec::new();

        for &segment in segments {
            match runs.last_mut() {
                Some(run) if run.end() == segment => {
                    *run = VirtualMemory::new(run.start(), run.size() + self.granule_size);
                }
                _ => runs.push(VirtualMemory::new(segment, self.granule_size)),
            }
        }

        runs
    }
}
