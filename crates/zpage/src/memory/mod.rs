//! Memory Module - Virtual, Physical and Mapped Memory
//!
//! The allocator treats three resources separately:
//! - **virtual memory**: offset ranges inside the reserved heap address space
//! - **physical memory**: granule segments that are committed or not
//! - **mappings**: which segment backs which virtual granule
//!
//! Layout of the reserved address space:
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────────────┐
//! │ partition 0  │ partition 1  │ ... │ multi-partition range│
//! │ max * ratio  │ max * ratio  │     │ total max * ratio    │
//! └──────────────┴──────────────┴─────┴──────────────────────┘
//! ```
//!
//! `HeapMemory` holds the shared pieces; each partition owns its own
//! `VirtualMemoryManager`.

pub mod granule_map;
pub mod mapped_cache;
pub mod mapping;
pub mod physical_memory;
pub mod range;
pub mod virtual_memory;

pub use mapped_cache::MappedCache;
pub use mapping::HeapMapping;
pub use physical_memory::{AnonymousBacking, LimitedBacking, PhysicalBacking, PhysicalMemoryManager};
pub use range::{RangeList, VirtualMemory};
pub use virtual_memory::VirtualMemoryManager;

use crate::error::Result;
use granule_map::GranuleMap;
use std::sync::Arc;

/// Shared memory layers used by all partitions
pub struct HeapMemory {
    granule_size: usize,
    mapping: HeapMapping,
    physical: PhysicalMemoryManager,
    granule_map: GranuleMap,
    multi_partition: Option<VirtualMemoryManager>,
}

impl HeapMemory {
    /// Reserve address space for partitions of the given max capacities
    ///
    /// Returns the memory layers and each partition's virtual reservation.
    pub fn reserve(
        partition_max: &[usize],
        granule_size: usize,
        virtual_ratio: usize,
        multi_partition: bool,
        backing: Arc<dyn PhysicalBacking>,
    ) -> Result<(Self, Vec<VirtualMemory>)> {
        let mut reservations = Vec::with_capacity(partition_max.len());
        let mut offset = 0;

        for &max in partition_max {
            let size = max * virtual_ratio;
            reservations.push(VirtualMemory::new(offset, size));
            offset += size;
        }

        let total_max: usize = partition_max.iter().sum();
        let multi_partition = (multi_partition && partition_max.len() > 1).then(|| {
            let size = total_max * virtual_ratio;
            let range = VirtualMemory::new(offset, size);
            offset += size;
            VirtualMemoryManager::new(range)
        });

        let mapping = HeapMapping::reserve(offset, granule_size)?;

        Ok((
            Self {
                granule_size,
                mapping,
                physical: PhysicalMemoryManager::new(partition_max, granule_size, backing),
                granule_map: GranuleMap::new(offset, granule_size),
                multi_partition,
            },
            reservations,
        ))
    }

    pub fn granule_size(&self) -> usize {
        self.granule_size
    }

    /// Address of heap offset `offset`
    pub fn address(&self, offset: usize) -> usize {
        self.mapping.address(offset)
    }

    /// Manager of the multi-partition range, if enabled
    pub fn multi_partition(&self) -> Option<&VirtualMemoryManager> {
        self.multi_partition.as_ref()
    }

    pub fn physical(&self) -> &PhysicalMemoryManager {
        &self.physical
    }

    pub fn mapping(&self) -> &HeapMapping {
        &self.mapping
    }

    /// Attach physical segments of partition `numa_id` to `vmem`
    pub fn claim_physical(&self, numa_id: usize, vmem: VirtualMemory) -> bool {
        match self.physical.alloc(numa_id, vmem.size() / self.granule_size) {
            Some(segments) => {
                self.granule_map.insert(vmem, &segments);
                true
            }
            None => false,
        }
    }

    /// Commit the segments behind `vmem`; returns committed bytes
    pub fn commit_physical(&self, vmem: VirtualMemory) -> usize {
        self.physical.commit(&self.granule_map.segments(vmem))
    }

    pub fn uncommit_physical(&self, vmem: VirtualMemory) -> usize {
        self.physical.uncommit(&self.granule_map.segments(vmem))
    }

    /// Detach and free the segments behind `vmem`
    pub fn free_physical(&self, vmem: VirtualMemory) {
        self.physical.free(&self.granule_map.take(vmem));
    }

    pub fn map(&self, vmem: VirtualMemory) {
        self.mapping.map(vmem);
    }

    pub fn unmap(&self, vmem: VirtualMemory) {
        self.mapping.unmap(vmem);
    }

    /// Detach the segments behind `vmem`, keeping them committed
    pub fn take_segments(&self, vmem: VirtualMemory) -> Vec<usize> {
        self.granule_map.take(vmem)
    }

    /// Attach already committed segments to `vmem`, in order
    pub fn put_segments(&self, vmem: VirtualMemory, segments: &[usize]) {
        self.granule_map.insert(vmem, segments);
    }

    pub fn is_backed(&self, vmem: VirtualMemory) -> bool {
        self.granule_map.is_backed(vmem)
    }

    /// Move the memory behind `from` to `to` and map it there
    pub fn remap(&self, from: VirtualMemory, to: VirtualMemory) {
        debug_assert_eq!(from.size(), to.size());
        let segments = self.take_segments(from);
        self.mapping.unmap(from);
        self.put_segments(to, &segments);
        self.mapping.map(to);
    }

    pub fn pretouch(&self, vmem: VirtualMemory, workers: usize) {
        self.mapping.pretouch(vmem, workers);
    }
}
