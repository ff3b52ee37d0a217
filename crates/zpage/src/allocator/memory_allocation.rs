//! MemoryAllocation - one claim against one partition
//!
//! A claim is satisfied in one of two ways:
//! - **from cache**: a single contiguous cached range of exactly `size`
//!   bytes, already committed and mapped
//! - **composed**: `harvested` bytes taken as fragments from the cache plus
//!   `increased_capacity` bytes of new capacity that still have to be
//!   committed and mapped; `harvested + increased_capacity == size`
//!
//! The commit fields record how far the commit step got, so a failure can
//! be rolled back precisely.

use crate::memory::VirtualMemory;

#[derive(Debug, Clone, Default)]
pub struct MemoryAllocation {
    size: usize,
    numa_id: Option<usize>,
    satisfied_from_cache_vmem: Option<VirtualMemory>,
    partial_vmems: Vec<VirtualMemory>,
    harvested: usize,
    increased_capacity: usize,
    committed_capacity: usize,
    commit_failed: bool,
}

impl MemoryAllocation {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Forget everything but the size, ready for another claim
    pub fn reset_for_retry(&mut self) {
        debug_assert!(self.satisfied_from_cache_vmem.is_none());
        debug_assert!(self.partial_vmems.is_empty());

        *self = Self::new(self.size);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Only the fast-medium path changes the size, to the cached range's
    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Owning partition, set by a successful claim
    pub fn numa_id(&self) -> Option<usize> {
        self.numa_id
    }

    pub fn set_partition(&mut self, numa_id: usize) {
        debug_assert!(self.numa_id.is_none(), "partition already set");
        self.numa_id = Some(numa_id);
    }

    pub fn is_satisfied_from_cache(&self) -> bool {
        self.satisfied_from_cache_vmem.is_some()
    }

    pub fn satisfied_from_cache_vmem(&self) -> Option<VirtualMemory> {
        self.satisfied_from_cache_vmem
    }

    pub fn set_satisfied_from_cache_vmem(&mut self, vmem: VirtualMemory) {
        self.satisfied_from_cache_vmem = Some(vmem);
    }

    pub fn take_satisfied_from_cache_vmem(&mut self) -> Option<VirtualMemory> {
        self.satisfied_from_cache_vmem.take()
    }

    /// Harvested fragments; after commit the mapped prefix of the claim
    pub fn partial_vmems(&self) -> &[VirtualMemory] {
        &self.partial_vmems
    }

    pub fn partial_vmems_mut(&mut self) -> &mut Vec<VirtualMemory> {
        &mut self.partial_vmems
    }

    pub fn take_partial_vmems(&mut self) -> Vec<VirtualMemory> {
        std::mem::take(&mut self.partial_vmems)
    }

    pub fn harvested(&self) -> usize {
        self.harvested
    }

    pub fn set_harvested(&mut self, harvested: usize) {
        self.harvested = harvested;
    }

    pub fn increased_capacity(&self) -> usize {
        self.increased_capacity
    }

    pub fn set_increased_capacity(&mut self, increased: usize) {
        self.increased_capacity = increased;
    }

    /// Bytes of the increased capacity actually committed
    pub fn committed_capacity(&self) -> usize {
        self.committed_capacity
    }

    pub fn set_committed_capacity(&mut self, committed: usize) {
        self.committed_capacity = committed;
    }

    pub fn commit_failed(&self) -> bool {
        self.commit_failed
    }

    pub fn set_commit_failed(&mut self) {
        self.commit_failed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_size_only() {
        let mut allocation = MemoryAllocation::new(4096);
        allocation.set_partition(1);
        allocation.set_increased_capacity(4096);
        allocation.set_committed_capacity(2048);
        allocation.set_commit_failed();

        allocation.reset_for_retry();

        assert_eq!(allocation.size(), 4096);
        assert_eq!(allocation.numa_id(), None);
        assert_eq!(allocation.increased_capacity(), 0);
        assert!(!allocation.commit_failed());
    }
}
