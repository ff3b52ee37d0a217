//! Granule Map - virtual granule to physical segment table
//!
//! One atomic slot per granule of the reserved address space. A slot holds
//! the physical offset of the segment backing that granule, or `UNMAPPED`.

use super::range::VirtualMemory;
use std::sync::atomic::{AtomicUsize, Ordering};

const UNMAPPED: usize = usize::MAX;

pub struct GranuleMap {
    granule_shift: u32,
    entries: Box<[AtomicUsize]>,
}

impl GranuleMap {
    pub fn new(reserved_size: usize, granule_size: usize) -> Self {
        debug_assert!(granule_size.is_power_of_two());
        let count = reserved_size / granule_size;

        Self {
            granule_shift: granule_size.trailing_zeros(),
            entries: (0..count).map(|_| AtomicUsize::new(UNMAPPED)).collect(),
        }
    }

    fn indices(&self, vmem: VirtualMemory) -> std::ops::Range<usize> {
        let first = vmem.start() >> self.granule_shift;
        first..first + (vmem.size() >> self.granule_shift)
    }

    /// Physical segment behind the granule at `offset`
    pub fn get(&self, offset: usize) -> Option<usize> {
        let segment = self.entries[offset >> self.granule_shift].load(Ordering::Acquire);
        (segment != UNMAPPED).then_some(segment)
    }

    /// Record `segments` for consecutive granules starting at `vmem`
    pub fn insert(&self, vmem: VirtualMemory, segments: &[usize]) {
        let indices = self.indices(vmem);
        debug_assert_eq!(indices.len(), segments.len());

        for (index, &segment) in indices.zip(segments) {
            let prev = self.entries[index].swap(segment, Ordering::AcqRel);
            debug_assert_eq!(prev, UNMAPPED, "granule {} already backed", index);
        }
    }

    /// Whether every granule of `vmem` has a segment
    pub fn is_backed(&self, vmem: VirtualMemory) -> bool {
        self.indices(vmem)
            .all(|index| self.entries[index].load(Ordering::Acquire) != UNMAPPED)
    }

    /// Segments backing `vmem`, in address order
    pub fn segments(&self, vmem: VirtualMemory) -> Vec<usize> {
        self.indices(vmem)
            .map(|index| {
                let segment = self.entries[index].load(Ordering::Acquire);
                debug_assert_ne!(segment, UNMAPPED, "granule {} not backed", index);
                segment
            })
            .collect()
    }

    /// Segments backing `vmem`, clearing the slots
    pub fn take(&self, vmem: VirtualMemory) -> Vec<usize> {
        self.indices(vmem)
            .map(|index| {
                let segment = self.entries[index].swap(UNMAPPED, Ordering::AcqRel);
                debug_assert_ne!(segment, UNMAPPED, "granule {} not backed", index);
                segment
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: usize = 4096;

    #[test]
    fn test_insert_take() {
        let map = GranuleMap::new(8 * G, G);
        let vmem = VirtualMemory::new(2 * G, 2 * G);

        map.insert(vmem, &[7 * G, 3 * G]);
        assert_eq!(map.get(2 * G), Some(7 * G));
        assert_eq!(map.get(3 * G), Some(3 * G));
        assert_eq!(map.get(4 * G), None);
        assert_eq!(map.segments(vmem), vec![7 * G, 3 * G]);
        assert!(map.is_backed(vmem));
        assert!(!map.is_backed(VirtualMemory::new(3 * G, 2 * G)));

        assert_eq!(map.take(vmem), vec![7 * G, 3 * G]);
        assert_eq!(map.get(2 * G), None);
        assert!(!map.is_backed(vmem));
    }
}
