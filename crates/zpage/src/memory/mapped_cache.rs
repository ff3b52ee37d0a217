//! Mapped Cache - free memory that is still committed and mapped
//!
//! A partition keeps the memory of freed pages here so the next allocation
//! can reuse it without touching the OS. Ranges are coalesced on insert
//! and indexed twice:
//! - by address, for coalescing and for uncommitting the highest ranges
//! - by (size, address), for best-fit contiguous removal
//!
//! The min-size watermark records the smallest size the cache reached since
//! it was last reset. Memory below the watermark sat unused for the whole
//! period and may be uncommitted.

use super::range::VirtualMemory;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct MappedCache {
    /// start -> size
    by_address: BTreeMap<usize, usize>,
    /// (size, start)
    by_size: BTreeSet<(usize, usize)>,
    size: usize,
    min_size_watermark: usize,
}

impl MappedCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_range(&mut self, start: usize, size: usize) {
        self.by_address.insert(start, size);
        self.by_size.insert((size, start));
    }

    fn remove_range(&mut self, start: usize, size: usize) {
        self.by_address.remove(&start);
        self.by_size.remove(&(size, start));
    }

    fn on_removed(&mut self, size: usize) {
        self.size -= size;
        self.min_size_watermark = self.min_size_watermark.min(self.size);
    }

    /// Insert a mapped range, merging with adjacent cached ranges
    pub fn insert(&mut self, vmem: VirtualMemory) {
        debug_assert!(!vmem.is_empty());

        let mut start = vmem.start();
        let mut size = vmem.size();

        if let Some((&prev_start, &prev_size)) = self.by_address.range(..start).next_back() {
            debug_assert!(prev_start + prev_size <= start, "{:?} already cached", vmem);
            if prev_start + prev_size == start {
                self.remove_range(prev_start, prev_size);
                start = prev_start;
                size += prev_size;
            }
        }

        if let Some(&next_size) = self.by_address.get(&vmem.end()) {
            self.remove_range(vmem.end(), next_size);
            size += next_size;
        }

        self.add_range(start, size);
        self.size += vmem.size();
    }

    /// Remove exactly `size` contiguous bytes, best fit, lowest address
    pub fn remove_contiguous(&mut self, size: usize) -> Option<VirtualMemory> {
        let &(range_size, start) = self.by_size.range((size, 0)..).next()?;

        self.remove_range(start, range_size);
        if range_size > size {
            self.add_range(start + size, range_size - size);
        }
        self.on_removed(size);

        Some(VirtualMemory::new(start, size))
    }

    /// Remove the largest power-of-two range in `[min_size, max_size]`
    pub fn remove_contiguous_power_of_two(
        &mut self,
        min_size: usize,
        max_size: usize,
    ) -> Option<VirtualMemory> {
        debug_assert!(min_size.is_power_of_two() && max_size.is_power_of_two());

        let mut size = max_size;
        while size >= min_size {
            if let Some(vmem) = self.remove_contiguous(size) {
                return Some(vmem);
            }
            size >>= 1;
        }

        None
    }

    /// Harvest up to `size` bytes from any ranges, smallest first
    ///
    /// Returns the number of bytes harvested; the ranges go into `out`.
    pub fn remove_discontiguous(&mut self, size: usize, out: &mut Vec<VirtualMemory>) -> usize {
        let mut harvested = 0;

        while harvested < size {
            let Some(&(range_size, start)) = self.by_size.iter().next() else {
                break;
            };

            let take = range_size.min(size - harvested);
            self.remove_range(start, range_size);
            if range_size > take {
                self.add_range(start + take, range_size - take);
            }
            self.on_removed(take);

            out.push(VirtualMemory::new(start, take));
            harvested += take;
        }

        harvested
    }

    /// Remove up to `size` bytes from the highest addresses
    ///
    /// The watermark drops by the amount removed.
    pub fn remove_for_uncommit(&mut self, size: usize, out: &mut Vec<VirtualMemory>) -> usize {
        let mut removed = 0;

        while removed < size {
            let Some((&start, &range_size)) = self.by_address.iter().next_back() else {
                break;
            };

            let take = range_size.min(size - removed);
            self.remove_range(start, range_size);
            if range_size > take {
                self.add_range(start, range_size - take);
            }
            // Uncommitted memory comes out of the idle part
            self.size -= take;
            self.min_size_watermark = self.min_size_watermark.saturating_sub(take);

            out.push(VirtualMemory::new(start + range_size - take, take));
            removed += take;
        }

        removed
    }

    /// Total cached bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Smallest size since the last reset
    pub fn min_size_watermark(&self) -> usize {
        self.min_size_watermark
    }

    pub fn reset_min_size_watermark(&mut self) {
        self.min_size_watermark = self.size;
    }

    /// Cached ranges in address order
    pub fn ranges(&self) -> impl Iterator<Item = VirtualMemory> + '_ {
        self.by_address
            .iter()
            .map(|(&start, &size)| VirtualMemory::new(start, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: usize = 2 * 1024 * 1024;

    fn vm(start_granule: usize, granules: usize) -> VirtualMemory {
        VirtualMemory::new(start_granule * G, granules * G)
    }

    #[test]
    fn test_insert_coalesces() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 1));
        cache.insert(vm(2, 1));
        cache.insert(vm(1, 1));

        assert_eq!(cache.ranges().collect::<Vec<_>>(), vec![vm(0, 3)]);
        assert_eq!(cache.size(), 3 * G);
    }

    #[test]
    fn test_remove_contiguous_best_fit() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 4));
        cache.insert(vm(10, 1));
        cache.insert(vm(20, 2));

        assert_eq!(cache.remove_contiguous(G), Some(vm(10, 1)));
        assert_eq!(cache.remove_contiguous(2 * G), Some(vm(20, 2)));
        assert_eq!(cache.remove_contiguous(3 * G), Some(vm(0, 3)));
        assert_eq!(cache.remove_contiguous(2 * G), None);
        assert_eq!(cache.size(), G);
    }

    #[test]
    fn test_remove_power_of_two() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 3));

        // 4 granules does not fit, 2 does
        assert_eq!(cache.remove_contiguous_power_of_two(2 * G, 4 * G), Some(vm(0, 2)));
        assert_eq!(cache.remove_contiguous_power_of_two(2 * G, 4 * G), None);
    }

    #[test]
    fn test_remove_discontiguous_harvests_smallest_first() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 3));
        cache.insert(vm(5, 1));

        let mut out = Vec::new();
        assert_eq!(cache.remove_discontiguous(2 * G, &mut out), 2 * G);
        assert_eq!(out, vec![vm(5, 1), vm(0, 1)]);
        assert_eq!(cache.ranges().collect::<Vec<_>>(), vec![vm(1, 2)]);
    }

    #[test]
    fn test_remove_for_uncommit_takes_highest() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 2));
        cache.insert(vm(4, 2));

        let mut out = Vec::new();
        assert_eq!(cache.remove_for_uncommit(3 * G, &mut out), 3 * G);
        assert_eq!(out, vec![vm(4, 2), vm(1, 1)]);
        assert_eq!(cache.ranges().collect::<Vec<_>>(), vec![vm(0, 1)]);
    }

    #[test]
    fn test_min_size_watermark() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 4));
        assert_eq!(cache.min_size_watermark(), 0);

        cache.reset_min_size_watermark();
        assert_eq!(cache.min_size_watermark(), 4 * G);

        cache.remove_contiguous(G);
        cache.insert(vm(0, 1));
        assert_eq!(cache.size(), 4 * G);
        assert_eq!(cache.min_size_watermark(), 3 * G);
    }

    #[test]
    fn test_uncommit_lowers_watermark() {
        let mut cache = MappedCache::new();
        cache.insert(vm(0, 4));
        cache.reset_min_size_watermark();
        cache.remove_contiguous(2 * G);
        cache.insert(vm(0, 2));
        assert_eq!(cache.min_size_watermark(), 2 * G);

        let mut out = Vec::new();
        assert_eq!(cache.remove_for_uncommit(G, &mut out), G);
        assert_eq!(cache.min_size_watermark(), G);
        assert_eq!(cache.size(), 3 * G);
        assert_eq!(out, vec![vm(3, 1)]);
    }
}
