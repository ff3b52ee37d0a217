//! Address ranges
//!
//! `VirtualMemory` names a granule-aligned `[start, end)` range of offsets
//! relative to the reserved heap base. `RangeList` is an address-ordered,
//! coalescing set of disjoint ranges used for virtual and physical free lists.

use std::collections::BTreeMap;
use std::fmt;

/// Granule-aligned range of heap offsets
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VirtualMemory {
    start: usize,
    size: usize,
}

impl VirtualMemory {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The first `size` bytes of this range
    pub fn first_part(&self, size: usize) -> Self {
        debug_assert!(size <= self.size);
        Self::new(self.start, size)
    }

    /// Everything from `offset` to the end of this range
    pub fn last_part(&self, offset: usize) -> Self {
        debug_assert!(offset <= self.size);
        Self::new(self.start + offset, self.size - offset)
    }

    /// `size` bytes starting `offset` bytes into this range
    pub fn slice(&self, offset: usize, size: usize) -> Self {
        debug_assert!(offset + size <= self.size);
        Self::new(self.start + offset, size)
    }

    pub fn contains(&self, other: &VirtualMemory) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &VirtualMemory) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Address-ordered set of disjoint ranges, merged on insert
#[derive(Debug, Default, Clone)]
pub struct RangeList {
    /// start -> size
    ranges: BTreeMap<usize, usize>,
    total: usize,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// List holding a single range
    pub fn with_range(range: VirtualMemory) -> Self {
        let mut list = Self::new();
        if !range.is_empty() {
            list.insert(range);
        }
        list
    }

    /// Add a range, merging it with adjacent neighbours
    pub fn insert(&mut self, range: VirtualMemory) {
        debug_assert!(!range.is_empty());

        let mut start = range.start();
        let mut size = range.size();

        if let Some((&prev_start, &prev_size)) = self.ranges.range(..start).next_back() {
            debug_assert!(
                prev_start + prev_size <= start,
                "{:?} overlaps {:?}",
                range,
                VirtualMemory::new(prev_start, prev_size)
            );
            if prev_start + prev_size == start {
                self.ranges.remove(&prev_start);
                start = prev_start;
                size += prev_size;
            }
        }

        debug_assert!(
            self.ranges
                .range(range.start()..)
                .next()
                .map_or(true, |(&next, _)| next >= range.end()),
            "{:?} overlaps its successor",
            range
        );

        if let Some(next_size) = self.ranges.remove(&range.end()) {
            size += next_size;
        }

        self.ranges.insert(start, size);
        self.total += range.size();
    }

    /// Remove `size` bytes from the lowest range large enough
    pub fn remove_low(&mut self, size: usize) -> Option<VirtualMemory> {
        debug_assert!(size > 0);

        let (&start, &range_size) = self.ranges.iter().find(|&(_, &s)| s >= size)?;
        self.ranges.remove(&start);
        if range_size > size {
            self.ranges.insert(start + size, range_size - size);
        }
        self.total -= size;

        Some(VirtualMemory::new(start, size))
    }

    /// Remove a specific range, which must lie inside one listed range
    pub fn remove_exact(&mut self, range: VirtualMemory) -> bool {
        let Some((&start, &size)) = self.ranges.range(..=range.start()).next_back() else {
            return false;
        };

        let containing = VirtualMemory::new(start, size);
        if !containing.contains(&range) {
            return false;
        }

        self.ranges.remove(&start);
        if range.start() > start {
            self.ranges.insert(start, range.start() - start);
        }
        if containing.end() > range.end() {
            self.ranges.insert(range.end(), containing.end() - range.end());
        }
        self.total -= range.size();

        true
    }

    /// Total bytes in the list
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Lowest listed address
    pub fn lowest(&self) -> Option<usize> {
        self.ranges.keys().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = VirtualMemory> + '_ {
        self.ranges
            .iter()
            .map(|(&start, &size)| VirtualMemory::new(start, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(start: usize, size: usize) -> VirtualMemory {
        VirtualMemory::new(start, size)
    }

    #[test]
    fn test_virtual_memory_parts() {
        let range = vm(100, 50);
        assert_eq!(range.end(), 150);
        assert_eq!(range.first_part(20), vm(100, 20));
        assert_eq!(range.last_part(20), vm(120, 30));
        assert_eq!(range.slice(10, 5), vm(110, 5));
        assert!(range.overlaps(&vm(140, 20)));
        assert!(!range.overlaps(&vm(150, 20)));
    }

    #[test]
    fn test_insert_coalesces_neighbours() {
        let mut list = RangeList::new();
        list.insert(vm(0, 10));
        list.insert(vm(20, 10));
        assert_eq!(list.len(), 2);

        list.insert(vm(10, 10));
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next(), Some(vm(0, 30)));
        assert_eq!(list.total(), 30);
    }

    #[test]
    fn test_remove_low_is_first_fit() {
        let mut list = RangeList::new();
        list.insert(vm(0, 10));
        list.insert(vm(30, 40));

        assert_eq!(list.remove_low(20), Some(vm(30, 20)));
        assert_eq!(list.remove_low(10), Some(vm(0, 10)));
        assert_eq!(list.remove_low(30), None);
        assert_eq!(list.total(), 20);
        assert_eq!(list.lowest(), Some(50));
    }

    #[test]
    fn test_remove_exact_splits() {
        let mut list = RangeList::with_range(vm(0, 100));

        assert!(list.remove_exact(vm(40, 20)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![vm(0, 40), vm(60, 40)]);
        assert!(!list.remove_exact(vm(30, 20)));

        list.insert(vm(40, 20));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![vm(0, 100)]);
    }
}
