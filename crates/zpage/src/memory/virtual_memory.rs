//! Virtual Memory Manager - Address Range Bookkeeping
//!
//! Each partition owns a slice of the reserved heap address space and hands
//! out ranges from it lowest-address first. Claiming is separate from
//! mapping: a claimed range has no physical memory behind it until the
//! physical layer maps segments into it.
//!
//! One extra manager covers the multi-partition range used for pages whose
//! memory comes from more than one partition.

use super::range::{RangeList, VirtualMemory};
use parking_lot::Mutex;

/// VirtualMemoryManager - free list over one reserved offset range
pub struct VirtualMemoryManager {
    reserved: VirtualMemory,
    free: Mutex<RangeList>,
}

impl VirtualMemoryManager {
    /// Create manager with the whole reservation free
    pub fn new(reserved: VirtualMemory) -> Self {
        Self {
            reserved,
            free: Mutex::new(RangeList::with_range(reserved)),
        }
    }

    pub fn reserved(&self) -> VirtualMemory {
        self.reserved
    }

    /// Claim `size` bytes at the lowest free address
    pub fn alloc_low_address(&self, size: usize) -> Option<VirtualMemory> {
        self.free.lock().remove_low(size)
    }

    /// Return a range to the free list
    pub fn free(&self, vmem: VirtualMemory) {
        debug_assert!(self.reserved.contains(&vmem), "{:?} outside {:?}", vmem, self.reserved);
        self.free.lock().insert(vmem);
    }

    /// Release `freed` and claim `size` bytes at the lowest free address
    ///
    /// Atomic with respect to other callers: on failure the freed ranges are
    /// taken back out and nothing changes.
    pub fn free_and_alloc_low(&self, freed: &[VirtualMemory], size: usize) -> Option<VirtualMemory> {
        let mut free = self.free.lock();

        for vmem in freed {
            debug_assert!(self.reserved.contains(vmem));
            free.insert(*vmem);
        }

        let claimed = free.remove_low(size);

        if claimed.is_none() {
            for vmem in freed {
                let restored = free.remove_exact(*vmem);
                debug_assert!(restored, "failed to restore {:?}", vmem);
            }
        }

        claimed
    }

    /// Free bytes left in the reservation
    pub fn free_size(&self) -> usize {
        self.free.lock().total()
    }

    /// Lowest free address, if any
    pub fn lowest_free_address(&self) -> Option<usize> {
        self.free.lock().lowest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: usize = 2 * 1024 * 1024;

    #[test]
    fn test_alloc_low_and_free() {
        let manager = VirtualMemoryManager::new(VirtualMemory::new(0, 8 * G));

        let a = manager.alloc_low_address(2 * G).unwrap();
        let b = manager.alloc_low_address(G).unwrap();
        assert_eq!(a, VirtualMemory::new(0, 2 * G));
        assert_eq!(b, VirtualMemory::new(2 * G, G));

        manager.free(a);
        assert_eq!(manager.lowest_free_address(), Some(0));
        assert_eq!(manager.free_size(), 7 * G);
    }

    #[test]
    fn test_free_and_alloc_low_moves_down() {
        let manager = VirtualMemoryManager::new(VirtualMemory::new(0, 8 * G));
        let a = manager.alloc_low_address(G).unwrap();
        let b = manager.alloc_low_address(G).unwrap();
        let c = manager.alloc_low_address(G).unwrap();
        manager.free(b);

        // Fragments a and c plus the hole b form one low range
        let joined = manager.free_and_alloc_low(&[a, c], 3 * G).unwrap();
        assert_eq!(joined, VirtualMemory::new(0, 3 * G));
    }

    #[test]
    fn test_free_and_alloc_low_restores_on_failure() {
        let manager = VirtualMemoryManager::new(VirtualMemory::new(0, 4 * G));
        let a = manager.alloc_low_address(G).unwrap();
        let _rest = manager.alloc_low_address(3 * G).unwrap();

        assert!(manager.free_and_alloc_low(&[a], 2 * G).is_none());
        assert_eq!(manager.free_size(), 0);
    }
}
