//! Page Module - Units of Heap Memory Handed to Allocators
//!
//! A page is a granule-aligned, contiguous, mapped range of the heap with a
//! bump pointer. Pages come from the `PageAllocator` and go back to it
//! through `free_page`, `free_pages` or `undo_alloc_page`; whoever holds the
//! `Page` value owns it.
//!
//! Most pages draw all their memory from one partition. A multi-partition
//! page remembers how many bytes each partition contributed, in address
//! order, so freeing can return every part to its owner.

pub mod types;

pub use types::{AllocationFlags, PageAge, PageType};

use crate::generation::GenerationId;
use crate::memory::VirtualMemory;
use crate::util::constants::OBJECT_ALIGNMENT;
use crate::util::Alignment;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Contribution of one partition to a multi-partition page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPart {
    pub numa_id: usize,
    pub size: usize,
}

/// Which partition(s) a page's memory belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePartition {
    Single(usize),
    /// Parts in address order; sizes sum to the page size
    Multi(Vec<PartitionPart>),
}

/// Page - bump-allocated range of the heap
pub struct Page {
    page_type: PageType,
    age: PageAge,
    vmem: VirtualMemory,

    /// Absolute address of the first byte
    start: usize,

    /// Next free address
    top: AtomicUsize,

    partition: PagePartition,
}

impl Page {
    pub(crate) fn new(
        page_type: PageType,
        age: PageAge,
        vmem: VirtualMemory,
        start: usize,
        partition: PagePartition,
    ) -> Self {
        debug_assert!(match &partition {
            PagePartition::Single(_) => true,
            PagePartition::Multi(parts) => parts.iter().map(|p| p.size).sum::<usize>() == vmem.size(),
        });

        Self {
            page_type,
            age,
            vmem,
            start,
            top: AtomicUsize::new(start),
            partition,
        }
    }

    /// Bump-allocate `size` bytes; safe to call from many threads
    ///
    /// Returns None when the page does not have room left.
    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        let aligned = Alignment::align_up(size, OBJECT_ALIGNMENT);
        let end = self.end();
        let mut top = self.top.load(Ordering::Relaxed);

        loop {
            let new_top = top.checked_add(aligned)?;
            if new_top > end {
                return None;
            }

            match self
                .top
                .compare_exchange_weak(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(top),
                Err(actual) => top = actual,
            }
        }
    }

    /// Roll back the most recent allocation of `size` bytes at `addr`
    ///
    /// Only succeeds if nothing was allocated after it.
    pub fn undo_alloc_object(&self, addr: usize, size: usize) -> bool {
        let aligned = Alignment::align_up(size, OBJECT_ALIGNMENT);
        self.top
            .compare_exchange(addr + aligned, addr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn age(&self) -> PageAge {
        self.age
    }

    pub fn generation_id(&self) -> GenerationId {
        self.age.generation_id()
    }

    /// Address of the first byte
    pub fn start(&self) -> usize {
        self.start
    }

    /// Address one past the last byte
    pub fn end(&self) -> usize {
        self.start + self.vmem.size()
    }

    pub fn size(&self) -> usize {
        self.vmem.size()
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.top() - self.start
    }

    /// Bytes still free
    pub fn remaining(&self) -> usize {
        self.end() - self.top()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Owning partition, None for multi-partition pages
    pub fn numa_id(&self) -> Option<usize> {
        match self.partition {
            PagePartition::Single(numa_id) => Some(numa_id),
            PagePartition::Multi(_) => None,
        }
    }

    pub fn is_multi_partition(&self) -> bool {
        matches!(self.partition, PagePartition::Multi(_))
    }

    pub fn partition(&self) -> &PagePartition {
        &self.partition
    }

    pub(crate) fn vmem(&self) -> VirtualMemory {
        self.vmem
    }

    /// Same memory and contents under a new age, for in-place promotion
    pub(crate) fn with_age(self, age: PageAge) -> Page {
        Page { age, ..self }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("type", &self.page_type)
            .field("age", &self.age)
            .field("start", &format_args!("{:#x}", self.start))
            .field("size", &self.size())
            .field("used", &self.used())
            .field("partition", &self.partition)
            .finish()
    }
}
