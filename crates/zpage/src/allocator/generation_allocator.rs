//! Generation allocators
//!
//! Thin front ends over `ObjectAllocator`:
//! - `EdenAllocator` serves mutator threads and may stall
//! - `RelocationAllocator` serves the collector while it moves objects and
//!   never stalls: a failed relocation allocation makes the collector fall
//!   back to relocating in place

use super::object_allocator::ObjectAllocator;
use super::page_allocator::PageAllocator;
use crate::page::{AllocationFlags, Page, PageAge, PageType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// EdenAllocator - mutator allocation into young eden pages
pub struct EdenAllocator {
    objects: ObjectAllocator,
    tlab_bytes: AtomicUsize,
}

impl EdenAllocator {
    pub fn new(page_allocator: Arc<PageAllocator>) -> Self {
        Self {
            objects: ObjectAllocator::new(page_allocator, PageAge::EDEN),
            tlab_bytes: AtomicUsize::new(0),
        }
    }

    /// Allocate a thread-local allocation buffer
    ///
    /// Pages are picked exactly as for an object of `size` bytes; the
    /// mutator bump-allocates inside the buffer itself. Only the byte count
    /// handed out as TLABs is kept apart.
    pub fn alloc_tlab(&self, size: usize) -> Option<usize> {
        let addr = self.objects.alloc_object(size)?;
        self.tlab_bytes.fetch_add(size, Ordering::Relaxed);
        Some(addr)
    }

    /// Bytes handed out as TLABs since creation
    pub fn tlab_bytes(&self) -> usize {
        self.tlab_bytes.load(Ordering::Relaxed)
    }

    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        self.objects.alloc_object(size)
    }

    pub fn alloc_object_with(&self, size: usize, flags: AllocationFlags) -> Option<usize> {
        self.objects.alloc_object_with(size, flags)
    }

    /// Free bytes in the calling thread's small page
    pub fn remaining(&self) -> usize {
        self.objects.remaining()
    }

    pub fn used(&self) -> usize {
        self.objects.used()
    }

    pub fn retire_pages(&self) {
        self.objects.retire_pages();
    }

    pub fn take_pages(&self) -> Vec<Page> {
        self.objects.take_pages()
    }

    pub fn objects(&self) -> &ObjectAllocator {
        &self.objects
    }
}

/// RelocationAllocator - collector allocation into survivor or old pages
pub struct RelocationAllocator {
    objects: ObjectAllocator,
    page_allocator: Arc<PageAllocator>,
}

fn relocation_flags() -> AllocationFlags {
    let mut flags = AllocationFlags::new();
    flags.set_non_blocking();
    flags.set_gc_relocation();
    flags
}

impl RelocationAllocator {
    pub fn new(page_allocator: Arc<PageAllocator>, age: PageAge) -> Self {
        debug_assert!(!age.is_eden(), "eden is not a relocation target");

        Self {
            objects: ObjectAllocator::new(page_allocator.clone(), age),
            page_allocator,
        }
    }

    pub fn age(&self) -> PageAge {
        self.objects.age()
    }

    /// Allocate room for a relocated object; never stalls
    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        self.objects.alloc_object_with(size, relocation_flags())
    }

    /// Allocate a whole target page, for relocating a page's live objects
    /// in one go
    pub fn alloc_page_for_relocation(&self, page_type: PageType, size: usize) -> Option<Page> {
        self.page_allocator
            .alloc_page(page_type, size, relocation_flags(), self.objects.age())
    }

    pub fn used(&self) -> usize {
        self.objects.used()
    }

    pub fn retire_pages(&self) {
        self.objects.retire_pages();
    }

    pub fn take_pages(&self) -> Vec<Page> {
        self.objects.take_pages()
    }
}
