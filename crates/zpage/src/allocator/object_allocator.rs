//! ObjectAllocator - Objects Into Shared Pages
//!
//! Objects are bump-allocated into pages shared between threads:
//! - **Small**: one shared page per CPU slot; a thread picks its slot once
//! - **Medium**: one shared page for everybody, refilled under a lock
//! - **Large**: a dedicated page per object, never shared
//!
//! Installing a new shared page is a compare-and-exchange on the slot. The
//! loser of a race allocates in the winner's page and gives its own page
//! back with `undo_alloc_page`.

use super::page_allocator::PageAllocator;
use crate::page::{AllocationFlags, Page, PageAge, PageType};
use crate::util::constants::OBJECT_ALIGNMENT;
use crate::util::Alignment;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Slot index of the calling thread, assigned on first use
fn current_slot() -> usize {
    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
    }

    SLOT.with(|&slot| slot)
}

/// Slot holding the page new objects go into
#[derive(Default)]
pub struct SharedPageSlot {
    page: RwLock<Option<Arc<Page>>>,
}

impl SharedPageSlot {
    pub fn load(&self) -> Option<Arc<Page>> {
        self.page.read().clone()
    }

    /// Install `new` if the slot still holds `current`
    ///
    /// On failure hands `new` back together with the installed page.
    pub fn compare_exchange(
        &self,
        current: Option<&Arc<Page>>,
        new: Arc<Page>,
    ) -> Result<(), (Arc<Page>, Option<Arc<Page>>)> {
        let mut slot = self.page.write();

        let unchanged = match (slot.as_ref(), current) {
            (Some(installed), Some(expected)) => Arc::ptr_eq(installed, expected),
            (None, None) => true,
            _ => false,
        };

        if unchanged {
            *slot = Some(new);
            Ok(())
        } else {
            Err((new, slot.clone()))
        }
    }

    /// Empty the slot; returns the page it held
    pub fn reset(&self) -> Option<Arc<Page>> {
        self.page.write().take()
    }
}

/// ObjectAllocator - allocates objects of one page age
pub struct ObjectAllocator {
    age: PageAge,
    page_allocator: Arc<PageAllocator>,
    shared_small: Box<[SharedPageSlot]>,
    shared_medium: SharedPageSlot,

    /// Serializes refilling the shared medium page
    medium_lock: Mutex<()>,

    /// Every page allocated and not yet taken
    pages: Mutex<Vec<Arc<Page>>>,

    used: AtomicUsize,
    undone: AtomicUsize,
    undone_pages: AtomicU64,
}

impl ObjectAllocator {
    pub fn new(page_allocator: Arc<PageAllocator>, age: PageAge) -> Self {
        let slots = num_cpus::get().max(1);

        Self {
            age,
            page_allocator,
            shared_small: (0..slots).map(|_| SharedPageSlot::default()).collect(),
            shared_medium: SharedPageSlot::default(),
            medium_lock: Mutex::new(()),
            pages: Mutex::new(Vec::new()),
            used: AtomicUsize::new(0),
            undone: AtomicUsize::new(0),
            undone_pages: AtomicU64::new(0),
        }
    }

    pub fn age(&self) -> PageAge {
        self.age
    }

    /// Allocate `size` bytes, blocking while memory is short
    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        self.alloc_object_with(size, AllocationFlags::new())
    }

    /// Allocate `size` bytes; the size decides the page type
    pub fn alloc_object_with(&self, size: usize, flags: AllocationFlags) -> Option<usize> {
        let config = self.page_allocator.config();

        if size <= config.object_size_limit_small {
            let slot = &self.shared_small[current_slot() % self.shared_small.len()];
            self.alloc_object_in_shared_page(slot, PageType::Small, config.page_size_small(), size, flags)
        } else if size <= config.object_size_limit_medium {
            self.alloc_medium_object(size, flags)
        } else {
            self.alloc_large_object(size, flags)
        }
    }

    fn alloc_page(&self, page_type: PageType, size: usize, flags: AllocationFlags) -> Option<Arc<Page>> {
        let page = Arc::new(self.page_allocator.alloc_page(page_type, size, flags, self.age)?);

        self.used.fetch_add(page.size(), Ordering::Relaxed);
        self.pages.lock().push(page.clone());

        Some(page)
    }

    /// Give back a page that no other thread has seen
    fn undo_alloc_page(&self, page: Arc<Page>) {
        self.pages.lock().retain(|p| !Arc::ptr_eq(p, &page));

        match Arc::try_unwrap(page) {
            Ok(page) => {
                self.undone.fetch_add(page.size(), Ordering::Relaxed);
                self.undone_pages.fetch_add(1, Ordering::Relaxed);
                self.page_allocator.undo_alloc_page(page);
            }
            Err(page) => {
                log::warn!("Page {:#x} is still referenced, keeping it", page.start());
                self.pages.lock().push(page);
            }
        }
    }

    fn alloc_large_object(&self, size: usize, flags: AllocationFlags) -> Option<usize> {
        let page_size = Alignment::align_up(size, self.page_allocator.granule_size());
        let page = self.alloc_page(PageType::Large, page_size, flags)?;

        page.alloc_object(size)
    }

    fn alloc_object_in_shared_page(
        &self,
        slot: &SharedPageSlot,
        page_type: PageType,
        page_size: usize,
        size: usize,
        flags: AllocationFlags,
    ) -> Option<usize> {
        let current = slot.load();
        if let Some(addr) = current.as_ref().and_then(|page| page.alloc_object(size)) {
            return Some(addr);
        }

        let page = self.alloc_page(page_type, page_size, flags)?;
        self.install(slot, current, page, size)
    }

    /// Allocate in `page` and make it the slot's page
    fn install(
        &self,
        slot: &SharedPageSlot,
        mut current: Option<Arc<Page>>,
        mut page: Arc<Page>,
        size: usize,
    ) -> Option<usize> {
        let Some(addr) = page.alloc_object(size) else {
            self.undo_alloc_page(page);
            return None;
        };

        loop {
            match slot.compare_exchange(current.as_ref(), page) {
                Ok(()) => return Some(addr),
                Err((ours, installed)) => {
                    page = ours;

                    // Retired meanwhile, install ours instead
                    let Some(installed) = installed else {
                        current = None;
                        continue;
                    };

                    if let Some(other) = installed.alloc_object(size) {
                        self.undo_alloc_page(page);
                        return Some(other);
                    }

                    current = Some(installed);
                }
            }
        }
    }

    fn alloc_medium_object(&self, size: usize, flags: AllocationFlags) -> Option<usize> {
        let current = self.shared_medium.load();
        if let Some(addr) = current.as_ref().and_then(|page| page.alloc_object(size)) {
            return Some(addr);
        }

        {
            let _guard = self.medium_lock.lock();

            // Another thread may have refilled while we waited
            let current = self.shared_medium.load();
            if let Some(addr) = current.as_ref().and_then(|page| page.alloc_object(size)) {
                return Some(addr);
            }

            let mut non_blocking = flags;
            non_blocking.set_non_blocking();
            if let Some(page) = self.alloc_medium_page(size, non_blocking) {
                return self.install(&self.shared_medium, current, page, size);
            }
        }

        if flags.non_blocking() {
            return None;
        }

        // Stall without the lock, so others keep bumping in the current page
        let page_size = self.page_allocator.config().page_size_medium_max;
        self.alloc_object_in_shared_page(&self.shared_medium, PageType::Medium, page_size, size, flags)
    }

    /// Medium page for an object of `size`, preferring a cached one
    fn alloc_medium_page(&self, size: usize, flags: AllocationFlags) -> Option<Arc<Page>> {
        let config = self.page_allocator.config();

        if config.variable_medium_pages() {
            let mut fast = flags;
            fast.set_fast_medium();

            if let Some(page) = self.alloc_page(PageType::Medium, config.page_size_medium_max, fast) {
                if page.remaining() >= Alignment::align_up(size, OBJECT_ALIGNMENT) {
                    return Some(page);
                }
                self.undo_alloc_page(page);
            }
        }

        self.alloc_page(PageType::Medium, config.page_size_medium_max, flags)
    }

    /// Stop allocating into the current shared pages
    pub fn retire_pages(&self) {
        for slot in self.shared_small.iter() {
            slot.reset();
        }
        self.shared_medium.reset();
    }

    /// Retire the shared pages and hand over every page this allocator made
    ///
    /// Pages another thread still holds stay behind until the next call.
    pub fn take_pages(&self) -> Vec<Page> {
        self.retire_pages();

        let pages = std::mem::take(&mut *self.pages.lock());
        let mut taken = Vec::with_capacity(pages.len());
        let mut kept = Vec::new();

        for page in pages {
            match Arc::try_unwrap(page) {
                Ok(page) => taken.push(page),
                Err(page) => kept.push(page),
            }
        }

        if !kept.is_empty() {
            self.pages.lock().extend(kept);
        }

        taken
    }

    /// Bytes of pages allocated, minus undone pages
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed) - self.undone.load(Ordering::Relaxed)
    }

    /// Free bytes in the calling thread's small page
    pub fn remaining(&self) -> usize {
        self.shared_small[current_slot() % self.shared_small.len()]
            .load()
            .map_or(0, |page| page.remaining())
    }

    pub fn undone_pages(&self) -> u64 {
        self.undone_pages.load(Ordering::Relaxed)
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}
