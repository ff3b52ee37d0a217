//! Test Utilities for the zpage Test Suite
//!
//! Small heaps with a recording collector driver, so tests can fill the
//! heap with a handful of pages and observe stalls deterministically.
//!
//! ============================================================================
//! Every fixture runs without uncommit threads unless a test asks for them.
//! ============================================================================

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zpage::util::constants::MB;
use zpage::{
    AllocationFlags, AllocatorConfig, GcCause, GcDriver, Heap, PageAllocator, PageAge,
    PhysicalBacking, Page, PageType,
};

/// Granule size of every test heap
pub const G: usize = 2 * MB;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// ============================================================================
/// RECORDING DRIVER
/// ============================================================================

/// Collector stand-in that records every request
#[derive(Default)]
pub struct RecordingDriver {
    minor: AtomicU64,
    major: AtomicU64,
    causes: Mutex<Vec<GcCause>>,
}

impl RecordingDriver {
    pub fn minor(&self) -> u64 {
        self.minor.load(Ordering::SeqCst)
    }

    pub fn major(&self) -> u64 {
        self.major.load(Ordering::SeqCst)
    }

    pub fn causes(&self) -> Vec<GcCause> {
        self.causes.lock().clone()
    }
}

impl GcDriver for RecordingDriver {
    fn request_minor(&self, cause: GcCause) {
        self.causes.lock().push(cause);
        self.minor.fetch_add(1, Ordering::SeqCst);
    }

    fn request_major(&self, cause: GcCause) {
        self.causes.lock().push(cause);
        self.major.fetch_add(1, Ordering::SeqCst);
    }
}

/// ============================================================================
/// HEAP FIXTURE
/// ============================================================================

/// Small heap plus the driver it reports to
pub struct HeapFixture {
    pub heap: Arc<Heap>,
    pub driver: Arc<RecordingDriver>,
}

impl HeapFixture {
    /// Configuration of `max_granules` granules over `partitions` partitions
    ///
    /// Medium pages are 2-4 granules so they fit in tiny heaps.
    pub fn config(partitions: usize, max_granules: usize) -> AllocatorConfig {
        AllocatorConfig {
            max_capacity: max_granules * G,
            soft_max_capacity: max_granules * G,
            min_capacity: 0,
            initial_capacity: 0,
            granule_size: G,
            page_size_medium_min: 2 * G,
            page_size_medium_max: 4 * G,
            object_size_limit_small: G / 8,
            object_size_limit_medium: 4 * G / 8,
            numa_aware: false,
            numa_partitions: Some(partitions),
            uncommit: false,
            gc_threads: Some(1),
            ..Default::default()
        }
    }

    /// Create fixture with `max_granules` granules over `partitions` partitions
    ///
    /// **Bug this finds:** Configuration validation bugs, initialization failures
    pub fn new(partitions: usize, max_granules: usize) -> Self {
        Self::with_config(Self::config(partitions, max_granules), None)
    }

    /// Create fixture whose physical memory runs out at `limit` bytes
    ///
    /// **Bug this finds:** Commit failure handling, capacity ceiling bugs
    pub fn with_commit_limit(partitions: usize, max_granules: usize, limit: usize) -> Self {
        Self::with_config(
            Self::config(partitions, max_granules),
            Some(Arc::new(zpage::LimitedBacking::new(limit))),
        )
    }

    pub fn with_config(config: AllocatorConfig, backing: Option<Arc<dyn PhysicalBacking>>) -> Self {
        let driver = Arc::new(RecordingDriver::default());

        let mut builder = Heap::builder(config).driver(driver.clone());
        if let Some(backing) = backing {
            builder = builder.backing(backing);
        }

        let heap = Arc::new(
            builder
                .build()
                .expect("heap initialization should succeed with a valid config"),
        );

        Self { heap, driver }
    }

    pub fn allocator(&self) -> &PageAllocator {
        self.heap.page_allocator()
    }

    /// Allocate a young page of `granules` granules
    pub fn alloc(&self, page_type: PageType, granules: usize, flags: AllocationFlags) -> Option<Page> {
        self.allocator()
            .alloc_page(page_type, granules * G, flags, PageAge::EDEN)
    }

    /// Allocate a young page that must succeed without stalling
    ///
    /// **Bug this finds:** Capacity accounting that refuses memory it has
    #[track_caller]
    pub fn alloc_now(&self, page_type: PageType, granules: usize) -> Page {
        self.alloc(page_type, granules, non_blocking())
            .unwrap_or_else(|| panic!("{} granule {} page should fit", granules, page_type))
    }

    /// Fill the heap with single-granule pages
    pub fn fill(&self) -> Vec<Page> {
        let mut pages = Vec::new();
        while let Some(page) = self.alloc(PageType::Small, 1, non_blocking()) {
            pages.push(page);
        }
        pages
    }

    /// Check the accounting invariants, panicking with the violation
    #[track_caller]
    pub fn verify(&self) {
        if let Err(e) = self.allocator().verify() {
            panic!("accounting broken: {}", e);
        }
    }
}

/// ============================================================================
/// HELPERS
/// ============================================================================

pub fn non_blocking() -> AllocationFlags {
    let mut flags = AllocationFlags::new();
    flags.set_non_blocking();
    flags
}

/// Poll `condition` until it holds or `TEST_TIMEOUT` passes
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }

    condition()
}

/// Start a blocking page allocation on its own thread
pub fn spawn_blocking_alloc(
    heap: &Arc<Heap>,
    granules: usize,
) -> thread::JoinHandle<Option<Page>> {
    let heap = heap.clone();
    let page_type = if granules == 1 { PageType::Small } else { PageType::Large };

    thread::spawn(move || heap.alloc_page(page_type, granules * G, AllocationFlags::new(), PageAge::EDEN))
}
