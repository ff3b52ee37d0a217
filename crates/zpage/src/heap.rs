//! Heap - The Allocator Context
//!
//! `Heap` wires the pieces together and is the one object an embedder
//! keeps: page allocator, both generations, cycle counters and the
//! uncommit threads. There is no global state; everything reachable from a
//! `Heap` belongs to it.
//!
//! ```rust,no_run
//! use zpage::{AllocatorConfig, Heap};
//!
//! # fn main() -> zpage::Result<()> {
//! let heap = Heap::new(AllocatorConfig::default())?;
//! let addr = heap.alloc_object(64)?;
//! assert_ne!(addr, 0);
//! # Ok(())
//! # }
//! ```

use crate::allocator::{EdenAllocator, PageAllocator, PageAllocatorStats, Uncommitter};
use crate::config::AllocatorConfig;
use crate::error::{Result, ZError};
use crate::generation::{CycleCounters, GcDriver, Generation, GenerationId, LoggingDriver};
use crate::logging::{AllocEvent, EventLog, EventLogConfig};
use crate::memory::{AnonymousBacking, PhysicalBacking};
use crate::page::{AllocationFlags, Page, PageAge, PageType};
use crate::stats::AllocatorMetrics;
use crate::util::to_mb;
use std::sync::Arc;

/// Builder for a `Heap` with custom collaborators
pub struct HeapBuilder {
    config: AllocatorConfig,
    driver: Option<Arc<dyn GcDriver>>,
    backing: Option<Arc<dyn PhysicalBacking>>,
    events: Option<Arc<EventLog>>,
}

impl HeapBuilder {
    /// Collector that receives collection requests
    ///
    /// Default: `LoggingDriver`
    pub fn driver(mut self, driver: Arc<dyn GcDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Source of physical memory
    ///
    /// Default: `AnonymousBacking`
    pub fn backing(mut self, backing: Arc<dyn PhysicalBacking>) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Heap> {
        let config = Arc::new(self.config);

        let driver: Arc<dyn GcDriver> = match self.driver {
            Some(driver) => driver,
            None => Arc::new(LoggingDriver::new()),
        };
        let backing: Arc<dyn PhysicalBacking> = match self.backing {
            Some(backing) => backing,
            None => Arc::new(AnonymousBacking),
        };
        let events = match self.events {
            Some(events) => events,
            None => Arc::new(EventLog::new(EventLogConfig {
                console: config.verbose,
                ..Default::default()
            })),
        };

        let cycles = Arc::new(CycleCounters::new());
        let page_allocator = Arc::new(PageAllocator::new(
            config.clone(),
            driver,
            backing,
            events,
            cycles.clone(),
        )?);

        let mut uncommitters = Vec::new();
        if config.uncommit {
            for numa_id in 0..page_allocator.partition_count() {
                uncommitters.push(Uncommitter::start(
                    Arc::downgrade(&page_allocator),
                    numa_id,
                    config.uncommit_delay,
                )?);
            }
        }

        Ok(Heap {
            young: Generation::young(page_allocator.clone(), cycles.clone()),
            old: Generation::old(page_allocator.clone(), cycles.clone()),
            config,
            page_allocator,
            cycles,
            uncommitters,
        })
    }
}

/// Heap - allocator context for one collected heap
pub struct Heap {
    config: Arc<AllocatorConfig>,
    page_allocator: Arc<PageAllocator>,
    young: Generation,
    old: Generation,
    cycles: Arc<CycleCounters>,
    uncommitters: Vec<Uncommitter>,
}

impl Heap {
    /// Create a heap with default collaborators
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: AllocatorConfig) -> HeapBuilder {
        HeapBuilder {
            config,
            driver: None,
            backing: None,
            events: None,
        }
    }

    fn eden(&self) -> Result<&EdenAllocator> {
        self.young
            .eden()
            .ok_or_else(|| ZError::InvariantViolation("young generation without eden".to_string()))
    }

    fn out_of_memory(&self, requested: usize) -> ZError {
        let used = self.page_allocator.used();

        log::warn!(
            "Out of memory: {} bytes requested, {}M used of {}M",
            requested,
            to_mb(used),
            to_mb(self.page_allocator.capacity())
        );
        self.page_allocator.events().log(AllocEvent::OutOfMemory {
            requested,
            used,
            capacity: self.page_allocator.capacity(),
        });

        ZError::OutOfMemory { requested, used }
    }

    /// Allocate a young object; stalls while memory is short
    pub fn alloc_object(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(ZError::InvalidArgument("object size must be > 0".to_string()));
        }

        self.eden()?
            .alloc_object(size)
            .ok_or_else(|| self.out_of_memory(size))
    }

    /// Allocate a thread-local allocation buffer in eden
    pub fn alloc_tlab(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(ZError::InvalidArgument("TLAB size must be > 0".to_string()));
        }

        self.eden()?
            .alloc_tlab(size)
            .ok_or_else(|| self.out_of_memory(size))
    }

    /// Allocate room to relocate an object to `age`; never stalls
    pub fn alloc_for_relocation(&self, size: usize, age: PageAge) -> Option<usize> {
        self.generation(age.generation_id())
            .relocation_allocator(age)?
            .alloc_object(size)
    }

    pub fn alloc_page(
        &self,
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
        age: PageAge,
    ) -> Option<Page> {
        self.page_allocator.alloc_page(page_type, size, flags, age)
    }

    pub fn free_page(&self, page: Page) {
        self.page_allocator.free_page(page);
    }

    pub fn free_pages(&self, generation: GenerationId, pages: Vec<Page>) {
        self.page_allocator.free_pages(generation, pages);
    }

    pub fn undo_alloc_page(&self, page: Page) {
        self.page_allocator.undo_alloc_page(page);
    }

    /// Turn a young page into an old one without moving its objects
    pub fn promote_in_place(&self, page: Page) -> Page {
        if page.age().is_old() {
            return page;
        }

        self.page_allocator.promote_used(page.size());
        page.with_age(PageAge::OLD)
    }

    /// Start a collection cycle of `generation`
    pub fn begin_cycle(&self, generation: GenerationId) -> u32 {
        self.generation(generation).begin_cycle()
    }

    pub fn handle_alloc_stalling_for_young(&self) {
        self.page_allocator.handle_alloc_stalling_for_young();
    }

    pub fn handle_alloc_stalling_for_old(&self, cleared_all_soft_refs: bool) {
        self.page_allocator
            .handle_alloc_stalling_for_old(cleared_all_soft_refs);
    }

    pub fn is_alloc_stalling(&self) -> bool {
        self.page_allocator.is_alloc_stalling()
    }

    pub fn is_alloc_stalling_for_old(&self) -> bool {
        self.page_allocator.is_alloc_stalling_for_old()
    }

    pub fn young(&self) -> &Generation {
        &self.young
    }

    pub fn old(&self) -> &Generation {
        &self.old
    }

    pub fn generation(&self, id: GenerationId) -> &Generation {
        match id {
            GenerationId::Young => &self.young,
            GenerationId::Old => &self.old,
        }
    }

    pub fn page_allocator(&self) -> &Arc<PageAllocator> {
        &self.page_allocator
    }

    pub fn cycles(&self) -> &CycleCounters {
        &self.cycles
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn stats(&self, generation: GenerationId) -> PageAllocatorStats {
        self.page_allocator.stats(generation)
    }

    pub fn metrics(&self) -> AllocatorMetrics {
        AllocatorMetrics::collect(&self.page_allocator)
    }

    pub fn events(&self) -> &EventLog {
        self.page_allocator.events()
    }

    /// Number of running uncommit threads
    pub fn uncommitter_count(&self) -> usize {
        self.uncommitters.len()
    }
}
