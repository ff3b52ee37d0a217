//! # zpage - Region Page Allocator for a Concurrent Generational Collector
//!
//! zpage manages the heap memory of a ZGC-style collector: it hands out
//! granule-aligned pages, bump-allocates objects inside them, and returns
//! idle memory to the operating system.
//!
//! ## Overview
//!
//! - **Capacity accounting**: committed, used and claimed bytes per NUMA
//!   partition, with a ceiling that drops for good when commits fail
//! - **Mapped cache**: freed pages stay committed and mapped for reuse
//! - **Allocation stalls**: blocking requests queue up in FIFO order and
//!   escalate from minor to major collection to out-of-memory
//! - **Multi-partition pages**: a page larger than any one partition's free
//!   capacity is assembled from several partitions
//! - **Uncommit**: memory that sat in the cache long enough goes back to the
//!   OS, never below min capacity
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zpage::{AllocatorConfig, GenerationId, Heap};
//!
//! fn main() -> Result<(), zpage::ZError> {
//!     let config = AllocatorConfig::from_env();
//!     let heap = Heap::new(config)?;
//!
//!     let addr = heap.alloc_object(64)?;
//!     println!("object at {:#x}", addr);
//!
//!     let stats = heap.stats(GenerationId::Young);
//!     println!("young uses {} bytes", stats.used_generation);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Heap                                                     │
//! │  ┌─────────────────────┐  ┌──────────────────┐           │
//! │  │ Young: eden,        │  │ Old: relocation  │           │
//! │  │ survivor 1..14      │  │ target           │           │
//! │  └──────────┬──────────┘  └────────┬─────────┘           │
//! │             │  ObjectAllocator      │                     │
//! │             └──────────┬────────────┘                     │
//! │                        ▼                                  │
//! │  ┌─────────────────────────────────────────────┐          │
//! │  │ PageAllocator (global lock, stall queue)     │          │
//! │  │  ┌────────────┐ ┌────────────┐               │          │
//! │  │  │Partition 0 │ │Partition 1 │ ...           │          │
//! │  │  │cache, VM   │ │cache, VM   │               │          │
//! │  │  └────────────┘ └────────────┘               │          │
//! │  └─────────────────────────────────────────────┘          │
//! │                        ▼                                  │
//! │  HeapMemory: reservation, physical segments, mappings     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Thread Safety
//!
//! - `Heap`, `PageAllocator` and `ObjectAllocator` are `Send + Sync`
//! - Only capacity claiming runs under the global lock; commit, map and
//!   unmap run outside it
//! - Collection requests go through the `GcDriver` trait and are never made
//!   while the lock is held
//!
//! ## Modules
//!
//! - [`allocator`] - page and object allocation, partitions, uncommit
//! - [`memory`] - virtual ranges, physical segments, mappings, cache
//! - [`generation`] - generations, cycle counters, collector interface
//! - [`stats`] / [`logging`] - statistics, metrics export, event log

// Core
pub mod config;
pub mod error;
pub mod heap;

// Memory management
pub mod allocator;
pub mod memory;
pub mod page;

// Collector interface
pub mod generation;
pub mod numa;

// Monitoring
pub mod logging;
pub mod stats;

// Utilities
pub mod util;

pub use allocator::{
    EdenAllocator, ObjectAllocator, PageAllocator, PageAllocatorStats, PartitionSnapshot,
    RelocationAllocator,
};
pub use config::{AllocatorConfig, ConfigError};
pub use error::{Result, ZError};
pub use generation::{CycleCounters, GcCause, GcDriver, Generation, GenerationId, LoggingDriver};
pub use heap::{Heap, HeapBuilder};
pub use logging::{AllocEvent, EventLog, EventLogConfig, LogLevel};
pub use memory::{AnonymousBacking, LimitedBacking, PhysicalBacking};
pub use page::{AllocationFlags, Page, PageAge, PagePartition, PageType};
pub use stats::{AllocationStats, AllocationSummary, AllocatorMetrics};

/// zpage version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
