//! Allocator Module - Pages and Objects
//!
//! Manages every allocation in zpage, from pages down to objects.
//!
//! ## Layers
//!
//! - **PageAllocator**: claims capacity across NUMA partitions, commits and
//!   maps memory, stalls blocking requests until memory is freed
//! - **Partition**: one NUMA node's capacity counters, address space and
//!   mapped cache
//! - **ObjectAllocator**: bump allocation into shared small and medium
//!   pages, dedicated large pages
//! - **EdenAllocator / RelocationAllocator**: mutator and collector front
//!   ends of the object allocator
//! - **Uncommitter**: background thread returning idle memory
//!
//! ## Page Types
//!
//! - Small: one granule, objects up to `object_size_limit_small`
//! - Medium: `page_size_medium_min`..=`page_size_medium_max`, objects up to
//!   `object_size_limit_medium`
//! - Large: granule multiple, one object each

pub mod generation_allocator;
pub mod memory_allocation;
pub mod object_allocator;
pub mod page_allocation;
pub mod page_allocator;
pub mod partition;
pub mod uncommitter;

pub use generation_allocator::{EdenAllocator, RelocationAllocator};
pub use memory_allocation::MemoryAllocation;
pub use object_allocator::{ObjectAllocator, SharedPageSlot};
pub use page_allocation::{
    MultiPartitionAllocation, PageAllocation, PartitionAllocation, SinglePartitionAllocation,
    StalledAllocation,
};
pub use page_allocator::{PageAllocator, PageAllocatorStats};
pub use partition::{CapacityReduction, Partition, PartitionSnapshot, PartitionState};
pub use uncommitter::Uncommitter;
