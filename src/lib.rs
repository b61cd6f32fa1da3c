//! vramforge - GPU memory manager
//!
//! A general-purpose GPU memory manager: clients allocate buffer and
//! texture resources, vramforge places them inside driver heaps through a
//! composable allocator pipeline (buddy/slab sub-allocation, LIFO and
//! segmented heap pools, dedicated committed fallback) and keeps the
//! process inside a per-segment residency budget with LRU eviction
//! coordinated against GPU fences.
//!
//! The driver itself sits behind the [`GpuDevice`] trait; an in-process
//! [`MockDevice`](device::MockDevice) backs the test suites.

pub mod allocation;
pub mod block;
pub mod config;
pub mod device;
pub mod error;
pub mod heap;
pub mod residency;
pub mod resource;
pub mod stats;
pub mod suballoc;
pub mod trace;
pub mod util;

pub use allocation::{Allocation, AllocationMethod};
pub use config::{
    AllocatorDescriptor, RecordOptions, ResidencyDescriptor, SubAllocationAlgorithm,
};
pub use device::{GpuDevice, MemorySegment, ResourceHeapTier};
pub use error::{ErrorCategory, GmmError, GmmResult};
pub use heap::{Heap, ResidencyState};
pub use residency::{ResidencyManager, ResidencySet};
pub use resource::{
    AllocationDescriptor, AllocationEvent, AllocationFlags, Feature, ResourceAllocation,
    ResourceAllocator, ResourceHeapKind,
};
pub use stats::{AllocatorStats, ResidencyStats};
