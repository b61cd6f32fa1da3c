//! Allocator and residency configuration
//!
//! Descriptors are validated up front so the allocation paths can assume
//! well-formed limits. Defaults match the sizes the original tuning
//! settled on for discrete desktop GPUs.

use std::sync::Arc;

use crate::device::ResourceHeapTier;
use crate::trace::EventSink;
use crate::util::is_power_of_two;
use crate::{GmmError, GmmResult};

/// Default smallest heap created for sub-allocation (4 MiB).
pub const DEFAULT_PREFERRED_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// Default ceiling on any single resource heap (32 GiB).
pub const DEFAULT_MAX_HEAP_SIZE: u64 = 32u64 << 30;

/// Default acceptable fragmentation inside a slab.
pub const DEFAULT_FRAGMENTATION_LIMIT: f64 = 0.125;

/// Default slab-cache block granularity.
pub const DEFAULT_MIN_BLOCK_SIZE: u64 = 4096;

/// Buffers at or under this size are eligible for within-resource
/// sub-allocation.
pub const DEFAULT_SMALL_BUFFER_THRESHOLD: u64 = 4096;

/// Default share of the driver-reported budget the manager may occupy.
pub const DEFAULT_VIDEO_MEMORY_BUDGET: f64 = 0.95;

/// Default bytes evicted per batch (50 MiB).
pub const DEFAULT_EVICT_BATCH_SIZE: u64 = 50 * 1024 * 1024;

/// Block-allocation strategy used for placed-resource sub-allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAllocationAlgorithm {
    /// Power-of-two splitting; best for variable sizes
    Buddy,
    /// Fixed block size per slab, slab size chosen per request
    Slab,
    /// LIFO pool of whole fixed-size heaps
    FixedPool,
    /// Per-size pools in a sorted segment list
    SegmentedPool,
}

/// Event-trace recording switches. Off by default; a sink must be supplied
/// for anything to be written.
#[derive(Clone, Default)]
pub struct RecordOptions {
    /// Record object lifetimes (allocators, heaps)
    pub record_object_events: bool,
    /// Record per-call events (allocate, deallocate, evict)
    pub record_call_events: bool,
    /// Destination for recorded events
    pub sink: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for RecordOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordOptions")
            .field("record_object_events", &self.record_object_events)
            .field("record_call_events", &self.record_call_events)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Construction-time options for [`ResourceAllocator`](crate::ResourceAllocator).
#[derive(Debug, Clone)]
pub struct AllocatorDescriptor {
    /// Force every resource onto the committed path
    pub always_committed: bool,
    /// Ensure budget before any heap or committed creation
    pub always_in_budget: bool,
    /// Disable pooling; heaps are created and destroyed on demand
    pub always_on_demand: bool,
    /// Create heaps without implicit residency
    pub create_heaps_not_resident: bool,
    pub max_resource_heap_size: u64,
    pub preferred_resource_heap_size: u64,
    /// Resources above this size skip the pooled path
    pub max_resource_size_for_pooling: u64,
    pub resource_heap_tier: ResourceHeapTier,
    pub sub_allocation_algorithm: SubAllocationAlgorithm,
    /// Acceptable wasted fraction of a slab
    pub fragmentation_limit: f64,
    /// Geometric slab growth; 1.0 disables growth
    pub growth_factor: f64,
    /// Slab-cache block size granularity
    pub min_block_size: u64,
    /// Upload buffers at or under this size may share one driver buffer
    pub small_buffer_threshold: u64,
    pub record_options: RecordOptions,
}

impl Default for AllocatorDescriptor {
    fn default() -> Self {
        AllocatorDescriptor {
            always_committed: false,
            always_in_budget: false,
            always_on_demand: false,
            create_heaps_not_resident: false,
            max_resource_heap_size: DEFAULT_MAX_HEAP_SIZE,
            preferred_resource_heap_size: DEFAULT_PREFERRED_HEAP_SIZE,
            max_resource_size_for_pooling: DEFAULT_PREFERRED_HEAP_SIZE,
            resource_heap_tier: ResourceHeapTier::Tier2,
            sub_allocation_algorithm: SubAllocationAlgorithm::Buddy,
            fragmentation_limit: DEFAULT_FRAGMENTATION_LIMIT,
            growth_factor: 1.0,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            small_buffer_threshold: DEFAULT_SMALL_BUFFER_THRESHOLD,
            record_options: RecordOptions::default(),
        }
    }
}

impl AllocatorDescriptor {
    pub fn with_algorithm(mut self, algorithm: SubAllocationAlgorithm) -> Self {
        self.sub_allocation_algorithm = algorithm;
        self
    }

    pub fn with_preferred_heap_size(mut self, size: u64) -> Self {
        self.preferred_resource_heap_size = size;
        self
    }

    pub fn with_max_heap_size(mut self, size: u64) -> Self {
        self.max_resource_heap_size = size;
        self
    }

    pub fn with_always_committed(mut self, always_committed: bool) -> Self {
        self.always_committed = always_committed;
        self
    }

    pub fn with_always_in_budget(mut self, always_in_budget: bool) -> Self {
        self.always_in_budget = always_in_budget;
        self
    }

    /// Check internal consistency.
    ///
    /// The buddy sub-allocator requires power-of-two heap sizes; pool
    /// routing requires the pooling threshold to fit inside a heap. A heap
    /// created not-resident needs no budget, so combining
    /// `create_heaps_not_resident` with `always_in_budget` would make the
    /// budget check meaningless for one path and mandatory for the other;
    /// the combination is rejected outright.
    pub fn validate(&self) -> GmmResult<()> {
        if !is_power_of_two(self.preferred_resource_heap_size) {
            return Err(GmmError::InvalidConfiguration(format!(
                "preferred resource heap size must be a power of two, got {}",
                self.preferred_resource_heap_size
            )));
        }
        if !is_power_of_two(self.max_resource_heap_size) {
            return Err(GmmError::InvalidConfiguration(format!(
                "max resource heap size must be a power of two, got {}",
                self.max_resource_heap_size
            )));
        }
        if self.preferred_resource_heap_size > self.max_resource_heap_size {
            return Err(GmmError::InvalidConfiguration(format!(
                "preferred heap size {} exceeds max heap size {}",
                self.preferred_resource_heap_size, self.max_resource_heap_size
            )));
        }
        if self.max_resource_size_for_pooling > self.max_resource_heap_size {
            return Err(GmmError::InvalidConfiguration(
                "pooling threshold exceeds max heap size".to_string(),
            ));
        }
        if !(self.fragmentation_limit > 0.0 && self.fragmentation_limit < 1.0) {
            return Err(GmmError::InvalidConfiguration(format!(
                "fragmentation limit must be in (0, 1), got {}",
                self.fragmentation_limit
            )));
        }
        if self.growth_factor < 1.0 {
            return Err(GmmError::InvalidConfiguration(format!(
                "growth factor must be >= 1.0, got {}",
                self.growth_factor
            )));
        }
        if !is_power_of_two(self.min_block_size) {
            return Err(GmmError::InvalidConfiguration(format!(
                "min block size must be a power of two, got {}",
                self.min_block_size
            )));
        }
        if self.always_in_budget && self.create_heaps_not_resident {
            return Err(GmmError::InvalidConfiguration(
                "alwaysInBudget cannot be combined with createHeapsNotResident".to_string(),
            ));
        }
        Ok(())
    }
}

/// Construction-time options for [`ResidencyManager`](crate::ResidencyManager).
#[derive(Debug, Clone)]
pub struct ResidencyDescriptor {
    /// Fraction of the driver-reported budget this process may occupy
    pub video_memory_budget: f64,
    /// Hard cap in bytes across each segment; 0 means uncapped
    pub total_budget_limit: u64,
    /// Minimum bytes evicted per eviction round
    pub evict_batch_size: u64,
    /// First fence value stamped on submitted work
    pub initial_fence_value: u64,
    /// Re-query the driver budget on every budget check
    pub update_budget_by_polling: bool,
}

impl Default for ResidencyDescriptor {
    fn default() -> Self {
        ResidencyDescriptor {
            video_memory_budget: DEFAULT_VIDEO_MEMORY_BUDGET,
            total_budget_limit: 0,
            evict_batch_size: DEFAULT_EVICT_BATCH_SIZE,
            initial_fence_value: 0,
            update_budget_by_polling: false,
        }
    }
}

impl ResidencyDescriptor {
    pub fn validate(&self) -> GmmResult<()> {
        if !(self.video_memory_budget > 0.0 && self.video_memory_budget <= 1.0) {
            return Err(GmmError::InvalidConfiguration(format!(
                "video memory budget fraction must be in (0, 1], got {}",
                self.video_memory_budget
            )));
        }
        if self.evict_batch_size == 0 {
            return Err(GmmError::InvalidConfiguration(
                "evict batch size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
