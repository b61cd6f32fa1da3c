//! Composable memory allocator pipeline
//!
//! Every stage of the pipeline implements [`MemoryAllocator`]: heap
//! creators at the leaves, pools and sub-allocators above them, and the
//! conditional router at the entry. Chaining is plain ownership (each
//! wrapper holds an `Arc` of its downstream allocator), never inheritance.
//!
//! All implementations are internally synchronized with one coarse mutex
//! per component, so a shared `Arc<dyn MemoryAllocator>` can be used from
//! any thread; operations on one allocator are linearizable.

pub mod buddy;
pub mod conditional;
pub mod heap_creator;
pub mod pool;
pub mod segmented;
pub mod slab;
pub mod standalone;

pub use buddy::BuddyMemoryAllocator;
pub use conditional::ConditionalMemoryAllocator;
pub use heap_creator::ResourceHeapAllocator;
pub use pool::{LifoMemoryPool, PooledMemoryAllocator};
pub use segmented::SegmentedMemoryAllocator;
pub use slab::{SlabCacheAllocator, SlabMemoryAllocator};
pub use standalone::StandaloneMemoryAllocator;

use crate::allocation::Allocation;
use crate::stats::AllocatorStats;
use crate::util::{is_power_of_two, INVALID_OFFSET, INVALID_SIZE};
use crate::{GmmError, GmmResult};

/// One allocation request flowing down the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    pub size: u64,
    pub alignment: u64,
    /// Satisfy from existing capacity only; never create a new heap.
    pub never_allocate: bool,
    /// Refill the pool with a spare heap after serving this request.
    pub always_prefetch: bool,
}

impl AllocationRequest {
    pub fn new(size: u64, alignment: u64) -> Self {
        AllocationRequest {
            size,
            alignment,
            never_allocate: false,
            always_prefetch: false,
        }
    }

    pub fn with_never_allocate(mut self, never_allocate: bool) -> Self {
        self.never_allocate = never_allocate;
        self
    }

    /// Reject malformed requests before they reach an algorithm.
    ///
    /// `memory_size`/`memory_alignment` are the serving allocator's limits;
    /// the sentinels mean "unbounded".
    pub fn validate(&self, memory_size: u64, memory_alignment: u64) -> GmmResult<()> {
        if self.size == 0 {
            return Err(GmmError::InvalidRequest(
                "requested size must be non-zero".to_string(),
            ));
        }
        if self.alignment == 0 || !is_power_of_two(self.alignment) {
            return Err(GmmError::InvalidRequest(format!(
                "requested alignment must be a non-zero power of two, got {}",
                self.alignment
            )));
        }
        if memory_size != INVALID_SIZE && self.size > memory_size {
            return Err(GmmError::InvalidRequest(format!(
                "requested size {} exceeds allocator memory size {}",
                self.size, memory_size
            )));
        }
        if memory_alignment != INVALID_OFFSET && self.alignment > memory_alignment {
            return Err(GmmError::InvalidRequest(format!(
                "requested alignment {} exceeds allocator memory alignment {}",
                self.alignment, memory_alignment
            )));
        }
        Ok(())
    }
}

/// Capability contract shared by every pipeline stage.
///
/// `try_allocate` recovers from exhaustion locally by returning `Ok(None)`
/// so callers can fall through to the next strategy; errors are reserved
/// for malformed requests and non-recoverable failures.
pub trait MemoryAllocator: Send + Sync {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>>;

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()>;

    /// Trim up to `bytes_to_release` of unused memory; `None` releases
    /// everything. Returns the bytes actually freed.
    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        let _ = bytes_to_release;
        0
    }

    /// This allocator's own counters; wrappers do not fold downstream
    /// stats in, the facade aggregates across stages.
    fn stats(&self) -> AllocatorStats;

    /// Largest request this allocator serves, or `INVALID_SIZE` if unbounded.
    fn memory_size(&self) -> u64 {
        INVALID_SIZE
    }

    /// Largest alignment this allocator honors, or `INVALID_OFFSET` if
    /// unbounded.
    fn memory_alignment(&self) -> u64 {
        INVALID_OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let ok = AllocationRequest::new(1024, 64);
        assert!(ok.validate(INVALID_SIZE, INVALID_OFFSET).is_ok());

        let zero_size = AllocationRequest::new(0, 64);
        assert!(matches!(
            zero_size.validate(INVALID_SIZE, INVALID_OFFSET),
            Err(GmmError::InvalidRequest(_))
        ));

        let bad_alignment = AllocationRequest::new(1024, 3);
        assert!(bad_alignment.validate(INVALID_SIZE, INVALID_OFFSET).is_err());

        let zero_alignment = AllocationRequest::new(1024, 0);
        assert!(zero_alignment.validate(INVALID_SIZE, INVALID_OFFSET).is_err());

        let too_large = AllocationRequest::new(4096, 64);
        assert!(too_large.validate(1024, INVALID_OFFSET).is_err());

        let over_aligned = AllocationRequest::new(64, 4096);
        assert!(over_aligned.validate(INVALID_SIZE, 64).is_err());
    }
}
