//! Internal allocation record passed between pipeline allocators.

use crate::heap::Heap;

/// How an allocation was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMethod {
    /// Owns its whole heap (dedicated or pooled heap)
    Standalone,
    /// A block inside a shared heap
    SubAllocated,
    /// A range inside a shared driver resource
    SubAllocatedWithin,
}

/// Sub-allocator bookkeeping attached to an allocation.
///
/// The variant identifies the owning sub-allocator's data so deallocation
/// can be routed without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    /// Standalone allocations carry no block
    None,
    /// Node index inside a buddy block allocator arena
    Buddy { node: usize },
    /// Slab id and in-slab offset, keyed by the rounded block size
    Slab {
        block_size: u64,
        slab: usize,
        offset: u64,
    },
}

/// One placement of memory handed up the allocator pipeline.
///
/// `offset` is relative to the heap origin. `size` is the block size
/// actually reserved (>= `request_size`); conditional routing on the
/// deallocation path relies on `request_size` matching the original
/// request.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub memory: Heap,
    pub offset: u64,
    pub size: u64,
    pub request_size: u64,
    pub method: AllocationMethod,
    pub block: BlockRef,
}

impl Allocation {
    /// An allocation spanning a whole heap.
    pub fn standalone(memory: Heap, request_size: u64) -> Self {
        let size = memory.size();
        Allocation {
            memory,
            offset: 0,
            size,
            request_size,
            method: AllocationMethod::Standalone,
            block: BlockRef::None,
        }
    }
}
