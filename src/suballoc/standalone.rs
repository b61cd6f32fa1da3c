//! Dedicated (one block per heap) accounting wrapper
//!
//! Forwards every request to the downstream allocator and counts each
//! resulting heap as a single used block, so whole-heap strategies
//! (fixed and segmented pools) report block usage the same way the
//! sub-allocators do.

use std::sync::{Arc, Mutex};

use crate::allocation::Allocation;
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::GmmResult;

#[derive(Debug, Default)]
struct StandaloneStats {
    used_block_count: u64,
    used_block_bytes: u64,
}

pub struct StandaloneMemoryAllocator {
    next: Arc<dyn MemoryAllocator>,
    state: Mutex<StandaloneStats>,
}

impl StandaloneMemoryAllocator {
    pub fn new(next: Arc<dyn MemoryAllocator>) -> Self {
        StandaloneMemoryAllocator {
            next,
            state: Mutex::new(StandaloneStats::default()),
        }
    }
}

impl MemoryAllocator for StandaloneMemoryAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        let allocation = match self.next.try_allocate(request)? {
            Some(allocation) => allocation,
            None => return Ok(None),
        };

        let mut stats = self.state.lock()?;
        stats.used_block_count += 1;
        stats.used_block_bytes += request.size;
        Ok(Some(allocation))
    }

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        {
            let mut stats = self.state.lock()?;
            stats.used_block_count = stats.used_block_count.saturating_sub(1);
            stats.used_block_bytes = stats.used_block_bytes.saturating_sub(allocation.request_size);
        }
        self.next.deallocate(allocation)
    }

    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        self.next.release_memory(bytes_to_release)
    }

    fn stats(&self) -> AllocatorStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return AllocatorStats::default(),
        };
        AllocatorStats {
            used_block_count: state.used_block_count,
            used_block_bytes: state.used_block_bytes,
            ..Default::default()
        }
    }

    fn memory_size(&self) -> u64 {
        self.next.memory_size()
    }

    fn memory_alignment(&self) -> u64 {
        self.next.memory_alignment()
    }
}
