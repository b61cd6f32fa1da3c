//! Buddy sub-allocation over on-demand heaps
//!
//! Runs one buddy block allocator across a large virtual range and maps
//! each `memory_size` chunk of it to a driver heap fetched from the
//! downstream allocator the first time a block lands in the chunk. The
//! heap is returned once its last block is freed. Blocks never exceed
//! `memory_size`, so no block straddles two heaps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::allocation::{Allocation, AllocationMethod, BlockRef};
use crate::block::buddy::{BuddyBlock, BuddyBlockAllocator};
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::util::is_power_of_two;
use crate::{GmmError, GmmResult};

struct HeapEntry {
    allocation: Allocation,
    ref_count: u64,
}

struct BuddyState {
    blocks: BuddyBlockAllocator,
    heaps: HashMap<u64, HeapEntry>,
    used_block_count: u64,
    used_block_bytes: u64,
}

/// Placed-resource sub-allocator backed by the buddy algorithm.
pub struct BuddyMemoryAllocator {
    memory_size: u64,
    memory_alignment: u64,
    next: Arc<dyn MemoryAllocator>,
    state: Mutex<BuddyState>,
}

impl BuddyMemoryAllocator {
    /// `max_system_size` bounds the virtual range; `memory_size` is the
    /// size of each backing heap. Both must be powers of two.
    pub fn new(
        max_system_size: u64,
        memory_size: u64,
        memory_alignment: u64,
        next: Arc<dyn MemoryAllocator>,
    ) -> GmmResult<Self> {
        if !is_power_of_two(memory_size) || memory_size > max_system_size {
            return Err(GmmError::InvalidConfiguration(format!(
                "buddy heap size must be a power of two within the system size, got {}",
                memory_size
            )));
        }
        if !is_power_of_two(memory_alignment) || memory_alignment > memory_size {
            return Err(GmmError::InvalidConfiguration(format!(
                "buddy heap alignment must be a power of two within the heap size, got {}",
                memory_alignment
            )));
        }

        Ok(BuddyMemoryAllocator {
            memory_size,
            memory_alignment,
            next,
            state: Mutex::new(BuddyState {
                blocks: BuddyBlockAllocator::new(max_system_size)?,
                heaps: HashMap::new(),
                used_block_count: 0,
                used_block_bytes: 0,
            }),
        })
    }

    /// Heaps currently backing at least one block.
    pub fn heap_count(&self) -> usize {
        self.state.lock().map(|s| s.heaps.len()).unwrap_or(0)
    }
}

impl MemoryAllocator for BuddyMemoryAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        if request.size == 0 {
            return Err(GmmError::InvalidRequest(
                "requested size must be non-zero".to_string(),
            ));
        }
        if request.alignment == 0 || !is_power_of_two(request.alignment) {
            return Err(GmmError::InvalidRequest(format!(
                "requested alignment must be a non-zero power of two, got {}",
                request.alignment
            )));
        }
        // Blocks cannot span heaps; larger requests fall through to the
        // committed path.
        if request.size > self.memory_size || request.alignment > self.memory_alignment {
            return Ok(None);
        }

        let mut state = self.state.lock()?;

        let block = match state.blocks.try_allocate(request.size, request.alignment) {
            Some(block) => block,
            None => return Ok(None),
        };

        let heap_index = block.offset / self.memory_size;
        if !state.heaps.contains_key(&heap_index) {
            let heap_request = AllocationRequest {
                size: self.memory_size,
                alignment: self.memory_alignment,
                never_allocate: request.never_allocate,
                always_prefetch: request.always_prefetch,
            };
            match self.next.try_allocate(&heap_request) {
                Ok(Some(allocation)) => {
                    state.heaps.insert(
                        heap_index,
                        HeapEntry {
                            allocation,
                            ref_count: 0,
                        },
                    );
                }
                Ok(None) => {
                    state.blocks.deallocate(block);
                    return Ok(None);
                }
                Err(e) => {
                    state.blocks.deallocate(block);
                    return Err(e);
                }
            }
        }

        let memory = {
            let entry = state.heaps.get_mut(&heap_index).ok_or_else(|| {
                GmmError::Internal("buddy heap entry vanished during allocation".to_string())
            })?;
            entry.ref_count += 1;
            entry.allocation.memory.clone()
        };

        state.used_block_count += 1;
        state.used_block_bytes += block.size;

        Ok(Some(Allocation {
            memory,
            offset: block.offset % self.memory_size,
            size: block.size,
            request_size: request.size,
            method: AllocationMethod::SubAllocated,
            block: BlockRef::Buddy { node: block.node },
        }))
    }

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        let node = match allocation.block {
            BlockRef::Buddy { node } => node,
            _ => {
                return Err(GmmError::Internal(
                    "buddy allocator asked to free a non-buddy block".to_string(),
                ))
            }
        };

        let mut state = self.state.lock()?;

        let offset = state.blocks.block_offset(node);
        let size = state.blocks.block_size(node);
        let heap_index = offset / self.memory_size;

        state.blocks.deallocate(BuddyBlock { node, offset, size });
        state.used_block_count = state.used_block_count.saturating_sub(1);
        state.used_block_bytes = state.used_block_bytes.saturating_sub(size);

        let release = {
            let entry = state.heaps.get_mut(&heap_index).ok_or_else(|| {
                GmmError::Internal(format!("no heap backs buddy chunk {}", heap_index))
            })?;
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count == 0
        };

        // Drop the client's heap reference before the heap itself is
        // destroyed downstream.
        drop(allocation);

        if release {
            if let Some(entry) = state.heaps.remove(&heap_index) {
                self.next.deallocate(entry.allocation)?;
            }
        }
        Ok(())
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
        self.memory_size
    }

    fn memory_alignment(&self) -> u64 {
        self.memory_alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GpuDevice, HeapType, HeapUsage, MemorySegment, MockDevice};
    use crate::suballoc::ResourceHeapAllocator;

    fn buddy(device: &Arc<MockDevice>, max: u64, heap: u64) -> BuddyMemoryAllocator {
        let creator = Arc::new(ResourceHeapAllocator::new(
            device.clone() as Arc<dyn GpuDevice>,
            None,
            HeapType::Default,
            HeapUsage::OnlyBuffers,
            MemorySegment::Local,
            heap,
            false,
            false,
        ));
        BuddyMemoryAllocator::new(max, heap, heap, creator).unwrap()
    }

    #[test]
    fn test_blocks_share_one_heap() {
        let device = Arc::new(MockDevice::new());
        let allocator = buddy(&device, 1 << 20, 65536);

        let a = allocator
            .try_allocate(&AllocationRequest::new(16384, 1))
            .unwrap()
            .unwrap();
        let b = allocator
            .try_allocate(&AllocationRequest::new(16384, 1))
            .unwrap()
            .unwrap();

        assert!(a.memory.same_heap(&b.memory));
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16384);
        assert_eq!(device.live_heap_count(), 1);

        allocator.deallocate(a).unwrap();
        assert_eq!(device.live_heap_count(), 1);
        allocator.deallocate(b).unwrap();
        assert_eq!(device.live_heap_count(), 0);
        device.assert_no_leak();
    }

    #[test]
    fn test_full_heap_spills_to_next_chunk() {
        let device = Arc::new(MockDevice::new());
        let allocator = buddy(&device, 1 << 20, 65536);

        let a = allocator
            .try_allocate(&AllocationRequest::new(65536, 1))
            .unwrap()
            .unwrap();
        let b = allocator
            .try_allocate(&AllocationRequest::new(65536, 1))
            .unwrap()
            .unwrap();

        assert!(!a.memory.same_heap(&b.memory));
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 0);
        assert_eq!(allocator.heap_count(), 2);

        allocator.deallocate(a).unwrap();
        allocator.deallocate(b).unwrap();
        assert_eq!(allocator.heap_count(), 0);
    }

    #[test]
    fn test_oversize_request_is_silent_none() {
        let device = Arc::new(MockDevice::new());
        let allocator = buddy(&device, 1 << 20, 65536);

        let result = allocator
            .try_allocate(&AllocationRequest::new(65537, 1))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_heap_creation_failure_rolls_back_block() {
        let device = Arc::new(MockDevice::new());
        let allocator = buddy(&device, 1 << 20, 65536);
        device.fail_next_heap_creations(1);

        let result = allocator
            .try_allocate(&AllocationRequest::new(4096, 1))
            .unwrap();
        assert!(result.is_none());
        assert_eq!(allocator.stats().used_block_count, 0);

        // Allocator recovers on the next attempt.
        let allocation = allocator
            .try_allocate(&AllocationRequest::new(4096, 1))
            .unwrap()
            .unwrap();
        assert_eq!(allocation.offset, 0);
        allocator.deallocate(allocation).unwrap();
    }

    #[test]
    fn test_block_accounting() {
        let device = Arc::new(MockDevice::new());
        let allocator = buddy(&device, 1 << 20, 65536);

        let a = allocator
            .try_allocate(&AllocationRequest::new(100, 1))
            .unwrap()
            .unwrap();
        // Block sizes round to powers of two.
        assert_eq!(a.size, 128);

        let stats = allocator.stats();
        assert_eq!(stats.used_block_count, 1);
        assert_eq!(stats.used_block_bytes, 128);

        allocator.deallocate(a).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.used_block_count, 0);
        assert_eq!(stats.used_block_bytes, 0);
    }
}
