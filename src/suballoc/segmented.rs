//! Segmented pooling
//!
//! Keeps one LIFO pool per distinct heap size in a list sorted by size.
//! Requests are rounded up to the allocator's alignment and routed to the
//! pool of exactly that size, creating the segment on first use. Released
//! heaps return to their segment; trimming walks segments until the byte
//! quota is met.

use std::sync::{Arc, Mutex};

use crate::allocation::Allocation;
use crate::stats::AllocatorStats;
use crate::suballoc::pool::LifoMemoryPool;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::util::{align_to, is_power_of_two};
use crate::{GmmError, GmmResult};

struct Segment {
    memory_size: u64,
    pool: LifoMemoryPool,
}

struct SegmentedState {
    /// Sorted by `memory_size` ascending
    segments: Vec<Segment>,
    size_cache_hits: u64,
    size_cache_misses: u64,
}

/// Variable-size heap pooling over a sorted segment list.
pub struct SegmentedMemoryAllocator {
    memory_alignment: u64,
    next: Arc<dyn MemoryAllocator>,
    state: Mutex<SegmentedState>,
}

impl SegmentedMemoryAllocator {
    pub fn new(next: Arc<dyn MemoryAllocator>, memory_alignment: u64) -> Self {
        SegmentedMemoryAllocator {
            memory_alignment,
            next,
            state: Mutex::new(SegmentedState {
                segments: Vec::new(),
                size_cache_hits: 0,
                size_cache_misses: 0,
            }),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().map(|s| s.segments.len()).unwrap_or(0)
    }

    fn segment_index(state: &mut SegmentedState, memory_size: u64) -> usize {
        match state
            .segments
            .binary_search_by_key(&memory_size, |s| s.memory_size)
        {
            Ok(index) => index,
            Err(index) => {
                state.segments.insert(
                    index,
                    Segment {
                        memory_size,
                        pool: LifoMemoryPool::new(memory_size),
                    },
                );
                index
            }
        }
    }
}

impl MemoryAllocator for SegmentedMemoryAllocator {
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

        let memory_size = align_to(request.size, self.memory_alignment);
        let mut state = self.state.lock()?;
        let index = Self::segment_index(&mut state, memory_size);

        if let Some(mut allocation) = state.segments[index].pool.acquire() {
            state.size_cache_hits += 1;
            allocation.request_size = request.size;
            return Ok(Some(allocation));
        }
        state.size_cache_misses += 1;

        // Request exactly the segment size so the heap can re-enter this
        // pool later.
        let heap_request = AllocationRequest {
            size: memory_size,
            alignment: self.memory_alignment.max(request.alignment),
            never_allocate: request.never_allocate,
            always_prefetch: request.always_prefetch,
        };
        match self.next.try_allocate(&heap_request)? {
            Some(mut allocation) => {
                allocation.request_size = request.size;
                Ok(Some(allocation))
            }
            None => Ok(None),
        }
    }

    fn deallocate(&self, mut allocation: Allocation) -> GmmResult<()> {
        let memory_size = allocation.memory.size();
        allocation.request_size = memory_size;

        let mut state = self.state.lock()?;
        let index = Self::segment_index(&mut state, memory_size);
        state.segments[index].pool.return_to_pool(allocation);
        Ok(())
    }

    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        let drained = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return 0,
            };

            let mut remaining = bytes_to_release;
            let mut drained = Vec::new();
            for segment in &mut state.segments {
                if remaining == Some(0) {
                    break;
                }
                let (entries, released) = segment.pool.drain(remaining);
                drained.extend(entries);
                if let Some(limit) = remaining {
                    remaining = Some(limit.saturating_sub(released));
                }
            }
            drained
        };

        let mut released = 0;
        for allocation in drained {
            released += allocation.memory.size();
            if let Err(e) = self.next.deallocate(allocation) {
                tracing::warn!("failed to destroy pooled segment heap: {}", e);
            }
        }
        released
    }

    fn stats(&self) -> AllocatorStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return AllocatorStats::default(),
        };
        AllocatorStats {
            free_heap_bytes: state.segments.iter().map(|s| s.pool.total_bytes()).sum(),
            size_cache_hits: state.size_cache_hits,
            size_cache_misses: state.size_cache_misses,
            ..Default::default()
        }
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

    fn segmented(device: &Arc<MockDevice>, alignment: u64) -> SegmentedMemoryAllocator {
        let creator = Arc::new(ResourceHeapAllocator::new(
            device.clone() as Arc<dyn GpuDevice>,
            None,
            HeapType::Default,
            HeapUsage::OnlyBuffers,
            MemorySegment::Local,
            alignment,
            false,
            false,
        ));
        SegmentedMemoryAllocator::new(creator, alignment)
    }

    #[test]
    fn test_segments_stay_sorted() {
        let device = Arc::new(MockDevice::new());
        let allocator = segmented(&device, 4096);

        let big = allocator
            .try_allocate(&AllocationRequest::new(4 * 4096, 4096))
            .unwrap()
            .unwrap();
        let small = allocator
            .try_allocate(&AllocationRequest::new(4096, 4096))
            .unwrap()
            .unwrap();
        let middle = allocator
            .try_allocate(&AllocationRequest::new(2 * 4096, 4096))
            .unwrap()
            .unwrap();

        assert_eq!(allocator.segment_count(), 3);

        allocator.deallocate(big).unwrap();
        allocator.deallocate(small).unwrap();
        allocator.deallocate(middle).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.free_heap_bytes, 7 * 4096);
    }

    #[test]
    fn test_request_rounds_to_alignment() {
        let device = Arc::new(MockDevice::new());
        let allocator = segmented(&device, 4096);

        let allocation = allocator
            .try_allocate(&AllocationRequest::new(100, 1))
            .unwrap()
            .unwrap();
        assert_eq!(allocation.memory.size(), 4096);
        assert_eq!(allocation.request_size, 100);

        allocator.deallocate(allocation).unwrap();

        // A different small request reuses the same 4 KiB segment.
        let again = allocator
            .try_allocate(&AllocationRequest::new(200, 1))
            .unwrap()
            .unwrap();
        assert_eq!(allocator.stats().size_cache_hits, 1);
        allocator.deallocate(again).unwrap();
    }

    #[test]
    fn test_release_walks_segments() {
        let device = Arc::new(MockDevice::new());
        let allocator = segmented(&device, 4096);

        let a = allocator
            .try_allocate(&AllocationRequest::new(4096, 4096))
            .unwrap()
            .unwrap();
        let b = allocator
            .try_allocate(&AllocationRequest::new(8192, 4096))
            .unwrap()
            .unwrap();
        allocator.deallocate(a).unwrap();
        allocator.deallocate(b).unwrap();

        assert_eq!(device.live_heap_count(), 2);
        let released = allocator.release_memory(None);
        assert_eq!(released, 4096 + 8192);
        assert_eq!(device.live_heap_count(), 0);
        assert_eq!(allocator.stats().free_heap_bytes, 0);
        device.assert_no_leak();
    }
}
