//! Heap pooling
//!
//! [`LifoMemoryPool`] is a stack of fully released same-size heaps;
//! [`PooledMemoryAllocator`] sits between a sub-allocator and the heap
//! creator, serving from the pool before asking the creator for a new
//! heap. Pool entries stay registered with the residency manager until
//! they are destroyed by a trim.

use std::sync::{Arc, Mutex};

use crate::allocation::Allocation;
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::GmmResult;

/// Stack of released heaps of one fixed size. Not synchronized; owners
/// keep it behind their own mutex.
#[derive(Debug)]
pub struct LifoMemoryPool {
    memory_size: u64,
    entries: Vec<Allocation>,
}

impl LifoMemoryPool {
    pub fn new(memory_size: u64) -> Self {
        LifoMemoryPool {
            memory_size,
            entries: Vec::new(),
        }
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn pool_size(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|a| a.memory.size()).sum()
    }

    /// Pop the most recently returned heap.
    pub fn acquire(&mut self) -> Option<Allocation> {
        self.entries.pop()
    }

    /// Push a released heap. The heap must have no live sub-allocations.
    pub fn return_to_pool(&mut self, allocation: Allocation) {
        debug_assert_eq!(allocation.memory.size(), self.memory_size);
        self.entries.push(allocation);
    }

    /// Remove entries until `bytes_to_release` is reached (`None` drains
    /// everything). The caller owns destroying the returned allocations.
    pub fn drain(&mut self, bytes_to_release: Option<u64>) -> (Vec<Allocation>, u64) {
        let mut drained = Vec::new();
        let mut released = 0u64;

        while let Some(allocation) = self.entries.pop() {
            released += allocation.memory.size();
            drained.push(allocation);
            if let Some(limit) = bytes_to_release {
                if released >= limit {
                    break;
                }
            }
        }
        (drained, released)
    }
}

#[derive(Debug)]
struct PoolState {
    pool: LifoMemoryPool,
    size_cache_hits: u64,
    size_cache_misses: u64,
    prefetch_misses: u64,
}

/// Serves fixed-size heaps from a LIFO pool, refilling from the
/// downstream creator on miss.
pub struct PooledMemoryAllocator {
    next: Arc<dyn MemoryAllocator>,
    memory_size: u64,
    state: Mutex<PoolState>,
}

impl PooledMemoryAllocator {
    pub fn new(next: Arc<dyn MemoryAllocator>, memory_size: u64) -> Self {
        PooledMemoryAllocator {
            next,
            memory_size,
            state: Mutex::new(PoolState {
                pool: LifoMemoryPool::new(memory_size),
                size_cache_hits: 0,
                size_cache_misses: 0,
                prefetch_misses: 0,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.state.lock().map(|s| s.pool.pool_size()).unwrap_or(0)
    }

    fn fixed_request(&self, request: &AllocationRequest) -> AllocationRequest {
        AllocationRequest {
            size: self.memory_size,
            // Pool entries are recycled across requests, so every heap is
            // created at the allocator's full alignment.
            alignment: self.next.memory_alignment().min(self.memory_size),
            never_allocate: request.never_allocate,
            always_prefetch: false,
        }
    }
}

impl MemoryAllocator for PooledMemoryAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        if request.size == 0 {
            return Err(crate::GmmError::InvalidRequest(
                "requested size must be non-zero".to_string(),
            ));
        }
        if request.alignment == 0 || !crate::util::is_power_of_two(request.alignment) {
            return Err(crate::GmmError::InvalidRequest(format!(
                "requested alignment must be a non-zero power of two, got {}",
                request.alignment
            )));
        }
        // Requests the fixed heap size cannot satisfy fall through to the
        // caller's next strategy.
        if request.size > self.memory_size
            || request.alignment > self.next.memory_alignment().min(self.memory_size)
        {
            return Ok(None);
        }

        let mut state = self.state.lock()?;

        let mut allocation = match state.pool.acquire() {
            Some(allocation) => {
                state.size_cache_hits += 1;
                allocation
            }
            None => {
                state.size_cache_misses += 1;
                if request.always_prefetch {
                    state.prefetch_misses += 1;
                }
                match self.next.try_allocate(&self.fixed_request(request))? {
                    Some(allocation) => allocation,
                    None => return Ok(None),
                }
            }
        };

        // Keep a spare heap warm for the next request.
        if request.always_prefetch && state.pool.pool_size() == 0 && !request.never_allocate {
            if let Ok(Some(spare)) = self.next.try_allocate(&self.fixed_request(request)) {
                state.pool.return_to_pool(spare);
            }
        }

        allocation.request_size = request.size;
        Ok(Some(allocation))
    }

    fn deallocate(&self, mut allocation: Allocation) -> GmmResult<()> {
        allocation.request_size = allocation.memory.size();
        let mut state = self.state.lock()?;
        state.pool.return_to_pool(allocation);
        Ok(())
    }

    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        let drained = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return 0,
            };
            state.pool.drain(bytes_to_release).0
        };

        let mut released = 0;
        for allocation in drained {
            released += allocation.memory.size();
            if let Err(e) = self.next.deallocate(allocation) {
                tracing::warn!("failed to destroy pooled heap: {}", e);
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
            free_heap_bytes: state.pool.total_bytes(),
            size_cache_hits: state.size_cache_hits,
            size_cache_misses: state.size_cache_misses,
            prefetch_misses: state.prefetch_misses,
            ..Default::default()
        }
    }

    fn memory_size(&self) -> u64 {
        self.memory_size
    }

    fn memory_alignment(&self) -> u64 {
        self.next.memory_alignment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GpuDevice, HeapType, HeapUsage, MemorySegment, MockDevice};
    use crate::suballoc::ResourceHeapAllocator;

    fn pooled(device: &Arc<MockDevice>, memory_size: u64) -> PooledMemoryAllocator {
        let creator = Arc::new(ResourceHeapAllocator::new(
            device.clone() as Arc<dyn GpuDevice>,
            None,
            HeapType::Default,
            HeapUsage::OnlyBuffers,
            MemorySegment::Local,
            65536,
            false,
            false,
        ));
        PooledMemoryAllocator::new(creator, memory_size)
    }

    #[test]
    fn test_pool_acquire_returns_same_heap() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);

        let first = allocator
            .try_allocate(&AllocationRequest::new(65536, 65536))
            .unwrap()
            .unwrap();
        let first_id = first.memory.id();

        allocator.deallocate(first).unwrap();
        assert_eq!(allocator.pool_size(), 1);

        // Identical heap reference comes back.
        let second = allocator
            .try_allocate(&AllocationRequest::new(65536, 65536))
            .unwrap()
            .unwrap();
        assert_eq!(second.memory.id(), first_id);
        assert_eq!(second.memory.size(), 65536);
        assert_eq!(device.created_heap_count(), 1);

        allocator.deallocate(second).unwrap();
    }

    #[test]
    fn test_lifo_order() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);
        let request = AllocationRequest::new(65536, 65536);

        let a = allocator.try_allocate(&request).unwrap().unwrap();
        let b = allocator.try_allocate(&request).unwrap().unwrap();
        let (a_id, b_id) = (a.memory.id(), b.memory.id());

        allocator.deallocate(a).unwrap();
        allocator.deallocate(b).unwrap();

        // Last returned pops first.
        let next = allocator.try_allocate(&request).unwrap().unwrap();
        assert_eq!(next.memory.id(), b_id);
        let next2 = allocator.try_allocate(&request).unwrap().unwrap();
        assert_eq!(next2.memory.id(), a_id);

        allocator.deallocate(next).unwrap();
        allocator.deallocate(next2).unwrap();
    }

    #[test]
    fn test_release_memory_destroys_heaps() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);
        let request = AllocationRequest::new(65536, 65536);

        let a = allocator.try_allocate(&request).unwrap().unwrap();
        let b = allocator.try_allocate(&request).unwrap().unwrap();
        allocator.deallocate(a).unwrap();
        allocator.deallocate(b).unwrap();

        assert_eq!(device.live_heap_count(), 2);
        let released = allocator.release_memory(None);
        assert_eq!(released, 2 * 65536);
        assert_eq!(allocator.pool_size(), 0);
        assert_eq!(device.live_heap_count(), 0);
        device.assert_no_leak();
    }

    #[test]
    fn test_partial_release() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);
        let request = AllocationRequest::new(65536, 65536);

        let allocations: Vec<_> = (0..3)
            .map(|_| allocator.try_allocate(&request).unwrap().unwrap())
            .collect();
        for allocation in allocations {
            allocator.deallocate(allocation).unwrap();
        }

        let released = allocator.release_memory(Some(1));
        assert_eq!(released, 65536);
        assert_eq!(allocator.pool_size(), 2);
    }

    #[test]
    fn test_cache_hit_miss_stats() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);
        let request = AllocationRequest::new(65536, 65536);

        let a = allocator.try_allocate(&request).unwrap().unwrap();
        assert_eq!(allocator.stats().size_cache_misses, 1);

        allocator.deallocate(a).unwrap();
        let b = allocator.try_allocate(&request).unwrap().unwrap();
        assert_eq!(allocator.stats().size_cache_hits, 1);

        allocator.deallocate(b).unwrap();
    }

    #[test]
    fn test_never_allocate_uses_pool_only() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);

        let never = AllocationRequest::new(65536, 65536).with_never_allocate(true);
        assert!(allocator.try_allocate(&never).unwrap().is_none());

        let a = allocator
            .try_allocate(&AllocationRequest::new(65536, 65536))
            .unwrap()
            .unwrap();
        allocator.deallocate(a).unwrap();

        // Pool entry satisfies a never-allocate request.
        assert!(allocator.try_allocate(&never).unwrap().is_some());
    }

    #[test]
    fn test_prefetch_fills_pool() {
        let device = Arc::new(MockDevice::new());
        let allocator = pooled(&device, 65536);

        let mut request = AllocationRequest::new(65536, 65536);
        request.always_prefetch = true;

        let a = allocator.try_allocate(&request).unwrap().unwrap();
        // The miss itself plus one spare.
        assert_eq!(allocator.stats().prefetch_misses, 1);
        assert_eq!(allocator.pool_size(), 1);

        // Next prefetch-flagged request hits the spare.
        let b = allocator.try_allocate(&request).unwrap().unwrap();
        assert_eq!(allocator.stats().prefetch_misses, 1);

        allocator.deallocate(a).unwrap();
        allocator.deallocate(b).unwrap();
    }
}
