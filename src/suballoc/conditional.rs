//! Size-threshold routing
//!
//! Routes requests at or under the threshold to the first allocator
//! (typically the pooled path) and everything else to the second.
//! Deallocations are routed symmetrically by the allocation's original
//! request size, so both directions always agree.

use std::sync::Arc;

use crate::allocation::Allocation;
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::GmmResult;

pub struct ConditionalMemoryAllocator {
    first: Arc<dyn MemoryAllocator>,
    second: Arc<dyn MemoryAllocator>,
    condition_size: u64,
}

impl ConditionalMemoryAllocator {
    pub fn new(
        first: Arc<dyn MemoryAllocator>,
        second: Arc<dyn MemoryAllocator>,
        condition_size: u64,
    ) -> Self {
        ConditionalMemoryAllocator {
            first,
            second,
            condition_size,
        }
    }

    fn route(&self, size: u64) -> &Arc<dyn MemoryAllocator> {
        if size <= self.condition_size {
            &self.first
        } else {
            &self.second
        }
    }
}

impl MemoryAllocator for ConditionalMemoryAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        self.route(request.size).try_allocate(request)
    }

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        self.route(allocation.request_size).deallocate(allocation)
    }

    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        let released = self.first.release_memory(bytes_to_release);
        let remaining = match bytes_to_release {
            Some(limit) => {
                if released >= limit {
                    return released;
                }
                Some(limit - released)
            }
            None => None,
        };
        released + self.second.release_memory(remaining)
    }

    /// Children are reported individually by the pipeline owner; the
    /// router itself holds no state.
    fn stats(&self) -> AllocatorStats {
        AllocatorStats::default()
    }

    fn memory_size(&self) -> u64 {
        self.first.memory_size().max(self.second.memory_size())
    }

    fn memory_alignment(&self) -> u64 {
        self.first
            .memory_alignment()
            .max(self.second.memory_alignment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationMethod;
    use crate::stats::AllocatorStats;
    use std::sync::Mutex;

    /// Counts calls; serves standalone allocations from the mock device.
    struct CountingAllocator {
        inner: Arc<dyn MemoryAllocator>,
        allocs: Mutex<u64>,
        deallocs: Mutex<u64>,
    }

    impl CountingAllocator {
        fn wrap(inner: Arc<dyn MemoryAllocator>) -> Arc<Self> {
            Arc::new(CountingAllocator {
                inner,
                allocs: Mutex::new(0),
                deallocs: Mutex::new(0),
            })
        }

        fn alloc_count(&self) -> u64 {
            *self.allocs.lock().unwrap()
        }

        fn dealloc_count(&self) -> u64 {
            *self.deallocs.lock().unwrap()
        }
    }

    impl MemoryAllocator for CountingAllocator {
        fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
            *self.allocs.lock().unwrap() += 1;
            self.inner.try_allocate(request)
        }

        fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
            *self.deallocs.lock().unwrap() += 1;
            self.inner.deallocate(allocation)
        }

        fn stats(&self) -> AllocatorStats {
            self.inner.stats()
        }
    }

    fn creator(device: &Arc<crate::device::MockDevice>) -> Arc<dyn MemoryAllocator> {
        use crate::device::{GpuDevice, HeapType, HeapUsage, MemorySegment};
        Arc::new(crate::suballoc::ResourceHeapAllocator::new(
            device.clone() as Arc<dyn GpuDevice>,
            None,
            HeapType::Default,
            HeapUsage::OnlyBuffers,
            MemorySegment::Local,
            4096,
            false,
            false,
        ))
    }

    #[test]
    fn test_routing_by_size_both_directions() {
        let device = Arc::new(crate::device::MockDevice::new());
        let small = CountingAllocator::wrap(creator(&device));
        let large = CountingAllocator::wrap(creator(&device));

        let conditional = ConditionalMemoryAllocator::new(
            small.clone() as Arc<dyn MemoryAllocator>,
            large.clone() as Arc<dyn MemoryAllocator>,
            8192,
        );

        let a = conditional
            .try_allocate(&AllocationRequest::new(4096, 4096))
            .unwrap()
            .unwrap();
        assert_eq!(small.alloc_count(), 1);
        assert_eq!(large.alloc_count(), 0);
        assert_eq!(a.method, AllocationMethod::Standalone);

        let b = conditional
            .try_allocate(&AllocationRequest::new(16384, 4096))
            .unwrap()
            .unwrap();
        assert_eq!(large.alloc_count(), 1);

        conditional.deallocate(a).unwrap();
        assert_eq!(small.dealloc_count(), 1);
        assert_eq!(large.dealloc_count(), 0);

        conditional.deallocate(b).unwrap();
        assert_eq!(large.dealloc_count(), 1);
        device.assert_no_leak();
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let device = Arc::new(crate::device::MockDevice::new());
        let small = CountingAllocator::wrap(creator(&device));
        let large = CountingAllocator::wrap(creator(&device));

        let conditional = ConditionalMemoryAllocator::new(
            small.clone() as Arc<dyn MemoryAllocator>,
            large.clone() as Arc<dyn MemoryAllocator>,
            4096,
        );

        let a = conditional
            .try_allocate(&AllocationRequest::new(4096, 4096))
            .unwrap()
            .unwrap();
        assert_eq!(small.alloc_count(), 1);

        conditional.deallocate(a).unwrap();
        device.assert_no_leak();
    }
}
