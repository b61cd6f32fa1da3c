//! Within-resource sub-allocation for small buffers
//!
//! Tiny upload buffers (constants, per-draw data) are cheaper packed into
//! one shared driver buffer than placed each in their own 64 KiB range. A
//! slab cache carves committed buffers into small blocks; allocations
//! reference the shared buffer at an offset instead of owning a resource.

use std::sync::{Arc, Mutex};

use crate::allocation::Allocation;
use crate::device::{
    GpuDevice, HeapType, HeapUsage, MemorySegment, ResourceDescriptor, ResourceState,
};
use crate::heap::{Heap, HeapBacking, ResidencyState};
use crate::residency::ResidencyManager;
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator, SlabCacheAllocator};
use crate::trace::TraceRecorder;
use crate::GmmResult;

/// Offset granularity inside a shared buffer (constant-buffer alignment).
pub(crate) const SMALL_BUFFER_BLOCK_ALIGNMENT: u64 = 256;

/// Size of each shared buffer backing the small-buffer slabs.
const SHARED_BUFFER_SIZE: u64 = 64 * 1024;

#[derive(Debug, Default)]
struct BufferStats {
    used_heap_count: u64,
    used_heap_bytes: u64,
}

/// Pipeline leaf creating committed buffers that double as heaps.
struct BufferHeapCreator {
    device: Arc<dyn GpuDevice>,
    residency: Option<Arc<ResidencyManager>>,
    heap_type: HeapType,
    initial_state: ResourceState,
    segment: MemorySegment,
    state: Mutex<BufferStats>,
    recorder: TraceRecorder,
}

impl MemoryAllocator for BufferHeapCreator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        if request.never_allocate {
            return Ok(None);
        }

        let desc = ResourceDescriptor::buffer(request.size);
        let info = self.device.query_resource_info(&desc);
        if info.is_invalid() {
            return Ok(None);
        }

        let (heap_handle, resource_handle) = match self.device.create_committed_resource(
            self.heap_type,
            HeapUsage::OnlyBuffers,
            &desc,
            self.initial_state,
            None,
        ) {
            Ok(handles) => handles,
            Err(e) => {
                tracing::warn!(size = request.size, "shared buffer creation failed: {}", e);
                return Ok(None);
            }
        };

        let heap = Heap::new(
            self.device.clone(),
            HeapBacking::Committed {
                heap: heap_handle,
                resource: resource_handle,
            },
            info.size,
            info.alignment,
            self.heap_type,
            self.segment,
            self.residency.is_some(),
            if self.residency.is_some() {
                ResidencyState::CurrentResident
            } else {
                ResidencyState::Unknown
            },
        );

        if let Some(residency) = &self.residency {
            residency.insert_heap(&heap)?;
        }

        {
            let mut stats = self.state.lock()?;
            stats.used_heap_count += 1;
            stats.used_heap_bytes += heap.size();
        }

        self.recorder.object_created(
            "shared_buffer",
            &format!("heap-{}", heap.id()),
            serde_json::json!({"size": heap.size()}),
        );

        Ok(Some(Allocation::standalone(heap, request.size)))
    }

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        {
            let mut stats = self.state.lock()?;
            stats.used_heap_count = stats.used_heap_count.saturating_sub(1);
            stats.used_heap_bytes = stats.used_heap_bytes.saturating_sub(allocation.memory.size());
        }
        if let Some(residency) = &self.residency {
            residency.remove_heap(&allocation.memory)?;
        }
        drop(allocation);
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return AllocatorStats::default(),
        };
        AllocatorStats {
            used_heap_count: state.used_heap_count,
            used_heap_bytes: state.used_heap_bytes,
            ..Default::default()
        }
    }

    fn memory_alignment(&self) -> u64 {
        SHARED_BUFFER_SIZE
    }
}

/// Slab cache over shared committed buffers.
pub(crate) struct SmallBufferAllocator {
    cache: SlabCacheAllocator,
    creator: Arc<BufferHeapCreator>,
}

impl SmallBufferAllocator {
    pub(crate) fn new(
        device: Arc<dyn GpuDevice>,
        residency: Option<Arc<ResidencyManager>>,
        heap_type: HeapType,
        segment: MemorySegment,
        fragmentation_limit: f64,
        recorder: TraceRecorder,
    ) -> GmmResult<Self> {
        let creator = Arc::new(BufferHeapCreator {
            device,
            residency,
            heap_type,
            initial_state: ResourceState::GenericRead,
            segment,
            state: Mutex::new(BufferStats::default()),
            recorder,
        });
        let cache = SlabCacheAllocator::new(
            SMALL_BUFFER_BLOCK_ALIGNMENT,
            SHARED_BUFFER_SIZE,
            SHARED_BUFFER_SIZE,
            SHARED_BUFFER_SIZE,
            fragmentation_limit,
            1.0,
            creator.clone() as Arc<dyn MemoryAllocator>,
        )?;
        Ok(SmallBufferAllocator { cache, creator })
    }

    pub(crate) fn try_allocate(
        &self,
        request: &AllocationRequest,
    ) -> GmmResult<Option<Allocation>> {
        self.cache.try_allocate(request)
    }

    pub(crate) fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        self.cache.deallocate(allocation)
    }

    pub(crate) fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        self.cache.release_memory(bytes_to_release)
    }

    pub(crate) fn stats(&self) -> AllocatorStats {
        self.cache.stats() + self.creator.stats()
    }
}
