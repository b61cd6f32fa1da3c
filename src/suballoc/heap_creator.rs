//! Resource heap creator (pipeline leaf)
//!
//! Wraps the driver's heap creation. Every heap produced here is
//! registered with the residency manager before it is handed upstream, and
//! unregistered when the wrapping allocation is returned.

use std::sync::{Arc, Mutex};

use crate::allocation::Allocation;
use crate::device::{GpuDevice, HeapDescriptor, HeapType, HeapUsage, MemorySegment};
use crate::heap::{Heap, HeapBacking, ResidencyState};
use crate::residency::ResidencyManager;
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::trace::TraceRecorder;
use crate::util::{align_to, INVALID_OFFSET, INVALID_SIZE};
use crate::GmmResult;

#[derive(Debug, Default)]
struct CreatorStats {
    used_heap_count: u64,
    used_heap_bytes: u64,
}

/// Creates one driver heap per allocation.
pub struct ResourceHeapAllocator {
    device: Arc<dyn GpuDevice>,
    residency: Option<Arc<ResidencyManager>>,
    heap_type: HeapType,
    usage: HeapUsage,
    segment: MemorySegment,
    memory_alignment: u64,
    create_not_resident: bool,
    always_in_budget: bool,
    state: Mutex<CreatorStats>,
    recorder: TraceRecorder,
}

impl ResourceHeapAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<dyn GpuDevice>,
        residency: Option<Arc<ResidencyManager>>,
        heap_type: HeapType,
        usage: HeapUsage,
        segment: MemorySegment,
        memory_alignment: u64,
        create_not_resident: bool,
        always_in_budget: bool,
    ) -> Self {
        ResourceHeapAllocator {
            device,
            residency,
            heap_type,
            usage,
            segment,
            memory_alignment,
            create_not_resident,
            always_in_budget,
            state: Mutex::new(CreatorStats::default()),
            recorder: TraceRecorder::default(),
        }
    }

    pub(crate) fn with_recorder(mut self, recorder: TraceRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn segment(&self) -> MemorySegment {
        self.segment
    }
}

impl MemoryAllocator for ResourceHeapAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        request.validate(INVALID_SIZE, INVALID_OFFSET)?;

        if request.never_allocate {
            return Ok(None);
        }

        // Heap sizes stay multiples of the alignment so the address space
        // above does not fragment.
        let heap_size = align_to(request.size, request.alignment);

        if self.always_in_budget {
            if let Some(residency) = &self.residency {
                if let Err(e) = residency.ensure_in_budget(heap_size, self.segment) {
                    tracing::debug!(
                        size = heap_size,
                        "heap creation skipped, cannot fit budget: {}",
                        e
                    );
                    return Ok(None);
                }
            }
        }

        let descriptor = HeapDescriptor {
            size: heap_size,
            alignment: request.alignment,
            heap_type: self.heap_type,
            usage: self.usage,
            create_not_resident: self.create_not_resident,
        };

        let handle = match self.device.create_heap(&descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                // Out of capacity for the caller; the facade falls back to
                // a committed resource which surfaces the driver error.
                tracing::warn!(size = heap_size, "driver heap creation failed: {}", e);
                return Ok(None);
            }
        };

        let residency_managed = self.residency.is_some();
        let initial_state = if !residency_managed {
            ResidencyState::Unknown
        } else if self.create_not_resident {
            ResidencyState::PendingResidency
        } else {
            ResidencyState::CurrentResident
        };

        let heap = Heap::new(
            self.device.clone(),
            HeapBacking::Heap(handle),
            heap_size,
            request.alignment,
            self.heap_type,
            self.segment,
            residency_managed,
            initial_state,
        );

        if let Some(residency) = &self.residency {
            residency.insert_heap(&heap)?;
        }

        {
            let mut stats = self.state.lock()?;
            stats.used_heap_count += 1;
            stats.used_heap_bytes += heap_size;
        }

        self.recorder.object_created(
            "heap",
            &format!("heap-{}", heap.id()),
            serde_json::json!({"size": heap_size, "heap_type": format!("{:?}", self.heap_type)}),
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

        self.recorder.object_destroyed(
            "heap",
            &format!("heap-{}", allocation.memory.id()),
            serde_json::json!({"size": allocation.memory.size()}),
        );

        // Dropping the allocation releases the driver heap once the last
        // clone is gone.
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
        self.memory_alignment
    }
}
