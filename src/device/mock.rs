//! In-process mock GPU driver
//!
//! Backs the test suites and examples without real GPU hardware. Handles
//! are table indices, residency is tracked per segment, and failures can be
//! injected to exercise the fallback and rollback paths.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::device::{
    ClearValue, CommandList, DeviceError, DeviceHeap, DeviceResource, DeviceResult, GpuDevice,
    HeapDescriptor, HeapType, HeapUsage, MemorySegment, ResourceDescriptor, ResourceHeapTier,
    ResourceInfo, ResourceState, VideoMemoryInfo, DEFAULT_PLACEMENT_ALIGNMENT,
    MSAA_PLACEMENT_ALIGNMENT, SMALL_MSAA_PLACEMENT_ALIGNMENT, SMALL_PLACEMENT_ALIGNMENT,
};
use crate::util::{align_to, INVALID_SIZE};

/// Bytes per texel assumed by the mock when sizing textures (RGBA8).
const TEXEL_SIZE: u64 = 4;

const DEFAULT_SEGMENT_BUDGET: u64 = 256 * 1024 * 1024;

#[derive(Debug)]
struct MockHeap {
    size: u64,
    segment: MemorySegment,
    resident: bool,
}

#[derive(Debug)]
struct MockResource {
    desc: ResourceDescriptor,
    #[allow(dead_code)] // Kept for placement-aliasing diagnostics
    placed_in: Option<u64>,
}

#[derive(Debug, Default)]
struct FenceState {
    #[allow(dead_code)] // Kept for signal-ahead-of-completion diagnostics
    signaled: u64,
    completed: u64,
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    heaps: HashMap<u64, MockHeap>,
    resources: HashMap<u64, MockResource>,
    budgets: [u64; 2],
    fences: HashMap<u32, FenceState>,
    created_heap_count: u64,
    fail_next_heap: u32,
    fail_next_committed: u32,
    fail_next_placed: u32,
    fail_next_make_resident: u32,
    auto_complete_fences: bool,
}

/// Mock implementation of [`GpuDevice`].
///
/// Residency semantics match the trait contract: heaps are resident on
/// creation unless `create_not_resident` is set, committed resources are
/// always resident, and `make_resident`/`evict` flip the tracked state.
#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<MockState>,
    is_uma: bool,
    tier: ResourceHeapTier,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_budgets(DEFAULT_SEGMENT_BUDGET, DEFAULT_SEGMENT_BUDGET)
    }

    pub fn with_budgets(local: u64, non_local: u64) -> Self {
        MockDevice {
            state: Mutex::new(MockState {
                next_handle: 1,
                heaps: HashMap::new(),
                resources: HashMap::new(),
                budgets: [local, non_local],
                fences: HashMap::new(),
                created_heap_count: 0,
                fail_next_heap: 0,
                fail_next_committed: 0,
                fail_next_placed: 0,
                fail_next_make_resident: 0,
                auto_complete_fences: true,
            }),
            is_uma: false,
            tier: ResourceHeapTier::Tier2,
        }
    }

    pub fn uma() -> Self {
        let mut device = Self::new();
        device.is_uma = true;
        device
    }

    pub fn with_tier(mut self, tier: ResourceHeapTier) -> Self {
        self.tier = tier;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // The mock holds no invariants worth preserving across a panicked
        // test thread.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn segment_for(&self, heap_type: HeapType) -> MemorySegment {
        if self.is_uma {
            return MemorySegment::Local;
        }
        match heap_type {
            HeapType::Default => MemorySegment::Local,
            HeapType::Upload | HeapType::Readback => MemorySegment::NonLocal,
        }
    }

    /// Raw byte size of a resource before placement alignment.
    fn raw_size(desc: &ResourceDescriptor) -> u64 {
        match desc.dimension {
            crate::device::ResourceDimension::Buffer => desc.width,
            _ => {
                desc.width
                    * desc.height as u64
                    * desc.depth_or_array_size as u64
                    * TEXEL_SIZE
                    * desc.sample_count as u64
            }
        }
    }

    // ---- test support -------------------------------------------------

    pub fn set_budget(&self, segment: MemorySegment, bytes: u64) {
        self.lock().budgets[segment_index(segment)] = bytes;
    }

    /// Fail the next `count` heap creations with an out-of-memory error.
    pub fn fail_next_heap_creations(&self, count: u32) {
        self.lock().fail_next_heap = count;
    }

    pub fn fail_next_committed_creations(&self, count: u32) {
        self.lock().fail_next_committed = count;
    }

    pub fn fail_next_placed_creations(&self, count: u32) {
        self.lock().fail_next_placed = count;
    }

    pub fn fail_next_make_resident(&self, count: u32) {
        self.lock().fail_next_make_resident = count;
    }

    /// When disabled, submitted work stays in flight until
    /// [`MockDevice::complete_fence`] advances the queue.
    pub fn set_auto_complete_fences(&self, auto_complete: bool) {
        self.lock().auto_complete_fences = auto_complete;
    }

    pub fn complete_fence(&self, queue: u32, value: u64) {
        let mut state = self.lock();
        let fence = state.fences.entry(queue).or_default();
        fence.completed = fence.completed.max(value);
    }

    pub fn live_heap_count(&self) -> usize {
        self.lock().heaps.len()
    }

    pub fn live_resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Heaps created over the device lifetime, including destroyed ones.
    pub fn created_heap_count(&self) -> u64 {
        self.lock().created_heap_count
    }

    pub fn resident_bytes(&self, segment: MemorySegment) -> u64 {
        let state = self.lock();
        state
            .heaps
            .values()
            .filter(|h| h.resident && h.segment == segment)
            .map(|h| h.size)
            .sum()
    }

    pub fn heap_is_resident(&self, heap: DeviceHeap) -> bool {
        self.lock().heaps.get(&heap.0).map(|h| h.resident).unwrap_or(false)
    }

    /// Panic if any heap or resource outlived its owner. Call at test end.
    pub fn assert_no_leak(&self) {
        let state = self.lock();
        assert!(
            state.heaps.is_empty(),
            "leaked {} device heaps",
            state.heaps.len()
        );
        assert!(
            state.resources.is_empty(),
            "leaked {} device resources",
            state.resources.len()
        );
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_index(segment: MemorySegment) -> usize {
    match segment {
        MemorySegment::Local => 0,
        MemorySegment::NonLocal => 1,
    }
}

impl GpuDevice for MockDevice {
    fn query_resource_info(&self, desc: &ResourceDescriptor) -> ResourceInfo {
        if desc.width == 0 {
            return ResourceInfo {
                size: INVALID_SIZE,
                alignment: 0,
            };
        }

        let raw = Self::raw_size(desc);

        if desc.is_buffer() {
            // Buffers are always 64 KiB size- and placement-aligned.
            return ResourceInfo {
                size: align_to(raw, DEFAULT_PLACEMENT_ALIGNMENT),
                alignment: DEFAULT_PLACEMENT_ALIGNMENT,
            };
        }

        let default_alignment = if desc.sample_count > 1 {
            MSAA_PLACEMENT_ALIGNMENT
        } else {
            DEFAULT_PLACEMENT_ALIGNMENT
        };
        let small_alignment = if desc.sample_count > 1 {
            SMALL_MSAA_PLACEMENT_ALIGNMENT
        } else {
            SMALL_PLACEMENT_ALIGNMENT
        };

        // Small alignment is honored only for textures whose most detailed
        // mip fits under the default alignment, mirroring driver rules.
        let alignment = if desc.alignment == small_alignment
            && raw <= default_alignment
            && !desc.is_render_or_depth()
        {
            small_alignment
        } else {
            default_alignment
        };

        ResourceInfo {
            size: align_to(raw, alignment),
            alignment,
        }
    }

    fn create_heap(&self, desc: &HeapDescriptor) -> DeviceResult<DeviceHeap> {
        let segment = self.segment_for(desc.heap_type);
        let mut state = self.lock();

        if state.fail_next_heap > 0 {
            state.fail_next_heap -= 1;
            return Err(DeviceError::OutOfDeviceMemory(format!(
                "injected heap creation failure ({} bytes)",
                desc.size
            )));
        }

        let id = state.next_handle;
        state.next_handle += 1;
        state.heaps.insert(
            id,
            MockHeap {
                size: desc.size,
                segment,
                resident: !desc.create_not_resident,
            },
        );
        state.created_heap_count += 1;

        tracing::trace!(heap = id, size = desc.size, "mock heap created");
        Ok(DeviceHeap(id))
    }

    fn create_committed_resource(
        &self,
        heap_type: HeapType,
        _usage: HeapUsage,
        desc: &ResourceDescriptor,
        _initial_state: ResourceState,
        _clear_value: Option<ClearValue>,
    ) -> DeviceResult<(DeviceHeap, DeviceResource)> {
        let info = self.query_resource_info(desc);
        if info.is_invalid() {
            return Err(DeviceError::ResourceCreationFailed(
                "invalid resource descriptor".to_string(),
            ));
        }

        let segment = self.segment_for(heap_type);
        let mut state = self.lock();

        if state.fail_next_committed > 0 {
            state.fail_next_committed -= 1;
            return Err(DeviceError::OutOfDeviceMemory(
                "injected committed creation failure".to_string(),
            ));
        }

        let heap_id = state.next_handle;
        let resource_id = state.next_handle + 1;
        state.next_handle += 2;
        state.heaps.insert(
            heap_id,
            MockHeap {
                size: info.size,
                segment,
                resident: true,
            },
        );
        state.created_heap_count += 1;
        state.resources.insert(
            resource_id,
            MockResource {
                desc: desc.clone(),
                placed_in: None,
            },
        );

        Ok((DeviceHeap(heap_id), DeviceResource(resource_id)))
    }

    fn create_placed_resource(
        &self,
        heap: DeviceHeap,
        offset: u64,
        desc: &ResourceDescriptor,
        _initial_state: ResourceState,
        _clear_value: Option<ClearValue>,
    ) -> DeviceResult<DeviceResource> {
        let info = self.query_resource_info(desc);
        let mut state = self.lock();

        if state.fail_next_placed > 0 {
            state.fail_next_placed -= 1;
            return Err(DeviceError::ResourceCreationFailed(
                "injected placed creation failure".to_string(),
            ));
        }

        let mock_heap = state
            .heaps
            .get(&heap.0)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("heap {}", heap.0)))?;
        if !mock_heap.resident {
            return Err(DeviceError::ResourceCreationFailed(format!(
                "heap {} is not resident",
                heap.0
            )));
        }
        if offset + info.size > mock_heap.size {
            return Err(DeviceError::ResourceCreationFailed(format!(
                "placement out of bounds: offset={} size={} heap_size={}",
                offset, info.size, mock_heap.size
            )));
        }

        let resource_id = state.next_handle;
        state.next_handle += 1;
        state.resources.insert(
            resource_id,
            MockResource {
                desc: desc.clone(),
                placed_in: Some(heap.0),
            },
        );

        Ok(DeviceResource(resource_id))
    }

    fn describe_resource(&self, resource: DeviceResource) -> DeviceResult<ResourceDescriptor> {
        self.lock()
            .resources
            .get(&resource.0)
            .map(|r| r.desc.clone())
            .ok_or_else(|| DeviceError::InvalidHandle(format!("resource {}", resource.0)))
    }

    fn query_video_memory_info(&self, segment: MemorySegment) -> DeviceResult<VideoMemoryInfo> {
        let state = self.lock();
        let usage = state
            .heaps
            .values()
            .filter(|h| h.resident && h.segment == segment)
            .map(|h| h.size)
            .sum();
        Ok(VideoMemoryInfo {
            budget: state.budgets[segment_index(segment)],
            current_usage: usage,
        })
    }

    fn make_resident(&self, heaps: &[DeviceHeap]) -> DeviceResult<()> {
        let mut state = self.lock();
        if state.fail_next_make_resident > 0 {
            state.fail_next_make_resident -= 1;
            return Err(DeviceError::OutOfDeviceMemory(
                "injected make-resident failure".to_string(),
            ));
        }
        for heap in heaps {
            let entry = state
                .heaps
                .get_mut(&heap.0)
                .ok_or_else(|| DeviceError::InvalidHandle(format!("heap {}", heap.0)))?;
            entry.resident = true;
        }
        Ok(())
    }

    fn evict(&self, heaps: &[DeviceHeap]) -> DeviceResult<()> {
        let mut state = self.lock();
        for heap in heaps {
            let entry = state
                .heaps
                .get_mut(&heap.0)
                .ok_or_else(|| DeviceError::InvalidHandle(format!("heap {}", heap.0)))?;
            entry.resident = false;
        }
        Ok(())
    }

    fn execute_command_lists(&self, queue: u32, lists: &[CommandList]) -> DeviceResult<()> {
        let mut state = self.lock();
        state.fences.entry(queue).or_default();
        tracing::trace!(queue, count = lists.len(), "mock submit");
        Ok(())
    }

    fn signal(&self, queue: u32, value: u64) -> DeviceResult<()> {
        let mut state = self.lock();
        let auto = state.auto_complete_fences;
        let fence = state.fences.entry(queue).or_default();
        fence.signaled = fence.signaled.max(value);
        if auto {
            fence.completed = fence.completed.max(value);
        }
        Ok(())
    }

    fn completed_fence(&self, queue: u32) -> DeviceResult<u64> {
        Ok(self
            .lock()
            .fences
            .get(&queue)
            .map(|f| f.completed)
            .unwrap_or(0))
    }

    fn destroy_heap(&self, heap: DeviceHeap) {
        let mut state = self.lock();
        if state.heaps.remove(&heap.0).is_none() {
            tracing::warn!(heap = heap.0, "destroy of unknown mock heap");
        }
    }

    fn destroy_resource(&self, resource: DeviceResource) {
        let mut state = self.lock();
        if state.resources.remove(&resource.0).is_none() {
            tracing::warn!(resource = resource.0, "destroy of unknown mock resource");
        }
    }

    fn is_uma(&self) -> bool {
        self.is_uma
    }

    fn resource_heap_tier(&self) -> ResourceHeapTier {
        self.tier
    }
}
