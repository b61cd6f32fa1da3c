//! Resource allocator facade
//!
//! Entry point for clients. Each heap kind owns an allocator pipeline
//! assembled bottom-up (heap creator, optional pool, sub-allocator,
//! conditional router); requests try the sub-allocated placed-resource
//! path first and fall back to a dedicated committed resource. The
//! residency manager is consulted before heaps are created and placed
//! resources require their heap locked resident for the duration of the
//! driver call.

use std::sync::{Arc, Mutex};

use crate::allocation::{Allocation, AllocationMethod};
use crate::config::{AllocatorDescriptor, ResidencyDescriptor, SubAllocationAlgorithm};
use crate::device::{
    ClearValue, DeviceResource, GpuDevice, HeapType, HeapUsage, MemorySegment, ResourceDescriptor,
    ResourceDimension, ResourceFlags, ResourceHeapTier, ResourceInfo, ResourceState,
    DEFAULT_PLACEMENT_ALIGNMENT, MSAA_PLACEMENT_ALIGNMENT, SMALL_MSAA_PLACEMENT_ALIGNMENT,
    SMALL_PLACEMENT_ALIGNMENT,
};
use crate::heap::{Heap, HeapBacking, ResidencyState};
use crate::residency::ResidencyManager;
use crate::stats::AllocatorStats;
use crate::suballoc::{
    AllocationRequest, BuddyMemoryAllocator, ConditionalMemoryAllocator, MemoryAllocator,
    PooledMemoryAllocator, ResourceHeapAllocator, SegmentedMemoryAllocator, SlabCacheAllocator,
    StandaloneMemoryAllocator,
};
use crate::trace::TraceRecorder;
use crate::{GmmError, GmmResult};

mod event;
mod small_buffer;

pub use event::AllocationEvent;

use small_buffer::{SmallBufferAllocator, SMALL_BUFFER_BLOCK_ALIGNMENT};

/// Worker threads serving asynchronous allocation.
const ASYNC_WORKER_COUNT: usize = 2;

/// Heap category a resource is sub-allocated from. Tier-2 adapters mix
/// buffers and textures in one heap; tier-1 adapters segregate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceHeapKind {
    UploadAllBuffersAndTextures,
    DefaultAllBuffersAndTextures,
    ReadbackAllBuffersAndTextures,
    UploadOnlyBuffers,
    DefaultOnlyBuffers,
    ReadbackOnlyBuffers,
    DefaultOnlyNonRenderableTextures,
    DefaultOnlyRenderableTextures,
}

impl ResourceHeapKind {
    pub const ALL: [ResourceHeapKind; 8] = [
        ResourceHeapKind::UploadAllBuffersAndTextures,
        ResourceHeapKind::DefaultAllBuffersAndTextures,
        ResourceHeapKind::ReadbackAllBuffersAndTextures,
        ResourceHeapKind::UploadOnlyBuffers,
        ResourceHeapKind::DefaultOnlyBuffers,
        ResourceHeapKind::ReadbackOnlyBuffers,
        ResourceHeapKind::DefaultOnlyNonRenderableTextures,
        ResourceHeapKind::DefaultOnlyRenderableTextures,
    ];

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|k| *k == self)
            .unwrap_or_default()
    }

    fn heap_type(self) -> HeapType {
        match self {
            ResourceHeapKind::UploadAllBuffersAndTextures
            | ResourceHeapKind::UploadOnlyBuffers => HeapType::Upload,
            ResourceHeapKind::ReadbackAllBuffersAndTextures
            | ResourceHeapKind::ReadbackOnlyBuffers => HeapType::Readback,
            _ => HeapType::Default,
        }
    }

    fn usage(self) -> HeapUsage {
        match self {
            ResourceHeapKind::UploadAllBuffersAndTextures
            | ResourceHeapKind::DefaultAllBuffersAndTextures
            | ResourceHeapKind::ReadbackAllBuffersAndTextures => HeapUsage::AllBuffersAndTextures,
            ResourceHeapKind::UploadOnlyBuffers
            | ResourceHeapKind::DefaultOnlyBuffers
            | ResourceHeapKind::ReadbackOnlyBuffers => HeapUsage::OnlyBuffers,
            ResourceHeapKind::DefaultOnlyNonRenderableTextures => {
                HeapUsage::OnlyNonRenderableTextures
            }
            ResourceHeapKind::DefaultOnlyRenderableTextures => HeapUsage::OnlyRenderableTextures,
        }
    }

    /// Buffer-only heaps align to 64 KiB; heaps that may hold MSAA
    /// textures must use the 4 MiB alignment.
    fn heap_alignment(self) -> u64 {
        match self.usage() {
            HeapUsage::OnlyBuffers => DEFAULT_PLACEMENT_ALIGNMENT,
            _ => MSAA_PLACEMENT_ALIGNMENT,
        }
    }

    fn for_resource(
        dimension: ResourceDimension,
        heap_type: HeapType,
        flags: ResourceFlags,
        tier: ResourceHeapTier,
    ) -> GmmResult<Self> {
        if tier == ResourceHeapTier::Tier2 {
            return Ok(match heap_type {
                HeapType::Upload => ResourceHeapKind::UploadAllBuffersAndTextures,
                HeapType::Default => ResourceHeapKind::DefaultAllBuffersAndTextures,
                HeapType::Readback => ResourceHeapKind::ReadbackAllBuffersAndTextures,
            });
        }

        match dimension {
            ResourceDimension::Buffer => Ok(match heap_type {
                HeapType::Upload => ResourceHeapKind::UploadOnlyBuffers,
                HeapType::Default => ResourceHeapKind::DefaultOnlyBuffers,
                HeapType::Readback => ResourceHeapKind::ReadbackOnlyBuffers,
            }),
            _ => match heap_type {
                HeapType::Default => {
                    if flags.allow_render_target || flags.allow_depth_stencil {
                        Ok(ResourceHeapKind::DefaultOnlyRenderableTextures)
                    } else {
                        Ok(ResourceHeapKind::DefaultOnlyNonRenderableTextures)
                    }
                }
                _ => Err(GmmError::InvalidRequest(
                    "tier-1 adapters only place textures in default heaps".to_string(),
                )),
            },
        }
    }
}

/// Per-request control flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationFlags {
    /// Satisfy from existing capacity only; never create a new heap
    pub never_allocate: bool,
    /// Skip the sub-allocated path entirely
    pub never_suballocate: bool,
    /// Allow packing small buffers inside a shared resource
    pub allow_suballocate_within: bool,
    /// Keep a spare heap prefetched in the pool
    pub always_prefetch: bool,
}

/// Client-side allocation parameters.
#[derive(Debug, Clone)]
pub struct AllocationDescriptor {
    pub heap_type: HeapType,
    pub flags: AllocationFlags,
}

impl Default for AllocationDescriptor {
    fn default() -> Self {
        AllocationDescriptor {
            heap_type: HeapType::Default,
            flags: AllocationFlags::default(),
        }
    }
}

impl AllocationDescriptor {
    pub fn with_heap_type(heap_type: HeapType) -> Self {
        AllocationDescriptor {
            heap_type,
            flags: AllocationFlags::default(),
        }
    }
}

/// Capabilities queryable through
/// [`ResourceAllocator::check_feature_support`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    ResourceSuballocationSupport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocationOrigin {
    SubAllocated { kind_index: usize },
    SmallBuffer,
    Committed,
    Imported,
}

/// Client-visible allocation handle.
///
/// Release it through [`ResourceAllocator::deallocate`]; dropping a
/// sub-allocated handle reclaims the driver resource but leaks the block
/// until the allocator shuts down, and is logged.
#[derive(Debug)]
pub struct ResourceAllocation {
    origin: AllocationOrigin,
    allocation: Option<Allocation>,
    resource: Option<DeviceResource>,
    owns_resource: bool,
    offset_from_resource: u64,
    device: Arc<dyn GpuDevice>,
}

impl ResourceAllocation {
    pub fn method(&self) -> AllocationMethod {
        self.allocation
            .as_ref()
            .map(|a| a.method)
            .unwrap_or(AllocationMethod::Standalone)
    }

    /// Bytes reserved for this allocation (block size, or heap size for
    /// standalone allocations).
    pub fn size(&self) -> u64 {
        self.allocation.as_ref().map(|a| a.size).unwrap_or(0)
    }

    pub fn request_size(&self) -> u64 {
        self.allocation
            .as_ref()
            .map(|a| a.request_size)
            .unwrap_or(0)
    }

    /// Offset inside the backing heap.
    pub fn heap_offset(&self) -> u64 {
        self.allocation.as_ref().map(|a| a.offset).unwrap_or(0)
    }

    /// Offset inside the shared driver resource; non-zero only for
    /// within-resource sub-allocations.
    pub fn offset_from_resource(&self) -> u64 {
        self.offset_from_resource
    }

    pub fn heap(&self) -> Option<&Heap> {
        self.allocation.as_ref().map(|a| &a.memory)
    }

    /// Driver resource backing this allocation.
    pub fn resource(&self) -> Option<DeviceResource> {
        self.resource
    }

    pub fn is_resident(&self) -> bool {
        self.allocation
            .as_ref()
            .map(|a| a.memory.is_resident())
            .unwrap_or(false)
    }

    fn new_standalone(
        origin: AllocationOrigin,
        allocation: Allocation,
        resource: Option<DeviceResource>,
        owns_resource: bool,
        device: Arc<dyn GpuDevice>,
    ) -> Self {
        ResourceAllocation {
            origin,
            allocation: Some(allocation),
            resource,
            owns_resource,
            offset_from_resource: 0,
            device,
        }
    }
}

impl Drop for ResourceAllocation {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if self.owns_resource {
                self.device.destroy_resource(resource);
            }
        }
        if let Some(allocation) = &self.allocation {
            if self.origin != AllocationOrigin::Imported {
                tracing::warn!(
                    method = ?allocation.method,
                    size = allocation.size,
                    "resource allocation dropped without deallocate; memory leaked until shutdown"
                );
            }
        }
    }
}

struct Pipeline {
    entry: Arc<dyn MemoryAllocator>,
    /// Stat-bearing stages, each counted exactly once
    components: Vec<Arc<dyn MemoryAllocator>>,
}

#[derive(Debug, Default)]
struct CommittedStats {
    count: u64,
    bytes: u64,
}

/// GPU resource allocator with sub-allocation, pooling and residency
/// budgeting.
pub struct ResourceAllocator {
    device: Arc<dyn GpuDevice>,
    residency: Option<Arc<ResidencyManager>>,
    descriptor: AllocatorDescriptor,
    pipelines: Vec<Pipeline>,
    small_buffer: SmallBufferAllocator,
    committed: Mutex<CommittedStats>,
    thread_pool: rayon::ThreadPool,
    recorder: TraceRecorder,
}

impl ResourceAllocator {
    /// Build an allocator without residency management.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        descriptor: AllocatorDescriptor,
    ) -> GmmResult<Arc<Self>> {
        Self::build(device, descriptor, None)
    }

    /// Build an allocator plus the residency manager governing its heaps.
    pub fn new_with_residency(
        device: Arc<dyn GpuDevice>,
        descriptor: AllocatorDescriptor,
        residency_descriptor: ResidencyDescriptor,
    ) -> GmmResult<(Arc<Self>, Arc<ResidencyManager>)> {
        let residency = ResidencyManager::new(device.clone(), residency_descriptor)?;
        let allocator = Self::build(device, descriptor, Some(residency.clone()))?;
        Ok((allocator, residency))
    }

    fn build(
        device: Arc<dyn GpuDevice>,
        descriptor: AllocatorDescriptor,
        residency: Option<Arc<ResidencyManager>>,
    ) -> GmmResult<Arc<Self>> {
        descriptor.validate()?;

        let recorder = TraceRecorder::from_options(&descriptor.record_options);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ASYNC_WORKER_COUNT)
            .thread_name(|index| format!("vramforge-worker-{}", index))
            .build()
            .map_err(|e| GmmError::Internal(format!("worker pool creation failed: {}", e)))?;

        let mut pipelines = Vec::with_capacity(ResourceHeapKind::ALL.len());
        for kind in ResourceHeapKind::ALL {
            pipelines.push(Self::build_pipeline(
                &device,
                &descriptor,
                &residency,
                kind,
                &recorder,
            )?);
        }

        let small_buffer = SmallBufferAllocator::new(
            device.clone(),
            residency.clone(),
            HeapType::Upload,
            segment_for(device.is_uma(), HeapType::Upload),
            descriptor.fragmentation_limit,
            recorder.clone(),
        )?;

        recorder.object_created(
            "resource_allocator",
            "allocator",
            serde_json::json!({
                "algorithm": format!("{:?}", descriptor.sub_allocation_algorithm),
                "preferred_heap_size": descriptor.preferred_resource_heap_size,
                "max_heap_size": descriptor.max_resource_heap_size,
            }),
        );
        tracing::info!(
            algorithm = ?descriptor.sub_allocation_algorithm,
            preferred = descriptor.preferred_resource_heap_size,
            "resource allocator created"
        );

        Ok(Arc::new(ResourceAllocator {
            device,
            residency,
            descriptor,
            pipelines,
            small_buffer,
            committed: Mutex::new(CommittedStats::default()),
            thread_pool,
            recorder,
        }))
    }

    fn build_pipeline(
        device: &Arc<dyn GpuDevice>,
        descriptor: &AllocatorDescriptor,
        residency: &Option<Arc<ResidencyManager>>,
        kind: ResourceHeapKind,
        recorder: &TraceRecorder,
    ) -> GmmResult<Pipeline> {
        // MSAA heaps prefer 4 MiB alignment but cannot exceed the heap
        // size itself.
        let heap_alignment = kind
            .heap_alignment()
            .min(descriptor.preferred_resource_heap_size);
        let segment = segment_for(device.is_uma(), kind.heap_type());

        let creator = Arc::new(
            ResourceHeapAllocator::new(
                device.clone(),
                residency.clone(),
                kind.heap_type(),
                kind.usage(),
                segment,
                heap_alignment,
                descriptor.create_heaps_not_resident,
                descriptor.always_in_budget,
            )
            .with_recorder(recorder.clone()),
        );

        let mut components: Vec<Arc<dyn MemoryAllocator>> =
            vec![creator.clone() as Arc<dyn MemoryAllocator>];

        let build_sub = |next: Arc<dyn MemoryAllocator>| -> GmmResult<Arc<dyn MemoryAllocator>> {
            match descriptor.sub_allocation_algorithm {
                SubAllocationAlgorithm::Buddy => Ok(Arc::new(BuddyMemoryAllocator::new(
                    descriptor.max_resource_heap_size,
                    descriptor.preferred_resource_heap_size,
                    heap_alignment,
                    next,
                )?)),
                SubAllocationAlgorithm::Slab => Ok(Arc::new(SlabCacheAllocator::new(
                    descriptor.min_block_size,
                    descriptor.max_resource_heap_size,
                    descriptor.preferred_resource_heap_size,
                    heap_alignment,
                    descriptor.fragmentation_limit,
                    descriptor.growth_factor,
                    next,
                )?)),
                SubAllocationAlgorithm::FixedPool | SubAllocationAlgorithm::SegmentedPool => {
                    unreachable!("pool algorithms are assembled without a sub-allocator")
                }
            }
        };

        let entry: Arc<dyn MemoryAllocator> = match descriptor.sub_allocation_algorithm {
            SubAllocationAlgorithm::Buddy | SubAllocationAlgorithm::Slab => {
                let direct = build_sub(creator.clone())?;
                components.push(direct.clone());

                if descriptor.always_on_demand {
                    direct
                } else {
                    let pooled_creator = Arc::new(PooledMemoryAllocator::new(
                        creator.clone(),
                        descriptor.preferred_resource_heap_size,
                    ));
                    let pooled_sub = build_sub(pooled_creator.clone())?;
                    components.push(pooled_creator);
                    components.push(pooled_sub.clone());

                    Arc::new(ConditionalMemoryAllocator::new(
                        pooled_sub,
                        direct,
                        descriptor.max_resource_size_for_pooling,
                    ))
                }
            }
            SubAllocationAlgorithm::FixedPool => {
                let next: Arc<dyn MemoryAllocator> = if descriptor.always_on_demand {
                    creator.clone()
                } else {
                    let pooled = Arc::new(PooledMemoryAllocator::new(
                        creator.clone(),
                        descriptor.preferred_resource_heap_size,
                    ));
                    components.push(pooled.clone());
                    pooled
                };
                let standalone = Arc::new(StandaloneMemoryAllocator::new(next));
                components.push(standalone.clone());
                standalone
            }
            SubAllocationAlgorithm::SegmentedPool => {
                let segmented = Arc::new(SegmentedMemoryAllocator::new(
                    creator.clone(),
                    heap_alignment,
                ));
                components.push(segmented.clone());
                let standalone = Arc::new(StandaloneMemoryAllocator::new(segmented));
                components.push(standalone.clone());
                standalone
            }
        };

        Ok(Pipeline { entry, components })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn residency(&self) -> Option<&Arc<ResidencyManager>> {
        self.residency.as_ref()
    }

    pub fn check_feature_support(&self, feature: Feature) -> bool {
        match feature {
            Feature::ResourceSuballocationSupport => !self.descriptor.always_committed,
        }
    }

    /// Compute the driver-required size and alignment, applying the
    /// small-texture rules and re-querying when the driver rejects the
    /// preferred alignment.
    fn resource_info(&self, desc: &ResourceDescriptor) -> (ResourceInfo, ResourceDescriptor) {
        let mut adjusted = desc.clone();

        if adjusted.is_buffer() {
            if adjusted.alignment == 0 {
                // Buffers are always 64 KiB size- and placement-aligned;
                // no driver round-trip required.
                let size = crate::util::align_to(adjusted.width, DEFAULT_PLACEMENT_ALIGNMENT);
                return (
                    ResourceInfo {
                        size,
                        alignment: DEFAULT_PLACEMENT_ALIGNMENT,
                    },
                    adjusted,
                );
            }
        } else if !adjusted.is_render_or_depth() {
            // Small textures can use smaller alignments when the most
            // detailed mip fits under the default alignment.
            adjusted.alignment = if adjusted.sample_count > 1 {
                SMALL_MSAA_PLACEMENT_ALIGNMENT
            } else {
                SMALL_PLACEMENT_ALIGNMENT
            };
        }

        let mut info = self.device.query_resource_info(&adjusted);

        // If the preferred alignment was rejected, let the driver pick.
        if adjusted.alignment != 0 && info.alignment != adjusted.alignment {
            adjusted.alignment = 0;
            info = self.device.query_resource_info(&adjusted);
        }

        (info, adjusted)
    }

    /// Allocate memory and create a resource placed or committed in it.
    pub fn create_resource(
        &self,
        allocation_desc: &AllocationDescriptor,
        resource_desc: &ResourceDescriptor,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> GmmResult<ResourceAllocation> {
        let (info, adjusted_desc) = self.resource_info(resource_desc);

        // An invalid driver size would otherwise overflow the allocator.
        if info.is_invalid() {
            return Err(GmmError::OutOfMemory(
                "driver reports the resource as unallocatable".to_string(),
            ));
        }
        if info.size > self.descriptor.max_resource_heap_size {
            return Err(GmmError::OutOfMemory(format!(
                "resource size {} exceeds the max resource heap size {}",
                info.size, self.descriptor.max_resource_heap_size
            )));
        }

        let kind = ResourceHeapKind::for_resource(
            adjusted_desc.dimension,
            allocation_desc.heap_type,
            adjusted_desc.flags,
            self.descriptor.resource_heap_tier,
        )?;

        self.recorder.call(
            "resource_allocator",
            "create_resource",
            serde_json::json!({"size": info.size, "alignment": info.alignment}),
        );

        let flags = allocation_desc.flags;

        // Small upload buffers can share one driver buffer.
        if !self.descriptor.always_committed
            && flags.allow_suballocate_within
            && adjusted_desc.is_buffer()
            && allocation_desc.heap_type == HeapType::Upload
            && adjusted_desc.width <= self.descriptor.small_buffer_threshold
        {
            let request = AllocationRequest {
                size: adjusted_desc.width,
                alignment: SMALL_BUFFER_BLOCK_ALIGNMENT,
                never_allocate: flags.never_allocate,
                always_prefetch: flags.always_prefetch,
            };
            if let Some(allocation) = self.small_buffer.try_allocate(&request)? {
                let resource = allocation.memory.device_resource();
                let offset = allocation.offset;
                return Ok(ResourceAllocation {
                    origin: AllocationOrigin::SmallBuffer,
                    allocation: Some(Allocation {
                        method: AllocationMethod::SubAllocatedWithin,
                        ..allocation
                    }),
                    resource,
                    owns_resource: false,
                    offset_from_resource: offset,
                    device: self.device.clone(),
                });
            }
        }

        // Sub-allocated placed resource.
        if !self.descriptor.always_committed && !flags.never_suballocate {
            let request = AllocationRequest {
                size: info.size,
                alignment: info.alignment,
                never_allocate: flags.never_allocate,
                always_prefetch: flags.always_prefetch,
            };
            let entry = &self.pipelines[kind.index()].entry;
            if let Some(sub_allocation) = entry.try_allocate(&request)? {
                match self.create_placed_resource(
                    &sub_allocation,
                    &info,
                    &adjusted_desc,
                    initial_state,
                    clear_value,
                ) {
                    Ok(resource) => {
                        return Ok(ResourceAllocation {
                            origin: AllocationOrigin::SubAllocated {
                                kind_index: kind.index(),
                            },
                            allocation: Some(sub_allocation),
                            resource: Some(resource),
                            owns_resource: true,
                            offset_from_resource: 0,
                            device: self.device.clone(),
                        });
                    }
                    Err(e) => {
                        // Roll the sub-allocation back and fall through to
                        // the committed path.
                        tracing::warn!("placed resource creation failed: {}", e);
                        entry.deallocate(sub_allocation)?;
                    }
                }
            }
        }

        if flags.never_allocate {
            return Err(GmmError::OutOfMemory(
                "no existing capacity satisfies a never-allocate request".to_string(),
            ));
        }

        self.create_committed_resource(
            kind,
            allocation_desc.heap_type,
            &info,
            &adjusted_desc,
            initial_state,
            clear_value,
        )
    }

    /// Place a resource inside a sub-allocated heap range. The heap stays
    /// locked resident for the duration of the driver call.
    fn create_placed_resource(
        &self,
        sub_allocation: &Allocation,
        info: &ResourceInfo,
        desc: &ResourceDescriptor,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> GmmResult<DeviceResource> {
        if sub_allocation.method == AllocationMethod::SubAllocatedWithin {
            return Err(GmmError::Internal(
                "within-resource allocations cannot back a placed resource".to_string(),
            ));
        }
        if sub_allocation.size < info.size {
            return Err(GmmError::Internal(format!(
                "sub-allocation of {} bytes is smaller than the resource ({})",
                sub_allocation.size, info.size
            )));
        }

        let heap = &sub_allocation.memory;
        let handle = heap.device_heap().ok_or_else(|| {
            GmmError::Internal("sub-allocated heap without a driver handle".to_string())
        })?;

        if let Some(residency) = &self.residency {
            residency.lock_heap(heap)?;
        }

        let result = self
            .device
            .create_placed_resource(handle, sub_allocation.offset, desc, initial_state, clear_value)
            .map_err(GmmError::from);

        if let Some(residency) = &self.residency {
            residency.unlock_heap(heap)?;
        }

        result
    }

    fn create_committed_resource(
        &self,
        kind: ResourceHeapKind,
        heap_type: HeapType,
        info: &ResourceInfo,
        desc: &ResourceDescriptor,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> GmmResult<ResourceAllocation> {
        let segment = segment_for(self.device.is_uma(), heap_type);

        // Committed creation implicitly makes the resource resident; make
        // room first when the budget is mandatory.
        if self.descriptor.always_in_budget {
            if let Some(residency) = &self.residency {
                residency.ensure_in_budget(info.size, segment)?;
            }
        }

        let (heap_handle, resource_handle) = self.device.create_committed_resource(
            heap_type,
            kind.usage(),
            desc,
            initial_state,
            clear_value,
        )?;

        let residency_managed = self.residency.is_some();
        let heap = Heap::new(
            self.device.clone(),
            HeapBacking::Heap(heap_handle),
            info.size,
            info.alignment,
            heap_type,
            segment,
            residency_managed,
            if residency_managed {
                ResidencyState::CurrentResident
            } else {
                ResidencyState::Unknown
            },
        );

        if let Some(residency) = &self.residency {
            residency.insert_heap(&heap)?;
        }

        {
            let mut stats = self.committed.lock()?;
            stats.count += 1;
            stats.bytes += info.size;
        }

        self.recorder.object_created(
            "committed_resource",
            &format!("heap-{}", heap.id()),
            serde_json::json!({"size": info.size}),
        );
        tracing::debug!(size = info.size, "committed resource created");

        Ok(ResourceAllocation::new_standalone(
            AllocationOrigin::Committed,
            Allocation::standalone(heap, info.size),
            Some(resource_handle),
            true,
            self.device.clone(),
        ))
    }

    /// Wrap an externally created resource as a standalone allocation.
    /// Imported resources stay outside residency management and are never
    /// destroyed by the allocator.
    pub fn create_resource_from_existing(
        &self,
        resource: DeviceResource,
    ) -> GmmResult<ResourceAllocation> {
        let desc = self.device.describe_resource(resource)?;
        let (info, _) = self.resource_info(&desc);
        if info.is_invalid() {
            return Err(GmmError::OutOfMemory(
                "imported resource has no valid size".to_string(),
            ));
        }

        let heap = Heap::new(
            self.device.clone(),
            HeapBacking::External,
            info.size,
            info.alignment,
            HeapType::Default,
            segment_for(self.device.is_uma(), HeapType::Default),
            false,
            ResidencyState::Unknown,
        );

        Ok(ResourceAllocation::new_standalone(
            AllocationOrigin::Imported,
            Allocation::standalone(heap, info.size),
            Some(resource),
            false,
            self.device.clone(),
        ))
    }

    /// Queue an allocation on the worker pool. The result is retrievable
    /// exactly once from the returned event.
    pub fn create_resource_async(
        self: &Arc<Self>,
        allocation_desc: AllocationDescriptor,
        resource_desc: ResourceDescriptor,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> AllocationEvent {
        let event = AllocationEvent::new();
        let completer = event.clone();
        let allocator = self.clone();

        self.thread_pool.spawn(move || {
            let result = allocator.create_resource(
                &allocation_desc,
                &resource_desc,
                initial_state,
                clear_value,
            );
            completer.signal(result);
        });

        event
    }

    /// Release an allocation: the driver resource is destroyed and the
    /// memory returns to its sub-allocator, pool or the driver.
    pub fn deallocate(&self, mut allocation: ResourceAllocation) -> GmmResult<()> {
        let inner = allocation.allocation.take().ok_or_else(|| {
            GmmError::Internal("allocation already released".to_string())
        })?;

        if let Some(resource) = allocation.resource.take() {
            if allocation.owns_resource {
                self.device.destroy_resource(resource);
            }
        }

        self.recorder.call(
            "resource_allocator",
            "deallocate",
            serde_json::json!({"size": inner.size}),
        );

        match allocation.origin {
            AllocationOrigin::SubAllocated { kind_index } => {
                self.pipelines[kind_index].entry.deallocate(inner)
            }
            AllocationOrigin::SmallBuffer => self.small_buffer.deallocate(inner),
            AllocationOrigin::Committed => {
                {
                    let mut stats = self.committed.lock()?;
                    stats.count = stats.count.saturating_sub(1);
                    stats.bytes = stats.bytes.saturating_sub(inner.memory.size());
                }
                if let Some(residency) = &self.residency {
                    residency.remove_heap(&inner.memory)?;
                }
                drop(inner);
                Ok(())
            }
            AllocationOrigin::Imported => {
                drop(inner);
                Ok(())
            }
        }
    }

    /// Trim pooled memory until `bytes_to_release` is reached; `None`
    /// drains every pool. Returns the bytes actually released.
    pub fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        let mut released = 0;
        let mut remaining = bytes_to_release;

        for pipeline in &self.pipelines {
            if remaining == Some(0) {
                break;
            }
            let freed = pipeline.entry.release_memory(remaining);
            released += freed;
            if let Some(limit) = remaining {
                remaining = Some(limit.saturating_sub(freed));
            }
        }
        if remaining != Some(0) {
            released += self.small_buffer.release_memory(remaining);
        }

        self.recorder.call(
            "resource_allocator",
            "release_memory",
            serde_json::json!({"released": released}),
        );
        released
    }

    /// Aggregate usage across every pipeline stage.
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats::default();
        for pipeline in &self.pipelines {
            for component in &pipeline.components {
                stats += component.stats();
            }
        }
        stats += self.small_buffer.stats();

        if let Ok(committed) = self.committed.lock() {
            stats.used_block_count += committed.count;
            stats.used_block_bytes += committed.bytes;
            stats.used_heap_count += committed.count;
            stats.used_heap_bytes += committed.bytes;
        }
        stats
    }
}

impl Drop for ResourceAllocator {
    fn drop(&mut self) {
        self.release_memory(None);
        self.recorder
            .object_destroyed("resource_allocator", "allocator", serde_json::Value::Null);
        self.recorder.flush();
    }
}

fn segment_for(is_uma: bool, heap_type: HeapType) -> MemorySegment {
    if is_uma {
        return MemorySegment::Local;
    }
    match heap_type {
        HeapType::Default => MemorySegment::Local,
        HeapType::Upload | HeapType::Readback => MemorySegment::NonLocal,
    }
}
