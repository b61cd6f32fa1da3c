//! GPU driver abstraction
//!
//! The allocator core never talks to a concrete GPU API. Everything it
//! needs from the driver is expressed by the [`GpuDevice`] trait: heap and
//! resource creation, residency transitions, video memory queries and fence
//! plumbing. Production integrations implement the trait over their API of
//! choice; [`MockDevice`](mock::MockDevice) is the in-tree implementation
//! used by the test suites.

use std::fmt;

use thiserror::Error;

use crate::util::INVALID_SIZE;

pub mod mock;

pub use mock::MockDevice;

/// Default placement alignment for buffers and large textures (64 KiB).
pub const DEFAULT_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Placement alignment small non-renderable textures may use (4 KiB).
pub const SMALL_PLACEMENT_ALIGNMENT: u64 = 4 * 1024;

/// Placement alignment for MSAA textures (4 MiB).
pub const MSAA_PLACEMENT_ALIGNMENT: u64 = 4 * 1024 * 1024;

/// Placement alignment small MSAA textures may use (64 KiB).
pub const SMALL_MSAA_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Driver error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Heap creation failed: {0}")]
    HeapCreationFailed(String),
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),
    #[error("Device out of memory: {0}")]
    OutOfDeviceMemory(String),
    #[error("Memory query failed: {0}")]
    QueryFailed(String),
    #[error("Residency change failed: {0}")]
    ResidencyFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Command submission failed: {0}")]
    SubmitFailed(String),
}

impl DeviceError {
    /// True when the failure indicates exhausted device memory, which the
    /// residency manager may resolve by evicting and retrying.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfDeviceMemory(_))
    }
}

/// Driver result type
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Opaque driver heap handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHeap(pub u64);

/// Opaque driver resource handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceResource(pub u64);

/// Opaque recorded command list handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandList(pub u64);

/// Memory segment a heap is charged against.
///
/// On UMA adapters the driver exposes a single segment and everything maps
/// to `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySegment {
    /// Dedicated (device-local) memory
    Local,
    /// System memory visible to the GPU
    NonLocal,
}

/// CPU access class of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Device-local, no CPU access
    Default,
    /// CPU-write, GPU-read
    Upload,
    /// GPU-write, CPU-read
    Readback,
}

/// Resource categories a heap may back. Tier-1 adapters segregate heaps by
/// category; tier-2 adapters accept everything in one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapUsage {
    AllBuffersAndTextures,
    OnlyBuffers,
    OnlyNonRenderableTextures,
    OnlyRenderableTextures,
}

/// Heap-tier capability reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHeapTier {
    Tier1,
    Tier2,
}

/// Descriptor passed to [`GpuDevice::create_heap`].
#[derive(Debug, Clone)]
pub struct HeapDescriptor {
    pub size: u64,
    pub alignment: u64,
    pub heap_type: HeapType,
    pub usage: HeapUsage,
    /// Skip the implicit make-resident the driver performs on creation.
    pub create_not_resident: bool,
}

/// Dimensionality of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// Usage flags carried by a resource descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFlags {
    pub allow_render_target: bool,
    pub allow_depth_stencil: bool,
}

/// Driver-facing description of a buffer or texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub dimension: ResourceDimension,
    /// Byte width for buffers, texel width for textures.
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    /// Requested placement alignment; 0 lets the driver choose.
    pub alignment: u64,
    pub sample_count: u32,
    pub flags: ResourceFlags,
}

impl ResourceDescriptor {
    /// Describe a plain buffer of `size` bytes.
    pub fn buffer(size: u64) -> Self {
        ResourceDescriptor {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            alignment: 0,
            sample_count: 1,
            flags: ResourceFlags::default(),
        }
    }

    /// Describe a 2D texture. Texel size is fixed at 4 bytes (RGBA8); the
    /// mock driver sizes resources from it and real drivers ignore it.
    pub fn texture_2d(width: u64, height: u32) -> Self {
        ResourceDescriptor {
            dimension: ResourceDimension::Texture2D,
            width,
            height,
            depth_or_array_size: 1,
            alignment: 0,
            sample_count: 1,
            flags: ResourceFlags::default(),
        }
    }

    /// Builder-style sample count override.
    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    /// Builder-style flag override.
    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn is_texture(&self) -> bool {
        !self.is_buffer()
    }

    /// True when the resource is renderable or a depth-stencil target, which
    /// disqualifies it from small-alignment placement.
    pub fn is_render_or_depth(&self) -> bool {
        self.flags.allow_render_target || self.flags.allow_depth_stencil
    }
}

/// Size and alignment the driver requires for a resource.
///
/// `size == INVALID_SIZE` is the sentinel for "the driver rejected this
/// descriptor"; callers must treat it as out-of-memory rather than
/// allocating `u64::MAX` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub size: u64,
    pub alignment: u64,
}

impl ResourceInfo {
    pub fn is_invalid(&self) -> bool {
        self.size == INVALID_SIZE
    }
}

/// Initial state a resource is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    GenericRead,
    CopyDest,
    CopySource,
    UnorderedAccess,
}

/// Optimized clear value for render-target or depth-stencil textures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValue {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u8,
}

/// Per-segment video memory info reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoMemoryInfo {
    /// Bytes the OS currently lets this process keep resident.
    pub budget: u64,
    /// Bytes the driver reports as currently resident.
    pub current_usage: u64,
}

/// Driver operations the allocator core consumes.
///
/// Residency semantics expected from implementations:
/// - `create_heap` implicitly makes the heap resident unless
///   `create_not_resident` is set.
/// - `create_committed_resource` always produces resident memory.
/// - `create_placed_resource` requires the target heap to be resident.
/// - `make_resident`/`evict` are best-effort and may fail with
///   [`DeviceError::OutOfDeviceMemory`].
pub trait GpuDevice: Send + Sync + fmt::Debug {
    fn query_resource_info(&self, desc: &ResourceDescriptor) -> ResourceInfo;

    fn create_heap(&self, desc: &HeapDescriptor) -> DeviceResult<DeviceHeap>;

    fn create_committed_resource(
        &self,
        heap_type: HeapType,
        usage: HeapUsage,
        desc: &ResourceDescriptor,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> DeviceResult<(DeviceHeap, DeviceResource)>;

    fn create_placed_resource(
        &self,
        heap: DeviceHeap,
        offset: u64,
        desc: &ResourceDescriptor,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> DeviceResult<DeviceResource>;

    /// Descriptor of an externally created resource (the import path).
    fn describe_resource(&self, resource: DeviceResource) -> DeviceResult<ResourceDescriptor>;

    fn query_video_memory_info(&self, segment: MemorySegment) -> DeviceResult<VideoMemoryInfo>;

    fn make_resident(&self, heaps: &[DeviceHeap]) -> DeviceResult<()>;

    fn evict(&self, heaps: &[DeviceHeap]) -> DeviceResult<()>;

    fn execute_command_lists(&self, queue: u32, lists: &[CommandList]) -> DeviceResult<()>;

    /// Signal `value` on the queue's fence after previously submitted work.
    fn signal(&self, queue: u32, value: u64) -> DeviceResult<()>;

    /// Highest fence value the queue has completed.
    fn completed_fence(&self, queue: u32) -> DeviceResult<u64>;

    fn destroy_heap(&self, heap: DeviceHeap);

    fn destroy_resource(&self, resource: DeviceResource);

    /// Whether the adapter has unified memory (single segment).
    fn is_uma(&self) -> bool;

    fn resource_heap_tier(&self) -> ResourceHeapTier;
}
