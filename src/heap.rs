//! Driver heap wrapper
//!
//! A [`Heap`] is a cheaply clonable handle over one driver memory object
//! (a pageable heap, or the implicit heap behind a committed resource).
//! The last clone to drop releases the driver handle, so a heap stays alive
//! exactly as long as a pool entry or an allocation references it.
//!
//! Residency bookkeeping lives here as atomics; compound transitions are
//! serialized by the residency manager's lock.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::device::{DeviceHeap, DeviceResource, GpuDevice, HeapType, MemorySegment};

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity for residency bookkeeping.
pub type HeapId = u64;

/// Residency lifecycle of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyState {
    /// Not tracked; must be locked/unlocked manually to enter the cache
    Unknown,
    /// Created without implicit residency, not yet made resident
    PendingResidency,
    /// Occupies physical GPU-accessible memory
    CurrentResident,
    /// Paged out by the residency manager
    Evicted,
}

impl ResidencyState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ResidencyState::PendingResidency,
            2 => ResidencyState::CurrentResident,
            3 => ResidencyState::Evicted,
            _ => ResidencyState::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ResidencyState::Unknown => 0,
            ResidencyState::PendingResidency => 1,
            ResidencyState::CurrentResident => 2,
            ResidencyState::Evicted => 3,
        }
    }
}

/// Driver object backing a heap.
#[derive(Debug)]
pub enum HeapBacking {
    /// A pageable driver heap
    Heap(DeviceHeap),
    /// A committed resource owning both its heap and resource handles.
    /// Used by the small-buffer allocator which shares one driver buffer
    /// across many sub-allocations.
    Committed {
        heap: DeviceHeap,
        resource: DeviceResource,
    },
    /// Externally owned memory; never destroyed by us
    External,
}

#[derive(Debug)]
pub(crate) struct HeapInner {
    id: HeapId,
    device: Arc<dyn GpuDevice>,
    backing: HeapBacking,
    size: u64,
    alignment: u64,
    heap_type: HeapType,
    segment: MemorySegment,
    residency_managed: bool,
    state: AtomicU8,
    lock_count: AtomicU32,
    last_used_fence: AtomicU64,
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        match self.backing {
            HeapBacking::Heap(heap) => self.device.destroy_heap(heap),
            HeapBacking::Committed { heap, resource } => {
                self.device.destroy_resource(resource);
                self.device.destroy_heap(heap);
            }
            HeapBacking::External => {}
        }
        tracing::trace!(heap = self.id, size = self.size, "heap destroyed");
    }
}

/// Shared handle to a driver heap. Clone is refcount-cheap.
#[derive(Debug, Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

impl Heap {
    pub(crate) fn new(
        device: Arc<dyn GpuDevice>,
        backing: HeapBacking,
        size: u64,
        alignment: u64,
        heap_type: HeapType,
        segment: MemorySegment,
        residency_managed: bool,
        initial_state: ResidencyState,
    ) -> Self {
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(heap = id, size, alignment, "heap created");
        Heap {
            inner: Arc::new(HeapInner {
                id,
                device,
                backing,
                size,
                alignment,
                heap_type,
                segment,
                residency_managed,
                state: AtomicU8::new(initial_state.as_u8()),
                lock_count: AtomicU32::new(0),
                last_used_fence: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> HeapId {
        self.inner.id
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn alignment(&self) -> u64 {
        self.inner.alignment
    }

    pub fn heap_type(&self) -> HeapType {
        self.inner.heap_type
    }

    pub fn segment(&self) -> MemorySegment {
        self.inner.segment
    }

    /// Whether the heap participates in residency tracking. Imported
    /// resources do not.
    pub fn is_residency_managed(&self) -> bool {
        self.inner.residency_managed
    }

    /// Driver heap handle for placed-resource creation and residency calls.
    pub fn device_heap(&self) -> Option<DeviceHeap> {
        match self.inner.backing {
            HeapBacking::Heap(heap) | HeapBacking::Committed { heap, .. } => Some(heap),
            HeapBacking::External => None,
        }
    }

    /// Resource handle when the heap is backed by a committed resource.
    pub fn device_resource(&self) -> Option<DeviceResource> {
        match self.inner.backing {
            HeapBacking::Committed { resource, .. } => Some(resource),
            _ => None,
        }
    }

    pub fn residency_state(&self) -> ResidencyState {
        ResidencyState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_residency_state(&self, state: ResidencyState) {
        self.inner.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_resident(&self) -> bool {
        !self.inner.residency_managed
            || self.residency_state() == ResidencyState::CurrentResident
    }

    pub fn residency_lock_count(&self) -> u32 {
        self.inner.lock_count.load(Ordering::Acquire)
    }

    pub fn is_residency_locked(&self) -> bool {
        self.residency_lock_count() > 0
    }

    pub(crate) fn add_residency_lock(&self) -> u32 {
        self.inner.lock_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release_residency_lock(&self) -> u32 {
        debug_assert!(self.residency_lock_count() > 0);
        self.inner.lock_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn last_used_fence(&self) -> u64 {
        self.inner.last_used_fence.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_used_fence(&self, value: u64) {
        self.inner.last_used_fence.store(value, Ordering::Release);
    }

    pub(crate) fn downgrade(&self) -> WeakHeap {
        WeakHeap {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Identity comparison: two handles to the same driver heap.
    pub fn same_heap(&self, other: &Heap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Weak back-reference used by the residency LRU so the cache never keeps a
/// heap alive on its own.
#[derive(Debug, Clone)]
pub(crate) struct WeakHeap {
    inner: Weak<HeapInner>,
}

impl WeakHeap {
    pub(crate) fn upgrade(&self) -> Option<Heap> {
        self.inner.upgrade().map(|inner| Heap { inner })
    }
}
