//! Residency manager budgeting, locking and eviction

use std::sync::Arc;

use vramforge::device::{
    CommandList, GpuDevice, HeapType, HeapUsage, MemorySegment, MockDevice,
};
use vramforge::suballoc::{AllocationRequest, MemoryAllocator, ResourceHeapAllocator};
use vramforge::{Allocation, ResidencyDescriptor, ResidencyManager, ResidencySet, ResidencyState};

const HEAP_SIZE: u64 = 64 * 1024;

fn residency_descriptor() -> ResidencyDescriptor {
    ResidencyDescriptor {
        video_memory_budget: 1.0,
        evict_batch_size: 1,
        ..Default::default()
    }
}

fn managed_creator(
    device: &Arc<MockDevice>,
    residency: &Arc<ResidencyManager>,
) -> ResourceHeapAllocator {
    ResourceHeapAllocator::new(
        device.clone() as Arc<dyn GpuDevice>,
        Some(residency.clone()),
        HeapType::Default,
        HeapUsage::OnlyBuffers,
        MemorySegment::Local,
        HEAP_SIZE,
        false,
        false,
    )
}

fn allocate_heap(creator: &ResourceHeapAllocator) -> Allocation {
    creator
        .try_allocate(&AllocationRequest::new(HEAP_SIZE, HEAP_SIZE))
        .unwrap()
        .unwrap()
}

#[test]
fn test_usage_tracks_resident_heaps() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 4 * HEAP_SIZE);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    let b = allocate_heap(&creator);

    let stats = residency.stats(MemorySegment::Local);
    assert_eq!(stats.resident_heap_bytes, 2 * HEAP_SIZE);
    assert_eq!(stats.budget, 4 * HEAP_SIZE);
    assert!(residency.is_heap_in_lru(&a.memory));
    assert!(residency.is_heap_in_lru(&b.memory));

    creator.deallocate(a).unwrap();
    assert_eq!(
        residency.stats(MemorySegment::Local).resident_heap_bytes,
        HEAP_SIZE
    );

    creator.deallocate(b).unwrap();
    assert_eq!(
        residency.stats(MemorySegment::Local).resident_heap_bytes,
        0
    );
    device.assert_no_leak();
}

#[test]
fn test_locked_heap_leaves_lru_and_returns() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 4 * HEAP_SIZE);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    assert!(residency.is_heap_in_lru(&a.memory));

    residency.lock_heap(&a.memory).unwrap();
    assert!(!residency.is_heap_in_lru(&a.memory));
    assert!(a.memory.is_residency_locked());

    // Nested locks only re-enter the LRU at zero.
    residency.lock_heap(&a.memory).unwrap();
    residency.unlock_heap(&a.memory).unwrap();
    assert!(!residency.is_heap_in_lru(&a.memory));

    residency.unlock_heap(&a.memory).unwrap();
    assert!(residency.is_heap_in_lru(&a.memory));

    creator.deallocate(a).unwrap();
}

// Spec scenario: three heaps, one locked, eviction spares the locked one.
#[test]
fn test_eviction_skips_locked_heap() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 3 * HEAP_SIZE);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    let b = allocate_heap(&creator);
    let c = allocate_heap(&creator);

    residency.lock_heap(&b.memory).unwrap();

    // Room for two more heaps is needed; only A and C are evictable.
    let evicted = residency
        .ensure_in_budget(2 * HEAP_SIZE, MemorySegment::Local)
        .unwrap();
    assert_eq!(evicted, 2 * HEAP_SIZE);

    assert_eq!(a.memory.residency_state(), ResidencyState::Evicted);
    assert_eq!(c.memory.residency_state(), ResidencyState::Evicted);
    assert_eq!(b.memory.residency_state(), ResidencyState::CurrentResident);

    // The locked heap stays charged.
    assert_eq!(
        residency.stats(MemorySegment::Local).resident_heap_bytes,
        HEAP_SIZE
    );

    residency.unlock_heap(&b.memory).unwrap();
    creator.deallocate(a).unwrap();
    creator.deallocate(b).unwrap();
    creator.deallocate(c).unwrap();
    device.assert_no_leak();
}

#[test]
fn test_insufficient_budget_when_nothing_evictable() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, HEAP_SIZE);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    residency.lock_heap(&a.memory).unwrap();

    let result = residency.ensure_in_budget(HEAP_SIZE, MemorySegment::Local);
    assert!(matches!(
        result,
        Err(vramforge::GmmError::InsufficientBudget(_))
    ));

    residency.unlock_heap(&a.memory).unwrap();
    creator.deallocate(a).unwrap();
}

#[test]
fn test_lock_restores_evicted_heap() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 2 * HEAP_SIZE);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    let b = allocate_heap(&creator);

    // Force A (the LRU tail) out.
    residency
        .ensure_in_budget(HEAP_SIZE, MemorySegment::Local)
        .unwrap();
    assert_eq!(a.memory.residency_state(), ResidencyState::Evicted);
    let a_handle = a.memory.device_heap().unwrap();
    assert!(!device.heap_is_resident(a_handle));

    // Locking an evicted heap pages it back in.
    residency.lock_heap(&a.memory).unwrap();
    assert_eq!(a.memory.residency_state(), ResidencyState::CurrentResident);
    assert!(device.heap_is_resident(a_handle));
    assert!(a.memory.is_resident());

    residency.unlock_heap(&a.memory).unwrap();
    creator.deallocate(a).unwrap();
    creator.deallocate(b).unwrap();
}

#[test]
fn test_in_flight_heaps_are_not_evicted() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 2 * HEAP_SIZE);
    device.set_auto_complete_fences(false);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    let b = allocate_heap(&creator);

    let mut set = ResidencySet::new();
    set.add(&a.memory);
    set.add(&b.memory);
    residency
        .execute_command_lists(0, &[CommandList(1)], &[&set])
        .unwrap();

    // Everything is referenced by in-flight work; nothing may be evicted.
    let result = residency.ensure_in_budget(HEAP_SIZE, MemorySegment::Local);
    assert!(matches!(
        result,
        Err(vramforge::GmmError::InsufficientBudget(_))
    ));

    // Completing the fence releases the heaps for eviction.
    device.complete_fence(0, a.memory.last_used_fence());
    let evicted = residency
        .ensure_in_budget(HEAP_SIZE, MemorySegment::Local)
        .unwrap();
    assert!(evicted >= HEAP_SIZE);

    creator.deallocate(a).unwrap();
    creator.deallocate(b).unwrap();
}

#[test]
fn test_execute_command_lists_restores_evicted_members() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 2 * HEAP_SIZE);
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    let b = allocate_heap(&creator);

    residency
        .ensure_in_budget(HEAP_SIZE, MemorySegment::Local)
        .unwrap();
    assert_eq!(a.memory.residency_state(), ResidencyState::Evicted);

    // Submitting against the evicted heap pages it back in (and may push
    // another heap out to stay within budget).
    let mut set = ResidencySet::new();
    set.add(&a.memory);
    residency
        .execute_command_lists(0, &[CommandList(1)], &[&set])
        .unwrap();

    assert_eq!(a.memory.residency_state(), ResidencyState::CurrentResident);
    assert!(a.memory.last_used_fence() > 0);

    creator.deallocate(a).unwrap();
    creator.deallocate(b).unwrap();
}

#[test]
fn test_budget_polling_sees_driver_changes() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 4 * HEAP_SIZE);

    let descriptor = ResidencyDescriptor {
        video_memory_budget: 1.0,
        evict_batch_size: 1,
        update_budget_by_polling: true,
        ..Default::default()
    };
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, descriptor).unwrap();
    let creator = managed_creator(&device, &residency);

    let a = allocate_heap(&creator);
    let b = allocate_heap(&creator);

    // Tighten the driver budget; the next check re-polls and must evict.
    device.set_budget(MemorySegment::Local, HEAP_SIZE);
    let evicted = residency
        .ensure_in_budget(0, MemorySegment::Local)
        .unwrap();
    assert_eq!(evicted, HEAP_SIZE);

    creator.deallocate(a).unwrap();
    creator.deallocate(b).unwrap();
}

#[test]
fn test_budget_fraction_and_reservation() {
    let device = Arc::new(MockDevice::new());
    device.set_budget(MemorySegment::Local, 100 * HEAP_SIZE);

    let descriptor = ResidencyDescriptor {
        video_memory_budget: 0.5,
        evict_batch_size: 1,
        ..Default::default()
    };
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, descriptor).unwrap();

    assert_eq!(
        residency.stats(MemorySegment::Local).budget,
        50 * HEAP_SIZE
    );

    residency
        .set_video_memory_reservation(MemorySegment::Local, 10 * HEAP_SIZE)
        .unwrap();
    assert_eq!(
        residency.stats(MemorySegment::Local).budget,
        40 * HEAP_SIZE
    );
}

#[test]
fn test_uma_folds_segments() {
    let device = Arc::new(MockDevice::uma());
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();

    assert!(residency.is_uma());
    assert_eq!(
        residency.memory_segment(HeapType::Upload),
        MemorySegment::Local
    );
    assert_eq!(
        residency.memory_segment(HeapType::Default),
        MemorySegment::Local
    );
}

#[test]
fn test_unmanaged_heaps_are_ignored() {
    let device = Arc::new(MockDevice::new());
    let residency =
        ResidencyManager::new(device.clone() as Arc<dyn GpuDevice>, residency_descriptor())
            .unwrap();

    // Creator without a residency manager produces unmanaged heaps.
    let creator = ResourceHeapAllocator::new(
        device.clone() as Arc<dyn GpuDevice>,
        None,
        HeapType::Default,
        HeapUsage::OnlyBuffers,
        MemorySegment::Local,
        HEAP_SIZE,
        false,
        false,
    );
    let a = allocate_heap(&creator);

    residency.insert_heap(&a.memory).unwrap();
    assert!(!residency.is_heap_in_lru(&a.memory));
    assert_eq!(
        residency.stats(MemorySegment::Local).resident_heap_bytes,
        0
    );

    creator.deallocate(a).unwrap();
}
