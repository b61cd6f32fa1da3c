//! Property tests for allocator accounting invariants

use std::sync::Arc;

use proptest::prelude::*;

use vramforge::block::BuddyBlockAllocator;
use vramforge::device::{GpuDevice, HeapType, MockDevice, ResourceDescriptor, ResourceState};
use vramforge::{AllocationDescriptor, AllocatorDescriptor, ResourceAllocator};

const KIB: u64 = 1024;

proptest! {
    // After any interleaving of allocations and releases, live buddy
    // blocks never overlap, and returning everything restores the single
    // root block.
    #[test]
    fn buddy_blocks_never_overlap(
        ops in prop::collection::vec((1u64..=64u64, any::<bool>(), any::<prop::sample::Index>()), 1..80)
    ) {
        let mut allocator = BuddyBlockAllocator::new(256).unwrap();
        let mut live = Vec::new();

        for (size, release, index) in ops {
            if release && !live.is_empty() {
                let block = live.swap_remove(index.index(live.len()));
                allocator.deallocate(block);
            } else if let Some(block) = allocator.try_allocate(size, 1) {
                live.push(block);
            }

            let mut ranges: Vec<(u64, u64)> = live
                .iter()
                .map(|b| (b.offset, b.offset + b.size))
                .collect();
            ranges.sort();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
            }
        }

        for block in live.drain(..) {
            allocator.deallocate(block);
        }
        prop_assert_eq!(allocator.free_block_count(), 1);
        let root = allocator.try_allocate(256, 1).unwrap();
        prop_assert_eq!(root.offset, 0);
        prop_assert_eq!(root.size, 256);
    }

    // The facade's used-block accounting always equals the bytes reserved
    // by live allocations, and drops back to zero.
    #[test]
    fn facade_block_accounting_matches_live_set(
        ops in prop::collection::vec((1u64..=4u64, any::<bool>(), any::<prop::sample::Index>()), 1..24)
    ) {
        let device = Arc::new(MockDevice::new());
        let descriptor = AllocatorDescriptor {
            preferred_resource_heap_size: 512 * KIB,
            max_resource_heap_size: 2048 * KIB,
            max_resource_size_for_pooling: 512 * KIB,
            ..Default::default()
        };
        let allocator =
            ResourceAllocator::new(device.clone() as Arc<dyn GpuDevice>, descriptor).unwrap();
        let alloc_desc = AllocationDescriptor::with_heap_type(HeapType::Default);

        let mut live = Vec::new();
        for (units, release, index) in ops {
            if release && !live.is_empty() {
                let allocation = live.swap_remove(index.index(live.len()));
                allocator.deallocate(allocation).unwrap();
            } else {
                let desc = ResourceDescriptor::buffer(units * 64 * KIB);
                let allocation = allocator
                    .create_resource(&alloc_desc, &desc, ResourceState::Common, None)
                    .unwrap();
                live.push(allocation);
            }

            let expected: u64 = live.iter().map(|a| a.size()).sum();
            prop_assert_eq!(allocator.stats().used_block_bytes, expected);
            prop_assert_eq!(allocator.stats().used_block_count, live.len() as u64);
        }

        for allocation in live.drain(..) {
            allocator.deallocate(allocation).unwrap();
        }
        prop_assert_eq!(allocator.stats().used_block_bytes, 0);

        // Trimming the pools releases every remaining heap.
        allocator.release_memory(None);
        prop_assert_eq!(device.live_heap_count(), 0);
    }
}
