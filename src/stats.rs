//! Allocator usage counters
//!
//! Every allocator in the pipeline tracks its own slice of these counters;
//! wrappers fold their downstream allocator's stats in so the facade can
//! report a single aggregate snapshot.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Usage counters for a single allocator or an aggregated pipeline.
///
/// Block counters describe sub-allocations handed to clients; heap counters
/// describe driver heaps created underneath them. `free_heap_bytes` is
/// memory held alive in pools for reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Number of live sub-allocated blocks
    pub used_block_count: u64,
    /// Bytes in live sub-allocated blocks
    pub used_block_bytes: u64,
    /// Number of live driver heaps
    pub used_heap_count: u64,
    /// Bytes in live driver heaps
    pub used_heap_bytes: u64,
    /// Bytes held in pools awaiting reuse
    pub free_heap_bytes: u64,
    /// Requests served from a pool or size cache
    pub size_cache_hits: u64,
    /// Requests that had to create new state
    pub size_cache_misses: u64,
    /// Prefetch-flagged requests that found no prefetched heap ready
    pub prefetch_misses: u64,
}

impl AddAssign for AllocatorStats {
    fn add_assign(&mut self, other: Self) {
        self.used_block_count += other.used_block_count;
        self.used_block_bytes += other.used_block_bytes;
        self.used_heap_count += other.used_heap_count;
        self.used_heap_bytes += other.used_heap_bytes;
        self.free_heap_bytes += other.free_heap_bytes;
        self.size_cache_hits += other.size_cache_hits;
        self.size_cache_misses += other.size_cache_misses;
        self.prefetch_misses += other.prefetch_misses;
    }
}

impl Add for AllocatorStats {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

/// Residency counters reported per memory segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidencyStats {
    /// Heaps currently charged against the segment budget
    pub resident_heap_count: u64,
    /// Bytes currently charged against the segment budget
    pub resident_heap_bytes: u64,
    /// Budget the segment is allowed to occupy
    pub budget: u64,
    /// Heaps evicted over the manager lifetime
    pub eviction_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_add() {
        let a = AllocatorStats {
            used_block_count: 1,
            used_block_bytes: 64,
            used_heap_count: 1,
            used_heap_bytes: 4096,
            free_heap_bytes: 0,
            size_cache_hits: 2,
            size_cache_misses: 1,
            prefetch_misses: 0,
        };
        let b = AllocatorStats {
            used_block_count: 2,
            used_block_bytes: 128,
            used_heap_count: 0,
            used_heap_bytes: 0,
            free_heap_bytes: 4096,
            size_cache_hits: 0,
            size_cache_misses: 3,
            prefetch_misses: 1,
        };

        let sum = a + b;
        assert_eq!(sum.used_block_count, 3);
        assert_eq!(sum.used_block_bytes, 192);
        assert_eq!(sum.used_heap_count, 1);
        assert_eq!(sum.free_heap_bytes, 4096);
        assert_eq!(sum.size_cache_hits, 2);
        assert_eq!(sum.size_cache_misses, 4);
        assert_eq!(sum.prefetch_misses, 1);
    }

    #[test]
    fn test_stats_serialize_round() {
        let stats = AllocatorStats {
            used_block_count: 7,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: AllocatorStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
