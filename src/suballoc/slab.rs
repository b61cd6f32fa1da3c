//! Slab sub-allocation
//!
//! [`SlabMemoryAllocator`] serves one fixed block size out of slabs whose
//! size is chosen per request: starting from the configured slab size, the
//! slab doubles until the waste a request leaves behind fits under the
//! fragmentation limit, then rounds to the next power of two. Slabs of one
//! size live in a cache holding a free list (slabs with room) and a full
//! list; a slab's backing memory is fetched from the downstream allocator
//! lazily on its first block and returned when its last block is freed,
//! leaving the empty slab parked for reuse.
//!
//! [`SlabCacheAllocator`] fronts one slab allocator per distinct block
//! size, keyed by the request size rounded to the block granularity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::allocation::{Allocation, AllocationMethod, BlockRef};
use crate::block::slab::SlabBlockAllocator;
use crate::stats::AllocatorStats;
use crate::suballoc::{AllocationRequest, MemoryAllocator};
use crate::util::{align_to, is_power_of_two, log2, next_power_of_two};
use crate::{GmmError, GmmResult};

struct Slab {
    blocks: SlabBlockAllocator,
    /// Backing memory, acquired on first block allocation
    memory: Option<Allocation>,
    /// Live blocks handed out of this slab
    ref_count: u64,
}

#[derive(Default)]
struct SlabCache {
    /// Slabs with at least one free block; most recently created in front
    free: VecDeque<usize>,
    full: Vec<usize>,
}

struct SlabState {
    slabs: Vec<Slab>,
    caches: Vec<SlabCache>,
    slabs_created: u32,
    used_block_count: u64,
    used_block_bytes: u64,
}

/// Fixed-block-size allocator over growable slabs.
pub struct SlabMemoryAllocator {
    block_size: u64,
    max_slab_size: u64,
    slab_size: u64,
    slab_alignment: u64,
    fragmentation_limit: f64,
    growth_factor: f64,
    next: Arc<dyn MemoryAllocator>,
    state: Mutex<SlabState>,
}

impl SlabMemoryAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_size: u64,
        max_slab_size: u64,
        slab_size: u64,
        slab_alignment: u64,
        fragmentation_limit: f64,
        growth_factor: f64,
        next: Arc<dyn MemoryAllocator>,
    ) -> GmmResult<Self> {
        if !is_power_of_two(max_slab_size) {
            return Err(GmmError::InvalidConfiguration(format!(
                "max slab size must be a power of two, got {}",
                max_slab_size
            )));
        }
        if block_size == 0 {
            return Err(GmmError::InvalidConfiguration(
                "slab block size must be non-zero".to_string(),
            ));
        }
        // A zero slab size means "deduce from the block size".
        let slab_size = if slab_size == 0 { block_size } else { slab_size };
        if slab_size > max_slab_size {
            return Err(GmmError::InvalidConfiguration(format!(
                "slab size {} exceeds max slab size {}",
                slab_size, max_slab_size
            )));
        }

        Ok(SlabMemoryAllocator {
            block_size,
            max_slab_size,
            slab_size,
            slab_alignment,
            fragmentation_limit,
            growth_factor,
            next,
            state: Mutex::new(SlabState {
                slabs: Vec::new(),
                caches: Vec::new(),
                slabs_created: 0,
                used_block_count: 0,
                used_block_bytes: 0,
            }),
        })
    }

    /// Pick the slab size for a request. The waste a request leaves in
    /// each block (`request % block_size`) must stay under the
    /// fragmentation limit of the whole slab; doubling the slab dilutes
    /// the waste until it does.
    fn compute_slab_size(&self, request_size: u64, slabs_created: u32) -> u64 {
        let mut slab_size = self.slab_size;
        if self.growth_factor > 1.0 {
            slab_size = (slab_size as f64 * self.growth_factor.powi(slabs_created as i32)) as u64;
            slab_size = slab_size.clamp(self.slab_size, self.max_slab_size);
        }

        let waste = request_size % self.block_size;
        while (waste as f64) > self.fragmentation_limit * slab_size as f64 {
            slab_size *= 2;
        }

        next_power_of_two(slab_size)
    }

    fn cache_index(&self, slab_size: u64) -> usize {
        (log2(self.max_slab_size) - log2(slab_size)) as usize
    }

    /// Slabs currently holding backing memory. Exposed for pool-reuse
    /// checks.
    pub fn pool_size(&self) -> usize {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return 0,
        };
        state.slabs.iter().filter(|s| s.memory.is_some()).count()
    }
}

impl MemoryAllocator for SlabMemoryAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        if request.size == 0 {
            return Err(GmmError::InvalidRequest(
                "requested size must be non-zero".to_string(),
            ));
        }
        if request.alignment == 0 || !is_power_of_two(request.alignment) {
            return Err(GmmError::InvalidRequest(format!(
                "requested alignment must be a non-zero power of two, got {}",
                request.alignment
            )));
        }
        if request.size > self.block_size {
            return Ok(None);
        }

        let mut state = self.state.lock()?;

        let slab_size = self.compute_slab_size(request.size, state.slabs_created);
        if slab_size > self.max_slab_size {
            return Ok(None);
        }

        let cache_index = self.cache_index(slab_size);
        if cache_index >= state.caches.len() {
            state.caches.resize_with(cache_index + 1, SlabCache::default);
        }

        // A slab that filled up on the previous allocation is spliced out
        // before a fresh one is considered.
        if let Some(&front) = state.caches[cache_index].free.front() {
            if state.slabs[front].blocks.is_full() {
                state.caches[cache_index].free.pop_front();
                state.caches[cache_index].full.push(front);
            }
        }

        if state.caches[cache_index].free.is_empty() {
            let block_count = slab_size / self.block_size;
            let slab_id = state.slabs.len();
            state.slabs.push(Slab {
                blocks: SlabBlockAllocator::new(block_count, self.block_size),
                memory: None,
                ref_count: 0,
            });
            state.slabs_created += 1;
            state.caches[cache_index].free.push_front(slab_id);
        }

        let slab_id = match state.caches[cache_index].free.front() {
            Some(&id) => id,
            None => {
                return Err(GmmError::Internal(
                    "slab free list empty after refill".to_string(),
                ))
            }
        };

        // Acquire the slab's backing memory lazily on its first block.
        if state.slabs[slab_id].memory.is_none() {
            let memory_request = AllocationRequest {
                size: slab_size,
                alignment: self.slab_alignment,
                never_allocate: request.never_allocate,
                always_prefetch: request.always_prefetch,
            };
            match self.next.try_allocate(&memory_request)? {
                Some(allocation) => state.slabs[slab_id].memory = Some(allocation),
                None => return Ok(None),
            }
        }

        let block_offset = match state.slabs[slab_id]
            .blocks
            .try_allocate(self.block_size, request.alignment)
        {
            Some(offset) => offset,
            None => {
                debug_assert!(false, "free-listed slab refused a block");
                return Ok(None);
            }
        };

        state.slabs[slab_id].ref_count += 1;

        if state.slabs[slab_id].blocks.is_full() {
            state.caches[cache_index].free.retain(|&id| id != slab_id);
            state.caches[cache_index].full.push(slab_id);
        }

        state.used_block_count += 1;
        state.used_block_bytes += self.block_size;

        let (memory, slab_offset) = match &state.slabs[slab_id].memory {
            Some(allocation) => (allocation.memory.clone(), allocation.offset),
            None => {
                return Err(GmmError::Internal(
                    "slab lost its backing memory mid-allocation".to_string(),
                ))
            }
        };

        Ok(Some(Allocation {
            memory,
            offset: slab_offset + block_offset,
            size: self.block_size,
            request_size: request.size,
            method: AllocationMethod::SubAllocated,
            block: BlockRef::Slab {
                block_size: self.block_size,
                slab: slab_id,
                offset: block_offset,
            },
        }))
    }

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        let (slab_id, block_offset) = match allocation.block {
            BlockRef::Slab { slab, offset, .. } => (slab, offset),
            _ => {
                return Err(GmmError::Internal(
                    "slab allocator asked to free a non-slab block".to_string(),
                ))
            }
        };

        let mut state = self.state.lock()?;

        if slab_id >= state.slabs.len() {
            return Err(GmmError::Internal(format!(
                "unknown slab id {} on deallocate",
                slab_id
            )));
        }

        let slab_size = state.slabs[slab_id].blocks.block_count() * self.block_size;
        let cache_index = self.cache_index(next_power_of_two(slab_size));

        // A full slab becomes allocatable again; splice it back in front.
        if state.slabs[slab_id].blocks.is_full() {
            state.caches[cache_index].full.retain(|&id| id != slab_id);
            state.caches[cache_index].free.push_front(slab_id);
        }

        state.slabs[slab_id].blocks.deallocate(block_offset);
        state.used_block_count = state.used_block_count.saturating_sub(1);
        state.used_block_bytes = state.used_block_bytes.saturating_sub(self.block_size);

        // Drop the client's heap reference before the backing memory is
        // potentially returned downstream.
        drop(allocation);

        let slab = &mut state.slabs[slab_id];
        slab.ref_count = slab.ref_count.saturating_sub(1);
        if slab.ref_count == 0 {
            if let Some(memory) = slab.memory.take() {
                self.next.deallocate(memory)?;
            }
        }
        Ok(())
    }

    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        self.next.release_memory(bytes_to_release)
    }

    fn stats(&self) -> AllocatorStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return AllocatorStats::default(),
        };
        AllocatorStats {
            used_block_count: state.used_block_count,
            used_block_bytes: state.used_block_bytes,
            ..Default::default()
        }
    }

    fn memory_size(&self) -> u64 {
        self.block_size
    }

    fn memory_alignment(&self) -> u64 {
        self.slab_alignment
    }
}

struct CacheEntry {
    allocator: Arc<SlabMemoryAllocator>,
    /// Live allocations routed through this entry
    live: u64,
}

struct CacheState {
    entries: HashMap<u64, CacheEntry>,
    size_cache_hits: u64,
    size_cache_misses: u64,
}

/// Routes requests to per-block-size slab allocators created on demand.
pub struct SlabCacheAllocator {
    min_block_size: u64,
    max_slab_size: u64,
    slab_size: u64,
    slab_alignment: u64,
    fragmentation_limit: f64,
    growth_factor: f64,
    next: Arc<dyn MemoryAllocator>,
    state: Mutex<CacheState>,
}

impl SlabCacheAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        min_block_size: u64,
        max_slab_size: u64,
        slab_size: u64,
        slab_alignment: u64,
        fragmentation_limit: f64,
        growth_factor: f64,
        next: Arc<dyn MemoryAllocator>,
    ) -> GmmResult<Self> {
        if !is_power_of_two(max_slab_size) {
            return Err(GmmError::InvalidConfiguration(format!(
                "max slab size must be a power of two, got {}",
                max_slab_size
            )));
        }
        if !is_power_of_two(min_block_size) {
            return Err(GmmError::InvalidConfiguration(format!(
                "min block size must be a power of two, got {}",
                min_block_size
            )));
        }

        Ok(SlabCacheAllocator {
            min_block_size,
            max_slab_size,
            slab_size,
            slab_alignment,
            fragmentation_limit,
            growth_factor,
            next,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                size_cache_hits: 0,
                size_cache_misses: 0,
            }),
        })
    }

    /// Distinct block sizes with a live slab allocator.
    pub fn entry_count(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Slabs holding backing memory across all entries.
    pub fn pool_size(&self) -> usize {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return 0,
        };
        state
            .entries
            .values()
            .map(|e| e.allocator.pool_size())
            .sum()
    }
}

impl MemoryAllocator for SlabCacheAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> GmmResult<Option<Allocation>> {
        if request.size == 0 {
            return Err(GmmError::InvalidRequest(
                "requested size must be non-zero".to_string(),
            ));
        }
        if request.alignment == 0 || !is_power_of_two(request.alignment) {
            return Err(GmmError::InvalidRequest(format!(
                "requested alignment must be a non-zero power of two, got {}",
                request.alignment
            )));
        }

        let block_size = align_to(request.size, self.min_block_size);

        // A block larger than the configured slab can never fit one.
        if self.slab_size != 0 && block_size > self.slab_size {
            return Ok(None);
        }

        let mut state = self.state.lock()?;

        let allocator = if state.entries.contains_key(&block_size) {
            state.size_cache_hits += 1;
            match state.entries.get(&block_size) {
                Some(entry) => entry.allocator.clone(),
                None => {
                    return Err(GmmError::Internal(
                        "slab cache entry vanished during lookup".to_string(),
                    ))
                }
            }
        } else {
            state.size_cache_misses += 1;
            let allocator = Arc::new(SlabMemoryAllocator::new(
                block_size,
                self.max_slab_size,
                self.slab_size,
                self.slab_alignment,
                self.fragmentation_limit,
                self.growth_factor,
                self.next.clone(),
            )?);
            state.entries.insert(
                block_size,
                CacheEntry {
                    allocator: allocator.clone(),
                    live: 0,
                },
            );
            allocator
        };

        let block_request = AllocationRequest {
            size: block_size,
            alignment: request.alignment,
            never_allocate: request.never_allocate,
            always_prefetch: request.always_prefetch,
        };
        let result = allocator.try_allocate(&block_request)?;

        match result {
            Some(mut allocation) => {
                allocation.request_size = request.size;
                if let Some(entry) = state.entries.get_mut(&block_size) {
                    entry.live += 1;
                }
                Ok(Some(allocation))
            }
            None => {
                // Drop an entry that never served anything.
                let unused = state
                    .entries
                    .get(&block_size)
                    .map(|entry| entry.live == 0)
                    .unwrap_or(false);
                if unused {
                    state.entries.remove(&block_size);
                }
                Ok(None)
            }
        }
    }

    fn deallocate(&self, allocation: Allocation) -> GmmResult<()> {
        let block_size = match allocation.block {
            BlockRef::Slab { block_size, .. } => block_size,
            _ => {
                return Err(GmmError::Internal(
                    "slab cache asked to free a non-slab block".to_string(),
                ))
            }
        };

        let mut state = self.state.lock()?;
        let allocator = match state.entries.get(&block_size) {
            Some(entry) => entry.allocator.clone(),
            None => {
                return Err(GmmError::Internal(format!(
                    "no slab allocator for block size {}",
                    block_size
                )))
            }
        };

        allocator.deallocate(allocation)?;

        let remove = match state.entries.get_mut(&block_size) {
            Some(entry) => {
                entry.live = entry.live.saturating_sub(1);
                entry.live == 0
            }
            None => false,
        };
        // The last allocation of a size retires its allocator; parked
        // slabs inside it hold no memory by now.
        if remove {
            state.entries.remove(&block_size);
        }
        Ok(())
    }

    fn release_memory(&self, bytes_to_release: Option<u64>) -> u64 {
        self.next.release_memory(bytes_to_release)
    }

    fn stats(&self) -> AllocatorStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return AllocatorStats::default(),
        };
        let mut stats = AllocatorStats {
            size_cache_hits: state.size_cache_hits,
            size_cache_misses: state.size_cache_misses,
            ..Default::default()
        };
        for entry in state.entries.values() {
            let child = entry.allocator.stats();
            stats.used_block_count += child.used_block_count;
            stats.used_block_bytes += child.used_block_bytes;
        }
        stats
    }

    fn memory_size(&self) -> u64 {
        if self.slab_size != 0 {
            self.slab_size
        } else {
            self.max_slab_size
        }
    }

    fn memory_alignment(&self) -> u64 {
        self.slab_alignment
    }
}
