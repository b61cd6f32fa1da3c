//! Residency budgeting and eviction
//!
//! Tracks, per memory segment, how many heap bytes the process keeps
//! physically resident and evicts least-recently-used heaps when a request
//! would exceed the budget. Eviction never touches heaps that are locked
//! (a placement operation is running against them) or referenced by
//! in-flight GPU work (their last-used fence has not completed).
//!
//! The LRU holds weak back-references only; heap owners remove their
//! records through [`ResidencyManager::remove_heap`] before destruction and
//! dead entries are pruned lazily as a backstop.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ResidencyDescriptor;
use crate::device::{CommandList, GpuDevice, HeapType, MemorySegment};
use crate::heap::{Heap, HeapId, ResidencyState, WeakHeap};
use crate::stats::ResidencyStats;
use crate::{GmmError, GmmResult};

/// Heaps referenced by a batch of command lists. Built by the caller per
/// submission and handed to
/// [`ResidencyManager::execute_command_lists`].
#[derive(Default)]
pub struct ResidencySet {
    heaps: Vec<Heap>,
}

impl ResidencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, heap: &Heap) {
        self.heaps.push(heap.clone());
    }

    pub fn reset(&mut self) {
        self.heaps.clear();
    }

    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    fn heaps(&self) -> &[Heap] {
        &self.heaps
    }
}

#[derive(Debug, Default)]
struct SegmentEntry {
    budget: u64,
    reservation: u64,
    usage: u64,
    /// MRU at the front, eviction candidates at the back
    lru: VecDeque<(HeapId, WeakHeap)>,
    eviction_count: u64,
}

#[derive(Debug, Default)]
struct ResidencyInner {
    segments: [SegmentEntry; 2],
    /// Queues that have had work submitted through this manager
    known_queues: Vec<u32>,
}

/// Per-process residency manager. Shared by every allocator pipeline that
/// creates heaps.
pub struct ResidencyManager {
    device: Arc<dyn GpuDevice>,
    descriptor: ResidencyDescriptor,
    is_uma: bool,
    /// Next fence value stamped on submissions
    fence_value: AtomicU64,
    inner: Mutex<ResidencyInner>,
}

fn segment_index(segment: MemorySegment) -> usize {
    match segment {
        MemorySegment::Local => 0,
        MemorySegment::NonLocal => 1,
    }
}

impl ResidencyManager {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        descriptor: ResidencyDescriptor,
    ) -> GmmResult<Arc<Self>> {
        descriptor.validate()?;

        let is_uma = device.is_uma();
        let manager = Arc::new(ResidencyManager {
            device,
            fence_value: AtomicU64::new(descriptor.initial_fence_value),
            descriptor,
            is_uma,
            inner: Mutex::new(ResidencyInner::default()),
        });
        manager.update_memory_segments()?;

        tracing::info!(is_uma, "residency manager created");
        Ok(manager)
    }

    pub fn is_uma(&self) -> bool {
        self.is_uma
    }

    /// Segment a heap of the given type is charged against. Everything is
    /// local on UMA adapters.
    pub fn memory_segment(&self, heap_type: HeapType) -> MemorySegment {
        if self.is_uma {
            return MemorySegment::Local;
        }
        match heap_type {
            HeapType::Default => MemorySegment::Local,
            HeapType::Upload | HeapType::Readback => MemorySegment::NonLocal,
        }
    }

    fn lock(&self) -> GmmResult<MutexGuard<'_, ResidencyInner>> {
        self.inner.lock().map_err(GmmError::from)
    }

    fn effective_segment(&self, segment: MemorySegment) -> usize {
        if self.is_uma {
            0
        } else {
            segment_index(segment)
        }
    }

    /// Refresh per-segment budgets from the driver.
    pub fn update_memory_segments(&self) -> GmmResult<()> {
        let mut inner = self.lock()?;
        self.update_segment_budget(&mut inner, MemorySegment::Local)?;
        if !self.is_uma {
            self.update_segment_budget(&mut inner, MemorySegment::NonLocal)?;
        }
        Ok(())
    }

    fn update_segment_budget(
        &self,
        inner: &mut ResidencyInner,
        segment: MemorySegment,
    ) -> GmmResult<()> {
        let info = self.device.query_video_memory_info(segment)?;
        let mut budget = (info.budget as f64 * self.descriptor.video_memory_budget) as u64;
        if self.descriptor.total_budget_limit > 0 {
            budget = budget.min(self.descriptor.total_budget_limit);
        }
        let entry = &mut inner.segments[segment_index(segment)];
        entry.budget = budget.saturating_sub(entry.reservation);
        tracing::debug!(?segment, budget = entry.budget, "segment budget updated");
        Ok(())
    }

    /// Reserve bytes out of the budget for memory the caller manages
    /// itself. Returns the reservation now in effect.
    pub fn set_video_memory_reservation(
        &self,
        segment: MemorySegment,
        bytes: u64,
    ) -> GmmResult<u64> {
        let mut inner = self.lock()?;
        let index = self.effective_segment(segment);
        inner.segments[index].reservation = bytes;
        drop(inner);

        self.update_memory_segments()?;
        Ok(bytes)
    }

    /// Start tracking a freshly created heap.
    ///
    /// Known-resident unlocked heaps enter the LRU immediately; heaps in
    /// other states are recorded by usage only (pending heaps are charged
    /// because the driver will make them resident on first use).
    pub fn insert_heap(&self, heap: &Heap) -> GmmResult<()> {
        if !heap.is_residency_managed() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let index = self.effective_segment(heap.segment());
        let entry = &mut inner.segments[index];

        match heap.residency_state() {
            ResidencyState::CurrentResident => {
                entry.usage += heap.size();
                if !heap.is_residency_locked() {
                    entry.lru.push_front((heap.id(), heap.downgrade()));
                }
            }
            ResidencyState::PendingResidency => {
                entry.usage += heap.size();
            }
            ResidencyState::Unknown | ResidencyState::Evicted => {}
        }
        Ok(())
    }

    /// Stop tracking a heap about to be destroyed or handed outside
    /// residency management.
    pub fn remove_heap(&self, heap: &Heap) -> GmmResult<()> {
        if !heap.is_residency_managed() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let index = self.effective_segment(heap.segment());
        let entry = &mut inner.segments[index];

        match heap.residency_state() {
            ResidencyState::CurrentResident | ResidencyState::PendingResidency => {
                entry.usage = entry.usage.saturating_sub(heap.size());
            }
            _ => {}
        }
        let id = heap.id();
        entry.lru.retain(|(entry_id, _)| *entry_id != id);
        heap.set_residency_state(ResidencyState::Unknown);
        Ok(())
    }

    /// Pin a heap resident for the duration of a placement operation.
    ///
    /// A heap observed resident by the returned `Ok` stays resident until
    /// the matching [`ResidencyManager::unlock_heap`].
    pub fn lock_heap(&self, heap: &Heap) -> GmmResult<()> {
        if !heap.is_residency_managed() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let index = self.effective_segment(heap.segment());

        match heap.residency_state() {
            ResidencyState::Evicted => {
                self.ensure_in_budget_locked(&mut inner, index, heap.size())?;
                self.make_resident_with_retry(&mut inner, index, heap)?;
                heap.set_residency_state(ResidencyState::CurrentResident);
                inner.segments[index].usage += heap.size();
            }
            ResidencyState::PendingResidency => {
                // Usage was charged at insertion; only the driver call is
                // outstanding.
                self.make_resident_with_retry(&mut inner, index, heap)?;
                heap.set_residency_state(ResidencyState::CurrentResident);
            }
            _ => {}
        }

        if heap.residency_lock_count() == 0 {
            let id = heap.id();
            inner.segments[index]
                .lru
                .retain(|(entry_id, _)| *entry_id != id);
        }
        heap.add_residency_lock();
        Ok(())
    }

    /// Release a residency lock; the heap becomes evictable again at zero.
    pub fn unlock_heap(&self, heap: &Heap) -> GmmResult<()> {
        if !heap.is_residency_managed() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let remaining = heap.release_residency_lock();
        if remaining == 0 && heap.residency_state() == ResidencyState::CurrentResident {
            let index = self.effective_segment(heap.segment());
            inner.segments[index]
                .lru
                .push_front((heap.id(), heap.downgrade()));
        }
        Ok(())
    }

    /// Evict until `bytes` more can be made resident inside the segment
    /// budget. Returns the bytes evicted.
    pub fn ensure_in_budget(&self, bytes: u64, segment: MemorySegment) -> GmmResult<u64> {
        let mut inner = self.lock()?;
        let index = self.effective_segment(segment);
        self.ensure_in_budget_locked(&mut inner, index, bytes)
    }

    fn completed_watermark(&self, known_queues: &[u32]) -> u64 {
        // The conservative bound across queues: work stamped above it may
        // still be running somewhere.
        known_queues
            .iter()
            .map(|queue| self.device.completed_fence(*queue).unwrap_or(0))
            .min()
            .unwrap_or(u64::MAX)
    }

    fn ensure_in_budget_locked(
        &self,
        inner: &mut ResidencyInner,
        index: usize,
        bytes: u64,
    ) -> GmmResult<u64> {
        if self.descriptor.update_budget_by_polling {
            let segment = if index == 0 {
                MemorySegment::Local
            } else {
                MemorySegment::NonLocal
            };
            self.update_segment_budget(inner, segment)?;
        }

        let mut freed = 0;
        loop {
            let entry = &inner.segments[index];
            if entry.usage.saturating_add(bytes) <= entry.budget {
                return Ok(freed);
            }

            let needed = entry.usage + bytes - entry.budget;
            let target = needed.max(self.descriptor.evict_batch_size);

            freed += self.evict_batch(inner, index, target)?;
        }
    }

    /// Evict up to `target` bytes from the LRU tail. Errors with
    /// `InsufficientBudget` when nothing is evictable.
    fn evict_batch(
        &self,
        inner: &mut ResidencyInner,
        index: usize,
        target: u64,
    ) -> GmmResult<u64> {
        let completed = self.completed_watermark(&inner.known_queues);

        let mut victims: Vec<Heap> = Vec::new();
        let mut dead: Vec<HeapId> = Vec::new();
        let mut collected = 0u64;

        for (id, weak) in inner.segments[index].lru.iter().rev() {
            if collected >= target {
                break;
            }
            match weak.upgrade() {
                None => dead.push(*id),
                Some(heap) => {
                    // In-flight work pins the heap as effectively locked.
                    if heap.last_used_fence() > completed {
                        continue;
                    }
                    collected += heap.size();
                    victims.push(heap);
                }
            }
        }

        let entry = &mut inner.segments[index];
        entry.lru.retain(|(id, _)| !dead.contains(id));

        if victims.is_empty() {
            return Err(GmmError::InsufficientBudget(format!(
                "usage {} over budget {} with no evictable heap",
                entry.usage, entry.budget
            )));
        }

        let handles: Vec<_> = victims.iter().filter_map(|h| h.device_heap()).collect();
        self.device.evict(&handles)?;

        let mut freed = 0;
        for heap in &victims {
            heap.set_residency_state(ResidencyState::Evicted);
            let id = heap.id();
            entry.lru.retain(|(entry_id, _)| *entry_id != id);
            entry.usage = entry.usage.saturating_sub(heap.size());
            entry.eviction_count += 1;
            freed += heap.size();
            tracing::debug!(heap = id, size = heap.size(), "heap evicted");
        }

        Ok(freed)
    }

    fn make_resident_with_retry(
        &self,
        inner: &mut ResidencyInner,
        index: usize,
        heap: &Heap,
    ) -> GmmResult<()> {
        let handle = heap.device_heap().ok_or_else(|| {
            GmmError::Internal("residency-managed heap without a driver handle".to_string())
        })?;

        loop {
            match self.device.make_resident(&[handle]) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_out_of_memory() => {
                    // The driver is harder up than our accounting believed;
                    // force another eviction round and retry.
                    let freed =
                        self.evict_batch(inner, index, self.descriptor.evict_batch_size)?;
                    if freed == 0 {
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Make every heap referenced by the submission resident, stamp fences
    /// and submit. Heaps touched here move to the MRU end of the LRU and
    /// are skipped by eviction until the stamped fence completes.
    pub fn execute_command_lists(
        &self,
        queue: u32,
        lists: &[CommandList],
        residency_sets: &[&ResidencySet],
    ) -> GmmResult<()> {
        let mut inner = self.lock()?;
        if !inner.known_queues.contains(&queue) {
            inner.known_queues.push(queue);
        }

        // Dedupe across sets; one submission may reference a heap many
        // times.
        let mut seen: HashSet<HeapId> = HashSet::new();
        let mut heaps: Vec<Heap> = Vec::new();
        for set in residency_sets {
            for heap in set.heaps() {
                if heap.is_residency_managed() && seen.insert(heap.id()) {
                    heaps.push(heap.clone());
                }
            }
        }

        // Bring evicted and pending members back, budget-first.
        let mut needed: [u64; 2] = [0, 0];
        for heap in &heaps {
            if heap.residency_state() == ResidencyState::Evicted {
                needed[self.effective_segment(heap.segment())] += heap.size();
            }
        }
        for (index, bytes) in needed.iter().enumerate() {
            if *bytes > 0 {
                self.ensure_in_budget_locked(&mut inner, index, *bytes)?;
            }
        }

        let to_make: Vec<Heap> = heaps
            .iter()
            .filter(|h| {
                matches!(
                    h.residency_state(),
                    ResidencyState::Evicted | ResidencyState::PendingResidency
                )
            })
            .cloned()
            .collect();
        if !to_make.is_empty() {
            let handles: Vec<_> = to_make.iter().filter_map(|h| h.device_heap()).collect();
            self.device.make_resident(&handles)?;
            for heap in &to_make {
                if heap.residency_state() == ResidencyState::Evicted {
                    let index = self.effective_segment(heap.segment());
                    inner.segments[index].usage += heap.size();
                }
                heap.set_residency_state(ResidencyState::CurrentResident);
            }
        }

        let fence = self.fence_value.fetch_add(1, Ordering::Relaxed) + 1;
        for heap in &heaps {
            heap.set_last_used_fence(fence);
            if heap.residency_lock_count() == 0
                && heap.residency_state() == ResidencyState::CurrentResident
            {
                let index = self.effective_segment(heap.segment());
                let id = heap.id();
                let entry = &mut inner.segments[index];
                entry.lru.retain(|(entry_id, _)| *entry_id != id);
                entry.lru.push_front((id, heap.downgrade()));
            }
        }

        self.device.execute_command_lists(queue, lists)?;
        self.device.signal(queue, fence)?;

        tracing::trace!(queue, fence, heaps = heaps.len(), "command lists executed");
        Ok(())
    }

    /// Counters for one segment.
    pub fn stats(&self, segment: MemorySegment) -> ResidencyStats {
        let inner = match self.lock() {
            Ok(inner) => inner,
            Err(_) => return ResidencyStats::default(),
        };
        let entry = &inner.segments[self.effective_segment(segment)];

        // Locked heaps are charged to usage but not listed in the LRU, so
        // the count reflects evictable heaps only.
        let resident_heap_count = entry
            .lru
            .iter()
            .filter(|(_, weak)| weak.upgrade().is_some())
            .count() as u64;

        ResidencyStats {
            resident_heap_count,
            resident_heap_bytes: entry.usage,
            budget: entry.budget,
            eviction_count: entry.eviction_count,
        }
    }

    /// Whether the heap currently sits in the eviction LRU. Exposed for
    /// invariant checks.
    pub fn is_heap_in_lru(&self, heap: &Heap) -> bool {
        let inner = match self.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let entry = &inner.segments[self.effective_segment(heap.segment())];
        entry.lru.iter().any(|(id, _)| *id == heap.id())
    }

    /// Evict across segments until `bytes` are reclaimed, draining the
    /// most over-budget segment first and round-robining after.
    pub fn trim_all(&self, bytes: u64) -> GmmResult<u64> {
        let mut inner = self.lock()?;
        let mut remaining = bytes;
        let mut total = 0;

        let mut order: Vec<usize> = if self.is_uma { vec![0] } else { vec![0, 1] };
        order.sort_by_key(|&i| {
            let entry = &inner.segments[i];
            std::cmp::Reverse(entry.usage.saturating_sub(entry.budget))
        });

        for index in order.into_iter().cycle().take(8) {
            if remaining == 0 {
                break;
            }
            match self.evict_batch(&mut inner, index, remaining) {
                Ok(freed) => {
                    total += freed;
                    remaining = remaining.saturating_sub(freed);
                }
                Err(GmmError::InsufficientBudget(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

impl std::fmt::Debug for ResidencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidencyManager")
            .field("is_uma", &self.is_uma)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
