//! The native heap allocator: a process-scoped allocator over OS
//! virtual memory, serving as the substrate the rest of the object
//! model is built on.
//!
//! See spec section 4.1 for the full allocation/free algorithm this
//! implements; see [`crate::avl`] for the size-indexed free-region
//! tree and [`island`] for per-island bookkeeping.

pub mod island;
pub mod os;

use log::{debug, trace};

use crate::avl::AvlTree;
use crate::error::{corrupt, Error, Result};
use crate::utils::align_up_usize;

use island::{Island, IslandId, HEADER_SIZE};
use os::PageSource;

/// How many of the most recently touched islands are tried as growth
/// candidates before a request falls back to an unhinted reservation
/// (spec 4.1 step 3: "iterate at most K=3 most-recently-added
/// islands").
const GROWTH_CANDIDATES: usize = 3;

/// Default minimum island size, in pages.
const DEFAULT_MIN_PAGES: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    pub island_count: usize,
    pub reserved_bytes: usize,
    pub used_bytes: usize,
    pub largest_free_block: usize,
}

/// A process-scoped allocator over OS virtual memory. Not `Sync`:
/// per spec section 5 it is single-threaded by contract, and two
/// `ImageLayout`s may only be edited concurrently if they use
/// different `NativeHeap`s.
pub struct NativeHeap {
    page_source: Box<dyn PageSource>,
    islands: Vec<Island>,
    /// `free_size -> Vec<(island_id, free_start)>` (via [`AvlTree`]'s
    /// built-in duplicate-key stacking).
    size_index: AvlTree<usize, (IslandId, usize)>,
    min_pages: usize,
    next_island_id: IslandId,
}

impl NativeHeap {
    pub fn new(page_source: Box<dyn PageSource>) -> Self {
        NativeHeap {
            page_source,
            islands: Vec::new(),
            size_index: AvlTree::new(),
            min_pages: DEFAULT_MIN_PAGES,
            next_island_id: 1,
        }
    }

    pub fn with_min_pages(page_source: Box<dyn PageSource>, min_pages: usize) -> Self {
        let mut heap = Self::new(page_source);
        heap.min_pages = min_pages.max(1);
        heap
    }

    fn page_size(&self) -> usize {
        self.page_source.page_size()
    }

    fn min_island_len(&self) -> usize {
        self.min_pages * self.page_size()
    }

    fn index_insert(&mut self, size: usize, island: IslandId, start: usize) {
        if size >= HEADER_SIZE + 1 {
            self.size_index.insert(size, (island, start));
        }
    }

    fn index_remove(&mut self, size: usize, island: IslandId, start: usize) {
        if size >= HEADER_SIZE + 1 {
            self.size_index
                .remove_where(&size, |&(id, s)| id == island && s == start);
        }
    }

    fn island_mut(&mut self, id: IslandId) -> &mut Island {
        self.islands
            .iter_mut()
            .find(|i| i.id == id)
            .unwrap_or_else(|| corrupt!("island {id} referenced by size index but missing"))
    }

    fn island(&self, id: IslandId) -> &Island {
        self.islands
            .iter()
            .find(|i| i.id == id)
            .unwrap_or_else(|| corrupt!("island {id} referenced by size index but missing"))
    }

    /// Allocates `size` bytes aligned to `align`. `align` need not be
    /// a power of two (spec open question 1): the data offset is
    /// rounded up with plain division either way. Returns `None` for
    /// a zero-size request or if the OS refuses further reservation.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let align = align.max(1);
        if let Some(ptr) = self.try_allocate_existing(size, align) {
            return Some(ptr);
        }
        trace!("allocate({size}, align={align}): no existing region fits, growing");
        self.grow_for(size, align).ok()?;
        self.try_allocate_existing(size, align)
    }

    fn try_allocate_existing(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        let mut search_key = size + HEADER_SIZE;
        loop {
            let (key, candidates) = {
                let (&k, stack) = self.size_index.ceiling(&search_key)?;
                (k, stack.to_vec())
            };
            for (island_id, free_start) in candidates {
                let island = self.island(island_id);
                let Some((data_start, fs, free_size)) = island.try_fit(free_start, align) else {
                    continue;
                };
                if data_start + size <= fs + free_size {
                    self.index_remove(key, island_id, free_start);
                    let island = self.island_mut(island_id);
                    let (leading, trailing) = island.place(fs, free_size, data_start, size);
                    if let Some((s, sz)) = leading {
                        self.index_insert(sz, island_id, s);
                    }
                    if let Some((s, sz)) = trailing {
                        self.index_insert(sz, island_id, s);
                    }
                    // SAFETY: `data_start` is within `[0, island.len)`
                    // by construction of `try_fit`/`place`.
                    let island = self.island(island_id);
                    return Some(unsafe { island.base.add(data_start) });
                }
            }
            search_key = key + 1;
        }
    }

    /// Grows an existing island (by OS-adjacency) or reserves a new
    /// one large enough to satisfy a `size`/`align` request.
    fn grow_for(&mut self, size: usize, align: usize) -> Result<()> {
        let page_size = self.page_size();
        let needed = size + HEADER_SIZE + align;
        let want_len = align_up_usize(needed.max(self.min_island_len()), page_size);

        // Try hinting near the most recently touched islands so the
        // OS has a chance to return an adjacent run we can merge.
        let hint_candidates: Vec<*mut u8> = self
            .islands
            .iter()
            .rev()
            .take(GROWTH_CANDIDATES)
            .flat_map(|isl| {
                // Address arithmetic only, never dereferenced:
                // `wrapping_sub` avoids any strict-provenance concern
                // about leaving the island's allocation.
                let left_hint = isl.base.wrapping_sub(want_len);
                [isl.end(), left_hint]
            })
            .collect();

        // Only the first hint is actually tried: once we've reserved
        // `want_len` fresh bytes (merged or standalone) the request
        // is satisfiable, and trying further hints would reserve
        // memory we don't need.
        let hint = hint_candidates.first().copied();
        // SAFETY: `want_len` is a positive multiple of page_size.
        let run = unsafe { self.page_source.reserve(want_len, hint)? };
        debug!("reserved {} bytes at {:p} (hint {:?})", run.len, run.base, hint);
        let merged = self.integrate_run(run.base, run.len);
        if merged {
            debug!("merged fresh reservation into an existing island");
        }
        Ok(())
    }

    /// Folds a freshly reserved run into the island set: merges it
    /// with an adjacent island if one borders it on either side,
    /// otherwise creates a brand new island. Returns `true` if the
    /// run was merged into (or became) a usefully larger island.
    fn integrate_run(&mut self, base: *mut u8, len: usize) -> bool {
        for i in 0..self.islands.len() {
            if self.islands[i].end() == base {
                let (s, sz) = self.islands[i].grow_right(len);
                self.index_insert(sz, self.islands[i].id, s);
                return true;
            }
            if base.wrapping_add(len) == self.islands[i].base {
                let id = self.islands[i].id;
                // Remove any stale trailing-free index entry at
                // offset 0 before the shift invalidates its key.
                if let Some(&sz) = self.islands[i].free.get(&0) {
                    self.index_remove(sz, id, 0);
                }
                self.islands[i].grow_left(base, len);
                if let Some((&s, &sz)) = self.islands[i].free.iter().next() {
                    self.index_insert(sz, id, s);
                }
                return true;
            }
        }
        let id = self.next_island_id;
        self.next_island_id += 1;
        let island = Island::new(id, base, len);
        self.index_insert(len, id, 0);
        self.islands.push(island);
        false
    }

    /// Frees a pointer previously returned by [`NativeHeap::allocate`]
    /// or [`NativeHeap::realloc`]. Freeing a pointer this heap does
    /// not own is a fatal invariant violation (the specification
    /// treats use-after-free/double-free as `RuntimeCorruption`).
    pub fn free(&mut self, ptr: *mut u8) {
        let Some((island_id, data_start)) = self.locate(ptr) else {
            corrupt!("free() of pointer not owned by this heap");
        };
        let island = self.island_mut(island_id);
        let Some(outcome) = island.release(data_start) else {
            corrupt!("free() of an already-freed allocation");
        };
        if let Some((s, sz)) = outcome.consumed_before {
            self.index_remove(sz, island_id, s);
        }
        if let Some((s, sz)) = outcome.consumed_after {
            self.index_remove(sz, island_id, s);
        }
        let (ms, msz) = outcome.merged;
        self.index_insert(msz, island_id, ms);

        let is_empty = self.island(island_id).is_empty();
        if is_empty {
            trace!("island {island_id} is now empty, shrinking or destroying");
            self.shrink_or_destroy(island_id);
        }
    }

    /// Implements the state-machine transition `Populated -> Empty`
    /// (shrink to the minimum reservation) and, if another empty
    /// island is already being kept as a warm cache, `Empty ->
    /// Destroyed` for this one (only one empty island is kept idle at
    /// a time).
    fn shrink_or_destroy(&mut self, island_id: IslandId) {
        let min_len = self.min_island_len();
        let already_has_idle_empty = self
            .islands
            .iter()
            .any(|i| i.id != island_id && i.is_empty() && i.len <= min_len);

        if already_has_idle_empty {
            debug!("island {island_id} destroyed (another idle empty island is already kept)");
            self.destroy_island(island_id);
            return;
        }

        let (old_base, old_len) = {
            let island = self.island(island_id);
            (island.base, island.len)
        };
        if old_len <= min_len {
            return;
        }
        {
            let island = self.island(island_id);
            let (&old_start, _) = island
                .free
                .iter()
                .next()
                .expect("empty island has exactly one free region spanning it");
            debug_assert_eq!(old_start, 0);
        }
        self.index_remove(old_len, island_id, 0);

        // SAFETY: shrinking re-reserves a fresh, smaller run and
        // releases the old one; no live data exists in an empty
        // island, so there is nothing to preserve across the swap.
        let new_run = unsafe {
            match self.page_source.reserve(min_len, Some(old_base)) {
                Ok(run) => run,
                Err(_) => {
                    // Leave the island at its current size; shrinking
                    // is an optimization, not a correctness
                    // requirement.
                    self.index_insert(old_len, island_id, 0);
                    return;
                }
            }
        };
        let island = self.island_mut(island_id);
        island.base = new_run.base;
        island.len = new_run.len;
        island.free.clear();
        island.free.insert(0, new_run.len);
        self.index_insert(new_run.len, island_id, 0);
        // SAFETY: `old_base`/`old_len` describe the run we just
        // replaced; it is safe to release now that nothing
        // references it.
        unsafe {
            let _ = self
                .page_source
                .release(os::PageRun { base: old_base, len: old_len });
        }
    }

    fn destroy_island(&mut self, island_id: IslandId) {
        let Some(pos) = self.islands.iter().position(|i| i.id == island_id) else {
            return;
        };
        let island = self.islands.remove(pos);
        for (&start, &size) in &island.free {
            self.index_remove(size, island_id, start);
        }
        // SAFETY: the island is empty and is being removed from the
        // heap's bookkeeping in the same step; no outstanding
        // pointers into it remain.
        unsafe {
            let _ = self.page_source.release(os::PageRun {
                base: island.base,
                len: island.len,
            });
        }
    }

    fn locate(&self, ptr: *mut u8) -> Option<(IslandId, usize)> {
        for island in &self.islands {
            let start = island.base as usize;
            let end = island.end() as usize;
            let p = ptr as usize;
            if p >= start && p < end {
                let offset = p - start;
                if island.occupied.contains_key(&offset) {
                    return Some((island.id, offset));
                }
                return None;
            }
        }
        None
    }

    /// `true` if `ptr` is a live allocation owned by this heap.
    pub fn owns(&self, ptr: *mut u8) -> bool {
        self.locate(ptr).is_some()
    }

    /// Attempts to grow or shrink the allocation at `ptr` in place,
    /// without moving it. Succeeds only if the allocation's trailing
    /// free region has room (growing) or unconditionally (shrinking,
    /// which always fits and returns the freed tail to the free set).
    pub fn resize_in_place(&mut self, ptr: *mut u8, new_size: usize) -> bool {
        let Some((island_id, data_start)) = self.locate(ptr) else {
            return false;
        };
        let island = self.island(island_id);
        let old_size = *island.occupied.get(&data_start).unwrap();
        if new_size == old_size {
            return true;
        }
        if new_size < old_size {
            let freed_start = data_start + new_size;
            let freed_size = old_size - new_size;
            let island = self.island_mut(island_id);
            *island.occupied.get_mut(&data_start).unwrap() = new_size;
            // Re-run the same region-merge logic `release` uses, but
            // for a tail-shrink rather than a full free.
            self.merge_freed_region(island_id, freed_start, freed_size);
            return true;
        }
        // Growing in place requires the immediately following region
        // to be free and large enough.
        let region_end = data_start + old_size;
        let can_grow = island
            .free
            .get(&region_end)
            .is_some_and(|&sz| region_end + sz >= data_start + new_size);
        if !can_grow {
            return false;
        }
        let extra = new_size - old_size;
        let free_size = *island.free.get(&region_end).unwrap();
        self.index_remove(free_size, island_id, region_end);
        let island = self.island_mut(island_id);
        island.free.remove(&region_end);
        let leftover = free_size - extra;
        if leftover > 0 {
            island.free.insert(region_end + extra, leftover);
        }
        *island.occupied.get_mut(&data_start).unwrap() = new_size;
        if leftover > 0 {
            self.index_insert(leftover, island_id, region_end + extra);
        }
        true
    }

    /// Shared tail taken by [`NativeHeap::resize_in_place`]'s
    /// shrink path: folds a newly-freed sub-region back into the
    /// island's free bookkeeping and size index.
    fn merge_freed_region(&mut self, island_id: IslandId, start: usize, size: usize) {
        let island = self.island_mut(island_id);
        let before = island
            .free
            .range(..start)
            .next_back()
            .filter(|(&s, &sz)| s + sz == start)
            .map(|(&s, &sz)| (s, sz));
        let after = island.free.get(&(start + size)).map(|&sz| (start + size, sz));
        let merged_start = before.map(|(s, _)| s).unwrap_or(start);
        let merged_end = after.map(|(s, sz)| s + sz).unwrap_or(start + size);
        if let Some((s, sz)) = before {
            island.free.remove(&s);
            self.index_remove(sz, island_id, s);
        }
        if let Some((s, sz)) = after {
            island.free.remove(&s);
            self.index_remove(sz, island_id, s);
        }
        let merged_size = merged_end - merged_start;
        self.island_mut(island_id).free.insert(merged_start, merged_size);
        self.index_insert(merged_size, island_id, merged_start);
    }

    /// Reallocates `ptr` to `new_size`, trying [`resize_in_place`]
    /// first and falling back to allocate-copy-free.
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize, align: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            return self.allocate(new_size, align);
        }
        if new_size == 0 {
            self.free(ptr);
            return None;
        }
        if self.resize_in_place(ptr, new_size) {
            return Some(ptr);
        }
        let (island_id, data_start) = self.locate(ptr)?;
        let old_size = *self.island(island_id).occupied.get(&data_start).unwrap();
        let new_ptr = self.allocate(new_size, align)?;
        let copy_len = old_size.min(new_size);
        // SAFETY: `ptr` and `new_ptr` are both live, non-overlapping
        // (freshly allocated) regions of at least `copy_len` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
        }
        self.free(ptr);
        Some(new_ptr)
    }

    /// Invokes `callback` with `(pointer, size)` for every live
    /// allocation across every island, in address order.
    pub fn walk<F: FnMut(*mut u8, usize)>(&self, mut callback: F) {
        for island in &self.islands {
            for (&start, &size) in &island.occupied {
                // SAFETY: `start` is within `[0, island.len)`.
                callback(unsafe { island.base.add(start) }, size);
            }
        }
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            island_count: self.islands.len(),
            reserved_bytes: self.islands.iter().map(|i| i.len).sum(),
            used_bytes: self.islands.iter().map(|i| i.used_bytes()).sum(),
            largest_free_block: self.islands.iter().map(|i| i.largest_free()).max().unwrap_or(0),
        }
    }
}

impl Drop for NativeHeap {
    fn drop(&mut self) {
        let ids: Vec<IslandId> = self.islands.iter().map(|i| i.id).collect();
        for id in ids {
            self.destroy_island(id);
        }
    }
}

/// Convenience constructor using the real OS page source.
impl Default for NativeHeap {
    fn default() -> Self {
        NativeHeap::new(Box::new(os::SystemPages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use os::ArenaPages;

    fn test_heap() -> NativeHeap {
        NativeHeap::with_min_pages(Box::new(ArenaPages::new(4096)), 4)
    }

    #[test]
    fn allocate_and_free_returns_to_empty() {
        let mut heap = test_heap();
        let p1 = heap.allocate(64, 8).expect("alloc 1");
        let p2 = heap.allocate(128, 16).expect("alloc 2");
        assert!(heap.owns(p1));
        assert!(heap.owns(p2));
        assert_ne!(p1, p2);
        heap.free(p1);
        heap.free(p2);
        let stats = heap.statistics();
        assert_eq!(stats.used_bytes, 0);
    }

    #[test]
    fn zero_size_allocation_returns_none() {
        let mut heap = test_heap();
        assert!(heap.allocate(0, 8).is_none());
    }

    #[test]
    fn resize_shrink_and_grow_in_place() {
        let mut heap = test_heap();
        let p = heap.allocate(256, 8).unwrap();
        assert!(heap.resize_in_place(p, 64));
        assert!(heap.resize_in_place(p, 200));
    }

    #[test]
    fn realloc_null_is_allocate_and_zero_is_free() {
        let mut heap = test_heap();
        let p = heap.realloc(core::ptr::null_mut(), 100, 8).unwrap();
        assert!(heap.owns(p));
        let p2 = heap.realloc(p, 0, 8);
        assert!(p2.is_none());
        assert!(!heap.owns(p));
    }

    #[test]
    fn non_power_of_two_alignment_is_honored() {
        // The allocator aligns the in-island data offset, not the
        // absolute returned pointer (an island's base address is
        // whatever the OS/arena handed back and need not itself be a
        // multiple of `align`); asserting on the offset is what spec
        // section 9 open question 1 actually promises.
        let mut heap = test_heap();
        let p = heap.allocate(10, 3).unwrap();
        let (_island_id, data_start) = heap.locate(p).unwrap();
        assert_eq!(data_start % 3, 0);
    }

    #[test]
    fn heap_torture_returns_to_baseline() {
        let mut heap = test_heap();
        let mut live: Vec<(*mut u8, usize)> = Vec::new();
        let mut seed: u32 = 0xC0FFEE;
        let mut rand = move |bound: u32| {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            seed % bound.max(1)
        };
        let aligns = [1usize, 8, 64, 4096];
        for _ in 0..20_000u32 {
            if !live.is_empty() && rand(3) == 0 {
                let idx = rand(live.len() as u32) as usize;
                let (ptr, _) = live.swap_remove(idx);
                heap.free(ptr);
            } else {
                let size = (rand(4096) + 1) as usize;
                let align = aligns[rand(4) as usize];
                if let Some(ptr) = heap.allocate(size, align) {
                    live.push((ptr, size));
                }
            }
        }
        for (ptr, _) in live {
            heap.free(ptr);
        }
        let stats = heap.statistics();
        assert_eq!(stats.used_bytes, 0);
        assert!(stats.island_count <= 1, "expected at most one idle island, got {}", stats.island_count);
    }
}
