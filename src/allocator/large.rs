//! Large tier: each object gets its own page-aligned mapped region.
//!
//! Regions are recorded in a tracking map until freed, then returned
//! straight to the OS. Large objects are never moved or recycled.

use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::allocator::mmap::{map_raw, unmap_raw};
use crate::header::BaseType;
use crate::stats::TierStats;
use crate::util::align_usize;

const OS_PAGE: usize = 4096;

struct LargeAllocation {
    size: usize,
    mapped: usize,
    allocated_at: Instant,
    base_type: BaseType,
}

pub struct LargeHeap {
    allocations: FxHashMap<usize, LargeAllocation>,
    stats: TierStats,
}

impl LargeHeap {
    pub fn new() -> Self {
        Self {
            allocations: FxHashMap::default(),
            stats: TierStats::default(),
        }
    }

    /// Every large allocation is a fresh mapping, so the isolated contract
    /// holds unconditionally here.
    pub fn allocate(&mut self, size: usize, base_type: BaseType) -> *mut u8 {
        let mapped = align_usize(size, OS_PAGE);
        let ptr = map_raw(mapped);
        if ptr.is_null() {
            return ptr;
        }
        self.allocations.insert(
            ptr as usize,
            LargeAllocation {
                size,
                mapped,
                allocated_at: Instant::now(),
                base_type,
            },
        );
        self.stats.allocations += 1;
        self.stats.bytes_in_use += mapped;
        self.stats.pages += mapped / OS_PAGE;
        ptr
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        self.allocations.contains_key(&(ptr as usize))
    }

    pub fn deallocate(&mut self, ptr: *mut u8) -> bool {
        match self.allocations.remove(&(ptr as usize)) {
            Some(entry) => {
                unsafe { unmap_raw(ptr, entry.mapped) };
                self.stats.deallocations += 1;
                self.stats.bytes_in_use -= entry.mapped;
                self.stats.pages -= entry.mapped / OS_PAGE;
                true
            }
            None => false,
        }
    }

    /// Requested size and type of a live allocation.
    pub fn lookup(&self, ptr: *const u8) -> Option<(usize, BaseType)> {
        self.allocations
            .get(&(ptr as usize))
            .map(|a| (a.size, a.base_type))
    }

    /// Age of the oldest live allocation, a diagnostic for leak hunting.
    pub fn oldest_live(&self) -> Option<(usize, BaseType, std::time::Duration)> {
        self.allocations
            .iter()
            .max_by_key(|(_, a)| a.allocated_at.elapsed())
            .map(|(&addr, a)| (addr, a.base_type, a.allocated_at.elapsed()))
    }

    pub fn live_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn destroy(&mut self) {
        for (&addr, entry) in self.allocations.iter() {
            unsafe { unmap_raw(addr as *mut u8, entry.mapped) };
        }
        self.allocations.clear();
    }
}

impl Default for LargeHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_aligned_regions() {
        let mut heap = LargeHeap::new();
        let p = heap.allocate(5000, BaseType::Array);
        assert!(!p.is_null());
        assert_eq!(p as usize % OS_PAGE, 0);
        assert!(heap.owns(p));
        assert!(heap.deallocate(p));
        assert!(!heap.owns(p));
    }

    #[test]
    fn unknown_pointer_is_reported() {
        let mut heap = LargeHeap::new();
        assert!(!heap.deallocate(0x1000 as *mut u8));
    }

    #[test]
    fn size_is_tracked() {
        let mut heap = LargeHeap::new();
        let p = heap.allocate(10_000, BaseType::String);
        assert_eq!(heap.stats().bytes_in_use, align_usize(10_000, OS_PAGE));
        assert_eq!(heap.live_count(), 1);
        heap.deallocate(p);
        assert_eq!(heap.stats().bytes_in_use, 0);
    }
}
