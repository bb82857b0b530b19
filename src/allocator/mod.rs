//! The tiered allocator: size-classed small objects, slab-managed medium
//! objects and directly-mapped large objects behind one façade.
//!
//! Every block handed out is zero-initialized, at least 16-byte aligned and
//! begins with room for the object header. The allocator never panics on
//! exhaustion; a null return is the failure signal and callers propagate it
//! upward.

pub mod large;
pub mod mmap;
pub mod size_class;
pub mod slab;

use std::ptr::null_mut;

use crate::header::{BaseType, GcHeader};
use crate::stats::AllocationStats;
use crate::util::align_usize;

pub use size_class::{PAGE_SIZE, SIZE_CLASSES, SMALL_MAX};
pub use slab::{CHUNK_SIZE, MEDIUM_MAX};

use large::LargeHeap;
use size_class::SizeClassHeap;
use slab::SlabHeap;

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Size of each mmap'd region backing the small tier.
    pub default_region_size: usize,
    /// Upper bound on total small-tier region bytes.
    pub max_region_size: usize,
    /// A small request whose size-class waste fraction exceeds this limit is
    /// routed to the slab tier instead.
    pub size_class_waste_limit: f64,
    pub enable_fast_path: bool,
    pub enable_size_class: bool,
    pub enable_slab: bool,
    pub enable_direct: bool,
    /// Grouping granularity for `deallocate_batch`.
    pub batch_size: usize,
    /// Cache-line align arrays and structs.
    pub cache_line_align: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_region_size: 4 * 1024 * 1024,
            max_region_size: 256 * 1024 * 1024,
            size_class_waste_limit: 0.5,
            enable_fast_path: true,
            enable_size_class: true,
            enable_slab: true,
            enable_direct: true,
            batch_size: 64,
            cache_line_align: true,
        }
    }
}

pub struct Allocator {
    small: SizeClassHeap,
    medium: SlabHeap,
    large: LargeHeap,
    config: AllocatorConfig,
    invalid_deallocations: u64,
    destroyed: bool,
}

// Raw pointers inside the tiers never escape a single runtime; the runtime
// serializes access through its reader/writer lock.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            small: SizeClassHeap::new(
                config.default_region_size,
                config.max_region_size,
                config.enable_fast_path,
            ),
            medium: SlabHeap::new(),
            large: LargeHeap::new(),
            config,
            invalid_deallocations: 0,
            destroyed: false,
        }
    }

    /// Alignment for an object of `total` bytes (header + payload).
    fn alignment_for(&self, base_type: BaseType, total: usize) -> usize {
        if total > MEDIUM_MAX {
            PAGE_SIZE
        } else if self.config.cache_line_align
            && matches!(base_type, BaseType::Array | BaseType::Struct)
        {
            64
        } else {
            16
        }
    }

    /// Return a zero-initialized block of at least `size` bytes. Null on
    /// failure.
    pub fn allocate(&mut self, size: usize, base_type: BaseType) -> *mut GcHeader {
        self.allocate_inner(size, base_type, false)
    }

    /// Like [`Allocator::allocate`], but the block is guaranteed not to be a
    /// formerly-freed slot: every tier serves the request from never-used
    /// memory. Used when the caller must prove the new object does not alias
    /// a prior one.
    pub fn allocate_isolated(&mut self, size: usize, base_type: BaseType) -> *mut GcHeader {
        self.allocate_inner(size, base_type, true)
    }

    fn allocate_inner(&mut self, size: usize, base_type: BaseType, isolated: bool) -> *mut GcHeader {
        if self.destroyed || size == 0 {
            return null_mut();
        }
        let aligned = align_usize(size, self.alignment_for(base_type, size));
        if self.config.enable_size_class && aligned <= SMALL_MAX {
            if let Some(index) = SizeClassHeap::class_index(aligned) {
                let class = SizeClassHeap::class_size(index) as usize;
                let waste = (class - aligned) as f64 / class as f64;
                if waste <= self.config.size_class_waste_limit {
                    return self.small.allocate(index, isolated) as *mut GcHeader;
                }
            }
        }
        if self.config.enable_slab && aligned <= MEDIUM_MAX {
            return self.medium.allocate(aligned, isolated) as *mut GcHeader;
        }
        if self.config.enable_direct {
            return self.large.allocate(aligned, base_type) as *mut GcHeader;
        }
        null_mut()
    }

    /// Whether a block of `total` bytes lands in the direct tier.
    pub fn is_large_size(&self, total: usize) -> bool {
        total > MEDIUM_MAX || (!self.config.enable_size_class && !self.config.enable_slab)
    }

    /// Return a block to its originating tier. Unknown pointers bump a
    /// counter and are otherwise ignored.
    pub fn deallocate(&mut self, ptr: *mut GcHeader) {
        if ptr.is_null() || self.destroyed {
            return;
        }
        let raw = ptr as *mut u8;
        if self.small.owns(raw) {
            self.small.deallocate(raw);
        } else if self.medium.owns(raw) {
            self.medium.deallocate(raw);
        } else if !self.large.deallocate(raw) {
            self.invalid_deallocations += 1;
        }
    }

    /// Batched return, grouped by tier and size class so page and chunk
    /// bookkeeping is touched once per group.
    pub fn deallocate_batch(&mut self, ptrs: &[*mut GcHeader]) {
        let mut small: Vec<*mut u8> = Vec::new();
        let mut rest: Vec<*mut GcHeader> = Vec::new();
        for &ptr in ptrs {
            if ptr.is_null() {
                continue;
            }
            if self.small.owns(ptr as *mut u8) {
                small.push(ptr as *mut u8);
            } else {
                rest.push(ptr);
            }
        }
        // size classes share page metadata; freeing a page's slots together
        // keeps its free list hot
        small.sort_unstable_by_key(|&p| p as usize & !(PAGE_SIZE - 1));
        for p in small {
            self.small.deallocate(p);
        }
        for ptr in rest {
            self.deallocate(ptr);
        }
    }

    /// Release fully-empty pages and chunks back to the OS. Never relocates
    /// a live object. Returns the number of released regions.
    pub fn compact(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.small.compact() + self.medium.compact()
    }

    pub fn stats(&self) -> AllocationStats {
        AllocationStats {
            small: self.small.stats().clone(),
            medium: self.medium.stats().clone(),
            large: self.large.stats().clone(),
            invalid_deallocations: self.invalid_deallocations,
        }
    }

    pub fn large_lookup(&self, ptr: *const u8) -> Option<(usize, BaseType)> {
        self.large.lookup(ptr)
    }

    /// Release all backing memory. Further use returns null / is ignored.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.small.destroy();
        self.medium.destroy();
        self.large.destroy();
        self.destroyed = true;
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_routing() {
        let mut a = Allocator::new(AllocatorConfig::default());
        let small = a.allocate(40, BaseType::String);
        let medium = a.allocate(1000, BaseType::String);
        let large = a.allocate(10_000, BaseType::String);
        assert!(!small.is_null() && !medium.is_null() && !large.is_null());
        assert_eq!(a.stats().small.allocations, 1);
        assert_eq!(a.stats().medium.allocations, 1);
        assert_eq!(a.stats().large.allocations, 1);
        a.deallocate(small);
        a.deallocate(medium);
        a.deallocate(large);
    }

    #[test]
    fn arrays_are_cache_line_aligned() {
        let mut a = Allocator::new(AllocatorConfig::default());
        for size in [40usize, 100, 200, 300, 2000] {
            let p = a.allocate(size, BaseType::Array);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0, "size {size}");
        }
    }

    #[test]
    fn large_blocks_are_page_aligned() {
        let mut a = Allocator::new(AllocatorConfig::default());
        let p = a.allocate(8192, BaseType::Array);
        assert_eq!(p as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn unknown_deallocate_is_counted() {
        let mut a = Allocator::new(AllocatorConfig::default());
        a.deallocate(0xdead_0000 as *mut GcHeader);
        assert_eq!(a.stats().invalid_deallocations, 1);
    }

    #[test]
    fn disabled_tiers_fall_through() {
        let config = AllocatorConfig {
            enable_size_class: false,
            enable_slab: false,
            ..Default::default()
        };
        let mut a = Allocator::new(config);
        // even a tiny request lands in the direct tier
        let p = a.allocate(32, BaseType::String);
        assert!(!p.is_null());
        assert_eq!(a.stats().large.allocations, 1);
        a.deallocate(p);
    }

    #[test]
    fn destroyed_allocator_returns_null() {
        let mut a = Allocator::new(AllocatorConfig::default());
        a.destroy();
        assert!(a.allocate(32, BaseType::String).is_null());
    }

    #[test]
    fn batch_free_recycles() {
        let mut a = Allocator::new(AllocatorConfig::default());
        let ptrs: Vec<_> = (0..32).map(|_| a.allocate(48, BaseType::String)).collect();
        a.deallocate_batch(&ptrs);
        assert_eq!(a.stats().small.deallocations, 32);
    }
}
