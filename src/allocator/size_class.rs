//! Small tier: segregated size classes over 4 KiB pages.
//!
//! A page is divided into equal-size slots. Fresh slots are served by a
//! linear bump pointer; freed slots chain onto a per-page explicit free list
//! and, when enabled, onto a short per-class fast-path chain that satisfies
//! common allocations without touching the page structures.

use std::ptr::null_mut;

use crossbeam_utils::CachePadded;

use crate::allocator::mmap::Mmap;
use crate::stats::TierStats;

pub const PAGE_SIZE: usize = 4096;
pub const SMALL_MAX: usize = 256;
pub const SIZE_CLASSES: [u32; 8] = [16, 32, 48, 64, 96, 128, 192, 256];
/// First slot offset; keeps every slot of the 64-multiple classes
/// cache-line aligned since pages themselves are page-aligned.
const PAGE_DATA_OFFSET: u32 = 64;
const FAST_PATH_LIMIT: u32 = 32;

#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

#[repr(C, align(16))]
struct PageHeader {
    next_partial: *mut PageHeader,
    free: *mut FreeSlot,
    bump: u32,
    live: u32,
    class: u8,
    on_partial: bool,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() <= PAGE_DATA_OFFSET as usize);

impl PageHeader {
    #[inline]
    unsafe fn init(page: *mut u8, class: u8) -> *mut PageHeader {
        let header = page as *mut PageHeader;
        header.write(PageHeader {
            next_partial: null_mut(),
            free: null_mut(),
            bump: PAGE_DATA_OFFSET,
            live: 0,
            class,
            on_partial: false,
        });
        header
    }

    #[inline]
    unsafe fn of_slot(slot: *mut u8) -> *mut PageHeader {
        ((slot as usize) & !(PAGE_SIZE - 1)) as *mut PageHeader
    }
}

/// Bump-carves 4 KiB pages out of mmap'd regions and recycles returned
/// pages through a free-page list.
struct PageProvider {
    regions: Vec<Mmap>,
    bump: *mut u8,
    bound: *mut u8,
    free_pages: Vec<*mut u8>,
    region_size: usize,
    max_total: usize,
    total: usize,
}

impl PageProvider {
    fn new(region_size: usize, max_total: usize) -> Self {
        Self {
            regions: Vec::new(),
            bump: null_mut(),
            bound: null_mut(),
            free_pages: Vec::new(),
            region_size: region_size.max(PAGE_SIZE),
            max_total,
            total: 0,
        }
    }

    fn get_page(&mut self) -> *mut u8 {
        if let Some(page) = self.free_pages.pop() {
            if let Some(region) = self.regions.iter().find(|r| r.contains(page)) {
                region.commit(page, PAGE_SIZE);
            }
            return page;
        }
        if self.bump.is_null() || self.bump as usize + PAGE_SIZE > self.bound as usize {
            if self.total + self.region_size > self.max_total {
                return null_mut();
            }
            let region = match Mmap::new(self.region_size) {
                Some(r) => r,
                None => return null_mut(),
            };
            self.bump = region.aligned(PAGE_SIZE);
            self.bound = region.end();
            self.total += self.region_size;
            self.regions.push(region);
        }
        let page = self.bump;
        self.bump = (self.bump as usize + PAGE_SIZE) as *mut u8;
        page
    }

    fn return_page(&mut self, page: *mut u8) {
        if let Some(region) = self.regions.iter().find(|r| r.contains(page)) {
            region.dontneed(page, PAGE_SIZE);
        }
        self.free_pages.push(page);
    }

    fn contains(&self, p: *const u8) -> bool {
        self.regions.iter().any(|r| r.contains(p))
    }
}

struct FastPath {
    head: *mut FreeSlot,
    count: u32,
}

struct SizeClass {
    size: u32,
    current: *mut PageHeader,
    partial: *mut PageHeader,
    pages: Vec<*mut PageHeader>,
    fast: CachePadded<FastPath>,
}

impl SizeClass {
    fn new(size: u32) -> Self {
        Self {
            size,
            current: null_mut(),
            partial: null_mut(),
            pages: Vec::new(),
            fast: CachePadded::new(FastPath {
                head: null_mut(),
                count: 0,
            }),
        }
    }

    unsafe fn push_partial(&mut self, page: *mut PageHeader) {
        if !(*page).on_partial {
            (*page).next_partial = self.partial;
            (*page).on_partial = true;
            self.partial = page;
        }
    }

    unsafe fn unlink_partial(&mut self, page: *mut PageHeader) {
        if !(*page).on_partial {
            return;
        }
        let mut cursor = &mut self.partial as *mut *mut PageHeader;
        while !(*cursor).is_null() {
            if *cursor == page {
                *cursor = (*page).next_partial;
                (*page).on_partial = false;
                (*page).next_partial = null_mut();
                return;
            }
            cursor = &mut (**cursor).next_partial;
        }
    }
}

pub struct SizeClassHeap {
    provider: PageProvider,
    classes: [SizeClass; 8],
    fast_path_enabled: bool,
    stats: TierStats,
}

impl SizeClassHeap {
    pub fn new(region_size: usize, max_total: usize, fast_path_enabled: bool) -> Self {
        Self {
            provider: PageProvider::new(region_size, max_total),
            classes: SIZE_CLASSES.map(SizeClass::new),
            fast_path_enabled,
            stats: TierStats::default(),
        }
    }

    /// Round `size` up to the smallest class that fits. `None` when the
    /// request belongs to a higher tier.
    #[inline]
    pub fn class_index(size: usize) -> Option<usize> {
        if size > SMALL_MAX {
            return None;
        }
        SIZE_CLASSES.iter().position(|&c| size <= c as usize)
    }

    pub fn class_size(index: usize) -> u32 {
        SIZE_CLASSES[index]
    }

    /// Serve an allocation out of class `index`. `isolated` requests bypass
    /// every free list and are satisfied only by the linear bump pointer, so
    /// the block is never a formerly-freed slot.
    pub fn allocate(&mut self, index: usize, isolated: bool) -> *mut u8 {
        let size = self.classes[index].size;
        unsafe {
            if !isolated {
                if self.fast_path_enabled {
                    let fast = &mut *self.classes[index].fast;
                    if !fast.head.is_null() {
                        let slot = fast.head;
                        fast.head = (*slot).next;
                        fast.count -= 1;
                        let page = PageHeader::of_slot(slot as *mut u8);
                        (*page).live += 1;
                        return self.serve(slot as *mut u8, size);
                    }
                }
                let class = &mut self.classes[index];
                let mut page = class.partial;
                while !page.is_null() {
                    if let Some(slot) = Self::pop_page_slot(page) {
                        (*page).live += 1;
                        if (*page).free.is_null() && !Self::page_can_bump(page, size) {
                            class.unlink_partial(page);
                        }
                        return self.serve(slot, size);
                    }
                    let next = (*page).next_partial;
                    class.unlink_partial(page);
                    page = next;
                }
            }
            // fresh slot via the bump pointer
            let class = &mut self.classes[index];
            if class.current.is_null() || !Self::page_can_bump(class.current, size) {
                let raw = self.provider.get_page();
                if raw.is_null() {
                    return null_mut();
                }
                let page = PageHeader::init(raw, index as u8);
                self.classes[index].current = page;
                self.classes[index].pages.push(page);
                self.stats.pages += 1;
            }
            let page = self.classes[index].current;
            let slot = (page as *mut u8).add((*page).bump as usize);
            (*page).bump += size;
            (*page).live += 1;
            self.serve(slot, size)
        }
    }

    #[inline]
    unsafe fn serve(&mut self, slot: *mut u8, size: u32) -> *mut u8 {
        std::ptr::write_bytes(slot, 0, size as usize);
        self.stats.allocations += 1;
        self.stats.bytes_in_use += size as usize;
        self.stats.class_allocations[(*PageHeader::of_slot(slot)).class as usize] += 1;
        slot
    }

    #[inline]
    unsafe fn page_can_bump(page: *mut PageHeader, size: u32) -> bool {
        (*page).bump as usize + size as usize <= PAGE_SIZE
    }

    unsafe fn pop_page_slot(page: *mut PageHeader) -> Option<*mut u8> {
        let slot = (*page).free;
        if slot.is_null() {
            return None;
        }
        (*page).free = (*slot).next;
        Some(slot as *mut u8)
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        self.provider.contains(ptr)
    }

    pub fn deallocate(&mut self, ptr: *mut u8) {
        unsafe {
            let page = PageHeader::of_slot(ptr);
            let index = (*page).class as usize;
            let size = self.classes[index].size;
            debug_assert!((*page).live > 0);
            (*page).live -= 1;
            self.stats.deallocations += 1;
            self.stats.bytes_in_use -= size as usize;
            let slot = ptr as *mut FreeSlot;
            if self.fast_path_enabled {
                let fast = &mut *self.classes[index].fast;
                if fast.count < FAST_PATH_LIMIT {
                    (*slot).next = fast.head;
                    fast.head = slot;
                    fast.count += 1;
                    return;
                }
            }
            (*slot).next = (*page).free;
            (*page).free = slot;
            self.classes[index].push_partial(page);
        }
    }

    /// Move fast-path slots back onto their pages' free lists. Run before
    /// compaction so an empty page never has slots dangling off a chain.
    fn flush_fast_paths(&mut self) {
        for index in 0..self.classes.len() {
            unsafe {
                let mut slot = {
                    let fast = &mut *self.classes[index].fast;
                    let head = fast.head;
                    fast.head = null_mut();
                    fast.count = 0;
                    head
                };
                while !slot.is_null() {
                    let next = (*slot).next;
                    let page = PageHeader::of_slot(slot as *mut u8);
                    (*slot).next = (*page).free;
                    (*page).free = slot;
                    self.classes[index].push_partial(page);
                    slot = next;
                }
            }
        }
    }

    /// Release fully-empty pages back to the provider. Live objects are
    /// never relocated. Returns the number of released pages.
    pub fn compact(&mut self) -> usize {
        self.flush_fast_paths();
        let mut released = 0;
        for index in 0..self.classes.len() {
            let mut retained = Vec::new();
            let pages = std::mem::take(&mut self.classes[index].pages);
            for page in pages {
                unsafe {
                    if (*page).live == 0 {
                        self.classes[index].unlink_partial(page);
                        if self.classes[index].current == page {
                            self.classes[index].current = null_mut();
                        }
                        self.provider.return_page(page as *mut u8);
                        self.stats.pages -= 1;
                        released += 1;
                    } else {
                        retained.push(page);
                    }
                }
            }
            self.classes[index].pages = retained;
        }
        released
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn destroy(&mut self) {
        for class in self.classes.iter_mut() {
            class.current = null_mut();
            class.partial = null_mut();
            class.pages.clear();
            class.fast.head = null_mut();
            class.fast.count = 0;
        }
        self.provider.free_pages.clear();
        self.provider.bump = null_mut();
        self.provider.bound = null_mut();
        self.provider.regions.clear();
        self.provider.total = 0;
    }
}
