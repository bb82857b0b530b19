//! Medium tier: slab allocation keyed by aligned object size.
//!
//! Each slab owns 64 KiB chunks carved into fixed-size slots. Chunks move
//! between partial, full and empty lists as their occupancy crosses the
//! boundaries; fully-empty chunks are unmapped by `compact`.

use std::ptr::null_mut;

use rustc_hash::FxHashMap;

use crate::allocator::mmap::{map_raw, unmap_raw};
use crate::stats::TierStats;
use crate::util::align_usize;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const MEDIUM_MAX: usize = 4096;
const CHUNK_DATA_OFFSET: u32 = 64;
/// Slab keys are object sizes rounded to this granule.
const SLAB_ALIGN: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ChunkList {
    Partial = 0,
    Full = 1,
    Empty = 2,
}

#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

#[repr(C, align(16))]
struct ChunkHeader {
    next: *mut ChunkHeader,
    prev: *mut ChunkHeader,
    free: *mut FreeSlot,
    raw_base: *mut u8,
    raw_size: usize,
    bump: u32,
    used: u32,
    object_size: u32,
    list: ChunkList,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() <= CHUNK_DATA_OFFSET as usize);

impl ChunkHeader {
    #[inline]
    unsafe fn of_slot(slot: *mut u8) -> *mut ChunkHeader {
        ((slot as usize) & !(CHUNK_SIZE - 1)) as *mut ChunkHeader
    }

    #[inline]
    unsafe fn capacity(chunk: *mut ChunkHeader) -> u32 {
        (CHUNK_SIZE as u32 - CHUNK_DATA_OFFSET) / (*chunk).object_size
    }
}

struct Slab {
    #[allow(dead_code)]
    object_size: u32,
    partial: *mut ChunkHeader,
    full: *mut ChunkHeader,
    empty: *mut ChunkHeader,
}

impl Slab {
    fn new(object_size: u32) -> Self {
        Self {
            object_size,
            partial: null_mut(),
            full: null_mut(),
            empty: null_mut(),
        }
    }

    fn head_of(&mut self, list: ChunkList) -> &mut *mut ChunkHeader {
        match list {
            ChunkList::Partial => &mut self.partial,
            ChunkList::Full => &mut self.full,
            ChunkList::Empty => &mut self.empty,
        }
    }

    unsafe fn unlink(&mut self, chunk: *mut ChunkHeader) {
        let head = self.head_of((*chunk).list);
        if *head == chunk {
            *head = (*chunk).next;
        }
        if !(*chunk).prev.is_null() {
            (*(*chunk).prev).next = (*chunk).next;
        }
        if !(*chunk).next.is_null() {
            (*(*chunk).next).prev = (*chunk).prev;
        }
        (*chunk).next = null_mut();
        (*chunk).prev = null_mut();
    }

    unsafe fn push(&mut self, chunk: *mut ChunkHeader, list: ChunkList) {
        let head = self.head_of(list);
        (*chunk).next = *head;
        (*chunk).prev = null_mut();
        if !(*head).is_null() {
            (**head).prev = chunk;
        }
        *head = chunk;
        (*chunk).list = list;
    }

    /// Re-file `chunk` according to its occupancy.
    unsafe fn refile(&mut self, chunk: *mut ChunkHeader) {
        let target = if (*chunk).used == 0 {
            ChunkList::Empty
        } else if (*chunk).used == ChunkHeader::capacity(chunk) {
            ChunkList::Full
        } else {
            ChunkList::Partial
        };
        if (*chunk).list != target {
            self.unlink(chunk);
            self.push(chunk, target);
        }
    }
}

pub struct SlabHeap {
    slabs: FxHashMap<u32, Slab>,
    /// chunk base address -> slab key, for deallocation and membership tests
    chunk_index: FxHashMap<usize, u32>,
    stats: TierStats,
}

impl SlabHeap {
    pub fn new() -> Self {
        Self {
            slabs: FxHashMap::default(),
            chunk_index: FxHashMap::default(),
            stats: TierStats::default(),
        }
    }

    #[inline]
    pub fn slab_key(size: usize) -> u32 {
        align_usize(size, SLAB_ALIGN) as u32
    }

    pub fn allocate(&mut self, size: usize, isolated: bool) -> *mut u8 {
        debug_assert!(size <= MEDIUM_MAX);
        let key = Self::slab_key(size);
        if !self.slabs.contains_key(&key) {
            self.slabs.insert(key, Slab::new(key));
        }
        unsafe {
            let slot = self.find_slot(key, isolated);
            if slot.is_null() {
                return null_mut();
            }
            std::ptr::write_bytes(slot, 0, key as usize);
            self.stats.allocations += 1;
            self.stats.bytes_in_use += key as usize;
            slot
        }
    }

    unsafe fn find_slot(&mut self, key: u32, isolated: bool) -> *mut u8 {
        let slab = self.slabs.get_mut(&key).unwrap();
        // recycled slots first, unless the caller must not alias a freed one
        if !isolated {
            let mut chunk = slab.partial;
            while !chunk.is_null() {
                if !(*chunk).free.is_null() {
                    let slot = (*chunk).free;
                    (*chunk).free = (*slot).next;
                    (*chunk).used += 1;
                    slab.refile(chunk);
                    return slot as *mut u8;
                }
                chunk = (*chunk).next;
            }
            let chunk = slab.empty;
            if !chunk.is_null() && !(*chunk).free.is_null() {
                let slot = (*chunk).free;
                (*chunk).free = (*slot).next;
                (*chunk).used += 1;
                slab.refile(chunk);
                return slot as *mut u8;
            }
        }
        // fresh slots via the bump pointer; these were never on a free list
        for head in [slab.partial, slab.empty] {
            let mut chunk = head;
            while !chunk.is_null() {
                if ((*chunk).bump + (*chunk).object_size) as usize <= CHUNK_SIZE {
                    let slot = (chunk as *mut u8).add((*chunk).bump as usize);
                    (*chunk).bump += (*chunk).object_size;
                    (*chunk).used += 1;
                    slab.refile(chunk);
                    return slot;
                }
                chunk = (*chunk).next;
            }
        }
        let chunk = self.grow(key);
        if chunk.is_null() {
            return null_mut();
        }
        let slot = (chunk as *mut u8).add((*chunk).bump as usize);
        (*chunk).bump += (*chunk).object_size;
        (*chunk).used += 1;
        let slab = self.slabs.get_mut(&key).unwrap();
        slab.refile(chunk);
        slot
    }

    /// Map a new chunk for the slab: a 64 KiB-aligned region carved into
    /// `CHUNK_SIZE / object_size` slots.
    unsafe fn grow(&mut self, key: u32) -> *mut ChunkHeader {
        let raw_size = CHUNK_SIZE * 2;
        let raw = map_raw(raw_size);
        if raw.is_null() {
            return null_mut();
        }
        let base = align_usize(raw as usize, CHUNK_SIZE) as *mut u8;
        let chunk = base as *mut ChunkHeader;
        chunk.write(ChunkHeader {
            next: null_mut(),
            prev: null_mut(),
            free: null_mut(),
            raw_base: raw,
            raw_size,
            bump: CHUNK_DATA_OFFSET,
            used: 0,
            object_size: key,
            list: ChunkList::Empty,
        });
        self.chunk_index.insert(base as usize, key);
        let slab = self.slabs.get_mut(&key).unwrap();
        // push directly so `list` matches the actual placement
        (*chunk).next = slab.empty;
        if !slab.empty.is_null() {
            (*slab.empty).prev = chunk;
        }
        slab.empty = chunk;
        self.stats.pages += 1;
        chunk
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        let base = (ptr as usize) & !(CHUNK_SIZE - 1);
        self.chunk_index.contains_key(&base)
    }

    pub fn deallocate(&mut self, ptr: *mut u8) {
        unsafe {
            let chunk = ChunkHeader::of_slot(ptr);
            let key = (*chunk).object_size;
            debug_assert!((*chunk).used > 0);
            let slot = ptr as *mut FreeSlot;
            (*slot).next = (*chunk).free;
            (*chunk).free = slot;
            (*chunk).used -= 1;
            self.stats.deallocations += 1;
            self.stats.bytes_in_use -= key as usize;
            if let Some(slab) = self.slabs.get_mut(&key) {
                slab.refile(chunk);
            }
        }
    }

    /// Unmap every fully-empty chunk. Returns the number released.
    pub fn compact(&mut self) -> usize {
        let mut released = 0;
        for slab in self.slabs.values_mut() {
            unsafe {
                let mut chunk = slab.empty;
                while !chunk.is_null() {
                    let next = (*chunk).next;
                    self.chunk_index.remove(&(chunk as usize));
                    let (raw, raw_size) = ((*chunk).raw_base, (*chunk).raw_size);
                    unmap_raw(raw, raw_size);
                    released += 1;
                    self.stats.pages -= 1;
                    chunk = next;
                }
                slab.empty = null_mut();
            }
        }
        released
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn destroy(&mut self) {
        for slab in self.slabs.values_mut() {
            for head in [slab.partial, slab.full, slab.empty] {
                let mut chunk = head;
                while !chunk.is_null() {
                    unsafe {
                        let next = (*chunk).next;
                        unmap_raw((*chunk).raw_base, (*chunk).raw_size);
                        chunk = next;
                    }
                }
            }
            slab.partial = null_mut();
            slab.full = null_mut();
            slab.empty = null_mut();
        }
        self.slabs.clear();
        self.chunk_index.clear();
    }
}

impl Default for SlabHeap {
    fn default() -> Self {
        Self::new()
    }
}
