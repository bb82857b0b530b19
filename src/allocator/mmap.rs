#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }
        pub fn new(size: usize) -> Option<Self> {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                Some(Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                })
            }
        }
        /// Return a pointer into the region aligned up to `align`.
        pub fn aligned(&self, align: usize) -> *mut u8 {
            let offset = (align - (self.start as usize) % align) % align;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn contains(&self, p: *const u8) -> bool {
            p >= self.start as *const u8 && p < self.end as *const u8
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    libc::munmap(self.start as *mut _, self.size as _);
                }
            }
        }
    }
}

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }
        pub fn new(size: usize) -> Option<Self> {
            unsafe {
                let mem = VirtualAlloc(
                    null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                if mem.is_null() {
                    return None;
                }
                let mem = mem as *mut u8;
                Some(Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                })
            }
        }

        pub fn aligned(&self, align: usize) -> *mut u8 {
            let offset = (align - (self.start as usize) % align) % align;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn contains(&self, p: *const u8) -> bool {
            p >= self.start as *const u8 && p < self.end as *const u8
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    VirtualFree(self.start.cast(), 0, MEM_RELEASE);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

/// Map an anonymous read/write region without the RAII wrapper. Used by the
/// slab and large tiers, which track their regions in their own structures.
#[cfg(unix)]
pub fn map_raw(size: usize) -> *mut u8 {
    unsafe {
        let map = libc::mmap(
            core::ptr::null_mut(),
            size as _,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if map == libc::MAP_FAILED {
            core::ptr::null_mut()
        } else {
            map as *mut u8
        }
    }
}

/// # Safety
/// `ptr`/`size` must describe a region previously returned by [`map_raw`].
#[cfg(unix)]
pub unsafe fn unmap_raw(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut _, size as _);
}

#[cfg(windows)]
pub fn map_raw(size: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        ) as *mut u8
    }
}

/// # Safety
/// `ptr` must be a region base previously returned by [`map_raw`].
#[cfg(windows)]
pub unsafe fn unmap_raw(ptr: *mut u8, _size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    VirtualFree(ptr.cast(), 0, MEM_RELEASE);
}
