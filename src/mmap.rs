#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    use crate::util::align_up;

    pub struct Mmap {
        start: *mut u8,
    }

    impl Mmap {
        /// Reserves `size` bytes of address space without committing it.
        pub fn reserve(size: usize) -> Option<Self> {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_READWRITE);
                if mem.is_null() {
                    return None;
                }
                let mem = mem as *mut u8;
                Some(Self { start: mem })
            }
        }

        /// First address inside the mapping aligned to `align`.
        pub fn aligned(&self, align: usize) -> *mut u8 {
            align_up(self.start as usize, align) as *mut u8
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { !VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE).is_null() }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }

    pub fn os_page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    /// Physical memory in bytes, when the platform reports it.
    pub fn physical_memory() -> Option<usize> {
        None
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::util::align_up;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const MAP_NORESERVE: libc::c_int = 0;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        /// Maps `size` bytes of anonymous memory. Swap is not reserved, so pages are
        /// only backed once they are touched.
        pub fn reserve(size: usize) -> Option<Self> {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                Some(Self {
                    start: map as *mut u8,
                    size,
                })
            }
        }

        /// First address inside the mapping aligned to `align`.
        pub fn aligned(&self, align: usize) -> *mut u8 {
            align_up(self.start as usize, align) as *mut u8
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
            }
            true
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }

    pub fn os_page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Physical memory in bytes, when the platform reports it.
    pub fn physical_memory() -> Option<usize> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        unsafe {
            let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
            if pages <= 0 {
                return None;
            }
            (pages as usize).checked_mul(os_page_size())
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            None
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
