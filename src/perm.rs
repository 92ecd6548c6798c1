//! Permanent allocations: memory that lives for the rest of the process and is never
//! scanned or freed by the collector.

use std::{
    alloc::Layout,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::{
    error::{GcError, GcResult},
    util::align_up,
};

struct PermChunk {
    _map: MmapMut,
    base: *mut u8,
    len: usize,
    cursor: AtomicUsize,
}

unsafe impl Send for PermChunk {}
unsafe impl Sync for PermChunk {}

impl PermChunk {
    fn try_bump(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>> {
        let base = self.base as usize;
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let ptr = align_up(base + cur + offset, align) - offset;
            let end = ptr.checked_add(size)?;
            if end > base + self.len {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cur,
                end - base,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return NonNull::new(ptr as *mut u8),
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Bump allocator over anonymous chunks. The lock is only taken to install a new chunk.
pub struct PermPool {
    current: AtomicPtr<PermChunk>,
    chunks: Mutex<Vec<Box<PermChunk>>>,
    chunk_size: usize,
    limit: usize,
    allocated: AtomicUsize,
}

impl PermPool {
    pub fn new(chunk_size: usize, limit: usize) -> Self {
        Self {
            current: AtomicPtr::new(null_mut()),
            chunks: Mutex::new(Vec::new()),
            chunk_size,
            limit: limit.min(chunk_size),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocates `size` zeroed bytes such that `ptr + offset` is aligned to `align`.
    pub fn alloc(&self, size: usize, align: usize, offset: usize) -> GcResult<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        if size > self.limit || align > self.limit {
            return self.alloc_system(size, align, offset);
        }
        loop {
            let chunk = self.current.load(Ordering::Acquire);
            if !chunk.is_null() {
                if let Some(ptr) = unsafe { (*chunk).try_bump(size, align, offset) } {
                    self.allocated.fetch_add(size, Ordering::Relaxed);
                    return Ok(ptr);
                }
            }
            self.grow(chunk)?;
        }
    }

    fn grow(&self, observed: *mut PermChunk) -> GcResult<()> {
        let mut chunks = self.chunks.lock();
        if self.current.load(Ordering::Acquire) != observed {
            return Ok(());
        }
        let mut map = MmapMut::map_anon(self.chunk_size)
            .map_err(|_| GcError::OutOfMemory(self.chunk_size))?;
        let base = map.as_mut_ptr();
        let mut chunk = Box::new(PermChunk {
            _map: map,
            base,
            len: self.chunk_size,
            cursor: AtomicUsize::new(0),
        });
        let ptr: *mut PermChunk = &mut *chunk;
        chunks.push(chunk);
        self.current.store(ptr, Ordering::Release);
        log::trace!("perm pool: new chunk #{} at {:p}", chunks.len(), base);
        Ok(())
    }

    fn alloc_system(&self, size: usize, align: usize, offset: usize) -> GcResult<NonNull<u8>> {
        let padded = size
            .checked_add(align_up(offset, align))
            .ok_or(GcError::SizeOverflow)?;
        let layout = Layout::from_size_align(padded.max(1), align).map_err(|_| GcError::SizeOverflow)?;
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(GcError::OutOfMemory(size));
        }
        self.allocated.fetch_add(size, Ordering::Relaxed);
        let ptr = align_up(base as usize + offset, align) - offset;
        NonNull::new(ptr as *mut u8).ok_or(GcError::OutOfMemory(size))
    }

    /// Bytes handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::is_aligned;

    #[test]
    fn test_perm_alignment_and_offset() {
        let pool = PermPool::new(64 * 1024, 1024);
        let a = pool.alloc(24, 16, 0).unwrap();
        let b = pool.alloc(24, 16, 8).unwrap();
        assert!(is_aligned(a.as_ptr() as usize, 16));
        assert!(is_aligned(b.as_ptr() as usize + 8, 16));
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 24);
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_perm_grows_and_spills() {
        let pool = PermPool::new(4096, 1024);
        for _ in 0..10 {
            pool.alloc(1000, 8, 0).unwrap();
        }
        assert!(pool.chunk_count() >= 3);
        let big = pool.alloc(8192, 16, 0).unwrap();
        unsafe {
            assert_eq!(*big.as_ptr().add(8191), 0);
        }
        assert_eq!(pool.allocated(), 10 * 1000 + 8192);
    }

    #[test]
    fn test_perm_concurrent() {
        let pool = PermPool::new(16 * 1024, 256);
        let ptrs = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let p = pool.alloc(32, 16, 0).unwrap();
                        ptrs.lock().push(p.as_ptr() as usize);
                    }
                });
            }
        });
        let mut ptrs = ptrs.into_inner();
        ptrs.sort_unstable();
        for pair in ptrs.windows(2) {
            assert!(pair[1] - pair[0] >= 32);
        }
    }
}
