//! Allocation front end.
//!
//! Every allocation is charged to the calling thread's counters before it reaches the tracer
//! or the system allocator. Once the charged bytes exceed the collection interval the next
//! allocation runs a collection first.

use std::{
    alloc::{self, Layout},
    mem::size_of,
    ptr::NonNull,
};

use crate::{
    error::{GcError, GcResult},
    globals::{CACHE_BYTE_ALIGNMENT, HEADER_SIZE, SMALL_BYTE_ALIGNMENT},
    heap::CollectionOutcome,
    heuristics::ThreadCounters,
    mutator::Mutator,
    size_class::classify_pools,
    tracer::{ObjectRef, Tracer, TypeTag},
    weak::WeakRef,
};

/// Bytes in front of a [`Mutator::malloc`] block that hold its size.
const MALLOC_HEADER: usize = SMALL_BYTE_ALIGNMENT;

fn checked_add(a: usize, b: usize) -> GcResult<usize> {
    a.checked_add(b).ok_or(GcError::SizeOverflow)
}

fn cache_aligned(size: usize) -> GcResult<Layout> {
    let size = checked_add(size, CACHE_BYTE_ALIGNMENT - 1)? & !(CACHE_BYTE_ALIGNMENT - 1);
    Layout::from_size_align(size.max(CACHE_BYTE_ALIGNMENT), CACHE_BYTE_ALIGNMENT)
        .map_err(|_| GcError::SizeOverflow)
}

impl<T: Tracer> Mutator<T> {
    /// `true` once more than the collection interval was allocated since the last cycle.
    #[inline]
    pub fn should_collect(&self) -> bool {
        self.heap().state.allocd() + self.counters.allocd() > 0
    }

    /// Collects if the interval is exhausted, otherwise polls the safepoint.
    pub fn maybe_collect(&self) -> Option<CollectionOutcome> {
        if self.should_collect() {
            Some(self.collect(false))
        } else {
            self.safepoint();
            None
        }
    }

    /// Charges `bytes` allocated outside the front end against the interval.
    pub fn count_allocd(&self, bytes: usize) {
        self.account(bytes as i64);
    }

    #[inline]
    fn account(&self, bytes: i64) {
        if self.counters.add_allocd(bytes) {
            self.heap().state.merge(&self.counters);
        }
    }

    #[inline]
    fn account_freed(&self, bytes: usize) {
        self.counters.add_freed(bytes as i64);
    }

    /// Allocates an object with `size` payload bytes. Small objects come from the
    /// tracer's pools, larger ones from its big object path.
    pub fn alloc(&self, size: usize, tag: TypeTag) -> GcResult<ObjectRef> {
        let allocsz = checked_add(size, HEADER_SIZE)?;
        self.maybe_collect();
        let tracer = self.heap().tracer();
        match classify_pools(allocsz) {
            Some((pool, osize)) => {
                let object =
                    self.with_thread_heap(|local| tracer.pool_alloc(local, pool, osize, tag))?;
                self.account(osize as i64);
                ThreadCounters::bump(&self.counters.poolalloc);
                Ok(object)
            }
            None => {
                let allocsz = checked_add(allocsz, CACHE_BYTE_ALIGNMENT - 1)?
                    & !(CACHE_BYTE_ALIGNMENT - 1);
                let object = self.with_thread_heap(|local| tracer.big_alloc(local, allocsz, tag))?;
                self.account(allocsz as i64);
                ThreadCounters::bump(&self.counters.bigalloc);
                Ok(object)
            }
        }
    }

    pub fn counted_malloc(&self, size: usize) -> GcResult<NonNull<u8>> {
        self.maybe_collect();
        self.account(size as i64);
        ThreadCounters::bump(&self.counters.malloc);
        NonNull::new(unsafe { libc::malloc(size) } as *mut u8).ok_or(GcError::OutOfMemory(size))
    }

    pub fn counted_calloc(&self, count: usize, size: usize) -> GcResult<NonNull<u8>> {
        let total = count.checked_mul(size).ok_or(GcError::SizeOverflow)?;
        self.maybe_collect();
        self.account(total as i64);
        ThreadCounters::bump(&self.counters.malloc);
        NonNull::new(unsafe { libc::calloc(count, size) } as *mut u8)
            .ok_or(GcError::OutOfMemory(total))
    }

    /// # Safety
    ///
    /// `ptr` came from [`counted_malloc`](Self::counted_malloc) or one of its siblings
    /// with a requested size of `size`.
    pub unsafe fn counted_free(&self, ptr: *mut u8, size: usize) {
        libc::free(ptr as *mut libc::c_void);
        self.account_freed(size);
        ThreadCounters::bump(&self.counters.freecall);
    }

    /// # Safety
    ///
    /// `ptr` is null or came from the counted family with a requested size of `old_size`.
    pub unsafe fn counted_realloc_with_old_size(
        &self,
        ptr: *mut u8,
        old_size: usize,
        size: usize,
    ) -> GcResult<NonNull<u8>> {
        self.maybe_collect();
        if size < old_size {
            self.account_freed(old_size - size);
        } else {
            self.account((size - old_size) as i64);
        }
        ThreadCounters::bump(&self.counters.realloc);
        NonNull::new(libc::realloc(ptr as *mut libc::c_void, size) as *mut u8)
            .ok_or(GcError::OutOfMemory(size))
    }

    /// Counted allocation that remembers its own size, so it can be freed without one.
    pub fn malloc(&self, size: usize) -> GcResult<NonNull<u8>> {
        let block = self.counted_malloc(checked_add(size, MALLOC_HEADER)?)?;
        unsafe { Ok(Self::write_size_header(block, size)) }
    }

    pub fn calloc(&self, count: usize, size: usize) -> GcResult<NonNull<u8>> {
        let total = count.checked_mul(size).ok_or(GcError::SizeOverflow)?;
        let block = self.counted_calloc(checked_add(total, MALLOC_HEADER)?, 1)?;
        unsafe { Ok(Self::write_size_header(block, total)) }
    }

    /// # Safety
    ///
    /// `ptr` is null or came from [`malloc`](Self::malloc), [`calloc`](Self::calloc) or
    /// [`realloc`](Self::realloc) and was not freed yet.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = ptr.sub(MALLOC_HEADER);
        let size = (block as *const usize).read();
        self.counted_free(block, size + MALLOC_HEADER);
    }

    /// # Safety
    ///
    /// Same contract as [`free`](Self::free). On error the old block stays valid.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> GcResult<NonNull<u8>> {
        let (block, old_size) = if ptr.is_null() {
            (ptr, 0)
        } else {
            let block = ptr.sub(MALLOC_HEADER);
            (block, (block as *const usize).read() + MALLOC_HEADER)
        };
        let block =
            self.counted_realloc_with_old_size(block, old_size, checked_add(size, MALLOC_HEADER)?)?;
        Ok(Self::write_size_header(block, size))
    }

    unsafe fn write_size_header(block: NonNull<u8>, size: usize) -> NonNull<u8> {
        (block.as_ptr() as *mut usize).write(size);
        NonNull::new_unchecked(block.as_ptr().add(MALLOC_HEADER))
    }

    /// Cache-line aligned allocation for buffers owned by managed objects.
    pub fn managed_malloc(&self, size: usize) -> GcResult<NonNull<u8>> {
        let layout = cache_aligned(size)?;
        self.maybe_collect();
        self.account(layout.size() as i64);
        ThreadCounters::bump(&self.counters.malloc);
        NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(GcError::OutOfMemory(layout.size()))
    }

    /// # Safety
    ///
    /// `ptr` came from [`managed_malloc`](Self::managed_malloc) or this function with a
    /// requested size of `old_size`.
    pub unsafe fn managed_realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        size: usize,
    ) -> GcResult<NonNull<u8>> {
        let old = cache_aligned(old_size)?;
        let new = cache_aligned(size)?;
        self.maybe_collect();
        if new.size() < old.size() {
            self.account_freed(old.size() - new.size());
        } else {
            self.account((new.size() - old.size()) as i64);
        }
        ThreadCounters::bump(&self.counters.realloc);
        NonNull::new(alloc::realloc(ptr.as_ptr(), old, new.size()))
            .ok_or(GcError::OutOfMemory(new.size()))
    }

    /// # Safety
    ///
    /// Same contract as [`managed_realloc`](Self::managed_realloc), with `size` being the
    /// last requested size.
    pub unsafe fn managed_free(&self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = cache_aligned(size) {
            alloc::dealloc(ptr.as_ptr(), layout);
            self.account_freed(layout.size());
            ThreadCounters::bump(&self.counters.freecall);
        }
    }

    /// Allocates memory that lives as long as the process. Not charged to the interval.
    pub fn perm_alloc(&self, size: usize, align: usize, offset: usize) -> GcResult<NonNull<u8>> {
        self.heap().perm().alloc(size, align, offset)
    }

    /// Allocates a weak reference cell holding `value` and hands it to the tracer.
    pub fn new_weakref(&self, value: Option<ObjectRef>) -> GcResult<WeakRef> {
        let _unsafe = self.enter_unsafe();
        let cell = self.alloc(size_of::<usize>(), TypeTag::WEAK_REF)?;
        let weakref = unsafe { WeakRef::from_cell(cell) };
        weakref.set(value);
        let tracer = self.heap().tracer();
        self.with_thread_heap(|local| tracer.push_weakref(local, weakref));
        Ok(weakref)
    }

    pub fn queue_root(&self, object: ObjectRef) {
        let tracer = self.heap().tracer();
        self.with_thread_heap(|local| tracer.queue_root(local, object));
    }

    pub fn queue_binding(&self, binding: ObjectRef) {
        let tracer = self.heap().tracer();
        self.with_thread_heap(|local| tracer.queue_binding(local, binding));
    }

    pub fn push_big_object(&self, object: ObjectRef) {
        let tracer = self.heap().tracer();
        self.with_thread_heap(|local| tracer.push_big_object(local, object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{heap, small_config};

    #[test]
    fn test_cache_aligned_layout() {
        assert_eq!(cache_aligned(1).unwrap().size(), 64);
        assert_eq!(cache_aligned(65).unwrap().size(), 128);
        assert_eq!(cache_aligned(0).unwrap().align(), 64);
        assert_eq!(cache_aligned(usize::MAX).unwrap_err(), GcError::SizeOverflow);
    }

    #[test]
    fn test_malloc_header_roundtrip() {
        let heap = heap(small_config());
        let mutator = heap.attach_current_thread();
        unsafe {
            let p = mutator.malloc(100).unwrap();
            assert_eq!(p.as_ptr() as usize % SMALL_BYTE_ALIGNMENT, 0);
            p.as_ptr().write_bytes(0xab, 100);
            let p = mutator.realloc(p.as_ptr(), 300).unwrap();
            assert_eq!(*p.as_ptr().add(99), 0xab);
            mutator.free(p.as_ptr());
            mutator.free(std::ptr::null_mut());
        }
        let counters = mutator.counters();
        assert_eq!(counters.malloc.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(counters.realloc.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(counters.freecall.load(std::sync::atomic::Ordering::Relaxed), 1);
        // 116 + 200 allocated, 316 freed
        assert_eq!(counters.allocd(), 316);
        assert_eq!(counters.freed.load(std::sync::atomic::Ordering::Relaxed), 316);
    }

    #[test]
    fn test_calloc_is_zeroed() {
        let heap = heap(small_config());
        let mutator = heap.attach_current_thread();
        unsafe {
            let p = mutator.calloc(8, 16).unwrap();
            assert!(std::slice::from_raw_parts(p.as_ptr(), 128)
                .iter()
                .all(|b| *b == 0));
            mutator.free(p.as_ptr());
        }
        assert!(mutator.calloc(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_managed_malloc_alignment() {
        let heap = heap(small_config());
        let mutator = heap.attach_current_thread();
        unsafe {
            let p = mutator.managed_malloc(10).unwrap();
            assert_eq!(p.as_ptr() as usize % CACHE_BYTE_ALIGNMENT, 0);
            let p = mutator.managed_realloc(p, 10, 1000).unwrap();
            assert_eq!(p.as_ptr() as usize % CACHE_BYTE_ALIGNMENT, 0);
            mutator.managed_free(p, 1000);
        }
        assert_eq!(mutator.counters().allocd(), 64 + (1024 - 64));
    }

    #[test]
    fn test_pool_and_big_paths() {
        let heap = heap(small_config());
        let mutator = heap.attach_current_thread();
        let small = mutator.alloc(24, TypeTag(1)).unwrap();
        let big = mutator.alloc(4000, TypeTag(2)).unwrap();
        assert_ne!(small, big);
        let counters = mutator.counters();
        assert_eq!(counters.poolalloc.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(counters.bigalloc.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(mutator.alloc(usize::MAX, TypeTag(3)).is_err());
    }
}
