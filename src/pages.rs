use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::{GcError, GcResult},
    globals::PAGE_SIZE,
    region::{PageMeta, Region, RegionAllocator},
    util::{align_down, fatal},
};

/// Page pool handed to the tracer. Pages come out of regions kept in a fixed number of
/// slots; a new region is reserved when every existing one is full.
pub struct PageAllocator {
    regions: Mutex<Vec<Region>>,
    region_allocator: RegionAllocator,
    current_pg_count: AtomicUsize,
    max_regions: usize,
}

impl PageAllocator {
    pub fn new(region_pg_count: usize, max_regions: usize) -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            region_allocator: RegionAllocator::new(region_pg_count),
            current_pg_count: AtomicUsize::new(0),
            max_regions,
        }
    }

    pub fn region_allocator(&self) -> &RegionAllocator {
        &self.region_allocator
    }

    /// Allocates a single zero-meta page, reserving a new region if needed.
    pub fn alloc_page(&self) -> GcResult<NonNull<u8>> {
        let mut regions = self.regions.lock();
        for region in regions.iter_mut() {
            if region.is_full() {
                continue;
            }
            if let Some(page) = region.alloc_page() {
                self.current_pg_count.fetch_add(1, Ordering::Relaxed);
                return Ok(page);
            }
        }
        if regions.len() >= self.max_regions {
            return Err(GcError::NoRegionSlots(self.max_regions));
        }
        let mut region = self.region_allocator.reserve_region()?;
        let page = region
            .alloc_page()
            .ok_or(GcError::OutOfMemory(PAGE_SIZE))?;
        regions.push(region);
        self.current_pg_count.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Returns `page` to its region. Freeing memory no region owns is fatal.
    pub fn free_page(&self, page: NonNull<u8>) {
        let ptr = align_down(page.as_ptr() as usize, PAGE_SIZE) as *mut u8;
        let mut regions = self.regions.lock();
        match regions.iter_mut().find(|region| region.contains(ptr)) {
            Some(region) => region.free_page(ptr),
            None => fatal("free_page: pointer does not belong to any region"),
        }
        self.current_pg_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Runs `f` on the metadata of the page containing `ptr`, if that page is allocated.
    pub fn with_page_meta<R>(&self, ptr: *const u8, f: impl FnOnce(&mut PageMeta) -> R) -> Option<R> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|region| region.contains(ptr))
            .and_then(|region| region.meta(ptr))
            .map(f)
    }

    /// Whether `ptr` points into an allocated page.
    pub fn is_heap_pointer(&self, ptr: *const u8) -> bool {
        let regions = self.regions.lock();
        regions.iter().any(|region| {
            region
                .index_of(ptr)
                .map_or(false, |index| region.is_allocated(index))
        })
    }

    pub fn current_pg_count(&self) -> usize {
        self.current_pg_count.load(Ordering::Relaxed)
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{globals::MIN_REGION_PG_COUNT, util::is_aligned};

    #[test]
    fn test_pages_span_regions() {
        let pages = PageAllocator::new(MIN_REGION_PG_COUNT, 4);
        let mut all = vec![];
        for _ in 0..MIN_REGION_PG_COUNT + 1 {
            let page = pages.alloc_page().unwrap();
            assert!(is_aligned(page.as_ptr() as usize, PAGE_SIZE));
            all.push(page);
        }
        assert_eq!(pages.region_count(), 2);
        assert_eq!(pages.current_pg_count(), MIN_REGION_PG_COUNT + 1);

        let interior = unsafe { all[3].as_ptr().add(17) };
        assert!(pages.is_heap_pointer(interior));
        pages.with_page_meta(interior, |meta| meta.set_pool_n(3)).unwrap();
        assert_eq!(pages.with_page_meta(all[3].as_ptr(), |meta| meta.pool_n()), Some(3));

        pages.free_page(all[3]);
        assert!(!pages.is_heap_pointer(interior));
        assert_eq!(pages.alloc_page().unwrap(), all[3]);
        assert_eq!(pages.region_count(), 2);
    }

    #[test]
    fn test_region_slots_exhausted() {
        let pages = PageAllocator::new(MIN_REGION_PG_COUNT, 1);
        for _ in 0..MIN_REGION_PG_COUNT {
            pages.alloc_page().unwrap();
        }
        assert_eq!(pages.alloc_page().unwrap_err(), GcError::NoRegionSlots(1));
    }
}
