//! Raw memory regions carved into fixed size pages.
//!
//! A region is one contiguous reservation holding the page array followed by an
//! allocation bitmap (one bit per page) and a per-page metadata array. Page memory is
//! only backed once a page is handed out; the bitmap and metadata are committed when
//! the region is created.

use std::{
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use modular_bitfield::prelude::*;

use crate::{
    error::{GcError, GcResult},
    globals::{MIN_REGION_PG_COUNT, PAGE_SIZE},
    mmap::{os_page_size, Mmap},
    util::{align_up, fatal},
};

/// Bookkeeping the tracer keeps for every page.
#[bitfield(bits = 64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageMeta {
    /// Index of the size class pool the page belongs to.
    pub pool_n: B8,
    pub has_marked: bool,
    pub has_young: bool,
    pub nold: B11,
    pub prev_nold: B11,
    pub nfree: B11,
    /// Object size of the pool. Zero for pages owned by no pool.
    pub osize: B12,
    pub thread_n: B9,
}

/// Chooses how many pages the next region gets.
///
/// The target starts at the configured count. When a reservation at the current target
/// fails it is quartered while at least four times the floor, then clamped to the floor.
/// The lowered target is shared by every later reservation and never raised again.
pub struct RegionAllocator {
    region_pg_count: AtomicUsize,
}

impl RegionAllocator {
    pub fn new(initial_pg_count: usize) -> Self {
        Self {
            region_pg_count: AtomicUsize::new(initial_pg_count.max(MIN_REGION_PG_COUNT)),
        }
    }

    pub fn region_pg_count(&self) -> usize {
        self.region_pg_count.load(Ordering::Acquire)
    }

    /// Runs the reservation ladder with a caller supplied reservation attempt. Returns the
    /// reserved value together with the page count it was reserved for.
    pub fn reserve_with<R>(
        &self,
        mut try_reserve: impl FnMut(usize) -> Option<R>,
    ) -> GcResult<(R, usize)> {
        let mut pg_cnt = self.region_pg_count();
        loop {
            if let Some(region) = try_reserve(pg_cnt) {
                return Ok((region, pg_cnt));
            }
            let next = if pg_cnt >= MIN_REGION_PG_COUNT * 4 {
                pg_cnt / 4
            } else if pg_cnt > MIN_REGION_PG_COUNT {
                MIN_REGION_PG_COUNT
            } else {
                log::warn!(
                    "could not reserve a region of {} pages, giving up",
                    MIN_REGION_PG_COUNT
                );
                return Err(GcError::RegionExhausted {
                    min_pages: MIN_REGION_PG_COUNT,
                });
            };
            let previous = self.region_pg_count.fetch_min(next, Ordering::AcqRel);
            pg_cnt = previous.min(next);
            log::debug!(
                "region reservation failed, lowering region size to {} pages",
                pg_cnt
            );
        }
    }

    pub fn reserve_region(&self) -> GcResult<Region> {
        self.reserve_with(Region::map).map(|(region, _)| region)
    }
}

pub struct Region {
    map: Mmap,
    pages: *mut u8,
    allocmap: *mut u32,
    meta: *mut PageMeta,
    pg_cnt: usize,
    /// First bitmap word that may contain a free page.
    lb: usize,
    /// One past the highest bitmap word that ever had a page allocated.
    ub: usize,
    allocated: usize,
}

unsafe impl Send for Region {}

impl Region {
    /// Maps a region of `pg_cnt` pages. Returns `None` if the OS refuses the reservation.
    pub fn map(pg_cnt: usize) -> Option<Region> {
        let words = (pg_cnt + 31) / 32;
        let pages_sz = pg_cnt.checked_mul(PAGE_SIZE)?;
        let allocmap_sz = words * size_of::<u32>();
        let meta_off = align_up(allocmap_sz, size_of::<PageMeta>());
        let meta_sz = pg_cnt.checked_mul(size_of::<PageMeta>())?;
        let slack = if PAGE_SIZE > os_page_size() {
            PAGE_SIZE
        } else {
            0
        };
        let total = pages_sz
            .checked_add(meta_off)?
            .checked_add(meta_sz)?
            .checked_add(slack)?;
        let map = Mmap::reserve(total)?;
        let pages = map.aligned(PAGE_SIZE);
        unsafe {
            let allocmap = pages.add(pages_sz);
            if !map.commit(allocmap, meta_off + meta_sz) {
                return None;
            }
            std::ptr::write_bytes(allocmap, 0, meta_off + meta_sz);
            log::debug!(
                "reserved region of {} pages at {:p}",
                pg_cnt,
                pages
            );
            Some(Region {
                pages,
                allocmap: allocmap.cast(),
                meta: allocmap.add(meta_off).cast(),
                pg_cnt,
                lb: 0,
                ub: 0,
                allocated: 0,
                map,
            })
        }
    }

    pub fn pg_cnt(&self) -> usize {
        self.pg_cnt
    }

    pub fn start(&self) -> *mut u8 {
        self.pages
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.pages.add(self.pg_cnt * PAGE_SIZE) }
    }

    pub fn allocated_pages(&self) -> usize {
        self.allocated
    }

    pub fn is_full(&self) -> bool {
        self.allocated == self.pg_cnt
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.pages as usize && addr < self.end() as usize
    }

    pub fn index_of(&self, ptr: *const u8) -> Option<usize> {
        if self.contains(ptr) {
            Some((ptr as usize - self.pages as usize) / PAGE_SIZE)
        } else {
            None
        }
    }

    fn words(&self) -> usize {
        (self.pg_cnt + 31) / 32
    }

    fn word(&self, i: usize) -> &mut u32 {
        debug_assert!(i < self.words());
        unsafe { &mut *self.allocmap.add(i) }
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        index < self.pg_cnt && *self.word(index / 32) & (1 << (index % 32)) != 0
    }

    /// Hands out the lowest free page of the region, committing its memory.
    pub fn alloc_page(&mut self) -> Option<NonNull<u8>> {
        let words = self.words();
        let mut i = self.lb;
        while i < words {
            let w = *self.word(i);
            if w != u32::MAX {
                let bit = w.trailing_ones() as usize;
                let index = i * 32 + bit;
                if index >= self.pg_cnt {
                    break;
                }
                *self.word(i) |= 1 << bit;
                self.lb = i;
                self.ub = self.ub.max(i + 1);
                self.allocated += 1;
                unsafe {
                    let page = self.pages.add(index * PAGE_SIZE);
                    if !self.map.commit(page, PAGE_SIZE) {
                        *self.word(i) &= !(1 << bit);
                        self.allocated -= 1;
                        return None;
                    }
                    *self.meta.add(index) = PageMeta::new();
                    return NonNull::new(page);
                }
            }
            i += 1;
        }
        self.lb = words;
        None
    }

    /// Returns a page to the region. Freeing a page that is not allocated is fatal.
    pub fn free_page(&mut self, page: *mut u8) {
        let index = match self.index_of(page) {
            Some(index) => index,
            None => fatal("free_page: page not owned by region"),
        };
        let i = index / 32;
        let mask = 1u32 << (index % 32);
        if *self.word(i) & mask == 0 {
            fatal("free_page: page is not allocated");
        }
        *self.word(i) &= !mask;
        self.allocated -= 1;
        if i < self.lb {
            self.lb = i;
        }
        unsafe {
            *self.meta.add(index) = PageMeta::new();
            if os_page_size() <= PAGE_SIZE {
                self.map.dontneed(self.pages.add(index * PAGE_SIZE), PAGE_SIZE);
            }
        }
    }

    /// Metadata of the page containing `ptr`.
    pub fn meta(&self, ptr: *const u8) -> Option<&mut PageMeta> {
        let index = self.index_of(ptr)?;
        if !self.is_allocated(index) {
            return None;
        }
        unsafe { Some(&mut *self.meta.add(index)) }
    }

    /// Bitmap words below this bound are the only ones that ever held a page.
    pub fn high_water_words(&self) -> usize {
        self.ub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::is_aligned;
    use std::sync::Barrier;

    #[test]
    fn test_ladder_quarters_then_remembers() {
        let regions = RegionAllocator::new(1 << 20);
        let mut attempts = vec![];
        let (got, pg_cnt) = regions
            .reserve_with(|n| {
                attempts.push(n);
                if n <= 1 << 18 {
                    Some(n)
                } else {
                    None
                }
            })
            .unwrap();
        assert_eq!(got, 1 << 18);
        assert_eq!(pg_cnt, 1 << 18);
        assert_eq!(attempts, vec![1 << 20, 1 << 18]);
        assert_eq!(regions.region_pg_count(), 1 << 18);

        let mut next = vec![];
        regions
            .reserve_with(|n| {
                next.push(n);
                Some(())
            })
            .unwrap();
        assert_eq!(next, vec![1 << 18]);
    }

    #[test]
    fn test_ladder_clamps_to_floor_then_fails() {
        let regions = RegionAllocator::new(MIN_REGION_PG_COUNT * 3);
        let mut attempts = vec![];
        let result = regions.reserve_with(|n| -> Option<()> {
            attempts.push(n);
            None
        });
        assert_eq!(
            result.unwrap_err(),
            GcError::RegionExhausted {
                min_pages: MIN_REGION_PG_COUNT
            }
        );
        assert_eq!(attempts, vec![MIN_REGION_PG_COUNT * 3, MIN_REGION_PG_COUNT]);
        assert_eq!(regions.region_pg_count(), MIN_REGION_PG_COUNT);
    }

    #[test]
    fn test_racing_reservations_never_raise() {
        let regions = RegionAllocator::new(1 << 24);
        let barrier = Barrier::new(2);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let (n, _) = regions
                        .reserve_with(|n| {
                            if n == 1 << 24 {
                                barrier.wait();
                                None
                            } else {
                                Some(n)
                            }
                        })
                        .unwrap();
                    assert_eq!(n, 1 << 22);
                });
            }
        });
        assert_eq!(regions.region_pg_count(), 1 << 22);
    }

    #[test]
    fn test_region_pages() {
        let mut region = Region::map(MIN_REGION_PG_COUNT).unwrap();
        assert!(is_aligned(region.start() as usize, PAGE_SIZE));
        let a = region.alloc_page().unwrap();
        let b = region.alloc_page().unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, PAGE_SIZE);
        unsafe {
            a.as_ptr().write_bytes(0xAB, PAGE_SIZE);
        }
        region.meta(a.as_ptr()).unwrap().set_osize(64);
        assert_eq!(region.meta(unsafe { a.as_ptr().add(100) }).unwrap().osize(), 64);

        region.free_page(a.as_ptr());
        assert!(region.meta(a.as_ptr()).is_none());
        assert_eq!(region.alloc_page().unwrap(), a);

        for _ in 2..MIN_REGION_PG_COUNT {
            region.alloc_page().unwrap();
        }
        assert!(region.is_full());
        assert!(region.alloc_page().is_none());
    }

    #[test]
    fn test_high_water_survives_frees() {
        let mut region = Region::map(MIN_REGION_PG_COUNT).unwrap();
        assert_eq!(region.high_water_words(), 0);
        let pages: Vec<_> = (0..33).map(|_| region.alloc_page().unwrap()).collect();
        assert_eq!(region.high_water_words(), 2);
        for page in &pages {
            region.free_page(page.as_ptr());
        }
        assert_eq!(region.allocated_pages(), 0);
        assert_eq!(region.high_water_words(), 2);
        assert_eq!(region.alloc_page().unwrap(), pages[0]);
        assert_eq!(region.high_water_words(), 2);
    }
}
