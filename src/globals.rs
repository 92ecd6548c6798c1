use std::mem::size_of;

pub const PAGE_LG2: usize = 14;
/// Size of a heap page. Pages are naturally aligned to this size.
pub const PAGE_SIZE: usize = 1 << PAGE_LG2;
pub const PAGE_OFFSET: usize = PAGE_SIZE - 1;

/// Pages reserved per region before any reservation failed.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_REGION_PG_COUNT: usize = 16 * 8 * 4096; // 8 GB
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_REGION_PG_COUNT: usize = 8 * 4096; // 512 MB
/// Regions never shrink below this many pages.
pub const MIN_REGION_PG_COUNT: usize = 64; // 1 MB

pub const REGION_COUNT: usize = 32768;

pub const SMALL_BYTE_ALIGNMENT: usize = 16;
pub const CACHE_BYTE_ALIGNMENT: usize = 64;

/// Largest object size served from a pool. Anything above goes to the big object path.
pub const MAX_SZCLASS: usize = 2032 - size_of::<usize>();
/// Word stored in front of every managed object.
pub const HEADER_SIZE: usize = size_of::<usize>();

#[cfg(target_pointer_width = "64")]
pub const DEFAULT_COLLECT_INTERVAL: usize = 5600 * 1024 * size_of::<usize>();
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_COLLECT_INTERVAL: usize = 3200 * 1024 * size_of::<usize>();

#[cfg(target_pointer_width = "64")]
pub const MAX_COLLECT_INTERVAL: usize = 1_250_000_000;
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_COLLECT_INTERVAL: usize = 500_000_000;

pub const PERM_POOL_SIZE: usize = 2 * 1024 * 1024;
pub const PERM_POOL_LIMIT: usize = 20 * 1024;

/// Number of bytes a thread may account locally before publishing to the heap counters.
pub const THREAD_COUNTER_FLUSH: usize = 64 * 1024;
