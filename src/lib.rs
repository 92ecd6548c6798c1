//! Memory management core for managed language runtimes.
//!
//! The crate supplies heap pages, stops the world for one collector at a time, keeps the
//! allocation accounting that decides when and how thoroughly to collect, and runs
//! finalizers. Marking and sweeping belong to the embedder's [`Tracer`].
//!
//! ```ignore
//! let heap = Heap::new(Config::from_env(), MyTracer::new());
//! let mutator = heap.attach_current_thread();
//! let object = mutator.alloc(32, TypeTag(7))?;
//! mutator.add_finalizer(object, |_, obj| {
//!     println!("finalizing {:p}", obj.as_ptr());
//!     Ok(())
//! });
//! mutator.collect(true);
//! ```

macro_rules! as_atomic {
    ($value: expr; $t: ty) => {
        unsafe { &*($value as *const _ as *const $t) }
    };
}

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        } else {
            log::debug!($($t)*);
        }
    };
}

pub mod alloc;
pub mod error;
pub mod finalizer;
pub mod globals;
pub mod heap;
pub mod heuristics;
pub mod mmap;
pub mod mutator;
pub mod pages;
pub mod perm;
pub mod region;
pub mod safepoint;
pub mod size_class;
pub mod statistics;
pub mod tracer;
pub mod util;
pub mod weak;


pub use error::{FinalizerError, GcError, GcResult};
pub use finalizer::{FinalizerCallback, FinalizerEntry, NativeFinalizer};
pub use heap::{CollectionOutcome, Heap, TraceContext};
pub use mutator::{Mutator, MutatorRef};
pub use safepoint::GcState;
pub use statistics::{GcNum, HeapStatistics};
pub use tracer::{ObjectRef, TargetState, Tracer, TypeTag};
pub use weak::WeakRef;

use globals::*;
use util::read_usize_from_env;

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Pages per region to try first. Lowered for good once a reservation fails.
    pub region_pg_count: usize,
    /// Maximum number of regions the page pool may reserve
    pub max_regions: usize,
    /// Bytes to allocate between collections
    pub collect_interval: usize,
    /// Upper bound for the adaptive interval
    pub max_collect_interval: usize,
    /// Chunk size of the permanent pool
    pub perm_pool_size: usize,
    /// Larger permanent allocations bypass the pool
    pub perm_pool_limit: usize,
    /// Logs every pause at info level
    pub verbose: bool,
}

#[cfg(target_pointer_width = "64")]
fn default_max_collect_interval() -> usize {
    // on a big memory machine, let the interval grow up to half of physical memory
    mmap::physical_memory().map_or(MAX_COLLECT_INTERVAL, |total_mem| {
        MAX_COLLECT_INTERVAL.max(total_mem / 2)
    })
}

#[cfg(not(target_pointer_width = "64"))]
fn default_max_collect_interval() -> usize {
    MAX_COLLECT_INTERVAL
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_pg_count: DEFAULT_REGION_PG_COUNT,
            max_regions: REGION_COUNT,
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            max_collect_interval: default_max_collect_interval(),
            perm_pool_size: PERM_POOL_SIZE,
            perm_pool_limit: PERM_POOL_LIMIT,
            verbose: false,
        }
    }
}

impl Config {
    /// Default configuration with `GALE_GC_*` overrides from the environment. Sizes accept
    /// `k`, `m` and `g` suffixes.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(pages) = read_usize_from_env("GALE_GC_REGION_PAGES") {
            config.region_pg_count = pages.max(MIN_REGION_PG_COUNT);
        }
        if let Some(regions) = read_usize_from_env("GALE_GC_MAX_REGIONS") {
            config.max_regions = regions.clamp(1, REGION_COUNT);
        }
        if let Some(interval) = read_usize_from_env("GALE_GC_INTERVAL") {
            config.collect_interval = interval;
        }
        if let Some(interval) = read_usize_from_env("GALE_GC_MAX_INTERVAL") {
            config.max_collect_interval = interval;
        }
        if let Some(size) = read_usize_from_env("GALE_GC_PERM_POOL") {
            config.perm_pool_size = size;
        }
        if let Some(verbose) = read_usize_from_env("GALE_GC_VERBOSE") {
            config.verbose = verbose != 0;
        }
        config.max_collect_interval = config.max_collect_interval.max(config.collect_interval);
        config
    }
}
