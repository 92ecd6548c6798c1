//! Allocation accounting and the quick/full collection heuristics.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{globals::THREAD_COUNTER_FLUSH, statistics::GcNum};

struct CycleHeuristics {
    last_full_live_ub: i64,
    last_full_live_est: i64,
    last_long_collect_interval: usize,
}

impl CycleHeuristics {
    /// Returns `true` when the live heap grew enough since the last full collection that
    /// a full one is recommended. A zero or shrinking figure resets its baseline.
    fn check_heap_size(&mut self, sz_ub: i64, sz_est: i64) -> bool {
        if self.last_full_live_ub == 0 || self.last_full_live_ub > sz_ub {
            self.last_full_live_ub = sz_ub;
        } else if self.last_full_live_ub * 3 / 2 < sz_ub {
            return true;
        }
        if self.last_full_live_est == 0 || self.last_full_live_est > sz_est {
            self.last_full_live_est = sz_est;
        } else if self.last_full_live_est * 2 < sz_est {
            return true;
        }
        false
    }

    fn update_heap_size(&mut self, sz_ub: i64, sz_est: i64) {
        self.last_full_live_ub = sz_ub;
        self.last_full_live_est = sz_est;
    }
}

/// Counters shared by every thread of a heap.
///
/// `allocd` runs from `-interval` upwards; a collection is due once it is positive.
pub struct CollectorState {
    allocd: AtomicI64,
    deferred_alloc: AtomicI64,
    interval: AtomicUsize,
    freed: AtomicI64,
    total_freed: AtomicI64,
    malloc: AtomicU64,
    realloc: AtomicU64,
    poolalloc: AtomicU64,
    bigalloc: AtomicU64,
    freecall: AtomicU64,
    total_allocd: AtomicI64,
    total_time: AtomicU64,
    since_sweep: AtomicI64,
    pause: AtomicU64,
    full_sweep: AtomicU64,
    live_bytes: AtomicI64,
    last_gc_total_bytes: AtomicI64,
    prev_sweep_full: AtomicBool,
    pub(crate) disable_counter: AtomicU32,
    cycle: Mutex<CycleHeuristics>,
    default_interval: usize,
    max_interval: usize,
}

impl CollectorState {
    pub fn new(default_interval: usize, max_interval: usize) -> Self {
        Self {
            allocd: AtomicI64::new(-(default_interval as i64)),
            deferred_alloc: AtomicI64::new(0),
            interval: AtomicUsize::new(default_interval),
            freed: AtomicI64::new(0),
            total_freed: AtomicI64::new(0),
            malloc: AtomicU64::new(0),
            realloc: AtomicU64::new(0),
            poolalloc: AtomicU64::new(0),
            bigalloc: AtomicU64::new(0),
            freecall: AtomicU64::new(0),
            total_allocd: AtomicI64::new(0),
            total_time: AtomicU64::new(0),
            since_sweep: AtomicI64::new(0),
            pause: AtomicU64::new(0),
            full_sweep: AtomicU64::new(0),
            live_bytes: AtomicI64::new(0),
            last_gc_total_bytes: AtomicI64::new(0),
            prev_sweep_full: AtomicBool::new(true),
            disable_counter: AtomicU32::new(0),
            cycle: Mutex::new(CycleHeuristics {
                last_full_live_ub: 0,
                last_full_live_est: 0,
                last_long_collect_interval: default_interval,
            }),
            default_interval,
            max_interval,
        }
    }

    pub fn interval(&self) -> usize {
        self.interval.load(Ordering::Relaxed)
    }

    pub fn allocd(&self) -> i64 {
        self.allocd.load(Ordering::Relaxed)
    }

    pub fn deferred_alloc(&self) -> i64 {
        self.deferred_alloc.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> i64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disable_counter.load(Ordering::Relaxed) != 0
    }

    pub fn prev_sweep_full(&self) -> bool {
        self.prev_sweep_full.load(Ordering::Relaxed)
    }

    pub(crate) fn merge(&self, counters: &ThreadCounters) {
        macro_rules! take {
            ($field: ident) => {
                counters.$field.swap(0, Ordering::Relaxed)
            };
        }
        self.allocd.fetch_add(take!(allocd), Ordering::Relaxed);
        self.freed.fetch_add(take!(freed), Ordering::Relaxed);
        self.malloc.fetch_add(take!(malloc), Ordering::Relaxed);
        self.realloc.fetch_add(take!(realloc), Ordering::Relaxed);
        self.poolalloc.fetch_add(take!(poolalloc), Ordering::Relaxed);
        self.bigalloc.fetch_add(take!(bigalloc), Ordering::Relaxed);
        self.freecall.fetch_add(take!(freecall), Ordering::Relaxed);
    }

    /// A collection was requested while collections are disabled. Moves the allocation
    /// delta into the deferred bucket and restarts the interval.
    pub(crate) fn defer(&self) {
        let interval = self.interval() as i64;
        let allocd = self.allocd.swap(-interval, Ordering::Relaxed);
        self.deferred_alloc
            .fetch_add(allocd + interval, Ordering::Relaxed);
    }

    /// Returns `true` if this call brought the disable counter back to zero, in which case
    /// the deferred bucket was folded back into `allocd`.
    pub(crate) fn enable(&self) -> bool {
        if self.disable_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            let deferred = self.deferred_alloc.swap(0, Ordering::Relaxed);
            self.allocd.fetch_add(deferred, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub(crate) fn disable(&self) {
        self.disable_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Folds everything allocated so far into the live byte total and restarts the
    /// interval.
    pub fn reset_alloc_count(&self) {
        let interval = self.interval() as i64;
        let allocd = self.allocd.swap(-interval, Ordering::Relaxed);
        let deferred = self.deferred_alloc.swap(0, Ordering::Relaxed);
        self.live_bytes
            .fetch_add(deferred + allocd + interval, Ordering::Relaxed);
    }

    /// World is stopped and every thread's counters were merged.
    pub(crate) fn begin_cycle(&self) {
        let since = self.allocd() + self.interval() as i64;
        self.since_sweep.store(since, Ordering::Relaxed);
    }

    pub(crate) fn record_freed(&self, bytes: usize) {
        self.freed.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    /// Decides whether the current pass sweeps the full heap, and adapts the collection
    /// interval accordingly. `scanned` is the tracer's estimate of live bytes.
    pub(crate) fn decide_full_sweep(&self, full: bool, scanned: usize) -> bool {
        let actual_allocd = self.since_sweep.load(Ordering::Relaxed);
        let live_sz_ub = self.live_bytes() + actual_allocd;
        let live_sz_est = scanned as i64;
        let estimate_freed = live_sz_ub - live_sz_est;
        // we want to free ~70% if possible
        let not_freed_enough = estimate_freed < 7 * (actual_allocd / 10);

        let mut cycle = self.cycle.lock();
        let recommended = cycle.check_heap_size(live_sz_ub, live_sz_est);
        if full || (not_freed_enough && self.prev_sweep_full()) || recommended {
            cycle.update_heap_size(live_sz_ub, live_sz_est);
            let mut interval = self.interval();
            if not_freed_enough {
                if interval < self.default_interval {
                    interval = self.default_interval;
                } else if interval <= 2 * (self.max_interval / 5) {
                    interval = 5 * (interval / 2);
                }
            }
            self.interval.store(interval, Ordering::Relaxed);
            cycle.last_long_collect_interval = interval;
            log::trace!(
                "full sweep: ub={} est={} not_freed_enough={} recommended={} interval={}",
                live_sz_ub,
                live_sz_est,
                not_freed_enough,
                recommended,
                interval
            );
            true
        } else {
            self.interval
                .store(self.default_interval / 2, Ordering::Relaxed);
            false
        }
    }

    pub fn last_long_collect_interval(&self) -> usize {
        self.cycle.lock().last_long_collect_interval
    }

    /// Writes back the statistics of a finished pass.
    pub(crate) fn finish_cycle(&self, full: bool, recollect: bool, elapsed_ns: u64) {
        let since = self.since_sweep.swap(0, Ordering::Relaxed);
        let freed = self.freed.swap(0, Ordering::Relaxed);
        self.total_allocd.fetch_add(since, Ordering::Relaxed);
        self.total_freed.fetch_add(freed, Ordering::Relaxed);
        self.full_sweep.fetch_add(full as u64, Ordering::Relaxed);
        self.prev_sweep_full.store(full, Ordering::Relaxed);
        self.allocd
            .store(-(self.interval() as i64), Ordering::Relaxed);
        self.live_bytes.fetch_add(since - freed, Ordering::Relaxed);
        self.pause.fetch_add(!recollect as u64, Ordering::Relaxed);
        self.total_time.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    /// Bytes allocated over the lifetime of the heap.
    pub fn total_bytes(&self) -> i64 {
        self.total_allocd.load(Ordering::Relaxed)
            + self.deferred_alloc()
            + self.allocd()
            + self.interval() as i64
    }

    pub fn total_hrtime(&self) -> u64 {
        self.total_time.load(Ordering::Relaxed)
    }

    pub fn diff_total_bytes(&self) -> i64 {
        let newtb = self.total_bytes();
        let oldtb = self.last_gc_total_bytes.swap(newtb, Ordering::Relaxed);
        newtb - oldtb
    }

    pub fn sync_total_bytes(&self) {
        self.last_gc_total_bytes
            .store(self.total_bytes(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcNum {
        GcNum {
            allocd: self.allocd(),
            deferred_alloc: self.deferred_alloc(),
            freed: self.freed.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            malloc: self.malloc.load(Ordering::Relaxed),
            realloc: self.realloc.load(Ordering::Relaxed),
            poolalloc: self.poolalloc.load(Ordering::Relaxed),
            bigalloc: self.bigalloc.load(Ordering::Relaxed),
            freecall: self.freecall.load(Ordering::Relaxed),
            total_time: self.total_hrtime(),
            total_allocd: self.total_allocd.load(Ordering::Relaxed),
            since_sweep: self.since_sweep.load(Ordering::Relaxed),
            interval: self.interval(),
            pause: self.pause.load(Ordering::Relaxed),
            full_sweep: self.full_sweep.load(Ordering::Relaxed),
            live_bytes: self.live_bytes(),
        }
    }
}

/// Allocation counters of a single mutator, merged into [`CollectorState`] once they grow
/// past a threshold and at every cycle boundary.
#[derive(Default)]
pub struct ThreadCounters {
    pub(crate) allocd: AtomicI64,
    pub(crate) freed: AtomicI64,
    pub(crate) malloc: AtomicU64,
    pub(crate) realloc: AtomicU64,
    pub(crate) poolalloc: AtomicU64,
    pub(crate) bigalloc: AtomicU64,
    pub(crate) freecall: AtomicU64,
}

impl ThreadCounters {
    pub fn allocd(&self) -> i64 {
        self.allocd.load(Ordering::Relaxed)
    }

    /// Adds `bytes` and reports whether the counters should be published.
    #[inline]
    pub(crate) fn add_allocd(&self, bytes: i64) -> bool {
        let now = self.allocd.fetch_add(bytes, Ordering::Relaxed) + bytes;
        now.unsigned_abs() as usize >= THREAD_COUNTER_FLUSH
    }

    #[inline]
    pub(crate) fn add_freed(&self, bytes: i64) {
        self.freed.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
