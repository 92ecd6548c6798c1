use std::fmt;

use crate::util::formatted_size;

/// Snapshot of the collector counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcNum {
    /// Bytes allocated since the last collection, offset by `-interval`.
    pub allocd: i64,
    /// Bytes allocated while collections were disabled.
    pub deferred_alloc: i64,
    pub freed: i64,
    pub total_freed: i64,
    pub malloc: u64,
    pub realloc: u64,
    pub poolalloc: u64,
    pub bigalloc: u64,
    pub freecall: u64,
    /// Nanoseconds spent in collections.
    pub total_time: u64,
    pub total_allocd: i64,
    pub since_sweep: i64,
    pub interval: usize,
    pub pause: u64,
    pub full_sweep: u64,
    pub live_bytes: i64,
}

pub struct HeapStatistics {
    pub num: GcNum,
    pub total_bytes: i64,
    pub pages_in_use: usize,
    pub regions: usize,
    pub region_pg_count: usize,
    pub perm_bytes: usize,
    pub threads: usize,
}

fn signed(size: i64) -> String {
    if size < 0 {
        format!("-{}", formatted_size(size.unsigned_abs() as usize))
    } else {
        formatted_size(size as usize).to_string()
    }
}

impl fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(f, "  Mutator threads: {}", self.threads)?;
        writeln!(
            f,
            "  Pages in use: {} in {} regions (region size {} pages)",
            self.pages_in_use, self.regions, self.region_pg_count
        )?;
        writeln!(f, "  Permanent pool: {}", formatted_size(self.perm_bytes))?;
        writeln!(f, "  Live bytes: {}", signed(self.num.live_bytes))?;
        writeln!(f, "  Total allocated: {}", signed(self.total_bytes))?;
        writeln!(f, "  Total freed: {}", signed(self.num.total_freed))?;
        writeln!(
            f,
            "  Allocation interval: {}",
            formatted_size(self.num.interval)
        )?;
        writeln!(
            f,
            "  Allocations: {} pool, {} big, {} malloc, {} realloc, {} free",
            self.num.poolalloc,
            self.num.bigalloc,
            self.num.malloc,
            self.num.realloc,
            self.num.freecall
        )?;
        writeln!(
            f,
            "  Collections: {} ({} full), {:.4}ms total",
            self.num.pause,
            self.num.full_sweep,
            self.num.total_time as f64 / 1_000_000f64
        )
    }
}
