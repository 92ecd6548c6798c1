use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    finalizer::{FinalizerRegistry, FinalizerTables},
    heuristics::CollectorState,
    mutator::{Mutator, MutatorRef},
    pages::PageAllocator,
    perm::PermPool,
    safepoint::{GcState, GlobalSafepoint},
    statistics::{GcNum, HeapStatistics},
    tracer::{ObjectRef, TargetState, Tracer},
    util::{fatal, formatted_size},
    Config,
};

/// Result of [`Mutator::collect`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CollectionOutcome {
    /// Collections are disabled. The allocation delta went to the deferred bucket.
    Deferred,
    /// Another thread was already collecting. Returned once it finished.
    Joined,
    /// This thread ran the cycle.
    Collected {
        /// Whether the (first) pass swept the full heap.
        full: bool,
        /// Whether the tracer asked for a quick follow-up pass.
        followup: bool,
    },
}

pub struct Heap<T: Tracer> {
    tracer: T,
    config: Config,
    pub(crate) safepoint: GlobalSafepoint,
    mutators: Mutex<Vec<Arc<Mutator<T>>>>,
    pub(crate) finalizers: FinalizerRegistry<T>,
    pub(crate) state: CollectorState,
    pages: Arc<PageAllocator>,
    perm: PermPool,
    next_id: AtomicUsize,
}

impl<T: Tracer> Heap<T> {
    pub fn new(config: Config, tracer: T) -> Arc<Self> {
        let pages = Arc::new(PageAllocator::new(
            config.region_pg_count,
            config.max_regions,
        ));
        tracer.init_page_manager(pages.clone());
        log::debug!(
            "heap: region size {} pages, collect interval {}, max interval {}",
            config.region_pg_count,
            formatted_size(config.collect_interval),
            formatted_size(config.max_collect_interval)
        );
        Arc::new(Self {
            safepoint: GlobalSafepoint::new(),
            mutators: Mutex::new(Vec::new()),
            finalizers: FinalizerRegistry::new(),
            state: CollectorState::new(config.collect_interval, config.max_collect_interval),
            perm: PermPool::new(config.perm_pool_size, config.perm_pool_limit),
            pages,
            tracer,
            config,
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pages(&self) -> &Arc<PageAllocator> {
        &self.pages
    }

    pub fn perm(&self) -> &PermPool {
        &self.perm
    }

    pub fn collector_state(&self) -> &CollectorState {
        &self.state
    }

    /// Attaches the calling thread. The returned handle detaches it again when dropped.
    pub fn attach_current_thread(self: &Arc<Self>) -> MutatorRef<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mutator = Arc::new(Mutator::new(self.clone(), id));
        self.mutators.lock().push(mutator.clone());
        // Starts out safe. Becoming runnable waits for a collection in progress.
        mutator.state_set(GcState::Running, GcState::Safe);
        log::trace!("attached mutator {}", id);
        MutatorRef::new(mutator)
    }

    /// Spawns a thread attached to this heap for the duration of `closure`.
    pub fn spawn_mutator<F, R>(self: &Arc<Self>, closure: F) -> JoinHandle<R>
    where
        F: FnOnce(&MutatorRef<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let heap = self.clone();
        std::thread::spawn(move || {
            let mutator = heap.attach_current_thread();
            closure(&mutator)
        })
    }

    pub(crate) fn detach(&self, mutator: &Arc<Mutator<T>>) {
        {
            // Registrations of an exiting thread still have to run eventually.
            let tables = self.finalizers.lock();
            let mut leftover = Vec::new();
            unsafe {
                mutator.finalizers.drain_into(&mut leftover, false);
                for entry in leftover {
                    tables.marked.push_locked(entry);
                }
            }
        }
        self.state.merge(&mutator.counters);
        mutator.state.store(GcState::Safe, atomic::Ordering::SeqCst);
        self.mutators
            .lock()
            .retain(|other| !Arc::ptr_eq(other, mutator));
        log::trace!("detached mutator {}", mutator.id());
    }

    pub(crate) fn mutators_snapshot(&self) -> Vec<Arc<Mutator<T>>> {
        self.mutators.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.mutators.lock().len()
    }

    pub(crate) fn collect(&self, mutator: &Mutator<T>, full: bool) -> CollectionOutcome {
        self.state.merge(&mutator.counters);
        if self.state.is_disabled() {
            self.state.defer();
            log::trace!("collection deferred, collections are disabled");
            return CollectionOutcome::Deferred;
        }

        let old_state = mutator.state.load(atomic::Ordering::Relaxed);
        mutator.state.store(GcState::Waiting, atomic::Ordering::SeqCst);
        if !self.safepoint.request_pause() {
            mutator.state_set(old_state, GcState::Waiting);
            return CollectionOutcome::Joined;
        }

        let start = Instant::now();
        // Pointer-free objects can be marked before the world is stopped.
        self.tracer.mark_intrinsics();
        let mutators = self.mutators_snapshot();
        self.safepoint
            .wait_for_quiescence(mutators.iter().map(|m| &m.state));

        let mut outcome = CollectionOutcome::Deferred;
        let live_before = self.state.live_bytes();
        if !self.state.is_disabled() {
            let mut tables = self.finalizers.lock();
            let mutators = self.mutators_snapshot();
            let (full, followup) = self.run_cycle(mutator, &mutators, &mut tables, full, start);
            drop(tables);
            outcome = CollectionOutcome::Collected { full, followup };
        }

        self.safepoint.release_pause();
        mutator.state_set(old_state, GcState::Waiting);

        if let CollectionOutcome::Collected { full, .. } = outcome {
            logln_if!(
                self.config.verbose,
                "[gc] GC({}) Pause {} {}->{}({}) {:.4}ms",
                self.state.snapshot().pause,
                if full { "Full" } else { "Quick" },
                formatted_size(live_before.max(0) as usize),
                formatted_size(self.state.live_bytes().max(0) as usize),
                formatted_size(self.state.interval()),
                start.elapsed().as_micros() as f64 / 1000f64
            );
        }

        if mutator.finalizers_inhibited.get() == 0 && !mutator.in_finalizer.get() {
            mutator.in_finalizer.set(true);
            mutator.run_finalizers();
            mutator.in_finalizer.set(false);
        }
        outcome
    }

    fn run_cycle(
        &self,
        collector: &Mutator<T>,
        mutators: &[Arc<Mutator<T>>],
        tables: &mut FinalizerTables<T>,
        full: bool,
        start: Instant,
    ) -> (bool, bool) {
        for m in mutators {
            self.state.merge(&m.counters);
        }
        self.state.begin_cycle();
        let mut ctx = TraceContext::new(self, collector, mutators, tables, full);
        let followup = self.tracer.trace_and_sweep(&mut ctx, full);
        let sweep_full = ctx.finish();
        self.state
            .finish_cycle(sweep_full, followup, start.elapsed().as_nanos() as u64);
        if followup {
            let again = Instant::now();
            self.tracer.mark_intrinsics();
            self.state.begin_cycle();
            let mut ctx = TraceContext::new(self, collector, mutators, tables, false);
            if self.tracer.trace_and_sweep(&mut ctx, false) {
                fatal("tracer requested another follow-up pass after a follow-up pass");
            }
            let quick_full = ctx.finish();
            self.state
                .finish_cycle(quick_full, false, again.elapsed().as_nanos() as u64);
        }
        (sweep_full, followup)
    }

    pub fn gc_num(&self) -> GcNum {
        self.state.snapshot()
    }

    pub fn total_bytes(&self) -> i64 {
        self.state.total_bytes()
    }

    pub fn total_hrtime(&self) -> u64 {
        self.state.total_hrtime()
    }

    /// Bytes allocated since the previous call.
    pub fn diff_total_bytes(&self) -> i64 {
        self.state.diff_total_bytes()
    }

    pub fn sync_total_bytes(&self) {
        self.state.sync_total_bytes()
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            num: self.gc_num(),
            total_bytes: self.total_bytes(),
            pages_in_use: self.pages.current_pg_count(),
            regions: self.pages.region_count(),
            region_pg_count: self.pages.region_allocator().region_pg_count(),
            perm_bytes: self.perm.allocated(),
            threads: self.thread_count(),
        }
    }
}

/// What the tracer gets to work with during a pass. The world is stopped and the
/// finalizer lock is held for the lifetime of the context.
pub struct TraceContext<'a, T: Tracer> {
    heap: &'a Heap<T>,
    collector: &'a Mutator<T>,
    mutators: &'a [Arc<Mutator<T>>],
    tables: &'a mut FinalizerTables<T>,
    full: bool,
    scanned: usize,
    sweep_full: Option<bool>,
}

impl<'a, T: Tracer> TraceContext<'a, T> {
    fn new(
        heap: &'a Heap<T>,
        collector: &'a Mutator<T>,
        mutators: &'a [Arc<Mutator<T>>],
        tables: &'a mut FinalizerTables<T>,
        full: bool,
    ) -> Self {
        Self {
            heap,
            collector,
            mutators,
            tables,
            full,
            scanned: 0,
            sweep_full: None,
        }
    }

    /// Whether a full collection was requested.
    pub fn full_requested(&self) -> bool {
        self.full
    }

    pub fn pages(&self) -> &Arc<PageAllocator> {
        &self.heap.pages
    }

    pub fn thread_count(&self) -> usize {
        self.mutators.len()
    }

    pub fn collector_id(&self) -> usize {
        self.collector.id()
    }

    /// Calls `f` with every attached thread's heap, the collector's included.
    pub fn for_each_thread_heap(&mut self, mut f: impl FnMut(usize, &mut T::ThreadHeap)) {
        for m in self.mutators {
            // Owners are stopped until the pause is released.
            unsafe { f(m.id(), &mut *m.local.get()) };
        }
    }

    pub fn collector_heap(&mut self) -> &mut T::ThreadHeap {
        unsafe { &mut *self.collector.local.get() }
    }

    /// Targets kept alive by the finalizer machinery before finalizers are swept: pending
    /// finalizers, finalizers being run and, when the marked list is not swept in this
    /// cycle, the marked list.
    pub fn finalizer_roots(&self) -> Vec<ObjectRef> {
        let mut roots = Vec::new();
        let include_marked = !self.heap.state.prev_sweep_full();
        self.tables.for_each_root(include_marked, |t| roots.push(t));
        roots
    }

    /// Targets that must be marked after [`sweep_finalizers`](Self::sweep_finalizers):
    /// every remaining registration and every finalizer that just became pending. Dead
    /// targets stay allocated until their finalizer ran.
    pub fn finalizer_survivors(&self) -> Vec<ObjectRef> {
        let mut survivors = Vec::new();
        for m in self.mutators {
            unsafe { m.finalizers.for_each_target(|t| survivors.push(t)) };
        }
        self.tables.for_each_root(true, |t| survivors.push(t));
        survivors
    }

    /// Marks every thread heap, the global roots together with
    /// [`finalizer_roots`](Self::finalizer_roots) and the intrinsics, then drains the mark
    /// stack.
    pub fn mark_all_roots(&mut self) {
        let tracer = &self.heap.tracer;
        for m in self.mutators {
            unsafe { tracer.mark_thread_local(&mut *m.local.get()) };
        }
        let roots = self.finalizer_roots();
        tracer.mark_roots(&roots);
        tracer.mark_intrinsics();
        tracer.visit_mark_stack();
    }

    /// Sweeps the registrations of every thread. `classify` reports whether a target
    /// survived. The marked list is only reconsidered if the previous sweep was full.
    /// Returns the number of finalizers scheduled or run.
    pub fn sweep_finalizers(&mut self, mut classify: impl FnMut(ObjectRef) -> TargetState) -> usize {
        let tables = &mut *self.tables;
        let mut dead = 0;
        for m in self.mutators {
            dead += unsafe {
                m.finalizers
                    .sweep(&mut classify, &mut tables.pending, Some(&tables.marked))
            };
        }
        if self.heap.state.prev_sweep_full() {
            dead += unsafe { tables.marked.sweep(&mut classify, &mut tables.pending, None) };
        }
        dead
    }

    /// Live bytes found while marking. Feeds the full collection heuristic.
    pub fn record_scanned(&mut self, bytes: usize) {
        self.scanned += bytes;
    }

    pub fn record_freed(&mut self, bytes: usize) {
        self.heap.state.record_freed(bytes);
    }

    /// Decides whether this pass sweeps the full heap. The first call decides and adapts
    /// the collection interval; later calls return the same answer.
    pub fn decide_full_sweep(&mut self) -> bool {
        if let Some(decided) = self.sweep_full {
            return decided;
        }
        let decided = self.heap.state.decide_full_sweep(self.full, self.scanned);
        self.sweep_full = Some(decided);
        decided
    }

    fn finish(mut self) -> bool {
        self.decide_full_sweep()
    }
}
