use std::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    ops::Deref,
    sync::Arc,
    thread::JoinHandle,
};

use atomic::{Atomic, Ordering};

use crate::{
    finalizer::FinalizerList,
    heap::{CollectionOutcome, Heap},
    heuristics::ThreadCounters,
    safepoint::GcState,
    tracer::Tracer,
};

/// A thread attached to a heap.
///
/// Everything except `state`, the finalizer list and the counters is only touched by the
/// owning thread, or by the collector while the owner is stopped.
pub struct Mutator<T: Tracer> {
    id: usize,
    pub(crate) state: Atomic<GcState>,
    pub(crate) local: UnsafeCell<T::ThreadHeap>,
    pub(crate) finalizers: FinalizerList<T>,
    pub(crate) counters: ThreadCounters,
    pub(crate) finalizers_inhibited: Cell<u32>,
    pub(crate) in_finalizer: Cell<bool>,
    disable_gc: Cell<bool>,
    heap: Arc<Heap<T>>,
}

unsafe impl<T: Tracer> Send for Mutator<T> {}
unsafe impl<T: Tracer> Sync for Mutator<T> {}

impl<T: Tracer> Mutator<T> {
    pub(crate) fn new(heap: Arc<Heap<T>>, id: usize) -> Self {
        let local = heap.tracer().new_thread_heap(id);
        Self {
            id,
            state: Atomic::new(GcState::Safe),
            local: UnsafeCell::new(local),
            finalizers: FinalizerList::new(),
            counters: ThreadCounters::default(),
            finalizers_inhibited: Cell::new(0),
            in_finalizer: Cell::new(false),
            disable_gc: Cell::new(false),
            heap,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn heap(&self) -> &Arc<Heap<T>> {
        &self.heap
    }

    pub fn gc_state(&self) -> GcState {
        self.state.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> &ThreadCounters {
        &self.counters
    }

    /// Runs `f` on this thread's tracer heap. A thread outside `Running` first waits for a
    /// running collection, since the collector owns the heaps of stopped threads.
    pub fn with_thread_heap<R>(&self, f: impl FnOnce(&mut T::ThreadHeap) -> R) -> R {
        if self.gc_state() == GcState::Running {
            return unsafe { f(&mut *self.local.get()) };
        }
        let _unsafe = self.enter_unsafe();
        unsafe { f(&mut *self.local.get()) }
    }

    /// Polls for a pending collection and parks until it is over. Returns `true` if the
    /// thread had to stop.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        if self.heap.safepoint.is_pause_requested() {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn safepoint_slow(&self) {
        self.set_gc_and_wait();
    }

    pub(crate) fn set_gc_and_wait(&self) {
        let state = self.state.load(Ordering::Relaxed);
        loop {
            self.state.store(GcState::Waiting, Ordering::SeqCst);
            self.heap.safepoint.wait_gc();
            self.state.store(state, Ordering::SeqCst);
            // A new pause may have started between waking up and publishing `state`.
            if state.safe_for_safepoint()
                || self.heap.safepoint.gc_running.load(Ordering::SeqCst) == 0
            {
                break;
            }
        }
    }

    /// Switches to `state`. Moving from a safe state into `Running` passes a safepoint.
    pub(crate) fn state_set(&self, state: GcState, old_state: GcState) -> GcState {
        self.state.store(state, Ordering::SeqCst);
        if old_state.safe_for_safepoint()
            && !state.safe_for_safepoint()
            && self.heap.safepoint.gc_running.load(Ordering::SeqCst) != 0
        {
            self.set_gc_and_wait();
        }
        old_state
    }

    pub(crate) fn state_save_and_set(&self, state: GcState) -> GcState {
        self.state_set(state, self.state.load(Ordering::Relaxed))
    }

    /// Enters a region where collectable memory may be touched.
    pub fn enter_unsafe(&self) -> GcStateGuard<'_, T> {
        let state = self.state_save_and_set(GcState::Running);
        GcStateGuard {
            mutator: self,
            gc_state: state,
        }
    }

    /// Enters a region where this thread promises not to touch collectable memory, for
    /// example around a blocking call.
    pub fn enter_safe(&self) -> GcStateGuard<'_, T> {
        let state = self.state_save_and_set(GcState::Safe);
        GcStateGuard {
            mutator: self,
            gc_state: state,
        }
    }

    /// Joins `handle` in a safe region so collections can proceed meanwhile.
    pub fn join<R>(&self, handle: JoinHandle<R>) -> std::thread::Result<R> {
        let _safe = self.enter_safe();
        handle.join()
    }

    pub fn collect(&self, full: bool) -> CollectionOutcome {
        self.heap.collect(self, full)
    }

    /// Enables or disables collections for this thread and returns the previous setting.
    /// Disabling waits for a collection that is already running.
    pub fn enable_gc(&self, on: bool) -> bool {
        let prev = !self.disable_gc.get();
        self.disable_gc.set(!on);
        if on && !prev {
            self.heap.state.enable();
        } else if prev && !on {
            self.heap.state.disable();
            self.safepoint();
        }
        prev
    }

    pub fn is_gc_enabled(&self) -> bool {
        !self.disable_gc.get()
    }
}

pub struct GcStateGuard<'a, T: Tracer> {
    mutator: &'a Mutator<T>,
    gc_state: GcState,
}

impl<'a, T: Tracer> Drop for GcStateGuard<'a, T> {
    fn drop(&mut self) {
        self.mutator.state_save_and_set(self.gc_state);
    }
}

/// Owning handle of an attached thread. Detaches the thread when dropped, so it must stay
/// on the thread that attached.
pub struct MutatorRef<T: Tracer> {
    mutator: Arc<Mutator<T>>,
    _not_send: PhantomData<*const ()>,
}

impl<T: Tracer> MutatorRef<T> {
    pub(crate) fn new(mutator: Arc<Mutator<T>>) -> Self {
        Self {
            mutator,
            _not_send: PhantomData,
        }
    }
}

impl<T: Tracer> Deref for MutatorRef<T> {
    type Target = Mutator<T>;
    fn deref(&self) -> &Self::Target {
        &self.mutator
    }
}

impl<T: Tracer> Drop for MutatorRef<T> {
    fn drop(&mut self) {
        if self.mutator.disable_gc.get() {
            self.mutator.enable_gc(true);
        }
        let heap = self.mutator.heap.clone();
        heap.detach(&self.mutator);
    }
}
