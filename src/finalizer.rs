//! Finalizer bookkeeping.
//!
//! Every mutator owns a [`FinalizerList`] it appends to without taking a lock. Other threads
//! may scan and shrink that list while holding the global finalizer lock; the published
//! length is the only synchronization between the two. The global tables hold the list of
//! promoted registrations (`marked`), the queue of finalizers ready to run (`pending`) and
//! the targets of batches that are currently running.

use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::FinalizerError,
    mutator::Mutator,
    tracer::{ObjectRef, TargetState, Tracer},
};

/// Native callback. Invoked directly with the target address.
pub type NativeFinalizer = unsafe extern "C" fn(*mut u8);

/// Managed callback. Runs on a mutator thread with the collector fully operational, so it
/// may allocate, register finalizers and collect.
pub type ManagedFinalizer<T> =
    Arc<dyn Fn(&Mutator<T>, ObjectRef) -> Result<(), FinalizerError> + Send + Sync>;

pub enum FinalizerCallback<T: Tracer> {
    Native(NativeFinalizer),
    Managed(ManagedFinalizer<T>),
}

impl<T: Tracer> Clone for FinalizerCallback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Native(f) => Self::Native(*f),
            Self::Managed(f) => Self::Managed(f.clone()),
        }
    }
}

pub struct FinalizerEntry<T: Tracer> {
    pub target: ObjectRef,
    pub callback: FinalizerCallback<T>,
}

impl<T: Tracer> Clone for FinalizerEntry<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            callback: self.callback.clone(),
        }
    }
}

impl<T: Tracer> fmt::Debug for FinalizerEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.callback {
            FinalizerCallback::Native(_) => "native",
            FinalizerCallback::Managed(_) => "managed",
        };
        f.debug_struct("FinalizerEntry")
            .field("target", &self.target)
            .field("callback", &kind)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic".to_string()
    }
}

impl<T: Tracer> FinalizerEntry<T> {
    pub fn is_native(&self) -> bool {
        matches!(self.callback, FinalizerCallback::Native(_))
    }

    /// Invokes the callback. A panic in a managed callback is reported as an error.
    pub fn run(&self, mutator: &Mutator<T>) -> Result<(), FinalizerError> {
        match &self.callback {
            FinalizerCallback::Native(f) => {
                unsafe { f(self.target.as_ptr()) };
                Ok(())
            }
            FinalizerCallback::Managed(f) => {
                match catch_unwind(AssertUnwindSafe(|| f(mutator, self.target))) {
                    Ok(result) => result,
                    Err(payload) => Err(FinalizerError::new(panic_message(&*payload))),
                }
            }
        }
    }
}

type Slot<T> = UnsafeCell<Option<FinalizerEntry<T>>>;

/// Append-mostly list of registrations with an atomically published length.
///
/// Slots in `[0, len)` may be empty; empty slots are dropped by the next scan. Slots at or
/// past `len` are always empty. Only the owning thread appends and only the owner replaces
/// the buffer, and it does so holding the finalizer lock.
pub struct FinalizerList<T: Tracer> {
    len: AtomicUsize,
    items: UnsafeCell<Box<[Slot<T>]>>,
}

unsafe impl<T: Tracer> Send for FinalizerList<T> {}
unsafe impl<T: Tracer> Sync for FinalizerList<T> {}

impl<T: Tracer> Default for FinalizerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Tracer> FinalizerList<T> {
    pub fn new() -> Self {
        Self {
            len: AtomicUsize::new(0),
            items: UnsafeCell::new(Box::new([])),
        }
    }

    /// Published length, empty slots included.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        unsafe { (&(*self.items.get())).len() }
    }

    unsafe fn slot(&self, i: usize) -> &mut Option<FinalizerEntry<T>> {
        &mut *(*self.items.get())[i].get()
    }

    unsafe fn grow(&self) {
        let items = &mut *self.items.get();
        let new_cap = (items.len() * 2).max(4);
        let mut grown = Vec::with_capacity(new_cap);
        for slot in items.iter_mut() {
            grown.push(UnsafeCell::new(slot.get_mut().take()));
        }
        grown.resize_with(new_cap, || UnsafeCell::new(None));
        *items = grown.into_boxed_slice();
    }

    /// Appends an entry from the owning thread. `lock` is only called when the buffer is
    /// full, and the guard it returns is held while the buffer is replaced.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread owning this list.
    pub(crate) unsafe fn append<G>(&self, entry: FinalizerEntry<T>, lock: impl FnOnce() -> G) {
        let len = self.len.load(Ordering::Acquire);
        if len < self.capacity() {
            *self.slot(len) = Some(entry);
            self.len.store(len + 1, Ordering::Release);
        } else {
            let _guard = lock();
            self.push_locked(entry);
        }
    }

    /// # Safety
    ///
    /// The caller holds the finalizer lock and is the owner of the list, or the list is
    /// not reachable from any other thread.
    pub(crate) unsafe fn push_locked(&self, entry: FinalizerEntry<T>) {
        let len = self.len.load(Ordering::Acquire);
        if len >= self.capacity() {
            self.grow();
        }
        *self.slot(len) = Some(entry);
        self.len.store(len + 1, Ordering::Release);
    }

    /// Publishes a shortened length. Slots in `[newlen, oldlen)` must already be empty.
    fn publish(&self, oldlen: usize, newlen: usize, needs_sync: bool) {
        if newlen == oldlen {
            return;
        }
        if needs_sync {
            // The owner may have appended past `oldlen` meanwhile. Then its store wins and the
            // emptied range stays behind as empty slots.
            let _ = self.len.compare_exchange(
                oldlen,
                newlen,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        } else {
            self.len.store(newlen, Ordering::Release);
        }
    }

    /// Removes the entry at `i` by moving the last one into its place.
    unsafe fn swap_remove(&self, i: usize, len: &mut usize) -> Option<FinalizerEntry<T>> {
        *len -= 1;
        let removed = self.slot(i).take();
        if i < *len {
            *self.slot(i) = self.slot(*len).take();
        }
        removed
    }

    /// Removes every registration for `target` and every empty slot. Native callbacks are
    /// invoked on the spot; managed entries are moved into `into`. Returns the number of
    /// registrations found.
    ///
    /// # Safety
    ///
    /// The caller holds the finalizer lock. `needs_sync` must be set unless the caller owns
    /// the list or the owner is stopped.
    pub(crate) unsafe fn scan_and_remove_matching(
        &self,
        target: ObjectRef,
        into: &mut Vec<FinalizerEntry<T>>,
        needs_sync: bool,
    ) -> usize {
        let oldlen = self.len.load(Ordering::Acquire);
        let mut len = oldlen;
        let mut found = 0;
        let mut i = 0;
        while i < len {
            let matched = match self.slot(i) {
                Some(entry) => entry.target == target,
                None => {
                    self.swap_remove(i, &mut len);
                    continue;
                }
            };
            if !matched {
                i += 1;
                continue;
            }
            if let Some(entry) = self.swap_remove(i, &mut len) {
                found += 1;
                match entry.callback {
                    FinalizerCallback::Native(f) => f(entry.target.as_ptr()),
                    FinalizerCallback::Managed(_) => into.push(entry),
                }
            }
        }
        self.publish(oldlen, len, needs_sync);
        found
    }

    /// Moves every entry into `into` and empties the list.
    ///
    /// # Safety
    ///
    /// Same contract as [`scan_and_remove_matching`](Self::scan_and_remove_matching).
    pub(crate) unsafe fn drain_into(&self, into: &mut Vec<FinalizerEntry<T>>, needs_sync: bool) {
        let oldlen = self.len.load(Ordering::Acquire);
        for i in 0..oldlen {
            if let Some(entry) = self.slot(i).take() {
                into.push(entry);
            }
        }
        self.publish(oldlen, 0, needs_sync);
    }

    /// Sweeps the list against the tracer's verdicts. Dead native entries run immediately,
    /// dead managed entries go to `pending`, promoted entries move to `promote_into` when
    /// given. Returns the number of dead targets found.
    ///
    /// # Safety
    ///
    /// The world is stopped and the caller holds the finalizer lock.
    pub(crate) unsafe fn sweep(
        &self,
        classify: &mut dyn FnMut(ObjectRef) -> TargetState,
        pending: &mut Vec<FinalizerEntry<T>>,
        promote_into: Option<&FinalizerList<T>>,
    ) -> usize {
        let oldlen = self.len.load(Ordering::Acquire);
        let mut len = oldlen;
        let mut dead = 0;
        let mut i = 0;
        while i < len {
            let state = match self.slot(i) {
                Some(entry) => classify(entry.target),
                None => {
                    self.swap_remove(i, &mut len);
                    continue;
                }
            };
            match (state, promote_into) {
                (TargetState::Dead, _) => {
                    if let Some(entry) = self.swap_remove(i, &mut len) {
                        dead += 1;
                        match entry.callback {
                            FinalizerCallback::Native(f) => f(entry.target.as_ptr()),
                            FinalizerCallback::Managed(_) => pending.push(entry),
                        }
                    }
                }
                (TargetState::Promoted, Some(marked)) => {
                    if let Some(entry) = self.swap_remove(i, &mut len) {
                        marked.push_locked(entry);
                    }
                }
                _ => i += 1,
            }
        }
        self.publish(oldlen, len, false);
        dead
    }

    /// Calls `f` for every registered target.
    ///
    /// # Safety
    ///
    /// The caller holds the finalizer lock or owns the list.
    pub(crate) unsafe fn for_each_target(&self, mut f: impl FnMut(ObjectRef)) {
        let len = self.len.load(Ordering::Acquire);
        for i in 0..len {
            if let Some(entry) = self.slot(i) {
                f(entry.target);
            }
        }
    }

    /// Number of non-empty slots.
    ///
    /// # Safety
    ///
    /// Same contract as [`for_each_target`](Self::for_each_target).
    pub(crate) unsafe fn live_entries(&self) -> usize {
        let mut count = 0;
        self.for_each_target(|_| count += 1);
        count
    }
}

/// State behind the global finalizer lock.
pub struct FinalizerTables<T: Tracer> {
    /// Registrations whose targets were promoted. Only reconsidered after a full sweep.
    pub(crate) marked: FinalizerList<T>,
    /// Finalizers whose targets are dead, waiting to run.
    pub(crate) pending: Vec<FinalizerEntry<T>>,
    in_flight: Vec<(u64, Vec<ObjectRef>)>,
    next_batch: u64,
}

impl<T: Tracer> FinalizerTables<T> {
    /// Records `entries` as a running batch. Their targets stay roots until
    /// [`finish_batch`](Self::finish_batch).
    pub(crate) fn begin_batch(&mut self, entries: &[FinalizerEntry<T>]) -> u64 {
        let id = self.next_batch;
        self.next_batch += 1;
        self.in_flight
            .push((id, entries.iter().map(|entry| entry.target).collect()));
        id
    }

    pub(crate) fn finish_batch(&mut self, id: u64) {
        self.in_flight.retain(|(batch, _)| *batch != id);
    }

    /// Targets that must survive the current collection: pending finalizers, batches being
    /// run and, unless the marked list is swept in this cycle, the marked list.
    pub(crate) fn for_each_root(&self, include_marked: bool, mut f: impl FnMut(ObjectRef)) {
        if include_marked {
            unsafe { self.marked.for_each_target(&mut f) };
        }
        for entry in &self.pending {
            f(entry.target);
        }
        for (_, targets) in &self.in_flight {
            targets.iter().copied().for_each(&mut f);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn marked_len(&self) -> usize {
        unsafe { self.marked.live_entries() }
    }
}

pub struct FinalizerRegistry<T: Tracer> {
    tables: Mutex<FinalizerTables<T>>,
    pending_len: AtomicUsize,
}

impl<T: Tracer> Default for FinalizerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Tracer> FinalizerRegistry<T> {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(FinalizerTables {
                marked: FinalizerList::new(),
                pending: Vec::new(),
                in_flight: Vec::new(),
                next_batch: 0,
            }),
            pending_len: AtomicUsize::new(0),
        }
    }

    /// Takes the global finalizer lock. Nothing may reach a safepoint while holding it.
    pub fn lock(&self) -> FinalizerGuard<'_, T> {
        FinalizerGuard {
            tables: self.tables.lock(),
            pending_len: &self.pending_len,
        }
    }

    /// Racy check used to skip the lock when nothing is pending.
    pub fn has_pending(&self) -> bool {
        self.pending_len.load(Ordering::Relaxed) != 0
    }
}

pub struct FinalizerGuard<'a, T: Tracer> {
    tables: MutexGuard<'a, FinalizerTables<T>>,
    pending_len: &'a AtomicUsize,
}

impl<'a, T: Tracer> Deref for FinalizerGuard<'a, T> {
    type Target = FinalizerTables<T>;
    fn deref(&self) -> &Self::Target {
        &self.tables
    }
}

impl<'a, T: Tracer> DerefMut for FinalizerGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tables
    }
}

impl<'a, T: Tracer> Drop for FinalizerGuard<'a, T> {
    fn drop(&mut self) {
        self.pending_len
            .store(self.tables.pending.len(), Ordering::Relaxed);
    }
}

impl<T: Tracer> Mutator<T> {
    /// Registers a managed finalizer for `target`.
    pub fn add_finalizer<F>(&self, target: ObjectRef, callback: F)
    where
        F: Fn(&Mutator<T>, ObjectRef) -> Result<(), FinalizerError> + Send + Sync + 'static,
    {
        self.register_finalizer(FinalizerEntry {
            target,
            callback: FinalizerCallback::Managed(Arc::new(callback)),
        });
    }

    /// Registers a native finalizer for `target`.
    pub fn add_ptr_finalizer(&self, target: ObjectRef, callback: NativeFinalizer) {
        self.register_finalizer(FinalizerEntry {
            target,
            callback: FinalizerCallback::Native(callback),
        });
    }

    pub fn register_finalizer(&self, entry: FinalizerEntry<T>) {
        // The collector sweeps the lists of stopped threads without syncing with the owner.
        let _unsafe = self.enter_unsafe();
        // A mutator is only ever used from the thread that attached it.
        unsafe {
            self.finalizers
                .append(entry, || self.heap().finalizers.lock());
        }
    }

    /// Number of registrations in this thread's own list.
    pub fn finalizer_count(&self) -> usize {
        let _guard = self.heap().finalizers.lock();
        unsafe { self.finalizers.live_entries() }
    }

    /// Runs every finalizer registered for `target` now, on this thread. Returns the
    /// number of finalizers found.
    pub fn finalize_now(&self, target: ObjectRef) -> usize {
        let heap = self.heap();
        let mut tables = heap.finalizers.lock();
        let mut copied = Vec::new();
        let mut found = 0;
        for mutator in heap.mutators_snapshot() {
            found += unsafe {
                mutator
                    .finalizers
                    .scan_and_remove_matching(target, &mut copied, mutator.id() != self.id())
            };
        }
        found += unsafe {
            tables
                .marked
                .scan_and_remove_matching(target, &mut copied, false)
        };
        if copied.is_empty() {
            return found;
        }
        let batch = tables.begin_batch(&copied);
        drop(tables);
        self.run_finalizer_batch(batch, copied);
        found
    }

    /// Runs the finalizers that became pending. The queue is swapped out under the lock
    /// and the batch runs without it.
    pub fn run_finalizers(&self) {
        let heap = self.heap();
        if !heap.finalizers.has_pending() {
            return;
        }
        let mut tables = heap.finalizers.lock();
        if tables.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut tables.pending);
        let id = tables.begin_batch(&batch);
        drop(tables);
        self.run_finalizer_batch(id, batch);
    }

    /// Schedules every registered finalizer of every thread and runs them. Meant for
    /// process shutdown.
    pub fn run_all_finalizers(&self) {
        let heap = self.heap();
        {
            let mut tables = heap.finalizers.lock();
            let mut all = Vec::new();
            for mutator in heap.mutators_snapshot() {
                unsafe {
                    mutator
                        .finalizers
                        .drain_into(&mut all, mutator.id() != self.id())
                };
            }
            unsafe { tables.marked.drain_into(&mut all, false) };
            tables.pending.append(&mut all);
        }
        self.run_finalizers();
    }

    /// Runs a batch in reverse registration order so lower-level finalizers run last.
    fn run_finalizer_batch(&self, id: u64, batch: Vec<FinalizerEntry<T>>) {
        for entry in batch.iter().rev() {
            if let Err(err) = entry.run(self) {
                log::error!("error in running finalizer: {}", err);
            }
        }
        self.heap().finalizers.lock().finish_batch(id);
    }

    /// Inhibits (`false`) or re-allows (`true`) automatic finalizer runs on this thread.
    /// Calls nest. Lifting the last inhibition runs whatever became pending meanwhile.
    pub fn enable_finalizers(&self, on: bool) {
        let old = self.finalizers_inhibited.get();
        if on && old == 0 {
            log::warn!("finalizers already enabled on this thread");
            return;
        }
        let new = if on { old - 1 } else { old + 1 };
        self.finalizers_inhibited.set(new);
        if new == 0 && old != 0 && !self.in_finalizer.get() {
            self.in_finalizer.set(true);
            self.run_finalizers();
            self.in_finalizer.set(false);
        }
    }

    pub fn finalizers_inhibited(&self) -> u32 {
        self.finalizers_inhibited.get()
    }

    pub fn in_finalizer(&self) -> bool {
        self.in_finalizer.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockTracer;

    fn entry(target: usize) -> FinalizerEntry<MockTracer> {
        FinalizerEntry {
            target: ObjectRef::new(target as *mut u8).unwrap(),
            callback: FinalizerCallback::Managed(Arc::new(|_, _| Ok(()))),
        }
    }

    fn target(addr: usize) -> ObjectRef {
        ObjectRef::new(addr as *mut u8).unwrap()
    }

    #[test]
    fn test_list_append_and_remove() {
        let list = FinalizerList::<MockTracer>::new();
        let lock = Mutex::new(());
        unsafe {
            for i in 1..=10 {
                list.append(entry(i * 16), || lock.lock());
            }
            assert_eq!(list.len(), 10);
            let mut into = vec![];
            assert_eq!(list.scan_and_remove_matching(target(48), &mut into, false), 1);
            assert_eq!(into.len(), 1);
            assert_eq!(into[0].target, target(48));
            assert_eq!(list.len(), 9);
            let mut seen = vec![];
            list.for_each_target(|t| seen.push(t.addr()));
            seen.sort_unstable();
            assert_eq!(seen, vec![16, 32, 64, 80, 96, 112, 128, 144, 160]);
        }
    }

    #[test]
    fn test_list_removes_duplicates_and_holes() {
        let list = FinalizerList::<MockTracer>::new();
        unsafe {
            list.push_locked(entry(16));
            list.push_locked(entry(32));
            list.push_locked(entry(16));
            *list.slot(1) = None;
            let mut into = vec![];
            assert_eq!(list.scan_and_remove_matching(target(16), &mut into, true), 2);
            assert_eq!(into.len(), 2);
            assert_eq!(list.len(), 0);
        }
    }

    #[test]
    fn test_sweep_classifies() {
        let list = FinalizerList::<MockTracer>::new();
        let marked = FinalizerList::<MockTracer>::new();
        let mut pending = vec![];
        unsafe {
            list.push_locked(entry(16));
            list.push_locked(entry(32));
            list.push_locked(entry(48));
            let dead = list.sweep(
                &mut |t| match t.addr() {
                    16 => TargetState::Dead,
                    32 => TargetState::Promoted,
                    _ => TargetState::Live,
                },
                &mut pending,
                Some(&marked),
            );
            assert_eq!(dead, 1);
            assert_eq!(pending[0].target, target(16));
            assert_eq!(marked.live_entries(), 1);
            assert_eq!(list.live_entries(), 1);
            assert_eq!(list.len(), 1);
        }
    }

    #[test]
    fn test_failing_callback_reports_panic() {
        let heap = crate::tests::heap(crate::tests::small_config());
        let mutator = heap.attach_current_thread();
        let entry = FinalizerEntry::<MockTracer> {
            target: target(16),
            callback: FinalizerCallback::Managed(Arc::new(|_, _| panic!("boom"))),
        };
        let err = entry.run(&mutator).unwrap_err();
        assert_eq!(err.message, "panic: boom");
    }
}
