use std::sync::atomic::{AtomicU32, Ordering};

use atomic::Atomic;
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

/// Per-thread collection state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcState {
    /// The thread may touch collectable memory at any moment.
    Running = 0,
    /// The thread is parked for, or is driving, a collection.
    Waiting = 1,
    /// The thread promised not to touch collectable memory until it leaves this state.
    Safe = 2,
}

impl GcState {
    pub fn safe_for_safepoint(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Process-wide "collection in progress" flag plus the condition mutators park on.
pub struct GlobalSafepoint {
    pub(crate) gc_running: AtomicU32,
    lock: Mutex<()>,
    cv_resume: Condvar,
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            gc_running: AtomicU32::new(0),
            lock: Mutex::new(()),
            cv_resume: Condvar::new(),
        }
    }

    /// Tries to become the collector. `false` means another thread already is.
    pub fn request_pause(&self) -> bool {
        self.gc_running
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline(always)]
    pub fn is_pause_requested(&self) -> bool {
        self.gc_running.load(Ordering::Relaxed) != 0
    }

    /// Spins until every state in `states` is observably not running.
    ///
    /// Pairs with the sequentially consistent store a mutator does before re-checking
    /// the flag: either the collector sees the thread as not running, or the thread sees
    /// the flag and parks.
    pub fn wait_for_quiescence<'a>(&self, states: impl IntoIterator<Item = &'a Atomic<GcState>>) {
        for state in states {
            let backoff = Backoff::new();
            while state.load(atomic::Ordering::SeqCst) == GcState::Running {
                backoff.snooze();
            }
        }
    }

    /// Clears the flag and wakes every parked mutator.
    pub fn release_pause(&self) {
        let guard = self.lock.lock();
        self.gc_running.store(0, Ordering::SeqCst);
        self.cv_resume.notify_all();
        drop(guard);
    }

    /// Parks the calling thread while a collection is in progress.
    pub fn wait_gc(&self) {
        let mut guard = self.lock.lock();
        while self.gc_running.load(Ordering::SeqCst) != 0 {
            self.cv_resume.wait(&mut guard);
        }
    }
}
