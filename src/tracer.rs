//! Boundary with the object tracer.
//!
//! The core never looks inside objects. Marking, sweeping, remembered sets and the layout
//! of thread-local heaps all belong to a [`Tracer`] implementation; the core drives it
//! through the calls below while it owns the world.

use std::{ptr::NonNull, sync::Arc};

use crate::{error::GcResult, heap::TraceContext, pages::PageAllocator, weak::WeakRef};

/// Address of a managed object.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<u8>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl From<NonNull<u8>> for ObjectRef {
    fn from(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }
}

/// Opaque type descriptor handed through to the tracer on allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypeTag(pub usize);

impl TypeTag {
    /// Tag used for the one-word cells behind [`WeakRef`].
    pub const WEAK_REF: TypeTag = TypeTag(usize::MAX);
}

/// What the tracer found out about a finalizer target while sweeping.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TargetState {
    /// Unreachable. Its finalizer is scheduled.
    Dead,
    /// Reachable and young. Stays in its thread's list.
    Live,
    /// Reachable and old. Moves to the global marked list, which quick sweeps skip.
    Promoted,
}

pub trait Tracer: Send + Sync + Sized + 'static {
    /// Per-thread allocation and marking state.
    type ThreadHeap: Send + 'static;

    /// Receives the page pool the tracer allocates pages from.
    fn init_page_manager(&self, pages: Arc<PageAllocator>);

    fn new_thread_heap(&self, thread_id: usize) -> Self::ThreadHeap;

    /// Allocates a cell of `osize` bytes (header included) from pool `pool`.
    fn pool_alloc(
        &self,
        heap: &mut Self::ThreadHeap,
        pool: usize,
        osize: usize,
        tag: TypeTag,
    ) -> GcResult<ObjectRef>;

    /// Allocates an object of `allocsz` bytes (header included) too large for any pool.
    fn big_alloc(
        &self,
        heap: &mut Self::ThreadHeap,
        allocsz: usize,
        tag: TypeTag,
    ) -> GcResult<ObjectRef>;

    /// Marks the pointer-free singletons. Called before the world is stopped and again
    /// before a follow-up pass.
    fn mark_intrinsics(&self) {}

    /// Marks the global roots plus `finalizer_roots`.
    fn mark_roots(&self, finalizer_roots: &[ObjectRef]);

    fn mark_thread_local(&self, heap: &mut Self::ThreadHeap);

    fn visit_mark_stack(&self) {}

    /// Performs one mark and sweep pass with the world stopped and the finalizer lock
    /// held. Returns `true` if a quick follow-up pass is required.
    ///
    /// A typical pass calls [`TraceContext::mark_all_roots`], classifies the finalizer
    /// targets with [`TraceContext::sweep_finalizers`], marks
    /// [`TraceContext::finalizer_survivors`], settles on
    /// [`TraceContext::decide_full_sweep`] and then sweeps.
    fn trace_and_sweep(&self, ctx: &mut TraceContext<'_, Self>, full: bool) -> bool;

    fn push_weakref(&self, heap: &mut Self::ThreadHeap, weakref: WeakRef);

    fn push_big_object(&self, _heap: &mut Self::ThreadHeap, _object: ObjectRef) {}

    fn queue_root(&self, _heap: &mut Self::ThreadHeap, _object: ObjectRef) {}

    fn queue_binding(&self, _heap: &mut Self::ThreadHeap, _binding: ObjectRef) {}
}
