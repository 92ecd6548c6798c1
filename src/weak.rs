use std::sync::atomic::{AtomicPtr, Ordering};

use crate::tracer::ObjectRef;

/// Handle to a one-word weak reference cell living in the managed heap.
///
/// The cell holds the referent or null. The tracer clears it when the referent dies.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct WeakRef {
    cell: ObjectRef,
}

impl WeakRef {
    /// # Safety
    ///
    /// `cell` must point to a live, word aligned, word sized allocation.
    pub unsafe fn from_cell(cell: ObjectRef) -> Self {
        Self { cell }
    }

    /// The heap object backing this reference.
    pub fn cell(&self) -> ObjectRef {
        self.cell
    }

    fn slot(&self) -> &AtomicPtr<u8> {
        as_atomic!(self.cell.as_ptr(); AtomicPtr<u8>)
    }

    pub fn get(&self) -> Option<ObjectRef> {
        ObjectRef::new(self.slot().load(Ordering::Acquire))
    }

    pub fn set(&self, value: Option<ObjectRef>) {
        let ptr = value.map_or(std::ptr::null_mut(), ObjectRef::as_ptr);
        self.slot().store(ptr, Ordering::Release);
    }

    pub fn clear(&self) {
        self.set(None);
    }

    pub fn is_cleared(&self) -> bool {
        self.get().is_none()
    }
}
