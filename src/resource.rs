//! Byte-level allocation, abstracted away from the collector.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::AllocError;

/// A size- and alignment-aware byte allocator supplied by the embedder.
///
/// The collector serializes its own calls into the resource behind its
/// mutex; implementations must additionally be safe to share between heaps,
/// hence the `Send + Sync` bound.
pub trait MemoryResource: Send + Sync {
    /// Allocate `layout.size()` bytes aligned to `layout.align()`.
    ///
    /// The collector never requests a zero-sized layout.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when the request cannot be satisfied.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Return bytes previously obtained from [`allocate`](Self::allocate)
    /// with the same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.allocate(layout)` and must not
    /// be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Whether memory allocated from `self` can be deallocated through
    /// `other` and vice versa. The default compares identity.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn MemoryResource)
    }
}

/// The default resource, backed by the platform allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResource;

impl MemoryResource for SystemResource {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0);
        // SAFETY: the layout is non-zero-sized.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::for_layout(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded from the caller's contract.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
