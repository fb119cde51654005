//! The user-facing facade.

use std::alloc::{handle_alloc_error, Layout};
use std::mem;
use std::sync::Arc;

use crate::collector::Collector;
use crate::error::AllocError;
use crate::metrics::CollectStats;
use crate::ptr::{Gc, GcArray};
use crate::resource::{MemoryResource, SystemResource};

/// A garbage-collected heap.
///
/// The heap constructs objects and arrays behind [`Gc`]/[`GcArray`]
/// handles and runs collection passes. Dropping the heap does not
/// invalidate outstanding root handles: the collector lives as long as the
/// facade *or* any root, and tears itself down (sweeping whatever is left)
/// when the last of those goes away.
pub struct Heap {
    collector: Arc<Collector>,
}

impl Heap {
    /// A heap backed by the platform allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_resource(Arc::new(SystemResource))
    }

    /// A heap backed by `resource`.
    #[must_use]
    pub fn with_resource(resource: Arc<dyn MemoryResource>) -> Self {
        Self {
            collector: Collector::new(resource),
        }
    }

    /// Allocate and construct a new object.
    ///
    /// On allocation failure the collector runs one collection pass and
    /// retries; a second failure aborts via
    /// [`handle_alloc_error`]. Use [`try_new_object`](Self::try_new_object)
    /// to handle failure instead.
    pub fn new_object<T: 'static>(&self, value: T) -> Gc<T> {
        match self.try_new_object(value) {
            Ok(gc) => gc,
            Err(_) => handle_alloc_error(object_layout::<T>()),
        }
    }

    /// Allocate and construct a new object, surfacing allocation failure.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when the memory resource refuses the request
    /// twice (once before and once after a collection pass).
    pub fn try_new_object<T: 'static>(&self, value: T) -> Result<Gc<T>, AllocError> {
        let gc = Gc::empty();
        let ptr = gc.raw().init_new(&self.collector, object_layout::<T>())?;
        // SAFETY: `ptr` is a fresh, properly aligned allocation for a `T`.
        unsafe { ptr.cast::<T>().as_ptr().write(value) };
        if mem::needs_drop::<T>() {
            self.collector
                .set_destructor(ptr.as_ptr() as usize, drop_single::<T>, 0);
        }
        Ok(gc)
    }

    /// Allocate an array of `len` default-initialized elements.
    ///
    /// See [`new_object`](Self::new_object) for the allocation-failure
    /// policy.
    ///
    /// # Panics
    ///
    /// Panics if the total array size overflows. Use
    /// [`try_new_array`](Self::try_new_array) to handle either failure as
    /// an [`AllocError`].
    pub fn new_array<T: Default + 'static>(&self, len: usize) -> GcArray<T> {
        let Ok(layout) = array_layout::<T>(len) else {
            panic!(
                "array layout overflow: {len} elements of {} bytes",
                mem::size_of::<T>()
            );
        };
        match self.try_new_array(len) {
            Ok(arr) => arr,
            Err(_) => handle_alloc_error(layout),
        }
    }

    /// Allocate an array of `len` default-initialized elements, surfacing
    /// allocation failure.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when the layout overflows or the memory
    /// resource refuses the request twice.
    pub fn try_new_array<T: Default + 'static>(&self, len: usize) -> Result<GcArray<T>, AllocError> {
        let layout = array_layout::<T>(len)?;
        let arr = GcArray::empty();
        let ptr = arr.raw().init_new(&self.collector, layout)?;
        let base = ptr.cast::<T>().as_ptr();

        // If an element's `Default` panics, the built prefix is dropped and
        // the unwinding drop of `arr` unregisters the handle; the
        // destructor-less bytes go back to the resource on the next sweep.
        let mut guard = InitGuard { base, built: 0 };
        for i in 0..len {
            // SAFETY: `base` has room for `len` elements; slot `i` is
            // uninitialized.
            unsafe { base.add(i).write(T::default()) };
            guard.built += 1;
        }
        mem::forget(guard);

        if mem::needs_drop::<T>() && len > 0 {
            self.collector
                .set_destructor(ptr.as_ptr() as usize, drop_array::<T>, len);
        }
        arr.set_len(len);
        Ok(arr)
    }

    /// Run one mark-and-sweep pass, reclaiming every allocation no root
    /// handle can reach.
    pub fn collect(&self) {
        self.collector.collect();
    }

    /// Statistics from the most recent collection pass.
    #[must_use]
    pub fn last_collect_stats(&self) -> CollectStats {
        self.collector.last_collect_stats()
    }

    /// The memory resource backing this heap.
    #[must_use]
    pub fn resource(&self) -> &Arc<dyn MemoryResource> {
        self.collector.resource()
    }

    pub(crate) fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap").finish_non_exhaustive()
    }
}

fn object_layout<T>() -> Layout {
    pad_layout(Layout::new::<T>())
}

fn array_layout<T>(len: usize) -> Result<Layout, AllocError> {
    Layout::array::<T>(len)
        .map(pad_layout)
        .map_err(|_| AllocError {
            bytes: len.saturating_mul(mem::size_of::<T>()),
            align: mem::align_of::<T>(),
        })
}

/// Zero-sized requests are rounded up to one byte so every allocation has a
/// distinct address to key the registry with.
fn pad_layout(layout: Layout) -> Layout {
    if layout.size() == 0 {
        Layout::from_size_align(1, layout.align()).expect("one-byte layout")
    } else {
        layout
    }
}

unsafe fn drop_single<T>(ptr: *mut u8, _count: usize) {
    // SAFETY: `ptr` holds one fully constructed `T`.
    unsafe { ptr.cast::<T>().drop_in_place() };
}

/// Elements are destroyed in reverse construction order.
unsafe fn drop_array<T>(ptr: *mut u8, count: usize) {
    let base = ptr.cast::<T>();
    for i in (0..count).rev() {
        // SAFETY: `ptr` holds `count` fully constructed elements.
        unsafe { base.add(i).drop_in_place() };
    }
}

struct InitGuard<T> {
    base: *mut T,
    built: usize,
}

impl<T> Drop for InitGuard<T> {
    fn drop(&mut self) {
        for i in (0..self.built).rev() {
            // SAFETY: exactly `built` elements were constructed.
            unsafe { self.base.add(i).drop_in_place() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn zero_sized_objects_get_distinct_allocations() {
        let heap = Heap::new();
        let a = heap.new_object(());
        let b = heap.new_object(());
        assert!(!Gc::ptr_eq(&a, &b));
        assert_eq!(test_util::live_allocations(&heap), 2);
    }

    #[test]
    fn zero_length_arrays_are_allocated() {
        let heap = Heap::new();
        let arr = heap.new_array::<u64>(0);
        assert_eq!(arr.len(), 0);
        assert_eq!(test_util::live_allocations(&heap), 1);
    }

    #[test]
    fn layout_padding_only_touches_zero_sized_requests() {
        assert_eq!(object_layout::<u64>(), Layout::new::<u64>());
        let zst = object_layout::<()>();
        assert_eq!(zst.size(), 1);
        let arr = array_layout::<u32>(4).unwrap();
        assert_eq!(arr.size(), 16);
    }
}
