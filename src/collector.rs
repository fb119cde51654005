//! The collector core: registry ownership, handle traffic, mark-and-sweep.

use std::alloc::Layout;
use std::panic;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::handle::detach_in_place;
use crate::metrics::CollectStats;
use crate::registry::Registry;
use crate::resource::MemoryResource;
use crate::storage::{HandleId, Storage};

/// Owns the registry and the memory resource. Root handles co-own the
/// collector (`Arc`), child handles merely observe it (`Weak`); its
/// lifetime is therefore the longer of the facade's and any root's.
pub(crate) struct Collector {
    registry: Mutex<Registry>,
    resource: Arc<dyn MemoryResource>,
    stats: Mutex<CollectStats>,
}

impl Collector {
    pub(crate) fn new(resource: Arc<dyn MemoryResource>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            resource,
            stats: Mutex::new(CollectStats::default()),
        })
    }

    pub(crate) fn resource(&self) -> &Arc<dyn MemoryResource> {
        &self.resource
    }

    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        f(&self.registry.lock())
    }

    /// Allocate raw bytes, running one best-effort collection and retrying
    /// once if the resource refuses.
    fn allocate_raw(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        match self.resource.allocate(layout) {
            Ok(ptr) => Ok(ptr),
            Err(_) => {
                self.collect();
                self.resource.allocate(layout)
            }
        }
    }

    /// Allocate a new storage and register the handle at `handle_addr`
    /// against it. Returns the allocation pointer and whether the handle
    /// was classified as a root.
    pub(crate) fn register_new(
        &self,
        id: HandleId,
        handle_addr: usize,
        layout: Layout,
    ) -> Result<(NonNull<u8>, bool), AllocError> {
        let ptr = self.allocate_raw(layout)?;
        let storage = Storage::new(ptr, layout);
        let mut reg = self.registry.lock();
        reg.insert_storage(storage);
        let is_root = reg.add_handle(id, handle_addr, ptr.as_ptr() as usize, false);
        Ok((ptr, is_root))
    }

    /// Register `dst` against the storage `src` refers to, classifying
    /// `dst_addr` by range search. `overwrite` distinguishes assignment
    /// from construction.
    pub(crate) fn copy_handle(
        &self,
        dst: HandleId,
        dst_addr: usize,
        src: HandleId,
        overwrite: bool,
    ) -> bool {
        let mut reg = self.registry.lock();
        let referent = reg
            .referent_of(src)
            .expect("source handle is not registered");
        reg.add_handle(dst, dst_addr, referent, overwrite)
    }

    pub(crate) fn remove_handle(&self, id: HandleId) {
        let removed = self.registry.lock().remove_handle(id);
        debug_assert!(removed, "handle was not registered");
    }

    pub(crate) fn set_destructor(
        &self,
        storage_key: usize,
        drop_fn: unsafe fn(*mut u8, usize),
        count: usize,
    ) {
        let mut reg = self.registry.lock();
        reg.storages
            .get_mut(&storage_key)
            .expect("storage is not registered")
            .set_destructor(drop_fn, count);
    }

    /// One mark-and-sweep pass.
    ///
    /// Unreachable storages are moved out of the registry and every child
    /// handle living inside them is emptied in place, all before the mutex
    /// is released; user destructors then run outside the lock, free to
    /// re-enter any collector operation. A destructor that reaches for a
    /// handle into a condemned peer observes an empty handle rather than
    /// freed memory.
    pub(crate) fn collect(&self) {
        let started = Instant::now();
        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!("gc_collect").entered();

        let (condemned, detach, storages_live, bytes_live) = {
            let mut reg = self.registry.lock();
            reg.unmark_all();
            reg.mark_from_roots();
            let (condemned, detach) = reg.take_unreachable();
            let bytes_live = reg.storages.values().map(Storage::bytes).sum::<usize>();
            (condemned, detach, reg.storages.len(), bytes_live)
        };

        for addr in detach {
            // SAFETY: `addr` was recorded when the handle was classified as
            // a child of a storage that is now condemned but not yet
            // released; the handle bytes are live and nothing else can
            // reach them.
            unsafe { detach_in_place(addr) };
        }

        let storages_reclaimed = condemned.len();
        let mut bytes_reclaimed = 0;
        let mut panic_slot = None;
        for storage in condemned {
            bytes_reclaimed += storage.bytes();
            storage.release(self.resource.as_ref(), &mut panic_slot);
        }

        *self.stats.lock() = CollectStats {
            duration: started.elapsed(),
            storages_reclaimed,
            bytes_reclaimed,
            storages_live,
            bytes_live,
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(
            storages_reclaimed,
            bytes_reclaimed,
            storages_live,
            "sweep complete"
        );

        if let Some(payload) = panic_slot {
            panic::resume_unwind(payload);
        }
    }

    pub(crate) fn last_collect_stats(&self) -> CollectStats {
        *self.stats.lock()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Every root co-owns the collector, so reaching this destructor
        // means the root set is empty; one pass sweeps everything that is
        // left. Child handles waking up inside user destructors fail to
        // upgrade their weak reference and no-op.
        debug_assert!(self.registry.lock().roots.is_empty());
        self.collect();
        #[cfg(debug_assertions)]
        {
            let reg = self.registry.lock();
            debug_assert!(reg.storages.is_empty());
            debug_assert!(reg.children.is_empty());
        }
    }
}
