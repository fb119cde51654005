//! The type-erased base shared by every garbage-collected handle.
//!
//! A handle's registry entry is keyed by a [`HandleId`] rather than the
//! handle's address, because handle values move bitwise. The address is
//! still what classification runs on: every operation that can observe
//! where a handle lives (`init_new`, `init_copy`, `assign`) hands its
//! `&self` address to the collector, which range-searches the live
//! allocations to decide root versus child. An address the collector never
//! observes leaves the handle a root, which can at worst delay reclamation,
//! never free a live object.

use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};

use crate::collector::Collector;
use crate::error::AllocError;
use crate::storage::HandleId;

/// How a handle refers to its collector.
///
/// Roots co-own the collector: as long as any root exists, teardown cannot
/// begin. Children only observe it: a handle inside an allocation must not
/// keep the collector alive from within, or the two could never be freed.
pub(crate) enum CollectorRef {
    None,
    Strong(Arc<Collector>),
    Weak(Weak<Collector>),
}

impl CollectorRef {
    fn for_classification(collector: Arc<Collector>, is_root: bool) -> Self {
        if is_root {
            Self::Strong(collector)
        } else {
            Self::Weak(Arc::downgrade(&collector))
        }
    }
}

pub(crate) struct HandleState {
    referent: Option<NonNull<u8>>,
    id: HandleId,
    collector: CollectorRef,
    /// Outstanding borrow guards handed out through this handle. A handle
    /// with live guards refuses `set`/`reset`, so a borrowed referent can
    /// never lose its registration.
    borrows: Cell<usize>,
}

impl HandleState {
    const fn empty() -> Self {
        Self {
            referent: None,
            id: HandleId::UNREGISTERED,
            collector: CollectorRef::None,
            borrows: Cell::new(0),
        }
    }

    fn registered(referent: NonNull<u8>, id: HandleId, collector: CollectorRef) -> Self {
        Self {
            referent: Some(referent),
            id,
            collector,
            borrows: Cell::new(0),
        }
    }
}

/// The state cell embedded in [`Gc`](crate::Gc) and
/// [`GcArray`](crate::GcArray). Interior-mutable so that in-place
/// assignment works through `&self`: shared references are all that
/// dereferencing an allocated object can ever yield, and `&self` is exactly
/// the address classification needs.
#[repr(transparent)]
pub(crate) struct RawGc {
    state: UnsafeCell<HandleState>,
}

impl RawGc {
    pub(crate) const fn empty() -> Self {
        Self {
            state: UnsafeCell::new(HandleState::empty()),
        }
    }

    /// The address classification runs on.
    fn addr(&self) -> usize {
        self.state.get() as usize
    }

    pub(crate) fn referent(&self) -> Option<NonNull<u8>> {
        // SAFETY: handles are neither `Send` nor `Sync`, so `&self` proves
        // no concurrent writer; the borrow does not outlive the statement.
        unsafe { (*self.state.get()).referent }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.referent().is_none()
    }

    pub(crate) fn id(&self) -> HandleId {
        // SAFETY: as in `referent`.
        unsafe { (*self.state.get()).id }
    }

    pub(crate) fn holds_strong(&self) -> bool {
        // SAFETY: as in `referent`.
        unsafe { matches!((*self.state.get()).collector, CollectorRef::Strong(_)) }
    }

    pub(crate) fn borrow_count(&self) -> usize {
        // SAFETY: as in `referent`.
        unsafe { (*self.state.get()).borrows.get() }
    }

    /// Record one more outstanding borrow and hand back the counter for the
    /// guard to decrement on drop. The returned reference stays valid for
    /// the guard's lifetime: the guard borrows the handle, and a borrowed
    /// handle can be neither moved nor reassigned.
    pub(crate) fn begin_borrow(&self) -> &Cell<usize> {
        // SAFETY: as in `referent`; the state is only replaced wholesale
        // when the count is zero, which the count being incremented here
        // precludes for as long as the guard lives.
        let borrows = unsafe { &(*self.state.get()).borrows };
        borrows.set(
            borrows
                .get()
                .checked_add(1)
                .expect("borrow counter overflow"),
        );
        borrows
    }

    fn assert_unborrowed(&self) {
        assert_eq!(
            self.borrow_count(),
            0,
            "handle reassigned while borrowed"
        );
    }

    /// The collector this handle is registered with, if it is still alive.
    pub(crate) fn current_collector(&self) -> Option<Arc<Collector>> {
        // SAFETY: as in `referent`; the clone happens before the borrow ends.
        match unsafe { &(*self.state.get()).collector } {
            CollectorRef::None => None,
            CollectorRef::Strong(collector) => Some(Arc::clone(collector)),
            CollectorRef::Weak(weak) => weak.upgrade(),
        }
    }

    fn install(&self, state: HandleState) {
        // SAFETY: exclusive access as in `referent`; the previous state is
        // dropped by the assignment (an `Arc`/`Weak` refcount decrement at
        // most).
        unsafe { *self.state.get() = state };
    }

    /// Allocate a new storage through `collector` and register this handle
    /// (which must be empty) against it.
    pub(crate) fn init_new(
        &self,
        collector: &Arc<Collector>,
        layout: Layout,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(self.is_empty());
        let id = HandleId::next();
        let (ptr, is_root) = collector.register_new(id, self.addr(), layout)?;
        self.install(HandleState::registered(
            ptr,
            id,
            CollectorRef::for_classification(Arc::clone(collector), is_root),
        ));
        Ok(ptr)
    }

    /// Copy-construct this handle (which must be empty) from `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src` belongs to a collector that is being torn down.
    pub(crate) fn init_copy(&self, src: &Self) {
        debug_assert!(self.is_empty());
        let Some(referent) = src.referent() else {
            return;
        };
        let collector = src
            .current_collector()
            .expect("collector is being torn down");
        let id = HandleId::next();
        let is_root = collector.copy_handle(id, self.addr(), src.id(), false);
        self.install(HandleState::registered(
            referent,
            id,
            CollectorRef::for_classification(collector, is_root),
        ));
    }

    /// In-place assignment from `src`, reclassifying this handle at its
    /// current address. Assignment from an empty handle resets; assignment
    /// from a handle of a different collector unregisters from the old
    /// collector first.
    pub(crate) fn assign(&self, src: &Self) {
        if ptr::eq(self, src) {
            return;
        }
        self.assert_unborrowed();
        let Some(referent) = src.referent() else {
            self.reset();
            return;
        };
        let src_collector = src
            .current_collector()
            .expect("collector is being torn down");
        let src_id = src.id();

        // SAFETY: exclusive access as in `referent`.
        let old = unsafe { ptr::replace(self.state.get(), HandleState::empty()) };
        let mut reuse = None;
        let mut foreign = None;
        if old.referent.is_some() {
            match old.collector {
                CollectorRef::Strong(collector) => {
                    if Arc::ptr_eq(&collector, &src_collector) {
                        reuse = Some(old.id);
                    } else {
                        foreign = Some((collector, old.id));
                    }
                }
                CollectorRef::Weak(weak) => {
                    if let Some(collector) = weak.upgrade() {
                        if Arc::ptr_eq(&collector, &src_collector) {
                            reuse = Some(old.id);
                        } else {
                            foreign = Some((collector, old.id));
                        }
                    }
                }
                CollectorRef::None => {}
            }
        }
        if let Some((collector, id)) = foreign {
            collector.remove_handle(id);
        }

        let (id, overwrite) = match reuse {
            Some(id) => (id, true),
            None => (HandleId::next(), false),
        };
        let is_root = src_collector.copy_handle(id, self.addr(), src_id, overwrite);
        self.install(HandleState::registered(
            referent,
            id,
            CollectorRef::for_classification(src_collector, is_root),
        ));
    }

    /// Unregister and return to the empty state.
    pub(crate) fn reset(&self) {
        self.assert_unborrowed();
        // SAFETY: exclusive access as in `referent`.
        let old = unsafe { ptr::replace(self.state.get(), HandleState::empty()) };
        unregister(old);
    }
}

impl Drop for RawGc {
    fn drop(&mut self) {
        let old = std::mem::replace(self.state.get_mut(), HandleState::empty());
        debug_assert_eq!(old.borrows.get(), 0);
        unregister(old);
    }
}

fn unregister(state: HandleState) {
    if state.referent.is_none() {
        return;
    }
    match state.collector {
        CollectorRef::None => {}
        CollectorRef::Strong(collector) => collector.remove_handle(state.id),
        CollectorRef::Weak(weak) => {
            // During collector teardown the upgrade fails: the handle lives
            // inside an allocation that is being swept and its entry is
            // already gone, so there is nothing to do.
            if let Some(collector) = weak.upgrade() {
                collector.remove_handle(state.id);
            }
        }
    }
}

/// Overwrite the handle state at `addr` with the empty state, releasing the
/// old state's collector reference without touching the registry.
///
/// # Safety
///
/// `addr` must be the recorded address of a registered child handle inside
/// an allocation that is condemned but not yet released, with no live
/// references to the handle.
pub(crate) unsafe fn detach_in_place(addr: usize) {
    let state = addr as *mut HandleState;
    // SAFETY: `RawGc` is `repr(transparent)` over `UnsafeCell<HandleState>`,
    // so the recorded handle address is the state's address; the caller
    // guarantees the bytes are live and unaliased.
    let old = unsafe { ptr::replace(state, HandleState::empty()) };
    drop(old);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_raw_handle_is_inert() {
        let raw = RawGc::empty();
        assert!(raw.is_empty());
        assert_eq!(raw.id(), HandleId::UNREGISTERED);
        assert!(raw.current_collector().is_none());
        assert!(!raw.holds_strong());
        raw.reset(); // resetting an empty handle is a no-op
        assert!(raw.is_empty());
    }

    #[test]
    fn copy_of_an_empty_handle_stays_empty() {
        let src = RawGc::empty();
        let dst = RawGc::empty();
        dst.init_copy(&src);
        assert!(dst.is_empty());
    }

    #[test]
    fn assign_from_empty_resets() {
        let src = RawGc::empty();
        let dst = RawGc::empty();
        dst.assign(&src);
        assert!(dst.is_empty());
        dst.assign(&dst); // self-assignment is a no-op
        assert!(dst.is_empty());
    }
}
