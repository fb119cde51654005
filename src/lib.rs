//! An embeddable mark-and-sweep garbage collector for cyclic object graphs.
//!
//! `tacit-gc` provides a [`Heap`] that allocates objects behind [`Gc<T>`]
//! smart handles. Handles can be copied freely and may form arbitrary
//! cycles; unreachable graphs are reclaimed by [`Heap::collect`] or when the
//! collector is torn down. No `unsafe` trace implementations, derive macros,
//! or explicit root registration are required: the collector classifies
//! every handle as a *root* or a *child* purely from the handle's own
//! address relative to the live allocations.
//!
//! # How classification works
//!
//! A handle whose address lies outside every managed allocation (a local
//! variable, a field of an ordinary struct, an element of a `Vec`) is a
//! **root** and keeps its referent alive. A handle embedded in a managed
//! allocation, written through [`Gc::set`] on a field of an allocated
//! object, is a **child**: it is traced through its enclosing allocation
//! and keeps nothing alive on its own. Dropping the last root that reaches
//! a cycle makes the whole cycle collectable.
//!
//! # Quick start
//!
//! ```
//! use tacit_gc::{Gc, Heap};
//!
//! struct Node {
//!     value: i32,
//!     next: Gc<Node>,
//! }
//!
//! let heap = Heap::new();
//! let a = heap.new_object(Node { value: 1, next: Gc::empty() });
//! let b = heap.new_object(Node { value: 2, next: Gc::empty() });
//!
//! // Link the nodes into a cycle. `set` is the in-place assignment that
//! // lets the collector observe where each handle lives.
//! a.borrow().next.set(&b);
//! b.borrow().next.set(&a);
//! assert_eq!(a.borrow().next.borrow().value, 2);
//!
//! drop(a);
//! drop(b);
//! heap.collect(); // the cycle is unreachable and is reclaimed
//! ```
//!
//! # Memory resources
//!
//! All object bytes come from a [`MemoryResource`] supplied at heap
//! construction; the default [`SystemResource`] uses the platform
//! allocator. When an allocation fails, the collector runs one collection
//! pass and retries before reporting [`AllocError`].
//!
//! # Thread safety
//!
//! The collector's metadata is guarded by a single mutex, so a [`Heap`] may
//! be shared across threads. Handles themselves are `!Send` and `!Sync`;
//! borrowing a referent never takes the collector lock, and synchronizing
//! access to user data is the caller's responsibility.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod collector;
mod error;
mod handle;
mod heap;
mod metrics;
mod ptr;
mod registry;
mod resource;
mod storage;

pub use error::AllocError;
pub use heap::Heap;
pub use metrics::CollectStats;
pub use ptr::{Gc, GcArray, GcRef, Upcast};
pub use resource::{MemoryResource, SystemResource};

#[doc(hidden)]
pub mod test_util {
    //! Registry introspection for the test suite. Not part of the public API.

    use crate::ptr::Gc;
    use crate::Heap;

    /// Number of live allocations tracked by `heap`.
    #[must_use]
    pub fn live_allocations(heap: &Heap) -> usize {
        heap.collector().with_registry(|reg| reg.storages.len())
    }

    /// Total bytes currently held by live allocations.
    #[must_use]
    pub fn live_bytes(heap: &Heap) -> usize {
        heap.collector()
            .with_registry(|reg| reg.storages.values().map(crate::storage::Storage::bytes).sum())
    }

    /// Number of registered `(root, child)` handles.
    #[must_use]
    pub fn registered_handles(heap: &Heap) -> (usize, usize) {
        heap.collector()
            .with_registry(|reg| (reg.roots.len(), reg.children.len()))
    }

    /// Whether `gc` is currently classified as a root handle.
    #[must_use]
    pub fn is_root<T>(gc: &Gc<T>) -> bool {
        let id = gc.raw().id();
        gc.raw()
            .current_collector()
            .is_some_and(|c| c.with_registry(|reg| reg.roots.contains_key(&id)))
    }

    /// Whether `gc` is currently classified as a child handle.
    #[must_use]
    pub fn is_child<T>(gc: &Gc<T>) -> bool {
        let id = gc.raw().id();
        gc.raw()
            .current_collector()
            .is_some_and(|c| c.with_registry(|reg| reg.children.contains_key(&id)))
    }

    /// Whether `gc` holds its collector through a strong reference.
    #[must_use]
    pub fn holds_collector_strongly<T>(gc: &Gc<T>) -> bool {
        gc.raw().holds_strong()
    }

    /// Assert the registry's structural invariants: the root/child sets
    /// partition the live handles, every child address lies inside its
    /// enclosing allocation, child lists mirror the child set, and every
    /// referent is a live allocation.
    pub fn check_invariants(heap: &Heap) {
        heap.collector().with_registry(|reg| {
            for id in reg.roots.keys() {
                assert!(
                    !reg.children.contains_key(id),
                    "handle registered as both root and child"
                );
            }
            for key in reg.roots.values() {
                assert!(
                    reg.storages.contains_key(key),
                    "root handle refers to a missing allocation"
                );
            }
            for (id, entry) in &reg.children {
                let enclosing = reg
                    .storages
                    .get(&entry.enclosing)
                    .expect("child entry without an enclosing allocation");
                assert!(
                    entry.addr >= entry.enclosing
                        && entry.addr < entry.enclosing + enclosing.bytes(),
                    "child handle address outside its enclosing allocation"
                );
                assert!(
                    enclosing.children().contains(id),
                    "child entry missing from the enclosing child list"
                );
                assert!(
                    reg.storages.contains_key(&entry.referent),
                    "child handle refers to a missing allocation"
                );
            }
        });
    }
}
