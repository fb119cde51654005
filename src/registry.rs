//! The collector's three address-keyed containers.
//!
//! `storages` maps each allocation's base address to its [`Storage`];
//! `roots` and `children` partition the live handles by whether their own
//! addresses fall inside some allocation's byte range. All three are
//! mutated together under the collector's mutex.

use std::collections::{BTreeMap, HashMap};

use crate::storage::{HandleId, Storage};

/// Registry entry for a child handle.
pub(crate) struct ChildEntry {
    /// Key of the storage the handle *refers to*.
    pub(crate) referent: usize,
    /// Key of the storage whose byte range *contains* the handle. Not
    /// necessarily the same as `referent`.
    pub(crate) enclosing: usize,
    /// Handle address observed at classification time.
    pub(crate) addr: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) storages: BTreeMap<usize, Storage>,
    /// Root handles: handle id to referent storage key.
    pub(crate) roots: HashMap<HandleId, usize>,
    /// Child handles: handle id to referent plus enclosing storage.
    pub(crate) children: HashMap<HandleId, ChildEntry>,
}

// SAFETY: the registry owns raw addresses purely as bookkeeping keys; the
// bytes they denote are only touched by the collector, behind its mutex.
unsafe impl Send for Registry {}

impl Registry {
    /// The storage whose byte range contains `addr`, if any: a predecessor
    /// query for the greatest base address `<= addr`, then a bounds check
    /// against that storage's size.
    fn enclosing_storage(&self, addr: usize) -> Option<usize> {
        let (&key, storage) = self.storages.range(..=addr).next_back()?;
        (addr < key + storage.bytes()).then_some(key)
    }

    pub(crate) fn insert_storage(&mut self, storage: Storage) {
        let key = storage.key();
        debug_assert!(!self.storages.contains_key(&key));
        self.storages.insert(key, storage);
    }

    /// Classify the handle at `addr` and file `id` under `referent`.
    ///
    /// Returns `true` when the handle is a root. With `overwrite` set, an
    /// existing entry for `id` is replaced (assignment); otherwise `id`
    /// must be unregistered (construction).
    pub(crate) fn add_handle(
        &mut self,
        id: HandleId,
        addr: usize,
        referent: usize,
        overwrite: bool,
    ) -> bool {
        if overwrite {
            self.remove_handle(id);
        } else {
            debug_assert!(!self.roots.contains_key(&id) && !self.children.contains_key(&id));
        }
        match self.enclosing_storage(addr) {
            Some(enclosing) => {
                self.storages
                    .get_mut(&enclosing)
                    .expect("enclosing storage vanished")
                    .add_child(id);
                self.children.insert(
                    id,
                    ChildEntry {
                        referent,
                        enclosing,
                        addr,
                    },
                );
                false
            }
            None => {
                self.roots.insert(id, referent);
                true
            }
        }
    }

    /// The storage key a registered handle refers to.
    pub(crate) fn referent_of(&self, id: HandleId) -> Option<usize> {
        self.roots
            .get(&id)
            .copied()
            .or_else(|| self.children.get(&id).map(|entry| entry.referent))
    }

    /// Erase `id` from whichever set holds it, pruning the enclosing
    /// storage's child list for child handles. Returns whether an entry
    /// was found.
    pub(crate) fn remove_handle(&mut self, id: HandleId) -> bool {
        if self.roots.remove(&id).is_some() {
            return true;
        }
        if let Some(entry) = self.children.remove(&id) {
            if let Some(storage) = self.storages.get_mut(&entry.enclosing) {
                storage.remove_child(id);
            }
            return true;
        }
        false
    }

    pub(crate) fn unmark_all(&mut self) {
        for storage in self.storages.values_mut() {
            storage.unmark();
        }
    }

    /// Mark every storage reachable from the root set. Reachability walks
    /// each marked storage's child list through the `children` map to the
    /// storages those handles refer to; a storage marks at most once, so
    /// cycles terminate.
    pub(crate) fn mark_from_roots(&mut self) {
        let mut worklist: Vec<usize> = self.roots.values().copied().collect();
        while let Some(key) = worklist.pop() {
            let Some(storage) = self.storages.get_mut(&key) else {
                continue;
            };
            if storage.marked() {
                continue;
            }
            storage.mark();
            for child in storage.children() {
                if let Some(entry) = self.children.get(child) {
                    worklist.push(entry.referent);
                }
            }
        }
    }

    /// Move every unmarked storage out of the map. Child handles living
    /// inside condemned storages are unregistered here; their recorded
    /// addresses are returned so the collector can empty the handles in
    /// place before any destructor runs.
    pub(crate) fn take_unreachable(&mut self) -> (Vec<Storage>, Vec<usize>) {
        let dead: Vec<usize> = self
            .storages
            .iter()
            .filter(|(_, storage)| !storage.marked())
            .map(|(&key, _)| key)
            .collect();
        let mut condemned = Vec::with_capacity(dead.len());
        let mut detach = Vec::new();
        for key in dead {
            let storage = self
                .storages
                .remove(&key)
                .expect("condemned storage vanished");
            for &child in storage.children() {
                if let Some(entry) = self.children.remove(&child) {
                    debug_assert_eq!(entry.enclosing, key);
                    detach.push(entry.addr);
                }
            }
            condemned.push(storage);
        }
        (condemned, detach)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;
    use std::ptr::NonNull;

    fn fake_storage(addr: usize, bytes: usize) -> Storage {
        Storage::new(
            NonNull::new(addr as *mut u8).unwrap(),
            Layout::from_size_align(bytes, 8).unwrap(),
        )
    }

    fn registry_with(ranges: &[(usize, usize)]) -> Registry {
        let mut reg = Registry::default();
        for &(addr, bytes) in ranges {
            reg.insert_storage(fake_storage(addr, bytes));
        }
        reg
    }

    #[test]
    fn predecessor_query_respects_range_bounds() {
        let reg = registry_with(&[(0x1000, 0x40), (0x2000, 0x20)]);
        assert_eq!(reg.enclosing_storage(0x0fff), None);
        assert_eq!(reg.enclosing_storage(0x1000), Some(0x1000));
        assert_eq!(reg.enclosing_storage(0x103f), Some(0x1000));
        assert_eq!(reg.enclosing_storage(0x1040), None);
        assert_eq!(reg.enclosing_storage(0x2010), Some(0x2000));
        assert_eq!(reg.enclosing_storage(0x2020), None);
    }

    #[test]
    fn handles_partition_into_roots_and_children() {
        let mut reg = registry_with(&[(0x1000, 0x40), (0x2000, 0x20)]);

        let root = HandleId::next();
        assert!(reg.add_handle(root, 0x500, 0x1000, false));
        assert_eq!(reg.roots[&root], 0x1000);

        let child = HandleId::next();
        assert!(!reg.add_handle(child, 0x1010, 0x2000, false));
        let entry = &reg.children[&child];
        assert_eq!(entry.enclosing, 0x1000);
        assert_eq!(entry.referent, 0x2000);
        assert!(reg.storages[&0x1000].children().contains(&child));
    }

    #[test]
    fn remove_prunes_the_enclosing_child_list() {
        let mut reg = registry_with(&[(0x1000, 0x40)]);
        let child = HandleId::next();
        reg.add_handle(child, 0x1008, 0x1000, false);
        assert!(reg.remove_handle(child));
        assert!(reg.children.is_empty());
        assert!(reg.storages[&0x1000].children().is_empty());
        assert!(!reg.remove_handle(child));
    }

    #[test]
    fn overwrite_reclassifies_in_place() {
        let mut reg = registry_with(&[(0x1000, 0x40), (0x2000, 0x20)]);
        let id = HandleId::next();
        assert!(!reg.add_handle(id, 0x1008, 0x1000, false));
        // Same slot, new referent.
        assert!(!reg.add_handle(id, 0x1008, 0x2000, true));
        assert_eq!(reg.children[&id].referent, 0x2000);
        assert_eq!(reg.storages[&0x1000].children(), &[id]);
    }

    #[test]
    fn mark_traverses_cycles_and_sweep_detaches_interior_handles() {
        // Two allocations referring to each other through interior handles,
        // with one external root into the first.
        let mut reg = registry_with(&[(0x1000, 0x40), (0x2000, 0x40)]);
        let root = HandleId::next();
        reg.add_handle(root, 0x10, 0x1000, false);
        let a_to_b = HandleId::next();
        reg.add_handle(a_to_b, 0x1008, 0x2000, false);
        let b_to_a = HandleId::next();
        reg.add_handle(b_to_a, 0x2008, 0x1000, false);

        reg.unmark_all();
        reg.mark_from_roots();
        let (condemned, detach) = reg.take_unreachable();
        assert!(condemned.is_empty());
        assert!(detach.is_empty());

        reg.remove_handle(root);
        reg.unmark_all();
        reg.mark_from_roots();
        let (condemned, detach) = reg.take_unreachable();
        assert_eq!(condemned.len(), 2);
        assert_eq!(detach.len(), 2);
        assert!(reg.storages.is_empty());
        assert!(reg.children.is_empty());
    }
}
