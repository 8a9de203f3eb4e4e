//! Mounting
//!
//! A cell is *mounted* while something observes it: a listener, or a
//! mounted dependent. Mounted cells are kept current by the store; an
//! unmounted cell is revalidated lazily when read.
//!
//! Mounting a cell mounts its dependencies first, so the mounted set is
//! always closed under "depends on". When the last listener and the last
//! mounted dependent go away the cell unmounts, and the release cascades
//! to dependencies nothing else holds.
//!
//! Writable cells may carry an on-mount hook. Hooks run after the whole
//! mount walk has finished, in the order the cells were mounted, and the
//! cleanup they return runs when the cell unmounts.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::graph::node::{CellState, Dependencies};
use crate::graph::CellId;

use super::batch::FrameScope;
use super::cell::{CellRef, OnUnmount};
use super::store::StoreCore;
use super::subscriber::{Listener, ListenerId};
use super::tracked::Supersede;

/// Mount record for one cell.
pub(crate) struct Mounted {
    pub(crate) cell: CellRef,
    pub(crate) listeners: IndexMap<ListenerId, Listener, FxBuildHasher>,
    pub(crate) dependents: IndexSet<CellId, FxBuildHasher>,
    pub(crate) on_unmount: Option<OnUnmount>,
}

impl Mounted {
    fn new(cell: CellRef) -> Self {
        Self {
            cell,
            listeners: IndexMap::default(),
            dependents: IndexSet::default(),
            on_unmount: None,
        }
    }

    /// A cell that only depends on itself does not hold itself mounted.
    fn can_unmount(&self) -> bool {
        let id = self.cell.id();
        self.listeners.is_empty()
            && self.dependents.iter().all(|dependent| *dependent == id)
    }
}

impl StoreCore {
    /// Mount `cell`, recording `dependent` as a reason to keep it mounted,
    /// then run the on-mount hooks of every cell that became mounted.
    pub(crate) fn mount_cell(self: &Arc<Self>, cell: &CellRef, dependent: Option<CellId>) {
        let mut hooks = Vec::new();
        self.mount_with(cell, dependent, &mut hooks);
        for cell in hooks {
            self.run_on_mount(&cell);
        }
    }

    fn mount_with(
        self: &Arc<Self>,
        cell: &CellRef,
        dependent: Option<CellId>,
        hooks: &mut Vec<CellRef>,
    ) {
        let id = cell.id();
        {
            let mut inner = self.inner.lock();
            if let Some(mounted) = inner.mounted.get_mut(&id) {
                mounted.dependents.extend(dependent);
                return;
            }
        }

        if let Some(state) = self.state_of(id) {
            for (dep_id, entry) in state.dependencies.iter() {
                if *dep_id != id {
                    self.mount_with(&entry.cell, Some(id), hooks);
                }
            }
        }
        self.read_cell_state(cell, false);

        let newly_mounted = {
            let mut inner = self.inner.lock();
            let mut newly_mounted = false;
            let mounted = inner.mounted.entry(id).or_insert_with(|| {
                newly_mounted = true;
                Mounted::new(cell.clone())
            });
            mounted.dependents.extend(dependent);
            newly_mounted
        };
        if !newly_mounted {
            return;
        }

        tracing::debug!(store = %self, action = "mount", cell = %cell);
        if cell.logic().is_writable() && cell.on_mount().is_some() {
            hooks.push(cell.clone());
        }
    }

    fn run_on_mount(self: &Arc<Self>, cell: &CellRef) {
        let Some(hook) = cell.on_mount() else {
            return;
        };
        let Some(cleanup) = hook(&self.weak(), cell) else {
            return;
        };

        let stale = {
            let mut inner = self.inner.lock();
            match inner.mounted.get_mut(&cell.id()) {
                Some(mounted) => {
                    mounted.on_unmount = Some(cleanup);
                    None
                }
                None => Some(cleanup),
            }
        };
        // Unmounted again before the hook returned.
        if let Some(cleanup) = stale {
            cleanup();
        }
    }

    /// Bring the mount graph in line with a mounted cell's new dependencies.
    pub(crate) fn mount_dependencies(
        self: &Arc<Self>,
        cell: &CellRef,
        state: &CellState,
        prev: Option<&Arc<Dependencies>>,
    ) {
        let id = cell.id();
        let mut dropped = SmallVec::<[CellId; 4]>::new();
        if let Some(prev) = prev {
            let mut inner = self.inner.lock();
            for dep_id in prev.keys() {
                if *dep_id == id || state.dependencies.contains_key(dep_id) {
                    continue;
                }
                dropped.push(*dep_id);
                if let Some(mounted) = inner.mounted.get_mut(dep_id) {
                    mounted.dependents.shift_remove(&id);
                }
            }
        }

        let mut added = 0usize;
        for (dep_id, entry) in state.dependencies.iter() {
            if *dep_id == id || prev.is_some_and(|prev| prev.contains_key(dep_id)) {
                continue;
            }
            self.mount_cell(&entry.cell, Some(id));
            added += 1;
        }

        for dep_id in &dropped {
            self.try_unmount(*dep_id);
        }
        if added > 0 || !dropped.is_empty() {
            tracing::debug!(
                store = %self,
                action = "dep",
                cell = %cell,
                added,
                dropped = dropped.len()
            );
        }
    }

    /// Unmount `id` if nothing holds it any more, then release its
    /// dependencies in turn.
    pub(crate) fn try_unmount(self: &Arc<Self>, id: CellId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let on_unmount = {
                let mut inner = self.inner.lock();
                match inner.mounted.get_mut(&id) {
                    Some(mounted) if mounted.can_unmount() => mounted.on_unmount.take(),
                    _ => continue,
                }
            };
            if let Some(cleanup) = on_unmount {
                cleanup();
            }

            let (removed, state) = {
                let mut inner = self.inner.lock();
                let removed = inner.mounted.shift_remove(&id);
                (removed, inner.states.get(&id).cloned())
            };
            let Some(removed) = removed else {
                continue;
            };
            tracing::trace!(store = %self, cell = %removed.cell, "unmounted");

            let Some(state) = state else {
                tracing::warn!(store = %self, cell = %removed.cell, "unmounted cell has no state");
                continue;
            };
            if let Some(pending) = state.pending() {
                pending.supersede(Supersede::Detach);
            }

            let released: SmallVec<[CellId; 4]> = {
                let mut inner = self.inner.lock();
                state
                    .dependencies
                    .keys()
                    .filter(|dep_id| **dep_id != id)
                    .filter_map(|dep_id| {
                        let mounted = inner.mounted.get_mut(dep_id)?;
                        mounted.dependents.shift_remove(&id);
                        Some(*dep_id)
                    })
                    .collect()
            };
            work.extend(released.into_iter().rev());
        }
    }

    /// Mount `cell` for a new listener and attach it.
    pub(crate) fn subscribe(self: &Arc<Self>, cell: &CellRef, listener: Listener) {
        let _gate = self.gate.lock();
        let (_, flushed) = self.in_frame(Some(cell.id()), FrameScope::Always, || {
            self.mount_cell(cell, None);
        });

        // A listener of the flush may have released the cell already.
        if !self.is_mounted(cell.id()) {
            self.mount_cell(cell, None);
        }
        let id = listener.id();
        if let Some(mounted) = self.inner.lock().mounted.get_mut(&cell.id()) {
            mounted.listeners.insert(id, listener);
        }
        tracing::debug!(store = %self, action = "sub", cell = %cell, listener = ?id, flushed = ?flushed);
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>, cell: &CellRef, listener: ListenerId) {
        let _gate = self.gate.lock();
        let removed = self
            .inner
            .lock()
            .mounted
            .get_mut(&cell.id())
            .and_then(|mounted| mounted.listeners.shift_remove(&listener));
        drop(removed);

        self.try_unmount(cell.id());
        tracing::debug!(store = %self, action = "unsub", cell = %cell, listener = ?listener);
    }

    pub(crate) fn has_listener(&self, cell: CellId, listener: ListenerId) -> bool {
        self.inner
            .lock()
            .mounted
            .get(&cell)
            .is_some_and(|mounted| mounted.listeners.contains_key(&listener))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::reactive::{Cell, Store};

    #[test]
    fn mounting_a_derived_cell_mounts_its_dependencies() {
        let store = Store::new();
        let base = Cell::state(1);
        let derived = {
            let base = base.clone();
            Cell::derived(move |get| Ok(get.get(&base)? + 1))
        };

        let subscription = store.subscribe(&derived, || {});
        assert!(store.is_mounted(&derived));
        assert!(store.is_mounted(&base));

        subscription.unsubscribe();
        assert!(!store.is_mounted(&derived));
        assert!(!store.is_mounted(&base));
    }

    #[test]
    fn shared_dependency_stays_mounted_until_released() {
        let store = Store::new();
        let base = Cell::state(1);
        let left = {
            let base = base.clone();
            Cell::derived(move |get| get.get(&base))
        };
        let right = {
            let base = base.clone();
            Cell::derived(move |get| get.get(&base))
        };

        let left_sub = store.subscribe(&left, || {});
        let right_sub = store.subscribe(&right, || {});
        left_sub.unsubscribe();
        assert!(store.is_mounted(&base));
        right_sub.unsubscribe();
        assert!(!store.is_mounted(&base));
    }

    #[test]
    fn on_mount_runs_once_and_cleans_up() {
        let store = Store::new();
        let mounts = Arc::new(AtomicUsize::new(0));
        let unmounts = Arc::new(AtomicUsize::new(0));
        let (m, u) = (mounts.clone(), unmounts.clone());
        let count = Cell::state(0).on_mount(move |set| {
            m.fetch_add(1, Ordering::SeqCst);
            set.call(1).ok();
            let u = u.clone();
            Some(Box::new(move || {
                u.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>)
        });

        let first = store.subscribe(&count, || {});
        let second = store.subscribe(&count, || {});
        assert_eq!(mounts.load(Ordering::SeqCst), 1);
        assert_eq!(store.read(&count).unwrap(), 1);

        drop(first);
        assert_eq!(unmounts.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn switching_dependencies_remounts() {
        let store = Store::new();
        let flag = Cell::state(true);
        let a = Cell::state(1);
        let b = Cell::state(2);
        let pick = {
            let (flag, a, b) = (flag.clone(), a.clone(), b.clone());
            Cell::derived(move |get| {
                if get.get(&flag)? {
                    get.get(&a)
                } else {
                    get.get(&b)
                }
            })
        };

        let _subscription = store.subscribe(&pick, || {});
        assert!(store.is_mounted(&a));
        assert!(!store.is_mounted(&b));

        store.write(&flag, false).unwrap();
        assert!(!store.is_mounted(&a));
        assert!(store.is_mounted(&b));
        assert_eq!(store.read(&pick).unwrap(), 2);
    }
}
