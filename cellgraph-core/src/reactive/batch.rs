//! Transactions
//!
//! Every store operation that can change state runs inside a *frame*. While
//! a frame is open, each cell whose state changes is recorded as pending
//! together with the state it had before, and so is everything that
//! depends on it. Nothing is reported to listeners yet.
//!
//! When the outermost operation finishes, the frame is flushed:
//!
//! 1. Pending cells are collected depth-first, dependents before
//!    dependencies, each at most once.
//! 2. For every mounted cell whose state really changed, the mount graph is
//!    reconciled with its new dependencies and its listeners are called.
//! 3. Listeners may write again; their changes land in a fresh frame that
//!    is flushed in turn until nothing is left.
//!
//! A listener therefore sees each transaction once, after all of its
//! writes, and never sees a cell whose value came back to where it was.

use std::sync::Arc;

use indexmap::IndexSet;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::graph::node::{same_error, same_value, StateRef};
use crate::graph::scheduler::Dependents;
use crate::graph::CellId;

use super::cell::CellRef;
use super::store::{StoreCore, StoreInner};
use super::subscriber::Listener;

/// Cells changed within one transaction.
pub(crate) type Frame = IndexSet<CellId, FxBuildHasher>;

/// A cell waiting to be flushed.
pub(crate) struct PendingEntry {
    pub(crate) cell: CellRef,
    /// The state before the transaction touched the cell.
    pub(crate) prev: Option<StateRef>,
    /// Cells found to depend on this one while the transaction ran.
    pub(crate) dependents: IndexSet<CellId, FxBuildHasher>,
}

/// Whether an operation opens a frame of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameScope {
    /// Always open and flush a frame.
    Always,
    /// Join the innermost open frame; open one only when none is open.
    IfIdle,
}

impl StoreInner {
    /// Record `cell` as changed in the innermost frame. `prev` is its state
    /// before the change and `state` the one just installed.
    pub(crate) fn register_pending(
        &mut self,
        cell: &CellRef,
        prev: Option<StateRef>,
        state: &StateRef,
    ) {
        let id = cell.id();
        if let Some(frame) = self.pending_stack.last_mut() {
            frame.insert(id);
        }
        self.pending.insert(
            id,
            PendingEntry {
                cell: cell.clone(),
                prev,
                dependents: IndexSet::default(),
            },
        );
        self.add_pending_dependent(id, state);
    }

    /// Walk up the dependencies of a changed cell and record the edge on
    /// each of them, so the flush reaches the changed cell from its sources.
    fn add_pending_dependent(&mut self, dependent: CellId, state: &StateRef) {
        let mut work: Vec<(CellId, StateRef)> = vec![(dependent, state.clone())];
        while let Some((dependent, state)) = work.pop() {
            for (dep_id, entry) in state.dependencies.iter() {
                if *dep_id == dependent {
                    continue;
                }
                let current = self.states.get(dep_id).cloned();
                match self.pending.get_mut(dep_id) {
                    Some(pending) => {
                        pending.dependents.insert(dependent);
                    }
                    None => {
                        if let Some(frame) = self.pending_stack.last_mut() {
                            frame.insert(*dep_id);
                        }
                        let mut dependents = IndexSet::default();
                        dependents.insert(dependent);
                        self.pending.insert(
                            *dep_id,
                            PendingEntry {
                                cell: entry.cell.clone(),
                                prev: current.clone(),
                                dependents,
                            },
                        );
                        if let Some(current) = current {
                            work.push((*dep_id, current));
                        }
                    }
                }
            }
        }
    }

    /// Mounted and pending dependents of a cell, without duplicates.
    pub(crate) fn dependents_of(&self, id: CellId) -> Dependents {
        let mut out = Dependents::new();
        let mounted = self.mounted.get(&id).map(|mounted| &mounted.dependents);
        let pending = self.pending.get(&id).map(|pending| &pending.dependents);
        for dependent in mounted.into_iter().chain(pending).flatten() {
            if !out.contains(dependent) {
                out.push(*dependent);
            }
        }
        out
    }

    /// The cell handle behind an id, if the store is tracking it.
    pub(crate) fn cell_ref(&self, id: CellId) -> Option<CellRef> {
        self.mounted
            .get(&id)
            .map(|mounted| mounted.cell.clone())
            .or_else(|| self.pending.get(&id).map(|pending| pending.cell.clone()))
    }

    /// Take every pending entry reachable from `frame`, dependents first.
    fn collect_pending(&mut self, frame: Frame) -> Vec<(CellRef, Option<StateRef>)> {
        let mut collected = Vec::new();
        let mut stack: Vec<CellId> = frame.into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some(entry) = self.pending.remove(&id) else {
                continue;
            };
            let dependencies: SmallVec<[CellId; 8]> = self
                .states
                .get(&id)
                .map(|state| state.dependencies.keys().copied().collect())
                .unwrap_or_default();
            stack.extend(dependencies.into_iter().rev());
            stack.extend(entry.dependents.iter().rev().copied());
            collected.push((entry.cell, entry.prev));
        }
        collected
    }
}

/// Pops a frame if the operation unwinds before flushing it.
struct FrameGuard<'a> {
    core: &'a StoreCore,
    armed: bool,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core.inner.lock().pending_stack.pop();
        }
    }
}

impl StoreCore {
    /// Run `body` inside a transaction frame.
    ///
    /// Returns the body's result and, when this call opened and flushed the
    /// frame, the cells whose listeners fired (empty unless diagnostics are
    /// enabled).
    pub(crate) fn in_frame<T>(
        self: &Arc<Self>,
        seed: Option<CellId>,
        scope: FrameScope,
        body: impl FnOnce() -> T,
    ) -> (T, Option<Vec<CellId>>) {
        let _gate = self.gate.lock();
        let opened = {
            let mut inner = self.inner.lock();
            let open = scope == FrameScope::Always || inner.pending_stack.is_empty();
            if open {
                inner.pending_stack.push(seed.into_iter().collect());
            }
            open
        };
        let mut guard = FrameGuard {
            core: self,
            armed: opened,
        };

        let result = body();
        if !opened {
            return (result, None);
        }

        guard.armed = false;
        let frame = self.pop_frame();
        (result, Some(self.flush_pending(frame)))
    }

    fn pop_frame(&self) -> Frame {
        let frame = self.inner.lock().pending_stack.pop();
        debug_assert!(frame.is_some(), "transaction frame stack underflow");
        frame.unwrap_or_default()
    }

    /// Flush `frame` and every frame opened by the listeners it notifies.
    fn flush_pending(self: &Arc<Self>, frame: Frame) -> Vec<CellId> {
        let mut flushed = Vec::new();
        let mut frame = frame;
        while !frame.is_empty() {
            self.inner.lock().pending_stack.push(Frame::default());
            self.flush_round(frame, &mut flushed);
            frame = self.pop_frame();
        }
        flushed
    }

    fn flush_round(self: &Arc<Self>, frame: Frame, flushed: &mut Vec<CellId>) {
        let collected = self.inner.lock().collect_pending(frame);
        for (cell, prev) in collected {
            let id = cell.id();
            let Some(state) = self.state_of(id) else {
                tracing::warn!(store = %self, cell = %cell, "pending cell has no state");
                continue;
            };
            if prev.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &state)) {
                continue;
            }
            if !self.is_mounted(id) {
                continue;
            }

            let prev_dependencies = prev.as_ref().map(|prev| &prev.dependencies);
            if prev_dependencies.map_or(true, |deps| !Arc::ptr_eq(deps, &state.dependencies)) {
                self.mount_dependencies(&cell, &state, prev_dependencies);
            }

            let prev = prev.as_deref();
            let was_pending = prev.is_some_and(|prev| prev.is_pending());
            if !was_pending && (same_value(prev, &state) || same_error(prev, &state)) {
                continue;
            }

            let listeners: Option<SmallVec<[Listener; 2]>> = self
                .inner
                .lock()
                .mounted
                .get(&id)
                .map(|mounted| mounted.listeners.values().cloned().collect());
            let Some(listeners) = listeners else {
                continue;
            };
            for listener in &listeners {
                // An earlier listener may have unsubscribed this one.
                if self.has_listener(id, listener.id()) {
                    listener.notify();
                }
            }
            if self.config.diagnostics {
                flushed.push(id);
            }
        }
    }
}
