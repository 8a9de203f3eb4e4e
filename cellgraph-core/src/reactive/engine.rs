//! Evaluation Engine
//!
//! Reading a cell returns its cached state when that state is still valid
//! and recomputes it otherwise. Validity depends on whether the cell is
//! mounted:
//!
//! - a mounted cell is kept current by write propagation, so its cached
//!   state is always valid
//! - an unmounted cell is valid if every dependency, read again, still has
//!   the state (or at least the value) recorded when the cell last computed
//!
//! Writing a cell installs a new state and eagerly recomputes every cell
//! that depends on it, in topological order, skipping cells none of whose
//! dependencies changed value.
//!
//! # State identity
//!
//! States are immutable and compared by pointer. Installing a value that is
//! the same as the current one with the same dependencies keeps the
//! current state object, which is what lets the flush skip unchanged cells.

use std::any::Any;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::error::CellError;
use crate::graph::node::{
    empty_dependencies, same_value, AnyValue, CellState, Dependencies, Outcome, StateRef,
};
use crate::graph::scheduler::topological_order;

use super::batch::FrameScope;
use super::cell::CellRef;
use super::context::{Getter, ReadScope, Setter, Tracker};
use super::store::StoreCore;
use super::tracked::{AbortSlot, PendingValue, Supersede};

/// What an evaluation hands to the async bridge along with its value.
struct ReadContext {
    abort: AbortSlot,
    tracker: Tracker,
}

/// Merge newly recorded dependencies into the previous ones.
///
/// Returns `prev` itself when nothing changed, so callers can compare
/// dependency sets by pointer.
fn update_dependencies(
    prev: &Arc<Dependencies>,
    next: &Dependencies,
    keep_previous: bool,
) -> Arc<Dependencies> {
    let mut merged = if keep_previous {
        (**prev).clone()
    } else {
        Dependencies::default()
    };

    let mut changed = false;
    for (id, entry) in next {
        let unchanged = prev
            .get(id)
            .is_some_and(|previous| previous.same_snapshot(entry));
        if !unchanged {
            changed = true;
        }
        merged.insert(*id, entry.clone());
    }

    if changed || merged.len() != prev.len() {
        Arc::new(merged)
    } else {
        prev.clone()
    }
}

impl StoreCore {
    /// Read a cell inside a transaction, opening one if none is running.
    pub(crate) fn read_framed(self: &Arc<Self>, cell: &CellRef) -> StateRef {
        let (state, _) = self.in_frame(None, FrameScope::IfIdle, || {
            self.read_cell_state(cell, false)
        });
        state
    }

    pub(crate) fn read_cell_state(self: &Arc<Self>, cell: &CellRef, force: bool) -> StateRef {
        if !force {
            if let Some(state) = self.cached_state(cell) {
                return state;
            }
        }
        self.compute(cell)
    }

    fn cached_state(self: &Arc<Self>, cell: &CellRef) -> Option<StateRef> {
        let id = cell.id();
        let (state, mounted) = {
            let inner = self.inner.lock();
            (inner.states.get(&id).cloned()?, inner.mounted.contains_key(&id))
        };
        if mounted {
            return Some(state);
        }

        for (dep_id, entry) in state.dependencies.iter() {
            if *dep_id == id {
                continue;
            }
            let current = self.read_cell_state(&entry.cell, false);
            let still_valid = match &entry.state {
                Some(recorded) => {
                    Arc::ptr_eq(recorded, &current) || same_value(Some(recorded), &current)
                }
                None => false,
            };
            if !still_valid {
                return None;
            }
        }
        Some(state)
    }

    fn compute(self: &Arc<Self>, cell: &CellRef) -> StateRef {
        let store = self.weak();
        let tracker = Tracker::default();
        let getter = Getter::tracking(store.clone(), cell.clone(), tracker.clone());
        let setter = Setter::new(store.clone(), cell.clone());
        let scope = ReadScope::new(store, cell.clone());

        let result = cell.logic().read(&getter, &setter, &scope);
        scope.finish();

        let next = tracker.lock().clone();
        tracing::trace!(store = %self, cell = %cell, dependencies = next.len(), "computed");
        match result {
            Ok(value) => {
                let read = ReadContext {
                    abort: scope.abort_slot().clone(),
                    tracker,
                };
                self.set_value_or_pending(cell, value, Some(&next), Some(read))
            }
            Err(error) => self.set_cell_error(cell, error, Some(&next)),
        }
    }

    /// Install a value, routing pending values through the async bridge.
    fn set_value_or_pending(
        self: &Arc<Self>,
        cell: &CellRef,
        value: AnyValue,
        next: Option<&Dependencies>,
        read: Option<ReadContext>,
    ) -> StateRef {
        let Some(pending) = value.as_pending() else {
            return self.set_cell_value(cell, value, next, false);
        };
        let wrapped = pending.wrap();
        let Some(wrapper) = wrapped.as_pending().cloned() else {
            return self.set_cell_value(cell, wrapped, next, false);
        };

        let (abort, tracker) = match read {
            Some(ReadContext { abort, tracker }) => (Some(abort), Some(tracker)),
            None => (None, None),
        };
        if let Some(abort) = abort {
            wrapper.on_cancel(Box::new(move || abort.abort()));
        }

        let wrapper_id = wrapper.id();
        let weak = Arc::downgrade(self);
        let target = cell.clone();
        wrapper.on_settle(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.settle_pending(&target, wrapper_id, tracker);
            }
        }));

        let state = self.set_cell_value(cell, wrapped, next, true);
        if state.pending().is_some_and(|installed| installed.id() == wrapper_id) {
            self.drive(&*wrapper);
        }
        state
    }

    fn drive(&self, pending: &dyn PendingValue) {
        if !self.config.eager_async {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(pending.drive());
        }
    }

    /// A pending value settled: pick up dependencies read after its first
    /// await and report the cell as changed.
    fn settle_pending(self: &Arc<Self>, cell: &CellRef, wrapper_id: u64, tracker: Option<Tracker>) {
        let (_, flushed) = self.in_frame(Some(cell.id()), FrameScope::Always, || {
            let Some(current) = self.state_of(cell.id()) else {
                return;
            };
            let Outcome::Value(value) = &current.outcome else {
                return;
            };
            // Superseded; the newer value reports for itself.
            if value.as_pending().map(|pending| pending.id()) != Some(wrapper_id) {
                return;
            }
            let next = tracker.map(|tracker| tracker.lock().clone());
            self.set_cell_value(cell, value.clone(), next.as_ref(), false);
        });
        tracing::trace!(store = %self, cell = %cell, flushed = ?flushed, "pending value settled");
    }

    fn set_cell_value(
        &self,
        cell: &CellRef,
        value: AnyValue,
        next: Option<&Dependencies>,
        keep_previous: bool,
    ) -> StateRef {
        let prev = self.state_of(cell.id());
        let prev_dependencies = prev
            .as_ref()
            .map_or_else(empty_dependencies, |prev| prev.dependencies.clone());
        let dependencies = match next {
            Some(next) => update_dependencies(&prev_dependencies, next, keep_previous),
            None => prev_dependencies,
        };

        let mut outcome = Outcome::Value(value);
        if let Some(prev) = &prev {
            let same = match (&prev.outcome, &outcome) {
                (Outcome::Value(old), Outcome::Value(new)) => old.same(new),
                _ => false,
            };
            if same {
                if Arc::ptr_eq(&prev.dependencies, &dependencies) {
                    return prev.clone();
                }
                // Keep the installed value so its pending handle stays put.
                outcome = prev.outcome.clone();
            }
        }

        let state = CellState::new(dependencies, outcome);
        self.set_cell_state(cell, state.clone());
        state
    }

    fn set_cell_error(
        &self,
        cell: &CellRef,
        error: CellError,
        next: Option<&Dependencies>,
    ) -> StateRef {
        let prev = self.state_of(cell.id());
        let prev_dependencies = prev
            .as_ref()
            .map_or_else(empty_dependencies, |prev| prev.dependencies.clone());
        let dependencies = match next {
            Some(next) => update_dependencies(&prev_dependencies, next, false),
            None => prev_dependencies,
        };

        if let Some(prev) = &prev {
            let same_error = matches!(&prev.outcome, Outcome::Error(old) if old.ptr_eq(&error));
            if same_error && Arc::ptr_eq(&prev.dependencies, &dependencies) {
                return prev.clone();
            }
        }

        let state = CellState::new(dependencies, Outcome::Error(error));
        self.set_cell_state(cell, state.clone());
        state
    }

    fn set_cell_state(&self, cell: &CellRef, next: StateRef) {
        let prev = {
            let mut inner = self.inner.lock();
            let prev = inner.states.insert(cell.id(), next.clone());
            if !inner.pending.contains_key(&cell.id()) {
                inner.register_pending(cell, prev.clone(), &next);
            }
            prev
        };

        if let Some(old) = prev.as_ref().and_then(|prev| prev.pending()) {
            let replaced = next.pending().map(|pending| pending.id()) != Some(old.id());
            if replaced {
                match &next.outcome {
                    Outcome::Value(value) => old.supersede(Supersede::Value(value)),
                    Outcome::Error(error) => old.supersede(Supersede::Error(error)),
                }
            }
        }
        tracing::trace!(store = %self, cell = %cell, pending = next.is_pending(), "state installed");
    }

    /// Recompute everything downstream of `cell`, dependencies first.
    fn recompute_dependents(self: &Arc<Self>, cell: &CellRef) {
        let order = {
            let inner = self.inner.lock();
            topological_order(cell.id(), |id| inner.dependents_of(id))
        };

        let mut changed = FxHashSet::default();
        changed.insert(cell.id());
        for id in order.into_iter().rev() {
            let (prev, target) = {
                let inner = self.inner.lock();
                (inner.states.get(&id).cloned(), inner.cell_ref(id))
            };
            let (Some(prev), Some(target)) = (prev, target) else {
                continue;
            };

            let affected = prev
                .dependencies
                .keys()
                .any(|dep_id| *dep_id != id && changed.contains(dep_id));
            if !affected {
                continue;
            }
            let next = self.read_cell_state(&target, true);
            if !same_value(Some(&prev), &next) {
                changed.insert(id);
            }
        }
    }

    /// Write a cell from outside any cell logic.
    pub(crate) fn write_cell(
        self: &Arc<Self>,
        cell: &CellRef,
        args: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CellError> {
        let (result, flushed) = self.in_frame(Some(cell.id()), FrameScope::Always, || {
            self.write_cell_state(cell, args)
        });
        tracing::debug!(store = %self, action = "write", cell = %cell, flushed = ?flushed);
        result
    }

    /// Write a cell through a setter handed to some other cell's logic.
    pub(crate) fn set_cell(
        self: &Arc<Self>,
        cell: &CellRef,
        args: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CellError> {
        let (result, flushed) = self.in_frame(Some(cell.id()), FrameScope::IfIdle, || {
            self.write_cell_state(cell, args)
        });
        if flushed.is_some() {
            tracing::debug!(store = %self, action = "write.async", cell = %cell, flushed = ?flushed);
        }
        result
    }

    fn write_cell_state(
        self: &Arc<Self>,
        cell: &CellRef,
        args: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CellError> {
        if !cell.logic().is_writable() {
            return Err(CellError::not_writable(cell));
        }
        let store = self.weak();
        let getter = Getter::plain(store.clone(), cell.clone());
        let setter = Setter::new(store, cell.clone());
        cell.logic().write(cell, &getter, &setter, args)
    }

    /// Install a new value for `cell` directly and propagate it.
    pub(crate) fn write_self(self: &Arc<Self>, cell: &CellRef, value: AnyValue) -> Result<(), CellError> {
        if cell.logic().initial_value().is_none() {
            return Err(CellError::no_initial_value(cell));
        }

        let (_, flushed) = self.in_frame(Some(cell.id()), FrameScope::IfIdle, || {
            let prev = self.state_of(cell.id());
            let next = self.set_value_or_pending(cell, value, None, None);
            if !same_value(prev.as_deref(), &next) {
                self.recompute_dependents(cell);
            }
        });
        if flushed.is_some() {
            tracing::debug!(store = %self, action = "write.async", cell = %cell, flushed = ?flushed);
        }
        Ok(())
    }
}
