//! Evaluation Context
//!
//! A cell's logic never sees the store directly. It receives:
//!
//! - a [`Getter`] to read other cells (and itself)
//! - a [`Setter`] to write other cells (and itself)
//! - inside `read`, a [`ReadOptions`] with a cancellation signal and a
//!   deferred self-setter
//!
//! # Dependency tracking
//!
//! The getter handed to `read` is a *tracking* getter: every cell it reads
//! is recorded together with the state it had at that moment. The record is
//! shared, so a getter moved into an async block keeps adding dependencies
//! after the first await; they are picked up when the pending value settles.
//!
//! The getter handed to `write` does not track anything.
//!
//! Getters and setters hold a weak reference to their store. Using one after
//! the store is gone returns [`ErrorKind::StoreDropped`](crate::ErrorKind).

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{Abortable, FutureExt};
use parking_lot::Mutex;

use crate::error::CellError;
use crate::graph::node::{CellState, DepEntry, Dependencies};

use super::cell::{Cell, CellNode, CellRef};
use super::store::WeakStore;
use super::tracked::{AbortSignal, AbortSlot};

/// Dependencies recorded by one evaluation.
pub(crate) type Tracker = Arc<Mutex<Dependencies>>;

pub(crate) fn read_value<V: Clone + 'static>(
    cell: &CellNode,
    state: &CellState,
) -> Result<V, CellError> {
    state
        .value()?
        .downcast::<V>()
        .ok_or_else(|| CellError::type_mismatch(cell))
}

pub(crate) fn write_output<R: 'static>(cell: &CellNode, output: Box<dyn Any + Send>) -> Result<R, CellError> {
    output
        .downcast::<R>()
        .map(|output| *output)
        .map_err(|_| CellError::type_mismatch(cell))
}

/// Reads cells on behalf of the cell being evaluated or written.
#[derive(Clone)]
pub struct Getter {
    store: WeakStore,
    owner: CellRef,
    tracker: Option<Tracker>,
}

impl Getter {
    pub(crate) fn tracking(store: WeakStore, owner: CellRef, tracker: Tracker) -> Self {
        Self {
            store,
            owner,
            tracker: Some(tracker),
        }
    }

    pub(crate) fn plain(store: WeakStore, owner: CellRef) -> Self {
        Self {
            store,
            owner,
            tracker: None,
        }
    }

    /// Read a cell. Reading the owning cell is the same as [`get_self`](Self::get_self).
    pub fn get<V, A, R>(&self, cell: &Cell<V, A, R>) -> Result<V, CellError>
    where
        V: Clone + 'static,
    {
        if cell.id() == self.owner.id() {
            return self.get_self();
        }

        let shared = self.store.shared()?;
        let state = shared.read_framed(cell.node());
        if let Some(tracker) = &self.tracker {
            tracker.lock().insert(
                cell.id(),
                DepEntry {
                    cell: cell.node().clone(),
                    state: Some(state.clone()),
                },
            );
        }
        read_value(cell.node(), &state)
    }

    /// Read the owning cell.
    ///
    /// While evaluating, this is the cell's previous value, or its initial
    /// value if it has none yet; the cell does not recompute itself. While
    /// writing, it is a normal read.
    pub fn get_self<V>(&self) -> Result<V, CellError>
    where
        V: Clone + 'static,
    {
        let shared = self.store.shared()?;
        let Some(tracker) = &self.tracker else {
            let state = shared.read_framed(&self.owner);
            return read_value(&self.owner, &state);
        };

        let self_entry = DepEntry {
            cell: self.owner.clone(),
            state: None,
        };
        match shared.state_of(self.owner.id()) {
            Some(state) => {
                tracker.lock().insert(self.owner.id(), self_entry);
                read_value(&self.owner, &state)
            }
            None => {
                let initial = self
                    .owner
                    .logic()
                    .initial_value()
                    .ok_or_else(|| CellError::no_initial_value(&*self.owner))?;
                tracker.lock().insert(self.owner.id(), self_entry);
                initial
                    .downcast::<V>()
                    .ok_or_else(|| CellError::type_mismatch(&*self.owner))
            }
        }
    }
}

/// Writes cells on behalf of the cell being evaluated or written.
///
/// A setter used outside any running write, for example from an async
/// continuation, opens its own transaction and notifies listeners before
/// it returns.
#[derive(Clone)]
pub struct Setter {
    store: WeakStore,
    owner: CellRef,
}

impl Setter {
    pub(crate) fn new(store: WeakStore, owner: CellRef) -> Self {
        Self { store, owner }
    }

    /// Write another cell through its write logic.
    pub fn set<V, A, R>(&self, cell: &Cell<V, A, R>, args: impl Into<A>) -> Result<R, CellError>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        if cell.id() == self.owner.id() {
            return Err(CellError::self_write_through_set(&*self.owner));
        }

        let shared = self.store.shared()?;
        let output = shared.set_cell(cell.node(), Box::new(args.into()))?;
        write_output(cell.node(), output)
    }

    /// Install a new value for the owning cell without calling its write
    /// logic. The cell must have an initial value.
    pub fn set_self<V>(&self, value: V) -> Result<(), CellError>
    where
        V: Send + 'static,
    {
        let shared = self.store.shared()?;
        let value = self
            .owner
            .logic()
            .erase(Box::new(value))
            .ok_or_else(|| CellError::type_mismatch(&*self.owner))?;
        shared.write_self(&self.owner, value)
    }
}

/// Per-evaluation state behind [`ReadOptions`].
#[derive(Clone)]
pub(crate) struct ReadScope {
    store: WeakStore,
    owner: CellRef,
    abort: AbortSlot,
    evaluating: Arc<AtomicBool>,
}

impl ReadScope {
    pub(crate) fn new(store: WeakStore, owner: CellRef) -> Self {
        Self {
            store,
            owner,
            abort: AbortSlot::default(),
            evaluating: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the synchronous part of the evaluation as finished.
    pub(crate) fn finish(&self) {
        self.evaluating.store(false, Ordering::SeqCst);
    }

    pub(crate) fn abort_slot(&self) -> &AbortSlot {
        &self.abort
    }
}

/// Extras available to a cell's `read`.
pub struct ReadOptions<A = (), R = ()> {
    scope: ReadScope,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for ReadOptions<A, R> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> ReadOptions<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(scope: ReadScope) -> Self {
        Self {
            scope,
            _marker: PhantomData,
        }
    }

    /// A signal that fires once the pending value produced by this read is
    /// superseded or abandoned.
    pub fn signal(&self) -> AbortSignal {
        self.scope.abort.signal()
    }

    /// Wrap a future so it is aborted together with [`signal`](Self::signal).
    /// An aborted future resolves to [`ErrorKind::Cancelled`](crate::ErrorKind).
    pub fn abortable<F: Future>(
        &self,
        future: F,
    ) -> impl Future<Output = Result<F::Output, CellError>> {
        let cell = self.scope.owner.to_string();
        Abortable::new(future, self.scope.abort.register())
            .map(move |result| result.map_err(|_| CellError::cancelled(cell)))
    }

    /// A setter that writes the owning cell through its write logic.
    ///
    /// Returns `None` for read-only cells. The setter is meant for async
    /// continuations: calling it before `read` has returned does nothing.
    pub fn set_self(&self) -> Option<SetSelf<A, R>> {
        if !self.scope.owner.logic().is_writable() {
            tracing::warn!(cell = %self.scope.owner, "set_self cannot be used with read-only cells");
            return None;
        }
        Some(SetSelf {
            store: self.scope.store.clone(),
            cell: self.scope.owner.clone(),
            evaluating: Some(self.scope.evaluating.clone()),
            _marker: PhantomData,
        })
    }
}

/// Writes a cell through its own write logic.
///
/// Handed to on-mount hooks and obtained from [`ReadOptions::set_self`].
pub struct SetSelf<A = (), R = ()> {
    store: WeakStore,
    cell: CellRef,
    evaluating: Option<Arc<AtomicBool>>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for SetSelf<A, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cell: self.cell.clone(),
            evaluating: self.evaluating.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> SetSelf<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn mounted(store: WeakStore, cell: CellRef) -> Self {
        Self {
            store,
            cell,
            evaluating: None,
            _marker: PhantomData,
        }
    }

    /// Write the cell. Returns `Ok(None)` when called during the synchronous
    /// part of the read that produced this setter.
    pub fn call(&self, args: impl Into<A>) -> Result<Option<R>, CellError> {
        let in_sync_read = self
            .evaluating
            .as_ref()
            .is_some_and(|evaluating| evaluating.load(Ordering::SeqCst));
        if in_sync_read {
            tracing::warn!(cell = %self.cell, "set_self cannot be called synchronously");
            return Ok(None);
        }

        let shared = self.store.shared()?;
        let output = shared.write_cell(&self.cell, Box::new(args.into()))?;
        write_output(&self.cell, output).map(Some)
    }
}
