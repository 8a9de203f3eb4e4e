//! Listeners and subscriptions.
//!
//! A listener is a callback attached to a mounted cell. It is invoked with no
//! arguments after a transaction that changed the cell; it reads the store
//! itself if it needs the new value.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::CellId;

use super::cell::CellRef;
use super::store::WeakStore;

/// Unique identifier for a listener.
///
/// Each subscription gets its own ID, so the same closure can be subscribed
/// twice and removed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// A change callback registered on a mounted cell.
#[derive(Clone)]
pub(crate) struct Listener {
    id: ListenerId,
    /// Shared so the store can call listeners without holding its lock.
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl Listener {
    pub(crate) fn new<F>(notify: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id: ListenerId::new(),
            notify: Arc::new(notify),
        }
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn notify(&self) {
        (self.notify)();
    }
}

/// Keeps a listener attached to a cell.
///
/// Dropping the subscription unsubscribes. Unsubscribing more than once is
/// a no-op.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    store: WeakStore,
    cell: CellRef,
    listener: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(store: WeakStore, cell: CellRef, listener: ListenerId) -> Self {
        Self {
            store,
            cell,
            listener,
            active: AtomicBool::new(true),
        }
    }

    pub fn cell_id(&self) -> CellId {
        self.cell.id()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the listener and let the cell unmount if nothing else needs it.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        // A dropped store has nothing left to unmount.
        if let Ok(shared) = self.store.shared() {
            shared.unsubscribe(&self.cell, self.listener);
        }
    }

    /// Keep the listener attached for as long as the store lives.
    pub fn detach(self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cell", &self.cell.id())
            .field("listener", &self.listener)
            .field("active", &self.is_active())
            .finish()
    }
}
