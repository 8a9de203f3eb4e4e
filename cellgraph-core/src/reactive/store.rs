//! The Store
//!
//! A [`Store`] owns the state of every cell it has seen. Cells are plain
//! handles, so one cell can have independent values in several stores.
//!
//! # Thread Safety
//!
//! A store is `Send + Sync` and cheap to clone. Each store operation holds a
//! reentrant gate for its whole duration, so operations from different
//! threads are serialized while a listener or a cell's own logic can call
//! back into the store from the same thread. The bookkeeping maps sit
//! behind a separate lock that is never held while user code runs.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::config::StoreConfig;
use crate::error::CellError;
use crate::graph::node::StateRef;
use crate::graph::CellId;

use super::batch::{Frame, PendingEntry};
use super::cell::Cell;
use super::context::{read_value, write_output};
use super::mount::Mounted;
use super::subscriber::{Listener, Subscription};

/// Bookkeeping shared by every handle to one store.
pub(crate) struct StoreCore {
    pub(crate) config: StoreConfig,
    /// Serializes store operations across threads.
    pub(crate) gate: ReentrantMutex<()>,
    pub(crate) inner: Mutex<StoreInner>,
}

#[derive(Default)]
pub(crate) struct StoreInner {
    pub(crate) states: FxHashMap<CellId, StateRef>,
    pub(crate) mounted: IndexMap<CellId, Mounted, FxBuildHasher>,
    /// Open transaction frames, innermost last.
    pub(crate) pending_stack: Vec<Frame>,
    pub(crate) pending: FxHashMap<CellId, PendingEntry>,
}

impl StoreCore {
    fn new(config: StoreConfig) -> Self {
        Self {
            config,
            gate: ReentrantMutex::new(()),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub(crate) fn weak(self: &Arc<Self>) -> WeakStore {
        WeakStore(Arc::downgrade(self))
    }

    pub(crate) fn state_of(&self, id: CellId) -> Option<StateRef> {
        self.inner.lock().states.get(&id).cloned()
    }

    pub(crate) fn is_mounted(&self, id: CellId) -> bool {
        self.inner.lock().mounted.contains_key(&id)
    }
}

impl fmt::Display for StoreCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.config.name {
            Some(name) => write!(f, "CellStore<{name}>"),
            None => f.write_str("CellStore"),
        }
    }
}

/// A container for cell values.
///
/// # Example
///
/// ```rust
/// use cellgraph_core::{Cell, Store};
///
/// let store = Store::new();
/// let count = Cell::state(1);
/// let doubled = {
///     let count = count.clone();
///     Cell::derived(move |get| Ok(get.get(&count)? * 2))
/// };
///
/// assert_eq!(store.read(&doubled).unwrap(), 2);
/// store.write(&count, 5).unwrap();
/// assert_eq!(store.read(&doubled).unwrap(), 10);
/// ```
#[derive(Clone)]
pub struct Store {
    core: Arc<StoreCore>,
}

impl Store {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// A store whose name shows up in its `Display` output and log events.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_config(StoreConfig::default().with_name(name))
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            core: Arc::new(StoreCore::new(config)),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.core.config
    }

    pub fn name(&self) -> Option<&str> {
        self.core.config.name.as_deref()
    }

    /// Read the current value of a cell, computing it if needed.
    ///
    /// An error raised by the cell's read logic is returned here and again
    /// on every later read until the cell recomputes.
    pub fn read<V, A, R>(&self, cell: &Cell<V, A, R>) -> Result<V, CellError>
    where
        V: Clone + 'static,
    {
        let state = self.core.read_framed(cell.node());
        read_value(cell.node(), &state)
    }

    /// Write a cell through its write logic and notify listeners of every
    /// mounted cell whose value changed.
    pub fn write<V, A, R>(&self, cell: &Cell<V, A, R>, args: impl Into<A>) -> Result<R, CellError>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let output = self.core.write_cell(cell.node(), Box::new(args.into()))?;
        write_output(cell.node(), output)
    }

    /// Mount a cell and call `listener` after every transaction that
    /// changes it. The listener is not called for the current value.
    pub fn subscribe<V, A, R, F>(&self, cell: &Cell<V, A, R>, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener = Listener::new(listener);
        let id = listener.id();
        self.core.subscribe(cell.node(), listener);
        Subscription::new(self.core.weak(), cell.node().clone(), id)
    }

    /// Identities of the currently mounted cells, in mount order.
    ///
    /// Only available when the store keeps diagnostics; returns `None`
    /// otherwise.
    pub fn mounted_cells(&self) -> Option<Vec<CellId>> {
        if !self.core.config.diagnostics {
            tracing::warn!(store = %self.core, "mounted-cell listing needs diagnostics enabled");
            return None;
        }
        Some(self.core.inner.lock().mounted.keys().copied().collect())
    }

    pub fn is_mounted<V, A, R>(&self, cell: &Cell<V, A, R>) -> bool {
        self.core.is_mounted(cell.id())
    }

    pub fn downgrade(&self) -> WeakStore {
        self.core.weak()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("Store")
            .field("name", &self.core.config.name)
            .field("states", &inner.states.len())
            .field("mounted", &inner.mounted.len())
            .finish()
    }
}

/// A store reference that does not keep the store alive.
#[derive(Clone, Default)]
pub struct WeakStore(Weak<StoreCore>);

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|core| Store { core })
    }

    pub(crate) fn shared(&self) -> Result<Arc<StoreCore>, CellError> {
        self.0.upgrade().ok_or_else(CellError::store_dropped)
    }
}

impl fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStore")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

/// The process-wide default store, created on first use.
pub fn default_store() -> &'static Store {
    static DEFAULT: OnceLock<Store> = OnceLock::new();
    DEFAULT.get_or_init(|| Store::named("default"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_name() {
        assert_eq!(Store::new().to_string(), "CellStore");
        assert_eq!(Store::named("ui").to_string(), "CellStore<ui>");
    }

    #[test]
    fn default_store_is_shared() {
        let first = default_store();
        let second = default_store();
        assert!(Arc::ptr_eq(&first.core, &second.core));
        assert_eq!(first.name(), Some("default"));
    }

    #[test]
    fn stores_keep_separate_values() {
        let count = Cell::state(0);
        let left = Store::new();
        let right = Store::new();

        left.write(&count, 1).unwrap();
        assert_eq!(left.read(&count).unwrap(), 1);
        assert_eq!(right.read(&count).unwrap(), 0);
    }

    #[test]
    fn weak_store_does_not_keep_the_store_alive() {
        let store = Store::new();
        let weak = store.downgrade();
        assert!(weak.upgrade().is_some());
        drop(store);
        assert!(weak.upgrade().is_none());
        assert!(weak.shared().is_err());
    }

    #[test]
    fn mounted_cells_requires_diagnostics() {
        let store = Store::with_config(StoreConfig::default().with_diagnostics(false));
        assert!(store.mounted_cells().is_none());

        let store = Store::with_config(StoreConfig::default().with_diagnostics(true));
        let count = Cell::state(0);
        let _subscription = store.subscribe(&count, || {});
        assert_eq!(store.mounted_cells(), Some(vec![count.id()]));
    }
}
