//! Cellgraph Core
//!
//! This crate provides a reactive cell store in the style of atom-based
//! state libraries. It implements:
//!
//! - Cells: primitive state, derived, writable derived and write-only
//! - A per-store cache with lazy revalidation of unmounted cells
//! - Eager, glitch-free propagation of writes to mounted cells
//! - Transactions that batch listener notifications
//! - An async bridge for cells whose values are futures
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: cells, the evaluation context, and the store
//! - `graph`: cell identity, cached state and the recompute ordering
//! - `config`: store settings
//! - `error`: the error type shared by every operation
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use cellgraph_core::{Cell, Store};
//!
//! let store = Store::new();
//!
//! // Create a primitive cell
//! let count = Cell::state(0);
//!
//! // Create a derived cell
//! let doubled = {
//!     let count = count.clone();
//!     Cell::derived(move |get| Ok(get.get(&count)? * 2))
//! };
//!
//! // Subscribe to it
//! let calls = Arc::new(AtomicUsize::new(0));
//! let counter = calls.clone();
//! let _subscription = store.subscribe(&doubled, move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! // Update the primitive cell
//! store.write(&count, 5).unwrap();
//! assert_eq!(store.read(&doubled).unwrap(), 10);
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::StoreConfig;
pub use error::{CellError, ErrorKind};
pub use graph::CellId;
pub use reactive::{
    default_store, AbortSignal, Cell, CellLogic, Getter, ListenerId, OnUnmount, ReadOptions,
    SetSelf, Setter, Shared, Status, Store, Subscription, Tracked, Update, WeakStore,
};
