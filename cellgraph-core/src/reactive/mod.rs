//! Reactive Cells
//!
//! This module implements the cell store: cells, the context handed to
//! their logic, and the store that caches, propagates and reports their
//! values.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A [`Cell`] is a handle to a piece of state or a derived computation. It
//! holds no value itself. Cells come in four shapes: primitive state,
//! read-only derived, writable derived, and write-only.
//!
//! ## Stores
//!
//! A [`Store`] caches the value of each cell it has read, together with the
//! dependencies consulted to compute it. Reading an unmounted cell
//! revalidates that cache lazily; writing a cell eagerly recomputes the
//! mounted cells downstream of it.
//!
//! ## Subscriptions
//!
//! Subscribing to a cell mounts it and its dependencies. Listeners are
//! called once per transaction, after all of its writes, and only for cells
//! whose value actually changed.
//!
//! ## Async values
//!
//! A cell whose value is a [`Tracked`] future goes through the async
//! bridge: a newer value supersedes an unsettled older one, and everyone
//! waiting on the old one observes the new outcome.
//!
//! # Implementation Notes
//!
//! Dependencies are tracked explicitly: a cell's read logic receives a
//! [`Getter`] and every cell read through it is recorded. There is no
//! ambient tracking context, so the same cell can be evaluated by any
//! number of stores on any thread.

pub(crate) mod cell;
mod batch;
mod context;
mod engine;
mod kinds;
mod mount;
mod store;
mod subscriber;
pub(crate) mod tracked;

pub use cell::{Cell, CellLogic, OnUnmount, Shared};
pub use context::{Getter, ReadOptions, SetSelf, Setter};
pub use kinds::Update;
pub use store::{default_store, Store, WeakStore};
pub use subscriber::{ListenerId, Subscription};
pub use tracked::{AbortSignal, Status, Tracked};
