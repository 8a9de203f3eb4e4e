//! Dependency Graph
//!
//! This module holds the data the store keeps about cells and the ordering
//! algorithm used to propagate changes through them.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - Nodes are cells, identified by [`CellId`]
//! - Edges are dependencies: if A read B during its last computation, B has
//!   A as a dependent
//!
//! Edges are only ever stored as identifiers, never as owning pointers from a
//! dependency to its dependents. A misused graph may contain cycles; that is
//! a caller error and never a memory-safety or ownership problem.
//!
//! # Design Decisions
//!
//! 1. Each computed state records the exact dependency snapshots it was built
//!    from. Comparing snapshots by pointer lets an unmounted cell decide
//!    cheaply whether its cache is still valid.
//!
//! 2. Dependency maps are shared between states by `Arc` as long as they do
//!    not change, so "same dependencies" is a pointer comparison.
//!
//! 3. Recompute order is produced by a depth-first walk over the dependents
//!    of the changed cell only, so unrelated parts of the graph are never
//!    touched.

pub(crate) mod node;
pub(crate) mod scheduler;

pub use node::CellId;
