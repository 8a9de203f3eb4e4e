//! Graph Nodes
//!
//! This module defines what the store remembers about each cell: its
//! identity, its last computed state, and the dependencies consulted to
//! produce that state.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

use crate::error::CellError;
use crate::reactive::cell::CellRef;
use crate::reactive::tracked::{PendingValue, Tracked};

/// Unique identifier for a cell.
///
/// Identities are handed out once per constructed cell; clones of a cell
/// handle share the identity of the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A type-erased cell value.
///
/// The value itself lives behind an `Arc`, together with the equality
/// function of its concrete type. Values produced by pending cells also
/// carry their async-bridge view.
#[derive(Clone)]
pub(crate) struct AnyValue {
    value: Arc<dyn Any + Send + Sync>,
    same: fn(&dyn Any, &dyn Any) -> bool,
    pending: Option<Arc<dyn PendingValue>>,
}

fn same_as<V: PartialEq + 'static>(left: &dyn Any, right: &dyn Any) -> bool {
    match (left.downcast_ref::<V>(), right.downcast_ref::<V>()) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

impl AnyValue {
    pub(crate) fn plain<V>(value: V) -> Self
    where
        V: PartialEq + Send + Sync + 'static,
    {
        Self {
            value: Arc::new(value),
            same: same_as::<V>,
            pending: None,
        }
    }

    pub(crate) fn pending<T>(tracked: Tracked<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let tracked = Arc::new(tracked);
        Self {
            value: tracked.clone(),
            same: same_as::<Tracked<T>>,
            pending: Some(tracked),
        }
    }

    /// Identity of the value as the engine sees it.
    pub(crate) fn same(&self, other: &AnyValue) -> bool {
        Arc::ptr_eq(&self.value, &other.value) || (self.same)(&*self.value, &*other.value)
    }

    pub(crate) fn downcast<V: Clone + 'static>(&self) -> Option<V> {
        self.value.downcast_ref::<V>().cloned()
    }

    pub(crate) fn downcast_ref<V: 'static>(&self) -> Option<&V> {
        self.value.downcast_ref::<V>()
    }

    pub(crate) fn as_pending(&self) -> Option<&Arc<dyn PendingValue>> {
        self.pending.as_ref()
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyValue")
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

/// The result half of a cell state: a value or an error, never both.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Value(AnyValue),
    Error(CellError),
}

/// One recorded dependency.
///
/// `state` is the dependency's state at the moment it was consulted.
/// A cell that reads its own previous value records itself with no
/// snapshot.
#[derive(Clone)]
pub(crate) struct DepEntry {
    pub(crate) cell: CellRef,
    pub(crate) state: Option<StateRef>,
}

impl DepEntry {
    /// Whether two entries point at the same snapshot.
    pub(crate) fn same_snapshot(&self, other: &DepEntry) -> bool {
        match (&self.state, &other.state) {
            (Some(left), Some(right)) => Arc::ptr_eq(left, right),
            (None, None) => true,
            _ => false,
        }
    }
}

pub(crate) type Dependencies = IndexMap<CellId, DepEntry, FxBuildHasher>;

pub(crate) fn empty_dependencies() -> Arc<Dependencies> {
    Arc::new(Dependencies::default())
}

/// The last computed state of a cell.
///
/// States are never mutated after creation; a change installs a new state.
pub(crate) struct CellState {
    pub(crate) dependencies: Arc<Dependencies>,
    pub(crate) outcome: Outcome,
}

pub(crate) type StateRef = Arc<CellState>;

impl CellState {
    pub(crate) fn new(dependencies: Arc<Dependencies>, outcome: Outcome) -> StateRef {
        Arc::new(Self {
            dependencies,
            outcome,
        })
    }

    /// The stored value, or the stored error re-raised.
    pub(crate) fn value(&self) -> Result<AnyValue, CellError> {
        match &self.outcome {
            Outcome::Value(value) => Ok(value.clone()),
            Outcome::Error(error) => Err(error.clone()),
        }
    }

    pub(crate) fn pending(&self) -> Option<&Arc<dyn PendingValue>> {
        match &self.outcome {
            Outcome::Value(value) => value.as_pending(),
            Outcome::Error(_) => None,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending().is_some()
    }
}

/// Whether both states hold values that are the same by identity.
pub(crate) fn same_value(prev: Option<&CellState>, next: &CellState) -> bool {
    match (prev.map(|state| &state.outcome), &next.outcome) {
        (Some(Outcome::Value(left)), Outcome::Value(right)) => left.same(right),
        _ => false,
    }
}

/// Whether both states hold the same error instance.
pub(crate) fn same_error(prev: Option<&CellState>, next: &CellState) -> bool {
    match (prev.map(|state| &state.outcome), &next.outcome) {
        (Some(Outcome::Error(left)), Outcome::Error(right)) => left.ptr_eq(right),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_state(value: i32) -> StateRef {
        CellState::new(empty_dependencies(), Outcome::Value(AnyValue::plain(value)))
    }

    #[test]
    fn cell_ids_are_unique() {
        let id1 = CellId::new();
        let id2 = CellId::new();
        assert_ne!(id1, id2);
        assert!(id2.raw() > id1.raw());
    }

    #[test]
    fn plain_values_compare_by_equality() {
        let a = AnyValue::plain(3);
        let b = AnyValue::plain(3);
        let c = AnyValue::plain(4);
        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert!(a.as_pending().is_none());
    }

    #[test]
    fn values_of_different_types_differ() {
        let a = AnyValue::plain(3i32);
        let b = AnyValue::plain(3i64);
        assert!(!a.same(&b));
    }

    #[test]
    fn downcast_returns_the_stored_type() {
        let value = AnyValue::plain(String::from("hello"));
        assert_eq!(value.downcast::<String>().as_deref(), Some("hello"));
        assert!(value.downcast::<i32>().is_none());
    }

    #[test]
    fn same_value_requires_values_on_both_sides() {
        let left = value_state(1);
        let right = value_state(1);
        let error = CellState::new(empty_dependencies(), Outcome::Error(CellError::msg("x")));

        assert!(same_value(Some(&left), &right));
        assert!(!same_value(None, &right));
        assert!(!same_value(Some(&error), &right));
        assert!(!same_value(Some(&left), &error));
    }

    #[test]
    fn same_error_is_identity() {
        let error = CellError::msg("x");
        let left = CellState::new(empty_dependencies(), Outcome::Error(error.clone()));
        let right = CellState::new(empty_dependencies(), Outcome::Error(error));
        let other = CellState::new(empty_dependencies(), Outcome::Error(CellError::msg("x")));

        assert!(same_error(Some(&left), &right));
        assert!(!same_error(Some(&left), &other));
    }

    #[test]
    fn state_value_reraises_errors() {
        let state = CellState::new(empty_dependencies(), Outcome::Error(CellError::msg("bad")));
        let error = state.value().unwrap_err();
        assert_eq!(error.to_string(), "bad");
    }
}
