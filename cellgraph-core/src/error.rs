//! Error Types
//!
//! Every fallible operation in the store returns [`CellError`]. A cell's
//! read function that fails has its error captured as the cell's state and
//! re-raised on every later read, so the error must be cheap to clone and
//! comparable by identity. Both come from keeping the [`ErrorKind`] behind
//! an `Arc`.

use std::fmt;
use std::sync::Arc;

/// The different ways a cell operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// `write` was called on a cell without write capability.
    #[error("the cell {cell} is not writable")]
    NotWritable { cell: String },

    /// A cell tried to write its own value but has no initial value.
    #[error("the cell {cell} has no initial value and cannot write to itself")]
    NoInitialValue { cell: String },

    /// `Setter::set` was pointed at the cell that owns the setter.
    #[error("the cell {cell} must use `set_self` to write its own value")]
    SelfWriteThroughSet { cell: String },

    /// The stored value did not have the type the handle expected.
    #[error("the cell {cell} holds a value of an unexpected type")]
    TypeMismatch { cell: String },

    /// The store backing a getter, setter or hook has been dropped.
    #[error("the store has been dropped")]
    StoreDropped,

    /// A pending value was abandoned before it produced a result.
    #[error("the pending value of {cell} was cancelled")]
    Cancelled { cell: String },

    /// A free-form failure raised by a cell's own logic.
    #[error("{0}")]
    Message(String),

    /// Any other error raised by a cell's own logic.
    #[error(transparent)]
    Source(Box<dyn std::error::Error + Send + Sync>),
}

/// A cloneable, identity-comparable error.
#[derive(Clone)]
pub struct CellError(Arc<ErrorKind>);

impl CellError {
    pub fn new(kind: ErrorKind) -> Self {
        Self(Arc::new(kind))
    }

    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Message(message.into()))
    }

    /// Wrap an arbitrary error raised by cell logic.
    pub fn source<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorKind::Source(Box::new(error)))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Whether both errors are the same error instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn not_writable(cell: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotWritable {
            cell: cell.to_string(),
        })
    }

    pub(crate) fn no_initial_value(cell: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NoInitialValue {
            cell: cell.to_string(),
        })
    }

    pub(crate) fn self_write_through_set(cell: impl fmt::Display) -> Self {
        Self::new(ErrorKind::SelfWriteThroughSet {
            cell: cell.to_string(),
        })
    }

    pub(crate) fn type_mismatch(cell: impl fmt::Display) -> Self {
        Self::new(ErrorKind::TypeMismatch {
            cell: cell.to_string(),
        })
    }

    pub(crate) fn store_dropped() -> Self {
        Self::new(ErrorKind::StoreDropped)
    }

    pub(crate) fn cancelled(cell: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Cancelled {
            cell: cell.to_string(),
        })
    }
}

impl fmt::Debug for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for CellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorKind::Source(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<ErrorKind> for CellError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let error = CellError::msg("boom");
        let clone = error.clone();
        assert!(error.ptr_eq(&clone));
        assert!(!error.ptr_eq(&CellError::msg("boom")));
    }

    #[test]
    fn not_writable_names_the_cell() {
        let error = CellError::not_writable("DerivedCell:Cell<7>");
        assert_eq!(
            error.to_string(),
            "the cell DerivedCell:Cell<7> is not writable"
        );
        assert!(matches!(error.kind(), ErrorKind::NotWritable { .. }));
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let error = CellError::source(io);
        assert_eq!(error.to_string(), "disk");
        assert!(std::error::Error::source(&error).is_some());
    }
}
