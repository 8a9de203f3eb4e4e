//! Cell Handles
//!
//! A [`Cell`] is an addressable unit of state or derived computation. The
//! handle itself holds no value: values live in a [`Store`](super::Store),
//! keyed by the cell's identity, so the same cell can be used with any
//! number of independent stores.
//!
//! # Capability contract
//!
//! Every cell is backed by a [`CellLogic`] implementation. The store only
//! ever talks to that contract:
//!
//! - `read` computes the cell's value from other cells
//! - `write` (optional) reacts to a write by setting other cells
//! - `initial_value` (optional) is what a cell sees when it reads itself
//!   before it has any state
//!
//! The built-in cell shapes (state, derived, writable, write-only) are thin
//! implementations of this trait. Custom kinds plug in through [`Cell::from_logic`].
//!
//! # Type erasure
//!
//! The store keeps cells of every value type side by side, so each cell is
//! stored behind the object-safe [`ErasedLogic`] trait. The typed `Cell`
//! handle restores the types on the way out.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use crate::error::CellError;
use crate::graph::node::AnyValue;
use crate::graph::CellId;

use super::context::{Getter, ReadOptions, ReadScope, SetSelf, Setter};
use super::store::WeakStore;
use super::tracked::Tracked;

/// Cleanup returned by an on-mount hook, run when the cell unmounts.
pub type OnUnmount = Box<dyn FnOnce() + Send>;

pub(crate) type OnMountHook =
    Box<dyn Fn(&WeakStore, &CellRef) -> Option<OnUnmount> + Send + Sync>;

pub(crate) type CellRef = Arc<CellNode>;

/// What the store knows about a cell, independent of its value type.
pub(crate) struct CellNode {
    id: CellId,
    kind: &'static str,
    label: OnceLock<String>,
    logic: Box<dyn ErasedLogic>,
    on_mount: OnceLock<OnMountHook>,
}

impl CellNode {
    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    pub(crate) fn logic(&self) -> &dyn ErasedLogic {
        &*self.logic
    }

    pub(crate) fn on_mount(&self) -> Option<&OnMountHook> {
        self.on_mount.get()
    }

    fn label(&self) -> String {
        match self.label.get() {
            Some(label) => label.clone(),
            None => format!("Cell<{}>", self.id.raw()),
        }
    }
}

impl fmt::Display for CellNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.label())
    }
}

impl fmt::Debug for CellNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label())
            .finish()
    }
}

/// The behaviour behind a cell.
///
/// # Example
///
/// ```rust,ignore
/// struct Doubled(Cell<i32, Update<i32>>);
///
/// impl CellLogic for Doubled {
///     type Value = i32;
///     type Args = ();
///     type Output = ();
///
///     fn read(&self, get: &Getter, _: &Setter, _: &ReadOptions) -> Result<i32, CellError> {
///         Ok(get.get(&self.0)? * 2)
///     }
/// }
///
/// let doubled = Cell::from_logic(Doubled(count.clone()));
/// ```
pub trait CellLogic: Send + Sync + 'static {
    type Value: Clone + PartialEq + Send + Sync + 'static;
    type Args: Send + 'static;
    type Output: Send + 'static;

    /// Short name of the kind, used in diagnostics.
    fn kind(&self) -> &'static str {
        "Cell"
    }

    fn read(
        &self,
        get: &Getter,
        set: &Setter,
        options: &ReadOptions<Self::Args, Self::Output>,
    ) -> Result<Self::Value, CellError>;

    /// Only called when [`is_writable`](Self::is_writable) returns `true`.
    fn write(
        &self,
        get: &Getter,
        set: &Setter,
        args: Self::Args,
    ) -> Result<Self::Output, CellError> {
        let _ = (get, set, args);
        Err(CellError::msg("this cell kind does not implement write"))
    }

    fn is_writable(&self) -> bool {
        false
    }

    /// The value a cell sees when it reads itself before it has a state.
    fn initial_value(&self) -> Option<Self::Value> {
        None
    }
}

/// Object-safe form of [`CellLogic`].
pub(crate) trait ErasedLogic: Send + Sync {
    fn read(&self, get: &Getter, set: &Setter, scope: &ReadScope) -> Result<AnyValue, CellError>;

    fn write(
        &self,
        cell: &CellNode,
        get: &Getter,
        set: &Setter,
        args: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CellError>;

    fn is_writable(&self) -> bool;

    fn initial_value(&self) -> Option<AnyValue>;

    /// Erase a value of this cell's value type.
    fn erase(&self, value: Box<dyn Any + Send>) -> Option<AnyValue>;
}

struct Erased<L: CellLogic> {
    logic: L,
    erase: fn(L::Value) -> AnyValue,
}

impl<L: CellLogic> ErasedLogic for Erased<L> {
    fn read(&self, get: &Getter, set: &Setter, scope: &ReadScope) -> Result<AnyValue, CellError> {
        let options = ReadOptions::new(scope.clone());
        self.logic.read(get, set, &options).map(self.erase)
    }

    fn write(
        &self,
        cell: &CellNode,
        get: &Getter,
        set: &Setter,
        args: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CellError> {
        let args = args
            .downcast::<L::Args>()
            .map_err(|_| CellError::type_mismatch(cell))?;
        let output = self.logic.write(get, set, *args)?;
        Ok(Box::new(output))
    }

    fn is_writable(&self) -> bool {
        self.logic.is_writable()
    }

    fn initial_value(&self) -> Option<AnyValue> {
        self.logic.initial_value().map(self.erase)
    }

    fn erase(&self, value: Box<dyn Any + Send>) -> Option<AnyValue> {
        value
            .downcast::<L::Value>()
            .ok()
            .map(|value| (self.erase)(*value))
    }
}

/// A typed handle to a cell.
///
/// - `V`: the value type
/// - `A`: the argument type accepted by `write`
/// - `R`: the result type returned by `write`
///
/// Handles are cheap to clone; clones share the identity of the original.
pub struct Cell<V, A = (), R = ()> {
    node: CellRef,
    _marker: PhantomData<fn(A) -> (V, R)>,
}

impl<V, A, R> Cell<V, A, R>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    /// Build a cell from a custom capability implementation.
    pub fn from_logic<L>(logic: L) -> Self
    where
        L: CellLogic<Value = V, Args = A, Output = R>,
    {
        Self::with_eraser(logic, AnyValue::plain::<V>)
    }

    pub(crate) fn with_eraser<L>(logic: L, erase: fn(V) -> AnyValue) -> Self
    where
        L: CellLogic<Value = V, Args = A, Output = R>,
    {
        let node = CellNode {
            id: CellId::new(),
            kind: logic.kind(),
            label: OnceLock::new(),
            logic: Box::new(Erased { logic, erase }),
            on_mount: OnceLock::new(),
        };
        Self::from_node(Arc::new(node))
    }

    /// Install a hook that runs each time the cell becomes mounted.
    ///
    /// The hook receives a setter bound to the cell and may return a cleanup
    /// to run on unmount. Hooks only run for writable cells. A cell has at
    /// most one hook; later calls are ignored.
    pub fn on_mount<F>(self, hook: F) -> Self
    where
        F: Fn(SetSelf<A, R>) -> Option<OnUnmount> + Send + Sync + 'static,
    {
        let erased: OnMountHook =
            Box::new(move |store: &WeakStore, cell: &CellRef| {
                hook(SetSelf::mounted(store.clone(), cell.clone()))
            });
        if self.node.on_mount.set(erased).is_err() {
            tracing::warn!(cell = %self.node, "on_mount hook already installed");
        }
        self
    }
}

impl<U, A, R> Cell<Tracked<U>, A, R>
where
    U: Clone + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    /// Build a cell whose values go through the store's async bridge.
    pub fn from_async_logic<L>(logic: L) -> Self
    where
        L: CellLogic<Value = Tracked<U>, Args = A, Output = R>,
    {
        Self::with_eraser(logic, AnyValue::pending::<U>)
    }
}

impl<V, A, R> Cell<V, A, R> {
    pub(crate) fn from_node(node: CellRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn node(&self) -> &CellRef {
        &self.node
    }

    pub fn id(&self) -> CellId {
        self.node.id
    }

    /// The debug label, `Cell<N>` unless renamed.
    pub fn name(&self) -> String {
        self.node.label()
    }

    /// Set the debug label. A cell is named at most once.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        let _ = self.node.label.set(name.into());
        self
    }

    /// A read-only view of the same cell.
    pub fn reader(&self) -> Cell<V> {
        Cell::from_node(self.node.clone())
    }
}

impl<V, A, R> Clone for Cell<V, A, R> {
    fn clone(&self) -> Self {
        Self::from_node(self.node.clone())
    }
}

impl<V, A, R> PartialEq for Cell<V, A, R> {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id
    }
}

impl<V, A, R> Eq for Cell<V, A, R> {}

impl<V, A, R> Hash for Cell<V, A, R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
    }
}

impl<V, A, R> fmt::Debug for Cell<V, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.node, f)
    }
}

impl<V, A, R> fmt::Display for Cell<V, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.node, f)
    }
}

/// A value compared by reference instead of by content.
///
/// Cells compare values with `PartialEq` to decide whether anything changed.
/// Wrapping a value in `Shared` makes every fresh allocation count as a
/// change, even when the contents are equal.
pub struct Shared<T: ?Sized>(Arc<T>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl<T: ?Sized> Shared<T> {
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.0, &other.0)
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        Shared::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Eq for Shared<T> {}

impl<T: ?Sized> From<Arc<T>> for Shared<T> {
    fn from(value: Arc<T>) -> Self {
        Self(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&&*self.0).finish()
    }
}
