//! Cell Kinds
//!
//! Constructors for the everyday cell shapes. Each one is a small
//! [`CellLogic`] implementation; the store treats them all alike.
//!
//! | Constructor | Reads | Writes |
//! |---|---|---|
//! | [`Cell::state`] | its own value | replaces its own value |
//! | [`Cell::derived`] | other cells | not writable |
//! | [`Cell::writable`] | other cells | custom logic |
//! | [`Cell::write_only`] | its own value | custom logic |
//! | [`Cell::lazy`] | a cell chosen on first read | not writable |
//!
//! The async variants ([`Cell::pending_state`], [`Cell::derived_async`],
//! [`Cell::derived_async_with`], [`Cell::writable_async`]) hold
//! [`Tracked`] values and go through the store's async bridge.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use crate::error::CellError;

use super::cell::{Cell, CellLogic};
use super::context::{Getter, ReadOptions, Setter};
use super::tracked::Tracked;

/// Argument accepted by state cells.
pub enum Update<V> {
    /// Replace the value.
    Set(V),
    /// Compute the next value from the current one.
    With(Box<dyn FnOnce(&V) -> V + Send>),
}

impl<V> Update<V> {
    pub fn with<F>(update: F) -> Self
    where
        F: FnOnce(&V) -> V + Send + 'static,
    {
        Self::With(Box::new(update))
    }

    fn apply(self, get: &Getter) -> Result<V, CellError>
    where
        V: Clone + 'static,
    {
        match self {
            Self::Set(value) => Ok(value),
            Self::With(update) => {
                let current: V = get.get_self()?;
                Ok(update(&current))
            }
        }
    }
}

impl<V> From<V> for Update<V> {
    fn from(value: V) -> Self {
        Self::Set(value)
    }
}

impl<V: fmt::Debug> fmt::Debug for Update<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set(value) => f.debug_tuple("Set").field(value).finish(),
            Self::With(_) => f.write_str("With(..)"),
        }
    }
}

struct StateLogic<V> {
    initial: V,
    kind: &'static str,
}

impl<V> CellLogic for StateLogic<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = V;
    type Args = Update<V>;
    type Output = ();

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn read(&self, get: &Getter, _: &Setter, _: &ReadOptions<Update<V>>) -> Result<V, CellError> {
        get.get_self()
    }

    fn write(&self, get: &Getter, set: &Setter, args: Update<V>) -> Result<(), CellError> {
        set.set_self(args.apply(get)?)
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn initial_value(&self) -> Option<V> {
        Some(self.initial.clone())
    }
}

type ReadOnly = fn(&Getter, &Setter, ()) -> Result<(), CellError>;

/// A cell computed from other cells, optionally with write logic.
struct ComputedLogic<V, A, R, F, W> {
    read: F,
    write: Option<W>,
    kind: &'static str,
    _marker: PhantomData<fn(A) -> (V, R)>,
}

impl<V, A, R, F, W> ComputedLogic<V, A, R, F, W> {
    fn new(kind: &'static str, read: F, write: Option<W>) -> Self {
        Self {
            read,
            write,
            kind,
            _marker: PhantomData,
        }
    }
}

impl<V, A, R, F, W> CellLogic for ComputedLogic<V, A, R, F, W>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(&Getter, &Setter, &ReadOptions<A, R>) -> Result<V, CellError> + Send + Sync + 'static,
    W: Fn(&Getter, &Setter, A) -> Result<R, CellError> + Send + Sync + 'static,
{
    type Value = V;
    type Args = A;
    type Output = R;

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn read(&self, get: &Getter, set: &Setter, options: &ReadOptions<A, R>) -> Result<V, CellError> {
        (self.read)(get, set, options)
    }

    fn write(&self, get: &Getter, set: &Setter, args: A) -> Result<R, CellError> {
        match &self.write {
            Some(write) => write(get, set, args),
            None => Err(CellError::msg("read-only cells cannot be written")),
        }
    }

    fn is_writable(&self) -> bool {
        self.write.is_some()
    }
}

/// A cell that holds its own value but reacts to writes with custom logic.
struct WriteOnlyLogic<V, A, R, W> {
    initial: V,
    write: W,
    _marker: PhantomData<fn(A) -> R>,
}

impl<V, A, R, W> CellLogic for WriteOnlyLogic<V, A, R, W>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
    W: Fn(&Getter, &Setter, A) -> Result<R, CellError> + Send + Sync + 'static,
{
    type Value = V;
    type Args = A;
    type Output = R;

    fn kind(&self) -> &'static str {
        "WriteOnlyCell"
    }

    fn read(&self, get: &Getter, _: &Setter, _: &ReadOptions<A, R>) -> Result<V, CellError> {
        get.get_self()
    }

    fn write(&self, get: &Getter, set: &Setter, args: A) -> Result<R, CellError> {
        (self.write)(get, set, args)
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn initial_value(&self) -> Option<V> {
        Some(self.initial.clone())
    }
}

/// Forwards to a cell picked by a provider the first time it is read in a
/// store. The choice is remembered per store in a hidden state cell.
struct LazyLogic<V, P> {
    target: Cell<Option<Cell<V>>, Update<Option<Cell<V>>>>,
    provider: P,
}

impl<V, P> CellLogic for LazyLogic<V, P>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    P: Fn(&Getter, &Setter) -> Cell<V> + Send + Sync + 'static,
{
    type Value = V;
    type Args = ();
    type Output = ();

    fn kind(&self) -> &'static str {
        "LazyCell"
    }

    fn read(&self, get: &Getter, set: &Setter, _: &ReadOptions) -> Result<V, CellError> {
        if let Some(target) = get.get(&self.target)? {
            return get.get(&target);
        }

        let target = (self.provider)(get, set);
        set.set(&self.target, Some(target.clone()))?;
        get.get(&target)
    }
}

impl<V> Cell<V, Update<V>>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// A plain state holder.
    pub fn state(initial: V) -> Self {
        Cell::from_logic(StateLogic {
            initial,
            kind: "StateCell",
        })
    }
}

impl<V> Cell<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// A read-only cell computed from other cells.
    pub fn derived<F>(read: F) -> Self
    where
        F: Fn(&Getter) -> Result<V, CellError> + Send + Sync + 'static,
    {
        Cell::from_logic(ComputedLogic::new(
            "DerivedCell",
            move |get: &Getter, _: &Setter, _: &ReadOptions| read(get),
            None::<ReadOnly>,
        ))
    }

    /// Like [`derived`](Self::derived), with access to the setter and read
    /// options.
    pub fn derived_with<F>(read: F) -> Self
    where
        F: Fn(&Getter, &Setter, &ReadOptions) -> Result<V, CellError> + Send + Sync + 'static,
    {
        Cell::from_logic(ComputedLogic::new("DerivedCell", read, None::<ReadOnly>))
    }

    /// A cell that forwards to the cell returned by `provider`. The provider
    /// runs once per store.
    pub fn lazy<P>(provider: P) -> Self
    where
        P: Fn(&Getter, &Setter) -> Cell<V> + Send + Sync + 'static,
    {
        Cell::from_logic(LazyLogic {
            target: Cell::state(None),
            provider,
        })
    }
}

impl<V, A, R> Cell<V, A, R>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    /// A computed cell with custom write logic.
    pub fn writable<F, W>(read: F, write: W) -> Self
    where
        F: Fn(&Getter) -> Result<V, CellError> + Send + Sync + 'static,
        W: Fn(&Getter, &Setter, A) -> Result<R, CellError> + Send + Sync + 'static,
    {
        Cell::from_logic(ComputedLogic::new(
            "WritableCell",
            move |get: &Getter, _: &Setter, _: &ReadOptions<A, R>| read(get),
            Some(write),
        ))
    }

    /// Like [`writable`](Self::writable), with access to the setter and read
    /// options in `read`.
    pub fn writable_with<F, W>(read: F, write: W) -> Self
    where
        F: Fn(&Getter, &Setter, &ReadOptions<A, R>) -> Result<V, CellError> + Send + Sync + 'static,
        W: Fn(&Getter, &Setter, A) -> Result<R, CellError> + Send + Sync + 'static,
    {
        Cell::from_logic(ComputedLogic::new("WritableCell", read, Some(write)))
    }

    /// A cell holding its own value whose writes run custom logic. The logic
    /// updates the value with [`Setter::set_self`].
    pub fn write_only<W>(initial: V, write: W) -> Self
    where
        W: Fn(&Getter, &Setter, A) -> Result<R, CellError> + Send + Sync + 'static,
    {
        Cell::from_logic(WriteOnlyLogic {
            initial,
            write,
            _marker: PhantomData,
        })
    }
}

impl<U> Cell<Tracked<U>, Update<Tracked<U>>>
where
    U: Clone + Send + Sync + 'static,
{
    /// A state holder for eventually-resolved values.
    pub fn pending_state(initial: Tracked<U>) -> Self {
        Cell::from_async_logic(StateLogic {
            initial,
            kind: "PendingStateCell",
        })
    }
}

impl<U> Cell<Tracked<U>>
where
    U: Clone + Send + Sync + 'static,
{
    /// A read-only cell computed asynchronously.
    ///
    /// `read` runs synchronously and returns the future to track. Cells read
    /// before the future is created are dependencies right away; clone the
    /// getter into the future to read more cells after an await.
    pub fn derived_async<F, Fut>(read: F) -> Self
    where
        F: Fn(&Getter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, CellError>> + Send + 'static,
    {
        Cell::from_async_logic(ComputedLogic::new(
            "AsyncDerivedCell",
            move |get: &Getter, _: &Setter, _: &ReadOptions| Ok::<_, CellError>(Tracked::new(read(get))),
            None::<ReadOnly>,
        ))
    }

    /// Like [`derived_async`](Self::derived_async), with access to the read
    /// options (for example the cancellation signal).
    pub fn derived_async_with<F, Fut>(read: F) -> Self
    where
        F: Fn(&Getter, &ReadOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, CellError>> + Send + 'static,
    {
        Cell::from_async_logic(ComputedLogic::new(
            "AsyncDerivedCell",
            move |get: &Getter, _: &Setter, options: &ReadOptions| {
                Ok::<_, CellError>(Tracked::new(read(get, options)))
            },
            None::<ReadOnly>,
        ))
    }
}

impl<U, A, R> Cell<Tracked<U>, A, R>
where
    U: Clone + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    /// An asynchronously computed cell with custom write logic.
    pub fn writable_async<F, Fut, W>(read: F, write: W) -> Self
    where
        F: Fn(&Getter, &ReadOptions<A, R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, CellError>> + Send + 'static,
        W: Fn(&Getter, &Setter, A) -> Result<R, CellError> + Send + Sync + 'static,
    {
        Cell::from_async_logic(ComputedLogic::new(
            "AsyncWritableCell",
            move |get: &Getter, _: &Setter, options: &ReadOptions<A, R>| {
                Ok::<_, CellError>(Tracked::new(read(get, options)))
            },
            Some(write),
        ))
    }
}
