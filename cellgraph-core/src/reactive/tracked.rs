//! Tracked Values
//!
//! A [`Tracked<T>`] is an eventually-resolved cell value: a cloneable future
//! that remembers its outcome once it settles, so any number of readers can
//! await the same computation.
//!
//! # How the store uses it
//!
//! When a cell produces a tracked value the store does not keep it as is. It
//! installs a fresh wrapper whose *origin* is the handle the cell returned.
//! Two wrappers are equal when their origins are equal, so a cell that hands
//! back the same handle twice is recognised as unchanged. A handle built from
//! a future is only equal to its own clones.
//!
//! A wrapper can be *superseded* by a newer value of the same cell. If it has
//! not settled yet it starts following the replacement: everyone awaiting the
//! old wrapper observes the replacement's outcome, and the old source future
//! is dropped. Abort handles handed out through the read options fire at the
//! same time.
//!
//! # Driving
//!
//! A tracked value makes progress when it is polled. The store may spawn a
//! driver task on the ambient tokio runtime; otherwise whoever awaits the
//! value drives it. Several tasks may await one value: the first one polls
//! the source future and the others are woken when it settles.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures_util::future::{AbortHandle, AbortRegistration, BoxFuture, FutureExt};
use futures_util::task::{noop_waker_ref, waker, ArcWake};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::CellError;
use crate::graph::node::AnyValue;

/// A callback attached to a tracked value.
pub(crate) type Hook = Box<dyn FnOnce() + Send>;

/// Where a tracked value is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

fn next_tracked_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A shareable, eventually-resolved value.
///
/// # Example
///
/// ```rust,ignore
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// let value = Tracked::new(async move { rx.await.map_err(CellError::source) });
///
/// tx.send(5).unwrap();
/// assert_eq!(value.clone().await.unwrap(), 5);
/// assert_eq!(value.status(), Status::Fulfilled);
/// ```
pub struct Tracked<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    id: u64,
    /// The handle this one wraps; `None` for handles built from a future.
    origin: Option<u64>,
    wakers: Arc<WakerList>,
    state: Mutex<State<T>>,
}

enum Progress<T> {
    Running,
    Done(Result<T, CellError>),
    Following(Tracked<T>),
}

struct State<T> {
    progress: Progress<T>,
    source: Option<BoxFuture<'static, Result<T, CellError>>>,
    on_settle: SmallVec<[Hook; 1]>,
    on_cancel: SmallVec<[Hook; 1]>,
}

/// Tasks waiting for a tracked value to settle.
///
/// The list doubles as the waker handed to the source future, so whichever
/// task happens to poll the source, every waiter is woken.
#[derive(Default)]
struct WakerList(Mutex<Vec<Waker>>);

impl WakerList {
    fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|known| known.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.0.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

impl ArcWake for WakerList {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wake_all();
    }
}

impl<T> Tracked<T>
where
    T: Clone + Send + 'static,
{
    /// Track the outcome of a future.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, CellError>> + Send + 'static,
    {
        Self::build(None, Progress::Running, Some(future.boxed()))
    }

    /// An already fulfilled value.
    pub fn ready(value: T) -> Self {
        Self::build(None, Progress::Done(Ok(value)), None)
    }

    /// An already rejected value.
    pub fn failed(error: CellError) -> Self {
        Self::build(None, Progress::Done(Err(error)), None)
    }

    fn build(
        origin: Option<u64>,
        progress: Progress<T>,
        source: Option<BoxFuture<'static, Result<T, CellError>>>,
    ) -> Self {
        let id = next_tracked_id();
        Self {
            inner: Arc::new(Inner {
                id,
                origin,
                wakers: Arc::default(),
                state: Mutex::new(State {
                    progress,
                    source,
                    on_settle: SmallVec::new(),
                    on_cancel: SmallVec::new(),
                }),
            }),
        }
    }

    /// A new handle that settles together with `self` and has `self` as its
    /// origin.
    pub(crate) fn wrapped(&self) -> Self {
        let source = self.clone();
        Self::build(Some(self.inner.id), Progress::Running, Some(source.boxed()))
    }

    /// The current status, after giving the value a chance to make progress.
    pub fn status(&self) -> Status {
        self.advance();
        self.current_status()
    }

    /// The outcome if the value has settled.
    pub fn peek(&self) -> Option<Result<T, CellError>> {
        self.advance();
        let next = {
            let state = self.inner.state.lock();
            match &state.progress {
                Progress::Running => return None,
                Progress::Done(result) => return Some(result.clone()),
                Progress::Following(next) => next.clone(),
            }
        };
        next.peek()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    fn current_status(&self) -> Status {
        let next = {
            let state = self.inner.state.lock();
            match &state.progress {
                Progress::Running => return Status::Pending,
                Progress::Done(Ok(_)) => return Status::Fulfilled,
                Progress::Done(Err(_)) => return Status::Rejected,
                Progress::Following(next) => next.clone(),
            }
        };
        next.current_status()
    }

    fn advance(&self) {
        let mut cx = Context::from_waker(noop_waker_ref());
        let _ = self.poll_settle(&mut cx);
    }

    fn poll_settle(&self, cx: &mut Context<'_>) -> Poll<Result<T, CellError>> {
        loop {
            let mut source = {
                let mut state = self.inner.state.lock();
                match &state.progress {
                    Progress::Done(result) => return Poll::Ready(result.clone()),
                    Progress::Following(next) => {
                        let next = next.clone();
                        drop(state);
                        return next.poll_settle(cx);
                    }
                    Progress::Running => {}
                }

                self.inner.wakers.register(cx.waker());
                match state.source.take() {
                    Some(source) => source,
                    // Someone else is polling the source right now.
                    None => return Poll::Pending,
                }
            };

            let wake_all = waker(self.inner.wakers.clone());
            match source.as_mut().poll(&mut Context::from_waker(&wake_all)) {
                Poll::Ready(result) => {
                    drop(source);
                    self.settle(result);
                }
                Poll::Pending => {
                    let mut state = self.inner.state.lock();
                    if matches!(state.progress, Progress::Running) {
                        state.source = Some(source);
                        return Poll::Pending;
                    }
                    // Superseded while we were polling.
                    drop(state);
                    drop(source);
                }
            }
        }
    }

    fn settle(&self, result: Result<T, CellError>) {
        let (on_settle, on_cancel) = {
            let mut state = self.inner.state.lock();
            if !matches!(state.progress, Progress::Running) {
                return;
            }
            state.progress = Progress::Done(result);
            (
                std::mem::take(&mut state.on_settle),
                std::mem::take(&mut state.on_cancel),
            )
        };
        drop(on_cancel);

        self.inner.wakers.wake_all();
        for hook in on_settle {
            hook();
        }
    }

    /// Replace an unsettled value and fire its cancel hooks.
    ///
    /// With no replacement only the cancel hooks run and the value keeps
    /// waiting for its source.
    fn supersede(&self, replacement: Option<Progress<T>>) {
        let (on_cancel, source, on_settle) = {
            let mut state = self.inner.state.lock();
            let on_cancel = std::mem::take(&mut state.on_cancel);
            match replacement {
                Some(progress) if matches!(state.progress, Progress::Running) => {
                    state.progress = progress;
                    (
                        on_cancel,
                        state.source.take(),
                        std::mem::take(&mut state.on_settle),
                    )
                }
                _ => (on_cancel, None, SmallVec::new()),
            }
        };
        drop(source);
        drop(on_settle);

        self.inner.wakers.wake_all();
        for hook in on_cancel {
            hook();
        }
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Wrappers are equal when they wrap the same handle. Other handles are
/// equal only to their own clones, never to a wrapper.
impl<T> PartialEq for Tracked<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.inner.origin, other.inner.origin) {
            (Some(origin), Some(other_origin)) => origin == other_origin,
            (None, None) => self.inner.id == other.inner.id,
            _ => false,
        }
    }
}

impl<T> Eq for Tracked<T> {}

impl<T> Future for Tracked<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, CellError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_settle(cx)
    }
}

impl<T> fmt::Debug for Tracked<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("status", &self.current_status())
            .finish()
    }
}

/// What a superseded pending value is replaced with.
pub(crate) enum Supersede<'a> {
    Value(&'a AnyValue),
    Error(&'a CellError),
    /// The owning cell was unmounted; there is no replacement.
    Detach,
}

/// The store's type-erased view of a tracked value.
pub(crate) trait PendingValue: Send + Sync {
    fn id(&self) -> u64;

    /// Wrap into a fresh handle whose origin is this value.
    fn wrap(&self) -> AnyValue;

    fn on_settle(&self, hook: Hook);

    fn on_cancel(&self, hook: Hook);

    fn supersede(&self, next: Supersede<'_>);

    /// A future that drives the value to completion.
    fn drive(&self) -> BoxFuture<'static, ()>;
}

impl<T> PendingValue for Tracked<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn wrap(&self) -> AnyValue {
        AnyValue::pending(self.wrapped())
    }

    fn on_settle(&self, hook: Hook) {
        let mut state = self.inner.state.lock();
        if matches!(state.progress, Progress::Running) {
            state.on_settle.push(hook);
        }
    }

    fn on_cancel(&self, hook: Hook) {
        let mut state = self.inner.state.lock();
        if matches!(state.progress, Progress::Running) {
            state.on_cancel.push(hook);
        }
    }

    fn supersede(&self, next: Supersede<'_>) {
        let replacement = match next {
            Supersede::Value(value) => {
                if let Some(tracked) = value.downcast_ref::<Tracked<T>>() {
                    Some(Progress::Following(tracked.clone()))
                } else {
                    value
                        .downcast_ref::<T>()
                        .map(|plain| Progress::Done(Ok(plain.clone())))
                }
            }
            Supersede::Error(error) => Some(Progress::Done(Err(error.clone()))),
            Supersede::Detach => None,
        };
        Tracked::supersede(self, replacement);
    }

    fn drive(&self) -> BoxFuture<'static, ()> {
        let value = self.clone();
        async move {
            let _ = value.await;
        }
        .boxed()
    }
}

/// A cancellation signal handed to a cell's read function.
///
/// The signal fires when the pending value produced by that read is
/// superseded by a newer value or abandoned because the cell unmounted.
#[derive(Debug, Clone)]
pub struct AbortSignal(AbortHandle);

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.0.is_aborted()
    }
}

/// Abort handles requested during one evaluation of a cell.
#[derive(Clone, Default)]
pub(crate) struct AbortSlot(Arc<Mutex<AbortSlotState>>);

#[derive(Default)]
struct AbortSlotState {
    signal: Option<AbortHandle>,
    handles: Vec<AbortHandle>,
    aborted: bool,
}

impl AbortSlot {
    pub(crate) fn signal(&self) -> AbortSignal {
        let mut state = self.0.lock();
        if let Some(handle) = &state.signal {
            return AbortSignal(handle.clone());
        }
        let (handle, _registration) = AbortHandle::new_pair();
        if state.aborted {
            handle.abort();
        }
        state.signal = Some(handle.clone());
        AbortSignal(handle)
    }

    pub(crate) fn register(&self) -> AbortRegistration {
        let (handle, registration) = AbortHandle::new_pair();
        let mut state = self.0.lock();
        if state.aborted {
            handle.abort();
        } else {
            state.handles.push(handle);
        }
        registration
    }

    pub(crate) fn abort(&self) {
        let handles = {
            let mut state = self.0.lock();
            state.aborted = true;
            let mut handles = std::mem::take(&mut state.handles);
            handles.extend(state.signal.clone());
            handles
        };
        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ready_values_are_fulfilled() {
        let value = Tracked::ready(3);
        assert_eq!(value.status(), Status::Fulfilled);
        assert_eq!(value.peek().unwrap().unwrap(), 3);
        assert_eq!(value.now_or_never().unwrap().unwrap(), 3);
    }

    #[test]
    fn failed_values_are_rejected() {
        let value: Tracked<i32> = Tracked::failed(CellError::msg("nope"));
        assert_eq!(value.status(), Status::Rejected);
        assert_eq!(value.peek().unwrap().unwrap_err().to_string(), "nope");
    }

    #[test]
    fn clones_and_wrappers_compare_by_origin() {
        let value = Tracked::ready(1);
        let wrapper = value.wrapped();
        let other_wrapper = value.wrapped();

        assert_eq!(value, value.clone());
        assert_ne!(value, wrapper);
        assert_eq!(wrapper, other_wrapper);
        assert_ne!(Tracked::ready(1), Tracked::ready(1));
    }

    #[test]
    fn raw_handles_never_equal_wrappers() {
        let value = Tracked::ready(1);
        let wrapper = value.wrapped();

        assert_ne!(wrapper, value);
        assert_ne!(value.wrapped().wrapped(), wrapper);
        assert_eq!(wrapper.wrapped(), wrapper.wrapped());
    }

    #[test]
    fn wrapper_settles_with_its_source() {
        let wrapper = Tracked::ready(7).wrapped();
        assert_eq!(wrapper.status(), Status::Fulfilled);
        assert_eq!(wrapper.now_or_never().unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn shared_between_awaiters() {
        let (tx, rx) = tokio::sync::oneshot::channel::<i32>();
        let value = Tracked::new(async move { rx.await.map_err(CellError::source) });

        let first = tokio::spawn(value.clone());
        let second = tokio::spawn(value.clone());
        tokio::task::yield_now().await;
        assert_eq!(value.status(), Status::Pending);

        tx.send(9).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 9);
        assert_eq!(second.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn superseded_value_follows_replacement() {
        let stale: Tracked<i32> = Tracked::new(futures_util::future::pending());
        let waiter = tokio::spawn(stale.clone());
        tokio::task::yield_now().await;

        let replacement = AnyValue::pending(Tracked::ready(2));
        PendingValue::supersede(&stale, Supersede::Value(&replacement));

        assert_eq!(waiter.await.unwrap().unwrap(), 2);
        assert_eq!(stale.status(), Status::Fulfilled);
    }

    #[test]
    fn superseding_runs_cancel_hooks_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let value: Tracked<i32> = Tracked::new(futures_util::future::pending());
        let counter = cancelled.clone();
        PendingValue::on_cancel(
            &value,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        PendingValue::supersede(&value, Supersede::Detach);
        PendingValue::supersede(&value, Supersede::Detach);

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        // Detaching leaves the value waiting on its own source.
        assert_eq!(value.status(), Status::Pending);
    }

    #[test]
    fn settle_hooks_run_on_completion_only() {
        let settled = Arc::new(AtomicUsize::new(0));
        let wrapper = Tracked::ready(1).wrapped();
        let counter = settled.clone();
        PendingValue::on_settle(
            &wrapper,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(settled.load(Ordering::SeqCst), 0);

        assert_eq!(wrapper.status(), Status::Fulfilled);
        assert_eq!(settled.load(Ordering::SeqCst), 1);

        let _ = wrapper.peek();
        assert_eq!(settled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settled_values_ignore_supersede() {
        let value = Tracked::ready(1);
        let replacement = AnyValue::pending(Tracked::ready(2));
        PendingValue::supersede(&value, Supersede::Value(&replacement));
        assert_eq!(value.peek().unwrap().unwrap(), 1);
    }

    #[test]
    fn abort_slot_fires_signal_and_registrations() {
        let slot = AbortSlot::default();
        let signal = slot.signal();
        let registration = slot.register();
        let work = futures_util::future::Abortable::new(
            futures_util::future::pending::<()>(),
            registration,
        );

        assert!(!signal.is_aborted());
        slot.abort();
        assert!(signal.is_aborted());
        assert!(work.now_or_never().unwrap().is_err());

        // Requested after the fact: already aborted.
        assert!(slot.signal().is_aborted());
    }
}
