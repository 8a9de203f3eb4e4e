//! Integration Tests for Async Cells
//!
//! Externally resolved work is modelled with oneshot channels: a cell's
//! future waits on a receiver and the test decides when to send.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use cellgraph_core::{Cell, CellError, ErrorKind, Status, Store, StoreConfig, Tracked, Update};

/// Pending gates a test can open in bulk.
#[derive(Clone, Default)]
struct Gates(Arc<Mutex<Vec<oneshot::Sender<()>>>>);

impl Gates {
    /// A future that completes once the gate is opened.
    fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.0.lock().push(tx);
        async move {
            let _ = rx.await;
        }
    }

    fn open_all(&self) {
        for gate in std::mem::take(&mut *self.0.lock()) {
            let _ = gate.send(());
        }
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// A recomputed async cell resolves with the latest input.
#[tokio::test]
async fn async_cell_updates_after_delay() {
    let gates = Gates::default();
    let count = Cell::state(0);
    let delayed = {
        let (count, gates) = (count.clone(), gates.clone());
        Cell::derived_async(move |get| {
            let value = get.get(&count);
            let gate = gates.wait();
            async move {
                gate.await;
                value
            }
        })
    };

    let store = Store::new();
    store.read(&delayed).unwrap();
    store.write(&count, 1).unwrap();
    gates.open_all();
    tokio::task::yield_now().await;

    let pending = store.read(&delayed).unwrap();
    gates.open_all();
    assert_eq!(pending.await.unwrap(), 1);
}

/// Writing a new pending value redirects readers of the old one.
#[tokio::test]
async fn writing_overrides_a_pending_value() {
    let store = Store::new();
    let count = Cell::pending_state(Tracked::ready(0));

    store
        .write(&count, Tracked::new(futures_util::future::pending()))
        .unwrap();
    let pending = store.read(&count).unwrap();
    assert_eq!(pending.status(), Status::Pending);

    store.write(&count, Tracked::ready(1)).unwrap();
    assert_eq!(pending.await.unwrap(), 1);
}

/// Dependencies read after an await are tracked once the value settles.
#[tokio::test]
async fn dependencies_after_await_are_tracked() {
    let gates = Gates::default();
    let count = Cell::state(0);
    let delayed = {
        let (count, gates) = (count.clone(), gates.clone());
        Cell::derived_async(move |get| {
            let get = get.clone();
            let count = count.clone();
            let gate = gates.wait();
            async move {
                gate.await;
                get.get(&count)
            }
        })
    };
    let derived = {
        let delayed = delayed.clone();
        Cell::derived_async(move |get| {
            let inner = get.get(&delayed);
            async move { inner?.await }
        })
    };

    let store = Store::new();
    let last = Arc::new(Mutex::new(store.read(&derived).unwrap()));
    let _subscription = {
        let (store_handle, last, derived) = (store.clone(), last.clone(), derived.clone());
        store.subscribe(&derived.clone(), move || {
            *last.lock() = store_handle.read(&derived).unwrap();
        })
    };

    for expected in 1..=3 {
        store.write(&count, expected).unwrap();
        gates.open_all();
        let current = last.lock().clone();
        assert_eq!(current.await.unwrap(), expected);
    }
}

/// Re-installing the same pending value is not a change.
#[test]
fn same_pending_value_does_not_notify() {
    let promise = Tracked::ready(());
    let promise_cell = Cell::pending_state(promise.clone());
    let runs = Arc::new(AtomicI32::new(0));
    let derived = {
        let (promise_cell, runs) = (promise_cell.clone(), runs.clone());
        Cell::derived(move |get| {
            runs.fetch_add(1, Ordering::SeqCst);
            get.get(&promise_cell)
        })
    };

    let store = Store::new();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let promise_calls = Arc::new(AtomicI32::new(0));
    let derived_calls = Arc::new(AtomicI32::new(0));
    let _promise_sub = {
        let calls = promise_calls.clone();
        store.subscribe(&promise_cell, move || {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    let _derived_sub = {
        let calls = derived_calls.clone();
        store.subscribe(&derived, move || {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.read(&promise_cell).unwrap();
    store.read(&derived).unwrap();
    for _ in 0..2 {
        store.write(&promise_cell, promise.clone()).unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(promise_calls.load(Ordering::SeqCst), 0);
    assert_eq!(derived_calls.load(Ordering::SeqCst), 0);
}

/// Switching from a handle to the store's wrapper of that handle is a change.
#[test]
fn wrapper_of_a_handle_is_a_new_value() {
    let promise = Tracked::ready(1);
    let source = Cell::pending_state(promise.clone());
    let use_source = Cell::state(false);
    let picked = {
        let (source, use_source) = (source.clone(), use_source.clone());
        Cell::derived(move |get| {
            if get.get(&use_source)? {
                get.get(&source)
            } else {
                Ok(promise.clone())
            }
        })
    };

    let store = Store::new();
    let calls = Arc::new(AtomicI32::new(0));
    let _subscription = {
        let calls = calls.clone();
        store.subscribe(&picked, move || {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };

    store.write(&use_source, true).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.read(&picked).unwrap(), store.read(&source).unwrap());
}

/// A setter used after an await opens its own transaction and notifies
/// listeners.
#[tokio::test]
async fn async_write_flushes_indirect_sets() {
    let store = Store::new();
    let value = Cell::state("initial".to_string()).with_name("InitialValue");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let (reader, value, seen) = (store.clone(), value.clone(), seen.clone());
        store.subscribe(&value.clone(), move || {
            seen.lock().push(reader.read(&value).unwrap());
        })
    };

    let indirect = {
        let value = value.clone();
        Cell::write_only((), move |_get, set, ()| set.set(&value, "next".to_string()))
            .with_name("indirectCell")
    };
    let action = {
        let indirect = indirect.clone();
        Cell::write_only((), move |_get, set, ()| {
            let (set, indirect) = (set.clone(), indirect.clone());
            Ok(Tracked::new(async move {
                tokio::task::yield_now().await;
                set.set(&indirect, ())
            }))
        })
        .with_name("actionCell")
    };

    store.write(&action, ()).unwrap().await.unwrap();
    assert_eq!(*seen.lock(), vec!["next".to_string()]);
}

/// A superseded computation sees its abort signal fire.
#[tokio::test]
async fn superseded_computation_is_aborted() {
    let gates = Gates::default();
    let count = Cell::state(0);
    let signals = Arc::new(Mutex::new(Vec::new()));
    let slow = {
        let (count, gates, signals) = (count.clone(), gates.clone(), signals.clone());
        Cell::derived_async_with(move |get, options| {
            signals.lock().push(options.signal());
            let value = get.get(&count);
            let gate = gates.wait();
            async move {
                gate.await;
                value
            }
        })
    };

    let store = Store::new();
    let first = store.read(&slow).unwrap();
    store.write(&count, 1).unwrap();
    let second = store.read(&slow).unwrap();

    {
        let signals = signals.lock();
        assert_eq!(signals.len(), 2);
        assert!(signals[0].is_aborted());
        assert!(!signals[1].is_aborted());
    }

    gates.open_all();
    assert_eq!(second.await.unwrap(), 1);
    // The first reader follows the replacement.
    assert_eq!(first.await.unwrap(), 1);
}

/// Unmounting a cell with an unsettled value aborts its computation.
#[tokio::test]
async fn unmount_aborts_pending_computation() {
    let gates = Gates::default();
    let signal = Arc::new(Mutex::new(None));
    let slow = {
        let (gates, signal) = (gates.clone(), signal.clone());
        Cell::derived_async_with(move |_get, options| {
            *signal.lock() = Some(options.signal());
            let work = options.abortable(gates.wait());
            async move {
                work.await?;
                Ok::<_, CellError>(5)
            }
        })
    };

    let store = Store::new();
    let subscription = store.subscribe(&slow, || {});
    let pending = store.read(&slow).unwrap();
    assert_eq!(gates.len(), 1);

    subscription.unsubscribe();
    let signal = signal.lock().take().expect("read ran");
    assert!(signal.is_aborted());

    // The source sees the abort and settles with a cancellation error.
    let error = pending.await.unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::Cancelled { .. }));
}

/// Errors from async computations surface when awaited.
#[tokio::test]
async fn async_errors_surface_on_await() {
    let store = Store::with_config(StoreConfig::default().with_eager_async(false));
    let failing: Cell<Tracked<i32>> =
        Cell::derived_async(|_get| async { Err(CellError::msg("no data")) });

    let pending = store.read(&failing).unwrap();
    let error = pending.await.unwrap_err();
    assert_eq!(error.to_string(), "no data");
    assert_eq!(store.read(&failing).unwrap().status(), Status::Rejected);
}

/// A pending state cell can be updated from its previous value.
#[tokio::test]
async fn pending_state_updates() {
    let store = Store::new();
    let cell = Cell::pending_state(Tracked::ready(1));

    store
        .write(&cell, Update::with(|_previous: &Tracked<i32>| Tracked::ready(2)))
        .unwrap();
    assert_eq!(store.read(&cell).unwrap().await.unwrap(), 2);
}
