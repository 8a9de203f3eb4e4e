use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cellgraph_core::{Cell, Store, StoreConfig};

fn store() -> Store {
    Store::with_config(StoreConfig::default().with_diagnostics(false))
}

fn narrow_down(c: &mut Criterion) {
    c.bench_function("narrow_down", |b| {
        b.iter(|| {
            let store = store();
            let cells = (0..1000).map(Cell::state).collect::<Vec<_>>();
            let sum = {
                let cells = cells.clone();
                Cell::derived(move |get| {
                    cells
                        .iter()
                        .map(|cell| get.get(cell))
                        .sum::<Result<i32, _>>()
                })
            };
            assert_eq!(store.read(&sum).unwrap(), 499500);
        });
    });
}

fn deep_update(c: &mut Criterion) {
    c.bench_function("deep_update", |b| {
        let store = store();
        let source = Cell::state(0);
        let mut last = source.reader();
        for _ in 0..200 {
            let prev = last.clone();
            last = Cell::derived(move |get| Ok(get.get(&prev)? + 1));
        }
        let _subscription = store.subscribe(&last, || {});

        let mut next = 0;
        b.iter(|| {
            next += 1;
            store.write(&source, next).unwrap();
            assert_eq!(store.read(&last).unwrap(), next + 200);
        });
    });
}

fn diamond(c: &mut Criterion) {
    c.bench_function("diamond", |b| {
        let store = store();
        let source = Cell::state(0);
        let branches = (0..100)
            .map(|offset| {
                let source = source.clone();
                Cell::derived(move |get| Ok(get.get(&source)? + offset))
            })
            .collect::<Vec<_>>();
        let joined = Cell::derived(move |get| {
            branches
                .iter()
                .map(|branch| get.get(branch))
                .sum::<Result<i32, _>>()
        });
        let _subscription = store.subscribe(&joined, || {});

        let mut next = 0;
        b.iter(|| {
            next += 1;
            store.write(&source, next).unwrap();
            black_box(store.read(&joined).unwrap());
        });
    });
}

fn unmounted_reads(c: &mut Criterion) {
    c.bench_function("unmounted_reads", |b| {
        let store = store();
        let source = Cell::state(1);
        let doubled = {
            let source = source.clone();
            Cell::derived(move |get| Ok(get.get(&source)? * 2))
        };

        b.iter(|| black_box(store.read(&doubled).unwrap()));
    });
}

criterion_group!(benches, narrow_down, deep_update, diamond, unmounted_reads);
criterion_main!(benches);
