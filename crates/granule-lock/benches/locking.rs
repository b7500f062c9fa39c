use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use granule_common::ResourceName;
use granule_lock::{ensure_sufficient, LockManager, LockMode, Transaction};

fn bench_acquire_release(c: &mut Criterion) {
    let lm = Arc::new(LockManager::new());
    let txn = Transaction::new_handle(1u64);
    let name = ResourceName::root("database").child("table1");

    c.bench_function("acquire_release_uncontended", |b| {
        b.iter(|| {
            lm.acquire(&txn, &name, LockMode::Exclusive).expect("grant");
            lm.release(&txn, &name).expect("release");
        });
    });
}

fn bench_declarative_page_write(c: &mut Criterion) {
    let lm = Arc::new(LockManager::new());
    let txn = Transaction::new_handle(1u64);
    let db = lm.database_context();
    let table = db.child_context("table1");
    let page = table.child_context("page1");

    c.bench_function("ensure_sufficient_page_exclusive", |b| {
        b.iter(|| {
            ensure_sufficient(&txn, &page, LockMode::Exclusive);
            page.release(&txn).expect("release");
            table.release(&txn).expect("release");
            db.release(&txn).expect("release");
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_declarative_page_write);
criterion_main!(benches);
