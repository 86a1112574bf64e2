//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tether_engine::{codec, IdentityPolicy, ObjectStateStore, Operation, Record, Value};

fn populated_store(records: usize) -> (ObjectStateStore, Vec<Record>) {
    let store = ObjectStateStore::new(IdentityPolicy::Shared);
    let handles: Vec<_> = (0..records)
        .map(|i| Record::with_id("Post", format!("post_{i}")))
        .collect();
    for record in &handles {
        let identity = store.identity_of(record);
        let _ = store.set_pending_op(&identity, "title", Operation::set("Hello"));
        let _ = store.set_pending_op(&identity, "views", Operation::increment(1));
    }
    (store, handles)
}

fn bench_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("operations");

    group.bench_function("merge_increment", |b| {
        let older = Operation::increment(1);
        let newer = Operation::increment(2);
        b.iter(|| black_box(&newer).merge_with(Some(black_box(&older))))
    });

    group.bench_function("merge_add_unique", |b| {
        let older = Operation::add_unique((0..50).map(Value::from).collect());
        let newer = Operation::add_unique((25..75).map(Value::from).collect());
        b.iter(|| black_box(&newer).merge_with(Some(black_box(&older))))
    });

    group.bench_function("apply_remove", |b| {
        let current = Value::Array((0..200).map(Value::from).collect());
        let op = Operation::remove((0..200).step_by(3).map(Value::from).collect());
        b.iter(|| black_box(&op).apply_detached(Some(black_box(&current))))
    });

    group.finish();
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("set_pending_op", |b| {
        let store = ObjectStateStore::new(IdentityPolicy::Shared);
        let identity = store.identity_of(&Record::with_id("Post", "p1"));
        b.iter(|| store.set_pending_op(&identity, "views", black_box(Operation::increment(1))))
    });

    for layers in [1usize, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::new("estimate_attributes", layers),
            layers,
            |b, &layers| {
                let store = ObjectStateStore::new(IdentityPolicy::Shared);
                let identity = store.identity_of(&Record::with_id("Post", "p1"));
                for i in 0..layers {
                    let _ = store.set_pending_op(&identity, "views", Operation::increment(1));
                    let _ = store.set_pending_op(
                        &identity,
                        &format!("field_{i}"),
                        Operation::set(vec![i as i64]),
                    );
                    store.push_layer(&identity);
                }
                b.iter(|| store.estimate_attributes(black_box(&identity)))
            },
        );
    }

    group.bench_function("dirty_check_1000_records", |b| {
        let (store, handles) = populated_store(1000);
        b.iter(|| {
            handles
                .iter()
                .filter(|record| store.is_dirty(record).unwrap_or(false))
                .count()
        })
    });

    group.bench_function("migrate_identity", |b| {
        let store = ObjectStateStore::new(IdentityPolicy::Shared);
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            let record = Record::new("Post");
            let local = store.identity_of(&record);
            store.get_or_create(&local);
            record.assign_id(format!("post_{id}"));
            store.migrate_identity(&local, &store.identity_of(&record));
        })
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let body = json!({
        "title": "Hello",
        "views": 42,
        "tags": ["a", "b", "c"],
        "author": {"__type": "Pointer", "className": "User", "objectId": "u1"},
        "publishedAt": {"__type": "Date", "iso": "2024-01-01T00:00:00.000Z"},
        "meta": {"nested": {"depth": 2}},
    });

    group.bench_function("decode", |b| b.iter(|| codec::decode(black_box(&body))));

    group.bench_function("encode", |b| {
        let value = codec::decode(&body).unwrap_or(Value::Null);
        b.iter(|| codec::encode(black_box(&value)))
    });

    group.bench_function("fingerprint", |b| {
        let value = Value::Array((0..100).map(Value::from).collect());
        b.iter(|| codec::fingerprint(black_box(&value)))
    });

    group.finish();
}

criterion_group!(benches, bench_operations, bench_store_operations, bench_codec);
criterion_main!(benches);
