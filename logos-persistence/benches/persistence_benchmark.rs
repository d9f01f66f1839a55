use criterion::{criterion_group, criterion_main, Criterion};
use logos_persistence::engine;
use logos_persistence::storage::fragment;
use logos_persistence::{DocumentStore, StoreConfig};
use std::hint::black_box;
use uuid::Uuid;
use yrs::{Doc, GetString, Text, Transact, WriteTxn};

/// Produce `count` single-character edits as v1 updates.
fn make_edits(count: usize) -> Vec<Vec<u8>> {
    let doc = Doc::new();
    (0..count)
        .map(|i| {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, if i % 2 == 0 { "a" } else { "b" });
            txn.encode_update_v1()
        })
        .collect()
}

fn bench_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("logos_bench_append_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let handle = store.open_document("bench").unwrap();
    let fragment = make_edits(1).remove(0);

    c.bench_function("append_single_edit", |b| {
        b.iter(|| {
            black_box(store.append(&handle, black_box(&fragment)).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_read_all_500(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("logos_bench_read_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let handle = store.open_document("bench").unwrap();
    for edit in make_edits(500) {
        store.append(&handle, &edit).unwrap();
    }

    c.bench_function("read_all_500_entries", |b| {
        b.iter(|| {
            black_box(store.read_all(&handle).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_merge_500(c: &mut Criterion) {
    let edits = make_edits(500);

    c.bench_function("merge_500_fragments", |b| {
        b.iter(|| {
            black_box(engine::merge_fragments(black_box(&edits)).unwrap());
        })
    });
}

fn bench_fragment_framing(c: &mut Criterion) {
    let snapshot = engine::merge_fragments(&make_edits(1000)).unwrap();
    let framed = fragment::encode(&snapshot);

    c.bench_function("frame_snapshot", |b| {
        b.iter(|| black_box(fragment::encode(black_box(&snapshot))))
    });
    c.bench_function("unframe_snapshot", |b| {
        b.iter(|| black_box(fragment::decode(1, black_box(&framed)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_append,
    bench_read_all_500,
    bench_merge_500,
    bench_fragment_framing,
);

criterion_main!(benches);
