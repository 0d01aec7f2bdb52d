use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use marginalia_collab::{AnnotationStore, DocumentStore, SnapshotStore, StoreConfig};
use marginalia_core::{DocumentInfo, HighlightMetadata};
use std::hint::black_box;

const DOC_LEN: usize = 100_000;

fn populated(count: usize) -> AnnotationStore {
    let mut store = AnnotationStore::with_client_id(DocumentInfo::new(DOC_LEN), 1);
    for i in 0..count {
        let start = (i * 53) % (DOC_LEN - 200);
        let tag = ["claim", "evidence", "question"][i % 3];
        store
            .add_highlight(start..start + 10 + i % 150, Some(tag), "bench", HighlightMetadata::default())
            .unwrap();
    }
    store.drain_local_updates();
    store
}

fn bench_add_highlight(c: &mut Criterion) {
    c.bench_function("add_highlight", |b| {
        let mut store = AnnotationStore::new(DocumentInfo::new(DOC_LEN));
        let mut i = 0usize;
        b.iter(|| {
            let start = (i * 31) % (DOC_LEN - 100);
            i += 1;
            black_box(
                store
                    .add_highlight(start..start + 40, Some("claim"), "bench", HighlightMetadata::default())
                    .unwrap(),
            );
        })
    });
}

fn bench_apply_update(c: &mut Criterion) {
    let mut source = AnnotationStore::with_client_id(DocumentInfo::new(DOC_LEN), 7);
    source
        .add_highlight(10..50, Some("claim"), "bench", HighlightMetadata::with_text("quoted"))
        .unwrap();
    let update = source.drain_local_updates().remove(0);

    c.bench_function("apply_update_single_highlight", |b| {
        b.iter(|| {
            let mut replica = AnnotationStore::new(DocumentInfo::new(DOC_LEN));
            black_box(replica.apply_update(black_box(&update)));
        })
    });
}

fn bench_full_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("Full State");

    for count in [100usize, 1_000] {
        let store = populated(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("encode", count), &store, |b, store| {
            b.iter(|| black_box(store.full_state()))
        });

        let state = store.full_state();
        group.bench_with_input(BenchmarkId::new("rehydrate", count), &state, |b, state| {
            b.iter(|| black_box(AnnotationStore::from_snapshot(DocumentInfo::new(DOC_LEN), state)))
        });
    }

    group.finish();
}

fn bench_resolve_from_store(c: &mut Criterion) {
    let store = populated(1_000);
    c.bench_function("spans_and_resolve_1k", |b| {
        b.iter(|| black_box(marginalia_core::resolve(&store.spans())))
    });
}

fn bench_snapshot_save(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let state = populated(1_000).full_state();

    c.bench_function("rocksdb_save_snapshot_1k", |b| {
        b.iter(|| black_box(db.save_snapshot("bench", black_box(&state), Some("bench")).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_add_highlight,
    bench_apply_update,
    bench_full_state,
    bench_resolve_from_store,
    bench_snapshot_save,
);
criterion_main!(benches);
