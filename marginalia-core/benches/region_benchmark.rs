use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use marginalia_core::{resolve, split, HighlightSpan};
use std::hint::black_box;

/// Dense, heavily overlapping highlights spread over a long document.
fn spans(count: usize) -> Vec<HighlightSpan> {
    (0..count)
        .map(|i| {
            let start = (i * 37) % 50_000;
            HighlightSpan::new(format!("h{i:05}"), start, start + 20 + (i % 400))
        })
        .collect()
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("Region Resolution");

    for count in [100usize, 1_000, 10_000] {
        let input = spans(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("resolve", count), &input, |b, input| {
            b.iter(|| black_box(resolve(black_box(input))))
        });
    }

    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("Boundary Split");

    let regions = resolve(&spans(1_000));
    let boundaries: Vec<usize> = (0..50_000).step_by(120).collect();
    group.throughput(Throughput::Elements(regions.len() as u64));

    group.bench_function("split_1k_highlights", |b| {
        b.iter(|| black_box(split(black_box(&regions), black_box(&boundaries))))
    });

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_split);
criterion_main!(benches);
