//! Search benchmarks over a built index.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver_ann::{Dataset, HnswIndex, IndexOptions, Metric, SearchParams};

fn bench_search(c: &mut Criterion) {
    let dataset = Dataset::generate(10_000, 100, 64, 3);
    let opts = IndexOptions::new(64, Metric::L2)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 3).unwrap();

    let mut group = c.benchmark_group("hnsw_search");
    for ef in [10usize, 50, 200] {
        let params = SearchParams::new(ef);
        group.bench_with_input(BenchmarkId::new("ef", ef), &ef, |bench, _| {
            let mut cursor = 0usize;
            bench.iter(|| {
                let query = &dataset.queries[cursor % dataset.queries.len()];
                cursor += 1;
                black_box(index.search(query, 10, params).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
