//! End-to-end scenarios: recall against a brute-force oracle, filtered
//! iteration, snapshot round-trips, and concurrent querying.

use quiver_ann::{
    recall_at_k, BruteForceIndex, ClosureFilter, Dataset, Encoding, FlattenCell, HnswIndex,
    IndexOptions, IteratorContext, LabelId, Metric, OdescentBuilder, OdescentParams, Persistable,
    Quantizer, SearchParams,
};

fn average_recall(index: &HnswIndex, dataset: &Dataset, k: usize, ef: usize) -> f32 {
    let params = SearchParams::new(ef);
    let mut total = 0.0;
    for (query, truth) in dataset.queries.iter().zip(dataset.ground_truth.iter()) {
        let results = index.search(query, k, params).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.label.as_u64()).collect();
        total += recall_at_k(&ids, truth, k);
    }
    total / dataset.queries.len() as f32
}

#[test]
fn scenario_fp32_l2_recall() {
    let mut dataset = Dataset::generate(10_000, 50, 128, 47);
    dataset.compute_ground_truth(10, Metric::L2);

    let opts = IndexOptions::new(128, Metric::L2)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 47).unwrap();

    let recall = average_recall(&index, &dataset, 10, 100);
    assert!(recall >= 0.95, "recall@10 = {recall}");
}

#[test]
fn scenario_sq8_recall() {
    let mut dataset = Dataset::generate(10_000, 50, 128, 47);
    dataset.compute_ground_truth(10, Metric::L2);

    let opts = IndexOptions::new(128, Metric::L2)
        .with_encoding(Encoding::Sq8)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 47).unwrap();

    let recall = average_recall(&index, &dataset, 10, 100);
    assert!(recall >= 0.90, "quantized recall@10 = {recall}");
}

#[test]
fn scenario_odescent_build_and_query() {
    let mut dataset = Dataset::generate(10_000, 50, 128, 47);
    dataset.compute_ground_truth(10, Metric::L2);

    let quantizer = Quantizer::fit(Encoding::Fp32, 128, std::iter::empty()).unwrap();
    let mut cell = FlattenCell::new(quantizer, Metric::L2, 1 << 24).unwrap();
    for row in &dataset.vectors {
        cell.push(row).unwrap();
    }

    let params = OdescentParams {
        turns: 3,
        sample_rate: 0.3,
        alpha: 1.2,
        min_in_degree: 1,
        pruning: true,
        seed: 47,
    };
    let mut builder = OdescentBuilder::new(&cell, 32, params).unwrap();
    builder.build().unwrap();
    let graph = builder.to_graph().unwrap();

    // Post-build invariants: degrees, ordering, duplicates, cached
    // distances, in-degree floor.
    graph.check_invariants().unwrap();
    assert!(graph.max_out_degree() <= 32);
    for (i, d) in graph.in_degrees().into_iter().enumerate() {
        assert!(d >= 1, "node {i} lost all in-edges");
    }

    let opts = IndexOptions::new(128, Metric::L2).with_max_degree(32);
    let index = HnswIndex::from_bulk_graph(opts, cell, dataset.labels.clone(), &graph).unwrap();
    let recall = average_recall(&index, &dataset, 10, 100);
    assert!(recall >= 0.92, "odescent recall@10 = {recall}");
}

#[test]
fn scenario_search_monotonicity_in_ef() {
    let mut dataset = Dataset::generate(2_000, 50, 32, 47);
    dataset.compute_ground_truth(10, Metric::L2);

    let opts = IndexOptions::new(32, Metric::L2)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 47).unwrap();

    let recalls: Vec<f32> = [10, 30, 100, 300]
        .iter()
        .map(|&ef| average_recall(&index, &dataset, 10, ef))
        .collect();
    for w in recalls.windows(2) {
        assert!(
            w[1] >= w[0],
            "recall decreased when widening ef: {recalls:?}"
        );
    }
}

#[test]
fn scenario_filtered_iterator() {
    let dim = 32;
    let mut dataset = Dataset::generate(2_000, 1, dim, 47);
    dataset.compute_ground_truth(10, Metric::L2);
    let query = dataset.queries[0].clone();

    let opts = IndexOptions::new(dim, Metric::L2)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 47).unwrap();

    // Exact 30th-best distance among odd labels.
    let mut oracle = BruteForceIndex::new(dim, Metric::L2);
    for (label, vector) in dataset.labels.iter().zip(dataset.vectors.iter()) {
        if label.as_u64() % 2 == 1 {
            oracle.add(*label, vector).unwrap();
        }
    }
    let best30 = oracle.search(&query, 30).unwrap();
    let bound = best30.last().unwrap().distance;

    let filter = ClosureFilter::new(|l: LabelId| l.as_u64() % 2 == 1).with_valid_ratio(0.5);
    let mut ctx = IteratorContext::new(index.len(), 100).unwrap();

    let mut seen = std::collections::HashSet::new();
    for call in 0..3 {
        let batch = index
            .knn_iterate(&mut ctx, &query, 10, Some(&filter))
            .unwrap();
        assert_eq!(batch.len(), 10, "call {call} returned a short batch");
        for r in &batch {
            assert_eq!(r.label.as_u64() % 2, 1, "even label {} yielded", r.label);
            assert!(
                seen.insert(r.label.as_u64()),
                "label {} yielded twice",
                r.label
            );
            assert!(
                r.distance <= bound + 1e-4,
                "distance {} beyond the 30th-best odd distance {bound}",
                r.distance
            );
        }
    }
    assert_eq!(seen.len(), 30);
}

#[test]
fn scenario_snapshot_roundtrip() {
    let mut dataset = Dataset::generate(2_000, 100, 32, 47);
    dataset.compute_ground_truth(10, Metric::L2);

    let opts = IndexOptions::new(32, Metric::L2)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 47).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.qvr");
    index.save(&path).unwrap();
    let restored = HnswIndex::load(&path).unwrap();

    let params = SearchParams::new(100);
    for query in &dataset.queries {
        let a = index.search(query, 10, params).unwrap();
        let b = restored.search(query, 10, params).unwrap();
        let ids_a: Vec<u64> = a.iter().map(|r| r.label.as_u64()).collect();
        let ids_b: Vec<u64> = b.iter().map(|r| r.label.as_u64()).collect();
        assert_eq!(ids_a, ids_b);
    }
}

#[test]
fn scenario_concurrent_queries_match_single_threaded() {
    let dataset = Dataset::generate(2_000, 100, 32, 47);

    let opts = IndexOptions::new(32, Metric::L2)
        .with_max_degree(16)
        .with_ef_construction(100);
    let index = HnswIndex::build(opts, &dataset.labels, &dataset.vectors, 47).unwrap();

    let params = SearchParams::new(50);
    let expected: Vec<Vec<u64>> = dataset
        .queries
        .iter()
        .map(|q| {
            index
                .search(q, 10, params)
                .unwrap()
                .iter()
                .map(|r| r.label.as_u64())
                .collect()
        })
        .collect();

    std::thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                for (query, truth) in dataset.queries.iter().zip(expected.iter()) {
                    let ids: Vec<u64> = index
                        .search(query, 10, params)
                        .unwrap()
                        .iter()
                        .map(|r| r.label.as_u64())
                        .collect();
                    assert_eq!(&ids, truth);
                }
            });
        }
    });
}
