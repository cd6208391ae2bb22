//! Synthetic dataset generation and recall evaluation.

use crate::config::Metric;
use crate::index::BruteForceIndex;
use crate::types::LabelId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// A dataset with base vectors, queries, and brute-force ground truth.
pub struct Dataset {
    pub labels: Vec<LabelId>,
    pub vectors: Vec<Vec<f32>>,
    pub queries: Vec<Vec<f32>>,
    pub ground_truth: Vec<Vec<u64>>,
}

impl Dataset {
    /// Generate a reproducible random dataset with components uniform in
    /// [-1, 1).
    pub fn generate(n_vectors: usize, n_queries: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let row = |rng: &mut StdRng| -> Vec<f32> {
            (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
        };

        let vectors: Vec<Vec<f32>> = (0..n_vectors).map(|_| row(&mut rng)).collect();
        let queries: Vec<Vec<f32>> = (0..n_queries).map(|_| row(&mut rng)).collect();
        let labels: Vec<LabelId> = (0..n_vectors as u64).map(LabelId::new).collect();

        Self {
            labels,
            vectors,
            queries,
            ground_truth: Vec::new(),
        }
    }

    /// Compute exact ground truth for every query.
    pub fn compute_ground_truth(&mut self, k: usize, metric: Metric) {
        let dim = self.vectors.first().map_or(0, Vec::len);
        let mut oracle = BruteForceIndex::new(dim, metric);
        for (label, vector) in self.labels.iter().zip(self.vectors.iter()) {
            oracle
                .add(*label, vector)
                .expect("generated vectors share one dimension");
        }
        self.ground_truth = oracle
            .batch_search(&self.queries, k)
            .expect("generated queries share the base dimension")
            .into_iter()
            .map(|results| results.into_iter().map(|r| r.label.as_u64()).collect())
            .collect();
    }
}

/// Recall@k: the fraction of true nearest neighbors found.
pub fn recall_at_k(predicted: &[u64], ground_truth: &[u64], k: usize) -> f32 {
    let predicted: HashSet<u64> = predicted.iter().take(k).copied().collect();
    let truth: HashSet<u64> = ground_truth.iter().take(k).copied().collect();
    predicted.intersection(&truth).count() as f32 / k as f32
}
