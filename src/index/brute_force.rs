//! Exact nearest-neighbor search by linear scan.
//!
//! Serves as the ground-truth oracle for the approximate indexes: distances
//! are computed over the raw f32 vectors, never the quantized corpus.

use crate::config::Metric;
use crate::distance::{kernels, scalar};
use crate::error::{QuiverError, Result};
use crate::types::{LabelId, SearchResult};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Chunk size for the parallel scan.
const PARALLEL_CHUNK: usize = 1000;

#[derive(Clone, Copy)]
struct Scored {
    label: LabelId,
    distance: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

/// Exact index computing distances to every stored vector per query.
pub struct BruteForceIndex {
    metric: Metric,
    dim: usize,
    labels: Vec<LabelId>,
    vectors: Vec<Vec<f32>>,
}

impl BruteForceIndex {
    /// Create an empty index.
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            metric,
            dim,
            labels: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Add a vector. Cosine vectors are normalized on entry.
    pub fn add(&mut self, label: LabelId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(QuiverError::dimension_mismatch(self.dim, vector.len()));
        }
        let stored = if self.metric == Metric::Cosine {
            scalar::normalize(vector).0
        } else {
            vector.to_vec()
        };
        self.labels.push(label);
        self.vectors.push(stored);
        Ok(())
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// True if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    fn distance(&self, query: &[f32], vector: &[f32]) -> f32 {
        let table = kernels();
        match self.metric {
            Metric::L2 => (table.fp32_l2sq)(query, vector),
            Metric::Ip | Metric::Cosine => 1.0 - (table.fp32_ip)(query, vector),
        }
    }

    /// Exact k-nearest search by sequential scan.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.dim {
            return Err(QuiverError::dimension_mismatch(self.dim, query.len()));
        }
        let normalized;
        let query = if self.metric == Metric::Cosine {
            normalized = scalar::normalize(query).0;
            normalized.as_slice()
        } else {
            query
        };

        let mut heap: BinaryHeap<Scored> = BinaryHeap::with_capacity(k + 1);
        for (label, vector) in self.labels.iter().zip(self.vectors.iter()) {
            let distance = self.distance(query, vector);
            if heap.len() < k {
                heap.push(Scored {
                    label: *label,
                    distance,
                });
            } else if let Some(worst) = heap.peek() {
                if distance < worst.distance {
                    heap.pop();
                    heap.push(Scored {
                        label: *label,
                        distance,
                    });
                }
            }
        }

        let mut results: Vec<SearchResult> = heap
            .into_iter()
            .map(|s| SearchResult::new(s.label, s.distance))
            .collect();
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });
        Ok(results)
    }

    /// Exact k-nearest search with a chunked parallel scan.
    pub fn search_parallel(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.dim {
            return Err(QuiverError::dimension_mismatch(self.dim, query.len()));
        }
        let normalized;
        let query = if self.metric == Metric::Cosine {
            normalized = scalar::normalize(query).0;
            normalized.as_slice()
        } else {
            query
        };

        let merged = self
            .vectors
            .par_chunks(PARALLEL_CHUNK)
            .zip(self.labels.par_chunks(PARALLEL_CHUNK))
            .map(|(vectors, labels)| {
                let mut local: BinaryHeap<Scored> = BinaryHeap::with_capacity(k + 1);
                for (label, vector) in labels.iter().zip(vectors.iter()) {
                    let distance = self.distance(query, vector);
                    if local.len() < k {
                        local.push(Scored {
                            label: *label,
                            distance,
                        });
                    } else if let Some(worst) = local.peek() {
                        if distance < worst.distance {
                            local.pop();
                            local.push(Scored {
                                label: *label,
                                distance,
                            });
                        }
                    }
                }
                local
            })
            .reduce(BinaryHeap::new, |mut a, b| {
                for item in b {
                    if a.len() < k {
                        a.push(item);
                    } else if let Some(worst) = a.peek() {
                        if item.distance < worst.distance {
                            a.pop();
                            a.push(item);
                        }
                    }
                }
                a
            });

        let mut results: Vec<SearchResult> = merged
            .into_iter()
            .map(|s| SearchResult::new(s.label, s.distance))
            .collect();
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });
        Ok(results)
    }

    /// Ground truth for many queries at once.
    pub fn batch_search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<SearchResult>>> {
        queries
            .par_iter()
            .map(|query| self.search_parallel(query, k))
            .collect()
    }
}
