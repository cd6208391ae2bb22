//! quiver-ann: graph-based approximate nearest neighbor search.
//!
//! This crate provides the hard kernel of a vector similarity engine:
//! proximity-graph construction and querying, quantized distance
//! computation with SIMD dispatch, and stateful iterated retrieval.
//!
//! # Features
//!
//! - **Graph search**: HNSW insertion and beam search, plus the ODescent
//!   NN-descent bulk builder with diversity pruning and in-degree repair
//! - **Quantized corpora**: FP32, BF16, SQ8, SQ4, and uniform encodings
//!   over a block-partitioned byte store
//! - **SIMD kernels**: AVX2/AVX-512/NEON specializations selected once per
//!   process behind plain function pointers
//! - **Filtered and iterated search**: predicate-aware beam search and a
//!   resumable cursor that yields successive disjoint top-k batches
//! - **Persistence**: checksummed snapshots that reload to identical
//!   search results
//!
//! # Quick start
//!
//! ```
//! use quiver_ann::{HnswIndex, IndexOptions, LabelId, Metric, SearchParams};
//!
//! let vectors: Vec<Vec<f32>> = (0..200)
//!     .map(|i| (0..16).map(|d| ((i * d) % 7) as f32).collect())
//!     .collect();
//! let labels: Vec<LabelId> = (0..200u64).map(LabelId::new).collect();
//!
//! let opts = IndexOptions::new(16, Metric::L2).with_max_degree(12);
//! let index = HnswIndex::build(opts, &labels, &vectors, 47).unwrap();
//!
//! let results = index.search(&vectors[3], 5, SearchParams::new(50)).unwrap();
//! assert_eq!(results[0].label, LabelId::new(3));
//! ```
//!
//! # Modules
//!
//! - [`index`]: HNSW, ODescent, iterated retrieval, brute-force oracle
//! - [`distance`]: scalar and SIMD kernels plus the process-wide dispatcher
//! - [`flatten`]: the encoded corpus cell
//! - [`quant`]: vector encoders
//! - [`io`]: the block byte store
//! - [`graph`]: flat adjacency and the visited-set machinery
//! - [`persistence`]: save/load with checksums

pub mod config;
pub mod dataset;
pub mod distance;
pub mod error;
pub mod filter;
pub mod flatten;
pub mod graph;
pub mod index;
pub mod io;
pub mod persistence;
pub mod quant;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{Encoding, IndexOptions, Metric, OdescentParams, SearchParams};
pub use dataset::{recall_at_k, Dataset};
pub use error::{QuiverError, Result};
pub use filter::{BitmapFilter, ClosureFilter, FilterPredicate};
pub use flatten::FlattenCell;
pub use graph::{GraphStore, NeighborList, VisitedPool, VisitedSet};
pub use index::{
    BruteForceIndex, CancelToken, HnswIndex, IteratorContext, OdescentBuilder,
};
pub use io::BlockStore;
pub use persistence::Persistable;
pub use quant::Quantizer;
pub use types::{InnerId, LabelId, Neighbor, SearchResult};
