//! Index implementations: HNSW search/insert, the ODescent bulk builder,
//! iterated retrieval, and the brute-force oracle.

pub mod brute_force;
pub mod hnsw;
pub mod iterator;
pub mod odescent;

pub use brute_force::BruteForceIndex;
pub use hnsw::HnswIndex;
pub use iterator::IteratorContext;
pub use odescent::OdescentBuilder;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for build operations.
///
/// Builders check the token between phases and between block-partitioned
/// sub-tasks, never inside inner loops; a cancelled build discards partial
/// work and returns [`QuiverError::Cancelled`](crate::QuiverError::Cancelled).
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
