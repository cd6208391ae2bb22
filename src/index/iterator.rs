//! Per-query cursor state for iterated retrieval.
//!
//! An [`IteratorContext`] lets a caller repeatedly ask the index for the
//! next batch of neighbors. The context remembers which ids were already
//! yielded, keeps the abandoned search frontier in a bounded discard heap
//! so later calls can resume from it, and memoizes query distances so
//! revisited nodes are never rescored.
//!
//! The engine borrows the context mutably during each call; the caller owns
//! it and drops it when the iteration is over.

use crate::error::{QuiverError, Result};
use crate::types::{InnerId, Neighbor};
use std::collections::{BinaryHeap, HashMap};

/// Discard heap capacity as a multiple of `ef_search`.
const DISCARD_CAP_FACTOR: usize = 2;

/// Stateful cursor for repeated `knn_iterate` calls on one query.
pub struct IteratorContext {
    ef_search: usize,
    first_use: bool,
    /// Ids already yielded to the caller.
    returned: Vec<bool>,
    /// Per-id expansion counters; a nonzero count means the node's
    /// neighborhood was already scanned during some call.
    visited_time: Vec<u16>,
    /// Abandoned frontier: max-heap capped at `2 * ef_search`, keeping the
    /// smaller distances on overflow.
    discard: BinaryHeap<Neighbor>,
    /// Query distance memo for nodes seen in earlier calls.
    distances: HashMap<InnerId, f32>,
}

impl IteratorContext {
    /// Create a context for a corpus of `max_size` vectors.
    pub fn new(max_size: usize, ef_search: usize) -> Result<Self> {
        if max_size == 0 || ef_search == 0 {
            return Err(QuiverError::invalid_argument(
                "iterator context requires a non-empty corpus and positive ef_search",
            ));
        }
        Ok(Self {
            ef_search,
            first_use: true,
            returned: vec![false; max_size],
            visited_time: vec![0u16; max_size],
            discard: BinaryHeap::new(),
            distances: HashMap::new(),
        })
    }

    /// Beam width the context was sized for.
    pub fn ef_search(&self) -> usize {
        self.ef_search
    }

    /// True until the first `knn_iterate` call completes.
    pub fn is_first_use(&self) -> bool {
        self.first_use
    }

    /// Mark the first call as done.
    pub fn set_first_use_done(&mut self) {
        self.first_use = false;
    }

    /// Push an abandoned node onto the discard heap. On overflow the
    /// largest distance is evicted, keeping the closer frontier.
    pub fn add_discard(&mut self, node: Neighbor) {
        if self.discard.len() >= DISCARD_CAP_FACTOR * self.ef_search {
            if let Some(top) = self.discard.peek() {
                if top.distance > node.distance {
                    self.discard.pop();
                    self.discard.push(node);
                }
            }
        } else {
            self.discard.push(node);
        }
    }

    /// True iff the discard heap holds no frontier to resume from.
    pub fn discard_empty(&self) -> bool {
        self.discard.is_empty()
    }

    /// Number of frontier entries available for resumption.
    pub fn discard_len(&self) -> usize {
        self.discard.len()
    }

    /// Drain the entire discard heap, dropping ids already returned.
    pub fn drain_discard(&mut self) -> Vec<Neighbor> {
        let mut seeds = Vec::with_capacity(self.discard.len());
        while let Some(node) = self.discard.pop() {
            if !self.is_returned(node.id) {
                seeds.push(node);
            }
        }
        seeds
    }

    /// Mark an id as yielded to the caller.
    pub fn set_returned(&mut self, id: InnerId) {
        self.returned[id.index()] = true;
    }

    /// True iff the id was already yielded.
    #[inline]
    pub fn is_returned(&self, id: InnerId) -> bool {
        self.returned[id.index()]
    }

    /// True iff the node's neighborhood was scanned during some call.
    #[inline]
    pub fn is_expanded(&self, id: InnerId) -> bool {
        self.visited_time[id.index()] > 0
    }

    /// Count one expansion of the node's neighborhood.
    pub fn mark_expanded(&mut self, id: InnerId) {
        let slot = &mut self.visited_time[id.index()];
        *slot = slot.saturating_add(1);
    }

    /// Memoized query distance for `id`, if any call scored it before.
    #[inline]
    pub fn memo(&self, id: InnerId) -> Option<f32> {
        self.distances.get(&id).copied()
    }

    /// Record the query distance for `id`.
    pub fn memoize(&mut self, id: InnerId, distance: f32) {
        self.distances.insert(id, distance);
    }
}
