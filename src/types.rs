//! Core newtypes for type-safe index operations.
//!
//! Internally the engine addresses vectors through dense 32-bit [`InnerId`]s
//! assigned in insertion order; callers see opaque 64-bit [`LabelId`]s.
//! Keeping the two as distinct newtypes prevents mixing them up at compile
//! time.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Engine-internal dense vector identifier, assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InnerId(pub u32);

impl InnerId {
    /// Create a new InnerId.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the value as a usize for array indexing.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InnerId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Opaque caller-supplied vector label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LabelId(pub u64);

impl LabelId {
    /// Create a new LabelId.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LabelId {
    #[inline]
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A node with its computed distance, used for heap operations and neighbor
/// lists. Orders by ascending distance; equal distances break ties toward the
/// smaller id so traversal order is deterministic.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    /// Internal id of the node.
    pub id: InnerId,
    /// Cached distance (to the query, or to the owning node in adjacency
    /// lists).
    pub distance: f32,
}

impl Neighbor {
    /// Create a new scored neighbor.
    #[inline]
    pub const fn new(id: InnerId, distance: f32) -> Self {
        Self { id, distance }
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.id == other.id
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A search result containing a vector label and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    /// The label of the matched vector.
    pub label: LabelId,
    /// The distance from the query vector.
    pub distance: f32,
}

impl SearchResult {
    /// Create a new SearchResult.
    #[inline]
    pub fn new(label: impl Into<LabelId>, distance: f32) -> Self {
        Self {
            label: label.into(),
            distance,
        }
    }
}

impl From<SearchResult> for (u64, f32) {
    fn from(result: SearchResult) -> Self {
        (result.label.0, result.distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_id() {
        let id = InnerId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(id.index(), 42);

        let id2: InnerId = 100u32.into();
        assert!(id < id2);
    }

    #[test]
    fn test_neighbor_ordering() {
        let a = Neighbor::new(InnerId(3), 1.0);
        let b = Neighbor::new(InnerId(1), 2.0);
        assert!(a < b);

        // Equal distances break ties by smaller id.
        let c = Neighbor::new(InnerId(5), 1.0);
        assert!(a < c);
    }

    #[test]
    fn test_search_result_tuple() {
        let r = SearchResult::new(7u64, 0.5);
        let (id, dist): (u64, f32) = r.into();
        assert_eq!(id, 7);
        assert_eq!(dist, 0.5);
    }
}
