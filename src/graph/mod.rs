//! Flat adjacency storage keyed by internal id.
//!
//! The graph is a `Vec<NeighborList>`; the only cross-node reference is a
//! 32-bit index. After every stabilization point a list is sorted by
//! ascending distance, free of duplicates and self-loops, and capped at the
//! configured degree.

pub mod visited;

use crate::error::{QuiverError, Result};
use crate::types::{InnerId, Neighbor};
use smallvec::SmallVec;
use std::io::{Read, Write};

pub use visited::{VisitedPool, VisitedSet};

/// Ordered outgoing-neighbor list with a cached acceptance threshold.
#[derive(Debug, Clone, Default)]
pub struct NeighborList {
    neighbors: SmallVec<[Neighbor; 32]>,
    /// Greatest in-list distance after the last stabilization; `f32::MAX`
    /// before the first, so early candidates are always accepted.
    threshold: f32,
}

impl NeighborList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            neighbors: SmallVec::new(),
            threshold: f32::MAX,
        }
    }

    /// Number of neighbors.
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// True if the list holds no neighbors.
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// The acceptance threshold: greatest in-list distance after the last
    /// stabilization.
    #[inline]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Neighbors in list order.
    #[inline]
    pub fn as_slice(&self) -> &[Neighbor] {
        &self.neighbors
    }

    /// Append a candidate without ordering or capping; call
    /// [`stabilize`](Self::stabilize) before relying on invariants.
    #[inline]
    pub fn push(&mut self, neighbor: Neighbor) {
        self.neighbors.push(neighbor);
    }

    /// Replace the whole list, leaving it unstabilized.
    pub fn replace(&mut self, neighbors: impl IntoIterator<Item = Neighbor>) {
        self.neighbors.clear();
        self.neighbors.extend(neighbors);
    }

    /// True iff `id` is present.
    pub fn contains(&self, id: InnerId) -> bool {
        self.neighbors.iter().any(|n| n.id == id)
    }

    /// Sort by ascending (distance, id), drop duplicate ids and `owner`
    /// self-loops, cap at `max_degree`, and refresh the threshold.
    pub fn stabilize(&mut self, owner: InnerId, max_degree: usize) {
        // Duplicate ids carry the same pair distance, so ordering by
        // (distance, id) makes them adjacent and a single dedup pass
        // suffices.
        self.neighbors.sort_unstable();
        self.neighbors.retain(|n| n.id != owner);
        self.neighbors.dedup_by(|b, a| a.id == b.id);
        if self.neighbors.len() > max_degree {
            self.neighbors.truncate(max_degree);
        }
        self.threshold = self.neighbors.last().map_or(f32::MAX, |n| n.distance);
    }
}

/// Flat adjacency keyed by [`InnerId`].
pub struct GraphStore {
    nodes: Vec<NeighborList>,
    max_degree: usize,
    entry_point: Option<InnerId>,
}

impl GraphStore {
    /// Create a graph over `n` nodes with the given degree cap.
    pub fn new(n: usize, max_degree: usize) -> Self {
        Self {
            nodes: vec![NeighborList::new(); n],
            max_degree,
            entry_point: None,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Configured out-degree cap.
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Search entry point, if any.
    pub fn entry_point(&self) -> Option<InnerId> {
        self.entry_point
    }

    /// Set the search entry point.
    pub fn set_entry_point(&mut self, ep: Option<InnerId>) {
        self.entry_point = ep;
    }

    /// Borrow a node's list.
    #[inline]
    pub fn node(&self, id: InnerId) -> &NeighborList {
        &self.nodes[id.index()]
    }

    /// Mutably borrow a node's list.
    #[inline]
    pub fn node_mut(&mut self, id: InnerId) -> &mut NeighborList {
        &mut self.nodes[id.index()]
    }

    /// Replace a node's list wholesale (used when importing builder output).
    pub fn set_node(&mut self, id: InnerId, list: NeighborList) {
        self.nodes[id.index()] = list;
    }

    /// Largest actual out-degree across all nodes.
    pub fn max_out_degree(&self) -> usize {
        self.nodes.iter().map(NeighborList::len).max().unwrap_or(0)
    }

    /// In-degree of every node.
    pub fn in_degrees(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.nodes.len()];
        for list in &self.nodes {
            for n in list.as_slice() {
                counts[n.id.index()] += 1;
            }
        }
        counts
    }

    /// Write the snapshot layout: `u64 index_size`, `u32 max_degree`,
    /// `u32 entry_point`, `u64 num_frozen (0)`, then per node a `u32` count
    /// and the neighbor ids. Little-endian throughout.
    pub fn write_snapshot<W: Write>(&self, writer: &mut W) -> Result<()> {
        let header = 8 + 4 + 4 + 8u64;
        let body: u64 = self
            .nodes
            .iter()
            .map(|l| 4 * (l.len() as u64 + 1))
            .sum();
        let index_size = header + body;
        let max_degree = self.max_out_degree() as u32;
        let ep = self.entry_point.map_or(0, InnerId::as_u32);

        writer.write_all(&index_size.to_le_bytes())?;
        writer.write_all(&max_degree.to_le_bytes())?;
        writer.write_all(&ep.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;
        for list in &self.nodes {
            writer.write_all(&(list.len() as u32).to_le_bytes())?;
            for n in list.as_slice() {
                writer.write_all(&n.id.as_u32().to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Read the [`write_snapshot`](Self::write_snapshot) layout. Neighbor
    /// distances are not persisted; the result carries them as zero until
    /// the caller rescores against a corpus.
    pub fn read_snapshot<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        reader.read_exact(&mut buf8)?;
        let index_size = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf4)?;
        let max_degree = u32::from_le_bytes(buf4) as usize;
        reader.read_exact(&mut buf4)?;
        let ep = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf8)?;
        let num_frozen = u64::from_le_bytes(buf8);
        if num_frozen != 0 {
            return Err(QuiverError::corrupt("unsupported frozen point count"));
        }

        let header = 24u64;
        if index_size < header {
            return Err(QuiverError::corrupt("snapshot smaller than its header"));
        }

        let mut nodes = Vec::new();
        let mut consumed = header;
        while consumed < index_size {
            reader.read_exact(&mut buf4)?;
            let k = u32::from_le_bytes(buf4) as usize;
            if max_degree > 0 && k > max_degree {
                return Err(QuiverError::corrupt(format!(
                    "node degree {k} exceeds snapshot max degree {max_degree}"
                )));
            }
            let mut list = NeighborList::new();
            for _ in 0..k {
                reader.read_exact(&mut buf4)?;
                list.push(Neighbor::new(InnerId::new(u32::from_le_bytes(buf4)), 0.0));
            }
            consumed += 4 * (k as u64 + 1);
            nodes.push(list);
        }
        if consumed != index_size {
            return Err(QuiverError::corrupt("snapshot size does not match body"));
        }

        let n = nodes.len();
        for list in &nodes {
            for neighbor in list.as_slice() {
                if neighbor.id.index() >= n {
                    return Err(QuiverError::corrupt(format!(
                        "neighbor id {} out of range for {n} nodes",
                        neighbor.id
                    )));
                }
            }
        }
        let entry_point = if n == 0 {
            None
        } else {
            if ep as usize >= n {
                return Err(QuiverError::corrupt("entry point out of range"));
            }
            Some(InnerId::new(ep))
        };

        Ok(Self {
            nodes,
            max_degree: max_degree.max(1),
            entry_point,
        })
    }

    /// Check the per-node invariants: no duplicates, no self-loops, length
    /// within the cap, sorted by ascending distance.
    pub fn check_invariants(&self) -> Result<()> {
        for (i, list) in self.nodes.iter().enumerate() {
            let slice = list.as_slice();
            if slice.len() > self.max_degree {
                return Err(QuiverError::internal(format!(
                    "node {i} exceeds max degree: {}",
                    slice.len()
                )));
            }
            for w in slice.windows(2) {
                if w[0].distance > w[1].distance {
                    return Err(QuiverError::internal(format!("node {i} list unsorted")));
                }
                if w[0].id == w[1].id {
                    return Err(QuiverError::internal(format!("node {i} has duplicates")));
                }
            }
            if slice.iter().any(|n| n.id.index() == i) {
                return Err(QuiverError::internal(format!("node {i} has a self-loop")));
            }
            let mut ids: Vec<u32> = slice.iter().map(|n| n.id.as_u32()).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != slice.len() {
                return Err(QuiverError::internal(format!("node {i} has duplicates")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(id: u32, distance: f32) -> Neighbor {
        Neighbor::new(InnerId::new(id), distance)
    }

    #[test]
    fn test_stabilize_sorts_dedups_truncates() {
        let mut list = NeighborList::new();
        list.push(neighbor(3, 0.9));
        list.push(neighbor(1, 0.2));
        list.push(neighbor(3, 0.9));
        list.push(neighbor(7, 0.5));
        list.push(neighbor(0, 0.1)); // owner: must be dropped
        list.stabilize(InnerId::new(0), 2);

        let ids: Vec<u32> = list.as_slice().iter().map(|n| n.id.as_u32()).collect();
        assert_eq!(ids, vec![1, 7]);
        assert_eq!(list.threshold(), 0.5);
    }

    #[test]
    fn test_threshold_before_stabilize_accepts_all() {
        let list = NeighborList::new();
        assert_eq!(list.threshold(), f32::MAX);
    }

    #[test]
    fn test_dedup_with_equal_distance_interleaving() {
        // Two copies of id 5 separated by another entry at the same distance.
        let mut list = NeighborList::new();
        list.push(neighbor(5, 0.5));
        list.push(neighbor(2, 0.5));
        list.push(neighbor(5, 0.5));
        list.stabilize(InnerId::new(9), 8);

        let ids: Vec<u32> = list.as_slice().iter().map(|n| n.id.as_u32()).collect();
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut graph = GraphStore::new(3, 4);
        graph.node_mut(InnerId::new(0)).push(neighbor(1, 0.5));
        graph.node_mut(InnerId::new(0)).push(neighbor(2, 0.7));
        graph.node_mut(InnerId::new(1)).push(neighbor(0, 0.5));
        graph.node_mut(InnerId::new(2)).push(neighbor(0, 0.7));
        graph.set_entry_point(Some(InnerId::new(1)));

        let mut bytes = Vec::new();
        graph.write_snapshot(&mut bytes).unwrap();

        let restored = GraphStore::read_snapshot(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.entry_point(), Some(InnerId::new(1)));
        let ids: Vec<u32> = restored
            .node(InnerId::new(0))
            .as_slice()
            .iter()
            .map(|n| n.id.as_u32())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_snapshot_rejects_truncation() {
        let mut graph = GraphStore::new(2, 4);
        graph.node_mut(InnerId::new(0)).push(neighbor(1, 0.5));
        graph.set_entry_point(Some(InnerId::new(0)));

        let mut bytes = Vec::new();
        graph.write_snapshot(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);

        assert!(GraphStore::read_snapshot(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_snapshot_rejects_out_of_range_neighbor() {
        // Hand-build a snapshot with one node pointing at id 9.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(24u64 + 8).to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&9u32.to_le_bytes());

        assert!(matches!(
            GraphStore::read_snapshot(&mut bytes.as_slice()),
            Err(QuiverError::CorruptData(_))
        ));
    }

    #[test]
    fn test_in_degrees() {
        let mut graph = GraphStore::new(3, 4);
        graph.node_mut(InnerId::new(0)).push(neighbor(1, 0.5));
        graph.node_mut(InnerId::new(2)).push(neighbor(1, 0.3));
        assert_eq!(graph.in_degrees(), vec![0, 2, 0]);
    }

    #[test]
    fn test_check_invariants_catches_violations() {
        let mut graph = GraphStore::new(2, 1);
        graph.node_mut(InnerId::new(0)).push(neighbor(1, 0.5));
        graph.node_mut(InnerId::new(0)).push(neighbor(1, 0.5));
        assert!(graph.check_invariants().is_err());

        graph.node_mut(InnerId::new(0)).stabilize(InnerId::new(0), 1);
        assert!(graph.check_invariants().is_ok());
    }
}
