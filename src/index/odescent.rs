//! Bulk graph construction by NN-descent.
//!
//! The builder refines a randomly initialized k-NN graph over `turns`
//! rounds. Each round samples current edges into per-node `old`/`new`
//! candidate sets, scores the cross pairs, and appends improvements to both
//! endpoints; the round ends with a sort/dedup/truncate stabilization and an
//! in-degree repair. An optional finishing pass applies diversity pruning
//! and reverse-edge augmentation.
//!
//! Every phase is a map over disjoint index blocks submitted to the rayon
//! pool. The only shared mutable state is each node's neighbor list and its
//! greatest-distance threshold: lists sit behind per-node mutexes (at most
//! one held at a time), thresholds in atomics. Given a seed, the candidate
//! edges applied by the refinement rounds form a deterministic multiset per
//! block partition, and stabilization is order-insensitive, so those rounds
//! reproduce exactly; the pruning pass reads concurrently updated in-degree
//! counters and only promises the graph invariants.

use crate::config::OdescentParams;
use crate::error::{QuiverError, Result};
use crate::flatten::FlattenCell;
use crate::graph::{GraphStore, NeighborList};
use crate::index::CancelToken;
use crate::types::{InnerId, Neighbor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Nodes per parallel block.
const BLOCK_SIZE: usize = 10_000;

/// One adjacency entry during refinement. `old` marks edges already sampled
/// in an earlier round.
#[derive(Clone, Copy)]
struct BuilderNode {
    id: u32,
    distance: f32,
    old: bool,
}

/// Per-node mutable state: the list behind its mutex, the acceptance
/// threshold readable without it.
struct PointState {
    link: Mutex<Vec<BuilderNode>>,
    /// Greatest in-list distance as f32 bits; `f32::MAX` until the first
    /// stabilization so early rounds accept everything.
    threshold: AtomicU32,
}

impl PointState {
    fn new() -> Self {
        Self {
            link: Mutex::new(Vec::new()),
            threshold: AtomicU32::new(f32::MAX.to_bits()),
        }
    }
}

/// NN-descent builder over a populated flatten cell.
pub struct OdescentBuilder<'a> {
    params: OdescentParams,
    max_degree: usize,
    min_in_degree: usize,
    cell: &'a FlattenCell,
    points: Vec<PointState>,
    built: bool,
    cancel: Option<CancelToken>,
}

impl<'a> OdescentBuilder<'a> {
    /// Create a builder for every vector currently in `cell`.
    pub fn new(cell: &'a FlattenCell, max_degree: usize, params: OdescentParams) -> Result<Self> {
        params.validate()?;
        if max_degree < 2 {
            return Err(QuiverError::invalid_argument("max_degree must be >= 2"));
        }
        let n = cell.len();
        if n < 2 {
            return Err(QuiverError::invalid_argument(
                "odescent requires at least two vectors",
            ));
        }
        let min_in_degree = params.min_in_degree.min(n - 1);
        Ok(Self {
            params,
            max_degree,
            min_in_degree,
            cell,
            points: (0..n).map(|_| PointState::new()).collect(),
            built: false,
            cancel: None,
        })
    }

    /// Attach a cancellation token checked at phase and block boundaries.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[inline]
    fn n(&self) -> usize {
        self.points.len()
    }

    #[inline]
    fn distance(&self, a: u32, b: u32) -> f32 {
        self.cell.compute_pair(InnerId::new(a), InnerId::new(b))
    }

    #[inline]
    fn threshold(&self, id: u32) -> f32 {
        f32::from_bits(self.points[id as usize].threshold.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_threshold(&self, id: u32, value: f32) {
        self.points[id as usize]
            .threshold
            .store(value.to_bits(), Ordering::Relaxed);
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(QuiverError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Map `task` over disjoint `[start, start + BLOCK_SIZE)` ranges on the
    /// rayon pool, checking cancellation once per block.
    fn parallelize<F>(&self, task: F) -> Result<()>
    where
        F: Fn(Range<usize>) + Sync,
    {
        self.check_cancel()?;
        let n = self.n();
        let blocks: Vec<Range<usize>> = (0..n)
            .step_by(BLOCK_SIZE)
            .map(|start| start..(start + BLOCK_SIZE).min(n))
            .collect();
        blocks.into_par_iter().try_for_each(|range| {
            self.check_cancel()?;
            task(range);
            Ok(())
        })
    }

    /// Run the full construction. Errors leave the builder unusable.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Err(QuiverError::invalid_argument("builder already ran"));
        }
        self.built = true;

        let n = self.n();
        let old_sets: Vec<Mutex<HashSet<u32>>> =
            (0..n).map(|_| Mutex::new(HashSet::new())).collect();
        let new_sets: Vec<Mutex<HashSet<u32>>> =
            (0..n).map(|_| Mutex::new(HashSet::new())).collect();

        self.init_graph()?;
        for _ in 0..self.params.turns {
            self.sample_candidates(&old_sets, &new_sets)?;
            self.update_neighbors(&old_sets, &new_sets)?;
            self.repair_no_in_edge()?;
        }
        if self.params.pruning {
            self.prune_graph()?;
            self.add_reverse_edges()?;
            // Reverse-edge truncation can drop someone's last in-edge; one
            // more repair restores the floor.
            self.repair_no_in_edge()?;
        }
        self.finalize_lists()?;
        Ok(())
    }

    /// Phase 1: seed each node with random distinct neighbors, or the dense
    /// cyclic neighborhood when the corpus is no larger than the degree cap.
    fn init_graph(&self) -> Result<()> {
        let n = self.n();
        let max_neighbors = self.max_degree.min(n - 1);
        let dense = n - 1 <= self.max_degree;
        let seed = self.params.seed;

        self.parallelize(|range| {
            let mut rng = StdRng::seed_from_u64(seed ^ (range.start as u64).wrapping_mul(0x9e37));
            for i in range {
                let mut chosen: HashSet<u32> = HashSet::with_capacity(max_neighbors + 1);
                chosen.insert(i as u32);
                let mut link = self.points[i].link.lock();
                link.reserve(self.max_degree);
                for j in 0..max_neighbors {
                    let id = if dense {
                        ((i + j + 1) % n) as u32
                    } else {
                        let mut id = i as u32;
                        while chosen.contains(&id) {
                            id = rng.gen_range(0..n as u32);
                        }
                        id
                    };
                    chosen.insert(id);
                    link.push(BuilderNode {
                        id,
                        distance: self.distance(i as u32, id),
                        old: false,
                    });
                }
            }
        })
    }

    /// Phase 2: sample current edges into `old`/`new` sets, symmetrically
    /// for both endpoints. An edge enters `new` on its first sampled round
    /// and `old` afterwards.
    fn sample_candidates(
        &self,
        old_sets: &[Mutex<HashSet<u32>>],
        new_sets: &[Mutex<HashSet<u32>>],
    ) -> Result<()> {
        let sample_rate = self.params.sample_rate;
        let seed = self.params.seed;

        self.parallelize(|range| {
            let mut rng =
                StdRng::seed_from_u64(seed ^ (range.start as u64).wrapping_mul(0x51_7c_c1));
            for i in range {
                let mut link = self.points[i].link.lock();
                for entry in link.iter_mut() {
                    if rng.gen::<f32>() >= sample_rate {
                        continue;
                    }
                    if entry.old {
                        old_sets[i].lock().insert(entry.id);
                        old_sets[entry.id as usize].lock().insert(i as u32);
                    } else {
                        new_sets[i].lock().insert(entry.id);
                        new_sets[entry.id as usize].lock().insert(i as u32);
                        entry.old = true;
                    }
                }
            }
        })
    }

    /// Phase 3: score cross pairs (new x new, new x old) and append
    /// improvements to both endpoints under their locks, then stabilize
    /// every list and refresh its threshold.
    fn update_neighbors(
        &self,
        old_sets: &[Mutex<HashSet<u32>>],
        new_sets: &[Mutex<HashSet<u32>>],
    ) -> Result<()> {
        self.parallelize(|range| {
            for i in range {
                let new_ids: Vec<u32> = new_sets[i].lock().iter().copied().collect();
                let old_ids: Vec<u32> = old_sets[i].lock().iter().copied().collect();
                let mut prior: Vec<u32> = Vec::with_capacity(new_ids.len());

                for &node_id in &new_ids {
                    for &other in &prior {
                        self.offer_edge(node_id, other);
                    }
                    prior.push(node_id);

                    for &other in &old_ids {
                        if other != node_id {
                            self.offer_edge(node_id, other);
                        }
                    }
                }
                new_sets[i].lock().clear();
                old_sets[i].lock().clear();
            }
        })?;

        self.parallelize(|range| {
            for i in range {
                let mut link = self.points[i].link.lock();
                stabilize(&mut link, i as u32, self.max_degree);
                if let Some(last) = link.last() {
                    self.set_threshold(i as u32, last.distance);
                }
            }
        })
    }

    /// Score one candidate pair and append it to whichever endpoints it
    /// improves. The lock scope is a single push.
    #[inline]
    fn offer_edge(&self, a: u32, b: u32) {
        let dist = self.distance(a, b);
        if dist < self.threshold(a) {
            self.points[a as usize].link.lock().push(BuilderNode {
                id: b,
                distance: dist,
                old: false,
            });
        }
        if dist < self.threshold(b) {
            self.points[b as usize].link.lock().push(BuilderNode {
                id: a,
                distance: dist,
                old: false,
            });
        }
    }

    /// Phase 4: give every starved node an in-edge by redirecting one of a
    /// donor's weakest outgoing slots, provided the displaced target keeps
    /// enough incoming edges. One bounded pass per call; rounds re-run it.
    fn repair_no_in_edge(&self) -> Result<()> {
        self.check_cancel()?;
        let n = self.n();
        let mut in_edges = vec![0i64; n];
        for point in &self.points {
            for entry in point.link.lock().iter() {
                in_edges[entry.id as usize] += 1;
            }
        }

        let initial_pos = self.max_degree.min(n - 1).saturating_sub(1);
        let mut replace_pos = vec![initial_pos; n];
        for i in 0..n {
            let out: Vec<(u32, f32)> = self.points[i]
                .link
                .lock()
                .iter()
                .map(|e| (e.id, e.distance))
                .collect();
            let mut donor_idx = 0usize;
            while in_edges[i] < self.min_in_degree as i64 && donor_idx < out.len() {
                let (donor, donor_dist) = out[donor_idx];
                donor_idx += 1;

                let mut donor_link = self.points[donor as usize].link.lock();
                if donor_link.iter().any(|e| e.id == i as u32) {
                    continue;
                }
                let pos = replace_pos[donor as usize];
                if pos == 0 || pos >= donor_link.len() {
                    continue;
                }
                let displaced = donor_link[pos].id;
                if in_edges[displaced as usize] > self.min_in_degree as i64 {
                    in_edges[displaced as usize] -= 1;
                    donor_link[pos] = BuilderNode {
                        id: i as u32,
                        distance: donor_dist,
                        old: false,
                    };
                    in_edges[i] += 1;
                }
                replace_pos[donor as usize] -= 1;
            }
        }
        Ok(())
    }

    /// Phase 5: diversity pruning. A neighbor is kept iff no already-kept
    /// neighbor is closer to it (scaled by alpha) than it is to the node;
    /// drops are skipped for targets at the in-degree floor.
    fn prune_graph(&self) -> Result<()> {
        self.check_cancel()?;
        let n = self.n();
        let mut counts = vec![0i64; n];
        for point in &self.points {
            for entry in point.link.lock().iter() {
                counts[entry.id as usize] += 1;
            }
        }
        let in_edges: Vec<AtomicI64> = counts.into_iter().map(AtomicI64::new).collect();
        let alpha = self.params.alpha;

        self.parallelize(|range| {
            for i in range {
                let mut link = self.points[i].link.lock();
                stabilize(&mut link, i as u32, usize::MAX);

                let mut kept: Vec<BuilderNode> = Vec::with_capacity(self.max_degree);
                for &entry in link.iter() {
                    let mut keep = true;
                    if in_edges[entry.id as usize].load(Ordering::Relaxed)
                        > self.min_in_degree as i64
                    {
                        for other in &kept {
                            if self.distance(entry.id, other.id) * alpha < entry.distance {
                                keep = false;
                                in_edges[entry.id as usize].fetch_sub(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                    if keep {
                        kept.push(entry);
                    }
                }
                kept.truncate(self.max_degree);
                *link = kept;
            }
        })
    }

    /// Phase 6: merge the reverse adjacency into each forward list, then
    /// stabilize.
    fn add_reverse_edges(&self) -> Result<()> {
        self.check_cancel()?;
        let n = self.n();
        let mut reverse: Vec<Vec<BuilderNode>> = vec![Vec::new(); n];
        for (i, point) in self.points.iter().enumerate() {
            for entry in point.link.lock().iter() {
                reverse[entry.id as usize].push(BuilderNode {
                    id: i as u32,
                    distance: entry.distance,
                    old: entry.old,
                });
            }
        }

        self.parallelize(|range| {
            for i in range {
                let mut link = self.points[i].link.lock();
                link.extend_from_slice(&reverse[i]);
                stabilize(&mut link, i as u32, self.max_degree);
            }
        })
    }

    /// Final stabilization so the exported graph meets the ordering and
    /// degree invariants regardless of which phase ran last.
    fn finalize_lists(&self) -> Result<()> {
        self.parallelize(|range| {
            for i in range {
                let mut link = self.points[i].link.lock();
                stabilize(&mut link, i as u32, self.max_degree);
                if let Some(last) = link.last() {
                    self.set_threshold(i as u32, last.distance);
                }
            }
        })
    }

    /// Export the refined adjacency as a flat graph store. Node 0 serves as
    /// the search entry point.
    pub fn to_graph(&self) -> Result<GraphStore> {
        if !self.built {
            return Err(QuiverError::NotBuilt);
        }
        let n = self.n();
        let mut graph = GraphStore::new(n, self.max_degree);
        for i in 0..n {
            let id = InnerId::new(i as u32);
            let mut list = NeighborList::new();
            for entry in self.points[i].link.lock().iter() {
                list.push(Neighbor::new(InnerId::new(entry.id), entry.distance));
            }
            list.stabilize(id, self.max_degree);
            graph.set_node(id, list);
        }
        graph.set_entry_point(Some(InnerId::new(0)));
        Ok(graph)
    }

    /// Write the graph snapshot layout directly.
    pub fn save_graph<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        self.to_graph()?.write_snapshot(writer)
    }
}

/// Sort by (distance, id), drop self-loops and duplicate ids (merging the
/// `old` flag so a sampled edge stays sampled), cap the length.
fn stabilize(link: &mut Vec<BuilderNode>, owner: u32, max_degree: usize) {
    link.sort_unstable_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    link.retain(|e| e.id != owner);
    link.dedup_by(|b, a| {
        if a.id == b.id {
            a.old |= b.old;
            true
        } else {
            false
        }
    });
    if link.len() > max_degree {
        link.truncate(max_degree);
    }
}
