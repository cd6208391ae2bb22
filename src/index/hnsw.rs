//! Hierarchical navigable small-world index.
//!
//! Layer 0 holds the full corpus; each higher layer is a progressively
//! sparser overlay used for long-range routing. A query greedily descends
//! the upper layers and then runs a bounded beam search with `ef`
//! candidates on layer 0.
//!
//! Insertion draws a level from an exponential distribution with
//! `ml = 1 / ln(max_degree)`, links the node at every layer up to its level
//! using diversity pruning, and promotes it to entry point when it tops the
//! hierarchy. Batched inserts link nodes in parallel; per-node RwLocks keep
//! neighbor lists consistent and at most one lock is held at a time.

use crate::config::{IndexOptions, SearchParams};
use crate::error::{QuiverError, Result};
use crate::filter::FilterPredicate;
use crate::flatten::FlattenCell;
use crate::graph::{GraphStore, NeighborList, VisitedPool, VisitedSet};
use crate::index::iterator::IteratorContext;
use crate::index::CancelToken;
use crate::quant::Quantizer;
use crate::types::{InnerId, LabelId, Neighbor, SearchResult};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;

/// Hard ceiling on drawn levels; the exponential draw lands here with
/// vanishing probability but the cast must not run away.
const MAX_LEVEL: usize = 60;

/// Ids linked per parallel batch between cancellation checks.
const LINK_BLOCK_SIZE: usize = 1024;

/// Per-node adjacency, one list per layer the node participates in.
struct NodeLinks {
    levels: Vec<NeighborList>,
}

impl NodeLinks {
    fn with_level(level: usize) -> Self {
        Self {
            levels: vec![NeighborList::new(); level + 1],
        }
    }

    fn level(&self) -> usize {
        self.levels.len() - 1
    }
}

#[derive(Clone, Copy)]
struct EntryState {
    entry: Option<(InnerId, usize)>,
}

/// HNSW index over a flatten cell.
pub struct HnswIndex {
    opts: IndexOptions,
    alpha: f32,
    cell: FlattenCell,
    labels: Vec<LabelId>,
    label_map: HashMap<LabelId, InnerId>,
    nodes: Vec<RwLock<NodeLinks>>,
    entry: Mutex<EntryState>,
    pool: VisitedPool,
    ml: f64,
    level_rng: Mutex<StdRng>,
}

impl HnswIndex {
    /// Create an empty index. Encodings that need training (SQ8/SQ4 and the
    /// uniform variants) must go through [`build`](Self::build) instead.
    pub fn new(opts: IndexOptions) -> Result<Self> {
        opts.validate()?;
        let quantizer = Quantizer::fit(opts.encoding, opts.dim, std::iter::empty())?;
        Self::with_quantizer(opts, quantizer, 0)
    }

    fn with_quantizer(opts: IndexOptions, quantizer: Quantizer, seed: u64) -> Result<Self> {
        let cell = FlattenCell::new(quantizer, opts.metric, opts.block_size)?;
        let ml = 1.0 / (opts.max_degree as f64).ln();
        Ok(Self {
            alpha: opts.alpha,
            opts,
            cell,
            labels: Vec::new(),
            label_map: HashMap::new(),
            nodes: Vec::new(),
            entry: Mutex::new(EntryState { entry: None }),
            pool: VisitedPool::new(0),
            ml,
            level_rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Build an index over a whole corpus: train the quantizer, append every
    /// vector, then link nodes in parallel. The resulting graph satisfies
    /// the degree/duplicate/ordering invariants but is not bit-identical
    /// across thread counts.
    pub fn build(
        opts: IndexOptions,
        labels: &[LabelId],
        vectors: &[Vec<f32>],
        seed: u64,
    ) -> Result<Self> {
        Self::build_with_cancel(opts, labels, vectors, seed, None)
    }

    /// [`build`](Self::build) with a cancellation token checked between
    /// linking blocks.
    pub fn build_with_cancel(
        opts: IndexOptions,
        labels: &[LabelId],
        vectors: &[Vec<f32>],
        seed: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Self> {
        opts.validate()?;
        if labels.len() != vectors.len() {
            return Err(QuiverError::invalid_argument(format!(
                "{} labels for {} vectors",
                labels.len(),
                vectors.len()
            )));
        }
        if vectors.is_empty() {
            return Err(QuiverError::invalid_argument(
                "build requires at least one vector",
            ));
        }

        let quantizer = Quantizer::fit(opts.encoding, opts.dim, vectors.iter().map(|v| v.as_slice()))?;
        let mut index = Self::with_quantizer(opts, quantizer, seed)?;

        for (label, vector) in labels.iter().zip(vectors.iter()) {
            index.append_node(*label, vector)?;
        }
        index.pool.grow(index.labels.len());

        // The first node establishes the entry point; the rest link in
        // parallel blocks.
        index.link(InnerId::new(0))?;
        let n = index.labels.len();
        let mut start = 1usize;
        while start < n {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(QuiverError::Cancelled);
                }
            }
            let end = (start + LINK_BLOCK_SIZE).min(n);
            (start..end)
                .into_par_iter()
                .try_for_each(|i| index.link(InnerId::new(i as u32)))?;
            start = end;
        }

        index.stabilize_all();
        Ok(index)
    }

    /// Assemble an index from a bulk-built layer-0 graph (ODescent output).
    /// Every node lives at level 0; the graph's entry point seeds searches.
    pub fn from_bulk_graph(
        opts: IndexOptions,
        cell: FlattenCell,
        labels: Vec<LabelId>,
        graph: &GraphStore,
    ) -> Result<Self> {
        opts.validate()?;
        if cell.len() != labels.len() || cell.len() != graph.len() {
            return Err(QuiverError::invalid_argument(
                "cell, labels, and graph must cover the same nodes",
            ));
        }
        let ml = 1.0 / (opts.max_degree as f64).ln();
        let label_map = labels
            .iter()
            .enumerate()
            .map(|(i, &l)| (l, InnerId::new(i as u32)))
            .collect();
        let nodes = (0..graph.len())
            .map(|i| {
                let mut links = NodeLinks::with_level(0);
                links.levels[0] = graph.node(InnerId::new(i as u32)).clone();
                RwLock::new(links)
            })
            .collect();
        let entry = graph
            .entry_point()
            .or_else(|| (!labels.is_empty()).then(|| InnerId::new(0)));
        Ok(Self {
            alpha: opts.alpha,
            opts,
            pool: VisitedPool::new(labels.len()),
            cell,
            label_map,
            nodes,
            entry: Mutex::new(EntryState {
                entry: entry.map(|ep| (ep, 0)),
            }),
            ml,
            level_rng: Mutex::new(StdRng::seed_from_u64(0)),
            labels,
        })
    }

    /// Insert one vector. Serialized by `&mut self`; use
    /// [`build`](Self::build) for whole-corpus construction.
    pub fn insert(&mut self, label: LabelId, vector: &[f32]) -> Result<InnerId> {
        let id = self.append_node(label, vector)?;
        self.pool.grow(self.labels.len());
        self.link(id)?;
        Ok(id)
    }

    /// Append to the cell and create the (unlinked) node entry.
    fn append_node(&mut self, label: LabelId, vector: &[f32]) -> Result<InnerId> {
        if self.label_map.contains_key(&label) {
            return Err(QuiverError::invalid_argument(format!(
                "duplicate label {label}"
            )));
        }
        let id = self.cell.push(vector)?;
        let level = self.draw_level();
        self.labels.push(label);
        self.label_map.insert(label, id);
        self.nodes.push(RwLock::new(NodeLinks::with_level(level)));
        Ok(id)
    }

    fn draw_level(&self) -> usize {
        let r: f64 = self.level_rng.lock().gen();
        ((-r.max(f64::MIN_POSITIVE).ln() * self.ml).floor() as usize).min(MAX_LEVEL)
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> usize {
        self.opts.dim
    }

    /// Index options.
    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    /// Borrow the underlying corpus cell.
    pub fn cell(&self) -> &FlattenCell {
        &self.cell
    }

    /// Labels in insertion (internal id) order.
    pub fn labels(&self) -> &[LabelId] {
        &self.labels
    }

    /// Distance between a raw query and the stored vector with `label`.
    pub fn get_distance_by_label(&self, label: LabelId, query: &[f32]) -> Result<f32> {
        let id = self
            .label_map
            .get(&label)
            .copied()
            .ok_or_else(|| QuiverError::invalid_argument(format!("unknown label {label}")))?;
        let query = self.cell.prepare_query(query)?;
        Ok(self.cell.compute_query(&query, id))
    }

    #[inline]
    fn level_cap(&self, level: usize) -> usize {
        if level == 0 {
            self.opts.max_degree * 2
        } else {
            self.opts.max_degree
        }
    }

    fn entry_snapshot(&self) -> Option<(InnerId, usize)> {
        self.entry.lock().entry
    }

    /// Clone a node's neighbor ids at a layer.
    fn neighbors_at(&self, id: InnerId, level: usize) -> SmallVec<[Neighbor; 32]> {
        let links = self.nodes[id.index()].read();
        if level < links.levels.len() {
            SmallVec::from_slice(links.levels[level].as_slice())
        } else {
            SmallVec::new()
        }
    }

    // =========================================================================
    // Linking
    // =========================================================================

    fn link(&self, id: InnerId) -> Result<()> {
        let level = self.nodes[id.index()].read().level();
        let Some((mut ep, max_level)) = self.entry_snapshot() else {
            // First node: nothing to link against.
            let mut state = self.entry.lock();
            if state.entry.is_none() {
                state.entry = Some((id, level));
            }
            return Ok(());
        };

        let mut ep_dist = self.cell.compute_pair(id, ep);
        for lc in (level + 1..=max_level).rev() {
            self.greedy_descend_pair(id, &mut ep, &mut ep_dist, lc);
        }

        let mut eps: Vec<Neighbor> = vec![Neighbor::new(ep, ep_dist)];
        for lc in (0..=level.min(max_level)).rev() {
            let candidates =
                self.search_layer_pair(id, &eps, self.opts.ef_construction, lc);
            let cap = self.level_cap(lc);
            let selected = self.select_diverse_pairs(&candidates, cap);
            for n in &selected {
                self.add_link(id, *n, lc);
                self.add_link(n.id, Neighbor::new(id, n.distance), lc);
            }
            if !selected.is_empty() {
                eps = selected;
            }
        }

        if level > max_level {
            let mut state = self.entry.lock();
            match state.entry {
                Some((_, current)) if current >= level => {}
                _ => state.entry = Some((id, level)),
            }
        }
        Ok(())
    }

    /// Greedy move toward the stored vector `query_id` on one layer.
    fn greedy_descend_pair(
        &self,
        query_id: InnerId,
        ep: &mut InnerId,
        ep_dist: &mut f32,
        level: usize,
    ) {
        loop {
            let mut changed = false;
            for n in self.neighbors_at(*ep, level) {
                let dist = self.cell.compute_pair(query_id, n.id);
                if dist < *ep_dist {
                    *ep = n.id;
                    *ep_dist = dist;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Beam search on one layer against a stored vector, returning up to
    /// `ef` nearest candidates sorted by ascending distance.
    fn search_layer_pair(
        &self,
        query_id: InnerId,
        entry_points: &[Neighbor],
        ef: usize,
        level: usize,
    ) -> Vec<Neighbor> {
        let mut visited = self.pool.acquire();
        let mut candidates: BinaryHeap<Reverse<Neighbor>> = BinaryHeap::with_capacity(ef);
        let mut top: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(ef + 1);

        for &n in entry_points {
            if visited.insert(n.id.as_u32()) && n.id != query_id {
                candidates.push(Reverse(n));
                top.push(n);
            }
        }
        visited.set(query_id.as_u32());

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = top.peek().map_or(f32::MAX, |n| n.distance);
            if current.distance > worst && top.len() >= ef {
                break;
            }
            for n in self.neighbors_at(current.id, level) {
                if !visited.insert(n.id.as_u32()) {
                    continue;
                }
                let dist = self.cell.compute_pair(query_id, n.id);
                let worst = top.peek().map_or(f32::MAX, |n| n.distance);
                if top.len() < ef || dist < worst {
                    let scored = Neighbor::new(n.id, dist);
                    candidates.push(Reverse(scored));
                    top.push(scored);
                    if top.len() > ef {
                        top.pop();
                    }
                }
            }
        }

        self.pool.release(visited);
        top.into_sorted_vec()
    }

    /// Diversity pruning over candidates sorted by ascending distance:
    /// accept a candidate iff no already-accepted neighbor sits closer to it
    /// (scaled by alpha) than the candidate is to the query.
    fn select_diverse_pairs(&self, candidates: &[Neighbor], cap: usize) -> Vec<Neighbor> {
        let mut selected: Vec<Neighbor> = Vec::with_capacity(cap);
        for &c in candidates {
            if selected.len() >= cap {
                break;
            }
            let dominated = selected.iter().any(|kept| {
                self.cell.compute_pair(c.id, kept.id) * self.alpha < c.distance
            });
            if !dominated {
                selected.push(c);
            }
        }
        selected
    }

    /// Add a directed edge, re-pruning the source list when it overflows
    /// its cap. Holds exactly one node lock.
    fn add_link(&self, from: InnerId, to: Neighbor, level: usize) {
        debug_assert_ne!(from, to.id);
        let cap = self.level_cap(level);
        let mut links = self.nodes[from.index()].write();
        if level >= links.levels.len() {
            return;
        }
        let list = &mut links.levels[level];
        if list.contains(to.id) {
            return;
        }
        list.push(to);
        if list.len() > cap {
            let mut sorted: Vec<Neighbor> = list.as_slice().to_vec();
            sorted.sort_unstable();
            let kept = self.select_diverse_pairs(&sorted, cap);
            list.replace(kept);
        }
    }

    /// Sort every list and refresh thresholds; called at the end of a batch
    /// build so post-build invariants hold without locking during search.
    fn stabilize_all(&self) {
        for (i, node) in self.nodes.iter().enumerate() {
            let mut links = node.write();
            for (lc, list) in links.levels.iter_mut().enumerate() {
                let cap = if lc == 0 {
                    self.opts.max_degree * 2
                } else {
                    self.opts.max_degree
                };
                list.stabilize(InnerId::new(i as u32), cap);
            }
        }
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Search for the `k` nearest neighbors of `query`.
    pub fn search(&self, query: &[f32], k: usize, params: SearchParams) -> Result<Vec<SearchResult>> {
        self.search_with_filter(query, k, params, None)
    }

    /// Filtered search. Nodes failing the predicate are still explored so
    /// the walk stays navigable, but never yielded; the beam widens by the
    /// filter's valid ratio.
    pub fn search_with_filter(
        &self,
        query: &[f32],
        k: usize,
        params: SearchParams,
        filter: Option<&dyn FilterPredicate>,
    ) -> Result<Vec<SearchResult>> {
        params.validate()?;
        if k == 0 {
            return Err(QuiverError::invalid_argument("k must be positive"));
        }
        let Some((ep, max_level)) = self.entry_snapshot() else {
            return Err(QuiverError::NotBuilt);
        };

        let query = self.cell.prepare_query(query)?;
        let mut ep = Neighbor::new(ep, self.cell.compute_query(&query, ep));
        for lc in (1..=max_level).rev() {
            self.greedy_descend_query(&query, &mut ep, lc);
        }

        let ef = self.effective_ef(params, filter).max(k);
        let mut visited = self.pool.acquire();
        let top = self.beam_layer0(&query, ep, ef, filter, &mut visited);
        self.pool.release(visited);

        Ok(top
            .into_sorted_vec()
            .into_iter()
            .take(k)
            .map(|n| SearchResult::new(self.labels[n.id.index()], n.distance))
            .collect())
    }

    fn effective_ef(&self, params: SearchParams, filter: Option<&dyn FilterPredicate>) -> usize {
        let ratio = match filter {
            Some(f) => params.valid_ratio.min(f.valid_ratio()).clamp(0.0, 1.0),
            None => params.valid_ratio,
        };
        if ratio > 0.0 && ratio < 1.0 {
            (params.ef_search as f32 / ratio).ceil() as usize
        } else {
            params.ef_search
        }
    }

    fn greedy_descend_query(&self, query: &[f32], ep: &mut Neighbor, level: usize) {
        loop {
            let mut changed = false;
            for n in self.neighbors_at(ep.id, level) {
                let dist = self.cell.compute_query(query, n.id);
                if dist < ep.distance {
                    *ep = Neighbor::new(n.id, dist);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Layer-0 beam search. Every reachable node is explored; only nodes
    /// passing the filter enter the result heap.
    fn beam_layer0(
        &self,
        query: &[f32],
        ep: Neighbor,
        ef: usize,
        filter: Option<&dyn FilterPredicate>,
        visited: &mut VisitedSet,
    ) -> BinaryHeap<Neighbor> {
        let mut candidates: BinaryHeap<Reverse<Neighbor>> = BinaryHeap::with_capacity(ef);
        let mut top: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(ef + 1);

        visited.set(ep.id.as_u32());
        candidates.push(Reverse(ep));
        if self.passes(filter, ep.id) {
            top.push(ep);
        }

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = top.peek().map_or(f32::MAX, |n| n.distance);
            if current.distance > worst && top.len() >= ef {
                break;
            }
            for n in self.neighbors_at(current.id, 0) {
                if !visited.insert(n.id.as_u32()) {
                    continue;
                }
                self.cell.prefetch(n.id);
                let dist = self.cell.compute_query(query, n.id);
                let worst = top.peek().map_or(f32::MAX, |n| n.distance);
                if top.len() < ef || dist < worst {
                    let scored = Neighbor::new(n.id, dist);
                    candidates.push(Reverse(scored));
                    if self.passes(filter, n.id) {
                        top.push(scored);
                        if top.len() > ef {
                            top.pop();
                        }
                    }
                }
            }
        }
        top
    }

    #[inline]
    fn passes(&self, filter: Option<&dyn FilterPredicate>, id: InnerId) -> bool {
        filter.map_or(true, |f| f.accepts(self.labels[id.index()]))
    }

    // =========================================================================
    // Iterated retrieval
    // =========================================================================

    /// Return the next `k` nearest results not yielded by earlier calls on
    /// the same context. The first call searches from scratch; later calls
    /// resume from the context's discard frontier. A short batch means the
    /// reachable, predicate-passing corpus is exhausted.
    pub fn knn_iterate(
        &self,
        ctx: &mut IteratorContext,
        query: &[f32],
        k: usize,
        filter: Option<&dyn FilterPredicate>,
    ) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Err(QuiverError::invalid_argument("k must be positive"));
        }
        let Some((ep, max_level)) = self.entry_snapshot() else {
            return Err(QuiverError::NotBuilt);
        };
        let query = self.cell.prepare_query(query)?;
        let ef = ctx.ef_search().max(k);

        let mut accepted: Vec<Neighbor> = Vec::new();
        let mut explored: Vec<Neighbor> = Vec::new();

        if ctx.is_first_use() {
            let mut ep = Neighbor::new(ep, self.cell.compute_query(&query, ep));
            for lc in (1..=max_level).rev() {
                self.greedy_descend_query(&query, &mut ep, lc);
            }
            self.iterate_episode(ctx, &query, ef, filter, vec![ep], &mut accepted, &mut explored);
            ctx.set_first_use_done();
        }

        while accepted.len() < k && !ctx.discard_empty() {
            let seeds = ctx.drain_discard();
            if seeds.is_empty() {
                break;
            }
            let progress = self.iterate_episode(
                ctx,
                &query,
                ef,
                filter,
                seeds,
                &mut accepted,
                &mut explored,
            );
            if !progress {
                // Nothing new was expanded or accepted; the remaining
                // frontier cannot produce fresh results for this predicate
                // state, so stop instead of spinning.
                break;
            }
        }

        dedup_by_id(&mut accepted);
        accepted.sort_unstable();
        let results: Vec<Neighbor> = accepted.iter().copied().take(k).collect();
        for n in &results {
            ctx.set_returned(n.id);
        }

        // Everything scored but not returned stays available for the next
        // call.
        dedup_by_id(&mut explored);
        for n in explored {
            if !ctx.is_returned(n.id) {
                ctx.add_discard(n);
            }
        }

        Ok(results
            .into_iter()
            .map(|n| SearchResult::new(self.labels[n.id.index()], n.distance))
            .collect())
    }

    /// One beam episode for iterated retrieval. Seeds come from the entry
    /// point (first call) or the discard frontier (later calls). Returns
    /// true when the episode expanded a new neighborhood or accepted a new
    /// result.
    #[allow(clippy::too_many_arguments)]
    fn iterate_episode(
        &self,
        ctx: &mut IteratorContext,
        query: &[f32],
        ef: usize,
        filter: Option<&dyn FilterPredicate>,
        seeds: Vec<Neighbor>,
        accepted: &mut Vec<Neighbor>,
        explored: &mut Vec<Neighbor>,
    ) -> bool {
        let mut visited = self.pool.acquire();
        let mut candidates: BinaryHeap<Reverse<Neighbor>> = BinaryHeap::with_capacity(ef);
        let mut top: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(ef + 1);
        let mut progress = false;

        for s in seeds {
            if !visited.insert(s.id.as_u32()) {
                continue;
            }
            candidates.push(Reverse(s));
            explored.push(s);
            if self.passes(filter, s.id) && !ctx.is_returned(s.id) {
                top.push(s);
                if top.len() > ef {
                    top.pop();
                }
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = top.peek().map_or(f32::MAX, |n| n.distance);
            if current.distance > worst && top.len() >= ef {
                break;
            }
            if !ctx.is_expanded(current.id) {
                progress = true;
            }
            ctx.mark_expanded(current.id);
            for n in self.neighbors_at(current.id, 0) {
                if !visited.insert(n.id.as_u32()) {
                    continue;
                }
                let dist = match ctx.memo(n.id) {
                    Some(d) => d,
                    None => {
                        let d = self.cell.compute_query(query, n.id);
                        ctx.memoize(n.id, d);
                        d
                    }
                };
                let worst = top.peek().map_or(f32::MAX, |n| n.distance);
                if top.len() < ef || dist < worst {
                    let scored = Neighbor::new(n.id, dist);
                    candidates.push(Reverse(scored));
                    explored.push(scored);
                    if self.passes(filter, n.id) && !ctx.is_returned(n.id) {
                        top.push(scored);
                        if top.len() > ef {
                            top.pop();
                        }
                    }
                }
            }
        }

        self.pool.release(visited);
        if !top.is_empty() {
            progress = true;
        }
        accepted.extend(top.into_sorted_vec());
        progress
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Snapshot layer 0 into a flat graph store (stabilized lists, current
    /// entry point).
    pub fn to_graph_store(&self) -> GraphStore {
        let mut graph = GraphStore::new(self.len(), self.opts.max_degree * 2);
        for i in 0..self.len() {
            let id = InnerId::new(i as u32);
            let mut list = NeighborList::new();
            for n in self.nodes[i].read().levels[0].as_slice() {
                list.push(*n);
            }
            list.stabilize(id, self.opts.max_degree * 2);
            graph.set_node(id, list);
        }
        graph.set_entry_point(self.entry_snapshot().map(|(ep, _)| ep));
        graph
    }

    /// Per-node levels, for serialization.
    pub(crate) fn node_levels(&self) -> Vec<usize> {
        self.nodes.iter().map(|n| n.read().level()).collect()
    }

    /// Higher-layer adjacency of one node, for serialization.
    pub(crate) fn upper_links(&self, id: InnerId) -> Vec<Vec<InnerId>> {
        let links = self.nodes[id.index()].read();
        links.levels[1..]
            .iter()
            .map(|l| l.as_slice().iter().map(|n| n.id).collect())
            .collect()
    }

    /// Rebuild internals from deserialized parts. Edge distances are
    /// rescored against the cell and every list is stabilized.
    pub(crate) fn assemble(
        opts: IndexOptions,
        cell: FlattenCell,
        labels: Vec<LabelId>,
        levels: Vec<usize>,
        adjacency: Vec<Vec<Vec<InnerId>>>,
        entry: Option<(InnerId, usize)>,
    ) -> Result<Self> {
        let n = labels.len();
        if cell.len() != n || levels.len() != n || adjacency.len() != n {
            return Err(QuiverError::corrupt("index sections disagree on node count"));
        }
        let ml = 1.0 / (opts.max_degree as f64).ln();
        let label_map: HashMap<LabelId, InnerId> = labels
            .iter()
            .enumerate()
            .map(|(i, &l)| (l, InnerId::new(i as u32)))
            .collect();
        if label_map.len() != n {
            return Err(QuiverError::corrupt("duplicate labels in snapshot"));
        }

        let mut nodes = Vec::with_capacity(n);
        for (i, per_level) in adjacency.iter().enumerate() {
            let id = InnerId::new(i as u32);
            if per_level.len() != levels[i] + 1 {
                return Err(QuiverError::corrupt("node level disagrees with adjacency"));
            }
            let mut links = NodeLinks::with_level(levels[i]);
            for (lc, ids) in per_level.iter().enumerate() {
                let cap = if lc == 0 {
                    opts.max_degree * 2
                } else {
                    opts.max_degree
                };
                if ids.len() > cap {
                    return Err(QuiverError::corrupt(format!(
                        "node {i} layer {lc} degree {} exceeds cap {cap}",
                        ids.len()
                    )));
                }
                let list = &mut links.levels[lc];
                for &nbr in ids {
                    if nbr.index() >= n {
                        return Err(QuiverError::corrupt("neighbor id out of range"));
                    }
                    list.push(Neighbor::new(nbr, cell.compute_pair(id, nbr)));
                }
                list.stabilize(id, cap);
            }
            nodes.push(RwLock::new(links));
        }

        if let Some((ep, level)) = entry {
            if ep.index() >= n || level != nodes[ep.index()].read().level() {
                return Err(QuiverError::corrupt("entry point disagrees with levels"));
            }
        }

        Ok(Self {
            alpha: opts.alpha,
            opts,
            cell,
            pool: VisitedPool::new(n),
            label_map,
            nodes,
            entry: Mutex::new(EntryState { entry }),
            ml,
            level_rng: Mutex::new(StdRng::seed_from_u64(0)),
            labels,
        })
    }

    pub(crate) fn entry_for_serialization(&self) -> Option<(InnerId, usize)> {
        self.entry_snapshot()
    }
}

fn dedup_by_id(nodes: &mut Vec<Neighbor>) {
    nodes.sort_unstable_by_key(|n| n.id);
    nodes.dedup_by_key(|n| n.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Encoding, IndexOptions, Metric};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    fn labels(n: usize) -> Vec<LabelId> {
        (0..n as u64).map(LabelId::new).collect()
    }

    fn small_opts(dim: usize) -> IndexOptions {
        IndexOptions::new(dim, Metric::L2)
            .with_max_degree(12)
            .with_ef_construction(60)
    }

    #[test]
    fn test_empty_index_search_fails() {
        let index = HnswIndex::new(small_opts(8)).unwrap();
        assert!(matches!(
            index.search(&[0.0; 8], 5, SearchParams::new(10)),
            Err(QuiverError::NotBuilt)
        ));
    }

    #[test]
    fn test_single_vector() {
        let mut index = HnswIndex::new(small_opts(8)).unwrap();
        index.insert(LabelId::new(42), &[1.0; 8]).unwrap();

        let results = index.search(&[1.0; 8], 1, SearchParams::new(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, LabelId::new(42));
        assert!(results[0].distance < 1e-5);
    }

    #[test]
    fn test_exact_vector_found() {
        let dim = 16;
        let data = random_vectors(200, dim, 7);
        let index = HnswIndex::build(small_opts(dim), &labels(200), &data, 7).unwrap();

        for probe in [0usize, 50, 199] {
            let results = index
                .search(&data[probe], 1, SearchParams::new(50))
                .unwrap();
            assert_eq!(results[0].label, LabelId::new(probe as u64));
            assert!(results[0].distance < 1e-5);
        }
    }

    #[test]
    fn test_results_sorted_ascending() {
        let dim = 16;
        let data = random_vectors(300, dim, 8);
        let index = HnswIndex::build(small_opts(dim), &labels(300), &data, 8).unwrap();

        let query = random_vectors(1, dim, 99).pop().unwrap();
        let results = index.search(&query, 10, SearchParams::new(50)).unwrap();
        assert_eq!(results.len(), 10);
        for w in results.windows(2) {
            assert!(w[0].distance <= w[1].distance);
        }
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut index = HnswIndex::new(small_opts(4)).unwrap();
        index.insert(LabelId::new(1), &[0.0; 4]).unwrap();
        assert!(index.insert(LabelId::new(1), &[1.0; 4]).is_err());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_post_build_graph_invariants() {
        let dim = 8;
        let data = random_vectors(400, dim, 9);
        let index = HnswIndex::build(small_opts(dim), &labels(400), &data, 9).unwrap();

        let graph = index.to_graph_store();
        graph.check_invariants().unwrap();

        // Cached distances agree with the cell.
        for i in (0..400).step_by(37) {
            let id = InnerId::new(i as u32);
            for n in graph.node(id).as_slice() {
                let expected = index.cell().compute_pair(id, n.id);
                assert!((expected - n.distance).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_filtered_search_yields_only_accepted() {
        use crate::filter::ClosureFilter;

        let dim = 8;
        let data = random_vectors(300, dim, 10);
        let index = HnswIndex::build(small_opts(dim), &labels(300), &data, 10).unwrap();

        let filter =
            ClosureFilter::new(|l: LabelId| l.as_u64() % 2 == 1).with_valid_ratio(0.5);
        let query = random_vectors(1, dim, 55).pop().unwrap();
        let results = index
            .search_with_filter(&query, 10, SearchParams::new(40), Some(&filter))
            .unwrap();

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.label.as_u64() % 2 == 1));
    }

    #[test]
    fn test_get_distance_by_label() {
        let dim = 8;
        let data = random_vectors(50, dim, 11);
        let index = HnswIndex::build(small_opts(dim), &labels(50), &data, 11).unwrap();

        let d = index
            .get_distance_by_label(LabelId::new(3), &data[3])
            .unwrap();
        assert!(d < 1e-5);
        assert!(index
            .get_distance_by_label(LabelId::new(999), &data[3])
            .is_err());
    }

    #[test]
    fn test_build_cancellation() {
        let dim = 8;
        let data = random_vectors(2000, dim, 12);
        let token = CancelToken::new();
        token.cancel();
        let result =
            HnswIndex::build_with_cancel(small_opts(dim), &labels(2000), &data, 12, Some(&token));
        assert!(matches!(result, Err(QuiverError::Cancelled)));
    }

    #[test]
    fn test_iterate_disjoint_batches() {
        let dim = 8;
        let data = random_vectors(200, dim, 13);
        let index = HnswIndex::build(small_opts(dim), &labels(200), &data, 13).unwrap();
        let query = random_vectors(1, dim, 77).pop().unwrap();

        let mut ctx = IteratorContext::new(index.len(), 40).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let batch = index.knn_iterate(&mut ctx, &query, 10, None).unwrap();
            for r in &batch {
                assert!(seen.insert(r.label.as_u64()), "label {} repeated", r.label);
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn test_iterate_exhausts_corpus() {
        let dim = 8;
        let n = 60;
        let data = random_vectors(n, dim, 14);
        let index = HnswIndex::build(small_opts(dim), &labels(n), &data, 14).unwrap();
        let query = random_vectors(1, dim, 78).pop().unwrap();

        let mut ctx = IteratorContext::new(index.len(), 30).unwrap();
        let mut seen = std::collections::HashSet::new();
        loop {
            let batch = index.knn_iterate(&mut ctx, &query, 10, None).unwrap();
            if batch.is_empty() {
                break;
            }
            for r in &batch {
                assert!(seen.insert(r.label.as_u64()));
            }
        }
        // Every vector reachable from the entry point was yielded once.
        assert_eq!(seen.len(), n);
    }

    #[test]
    fn test_bf16_build_and_search() {
        let dim = 16;
        let data = random_vectors(150, dim, 15);
        let opts = small_opts(dim).with_encoding(Encoding::Bf16);
        let index = HnswIndex::build(opts, &labels(150), &data, 15).unwrap();

        let results = index.search(&data[7], 1, SearchParams::new(40)).unwrap();
        assert_eq!(results[0].label, LabelId::new(7));
    }
}
