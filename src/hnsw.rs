//! Hierarchical Navigable Small World index for approximate k-NN search.
//!
//! One instance per embedded kind (text-unit, entity, community) per session.
//! The graph is layered: layer assignment follows a geometric distribution
//! with `ml = 1/ln(M)`, inserts wire bidirectional edges chosen by a
//! closest-with-diversity heuristic, and searches do a greedy descent
//! followed by an ef-bounded candidate sweep at layer 0.
//!
//! Deletes are soft: tombstoned nodes still route traversals but never
//! appear in results or new neighbor selections. `compact` rebuilds the
//! graph from live vectors once the tombstone ratio passes the threshold.
//!
//! Mutation requires `&mut self`; the owning engine wraps each index in a
//! `RwLock` so searches run concurrently and inserts are serialised.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GibramError, Result};
use crate::simd::DistanceKind;

/// Tombstone share above which `needs_compaction` reports true.
const COMPACTION_THRESHOLD: f64 = 0.20;

/// Hard cap on layer assignment.
const MAX_LEVEL: usize = 32;

/// Construction parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Max neighbors per node per layer above 0. Layer 0 allows `2 * m`.
    pub m: usize,
    /// Candidate list width during construction.
    pub ef_construction: usize,
    /// Default candidate list width for searches that do not pass one.
    pub ef_search: usize,
    /// Seed for level sampling; fixed seed makes rebuilds deterministic.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            seed: 0x6762_7261_6d31,
        }
    }
}

/// A search hit: record id, raw distance, and caller-facing similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: u64,
    pub distance: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
struct Node {
    id: u64,
    vector: Vec<f32>,
    /// Neighbor slots, one `Vec` per layer 0..=level.
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

impl Node {
    fn new(id: u64, vector: Vec<f32>, level: usize) -> Self {
        Self {
            id,
            vector,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        }
    }
}

/// Total order on distances: NaN sorts worse (greater) than anything.
#[inline]
fn cmp_dist(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Heap entry; `Ord` is distance-then-id so ties break toward the lower id.
#[derive(Clone, Copy)]
struct Candidate {
    node: usize,
    id: u64,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}
impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_dist(self.distance, other.distance).then(self.id.cmp(&other.id))
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reverses `Candidate` ordering, turning `BinaryHeap` into a min-heap.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Closest(Candidate);

impl Ord for Closest {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}
impl PartialOrd for Closest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Multi-layer proximity graph over fixed-dimension f32 vectors.
pub struct HnswIndex {
    kind: DistanceKind,
    dim: usize,
    config: HnswConfig,
    /// `1 / ln(m)`, the geometric level parameter.
    ml: f64,
    nodes: Vec<Node>,
    id_to_node: HashMap<u64, usize>,
    entry_point: Option<usize>,
    max_layer: usize,
    tombstones: usize,
    rng: ChaCha8Rng,
}

impl HnswIndex {
    pub fn new(dim: usize, kind: DistanceKind, config: HnswConfig) -> Self {
        let ml = 1.0 / (config.m.max(2) as f64).ln();
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            kind,
            dim,
            config,
            ml,
            nodes: Vec::new(),
            id_to_node: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            tombstones: 0,
            rng,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn distance_kind(&self) -> DistanceKind {
        self.kind
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.id_to_node
            .get(&id)
            .map_or(false, |&n| !self.nodes[n].deleted)
    }

    /// Live `(id, vector)` pairs, for snapshotting and rebuilds.
    pub fn iter_vectors(&self) -> impl Iterator<Item = (u64, &[f32])> {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.vector.as_slice()))
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.kind.distance(a, b)
    }

    fn similarity_of(&self, distance: f32) -> f32 {
        match self.kind {
            DistanceKind::Cosine => 1.0 - distance,
            DistanceKind::L2 | DistanceKind::Dot => -distance,
        }
    }

    fn sample_level(&mut self) -> usize {
        let u: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        ((-u.ln() * self.ml).floor() as usize).min(MAX_LEVEL)
    }

    /// Insert a vector under `id`. Re-inserting an existing id replaces its
    /// vector (tombstone + fresh node), which makes WAL replay idempotent.
    pub fn insert(&mut self, id: u64, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(GibramError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        if self.id_to_node.contains_key(&id) {
            self.remove(id);
        }

        let level = self.sample_level();
        let node_idx = self.nodes.len();
        self.nodes.push(Node::new(id, vector, level));
        self.id_to_node.insert(id, node_idx);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(node_idx);
            self.max_layer = level;
            return Ok(());
        };

        let query = self.nodes[node_idx].vector.clone();

        // Greedy descent keeps only the single best node until we reach the
        // insertion level.
        let mut current = entry;
        for layer in ((level + 1)..=self.max_layer).rev() {
            current = self.greedy_step(&query, current, layer);
        }

        // From the insertion level down, run the ef-bounded search and wire
        // edges chosen by the diversity heuristic.
        for layer in (0..=level.min(self.max_layer)).rev() {
            let found = self.search_layer(&query, current, self.config.ef_construction, layer);
            let cap = self.layer_cap(layer);
            let selected = self.select_neighbors(&query, &found, self.config.m);

            for &neighbor in &selected {
                self.nodes[node_idx].neighbors[layer].push(neighbor);
                self.nodes[neighbor].neighbors[layer].push(node_idx);
                self.prune_neighbors(neighbor, layer, cap);
            }

            if let Some(best) = found.first() {
                current = best.node;
            }
        }

        if level > self.max_layer {
            self.entry_point = Some(node_idx);
            self.max_layer = level;
        }
        Ok(())
    }

    /// k-NN search. Empty index returns an empty vec; when fewer than `k`
    /// results exist the search pads with whatever it produced.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(GibramError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 || self.len() == 0 {
            return Ok(Vec::new());
        }

        let ef = ef.unwrap_or(self.config.ef_search).max(k);

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            current = self.greedy_step(query, current, layer);
        }

        let candidates = self.search_layer(query, current, ef, 0);
        Ok(candidates
            .into_iter()
            .filter(|c| !self.nodes[c.node].deleted)
            .take(k)
            .map(|c| SearchHit {
                id: c.id,
                distance: c.distance,
                similarity: self.similarity_of(c.distance),
            })
            .collect())
    }

    /// Soft-delete. Returns false when the id is absent (or already gone),
    /// which keeps Delete replay a no-op.
    pub fn remove(&mut self, id: u64) -> bool {
        let Some(&node_idx) = self.id_to_node.get(&id) else {
            return false;
        };
        if self.nodes[node_idx].deleted {
            return false;
        }
        self.nodes[node_idx].deleted = true;
        self.tombstones += 1;
        self.id_to_node.remove(&id);
        true
    }

    pub fn tombstone_ratio(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        self.tombstones as f64 / self.nodes.len() as f64
    }

    /// True once tombstones exceed 20% of stored nodes.
    pub fn needs_compaction(&self) -> bool {
        self.tombstone_ratio() > COMPACTION_THRESHOLD
    }

    /// Rebuild the graph from live vectors, dropping tombstones. Not on the
    /// hot path; level sampling restarts from the configured seed so a
    /// rebuilt index is deterministic.
    pub fn compact(&mut self) -> Result<usize> {
        let dropped = self.tombstones;
        if dropped == 0 {
            return Ok(0);
        }

        let mut live: Vec<(u64, Vec<f32>)> = self
            .nodes
            .drain(..)
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.vector))
            .collect();
        live.sort_by_key(|(id, _)| *id);

        self.id_to_node.clear();
        self.entry_point = None;
        self.max_layer = 0;
        self.tombstones = 0;
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        for (id, vector) in live {
            self.insert(id, vector)?;
        }
        Ok(dropped)
    }

    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    /// One greedy hop loop: move to the closest neighbor until no neighbor
    /// improves on the current node.
    fn greedy_step(&self, query: &[f32], entry: usize, layer: usize) -> usize {
        let mut current = entry;
        let mut current_dist = self.distance(query, &self.nodes[current].vector);

        loop {
            let mut improved = false;
            if layer < self.nodes[current].neighbors.len() {
                for &nb in &self.nodes[current].neighbors[layer] {
                    let d = self.distance(query, &self.nodes[nb].vector);
                    if cmp_dist(d, current_dist) == Ordering::Less {
                        current = nb;
                        current_dist = d;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// ef-bounded best-first sweep of one layer. Returns candidates sorted
    /// closest-first. Tombstoned nodes are traversed but callers filter them
    /// from results and neighbor selection.
    fn search_layer(&self, query: &[f32], entry: usize, ef: usize, layer: usize) -> Vec<Candidate> {
        let entry_dist = self.distance(query, &self.nodes[entry].vector);
        let entry_cand = Candidate {
            node: entry,
            id: self.nodes[entry].id,
            distance: entry_dist,
        };

        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(entry);

        let mut candidates: BinaryHeap<Closest> = BinaryHeap::new();
        candidates.push(Closest(entry_cand));

        // Max-heap of the ef best seen so far; root is the worst kept.
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        results.push(entry_cand);

        while let Some(Closest(closest)) = candidates.pop() {
            let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if results.len() >= ef && cmp_dist(closest.distance, worst) == Ordering::Greater {
                break;
            }

            if layer < self.nodes[closest.node].neighbors.len() {
                for &nb in &self.nodes[closest.node].neighbors[layer] {
                    if !visited.insert(nb) {
                        continue;
                    }
                    let d = self.distance(query, &self.nodes[nb].vector);
                    let cand = Candidate {
                        node: nb,
                        id: self.nodes[nb].id,
                        distance: d,
                    };
                    let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
                    if results.len() < ef || cmp_dist(d, worst) == Ordering::Less {
                        candidates.push(Closest(cand));
                        results.push(cand);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results.into_vec();
        out.sort();
        out
    }

    /// Simple-heuristic selection: take candidates closest-first, but drop
    /// any candidate that sits closer to an already-chosen neighbor than to
    /// the query (it is dominated and adds no diversity).
    fn select_neighbors(&self, query: &[f32], candidates: &[Candidate], m: usize) -> Vec<usize> {
        let mut chosen: Vec<usize> = Vec::with_capacity(m);
        for cand in candidates {
            if chosen.len() >= m {
                break;
            }
            if self.nodes[cand.node].deleted {
                continue;
            }
            let dominated = chosen.iter().any(|&c| {
                let d = self.distance(&self.nodes[cand.node].vector, &self.nodes[c].vector);
                cmp_dist(d, cand.distance) == Ordering::Less
            });
            if !dominated {
                chosen.push(cand.node);
            }
        }

        // Diversity alone may under-fill; pad with the closest remainder.
        if chosen.len() < m {
            for cand in candidates {
                if chosen.len() >= m {
                    break;
                }
                if !self.nodes[cand.node].deleted && !chosen.contains(&cand.node) {
                    chosen.push(cand.node);
                }
            }
        }
        chosen
    }

    /// Re-apply the selection heuristic to an over-full neighbor list.
    fn prune_neighbors(&mut self, node: usize, layer: usize, cap: usize) {
        if self.nodes[node].neighbors[layer].len() <= cap {
            return;
        }
        let base = self.nodes[node].vector.clone();
        let mut with_dist: Vec<Candidate> = self.nodes[node].neighbors[layer]
            .iter()
            .map(|&nb| Candidate {
                node: nb,
                id: self.nodes[nb].id,
                distance: self.distance(&base, &self.nodes[nb].vector),
            })
            .collect();
        with_dist.sort();
        self.nodes[node].neighbors[layer] = self.select_neighbors(&base, &with_dist, cap);
    }
}
