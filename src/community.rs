//! Hierarchical Leiden community detection over the entity-relationship
//! graph.
//!
//! The relationship set is treated as an undirected weighted multigraph.
//! Each level runs three phases: local moving (greedy modularity
//! optimisation over a seeded node permutation), refinement (local moving
//! restarted from singletons inside each community, which is what keeps
//! Leiden communities well-connected), and aggregation into a super-graph.
//! Levels repeat until modularity stops improving or `max_iterations` is
//! reached.
//!
//! Determinism: all iteration is index-ordered and the only randomness is a
//! `ChaCha8Rng` permutation seeded from the config, so a fixed seed, graph,
//! and resolution produce byte-identical output.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Modularity improvement below this ends the level loop.
const MIN_MODULARITY_GAIN: f64 = 1e-7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeidenConfig {
    /// Resolution γ; larger values favour more, smaller communities.
    pub resolution: f64,
    pub max_iterations: usize,
    pub random_seed: u64,
    /// Clusters below this size are not emitted as community records.
    pub min_community_size: usize,
}

impl Default for LeidenConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 10,
            random_seed: 42,
            min_community_size: 1,
        }
    }
}

/// One undirected input edge.
#[derive(Debug, Clone, Copy)]
pub struct LeidenEdge {
    pub source: u64,
    pub target: u64,
    pub weight: f32,
}

/// Cluster assignment at one hierarchy level; level 0 is the finest.
#[derive(Debug, Clone)]
pub struct LeidenLevel {
    pub level: u32,
    /// Clusters of original entity ids, each sorted ascending; clusters are
    /// ordered by their smallest member.
    pub clusters: Vec<Vec<u64>>,
    pub modularity: f64,
}

/// Flat detection: the converged partition, emitted as a single level 0.
pub fn leiden(entity_ids: &[u64], edges: &[LeidenEdge], config: &LeidenConfig) -> LeidenLevel {
    let mut levels = hierarchical_leiden(entity_ids, edges, config);
    match levels.pop() {
        Some(mut last) => {
            last.level = 0;
            last
        }
        None => LeidenLevel {
            level: 0,
            clusters: Vec::new(),
            modularity: 0.0,
        },
    }
}

/// Full hierarchy, finest (level 0) to coarsest.
pub fn hierarchical_leiden(
    entity_ids: &[u64],
    edges: &[LeidenEdge],
    config: &LeidenConfig,
) -> Vec<LeidenLevel> {
    if entity_ids.is_empty() {
        return Vec::new();
    }

    let mut ids: Vec<u64> = entity_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut graph = Graph::build(&ids, edges);
    let mut rng = ChaCha8Rng::seed_from_u64(config.random_seed);

    // node_origin[i] = original node indexes folded into current node i.
    let mut node_origin: Vec<Vec<usize>> = (0..graph.len()).map(|i| vec![i]).collect();

    let mut levels: Vec<LeidenLevel> = Vec::new();
    let mut last_modularity = f64::NEG_INFINITY;

    for round in 0..config.max_iterations.max(1) {
        let mut partition = Partition::singletons(graph.len());
        local_moving(&graph, &mut partition, config.resolution, &mut rng);
        let refined = refine(&graph, &partition, config.resolution, &mut rng);

        let modularity = graph.modularity(&refined, config.resolution);
        debug!(round, modularity, communities = refined.count(), "leiden level complete");

        let clusters = materialize(&ids, &node_origin, &refined);
        levels.push(LeidenLevel {
            level: round as u32,
            clusters,
            modularity,
        });

        if modularity - last_modularity <= MIN_MODULARITY_GAIN {
            break;
        }
        last_modularity = modularity;

        // Every refined community collapses to one super-node.
        if refined.count() == graph.len() {
            break; // no aggregation possible, fixed point
        }
        let (next_graph, next_origin) = graph.aggregate(&refined, &node_origin);
        graph = next_graph;
        node_origin = next_origin;
    }

    levels
}

/// Map a partition of (possibly aggregated) nodes back to clusters of
/// original entity ids.
fn materialize(ids: &[u64], node_origin: &[Vec<usize>], partition: &Partition) -> Vec<Vec<u64>> {
    let mut by_comm: HashMap<usize, Vec<u64>> = HashMap::new();
    for (node, &comm) in partition.assignment.iter().enumerate() {
        let bucket = by_comm.entry(comm).or_default();
        for &orig in &node_origin[node] {
            bucket.push(ids[orig]);
        }
    }
    let mut clusters: Vec<Vec<u64>> = by_comm
        .into_values()
        .map(|mut members| {
            members.sort_unstable();
            members
        })
        .collect();
    clusters.sort_by_key(|c| c[0]);
    clusters
}

// ============================================================================
// Graph representation
// ============================================================================

struct Graph {
    /// Per node: (neighbor, accumulated weight), no self entries.
    adj: Vec<Vec<(usize, f64)>>,
    /// Accumulated self-loop weight per node (from aggregation).
    self_loops: Vec<f64>,
    /// Weighted degree per node, counting self loops twice.
    degree: Vec<f64>,
    /// Sum of all degrees (= 2m).
    total_degree: f64,
}

impl Graph {
    fn build(ids: &[u64], edges: &[LeidenEdge]) -> Self {
        let index: HashMap<u64, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let n = ids.len();
        let mut weights: HashMap<(usize, usize), f64> = HashMap::new();
        let mut self_loops = vec![0.0; n];

        for edge in edges {
            let (Some(&u), Some(&v)) = (index.get(&edge.source), index.get(&edge.target)) else {
                continue; // dangling edge, endpoint not in the node set
            };
            let w = edge.weight as f64;
            if u == v {
                self_loops[u] += w;
            } else {
                let key = (u.min(v), u.max(v));
                *weights.entry(key).or_default() += w;
            }
        }

        let mut adj = vec![Vec::new(); n];
        let mut pairs: Vec<((usize, usize), f64)> = weights.into_iter().collect();
        pairs.sort_by_key(|(k, _)| *k);
        for ((u, v), w) in pairs {
            adj[u].push((v, w));
            adj[v].push((u, w));
        }

        Self::finish(adj, self_loops)
    }

    fn finish(adj: Vec<Vec<(usize, f64)>>, self_loops: Vec<f64>) -> Self {
        let degree: Vec<f64> = adj
            .iter()
            .zip(&self_loops)
            .map(|(nbrs, &sl)| nbrs.iter().map(|(_, w)| w).sum::<f64>() + 2.0 * sl)
            .collect();
        let total_degree: f64 = degree.iter().sum();
        Self {
            adj,
            self_loops,
            degree,
            total_degree,
        }
    }

    fn len(&self) -> usize {
        self.adj.len()
    }

    /// Q = Σ_c [ Σ_in(c)/2m − γ (σ_c/2m)² ]
    fn modularity(&self, partition: &Partition, resolution: f64) -> f64 {
        if self.total_degree == 0.0 {
            return 0.0;
        }
        let comm_count = partition.count();
        let mut internal = vec![0.0; comm_count];
        let mut sigma = vec![0.0; comm_count];

        for node in 0..self.len() {
            let c = partition.assignment[node];
            sigma[c] += self.degree[node];
            internal[c] += 2.0 * self.self_loops[node];
            for &(nb, w) in &self.adj[node] {
                if partition.assignment[nb] == c {
                    internal[c] += w; // counted from both endpoints = 2w total
                }
            }
        }

        let two_m = self.total_degree;
        (0..comm_count)
            .map(|c| internal[c] / two_m - resolution * (sigma[c] / two_m) * (sigma[c] / two_m))
            .sum()
    }

    /// Collapse each community into one super-node; edge weights sum across
    /// boundaries, intra-community weight becomes a self loop.
    fn aggregate(
        &self,
        partition: &Partition,
        node_origin: &[Vec<usize>],
    ) -> (Graph, Vec<Vec<usize>>) {
        let comm_count = partition.count();
        let mut self_loops = vec![0.0; comm_count];
        let mut weights: HashMap<(usize, usize), f64> = HashMap::new();
        let mut origin: Vec<Vec<usize>> = vec![Vec::new(); comm_count];

        for node in 0..self.len() {
            let cu = partition.assignment[node];
            origin[cu].extend(node_origin[node].iter().copied());
            self_loops[cu] += self.self_loops[node];
            for &(nb, w) in &self.adj[node] {
                let cv = partition.assignment[nb];
                if cu == cv {
                    // Each intra edge visits twice; w/2 keeps the total.
                    self_loops[cu] += w / 2.0;
                } else if cu < cv {
                    *weights.entry((cu, cv)).or_default() += w;
                }
            }
        }

        for members in &mut origin {
            members.sort_unstable();
        }

        let mut adj = vec![Vec::new(); comm_count];
        let mut pairs: Vec<((usize, usize), f64)> = weights.into_iter().collect();
        pairs.sort_by_key(|(k, _)| *k);
        for ((u, v), w) in pairs {
            adj[u].push((v, w));
            adj[v].push((u, w));
        }

        (Graph::finish(adj, self_loops), origin)
    }
}

// ============================================================================
// Partition + phases
// ============================================================================

struct Partition {
    /// node -> community index (contiguous after `renumber`).
    assignment: Vec<usize>,
    comm_count: usize,
}

impl Partition {
    fn singletons(n: usize) -> Self {
        Self {
            assignment: (0..n).collect(),
            comm_count: n,
        }
    }

    fn count(&self) -> usize {
        self.comm_count
    }

    /// Renumber communities contiguously in order of first appearance by
    /// node index (deterministic).
    fn renumber(&mut self) {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        for c in self.assignment.iter_mut() {
            let next = remap.len();
            let id = *remap.entry(*c).or_insert(next);
            *c = id;
        }
        self.comm_count = remap.len();
    }
}

/// Greedy local moving: visit nodes in a seeded permutation, move each to
/// the neighboring community with the best modularity gain, repeat until a
/// full pass makes no move.
fn local_moving(graph: &Graph, partition: &mut Partition, resolution: f64, rng: &mut ChaCha8Rng) {
    let n = graph.len();
    if n == 0 || graph.total_degree == 0.0 {
        partition.renumber();
        return;
    }
    let two_m = graph.total_degree;

    let mut sigma: Vec<f64> = vec![0.0; n];
    for node in 0..n {
        sigma[partition.assignment[node]] += graph.degree[node];
    }

    let mut order: Vec<usize> = (0..n).collect();
    loop {
        let mut moved = false;
        order.shuffle(rng);

        for &node in &order {
            let current = partition.assignment[node];
            let k_i = graph.degree[node];

            // Weight from `node` to each adjacent community.
            let mut comm_weights: HashMap<usize, f64> = HashMap::new();
            for &(nb, w) in &graph.adj[node] {
                *comm_weights.entry(partition.assignment[nb]).or_default() += w;
            }

            sigma[current] -= k_i;
            let w_current = comm_weights.get(&current).copied().unwrap_or(0.0);
            let gain_stay = w_current - resolution * k_i * sigma[current] / two_m;

            let mut best_comm = current;
            let mut best_gain = gain_stay;
            let mut candidates: Vec<(usize, f64)> = comm_weights.into_iter().collect();
            candidates.sort_by_key(|(c, _)| *c);
            for (c, w_ic) in candidates {
                if c == current {
                    continue;
                }
                let gain = w_ic - resolution * k_i * sigma[c] / two_m;
                if gain > best_gain {
                    best_gain = gain;
                    best_comm = c;
                }
            }

            sigma[best_comm] += k_i;
            if best_comm != current {
                partition.assignment[node] = best_comm;
                moved = true;
            }
        }

        if !moved {
            break;
        }
    }
    partition.renumber();
}

/// Leiden refinement: inside each community of `partition`, restart from
/// singletons and locally move nodes, constrained to the community. The
/// result is at least as fine as `partition`.
fn refine(
    graph: &Graph,
    partition: &Partition,
    resolution: f64,
    rng: &mut ChaCha8Rng,
) -> Partition {
    let n = graph.len();
    let mut refined = Partition::singletons(n);
    if n == 0 || graph.total_degree == 0.0 {
        refined.renumber();
        return refined;
    }
    let two_m = graph.total_degree;

    let mut sigma: Vec<f64> = graph.degree.clone(); // singleton σ = own degree

    let mut order: Vec<usize> = (0..n).collect();
    loop {
        let mut moved = false;
        order.shuffle(rng);

        for &node in &order {
            let outer = partition.assignment[node];
            let current = refined.assignment[node];
            let k_i = graph.degree[node];

            let mut comm_weights: HashMap<usize, f64> = HashMap::new();
            for &(nb, w) in &graph.adj[node] {
                if partition.assignment[nb] == outer {
                    *comm_weights.entry(refined.assignment[nb]).or_default() += w;
                }
            }

            sigma[current] -= k_i;
            let w_current = comm_weights.get(&current).copied().unwrap_or(0.0);
            let gain_stay = w_current - resolution * k_i * sigma[current] / two_m;

            let mut best_comm = current;
            let mut best_gain = gain_stay;
            let mut candidates: Vec<(usize, f64)> = comm_weights.into_iter().collect();
            candidates.sort_by_key(|(c, _)| *c);
            for (c, w_ic) in candidates {
                if c == current {
                    continue;
                }
                let gain = w_ic - resolution * k_i * sigma[c] / two_m;
                if gain > best_gain {
                    best_gain = gain;
                    best_comm = c;
                }
            }

            sigma[best_comm] += k_i;
            if best_comm != current {
                refined.assignment[node] = best_comm;
                moved = true;
            }
        }

        if !moved {
            break;
        }
    }
    refined.renumber();
    refined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: u64, target: u64, weight: f32) -> LeidenEdge {
        LeidenEdge { source, target, weight }
    }

    /// Two dense triangles joined by a single weak edge.
    fn two_triangles() -> (Vec<u64>, Vec<LeidenEdge>) {
        let ids = vec![1, 2, 3, 4, 5, 6];
        let edges = vec![
            edge(1, 2, 1.0),
            edge(2, 3, 1.0),
            edge(3, 1, 1.0),
            edge(4, 5, 1.0),
            edge(5, 6, 1.0),
            edge(6, 4, 1.0),
            edge(3, 4, 0.1),
        ];
        (ids, edges)
    }

    #[test]
    fn zero_edges_yields_one_community_per_node() {
        let ids = vec![10, 20, 30];
        let levels = hierarchical_leiden(&ids, &[], &LeidenConfig::default());
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].clusters, vec![vec![10], vec![20], vec![30]]);
    }

    #[test]
    fn empty_graph_yields_no_levels() {
        let levels = hierarchical_leiden(&[], &[], &LeidenConfig::default());
        assert!(levels.is_empty());
    }

    #[test]
    fn triangles_separate() {
        let (ids, edges) = two_triangles();
        let result = leiden(&ids, &edges, &LeidenConfig::default());
        assert_eq!(result.clusters.len(), 2);
        assert_eq!(result.clusters[0], vec![1, 2, 3]);
        assert_eq!(result.clusters[1], vec![4, 5, 6]);
        assert!(result.modularity > 0.0);
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        // Pseudo-random graph: 200 nodes, average degree ~4.
        let ids: Vec<u64> = (1..=200).collect();
        let mut edges = Vec::new();
        let mut state = 42u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };
        for _ in 0..400 {
            let a = (next() % 200 + 1) as u64;
            let b = (next() % 200 + 1) as u64;
            if a != b {
                edges.push(edge(a, b, ((next() % 100) as f32 + 1.0) / 100.0));
            }
        }

        let config = LeidenConfig {
            random_seed: 42,
            ..Default::default()
        };
        let first = hierarchical_leiden(&ids, &edges, &config);
        for _ in 0..2 {
            let again = hierarchical_leiden(&ids, &edges, &config);
            assert_eq!(first.len(), again.len());
            for (a, b) in first.iter().zip(&again) {
                assert_eq!(a.clusters, b.clusters);
            }
        }
    }

    #[test]
    fn different_seed_may_differ_but_is_self_consistent() {
        let (ids, edges) = two_triangles();
        let config = LeidenConfig {
            random_seed: 7,
            ..Default::default()
        };
        let a = hierarchical_leiden(&ids, &edges, &config);
        let b = hierarchical_leiden(&ids, &edges, &config);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.clusters, y.clusters);
        }
    }

    #[test]
    fn every_level_covers_all_nodes() {
        let (ids, edges) = two_triangles();
        let levels = hierarchical_leiden(&ids, &edges, &LeidenConfig::default());
        for level in &levels {
            let mut members: Vec<u64> = level.clusters.iter().flatten().copied().collect();
            members.sort_unstable();
            assert_eq!(members, ids);
        }
    }
}
