//! Hybrid query planner: ANN seeds + k-hop graph expansion.
//!
//! 1. Seed each enabled kind from its HNSW index, recording similarities.
//! 2. BFS outward from the entity seeds, following relationships in both
//!    directions. A non-seed entity inherits
//!    `max over predecessors (score(pred) * decay * edge.weight)` and keeps
//!    the hop at which it was first discovered.
//! 3. Collect every relationship whose endpoints are both visited, resolve
//!    endpoint titles, truncate each bucket by score, and return the pack.
//!
//! The deadline is cooperative and only checked at hop boundaries — a
//! partially expanded hop would bias the neighborhood, so hops are atomic.
//! Queries never fail on empty indexes; they return an empty pack.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::error::Result;
use crate::hnsw::HnswIndex;
use crate::store::SessionStore;
use crate::types::{
    CommunityResult, ContextPack, EntityResult, ExplainPack, QuerySpec, QueryStats,
    RelationshipResult, SearchType, SeedInfo, TextUnitResult, TraversalStep,
};

/// Per-hop score multiplier.
pub const HOP_DECAY: f32 = 0.7;

/// Read-only view of one session's stores and indexes, captured under the
/// session guard for the duration of the query.
pub struct QueryContext<'a> {
    pub store: &'a SessionStore,
    pub text_unit_index: &'a HnswIndex,
    pub entity_index: &'a HnswIndex,
    pub community_index: &'a HnswIndex,
    /// ef used when the spec does not override it.
    pub ef_search: usize,
}

/// Best score seen so far for a visited entity. `hop` stays at the first
/// discovery distance even when a later edge improves the score.
#[derive(Debug, Clone, Copy)]
struct VisitedEntity {
    score: f32,
    hop: u32,
}

/// Shared state produced by seeding + expansion; both `query` and `explain`
/// are projections of it.
struct Traversal {
    visited: HashMap<u64, VisitedEntity>,
    entity_seeds: Vec<(u64, f32)>,
    text_unit_seeds: Vec<(u64, f32)>,
    community_seeds: Vec<(u64, f32)>,
    steps: Vec<TraversalStep>,
    stats: QueryStats,
}

fn normalized(spec: &QuerySpec) -> QuerySpec {
    let defaults = QuerySpec::default();
    QuerySpec {
        query_vector: spec.query_vector.clone(),
        search_types: if spec.search_types.is_empty() {
            defaults.search_types
        } else {
            spec.search_types.clone()
        },
        top_k: if spec.top_k == 0 { defaults.top_k } else { spec.top_k },
        k_hops: spec.k_hops,
        max_entities: if spec.max_entities == 0 {
            defaults.max_entities
        } else {
            spec.max_entities
        },
        max_text_units: if spec.max_text_units == 0 {
            defaults.max_text_units
        } else {
            spec.max_text_units
        },
        max_communities: if spec.max_communities == 0 {
            defaults.max_communities
        } else {
            spec.max_communities
        },
        deadline_ms: if spec.deadline_ms == 0 {
            defaults.deadline_ms
        } else {
            spec.deadline_ms
        },
    }
}

fn traverse(ctx: &QueryContext, spec: &QuerySpec) -> Result<Traversal> {
    let start = Instant::now();
    let mut stats = QueryStats::default();

    let mut entity_seeds: Vec<(u64, f32)> = Vec::new();
    let mut text_unit_seeds: Vec<(u64, f32)> = Vec::new();
    let mut community_seeds: Vec<(u64, f32)> = Vec::new();

    for kind in &spec.search_types {
        let (index, bucket) = match kind {
            SearchType::TextUnit => (ctx.text_unit_index, &mut text_unit_seeds),
            SearchType::Entity => (ctx.entity_index, &mut entity_seeds),
            SearchType::Community => (ctx.community_index, &mut community_seeds),
        };
        let hits = index.search(&spec.query_vector, spec.top_k, Some(ctx.ef_search))?;
        for hit in hits {
            bucket.push((hit.id, hit.similarity));
        }
    }
    stats.text_units_searched = text_unit_seeds.len();
    stats.entities_searched = entity_seeds.len();
    stats.communities_searched = community_seeds.len();

    // Seed the visited set; a seed's score is its raw similarity (hop 0).
    let mut visited: HashMap<u64, VisitedEntity> = HashMap::new();
    for &(id, similarity) in &entity_seeds {
        visited.insert(
            id,
            VisitedEntity {
                score: similarity.max(0.0),
                hop: 0,
            },
        );
    }

    let mut steps: Vec<TraversalStep> = Vec::new();
    let mut frontier: Vec<u64> = {
        let mut f: Vec<u64> = visited.keys().copied().collect();
        f.sort_unstable();
        f
    };

    for hop in 1..=spec.k_hops as u32 {
        // A full visited set still admits score improvements (they take no
        // cap room), so only an exhausted frontier ends the expansion.
        if frontier.is_empty() {
            break;
        }
        // Deadline is only consulted between hops; never abort mid-hop.
        if start.elapsed().as_millis() as u64 > spec.deadline_ms {
            debug!(hop, "query deadline reached, returning partial expansion");
            break;
        }

        // Best proposed score per target entity this hop. An entry that is
        // already visited counts as a proposal too when the edge improves
        // on its current best; only edges that change nothing are skipped.
        let mut proposals: HashMap<u64, (f32, TraversalStep)> = HashMap::new();

        for &entity_id in &frontier {
            let from_score = match visited.get(&entity_id) {
                Some(v) => v.score,
                None => continue,
            };
            if from_score <= 0.0 {
                continue; // nothing to propagate
            }
            for rel_id in ctx.store.neighbor_relationships(entity_id) {
                let Ok(rel) = ctx.store.relationship(rel_id) else {
                    continue;
                };
                stats.edges_scanned += 1;
                let other = if rel.source_id == entity_id {
                    rel.target_id
                } else {
                    rel.source_id
                };
                let score = from_score * HOP_DECAY * rel.weight;
                let current = visited.get(&other).map(|v| v.score).unwrap_or(0.0);
                if score <= current {
                    continue;
                }
                let step = TraversalStep {
                    from_entity_id: entity_id,
                    to_entity_id: other,
                    relationship_id: rel.id,
                    rel_type: rel.rel_type.clone(),
                    weight: rel.weight,
                    hop,
                    cumulative_score: score,
                };
                match proposals.get(&other) {
                    Some((best, _)) if *best >= score => {}
                    _ => {
                        proposals.insert(other, (score, step));
                    }
                }
            }
        }

        // Improvements to already-visited entities raise their score in
        // place (hop keeps its first-discovery value) and re-enter the
        // frontier so the better score keeps propagating outward. They do
        // not consume cap room.
        let mut fresh: Vec<(u64, f32, TraversalStep)> = Vec::new();
        let mut improved: Vec<(u64, f32, TraversalStep)> = Vec::new();
        for (id, (score, step)) in proposals {
            if visited.contains_key(&id) {
                improved.push((id, score, step));
            } else {
                fresh.push((id, score, step));
            }
        }
        improved.sort_by_key(|(id, _, _)| *id);

        frontier = Vec::new();
        for (id, score, step) in improved {
            if let Some(entry) = visited.get_mut(&id) {
                if score > entry.score {
                    entry.score = score;
                    steps.push(step);
                    frontier.push(id);
                }
            }
        }

        // Cap new discoveries: keep the highest incoming scores, ties to
        // the lower id.
        fresh.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        let room = spec.max_entities.saturating_sub(visited.len());
        fresh.truncate(room);
        for (id, score, step) in fresh {
            visited.insert(id, VisitedEntity { score, hop });
            steps.push(step);
            frontier.push(id);
        }
        frontier.sort_unstable();
    }

    stats.duration_micros = start.elapsed().as_micros() as i64;
    Ok(Traversal {
        visited,
        entity_seeds,
        text_unit_seeds,
        community_seeds,
        steps,
        stats,
    })
}

/// Execute the full hybrid query and assemble the ranked context pack.
pub fn run_query(ctx: &QueryContext, spec: &QuerySpec, query_id: u64) -> Result<ContextPack> {
    let spec = normalized(spec);
    let start = Instant::now();
    let traversal = traverse(ctx, &spec)?;

    // Entities: every visited node, ranked by score.
    let mut entities: Vec<EntityResult> = Vec::with_capacity(traversal.visited.len());
    let seed_similarity: HashMap<u64, f32> = traversal.entity_seeds.iter().copied().collect();
    for (&id, v) in &traversal.visited {
        let Ok(entity) = ctx.store.entity(id) else {
            continue;
        };
        entities.push(EntityResult {
            entity: entity.clone(),
            score: v.score,
            similarity: seed_similarity.get(&id).copied().unwrap_or(0.0),
            hop: v.hop,
        });
    }
    sort_ranked(&mut entities, |e| (e.score, e.entity.id));
    entities.truncate(spec.max_entities);

    let mut text_units: Vec<TextUnitResult> = Vec::new();
    for &(id, similarity) in &traversal.text_unit_seeds {
        let Ok(tu) = ctx.store.text_unit(id) else {
            continue;
        };
        text_units.push(TextUnitResult {
            text_unit: tu.clone(),
            score: similarity,
            similarity,
            hop: 0,
        });
    }
    sort_ranked(&mut text_units, |t| (t.score, t.text_unit.id));
    text_units.truncate(spec.max_text_units);

    let mut communities: Vec<CommunityResult> = Vec::new();
    for &(id, similarity) in &traversal.community_seeds {
        let Ok(community) = ctx.store.community(id) else {
            continue;
        };
        communities.push(CommunityResult {
            community: community.clone(),
            score: similarity,
            similarity,
        });
    }
    sort_ranked(&mut communities, |c| (c.score, c.community.id));
    communities.truncate(spec.max_communities);

    // Relationships with both endpoints in the visited set, titles resolved
    // for rendering.
    let mut relationships: Vec<RelationshipResult> = Vec::new();
    let mut seen_rels: Vec<u64> = Vec::new();
    for entity in &entities {
        for rel_id in ctx.store.neighbor_relationships(entity.entity.id) {
            if seen_rels.contains(&rel_id) {
                continue;
            }
            let Ok(rel) = ctx.store.relationship(rel_id) else {
                continue;
            };
            if !traversal.visited.contains_key(&rel.source_id)
                || !traversal.visited.contains_key(&rel.target_id)
            {
                continue;
            }
            seen_rels.push(rel_id);
            let source_title = ctx
                .store
                .entity(rel.source_id)
                .map(|e| e.title.clone())
                .unwrap_or_default();
            let target_title = ctx
                .store
                .entity(rel.target_id)
                .map(|e| e.title.clone())
                .unwrap_or_default();
            relationships.push(RelationshipResult {
                relationship: rel.clone(),
                source_title,
                target_title,
            });
        }
    }
    relationships.sort_by_key(|r| r.relationship.id);

    let mut stats = traversal.stats;
    stats.duration_micros = start.elapsed().as_micros() as i64;

    Ok(ContextPack {
        query_id,
        text_units,
        entities,
        communities,
        relationships,
        stats,
    })
}

/// Execute the traversal and report seeds + steps instead of records.
pub fn explain_query(ctx: &QueryContext, spec: &QuerySpec, query_id: u64) -> Result<ExplainPack> {
    let spec = normalized(spec);
    let traversal = traverse(ctx, &spec)?;

    let mut seeds: Vec<SeedInfo> = Vec::new();
    for &(id, similarity) in &traversal.text_unit_seeds {
        if let Ok(tu) = ctx.store.text_unit(id) {
            seeds.push(SeedInfo {
                kind: SearchType::TextUnit,
                id,
                external_id: tu.external_id.clone(),
                similarity,
                linked_ids: tu.entity_ids.clone(),
            });
        }
    }
    for &(id, similarity) in &traversal.entity_seeds {
        if let Ok(entity) = ctx.store.entity(id) {
            seeds.push(SeedInfo {
                kind: SearchType::Entity,
                id,
                external_id: entity.external_id.clone(),
                similarity,
                linked_ids: entity.text_unit_ids.clone(),
            });
        }
    }
    for &(id, similarity) in &traversal.community_seeds {
        if let Ok(community) = ctx.store.community(id) {
            seeds.push(SeedInfo {
                kind: SearchType::Community,
                id,
                external_id: community.external_id.clone(),
                similarity,
                linked_ids: community.entity_ids.clone(),
            });
        }
    }

    Ok(ExplainPack {
        query_id,
        seeds,
        traversal: traversal.steps,
    })
}

/// Descending score, ties to the lower id.
fn sort_ranked<T>(items: &mut [T], key: impl Fn(&T) -> (f32, u64)) {
    items.sort_by(|a, b| {
        let (sa, ia) = key(a);
        let (sb, ib) = key(b);
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ia.cmp(&ib))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::HnswConfig;
    use crate::simd::DistanceKind;
    use crate::types::{Document, Entity, Relationship, TextUnit};

    struct Fixture {
        store: SessionStore,
        tu_index: HnswIndex,
        ent_index: HnswIndex,
        comm_index: HnswIndex,
    }

    impl Fixture {
        fn ctx(&self) -> QueryContext<'_> {
            QueryContext {
                store: &self.store,
                text_unit_index: &self.tu_index,
                entity_index: &self.ent_index,
                community_index: &self.comm_index,
                ef_search: 50,
            }
        }
    }

    /// The alpha/beta/gamma graph: two embedded entities, one vectorless
    /// entity two hops out.
    fn fixture() -> Fixture {
        let mut store = SessionStore::new();
        let config = HnswConfig::default();
        let mut tu_index = HnswIndex::new(4, DistanceKind::Cosine, config);
        let mut ent_index = HnswIndex::new(4, DistanceKind::Cosine, config);
        let comm_index = HnswIndex::new(4, DistanceKind::Cosine, config);

        store.insert_document(Document::new(1, "doc-1", "a.pdf")).unwrap();

        let mut tu1 = TextUnit::new(1, "chunk-1", 1, "alpha", 1);
        tu1.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        store.insert_text_unit(tu1).unwrap();
        tu_index.insert(1, vec![1.0, 0.0, 0.0, 0.0]).unwrap();

        let mut tu2 = TextUnit::new(2, "chunk-2", 1, "beta", 1);
        tu2.embedding = Some(vec![0.0, 1.0, 0.0, 0.0]);
        store.insert_text_unit(tu2).unwrap();
        tu_index.insert(2, vec![0.0, 1.0, 0.0, 0.0]).unwrap();

        let mut e1 = Entity::new(1, "ent-1", "ALPHA", "concept", "");
        e1.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        store.insert_entity(e1).unwrap();
        ent_index.insert(1, vec![1.0, 0.0, 0.0, 0.0]).unwrap();

        let mut e2 = Entity::new(2, "ent-2", "BETA", "concept", "");
        e2.embedding = Some(vec![0.0, 1.0, 0.0, 0.0]);
        store.insert_entity(e2).unwrap();
        ent_index.insert(2, vec![0.0, 1.0, 0.0, 0.0]).unwrap();

        // GAMMA carries no vector; only the graph can reach it.
        store
            .insert_entity(Entity::new(3, "ent-3", "GAMMA", "concept", ""))
            .unwrap();

        store
            .insert_relationship(Relationship::new(1, "rel-1", 1, 2, "REL", "", 0.9))
            .unwrap();
        store
            .insert_relationship(Relationship::new(2, "rel-2", 2, 3, "REL", "", 0.8))
            .unwrap();

        store.link(1, 1).unwrap();
        store.link(2, 2).unwrap();

        Fixture {
            store,
            tu_index,
            ent_index,
            comm_index,
        }
    }

    fn spec() -> QuerySpec {
        QuerySpec {
            query_vector: vec![1.0, 0.0, 0.0, 0.0],
            top_k: 3,
            k_hops: 2,
            ..Default::default()
        }
    }

    #[test]
    fn hybrid_query_end_to_end() {
        let fixture = fixture();
        let pack = run_query(&fixture.ctx(), &spec(), 1).unwrap();

        // Entity order: seed, one hop, two hops.
        let ids: Vec<u64> = pack.entities.iter().map(|e| e.entity.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!((pack.entities[0].score - 1.0).abs() < 1e-3);
        // e2 inherits 1.0 * 0.7 * 0.9
        assert!((pack.entities[1].score - 0.63).abs() < 1e-3);
        // e3 inherits 0.63 * 0.7 * 0.8
        assert!((pack.entities[2].score - 0.3528).abs() < 1e-3);
        assert_eq!(pack.entities[2].hop, 2);

        let tu_ids: Vec<u64> = pack.text_units.iter().map(|t| t.text_unit.id).collect();
        assert_eq!(tu_ids, vec![1, 2]);

        assert_eq!(pack.relationships.len(), 2);
        assert_eq!(pack.relationships[0].source_title, "ALPHA");
        assert_eq!(pack.relationships[0].target_title, "BETA");

        assert_eq!(pack.stats.entities_searched, 2);
        assert!(pack.stats.edges_scanned > 0);
        assert!(pack.stats.duration_micros >= 0);
    }

    #[test]
    fn empty_indexes_return_empty_pack() {
        let store = SessionStore::new();
        let config = HnswConfig::default();
        let tu = HnswIndex::new(4, DistanceKind::Cosine, config);
        let ent = HnswIndex::new(4, DistanceKind::Cosine, config);
        let comm = HnswIndex::new(4, DistanceKind::Cosine, config);
        let ctx = QueryContext {
            store: &store,
            text_unit_index: &tu,
            entity_index: &ent,
            community_index: &comm,
            ef_search: 50,
        };

        let pack = run_query(&ctx, &spec(), 9).unwrap();
        assert!(pack.entities.is_empty());
        assert!(pack.text_units.is_empty());
        assert!(pack.communities.is_empty());
        assert!(pack.relationships.is_empty());
        assert_eq!(pack.query_id, 9);
    }

    #[test]
    fn restricting_search_types_limits_seeds() {
        let fixture = fixture();
        let mut s = spec();
        s.search_types = vec![SearchType::TextUnit];
        let pack = run_query(&fixture.ctx(), &s, 1).unwrap();
        assert_eq!(pack.stats.entities_searched, 0);
        assert!(pack.entities.is_empty());
        assert_eq!(pack.text_units.len(), 2);
    }

    #[test]
    fn max_entities_caps_expansion_by_score() {
        let fixture = fixture();
        let mut s = spec();
        s.max_entities = 2;
        let pack = run_query(&fixture.ctx(), &s, 1).unwrap();
        // Cap of 2 keeps the seed plus the best one-hop entity; GAMMA is cut.
        let ids: Vec<u64> = pack.entities.iter().map(|e| e.entity.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn zero_hops_returns_only_seeds() {
        let fixture = fixture();
        let mut s = spec();
        s.k_hops = 0;
        let pack = run_query(&fixture.ctx(), &s, 1).unwrap();
        let ids: Vec<u64> = pack.entities.iter().map(|e| e.entity.id).collect();
        assert_eq!(ids, vec![1, 2]);
        // No relationship qualifies: GAMMA is unvisited, so rel-2 is out, but
        // rel-1 has both endpoints visited.
        assert_eq!(pack.relationships.len(), 1);
    }

    #[test]
    fn explain_reports_seeds_and_steps() {
        let fixture = fixture();
        let pack = explain_query(&fixture.ctx(), &spec(), 3).unwrap();

        assert_eq!(pack.query_id, 3);
        let entity_seeds: Vec<&SeedInfo> = pack
            .seeds
            .iter()
            .filter(|s| s.kind == SearchType::Entity)
            .collect();
        assert_eq!(entity_seeds.len(), 2);

        assert_eq!(pack.traversal.len(), 2);
        assert_eq!(pack.traversal[0].hop, 1);
        assert_eq!(pack.traversal[1].hop, 2);
        assert_eq!(pack.traversal[1].to_entity_id, 3);
        assert!((pack.traversal[1].cumulative_score - 0.3528).abs() < 1e-3);
    }
}
