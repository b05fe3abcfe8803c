//! Core data model: records, identifiers, query specs, and result packs.
//!
//! Every record carries a dense per-session internal id (u64, monotonic,
//! never reused) plus an externally supplied string id that is unique per
//! kind within its session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current unix time in nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Id generation
// ============================================================================

/// Record kinds that receive dense internal ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Document,
    TextUnit,
    Entity,
    Relationship,
    Community,
    Query,
}

/// Per-session monotonic id counters, one per record kind.
///
/// Ids start at 1 and are never reused within a session. Counters are
/// persisted in snapshots and re-derived from `max(seen id)` during WAL
/// replay.
#[derive(Debug, Default)]
pub struct IdGenerator {
    document: AtomicU64,
    text_unit: AtomicU64,
    entity: AtomicU64,
    relationship: AtomicU64,
    community: AtomicU64,
    query: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, kind: RecordKind) -> u64 {
        self.slot(kind).fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self, kind: RecordKind) -> u64 {
        self.slot(kind).load(Ordering::Relaxed)
    }

    /// Raise a counter so the next id is at least `floor + 1`. Used by WAL
    /// replay, which discovers ids out of allocation order.
    pub fn bump_to(&self, kind: RecordKind, floor: u64) {
        self.slot(kind).fetch_max(floor, Ordering::Relaxed);
    }

    pub fn counters(&self) -> IdCounters {
        IdCounters {
            document: self.document.load(Ordering::Relaxed),
            text_unit: self.text_unit.load(Ordering::Relaxed),
            entity: self.entity.load(Ordering::Relaxed),
            relationship: self.relationship.load(Ordering::Relaxed),
            community: self.community.load(Ordering::Relaxed),
            query: self.query.load(Ordering::Relaxed),
        }
    }

    pub fn set_counters(&self, c: &IdCounters) {
        self.document.store(c.document, Ordering::Relaxed);
        self.text_unit.store(c.text_unit, Ordering::Relaxed);
        self.entity.store(c.entity, Ordering::Relaxed);
        self.relationship.store(c.relationship, Ordering::Relaxed);
        self.community.store(c.community, Ordering::Relaxed);
        self.query.store(c.query, Ordering::Relaxed);
    }

    fn slot(&self, kind: RecordKind) -> &AtomicU64 {
        match kind {
            RecordKind::Document => &self.document,
            RecordKind::TextUnit => &self.text_unit,
            RecordKind::Entity => &self.entity,
            RecordKind::Relationship => &self.relationship,
            RecordKind::Community => &self.community,
            RecordKind::Query => &self.query,
        }
    }
}

/// Snapshot-friendly copy of all id counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounters {
    pub document: u64,
    pub text_unit: u64,
    pub entity: u64,
    pub relationship: u64,
    pub community: u64,
    pub query: u64,
}

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Ready,
}

/// Metadata for an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub external_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
    pub created_at: i64,
}

impl Document {
    pub fn new(id: u64, external_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id,
            external_id: external_id.into(),
            filename: filename.into(),
            status: DocumentStatus::Uploaded,
            attrs: HashMap::new(),
            created_at: now_secs(),
        }
    }
}

// ============================================================================
// TextUnit
// ============================================================================

/// A chunk of document text, the unit of provenance linking back to entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: u64,
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    pub token_count: u32,
    pub entity_ids: Vec<u64>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

impl TextUnit {
    pub fn new(
        id: u64,
        external_id: impl Into<String>,
        document_id: u64,
        content: impl Into<String>,
        token_count: u32,
    ) -> Self {
        Self {
            id,
            external_id: external_id.into(),
            document_id,
            content: content.into(),
            token_count,
            entity_ids: Vec::new(),
            embedding: None,
            created_at: now_secs(),
        }
    }

    pub fn add_entity_id(&mut self, entity_id: u64) {
        if !self.entity_ids.contains(&entity_id) {
            self.entity_ids.push(entity_id);
        }
    }

    pub fn remove_entity_id(&mut self, entity_id: u64) {
        self.entity_ids.retain(|&id| id != entity_id);
    }
}

// ============================================================================
// Entity
// ============================================================================

/// A named thing extracted from text, keyed by normalized title for dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: u64,
    pub external_id: String,
    /// Uppercased at insert time; uniqueness is enforced on this form.
    pub title: String,
    pub entity_type: String,
    pub description: String,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
    pub text_unit_ids: Vec<u64>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

impl Entity {
    pub fn new(
        id: u64,
        external_id: impl Into<String>,
        title: impl Into<String>,
        entity_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            external_id: external_id.into(),
            title: title.into(),
            entity_type: entity_type.into(),
            description: description.into(),
            attrs: HashMap::new(),
            text_unit_ids: Vec::new(),
            embedding: None,
            created_at: now_secs(),
        }
    }

    pub fn add_text_unit_id(&mut self, tu_id: u64) {
        if !self.text_unit_ids.contains(&tu_id) {
            self.text_unit_ids.push(tu_id);
        }
    }

    pub fn remove_text_unit_id(&mut self, tu_id: u64) {
        self.text_unit_ids.retain(|&id| id != tu_id);
    }
}

/// Title form used for uniqueness checks.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_uppercase()
}

// ============================================================================
// Relationship
// ============================================================================

/// A directed, typed, weighted edge between two entities. Parallel edges
/// between the same endpoints with different types are permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: u64,
    pub external_id: String,
    pub source_id: u64,
    pub target_id: u64,
    pub rel_type: String,
    pub description: String,
    pub weight: f32,
    /// Provenance chunks.
    pub text_unit_ids: Vec<u64>,
    pub created_at: i64,
}

impl Relationship {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        external_id: impl Into<String>,
        source_id: u64,
        target_id: u64,
        rel_type: impl Into<String>,
        description: impl Into<String>,
        weight: f32,
    ) -> Self {
        Self {
            id,
            external_id: external_id.into(),
            source_id,
            target_id,
            rel_type: rel_type.into(),
            description: description.into(),
            weight,
            text_unit_ids: Vec::new(),
            created_at: now_secs(),
        }
    }

    pub fn add_text_unit_id(&mut self, tu_id: u64) {
        if !self.text_unit_ids.contains(&tu_id) {
            self.text_unit_ids.push(tu_id);
        }
    }
}

// ============================================================================
// Community
// ============================================================================

/// A cluster of entities and relationships produced by Leiden. Titles and
/// summaries are populated by an external layer; the engine stores members
/// and hierarchy level only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    /// Hierarchy level, 0 = finest.
    pub level: u32,
    pub entity_ids: Vec<u64>,
    pub relationship_ids: Vec<u64>,
    pub summary: String,
    pub full_content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

impl Community {
    pub fn new(
        id: u64,
        external_id: impl Into<String>,
        level: u32,
        entity_ids: Vec<u64>,
        relationship_ids: Vec<u64>,
    ) -> Self {
        Self {
            id,
            external_id: external_id.into(),
            title: String::new(),
            level,
            entity_ids,
            relationship_ids,
            summary: String::new(),
            full_content: String::new(),
            embedding: None,
            created_at: now_secs(),
        }
    }
}

// ============================================================================
// Query types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    TextUnit,
    Entity,
    Community,
}

/// Inputs to the hybrid query planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query_vector: Vec<f32>,
    /// Which indexes seed the search. Defaults to all three kinds.
    pub search_types: Vec<SearchType>,
    /// Seed count per kind.
    pub top_k: usize,
    /// BFS depth from entity seeds.
    pub k_hops: usize,
    pub max_entities: usize,
    pub max_text_units: usize,
    pub max_communities: usize,
    /// Soft wall-clock bound; the planner returns best-so-far when exceeded.
    pub deadline_ms: u64,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            query_vector: Vec::new(),
            search_types: vec![SearchType::TextUnit, SearchType::Entity, SearchType::Community],
            top_k: 10,
            k_hops: 2,
            max_entities: 50,
            max_text_units: 10,
            max_communities: 5,
            deadline_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextUnitResult {
    pub text_unit: TextUnit,
    pub score: f32,
    pub similarity: f32,
    pub hop: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityResult {
    pub entity: Entity,
    pub score: f32,
    pub similarity: f32,
    pub hop: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityResult {
    pub community: Community,
    pub score: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipResult {
    pub relationship: Relationship,
    pub source_title: String,
    pub target_title: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryStats {
    pub text_units_searched: usize,
    pub entities_searched: usize,
    pub communities_searched: usize,
    pub edges_scanned: usize,
    pub duration_micros: i64,
}

/// The output of a query: ranked text-units, entities, communities, and the
/// relationships connecting them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPack {
    pub query_id: u64,
    pub text_units: Vec<TextUnitResult>,
    pub entities: Vec<EntityResult>,
    pub communities: Vec<CommunityResult>,
    pub relationships: Vec<RelationshipResult>,
    pub stats: QueryStats,
}

// ============================================================================
// Explain types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedInfo {
    pub kind: SearchType,
    pub id: u64,
    pub external_id: String,
    pub similarity: f32,
    pub linked_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalStep {
    pub from_entity_id: u64,
    pub to_entity_id: u64,
    pub relationship_id: u64,
    pub rel_type: String,
    pub weight: f32,
    pub hop: u32,
    pub cumulative_score: f32,
}

/// Seed list plus traversal trace for query debugging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplainPack {
    pub query_id: u64,
    pub seeds: Vec<SeedInfo>,
    pub traversal: Vec<TraversalStep>,
}

// ============================================================================
// Server info
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub session_count: usize,
    pub document_count: usize,
    pub text_unit_count: usize,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub community_count: usize,
    pub vector_dim: usize,
    pub current_lsn: u64,
    pub flushed_lsn: u64,
}

// ============================================================================
// Bulk operation inputs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDocumentInput {
    pub external_id: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkTextUnitInput {
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    pub token_count: u32,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEntityInput {
    pub external_id: String,
    pub title: String,
    pub entity_type: String,
    pub description: String,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRelationshipInput {
    pub external_id: String,
    pub source_id: u64,
    pub target_id: u64,
    pub rel_type: String,
    pub description: String,
    pub weight: f32,
}

// ============================================================================
// Approximate memory accounting
// ============================================================================

const RECORD_OVERHEAD: usize = 64;

fn vec_f32_cost(v: &Option<Vec<f32>>) -> usize {
    v.as_ref().map_or(0, |v| v.len() * 4)
}

/// Approximate heap cost of a record, used for the per-session memory quota.
pub trait MemoryCost {
    fn memory_cost(&self) -> usize;
}

impl MemoryCost for Document {
    fn memory_cost(&self) -> usize {
        RECORD_OVERHEAD
            + self.external_id.len()
            + self.filename.len()
            + self.attrs.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
    }
}

impl MemoryCost for TextUnit {
    fn memory_cost(&self) -> usize {
        RECORD_OVERHEAD
            + self.external_id.len()
            + self.content.len()
            + self.entity_ids.len() * 8
            + vec_f32_cost(&self.embedding)
    }
}

impl MemoryCost for Entity {
    fn memory_cost(&self) -> usize {
        RECORD_OVERHEAD
            + self.external_id.len()
            + self.title.len()
            + self.entity_type.len()
            + self.description.len()
            + self.attrs.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
            + self.text_unit_ids.len() * 8
            + vec_f32_cost(&self.embedding)
    }
}

impl MemoryCost for Relationship {
    fn memory_cost(&self) -> usize {
        RECORD_OVERHEAD
            + self.external_id.len()
            + self.rel_type.len()
            + self.description.len()
            + self.text_unit_ids.len() * 8
    }
}

impl MemoryCost for Community {
    fn memory_cost(&self) -> usize {
        RECORD_OVERHEAD
            + self.external_id.len()
            + self.title.len()
            + self.summary.len()
            + self.full_content.len()
            + (self.entity_ids.len() + self.relationship_ids.len()) * 8
            + vec_f32_cost(&self.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_is_dense_and_per_kind() {
        let gen = IdGenerator::new();
        assert_eq!(gen.next(RecordKind::Entity), 1);
        assert_eq!(gen.next(RecordKind::Entity), 2);
        assert_eq!(gen.next(RecordKind::Document), 1);
        assert_eq!(gen.current(RecordKind::Entity), 2);
    }

    #[test]
    fn id_generator_round_trips_counters() {
        let gen = IdGenerator::new();
        gen.next(RecordKind::Entity);
        gen.next(RecordKind::Relationship);
        gen.next(RecordKind::Relationship);

        let saved = gen.counters();
        let restored = IdGenerator::new();
        restored.set_counters(&saved);
        assert_eq!(restored.next(RecordKind::Entity), 2);
        assert_eq!(restored.next(RecordKind::Relationship), 3);
    }

    #[test]
    fn bump_to_never_lowers() {
        let gen = IdGenerator::new();
        gen.bump_to(RecordKind::Entity, 10);
        gen.bump_to(RecordKind::Entity, 4);
        assert_eq!(gen.next(RecordKind::Entity), 11);
    }

    #[test]
    fn text_unit_link_set_semantics() {
        let mut tu = TextUnit::new(1, "chunk-001", 1, "alpha", 3);
        tu.add_entity_id(7);
        tu.add_entity_id(7);
        assert_eq!(tu.entity_ids, vec![7]);
        tu.remove_entity_id(7);
        assert!(tu.entity_ids.is_empty());
    }

    #[test]
    fn title_normalization() {
        assert_eq!(normalize_title("  Bank Indonesia "), "BANK INDONESIA");
    }

    #[test]
    fn default_query_spec_matches_contract() {
        let spec = QuerySpec::default();
        assert_eq!(spec.top_k, 10);
        assert_eq!(spec.k_hops, 2);
        assert_eq!(spec.search_types.len(), 3);
    }
}
