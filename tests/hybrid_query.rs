//! End-to-end hybrid query behavior through the engine: seeded search,
//! multi-hop expansion, scoring, and the empty-index edge case.

use gibram_engine::{
    BulkEntityInput, BulkRelationshipInput, BulkTextUnitInput, Engine, GibramConfig, QuerySpec,
    SearchType,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> GibramConfig {
    let mut config = GibramConfig::default();
    config.server.data_dir = dir.path().to_path_buf();
    config.server.vector_dim = 4;
    config
}

/// Document d1, chunks alpha/beta, entities ALPHA/BETA/GAMMA, and the chain
/// ALPHA -> BETA (0.9) -> GAMMA (0.8). GAMMA has no vector.
fn populate(engine: &Engine) {
    engine.create_session("s1", None, None, None).unwrap();
    engine.add_document("s1", "d1", "d1.pdf").unwrap();

    engine
        .add_text_unit(
            "s1",
            BulkTextUnitInput {
                external_id: "tu1".into(),
                document_id: 1,
                content: "alpha".into(),
                token_count: 1,
                embedding: Some(vec![1.0, 0.0, 0.0, 0.0]),
            },
        )
        .unwrap();
    engine
        .add_text_unit(
            "s1",
            BulkTextUnitInput {
                external_id: "tu2".into(),
                document_id: 1,
                content: "beta".into(),
                token_count: 1,
                embedding: Some(vec![0.0, 1.0, 0.0, 0.0]),
            },
        )
        .unwrap();

    let entities = [
        ("e1", "ALPHA", Some(vec![1.0, 0.0, 0.0, 0.0])),
        ("e2", "BETA", Some(vec![0.0, 1.0, 0.0, 0.0])),
        ("e3", "GAMMA", None),
    ];
    for (ext, title, embedding) in entities {
        engine
            .add_entity(
                "s1",
                BulkEntityInput {
                    external_id: ext.into(),
                    title: title.into(),
                    entity_type: "concept".into(),
                    description: String::new(),
                    embedding,
                },
            )
            .unwrap();
    }

    engine
        .add_relationship(
            "s1",
            BulkRelationshipInput {
                external_id: "r1".into(),
                source_id: 1,
                target_id: 2,
                rel_type: "REL".into(),
                description: String::new(),
                weight: 0.9,
            },
        )
        .unwrap();
    engine
        .add_relationship(
            "s1",
            BulkRelationshipInput {
                external_id: "r2".into(),
                source_id: 2,
                target_id: 3,
                rel_type: "REL".into(),
                description: String::new(),
                weight: 0.8,
            },
        )
        .unwrap();

    engine.link_text_unit_to_entity("s1", 1, 1).unwrap();
    engine.link_text_unit_to_entity("s1", 2, 2).unwrap();
}

fn alpha_query() -> QuerySpec {
    QuerySpec {
        query_vector: vec![1.0, 0.0, 0.0, 0.0],
        top_k: 3,
        k_hops: 2,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn hybrid_query_end_to_end() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    populate(&engine);

    let pack = engine.query("s1", &alpha_query()).unwrap();

    // Entities ranked: seed, then one hop, then two hops.
    let ids: Vec<u64> = pack.entities.iter().map(|e| e.entity.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!((pack.entities[0].score - 1.0).abs() < 1e-3);
    assert!((pack.entities[1].score - 0.63).abs() < 1e-3);
    assert!((pack.entities[2].score - 0.3528).abs() < 1e-3);

    // Text units ranked by similarity.
    let tu_ids: Vec<u64> = pack.text_units.iter().map(|t| t.text_unit.id).collect();
    assert_eq!(tu_ids, vec![1, 2]);

    // Both relationships connect visited entities; titles resolved.
    assert_eq!(pack.relationships.len(), 2);
    assert_eq!(pack.relationships[0].source_title, "ALPHA");

    // Two entities carry vectors, so two entity seeds were searched.
    assert_eq!(pack.stats.entities_searched, 2);
    assert!(pack.stats.duration_micros >= 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn query_on_empty_session_returns_empty_pack() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    engine.create_session("empty", None, None, None).unwrap();

    let pack = engine.query("empty", &alpha_query()).unwrap();
    assert!(pack.text_units.is_empty());
    assert!(pack.entities.is_empty());
    assert!(pack.communities.is_empty());
    assert!(pack.relationships.is_empty());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn query_ids_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    populate(&engine);

    let first = engine.query("s1", &alpha_query()).unwrap();
    let second = engine.query("s1", &alpha_query()).unwrap();
    assert!(second.query_id > first.query_id);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn search_type_restriction() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    populate(&engine);

    let mut spec = alpha_query();
    spec.search_types = vec![SearchType::TextUnit];
    let pack = engine.query("s1", &spec).unwrap();
    assert_eq!(pack.stats.entities_searched, 0);
    assert!(pack.entities.is_empty());
    assert_eq!(pack.text_units.len(), 2);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn explain_traces_seeds_and_hops() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    populate(&engine);

    let pack = engine.explain("s1", &alpha_query()).unwrap();

    let entity_seeds: Vec<_> = pack
        .seeds
        .iter()
        .filter(|s| s.kind == SearchType::Entity)
        .collect();
    assert_eq!(entity_seeds.len(), 2);

    // ALPHA -> BETA at hop 1, BETA -> GAMMA at hop 2, with decaying scores.
    assert_eq!(pack.traversal.len(), 2);
    assert_eq!(pack.traversal[0].hop, 1);
    assert_eq!(pack.traversal[0].to_entity_id, 2);
    assert_eq!(pack.traversal[1].hop, 2);
    assert_eq!(pack.traversal[1].to_entity_id, 3);
    assert!(pack.traversal[0].cumulative_score > pack.traversal[1].cumulative_score);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_query_dimension_fails() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    populate(&engine);

    let mut spec = alpha_query();
    spec.query_vector = vec![1.0, 0.0];
    assert!(engine.query("s1", &spec).is_err());

    engine.shutdown().await;
}
