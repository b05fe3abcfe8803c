//! Community detection through the engine: deterministic Leiden output,
//! degenerate graphs, regeneration semantics, and the async task path.

use std::time::Duration;

use gibram_engine::{
    BulkEntityInput, BulkRelationshipInput, Engine, GibramConfig, LeidenConfig, TaskStatus,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> GibramConfig {
    let mut config = GibramConfig::default();
    config.server.data_dir = dir.path().to_path_buf();
    config.server.vector_dim = 4;
    config
}

fn entity_input(n: u64) -> BulkEntityInput {
    BulkEntityInput {
        external_id: format!("ent-{n}"),
        title: format!("NODE {n}"),
        entity_type: "node".into(),
        description: String::new(),
        embedding: None,
    }
}

fn rel_input(n: u64, source: u64, target: u64, weight: f32) -> BulkRelationshipInput {
    BulkRelationshipInput {
        external_id: format!("rel-{n}"),
        source_id: source,
        target_id: target,
        rel_type: "LINK".into(),
        description: String::new(),
        weight,
    }
}

/// 200 nodes, ~400 pseudo-random edges from a fixed LCG: the scenario-D
/// graph (average degree ~4, seed 42).
fn populate_random_graph(engine: &Engine) {
    engine.create_session("s1", None, None, None).unwrap();
    let inputs: Vec<BulkEntityInput> = (0..200).map(entity_input).collect();
    engine.bulk_add_entities("s1", inputs).unwrap();

    let mut state = 42u64;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        state >> 33
    };

    let mut rels = Vec::new();
    let mut n = 0;
    while rels.len() < 400 {
        let a = next() % 200 + 1;
        let b = next() % 200 + 1;
        if a == b {
            continue;
        }
        let w = ((next() % 100) as f32 + 1.0) / 100.0;
        rels.push(rel_input(n, a, b, w));
        n += 1;
    }
    let outcomes = engine.bulk_add_relationships("s1", rels).unwrap();
    assert!(outcomes.iter().all(|o| o.is_ok()));
}

fn membership_sets(communities: &[gibram_engine::Community]) -> Vec<Vec<u64>> {
    let mut sets: Vec<Vec<u64>> = communities
        .iter()
        .map(|c| {
            let mut members = c.entity_ids.clone();
            members.sort_unstable();
            members
        })
        .collect();
    sets.sort();
    sets
}

#[tokio::test(flavor = "multi_thread")]
async fn hierarchical_leiden_is_deterministic() {
    let leiden = LeidenConfig {
        resolution: 1.0,
        random_seed: 42,
        ..Default::default()
    };

    let mut runs: Vec<Vec<Vec<u64>>> = Vec::new();
    for _ in 0..3 {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();
        populate_random_graph(&engine);

        let levels = engine
            .compute_hierarchical_communities("s1", leiden.clone())
            .unwrap();
        let flat: Vec<gibram_engine::Community> =
            levels.into_iter().flatten().collect();
        runs.push(membership_sets(&flat));

        engine.shutdown().await;
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_edge_graph_gets_singleton_communities() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    engine.create_session("s1", None, None, None).unwrap();
    let inputs: Vec<BulkEntityInput> = (0..5).map(entity_input).collect();
    engine.bulk_add_entities("s1", inputs).unwrap();

    let communities = engine
        .compute_communities("s1", LeidenConfig::default())
        .unwrap();
    assert_eq!(communities.len(), 5);
    assert!(communities.iter().all(|c| c.entity_ids.len() == 1));
    assert!(communities.iter().all(|c| c.relationship_ids.is_empty()));
    // Titles and summaries stay empty; an external layer fills them.
    assert!(communities.iter().all(|c| c.title.is_empty() && c.summary.is_empty()));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recomputation_replaces_previous_communities() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    engine.create_session("s1", None, None, None).unwrap();

    let inputs: Vec<BulkEntityInput> = (0..6).map(entity_input).collect();
    engine.bulk_add_entities("s1", inputs).unwrap();
    // Two triangles.
    let rels = vec![
        rel_input(0, 1, 2, 1.0),
        rel_input(1, 2, 3, 1.0),
        rel_input(2, 3, 1, 1.0),
        rel_input(3, 4, 5, 1.0),
        rel_input(4, 5, 6, 1.0),
        rel_input(5, 6, 4, 1.0),
    ];
    engine.bulk_add_relationships("s1", rels).unwrap();

    let first = engine.compute_communities("s1", LeidenConfig::default()).unwrap();
    assert_eq!(first.len(), 2);
    let first_ids: Vec<u64> = first.iter().map(|c| c.id).collect();

    let second = engine.compute_communities("s1", LeidenConfig::default()).unwrap();
    assert_eq!(second.len(), 2);
    // Regeneration replaced the set: old ids are gone, listing shows only
    // the new records.
    let listed = engine.list_communities("s1").unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|c| !first_ids.contains(&c.id)));
    assert_eq!(engine.session_info("s1").unwrap().community_count, 2);

    // Member relationships lie entirely within each cluster.
    for community in &listed {
        for rel_id in &community.relationship_ids {
            let rel = engine.get_relationship("s1", *rel_id).unwrap();
            assert!(community.entity_ids.contains(&rel.source_id));
            assert!(community.entity_ids.contains(&rel.target_id));
        }
    }

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn async_task_lifecycle() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();
    populate_random_graph(&engine);

    let task_id = engine
        .submit_community_task("s1", LeidenConfig::default(), false)
        .unwrap();

    let result = engine
        .await_task_result(&task_id, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(!result.is_empty());

    let task = engine.get_task_status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.session_id, "s1");

    // Listing by session finds it; cleanup then removes it.
    assert_eq!(engine.tasks_for_session("s1").len(), 1);
    assert_eq!(engine.cleanup_old_tasks(Duration::from_secs(0)), 1);
    assert!(engine.get_task_status(&task_id).is_err());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn task_for_unknown_session_fails_fast() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&dir)).unwrap();

    assert!(engine
        .submit_community_task("ghost", LeidenConfig::default(), false)
        .is_err());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn communities_survive_restart() {
    let dir = TempDir::new().unwrap();
    let expected;
    {
        let engine = Engine::open(test_config(&dir)).unwrap();
        populate_random_graph(&engine);
        let communities = engine
            .compute_communities("s1", LeidenConfig::default())
            .unwrap();
        expected = membership_sets(&communities);
        // Crash without shutdown: the community set was WAL-logged.
    }

    let engine = Engine::open(test_config(&dir)).unwrap();
    let listed = engine.list_communities("s1").unwrap();
    assert_eq!(membership_sets(&listed), expected);

    engine.shutdown().await;
}
