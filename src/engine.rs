//! The session engine: the typed operation surface the transport layer
//! marshals onto.
//!
//! Every mutation follows the same pipeline under the session's write
//! guard: validate inputs, pre-check quotas, append the WAL record, apply
//! to the store and vector indexes, adjust counters, touch last-access.
//! The WAL append precedes the apply so a crash between the two loses the
//! change cleanly instead of leaving committed-but-unlogged state.
//!
//! Lock ordering is session guard, then WAL mutex; no path acquires them
//! the other way around.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backup::{BackupCoordinator, SaveInfo};
use crate::cleanup::{CleanupScheduler, EvictionSink, SchedulerStats};
use crate::community::{self, LeidenConfig, LeidenEdge, LeidenLevel};
use crate::config::GibramConfig;
use crate::error::{GibramError, Result};
use crate::hnsw::HnswIndex;
use crate::metrics::MetricsCollector;
use crate::query::{self, QueryContext};
use crate::recovery;
use crate::session::{Session, SessionInfo, SessionQuotas};
use crate::simd::DistanceKind;
use crate::snapshot::{self, section, SnapshotContents};
use crate::store::{CascadeReport, SessionStore};
use crate::tasks::{CommunityExecutor, CommunityTask, CommunityTaskManager, TaskManagerStats};
use crate::types::{
    now_nanos, BulkDocumentInput, BulkEntityInput, BulkRelationshipInput, BulkTextUnitInput,
    Community, ContextPack, Document, DocumentStatus, Entity, ExplainPack, IdCounters,
    IdGenerator, MemoryCost, QuerySpec, RecordKind, Relationship, ServerInfo, TextUnit,
};
use crate::wal::{self, Wal, WalEntry, WalEntryType};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// WAL payload encoding
// ============================================================================

/// Body of a logged mutation; the WAL treats it as opaque bytes.
#[derive(Debug, Serialize, Deserialize)]
enum RecordPayload {
    Session(Session),
    Document(Document),
    TextUnit(TextUnit),
    Entity(Entity),
    Relationship(Relationship),
    Community(Community),
    CommunitySet(Vec<Community>),
    Link {
        text_unit_id: u64,
        entity_id: u64,
        link: bool,
    },
}

fn encode_payload(payload: &RecordPayload) -> Result<Vec<u8>> {
    bincode::serialize(payload)
        .map_err(|e| GibramError::Internal(format!("encode wal payload: {e}")))
}

fn decode_payload(bytes: &[u8]) -> Result<RecordPayload> {
    bincode::deserialize(bytes)
        .map_err(|e| GibramError::CorruptedData(format!("decode wal payload: {e}")))
}

fn wal_key(session_id: &str, kind: &str, id: impl std::fmt::Display) -> String {
    format!("{session_id}/{kind}/{id}")
}

fn parse_wal_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '/');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

// ============================================================================
// Per-session state
// ============================================================================

/// Everything a session owns, behind one read/write guard. Independent
/// sessions never contend.
struct SessionInner {
    meta: Session,
    ids: IdGenerator,
    store: SessionStore,
    text_units: HnswIndex,
    entities: HnswIndex,
    communities: HnswIndex,
}

struct SessionShard {
    /// Outside the guard so queries (shared lock) can still refresh it.
    last_access: AtomicI64,
    inner: RwLock<SessionInner>,
}

impl SessionShard {
    fn new(meta: Session, vector_dim: usize, hnsw: crate::hnsw::HnswConfig) -> Self {
        let last_access = meta.last_access;
        Self {
            last_access: AtomicI64::new(last_access),
            inner: RwLock::new(SessionInner {
                meta,
                ids: IdGenerator::new(),
                store: SessionStore::new(),
                text_units: HnswIndex::new(vector_dim, DistanceKind::Cosine, hnsw),
                entities: HnswIndex::new(vector_dim, DistanceKind::Cosine, hnsw),
                communities: HnswIndex::new(vector_dim, DistanceKind::Cosine, hnsw),
            }),
        }
    }

    fn touch(&self) {
        self.last_access.store(now_nanos(), Ordering::Relaxed);
    }

    /// Session meta with the authoritative last-access folded in.
    fn meta_snapshot(&self) -> Session {
        let mut meta = self.inner.read().meta.clone();
        meta.last_access = self.last_access.load(Ordering::Relaxed);
        meta
    }

    fn is_expired(&self) -> bool {
        self.meta_snapshot().is_expired()
    }

    fn expire_at(&self) -> i64 {
        self.meta_snapshot().expire_at()
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineShared {
    config: GibramConfig,
    data_dir: PathBuf,
    wal: Arc<Wal>,
    coordinator: BackupCoordinator,
    sessions: RwLock<HashMap<String, Arc<SessionShard>>>,
    scheduler: Arc<CleanupScheduler>,
    metrics: Arc<MetricsCollector>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

/// The engine. Create with [`Engine::open`] inside a tokio runtime; all
/// operations are callable from any thread.
pub struct Engine {
    shared: Arc<EngineShared>,
    tasks: CommunityTaskManager,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl EvictionSink for EngineShared {
    fn evict_if_expired(&self, session_id: &str) -> bool {
        let shard = {
            let sessions = self.sessions.read();
            match sessions.get(session_id) {
                Some(shard) => Arc::clone(shard),
                None => return false,
            }
        };
        if shard.is_expired() {
            self.sessions.write().remove(session_id);
            self.metrics.record_session_evicted();
            true
        } else {
            // Touched since it was scheduled; track the new deadline.
            self.scheduler.update_session(session_id, shard.expire_at());
            false
        }
    }
}

impl Engine {
    /// Open a data directory: recover state from the newest valid snapshot
    /// plus the WAL tail, then start background loops. Must be called
    /// inside a tokio runtime.
    pub fn open(config: GibramConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.server.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        let metrics = Arc::new(MetricsCollector::new());
        let scheduler = CleanupScheduler::new();

        // Recovery reads the log offline, before the new segment is opened.
        let plan = recovery::plan(&data_dir)?;
        info!(
            snapshot_lsn = plan.snapshot_lsn,
            estimated_ops = plan.estimated_ops,
            "starting recovery"
        );

        let mut shards: HashMap<String, Arc<SessionShard>> = HashMap::new();
        let stats = recovery::execute(
            &data_dir,
            &plan,
            &mut shards,
            |shards, contents| restore_sections(&config, shards, contents),
            |shards, entry| replay_entry(&config, shards, entry),
        )?;
        verify_counters(&mut shards);
        if stats.degraded {
            warn!("recovery was degraded; state reflects a partial wal replay");
        }

        let wal = Arc::new(Wal::open(
            data_dir.join("wal"),
            config.wal.sync_policy(),
            config.wal.segment_size_bytes,
        )?);
        let coordinator = BackupCoordinator::new(
            Arc::clone(&wal),
            data_dir.join("snapshots"),
            config.snapshot.max_keep,
        )?;

        let shared = Arc::new(EngineShared {
            config,
            data_dir,
            wal: Arc::clone(&wal),
            coordinator,
            sessions: RwLock::new(shards),
            scheduler: Arc::clone(&scheduler),
            metrics,
            shutdown_tx,
        });

        // Register recovered sessions with the expiry scheduler.
        {
            let sessions = shared.sessions.read();
            for (id, shard) in sessions.iter() {
                let expire_at = shard.expire_at();
                if expire_at > 0 {
                    scheduler.update_session(id, expire_at);
                }
            }
        }
        scheduler.start(Arc::clone(&shared) as Arc<dyn EvictionSink>);

        let mut background = Vec::new();
        if let Some(handle) =
            wal::spawn_periodic_sync(Arc::clone(&wal), shared.shutdown_tx.subscribe())
        {
            background.push(handle);
        }

        let executor: CommunityExecutor = {
            let shared = Arc::clone(&shared);
            Arc::new(move |session_id, config, hierarchical| {
                if hierarchical {
                    shared
                        .compute_hierarchical_communities(session_id, config.clone())
                        .map(|levels| levels.into_iter().flatten().collect())
                } else {
                    shared.compute_communities(session_id, config.clone())
                }
            })
        };
        let tasks = CommunityTaskManager::new(
            executor,
            crate::tasks::DEFAULT_WORKERS,
            crate::tasks::DEFAULT_QUEUE_DEPTH,
        );

        info!(
            sessions = shared.sessions.read().len(),
            current_lsn = wal.current_lsn(),
            "engine open"
        );

        Ok(Self {
            shared,
            tasks,
            background: parking_lot::Mutex::new(background),
        })
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.shared.metrics
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.shared.scheduler.stats()
    }

    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    // ==================================================================
    // Sessions
    // ==================================================================

    /// Create an isolated session. `None` TTL/quota arguments fall back to
    /// the configured session defaults.
    pub fn create_session(
        &self,
        session_id: &str,
        ttl: Option<Duration>,
        idle_ttl: Option<Duration>,
        quotas: Option<SessionQuotas>,
    ) -> Result<SessionInfo> {
        if session_id.is_empty() || session_id.contains('/') {
            return Err(GibramError::InvalidInput(
                "session id must be non-empty and must not contain '/'".into(),
            ));
        }

        let shared = &self.shared;
        let defaults = &shared.config.session_defaults;

        let mut meta = Session::new(session_id);
        meta.ttl = ttl
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(defaults.ttl_secs as i64 * 1_000_000_000);
        meta.idle_ttl = idle_ttl
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(defaults.idle_ttl_secs as i64 * 1_000_000_000);
        meta.quotas = quotas.unwrap_or(SessionQuotas {
            max_entities: defaults.max_entities,
            max_relationships: defaults.max_relationships,
            max_documents: defaults.max_documents,
            max_memory_bytes: defaults.max_memory_bytes,
        });

        let mut sessions = shared.sessions.write();
        if sessions.contains_key(session_id) {
            return Err(GibramError::Conflict(format!(
                "session already exists: {session_id}"
            )));
        }
        let max_sessions = defaults.max_sessions;
        if max_sessions > 0 && sessions.len() >= max_sessions {
            return Err(GibramError::SessionLimitExceeded(max_sessions));
        }

        shared.wal.append(
            WalEntryType::Insert,
            &wal_key(session_id, "session", session_id),
            encode_payload(&RecordPayload::Session(meta.clone()))?,
        )?;

        let shard = Arc::new(SessionShard::new(
            meta.clone(),
            shared.config.server.vector_dim,
            shared.config.hnsw.to_index_config(),
        ));
        sessions.insert(session_id.to_string(), Arc::clone(&shard));
        drop(sessions);

        let expire_at = shard.expire_at();
        if expire_at > 0 {
            shared.scheduler.update_session(session_id, expire_at);
        }
        shared.metrics.record_session_created();
        Ok(meta.info())
    }

    pub fn drop_session(&self, session_id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut sessions = shared.sessions.write();
        if !sessions.contains_key(session_id) {
            return Err(GibramError::SessionNotFound(session_id.to_string()));
        }
        shared.wal.append(
            WalEntryType::Delete,
            &wal_key(session_id, "session", session_id),
            Vec::new(),
        )?;
        sessions.remove(session_id);
        drop(sessions);
        shared.scheduler.remove_session(session_id);
        Ok(())
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let shard = self.shared.live_shard(session_id)?;
        Ok(shard.meta_snapshot().info())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.shared.sessions.read();
        let mut out: Vec<SessionInfo> = sessions
            .values()
            .map(|shard| shard.meta_snapshot().info())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    // ==================================================================
    // Documents
    // ==================================================================

    pub fn add_document(
        &self,
        session_id: &str,
        external_id: &str,
        filename: &str,
    ) -> Result<Document> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        if inner.store.document_by_external(external_id).is_ok() {
            return Err(GibramError::Conflict(format!(
                "document external id already exists: {external_id}"
            )));
        }
        inner.meta.check_document_quota(1).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;

        // Ids are dense and never reused, so allocation happens only after
        // every check that could fail has passed.
        let mut doc = Document::new(0, external_id, filename);
        let cost = doc.memory_cost() as u64;
        inner.meta.check_memory_quota(cost).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;
        doc.id = inner.ids.next(RecordKind::Document);

        self.shared.wal.append(
            WalEntryType::Insert,
            &wal_key(session_id, "document", doc.id),
            encode_payload(&RecordPayload::Document(doc.clone()))?,
        )?;

        inner.store.insert_document(doc.clone())?;
        inner.meta.document_count += 1;
        inner.meta.add_memory(cost);
        drop(inner);

        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(doc)
    }

    pub fn get_document(&self, session_id: &str, id: u64) -> Result<Document> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        inner.store.document(id).cloned()
    }

    pub fn update_document_status(
        &self,
        session_id: &str,
        id: u64,
        status: DocumentStatus,
    ) -> Result<Document> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        let mut doc = inner.store.document(id)?.clone();
        doc.status = status;

        self.shared.wal.append(
            WalEntryType::Update,
            &wal_key(session_id, "document", id),
            encode_payload(&RecordPayload::Document(doc.clone()))?,
        )?;

        inner.store.update_document_status(id, status)?;
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(doc)
    }

    /// Deletes the document and, transactionally, its text-units.
    pub fn delete_document(&self, session_id: &str, id: u64) -> Result<()> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        inner.store.document(id)?;
        self.shared.wal.append(
            WalEntryType::Delete,
            &wal_key(session_id, "document", id),
            Vec::new(),
        )?;

        let report = inner.store.delete_document(id)?;
        apply_cascade(&mut inner, &report);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(())
    }

    pub fn list_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        let mut out: Vec<Document> = inner.store.documents().cloned().collect();
        out.sort_by_key(|d| d.id);
        Ok(out)
    }

    // ==================================================================
    // Text units
    // ==================================================================

    pub fn add_text_unit(
        &self,
        session_id: &str,
        input: BulkTextUnitInput,
    ) -> Result<TextUnit> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();
        let tu = self.add_text_unit_locked(session_id, &mut inner, input)?;
        drop(inner);
        shard.touch();
        Ok(tu)
    }

    fn add_text_unit_locked(
        &self,
        session_id: &str,
        inner: &mut SessionInner,
        input: BulkTextUnitInput,
    ) -> Result<TextUnit> {
        if inner.store.text_unit_by_external(&input.external_id).is_ok() {
            return Err(GibramError::Conflict(format!(
                "text unit external id already exists: {}",
                input.external_id
            )));
        }
        inner.store.document(input.document_id)?;
        self.check_vector_dim(input.embedding.as_deref())?;

        let mut tu = TextUnit::new(
            0,
            input.external_id,
            input.document_id,
            input.content,
            input.token_count,
        );
        tu.embedding = input.embedding;

        let cost = tu.memory_cost() as u64;
        inner.meta.check_memory_quota(cost).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;
        tu.id = inner.ids.next(RecordKind::TextUnit);

        self.shared.wal.append(
            WalEntryType::Insert,
            &wal_key(session_id, "textunit", tu.id),
            encode_payload(&RecordPayload::TextUnit(tu.clone()))?,
        )?;

        inner.store.insert_text_unit(tu.clone())?;
        if let Some(vector) = &tu.embedding {
            inner.text_units.insert(tu.id, vector.clone())?;
        }
        inner.meta.text_unit_count += 1;
        inner.meta.add_memory(cost);
        self.shared.metrics.record_mutation();
        Ok(tu)
    }

    pub fn get_text_unit(&self, session_id: &str, id: u64) -> Result<TextUnit> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        inner.store.text_unit(id).cloned()
    }

    pub fn delete_text_unit(&self, session_id: &str, id: u64) -> Result<()> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        inner.store.text_unit(id)?;
        self.shared.wal.append(
            WalEntryType::Delete,
            &wal_key(session_id, "textunit", id),
            Vec::new(),
        )?;

        let report = inner.store.delete_text_unit(id)?;
        apply_cascade(&mut inner, &report);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(())
    }

    pub fn list_text_units(&self, session_id: &str) -> Result<Vec<TextUnit>> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        let mut out: Vec<TextUnit> = inner.store.text_units().cloned().collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    // ==================================================================
    // Entities
    // ==================================================================

    pub fn add_entity(&self, session_id: &str, input: BulkEntityInput) -> Result<Entity> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();
        let entity = self.add_entity_locked(session_id, &mut inner, input)?;
        drop(inner);
        shard.touch();
        Ok(entity)
    }

    fn add_entity_locked(
        &self,
        session_id: &str,
        inner: &mut SessionInner,
        input: BulkEntityInput,
    ) -> Result<Entity> {
        if inner.store.entity_by_external(&input.external_id).is_ok() {
            return Err(GibramError::Conflict(format!(
                "entity external id already exists: {}",
                input.external_id
            )));
        }
        if inner.store.entity_by_title(&input.title).is_some() {
            return Err(GibramError::Conflict(format!(
                "entity title already exists: {}",
                input.title
            )));
        }
        self.check_vector_dim(input.embedding.as_deref())?;
        inner.meta.check_entity_quota(1).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;

        let mut entity = Entity::new(
            0,
            input.external_id,
            crate::types::normalize_title(&input.title),
            input.entity_type,
            input.description,
        );
        entity.embedding = input.embedding;

        let cost = entity.memory_cost() as u64;
        inner.meta.check_memory_quota(cost).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;
        entity.id = inner.ids.next(RecordKind::Entity);

        self.shared.wal.append(
            WalEntryType::Insert,
            &wal_key(session_id, "entity", entity.id),
            encode_payload(&RecordPayload::Entity(entity.clone()))?,
        )?;

        inner.store.insert_entity(entity.clone())?;
        if let Some(vector) = &entity.embedding {
            inner.entities.insert(entity.id, vector.clone())?;
        }
        inner.meta.entity_count += 1;
        inner.meta.add_memory(cost);
        self.shared.metrics.record_mutation();
        Ok(entity)
    }

    pub fn get_entity(&self, session_id: &str, id: u64) -> Result<Entity> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        inner.store.entity(id).cloned()
    }

    pub fn get_entity_by_title(&self, session_id: &str, title: &str) -> Result<Entity> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        inner
            .store
            .entity_by_title(title)
            .cloned()
            .ok_or_else(|| GibramError::not_found("entity", title))
    }

    pub fn update_entity_description(
        &self,
        session_id: &str,
        id: u64,
        description: &str,
    ) -> Result<Entity> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        let mut entity = inner.store.entity(id)?.clone();
        entity.description = description.to_string();

        self.shared.wal.append(
            WalEntryType::Update,
            &wal_key(session_id, "entity", id),
            encode_payload(&RecordPayload::Entity(entity.clone()))?,
        )?;

        inner
            .store
            .update_entity_description(id, description.to_string())?;
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(entity)
    }

    /// Deletes the entity and, transactionally, every relationship touching
    /// it in either direction.
    pub fn delete_entity(&self, session_id: &str, id: u64) -> Result<()> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        inner.store.entity(id)?;
        self.shared.wal.append(
            WalEntryType::Delete,
            &wal_key(session_id, "entity", id),
            Vec::new(),
        )?;

        let report = inner.store.delete_entity(id)?;
        apply_cascade(&mut inner, &report);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(())
    }

    pub fn list_entities(&self, session_id: &str) -> Result<Vec<Entity>> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        let mut out: Vec<Entity> = inner.store.entities().cloned().collect();
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    // ==================================================================
    // Relationships
    // ==================================================================

    pub fn add_relationship(
        &self,
        session_id: &str,
        input: BulkRelationshipInput,
    ) -> Result<Relationship> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();
        let rel = self.add_relationship_locked(session_id, &mut inner, input)?;
        drop(inner);
        shard.touch();
        Ok(rel)
    }

    fn add_relationship_locked(
        &self,
        session_id: &str,
        inner: &mut SessionInner,
        input: BulkRelationshipInput,
    ) -> Result<Relationship> {
        if inner
            .store
            .relationship_by_external(&input.external_id)
            .is_ok()
        {
            return Err(GibramError::Conflict(format!(
                "relationship external id already exists: {}",
                input.external_id
            )));
        }
        if !input.weight.is_finite() || input.weight < 0.0 {
            return Err(GibramError::InvalidInput(format!(
                "relationship weight must be finite and non-negative, got {}",
                input.weight
            )));
        }
        inner.store.entity(input.source_id)?;
        inner.store.entity(input.target_id)?;
        inner.meta.check_relationship_quota(1).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;

        let mut rel = Relationship::new(
            0,
            input.external_id,
            input.source_id,
            input.target_id,
            input.rel_type,
            input.description,
            input.weight,
        );

        let cost = rel.memory_cost() as u64;
        inner.meta.check_memory_quota(cost).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;
        rel.id = inner.ids.next(RecordKind::Relationship);

        self.shared.wal.append(
            WalEntryType::Insert,
            &wal_key(session_id, "relationship", rel.id),
            encode_payload(&RecordPayload::Relationship(rel.clone()))?,
        )?;

        inner.store.insert_relationship(rel.clone())?;
        inner.meta.relationship_count += 1;
        inner.meta.add_memory(cost);
        self.shared.metrics.record_mutation();
        Ok(rel)
    }

    pub fn get_relationship(&self, session_id: &str, id: u64) -> Result<Relationship> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        inner.store.relationship(id).cloned()
    }

    pub fn delete_relationship(&self, session_id: &str, id: u64) -> Result<()> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        inner.store.relationship(id)?;
        self.shared.wal.append(
            WalEntryType::Delete,
            &wal_key(session_id, "relationship", id),
            Vec::new(),
        )?;

        let rel = inner.store.delete_relationship(id)?;
        inner.meta.relationship_count = inner.meta.relationship_count.saturating_sub(1);
        inner.meta.sub_memory(rel.memory_cost() as u64);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(())
    }

    pub fn list_relationships(&self, session_id: &str) -> Result<Vec<Relationship>> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        let mut out: Vec<Relationship> = inner.store.relationships().cloned().collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    // ==================================================================
    // Communities
    // ==================================================================

    pub fn add_community(
        &self,
        session_id: &str,
        external_id: &str,
        title: &str,
        level: u32,
        entity_ids: Vec<u64>,
        relationship_ids: Vec<u64>,
        embedding: Option<Vec<f32>>,
    ) -> Result<Community> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        for id in &entity_ids {
            inner.store.entity(*id)?;
        }
        for id in &relationship_ids {
            inner.store.relationship(*id)?;
        }
        self.check_vector_dim(embedding.as_deref())?;

        let mut community = Community::new(0, external_id, level, entity_ids, relationship_ids);
        community.title = title.to_string();
        community.embedding = embedding;

        let cost = community.memory_cost() as u64;
        inner.meta.check_memory_quota(cost).map_err(|e| {
            self.shared.metrics.record_quota_rejection();
            e
        })?;
        community.id = inner.ids.next(RecordKind::Community);

        self.shared.wal.append(
            WalEntryType::Insert,
            &wal_key(session_id, "community", community.id),
            encode_payload(&RecordPayload::Community(community.clone()))?,
        )?;

        inner.store.insert_community(community.clone())?;
        if let Some(vector) = &community.embedding {
            inner.communities.insert(community.id, vector.clone())?;
        }
        inner.meta.community_count += 1;
        inner.meta.add_memory(cost);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(community)
    }

    pub fn get_community(&self, session_id: &str, id: u64) -> Result<Community> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        inner.store.community(id).cloned()
    }

    /// Fill in the title/summary/report an external layer produced for a
    /// detected community.
    pub fn update_community_report(
        &self,
        session_id: &str,
        id: u64,
        title: &str,
        summary: &str,
        full_content: &str,
    ) -> Result<Community> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        let mut community = inner.store.community(id)?.clone();
        community.title = title.to_string();
        community.summary = summary.to_string();
        community.full_content = full_content.to_string();

        self.shared.wal.append(
            WalEntryType::Update,
            &wal_key(session_id, "community", id),
            encode_payload(&RecordPayload::Community(community.clone()))?,
        )?;

        let old_cost = inner.store.community(id)?.memory_cost() as u64;
        inner.store.upsert_community(community.clone());
        inner.meta.sub_memory(old_cost);
        inner.meta.add_memory(community.memory_cost() as u64);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(community)
    }

    pub fn delete_community(&self, session_id: &str, id: u64) -> Result<()> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        inner.store.community(id)?;
        self.shared.wal.append(
            WalEntryType::Delete,
            &wal_key(session_id, "community", id),
            Vec::new(),
        )?;

        let community = inner.store.delete_community(id)?;
        inner.communities.remove(id);
        inner.meta.community_count = inner.meta.community_count.saturating_sub(1);
        inner.meta.sub_memory(community.memory_cost() as u64);
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(())
    }

    pub fn list_communities(&self, session_id: &str) -> Result<Vec<Community>> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        let mut out: Vec<Community> = inner.store.communities().cloned().collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    // ==================================================================
    // Links
    // ==================================================================

    pub fn link_text_unit_to_entity(
        &self,
        session_id: &str,
        text_unit_id: u64,
        entity_id: u64,
    ) -> Result<()> {
        self.apply_link(session_id, text_unit_id, entity_id, true)
    }

    pub fn unlink_text_unit_from_entity(
        &self,
        session_id: &str,
        text_unit_id: u64,
        entity_id: u64,
    ) -> Result<()> {
        self.apply_link(session_id, text_unit_id, entity_id, false)
    }

    fn apply_link(
        &self,
        session_id: &str,
        text_unit_id: u64,
        entity_id: u64,
        link: bool,
    ) -> Result<()> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        inner.store.text_unit(text_unit_id)?;
        inner.store.entity(entity_id)?;

        self.shared.wal.append(
            WalEntryType::Update,
            &wal_key(session_id, "link", format!("{text_unit_id}:{entity_id}")),
            encode_payload(&RecordPayload::Link {
                text_unit_id,
                entity_id,
                link,
            })?,
        )?;

        if link {
            inner.store.link(text_unit_id, entity_id)?;
        } else {
            inner.store.unlink(text_unit_id, entity_id)?;
        }
        drop(inner);
        shard.touch();
        self.shared.metrics.record_mutation();
        Ok(())
    }

    // ==================================================================
    // Bulk variants: each record reports its own outcome.
    // ==================================================================

    pub fn bulk_add_documents(
        &self,
        session_id: &str,
        inputs: Vec<BulkDocumentInput>,
    ) -> Result<Vec<Result<u64>>> {
        self.shared.live_shard(session_id)?;
        Ok(inputs
            .into_iter()
            .map(|input| {
                self.add_document(session_id, &input.external_id, &input.filename)
                    .map(|d| d.id)
            })
            .collect())
    }

    pub fn bulk_add_text_units(
        &self,
        session_id: &str,
        inputs: Vec<BulkTextUnitInput>,
    ) -> Result<Vec<Result<u64>>> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();
        let out = inputs
            .into_iter()
            .map(|input| {
                self.add_text_unit_locked(session_id, &mut inner, input)
                    .map(|t| t.id)
            })
            .collect();
        drop(inner);
        shard.touch();
        Ok(out)
    }

    pub fn bulk_add_entities(
        &self,
        session_id: &str,
        inputs: Vec<BulkEntityInput>,
    ) -> Result<Vec<Result<u64>>> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();
        let out = inputs
            .into_iter()
            .map(|input| {
                self.add_entity_locked(session_id, &mut inner, input)
                    .map(|e| e.id)
            })
            .collect();
        drop(inner);
        shard.touch();
        Ok(out)
    }

    pub fn bulk_add_relationships(
        &self,
        session_id: &str,
        inputs: Vec<BulkRelationshipInput>,
    ) -> Result<Vec<Result<u64>>> {
        let shard = self.shared.live_shard(session_id)?;
        let mut inner = shard.inner.write();
        let out = inputs
            .into_iter()
            .map(|input| {
                self.add_relationship_locked(session_id, &mut inner, input)
                    .map(|r| r.id)
            })
            .collect();
        drop(inner);
        shard.touch();
        Ok(out)
    }

    pub fn bulk_delete_entities(
        &self,
        session_id: &str,
        ids: Vec<u64>,
    ) -> Result<Vec<Result<u64>>> {
        self.shared.live_shard(session_id)?;
        Ok(ids
            .into_iter()
            .map(|id| self.delete_entity(session_id, id).map(|_| id))
            .collect())
    }

    // ==================================================================
    // Queries
    // ==================================================================

    pub fn query(&self, session_id: &str, spec: &QuerySpec) -> Result<ContextPack> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        self.validate_query_vector(&spec.query_vector)?;

        let query_id = inner.ids.next(RecordKind::Query);
        let ctx = QueryContext {
            store: &inner.store,
            text_unit_index: &inner.text_units,
            entity_index: &inner.entities,
            community_index: &inner.communities,
            ef_search: self.shared.config.hnsw.ef_search_default,
        };
        let pack = query::run_query(&ctx, spec, query_id)?;
        drop(inner);

        shard.touch();
        self.shared.metrics.record_query(pack.stats.duration_micros);
        Ok(pack)
    }

    pub fn explain(&self, session_id: &str, spec: &QuerySpec) -> Result<ExplainPack> {
        let shard = self.shared.live_shard(session_id)?;
        let inner = shard.inner.read();
        self.validate_query_vector(&spec.query_vector)?;

        let query_id = inner.ids.next(RecordKind::Query);
        let ctx = QueryContext {
            store: &inner.store,
            text_unit_index: &inner.text_units,
            entity_index: &inner.entities,
            community_index: &inner.communities,
            ef_search: self.shared.config.hnsw.ef_search_default,
        };
        let pack = query::explain_query(&ctx, spec, query_id)?;
        drop(inner);
        shard.touch();
        Ok(pack)
    }

    // ==================================================================
    // Community detection
    // ==================================================================

    pub fn compute_communities(
        &self,
        session_id: &str,
        config: LeidenConfig,
    ) -> Result<Vec<Community>> {
        self.shared.compute_communities(session_id, config)
    }

    pub fn compute_hierarchical_communities(
        &self,
        session_id: &str,
        config: LeidenConfig,
    ) -> Result<Vec<Vec<Community>>> {
        self.shared.compute_hierarchical_communities(session_id, config)
    }

    pub fn submit_community_task(
        &self,
        session_id: &str,
        config: LeidenConfig,
        hierarchical: bool,
    ) -> Result<String> {
        self.shared.live_shard(session_id)?;
        self.tasks.submit(session_id, config, hierarchical)
    }

    pub fn get_task_status(&self, task_id: &str) -> Result<CommunityTask> {
        self.tasks.status(task_id)
    }

    pub async fn await_task_result(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Vec<Community>> {
        self.tasks.await_result(task_id, timeout).await
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.tasks.cancel(task_id)
    }

    pub fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        self.tasks.cleanup_old_tasks(max_age)
    }

    pub fn tasks_for_session(&self, session_id: &str) -> Vec<CommunityTask> {
        self.tasks.tasks_for_session(session_id)
    }

    pub fn task_stats(&self) -> TaskManagerStats {
        self.tasks.stats()
    }

    // ==================================================================
    // Durability
    // ==================================================================

    /// Two-phase snapshot of all session state; returns where it landed.
    pub fn save_snapshot(&self) -> Result<SaveInfo> {
        self.shared.save_snapshot()
    }

    /// Replace all in-memory state from a snapshot file.
    pub fn load_snapshot(&self, path: &Path) -> Result<()> {
        let contents = snapshot::read_snapshot(path)?;
        let mut shards = HashMap::new();
        restore_sections(&self.shared.config, &mut shards, &contents)?;
        verify_counters(&mut shards);

        let mut sessions = self.shared.sessions.write();
        *sessions = shards;
        for (id, shard) in sessions.iter() {
            let expire_at = shard.expire_at();
            if expire_at > 0 {
                self.shared.scheduler.update_session(id, expire_at);
            }
        }
        info!(path = %path.display(), sessions = sessions.len(), "snapshot loaded");
        Ok(())
    }

    /// Remove WAL segments wholly below `lsn`.
    pub fn wal_truncate(&self, lsn: u64) -> Result<usize> {
        self.shared.wal.truncate_before(lsn)
    }

    pub fn wal_sync(&self) -> Result<()> {
        self.shared.wal.sync()?;
        self.shared.metrics.record_wal_sync();
        Ok(())
    }

    pub fn info(&self) -> ServerInfo {
        let sessions = self.shared.sessions.read();
        let mut info = ServerInfo {
            version: ENGINE_VERSION.to_string(),
            session_count: sessions.len(),
            vector_dim: self.shared.config.server.vector_dim,
            current_lsn: self.shared.wal.current_lsn(),
            flushed_lsn: self.shared.wal.flushed_lsn(),
            ..Default::default()
        };
        for shard in sessions.values() {
            let inner = shard.inner.read();
            info.document_count += inner.store.document_count();
            info.text_unit_count += inner.store.text_unit_count();
            info.entity_count += inner.store.entity_count();
            info.relationship_count += inner.store.relationship_count();
            info.community_count += inner.store.community_count();
        }
        info
    }

    /// Liveness: cheap and always true while the process serves requests.
    pub fn health(&self) -> Result<()> {
        Ok(())
    }

    /// Register the engine's flush hook with the daemon's shutdown
    /// coordinator: sync the WAL, then write a snapshot opportunistically.
    pub fn register_shutdown_hook(&self, coordinator: &crate::shutdown::ShutdownCoordinator) {
        let shared = Arc::clone(&self.shared);
        coordinator.register("engine-flush", 10, move || {
            let shared = Arc::clone(&shared);
            async move {
                shared.wal.sync().map_err(|e| e.to_string())?;
                shared.save_snapshot().map_err(|e| e.to_string())?;
                Ok(())
            }
        });
    }

    /// Stop background loops, sync the WAL, and write a final snapshot
    /// opportunistically.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);

        if let Some(handle) = self.shared.scheduler.stop() {
            let _ = handle.await;
        }
        for handle in self.tasks.shutdown() {
            let _ = handle.await;
        }
        for handle in self.background.lock().drain(..) {
            let _ = handle.await;
        }

        if let Err(e) = self.shared.wal.sync() {
            warn!(error = %e, "final wal sync failed");
        }
        match self.shared.save_snapshot() {
            Ok(saved) => info!(path = %saved.path.display(), "shutdown snapshot written"),
            Err(e) => warn!(error = %e, "shutdown snapshot failed"),
        }
    }

    // ==================================================================
    // Internals
    // ==================================================================

    fn check_vector_dim(&self, vector: Option<&[f32]>) -> Result<()> {
        if let Some(v) = vector {
            let expected = self.shared.config.server.vector_dim;
            if v.len() != expected {
                return Err(GibramError::DimensionMismatch {
                    expected,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }

    fn validate_query_vector(&self, vector: &[f32]) -> Result<()> {
        let expected = self.shared.config.server.vector_dim;
        if vector.len() != expected {
            return Err(GibramError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl EngineShared {
    /// Look up a session; an expired one is evicted as a side effect and
    /// reported as `SessionExpired`.
    fn live_shard(&self, session_id: &str) -> Result<Arc<SessionShard>> {
        let shard = {
            let sessions = self.sessions.read();
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| GibramError::SessionNotFound(session_id.to_string()))?
        };
        if shard.is_expired() {
            self.sessions.write().remove(session_id);
            self.scheduler.remove_session(session_id);
            self.metrics.record_session_evicted();
            return Err(GibramError::SessionExpired(session_id.to_string()));
        }
        Ok(shard)
    }

    fn compute_communities(
        &self,
        session_id: &str,
        config: LeidenConfig,
    ) -> Result<Vec<Community>> {
        let level = {
            let shard = self.live_shard(session_id)?;
            let inner = shard.inner.read();
            let (ids, edges) = leiden_input(&inner.store);
            community::leiden(&ids, &edges, &config)
        };
        self.install_communities(session_id, vec![level], &config)
    }

    fn compute_hierarchical_communities(
        &self,
        session_id: &str,
        config: LeidenConfig,
    ) -> Result<Vec<Vec<Community>>> {
        let levels = {
            let shard = self.live_shard(session_id)?;
            let inner = shard.inner.read();
            let (ids, edges) = leiden_input(&inner.store);
            community::hierarchical_leiden(&ids, &edges, &config)
        };
        let level_count = levels.len();
        let flat = self.install_communities(session_id, levels, &config)?;

        let mut by_level: Vec<Vec<Community>> = vec![Vec::new(); level_count];
        for community in flat {
            let idx = community.level as usize;
            if idx < by_level.len() {
                by_level[idx].push(community);
            }
        }
        Ok(by_level)
    }

    /// Build community records from detection output and atomically replace
    /// the session's derived community set.
    fn install_communities(
        &self,
        session_id: &str,
        levels: Vec<LeidenLevel>,
        config: &LeidenConfig,
    ) -> Result<Vec<Community>> {
        let shard = self.live_shard(session_id)?;
        let mut inner = shard.inner.write();

        let mut records: Vec<Community> = Vec::new();
        for level in &levels {
            for (cluster_idx, members) in level.clusters.iter().enumerate() {
                if members.len() < config.min_community_size.max(1) {
                    continue;
                }
                let member_set: std::collections::HashSet<u64> =
                    members.iter().copied().collect();
                let rel_ids: Vec<u64> = inner
                    .store
                    .relationships()
                    .filter(|r| {
                        member_set.contains(&r.source_id) && member_set.contains(&r.target_id)
                    })
                    .map(|r| r.id)
                    .collect();
                let mut rel_ids = rel_ids;
                rel_ids.sort_unstable();

                let id = inner.ids.next(RecordKind::Community);
                let community = Community::new(
                    id,
                    format!("leiden-{}-{}", level.level, cluster_idx),
                    level.level,
                    members.clone(),
                    rel_ids,
                );
                records.push(community);
            }
        }

        self.wal.append(
            WalEntryType::Update,
            &wal_key(session_id, "communities", "set"),
            encode_payload(&RecordPayload::CommunitySet(records.clone()))?,
        )?;

        let old = inner.store.replace_communities(records.clone());
        for community in &old {
            inner.communities.remove(community.id);
            inner.meta.sub_memory(community.memory_cost() as u64);
        }
        for community in &records {
            inner.meta.add_memory(community.memory_cost() as u64);
        }
        inner.meta.community_count = records.len() as u64;
        drop(inner);

        shard.touch();
        self.metrics.record_mutation();
        Ok(records)
    }

    fn save_snapshot(&self) -> Result<SaveInfo> {
        let prepared = self.coordinator.prepare()?;

        let shards: Vec<(String, Arc<SessionShard>)> = {
            let sessions = self.sessions.read();
            let mut list: Vec<(String, Arc<SessionShard>)> = sessions
                .iter()
                .map(|(id, shard)| (id.clone(), Arc::clone(shard)))
                .collect();
            list.sort_by(|a, b| a.0.cmp(&b.0));
            list
        };

        let info = self.coordinator.commit(prepared, |writer| {
            let mut sessions_section: Vec<Session> = Vec::new();
            let mut documents: Vec<(String, Vec<Document>)> = Vec::new();
            let mut text_units: Vec<(String, Vec<TextUnit>)> = Vec::new();
            let mut entities: Vec<(String, Vec<Entity>)> = Vec::new();
            let mut relationships: Vec<(String, Vec<Relationship>)> = Vec::new();
            let mut communities: Vec<(String, Vec<Community>)> = Vec::new();
            let mut id_counters: Vec<(String, IdCounters)> = Vec::new();
            let mut hnsw_graphs: Vec<(String, Vec<(u8, Vec<(u64, Vec<f32>)>)>)> = Vec::new();

            // Each shard is captured under its read guard; the cut is
            // consistent per session.
            for (id, shard) in &shards {
                let inner = shard.inner.read();
                sessions_section.push({
                    let mut meta = inner.meta.clone();
                    meta.last_access = shard.last_access.load(Ordering::Relaxed);
                    meta
                });
                documents.push((id.clone(), sorted_by_id(inner.store.documents(), |d| d.id)));
                text_units.push((id.clone(), sorted_by_id(inner.store.text_units(), |t| t.id)));
                entities.push((id.clone(), sorted_by_id(inner.store.entities(), |e| e.id)));
                relationships.push((
                    id.clone(),
                    sorted_by_id(inner.store.relationships(), |r| r.id),
                ));
                communities.push((id.clone(), sorted_by_id(inner.store.communities(), |c| c.id)));
                id_counters.push((id.clone(), inner.ids.counters()));
                hnsw_graphs.push((
                    id.clone(),
                    vec![
                        (0, collect_vectors(&inner.text_units)),
                        (1, collect_vectors(&inner.entities)),
                        (2, collect_vectors(&inner.communities)),
                    ],
                ));
            }

            writer.section(section::SESSIONS, &sessions_section)?;
            writer.section(section::DOCUMENTS, &documents)?;
            writer.section(section::TEXT_UNITS, &text_units)?;
            writer.section(section::ENTITIES, &entities)?;
            writer.section(section::RELATIONSHIPS, &relationships)?;
            writer.section(section::COMMUNITIES, &communities)?;
            writer.section(section::ID_COUNTERS, &id_counters)?;
            writer.section(section::HNSW_GRAPHS, &hnsw_graphs)?;
            Ok(())
        })?;

        // Mark the cut in the log; replay treats it as a no-op.
        self.wal.append(
            WalEntryType::Checkpoint,
            &wal_key("_", "checkpoint", info.lsn),
            Vec::new(),
        )?;
        self.metrics.record_snapshot(info.lsn);
        Ok(info)
    }
}

fn sorted_by_id<'a, T: Clone + 'a>(
    iter: impl Iterator<Item = &'a T>,
    key: impl Fn(&T) -> u64,
) -> Vec<T> {
    let mut out: Vec<T> = iter.cloned().collect();
    out.sort_by_key(key);
    out
}

fn collect_vectors(index: &HnswIndex) -> Vec<(u64, Vec<f32>)> {
    let mut out: Vec<(u64, Vec<f32>)> = index
        .iter_vectors()
        .map(|(id, v)| (id, v.to_vec()))
        .collect();
    out.sort_by_key(|(id, _)| *id);
    out
}

/// Subtract a cascade's records from counters, memory, and vector indexes.
fn apply_cascade(inner: &mut SessionInner, report: &CascadeReport) {
    for doc in &report.documents {
        inner.meta.document_count = inner.meta.document_count.saturating_sub(1);
        inner.meta.sub_memory(doc.memory_cost() as u64);
    }
    for tu in &report.text_units {
        inner.text_units.remove(tu.id);
        inner.meta.text_unit_count = inner.meta.text_unit_count.saturating_sub(1);
        inner.meta.sub_memory(tu.memory_cost() as u64);
    }
    for entity in &report.entities {
        inner.entities.remove(entity.id);
        inner.meta.entity_count = inner.meta.entity_count.saturating_sub(1);
        inner.meta.sub_memory(entity.memory_cost() as u64);
    }
    for rel in &report.relationships {
        inner.meta.relationship_count = inner.meta.relationship_count.saturating_sub(1);
        inner.meta.sub_memory(rel.memory_cost() as u64);
    }
    for community in &report.communities {
        inner.communities.remove(community.id);
        inner.meta.community_count = inner.meta.community_count.saturating_sub(1);
        inner.meta.sub_memory(community.memory_cost() as u64);
    }
}

fn leiden_input(store: &SessionStore) -> (Vec<u64>, Vec<LeidenEdge>) {
    let mut ids: Vec<u64> = store.entities().map(|e| e.id).collect();
    ids.sort_unstable();
    let mut edges: Vec<LeidenEdge> = store
        .relationships()
        .map(|r| LeidenEdge {
            source: r.source_id,
            target: r.target_id,
            weight: r.weight,
        })
        .collect();
    edges.sort_by(|a, b| (a.source, a.target).cmp(&(b.source, b.target)));
    (ids, edges)
}

// ============================================================================
// Restore + replay
// ============================================================================

fn get_or_create_shard<'a>(
    config: &GibramConfig,
    shards: &'a mut HashMap<String, Arc<SessionShard>>,
    session_id: &str,
) -> &'a Arc<SessionShard> {
    shards.entry(session_id.to_string()).or_insert_with(|| {
        Arc::new(SessionShard::new(
            Session::new(session_id),
            config.server.vector_dim,
            config.hnsw.to_index_config(),
        ))
    })
}

/// Rebuild shards from snapshot sections. Vector indexes are rebuilt by
/// re-inserting stored vectors, not by deserialising graph edges.
fn restore_sections(
    config: &GibramConfig,
    shards: &mut HashMap<String, Arc<SessionShard>>,
    contents: &SnapshotContents,
) -> Result<()> {
    let sessions: Vec<Session> = contents.decode(section::SESSIONS)?.unwrap_or_default();
    for meta in sessions {
        let session_id = meta.id.clone();
        let shard = Arc::new(SessionShard::new(
            meta,
            config.server.vector_dim,
            config.hnsw.to_index_config(),
        ));
        shards.insert(session_id, shard);
    }

    let documents: Vec<(String, Vec<Document>)> =
        contents.decode(section::DOCUMENTS)?.unwrap_or_default();
    for (session_id, records) in documents {
        let shard = get_or_create_shard(config, shards, &session_id);
        let mut inner = shard.inner.write();
        for doc in records {
            inner.store.upsert_document(doc);
        }
    }

    let text_units: Vec<(String, Vec<TextUnit>)> =
        contents.decode(section::TEXT_UNITS)?.unwrap_or_default();
    // Entities restore before text units would also work; text units only
    // backfill links onto entities that already exist, so restore entities
    // first and replay the links from the entity side.
    let entities: Vec<(String, Vec<Entity>)> =
        contents.decode(section::ENTITIES)?.unwrap_or_default();
    for (session_id, records) in entities {
        let shard = get_or_create_shard(config, shards, &session_id);
        let mut inner = shard.inner.write();
        for entity in records {
            inner.store.upsert_entity(entity);
        }
    }
    for (session_id, records) in text_units {
        let shard = get_or_create_shard(config, shards, &session_id);
        let mut inner = shard.inner.write();
        for tu in records {
            inner.store.upsert_text_unit(tu);
        }
    }

    let relationships: Vec<(String, Vec<Relationship>)> =
        contents.decode(section::RELATIONSHIPS)?.unwrap_or_default();
    for (session_id, records) in relationships {
        let shard = get_or_create_shard(config, shards, &session_id);
        let mut inner = shard.inner.write();
        for rel in records {
            inner.store.upsert_relationship(rel);
        }
    }

    let communities: Vec<(String, Vec<Community>)> =
        contents.decode(section::COMMUNITIES)?.unwrap_or_default();
    for (session_id, records) in communities {
        let shard = get_or_create_shard(config, shards, &session_id);
        let mut inner = shard.inner.write();
        for community in records {
            inner.store.upsert_community(community);
        }
    }

    let id_counters: Vec<(String, IdCounters)> =
        contents.decode(section::ID_COUNTERS)?.unwrap_or_default();
    for (session_id, counters) in id_counters {
        let shard = get_or_create_shard(config, shards, &session_id);
        let inner = shard.inner.write();
        inner.ids.set_counters(&counters);
    }

    let hnsw_graphs: Vec<(String, Vec<(u8, Vec<(u64, Vec<f32>)>)>)> =
        contents.decode(section::HNSW_GRAPHS)?.unwrap_or_default();
    for (session_id, kinds) in hnsw_graphs {
        let shard = get_or_create_shard(config, shards, &session_id);
        let mut inner = shard.inner.write();
        for (kind, vectors) in kinds {
            for (id, vector) in vectors {
                let result = match kind {
                    0 => inner.text_units.insert(id, vector),
                    1 => inner.entities.insert(id, vector),
                    2 => inner.communities.insert(id, vector),
                    _ => Ok(()), // unknown kind tag from a newer writer
                };
                if let Err(e) = result {
                    warn!(session = %session_id, id, error = %e, "skipping bad snapshot vector");
                }
            }
        }
    }

    Ok(())
}

/// Apply one WAL entry. Idempotent by construction: Insert of an existing
/// id replaces it, Delete of a missing id is a no-op.
fn replay_entry(
    config: &GibramConfig,
    shards: &mut HashMap<String, Arc<SessionShard>>,
    entry: &WalEntry,
) -> Result<()> {
    let Some((session_id, kind, rest)) = parse_wal_key(&entry.key) else {
        warn!(key = %entry.key, lsn = entry.lsn, "skipping wal entry with malformed key");
        return Ok(());
    };

    match (kind, entry.entry_type) {
        ("checkpoint", _) => {}

        ("session", WalEntryType::Insert | WalEntryType::Update) => {
            if let RecordPayload::Session(meta) = decode_payload(&entry.payload)? {
                let shard = Arc::new(SessionShard::new(
                    meta,
                    config.server.vector_dim,
                    config.hnsw.to_index_config(),
                ));
                shards.insert(session_id.to_string(), shard);
            }
        }
        ("session", WalEntryType::Delete) => {
            shards.remove(session_id);
        }

        ("communities", WalEntryType::Update) => {
            if let RecordPayload::CommunitySet(records) = decode_payload(&entry.payload)? {
                let shard = get_or_create_shard(config, shards, session_id);
                let mut inner = shard.inner.write();
                for community in &records {
                    inner.ids.bump_to(RecordKind::Community, community.id);
                }
                let old = inner.store.replace_communities(records);
                for community in old {
                    inner.communities.remove(community.id);
                }
            }
        }

        ("link", WalEntryType::Update) => {
            if let RecordPayload::Link {
                text_unit_id,
                entity_id,
                link,
            } = decode_payload(&entry.payload)?
            {
                let shard = get_or_create_shard(config, shards, session_id);
                let mut inner = shard.inner.write();
                // A referenced record may have been deleted later in the
                // log; replay stays quiet about it.
                let _ = if link {
                    inner.store.link(text_unit_id, entity_id)
                } else {
                    inner.store.unlink(text_unit_id, entity_id)
                };
            }
        }

        (_, WalEntryType::Insert | WalEntryType::Update) => {
            let shard = get_or_create_shard(config, shards, session_id);
            let mut inner = shard.inner.write();
            match decode_payload(&entry.payload)? {
                RecordPayload::Document(doc) => {
                    inner.ids.bump_to(RecordKind::Document, doc.id);
                    inner.store.upsert_document(doc);
                }
                RecordPayload::TextUnit(tu) => {
                    inner.ids.bump_to(RecordKind::TextUnit, tu.id);
                    if let Some(vector) = tu.embedding.clone() {
                        let _ = inner.text_units.insert(tu.id, vector);
                    }
                    inner.store.upsert_text_unit(tu);
                }
                RecordPayload::Entity(entity) => {
                    inner.ids.bump_to(RecordKind::Entity, entity.id);
                    if let Some(vector) = entity.embedding.clone() {
                        let _ = inner.entities.insert(entity.id, vector);
                    }
                    inner.store.upsert_entity(entity);
                }
                RecordPayload::Relationship(rel) => {
                    inner.ids.bump_to(RecordKind::Relationship, rel.id);
                    inner.store.upsert_relationship(rel);
                }
                RecordPayload::Community(community) => {
                    inner.ids.bump_to(RecordKind::Community, community.id);
                    if let Some(vector) = community.embedding.clone() {
                        let _ = inner.communities.insert(community.id, vector);
                    }
                    inner.store.upsert_community(community);
                }
                other => {
                    warn!(key = %entry.key, lsn = entry.lsn, ?other, "unexpected wal payload, skipping");
                }
            }
        }

        (_, WalEntryType::Delete) => {
            let Ok(id) = rest.parse::<u64>() else {
                warn!(key = %entry.key, lsn = entry.lsn, "skipping delete with non-numeric id");
                return Ok(());
            };
            let shard = get_or_create_shard(config, shards, session_id);
            let mut inner = shard.inner.write();
            match kind {
                "document" => {
                    if let Ok(report) = inner.store.delete_document(id) {
                        for tu in &report.text_units {
                            inner.text_units.remove(tu.id);
                        }
                    }
                }
                "textunit" => {
                    if inner.store.delete_text_unit(id).is_ok() {
                        inner.text_units.remove(id);
                    }
                }
                "entity" => {
                    if inner.store.delete_entity(id).is_ok() {
                        inner.entities.remove(id);
                    }
                }
                "relationship" => {
                    let _ = inner.store.delete_relationship(id);
                }
                "community" => {
                    if inner.store.delete_community(id).is_ok() {
                        inner.communities.remove(id);
                    }
                }
                _ => {
                    warn!(key = %entry.key, lsn = entry.lsn, "skipping delete of unknown kind");
                }
            }
        }

        (kind, kind_type) => {
            warn!(key = %entry.key, lsn = entry.lsn, kind, ?kind_type, "skipping unhandled wal entry");
        }
    }
    Ok(())
}

/// Recovery verify pass: recompute per-session counters and memory from the
/// scanned records; scanned truth overwrites whatever was persisted.
fn verify_counters(shards: &mut HashMap<String, Arc<SessionShard>>) {
    for (session_id, shard) in shards.iter() {
        let mut inner = shard.inner.write();

        let document_count = inner.store.document_count() as u64;
        let text_unit_count = inner.store.text_unit_count() as u64;
        let entity_count = inner.store.entity_count() as u64;
        let relationship_count = inner.store.relationship_count() as u64;
        let community_count = inner.store.community_count() as u64;

        let mut memory: u64 = 0;
        memory += inner.store.documents().map(|r| r.memory_cost() as u64).sum::<u64>();
        memory += inner.store.text_units().map(|r| r.memory_cost() as u64).sum::<u64>();
        memory += inner.store.entities().map(|r| r.memory_cost() as u64).sum::<u64>();
        memory += inner.store.relationships().map(|r| r.memory_cost() as u64).sum::<u64>();
        memory += inner.store.communities().map(|r| r.memory_cost() as u64).sum::<u64>();

        let meta = &mut inner.meta;
        if meta.document_count != document_count
            || meta.text_unit_count != text_unit_count
            || meta.entity_count != entity_count
            || meta.relationship_count != relationship_count
            || meta.community_count != community_count
        {
            warn!(
                session = %session_id,
                "persisted session counters disagree with scanned records; overwriting"
            );
        }
        meta.document_count = document_count;
        meta.text_unit_count = text_unit_count;
        meta.entity_count = entity_count;
        meta.relationship_count = relationship_count;
        meta.community_count = community_count;
        meta.memory_bytes = memory;

        // Id counters must clear every live id.
        let max_doc = inner.store.documents().map(|d| d.id).max().unwrap_or(0);
        let max_tu = inner.store.text_units().map(|t| t.id).max().unwrap_or(0);
        let max_ent = inner.store.entities().map(|e| e.id).max().unwrap_or(0);
        let max_rel = inner.store.relationships().map(|r| r.id).max().unwrap_or(0);
        let max_comm = inner.store.communities().map(|c| c.id).max().unwrap_or(0);
        inner.ids.bump_to(RecordKind::Document, max_doc);
        inner.ids.bump_to(RecordKind::TextUnit, max_tu);
        inner.ids.bump_to(RecordKind::Entity, max_ent);
        inner.ids.bump_to(RecordKind::Relationship, max_rel);
        inner.ids.bump_to(RecordKind::Community, max_comm);
    }
}
