//! GibRAM - In-memory knowledge-graph engine for RAG workloads
//!
//! Sessions are isolated graph + vector workspaces with TTLs and quotas.
//! Hybrid queries seed from per-kind HNSW indexes and expand over the
//! relationship graph; durability comes from a checksummed WAL plus atomic
//! sectioned snapshots, reconciled by a two-phase backup coordinator and a
//! startup recovery planner.

// ===== Core modules =====

// Data model: records, ids, query/result types
pub mod types;

// Error taxonomy: stable codes + structured context
pub mod error;

// SIMD-accelerated distance kernels (runtime-dispatched, safe fallback)
pub mod simd;

// Vector search: hand-rolled HNSW proximity graph
pub mod hnsw;

// Per-session record store with secondary and adjacency indexes
pub mod store;

// Session state: TTLs and quota accounting
pub mod session;

// Durability: segmented WAL with xxh64 checksums
pub mod wal;

// Durability: atomic gzip-sectioned snapshots
pub mod snapshot;

// Two-phase backup coordinator (prepare pins the LSN, commit writes)
pub mod backup;

// Startup recovery: snapshot restore + WAL tail replay
pub mod recovery;

// Hybrid query planner: ANN seeds + k-hop BFS
pub mod query;

// Community detection: hierarchical Leiden
pub mod community;

// Async task manager for community computations
pub mod tasks;

// Heap-based session TTL eviction
pub mod cleanup;

// The session engine: external operation surface
pub mod engine;

// Configuration management: YAML parsing, validation
pub mod config;

// Passive metrics collection (atomic counters, copy-out snapshot)
pub mod metrics;

// Graceful shutdown hooks (priority-ordered, deadline-bounded)
pub mod shutdown;

// ===== Public API =====

// Engine surface
pub use engine::{Engine, ENGINE_VERSION};

// Data model
pub use types::{
    BulkDocumentInput, BulkEntityInput, BulkRelationshipInput, BulkTextUnitInput, Community,
    ContextPack, Document, DocumentStatus, Entity, ExplainPack, IdCounters, IdGenerator,
    QuerySpec, QueryStats, RecordKind, Relationship, SearchType, ServerInfo, TextUnit,
};

// Errors
pub use error::{ErrorCode, GibramError, Result};

// Sessions
pub use session::{Session, SessionInfo, SessionQuotas};

// Vector search
pub use hnsw::{HnswConfig, HnswIndex, SearchHit};
pub use simd::{cosine_similarity, dot_product, l2_distance, l2_norm, DistanceKind};

// Durability
pub use backup::{BackupCoordinator, PreparedBackup, SaveInfo};
pub use recovery::{RecoveryPlan, RecoveryStats};
pub use snapshot::{SnapshotMeta, SnapshotWriter, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use wal::{Wal, WalEntry, WalEntryType, WalSyncPolicy};

// Community detection
pub use community::{LeidenConfig, LeidenEdge, LeidenLevel};
pub use tasks::{CommunityTask, CommunityTaskManager, TaskManagerStats, TaskStatus};

// Cleanup scheduler
pub use cleanup::{CleanupScheduler, SchedulerStats};

// Configuration
pub use config::{
    GibramConfig, HnswSettings, LeidenSettings, LoggingConfig, ServerConfig, SessionDefaults,
    SnapshotConfig, WalConfig, WalSyncMode,
};

// Metrics and shutdown
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use shutdown::{ShutdownCoordinator, DEFAULT_SHUTDOWN_TIMEOUT};
