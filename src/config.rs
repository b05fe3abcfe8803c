// Configuration management.
//
// Priority order (highest to lowest):
// 1. Programmatic overrides by the embedding daemon
// 2. Config file (YAML)
// 3. Built-in defaults
//
// Design principles:
// - Sensible defaults (works out of the box)
// - Type-safe enums instead of strings
// - Clear validation errors
// - Optional config file

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GibramError, Result};
use crate::hnsw::HnswConfig;
use crate::wal::{WalSyncPolicy, DEFAULT_SEGMENT_SIZE};

// ============================================================================
// Main configuration structure
// ============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct GibramConfig {
    pub server: ServerConfig,
    pub wal: WalConfig,
    pub snapshot: SnapshotConfig,
    pub hnsw: HnswSettings,
    pub leiden: LeidenSettings,
    pub session_defaults: SessionDefaults,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address consumed by the transport layer.
    pub addr: String,
    pub data_dir: PathBuf,
    /// Embedding dimension, fixed for the lifetime of every session.
    pub vector_dim: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ":6161".to_string(),
            data_dir: PathBuf::from("./data"),
            vector_dim: 1536,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    #[default]
    Every,
    Periodic,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalConfig {
    pub sync: WalSyncMode,
    /// Only meaningful with `sync = periodic`.
    pub sync_interval_ms: u64,
    pub segment_size_bytes: u64,
    /// Advisory retention horizon for truncated segments; enforcement
    /// belongs to the operator tooling.
    pub retention_days: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync: WalSyncMode::Every,
            sync_interval_ms: 200,
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            retention_days: 7,
        }
    }
}

impl WalConfig {
    pub fn sync_policy(&self) -> WalSyncPolicy {
        match self.sync {
            WalSyncMode::Every => WalSyncPolicy::EveryWrite,
            WalSyncMode::Periodic => {
                WalSyncPolicy::Periodic(Duration::from_millis(self.sync_interval_ms.max(1)))
            }
            WalSyncMode::Never => WalSyncPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Newest snapshots kept on disk after each commit.
    pub max_keep: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { max_keep: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HnswSettings {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search_default: usize,
}

impl Default for HnswSettings {
    fn default() -> Self {
        let d = HnswConfig::default();
        Self {
            m: d.m,
            ef_construction: d.ef_construction,
            ef_search_default: d.ef_search,
        }
    }
}

impl HnswSettings {
    pub fn to_index_config(&self) -> HnswConfig {
        HnswConfig {
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search_default,
            ..HnswConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeidenSettings {
    pub default_resolution: f64,
    pub default_max_iter: usize,
    pub seed: u64,
}

impl Default for LeidenSettings {
    fn default() -> Self {
        Self {
            default_resolution: 1.0,
            default_max_iter: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionDefaults {
    /// Absolute TTL in seconds; 0 = no expiry.
    pub ttl_secs: u64,
    /// Idle TTL in seconds; 0 = no idle expiry.
    pub idle_ttl_secs: u64,
    pub max_entities: u64,
    pub max_relationships: u64,
    pub max_documents: u64,
    pub max_memory_bytes: u64,
    /// Cap on live sessions; 0 = unlimited.
    pub max_sessions: usize,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            ttl_secs: 0,
            idle_ttl_secs: 0,
            max_entities: 0,
            max_relationships: 0,
            max_documents: 0,
            max_memory_bytes: 0,
            max_sessions: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// debug, info, warn, error
    pub level: String,
    /// json or text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl GibramConfig {
    /// Load from a YAML file, falling back to defaults for absent keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: GibramConfig = serde_yaml::from_str(&raw)
            .map_err(|e| GibramError::InvalidInput(format!("parse config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.vector_dim == 0 {
            return Err(GibramError::InvalidInput("vector_dim must be > 0".into()));
        }
        if self.hnsw.m < 2 {
            return Err(GibramError::InvalidInput("hnsw.m must be >= 2".into()));
        }
        if self.hnsw.ef_construction == 0 || self.hnsw.ef_search_default == 0 {
            return Err(GibramError::InvalidInput(
                "hnsw ef parameters must be > 0".into(),
            ));
        }
        if self.leiden.default_resolution <= 0.0 {
            return Err(GibramError::InvalidInput(
                "leiden.default_resolution must be positive".into(),
            ));
        }
        if self.wal.sync == WalSyncMode::Periodic && self.wal.sync_interval_ms == 0 {
            return Err(GibramError::InvalidInput(
                "wal.sync_interval_ms must be > 0 for periodic sync".into(),
            ));
        }
        sanitize_data_dir(&self.server.data_dir)?;
        Ok(())
    }
}

/// Reject traversal components and bare system paths for the data dir.
pub fn sanitize_data_dir(dir: &Path) -> Result<PathBuf> {
    let text = dir.to_string_lossy();
    if text.contains("..") {
        return Err(GibramError::InvalidInput(format!(
            "data_dir contains path traversal: {text}"
        )));
    }
    const FORBIDDEN: &[&str] = &["/", "/etc", "/usr", "/bin", "/sbin", "/var", "/root"];
    if FORBIDDEN.iter().any(|p| text.as_ref() == *p) {
        return Err(GibramError::InvalidInput(format!(
            "data_dir cannot be a system path: {text}"
        )));
    }
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GibramConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.vector_dim, 1536);
        assert_eq!(config.hnsw.m, 16);
        assert_eq!(config.snapshot.max_keep, 3);
    }

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let yaml = r#"
server:
  vector_dim: 4
  data_dir: ./test-data
wal:
  sync: periodic
  sync_interval_ms: 50
"#;
        let config: GibramConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.vector_dim, 4);
        assert!(matches!(
            config.wal.sync_policy(),
            WalSyncPolicy::Periodic(d) if d == Duration::from_millis(50)
        ));
        // Untouched sections keep their defaults.
        assert_eq!(config.hnsw.ef_construction, 200);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = GibramConfig::default();
        config.server.vector_dim = 0;
        assert!(config.validate().is_err());

        let mut config = GibramConfig::default();
        config.leiden.default_resolution = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn data_dir_sanitization() {
        assert!(sanitize_data_dir(Path::new("./data")).is_ok());
        assert!(sanitize_data_dir(Path::new("../escape")).is_err());
        assert!(sanitize_data_dir(Path::new("/etc")).is_err());
        assert!(sanitize_data_dir(Path::new("/var/lib/gibram")).is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "server:\n  nonsense: true\n";
        assert!(serde_yaml::from_str::<GibramConfig>(yaml).is_err());
    }
}
