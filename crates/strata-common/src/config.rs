//! Configuration types for the object manager
//!
//! All sections have defaults so a partial TOML file is enough.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OmConfig {
    /// Node configuration
    pub node: NodeConfig,
    /// Persistent store configuration
    pub store: StoreConfig,
    /// Flush pipeline configuration
    pub double_buffer: DoubleBufferConfig,
    /// Access control configuration
    pub security: SecurityConfig,
    /// Metrics export configuration
    pub metrics: MetricsConfig,
    /// Audit configuration
    pub audit: AuditConfig,
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier, used as a metrics tag)
    pub name: String,
    /// Data directory for metadata and state
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "strata-om".to_string(),
            data_dir: PathBuf::from("/var/lib/strata"),
        }
    }
}

/// Persistent store configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; defaults to `<data_dir>/om.redb`
    pub db_path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path against the node data directory
    #[must_use]
    pub fn resolve_db_path(&self, node: &NodeConfig) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| node.data_dir.join("om.redb"))
    }
}

/// Double buffer (flush pipeline) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubleBufferConfig {
    /// Maximum time an applied transaction waits before being flushed
    pub flush_interval_ms: u64,
    /// Wake the drain thread once the active batch reaches this size
    pub max_batch_size: usize,
}

impl Default for DoubleBufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 10,
            max_batch_size: 1000,
        }
    }
}

impl DoubleBufferConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Access control configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Evaluate ACLs before every mutation
    pub acl_enabled: bool,
}

/// Metrics export configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the HTTP endpoint serving `/metrics`
    pub listen: SocketAddr,
    /// Tag names (case-insensitive) left out of exported series
    pub excluded_tags: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9874)),
            excluded_tags: vec!["numopenconnectionsperuser".to_string()],
        }
    }
}

/// Audit configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Emit audit records
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
