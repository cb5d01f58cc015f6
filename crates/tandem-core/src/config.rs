//! Configuration system for Tandem nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TANDEM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tandem/config.toml
//!   3. ~/.config/tandem/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::membership::ClientNode;
use crate::wire::{HEADER_LEN, MAX_FRAGMENT_PAYLOAD, READ_BUFFER_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub network: NetworkConfig,
    pub scheduler: SchedulerConfig,
    pub coalesce: CoalesceConfig,
    pub liveness: LivenessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host this node listens on and advertises to peers.
    pub host: String,
    /// TCP listen port. 0 = OS-assigned.
    pub port: u16,
    /// Main server of the overlay. Equal to host/port on the main server itself.
    pub main_host: String,
    pub main_port: u16,
    pub connect_timeout_ms: u64,
    /// Largest payload per fragment. Larger payloads are chunked.
    pub max_payload: usize,
    /// Port of the JSON status endpoint. 0 = disabled.
    pub status_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Budgets reset at every epoch boundary.
    pub epoch_ms: u64,
    /// Low-band levels rotate at every rotation boundary.
    pub rotation_ms: u64,
    pub highest_budget: u32,
    pub high_budget: u32,
    /// Shared by all low-band levels.
    pub low_budget: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Flush a destination queue once its records reach this many bytes.
    pub threshold_bytes: usize,
    /// Flush a queue whose oldest record is at least this old.
    pub max_latency_ms: u64,
    /// How often the flush task checks for stale queues.
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// ALIVE interval from a client to its cluster server.
    pub client_alive_interval_ms: u64,
    /// ALIVE interval from a cluster server to the main server.
    pub server_alive_interval_ms: u64,
    /// Silence after which a cluster server evicts one of its members.
    pub cluster_timeout_ms: u64,
    /// Silence after which the main server evicts a node it monitors.
    pub main_timeout_ms: u64,
    /// Incomplete reassembly buffers older than this are discarded.
    pub reassembly_ttl_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            main_host: "127.0.0.1".to_string(),
            main_port: 8000,
            connect_timeout_ms: 2_000,
            max_payload: MAX_FRAGMENT_PAYLOAD,
            status_port: 7878,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            epoch_ms: 100,
            rotation_ms: 1_000,
            highest_budget: 50,
            high_budget: 30,
            low_budget: 20,
        }
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 2_048,
            max_latency_ms: 10,
            check_interval_ms: 5,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            client_alive_interval_ms: 2_000,
            server_alive_interval_ms: 10_000,
            cluster_timeout_ms: 6_000,
            main_timeout_ms: 30_000,
            reassembly_ttl_ms: 30_000,
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────────────────

impl NetworkConfig {
    pub fn local_node(&self) -> ClientNode {
        ClientNode::new(self.host.clone(), self.port)
    }

    pub fn main_node(&self) -> ClientNode {
        ClientNode::new(self.main_host.clone(), self.main_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SchedulerConfig {
    pub fn epoch(&self) -> Duration {
        Duration::from_millis(self.epoch_ms)
    }

    pub fn rotation(&self) -> Duration {
        Duration::from_millis(self.rotation_ms)
    }
}

impl CoalesceConfig {
    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl LivenessConfig {
    pub fn client_alive_interval(&self) -> Duration {
        Duration::from_millis(self.client_alive_interval_ms)
    }

    pub fn server_alive_interval(&self) -> Duration {
        Duration::from_millis(self.server_alive_interval_ms)
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_timeout_ms)
    }

    pub fn main_timeout(&self) -> Duration {
        Duration::from_millis(self.main_timeout_ms)
    }

    pub fn reassembly_ttl(&self) -> Duration {
        Duration::from_millis(self.reassembly_ttl_ms)
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("tandem")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl TandemConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TandemConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TANDEM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TandemConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the protocol cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.network;
        if n.max_payload == 0 || n.max_payload + HEADER_LEN > READ_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "network.max_payload must be between 1 and {MAX_FRAGMENT_PAYLOAD}"
            )));
        }
        let s = &self.scheduler;
        if s.epoch_ms == 0 || s.rotation_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler intervals must be non-zero".into(),
            ));
        }
        if s.highest_budget == 0 || s.high_budget == 0 || s.low_budget == 0 {
            return Err(ConfigError::Invalid(
                "scheduler budgets must be non-zero".into(),
            ));
        }
        if self.coalesce.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "coalesce.check_interval_ms must be non-zero".into(),
            ));
        }
        let l = &self.liveness;
        if l.client_alive_interval_ms == 0
            || l.server_alive_interval_ms == 0
            || l.cluster_timeout_ms == 0
            || l.main_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "liveness intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply TANDEM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TANDEM_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Ok(v) = std::env::var("TANDEM_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("TANDEM_NETWORK__MAIN_HOST") {
            self.network.main_host = v;
        }
        if let Ok(v) = std::env::var("TANDEM_NETWORK__MAIN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.main_port = p;
            }
        }
        if let Ok(v) = std::env::var("TANDEM_NETWORK__STATUS_PORT") {
            if let Ok(p) = v.parse() {
                self.network.status_port = p;
            }
        }
    }
}
