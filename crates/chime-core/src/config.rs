use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_REPLAY_LIMIT: usize = 1_000;
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 30_000;

/// Top-level config (chime.toml + CHIME_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub callback: CallbackConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable identifier for this node within the cluster namespace.
    #[serde(default = "default_node_id")]
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Where fired jobs are delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Endpoint receiving `POST { "callbackId": "<job id>" }`.
    pub endpoint: String,
    #[serde(default = "default_callback_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Bump together with any change to `shard_count` — the version feeds the
    /// shard hash, making a resize a coordinated, explicit operation.
    #[serde(default = "default_space_version")]
    pub space_version: u32,
    #[serde(default = "default_shard_count")]
    pub shard_count: u16,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            space_version: default_space_version(),
            shard_count: default_shard_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum candidates requested per claim batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Poll cadence for watch-incapable stores.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on jobs a cold watch subscription may replay.
    #[serde(default = "default_replay_limit")]
    pub replay_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            replay_limit: default_replay_limit(),
        }
    }
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.db", home)
}
fn default_callback_timeout_ms() -> u64 {
    DEFAULT_CALLBACK_TIMEOUT_MS
}
fn default_space_version() -> u32 {
    1
}
fn default_shard_count() -> u16 {
    16
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_replay_limit() -> usize {
    DEFAULT_REPLAY_LIMIT
}

impl ChimeConfig {
    /// Load config from a TOML file with CHIME_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chime/chime.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChimeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHIME_").split("_"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.toml", home)
}
