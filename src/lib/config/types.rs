use std::{collections::BTreeMap, path::PathBuf};

use serde::Deserialize;

use crate::lib::model::types::{ContainerScript, ContainerTemplate};

pub const CONFIG_PATH_ENV: &str = "SANDBOXD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "sandboxd.toml";
pub const REDIS_URL_ENV: &str = "REDIS_URL";
pub const LISTEN_ENV: &str = "SANDBOXD_LISTEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerSection,
    pub engine: EngineSection,
    pub timing: TimingSection,
    pub channel: ChannelSection,
    pub log: LogConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub access_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0:8080".to_string(),
            access_port: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub url: String,
    pub prefix: String,
    pub max_retry: u32,
    pub create_queue: String,
    pub exec_queue: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            backend: BrokerBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "sandboxd".to_string(),
            max_retry: 1,
            create_queue: "default".to_string(),
            exec_queue: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub concurrency: usize,
    pub queues: BTreeMap<String, u32>,
    pub dequeue_wait_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        WorkerSection {
            concurrency: 10,
            queues: BTreeMap::from([
                ("critical".to_string(), 6),
                ("default".to_string(), 3),
                ("low".to_string(), 1),
            ]),
            dequeue_wait_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub sudo_password: String,
    pub stop_timeout_ms: u64,
    pub exec_poll_interval_ms: u64,
    pub default_script_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        EngineSection {
            sudo_password: "123456".to_string(),
            stop_timeout_ms: 10_000,
            exec_poll_interval_ms: 500,
            default_script_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_deadline_ms: u64,
    pub running_burst_ms: u64,
    pub running_interval_ms: u64,
    pub verdict_timeout_ms: u64,
    pub acquire_window_ms: u64,
    pub acquire_interval_ms: u64,
    pub fallback_hold_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        TimingSection {
            heartbeat_interval_ms: 500,
            heartbeat_deadline_ms: 60_000,
            running_burst_ms: 3000,
            running_interval_ms: 500,
            verdict_timeout_ms: 10_000,
            acquire_window_ms: 3000,
            acquire_interval_ms: 500,
            fallback_hold_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub capacity: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        ChannelSection { capacity: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

/// Seed rows for the in-memory catalog.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub templates: Vec<ContainerTemplate>,
    pub scripts: Vec<ContainerScript>,
}
