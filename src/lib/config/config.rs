use std::{path::Path, time::Duration};

use tracing::info;

use super::types::{
    AppConfig, CONFIG_PATH_ENV, ConfigError, ConfigResult, DEFAULT_CONFIG_PATH, LISTEN_ENV,
    REDIS_URL_ENV,
};
use crate::lib::{
    broker::types::EnqueueOptions,
    engine::types::EngineConfig,
    service::types::ServiceConfig,
    task::types::TimingConfig,
    worker::types::{QueueWeights, WorkerConfig},
};

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl AppConfig {
    /// Reads the file named by `SANDBOXD_CONFIG` (or `sandboxd.toml`) and
    /// applies env overrides. A missing file yields the defaults.
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!("loading config from {}", path.display());
                Self::parse(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(REDIS_URL_ENV) {
            self.broker.url = url;
        }
        if let Some(listen) = lookup(LISTEN_ENV) {
            self.server.listen = listen;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be at least 1".to_string()));
        }
        if self.channel.capacity == 0 {
            return Err(ConfigError::Invalid("channel.capacity must be at least 1".to_string()));
        }
        if !self.worker.queues.values().any(|w| *w > 0) {
            return Err(ConfigError::Invalid("worker.queues needs a queue with weight > 0".to_string()));
        }
        for queue in [&self.broker.create_queue, &self.broker.exec_queue] {
            if self.worker.queues.get(queue).copied().unwrap_or(0) == 0 {
                return Err(ConfigError::Invalid(format!("queue {} is never polled by workers", queue)));
            }
        }
        let t = &self.timing;
        if t.heartbeat_interval_ms == 0 || t.running_interval_ms == 0 || t.acquire_interval_ms == 0 {
            return Err(ConfigError::Invalid("timing intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sudo_password: self.engine.sudo_password.clone(),
            stop_timeout: millis(self.engine.stop_timeout_ms),
            exec_poll_interval: millis(self.engine.exec_poll_interval_ms),
            default_script_timeout: millis(self.engine.default_script_timeout_ms),
        }
    }

    pub fn timing_config(&self) -> TimingConfig {
        TimingConfig {
            heartbeat_interval: millis(self.timing.heartbeat_interval_ms),
            heartbeat_deadline: millis(self.timing.heartbeat_deadline_ms),
            running_burst: millis(self.timing.running_burst_ms),
            running_interval: millis(self.timing.running_interval_ms),
            verdict_timeout: millis(self.timing.verdict_timeout_ms),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            access_port: self.server.access_port,
            acquire_window: millis(self.timing.acquire_window_ms),
            acquire_interval: millis(self.timing.acquire_interval_ms),
            fallback_hold: millis(self.timing.fallback_hold_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker.concurrency,
            queues: QueueWeights(
                self.worker
                    .queues
                    .iter()
                    .map(|(name, weight)| (name.clone(), *weight))
                    .collect(),
            ),
            dequeue_wait: millis(self.worker.dequeue_wait_ms),
        }
    }

    pub fn create_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            queue: self.broker.create_queue.clone(),
            max_retry: self.broker.max_retry,
        }
    }

    pub fn exec_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            queue: self.broker.exec_queue.clone(),
            max_retry: self.broker.max_retry,
        }
    }
}
