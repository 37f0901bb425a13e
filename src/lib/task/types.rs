use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lib::{
    broker::types::BrokerError,
    channel::types::ChannelError,
    engine::types::EngineError,
    model::types::{ContainerInstance, ContainerScript, ContainerTemplate},
    repository::types::RepositoryError,
};

pub const TYPE_CONTAINER_CREATE: &str = "container:create";
pub const TYPE_CONTAINER_EXEC: &str = "container:exec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerCreatePayload {
    #[serde(rename = "Template")]
    pub template: ContainerTemplate,
    #[serde(rename = "UserID")]
    pub user_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerExecPayload {
    #[serde(rename = "Instance")]
    pub instance: ContainerInstance,
    #[serde(rename = "Scripts")]
    pub scripts: Vec<ContainerScript>,
    #[serde(rename = "UserID")]
    pub user_id: u64,
    #[serde(rename = "TemplateID")]
    pub template_id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("an operation is already pending for {0}")]
    AlreadyPending(String),

    #[error("broker submission failed: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{stage} stage failed: {source}")]
    Engine {
        stage: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("persisting instance for container {container_id} failed: {source}")]
    Persistence {
        container_id: String,
        #[source]
        source: RepositoryError,
    },

    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("unknown task kind {0}")]
    UnknownKind(String),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Tick and deadline settings for the status emitters.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_deadline: Duration,
    pub running_burst: Duration,
    pub running_interval: Duration,
    /// Longest a worker waits for room to publish one exec verdict.
    pub verdict_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_deadline: Duration::from_secs(60),
            running_burst: Duration::from_secs(3),
            running_interval: Duration::from_millis(500),
            verdict_timeout: Duration::from_secs(10),
        }
    }
}
