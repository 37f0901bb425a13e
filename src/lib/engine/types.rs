use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;

use crate::lib::model::types::{ContainerInstance, ContainerScript, ContainerTemplate, InstanceStatus};

pub const SUDO_PASSWORD_ENV: &str = "SUDO_PASSWORD";
pub const CONNECTION_TOKEN_ENV: &str = "CONNECTION_TOKEN";

/// Drives a container runtime on behalf of the task processor.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates (but does not start) a container; the instance comes back
    /// `Pending` with a fresh name and access token.
    async fn create_container(&self, template: &ContainerTemplate) -> EngineResult<ContainerInstance>;

    async fn start_container(&self, instance: &mut ContainerInstance) -> EngineResult<()>;

    async fn stop_container(&self, instance: &mut ContainerInstance) -> EngineResult<()>;

    async fn remove_container(&self, instance: &mut ContainerInstance) -> EngineResult<()>;

    async fn exists(&self, name: &str) -> EngineResult<bool>;

    /// Runs `script` inside the instance. A non-zero exit is an outcome,
    /// a timeout is an error.
    async fn exec_command(
        &self,
        instance: &ContainerInstance,
        script: &ContainerScript,
    ) -> EngineResult<ExecOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Passed,
    Failed { exit_code: i64 },
}

impl ExecOutcome {
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 {
            ExecOutcome::Passed
        } else {
            ExecOutcome::Failed { exit_code }
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, ExecOutcome::Passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecProgress {
    Running,
    Exited(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("invalid {field} entry {entry:?}: {reason}")]
    InvalidSpec {
        field: &'static str,
        entry: String,
        reason: String,
    },

    #[error("container {name} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        name: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("execution timeout after {0:?}")]
    ExecTimeout(Duration),

    #[error("instance {0} has no container id")]
    MissingContainer(String),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::ExecTimeout(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sudo_password: String,
    pub stop_timeout: Duration,
    pub exec_poll_interval: Duration,
    pub default_script_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sudo_password: "123456".to_string(),
            stop_timeout: Duration::from_secs(10),
            exec_poll_interval: Duration::from_millis(500),
            default_script_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: String,
    pub container_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<BindMount>,
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    pub client: Docker,
    pub config: EngineConfig,
}
