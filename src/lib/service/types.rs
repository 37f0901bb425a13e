use std::{sync::Arc, time::Duration};

use crate::lib::{
    broker::types::BrokerError,
    channel::{
        registry::ChannelRegistry,
        types::{ChannelError, Subscription},
    },
    model::types::ContainerInstance,
    repository::types::{
        InstanceRepository, RepositoryError, ScriptRepository, TemplateRepository,
    },
    task::{producer::TaskProducer, types::TaskError},
};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Port of the in-sandbox UI, used in access URLs.
    pub access_port: u16,
    pub acquire_window: Duration,
    pub acquire_interval: Duration,
    pub fallback_hold: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            access_port: 3000,
            acquire_window: Duration::from_secs(3),
            acquire_interval: Duration::from_millis(500),
            fallback_hold: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("an operation is already pending for {0}")]
    AlreadyPending(String),

    #[error("broker unavailable: {0}")]
    Broker(#[source] BrokerError),

    #[error("timeout to get channel")]
    AcquireTimeout,

    #[error("no live channel {0}")]
    NoChannel(String),

    #[error("channel {0} is already being followed")]
    ReaderAttached(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RepositoryError> for ServiceError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound { .. } => ServiceError::NotFound(e.to_string()),
            RepositoryError::Storage(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<TaskError> for ServiceError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::AlreadyPending(key) => ServiceError::AlreadyPending(key),
            TaskError::Broker(e) => ServiceError::Broker(e),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<ChannelError> for ServiceError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::NotFound(key) => ServiceError::NoChannel(key),
            ChannelError::ReaderAttached(key) => ServiceError::ReaderAttached(key),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// What a client following a creation gets: the live channel, or the
/// already-persisted instance when the channel is gone.
pub enum CreationStatus {
    Live(Subscription),
    Settled(ContainerInstance),
}

pub struct ContainerService {
    pub(crate) producer: Arc<TaskProducer>,
    pub(crate) channels: Arc<ChannelRegistry>,
    pub(crate) templates: Arc<dyn TemplateRepository>,
    pub(crate) scripts: Arc<dyn ScriptRepository>,
    pub(crate) instances: Arc<dyn InstanceRepository>,
    pub(crate) config: ServiceConfig,
}
