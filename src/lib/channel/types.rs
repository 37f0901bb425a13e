use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Create,
    Exec,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Create => "create",
            ChannelKind::Exec => "exec",
        }
    }
}

/// `{user_id}:{template_id}:{create|exec}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(user_id: u64, template_id: u64, kind: ChannelKind) -> Self {
        ChannelKey(format!("{}:{}:{}", user_id, template_id, kind.as_str()))
    }

    pub fn create(user_id: u64, template_id: u64) -> Self {
        Self::new(user_id, template_id, ChannelKind::Create)
    }

    pub fn exec(user_id: u64, template_id: u64) -> Self {
        Self::new(user_id, template_id, ChannelKind::Exec)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Running,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: Status,
}

impl StatusMessage {
    pub fn new(status: Status) -> Self {
        StatusMessage { status }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} already exists")]
    AlreadyExists(String),

    #[error("channel {0} not found")]
    NotFound(String),

    #[error("channel {0} was closed")]
    Closed(String),

    #[error("channel {0} already has a reader")]
    ReaderAttached(String),
}

/// A live channel together with the heartbeat that feeds it. Both halves
/// are stored and dropped together.
pub(crate) struct PendingOperation {
    pub generation: Uuid,
    pub sender: mpsc::Sender<String>,
    pub receiver: Arc<Mutex<mpsc::Receiver<String>>>,
    pub closed: CancellationToken,
    pub heartbeat: CancellationToken,
    pub claimed: bool,
}

/// Non-owning reference to one generation of a pending operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub key: ChannelKey,
    pub generation: Uuid,
    pub heartbeat: CancellationToken,
}

/// Exclusive read side of a channel, held until dropped. `recv` returns
/// `None` once the channel is removed and its buffer drained.
#[derive(Debug)]
pub struct Subscription {
    pub key: ChannelKey,
    pub(crate) receiver: OwnedMutexGuard<mpsc::Receiver<String>>,
}

pub type ChannelResult<T> = Result<T, ChannelError>;
